//! `depend()` block parser
//!
//! Extracts dependency declarations from an rc-scripts style init script:
//!
//! ```text
//! depend() {
//!     need net localmount
//!     use logger dns
//!     after bootmisc
//!     provide sshd-server
//! }
//! ```
//!
//! Everything outside `depend()` is ignored. Statements may also be
//! separated by `;` and the block may sit on a single line.

use std::path::Path;

use chrono::{DateTime, Utc};

use super::{Dependency, DependencyKind, ServiceDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: unknown dependency keyword '{keyword}'")]
    UnknownKeyword {
        path: String,
        line: usize,
        keyword: String,
    },

    #[error("{path}:{line}: unbalanced quoting")]
    Quoting { path: String, line: usize },

    #[error("{path}: depend() block is never closed")]
    Unterminated { path: String },
}

/// Parse the `depend()` block of `content`; `path` is only used for errors
pub fn parse_depend(path: &Path, content: &str) -> Result<Vec<Dependency>, ParseError> {
    let mut deps = Vec::new();
    let mut inside = false;
    let mut closed = false;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw).trim();

        let mut rest = line;
        if !inside {
            let Some(after_header) = depend_header(line) else {
                continue;
            };
            inside = true;
            rest = after_header;
        }
        let rest = rest.trim_start_matches('{');

        let (body, ends_here) = match rest.find('}') {
            Some(pos) => (&rest[..pos], true),
            None => (rest, false),
        };

        for statement in body.split(';') {
            parse_statement(path, line_no, statement, &mut deps)?;
        }

        if ends_here {
            closed = true;
            break;
        }
    }

    if inside && !closed {
        return Err(ParseError::Unterminated {
            path: path.display().to_string(),
        });
    }

    Ok(deps)
}

/// Build a descriptor for `name` from script contents
pub fn parse_descriptor(
    name: &str,
    path: &Path,
    mtime: DateTime<Utc>,
    content: &str,
) -> Result<ServiceDescriptor, ParseError> {
    Ok(ServiceDescriptor {
        name: name.to_string(),
        source_path: path.to_path_buf(),
        source_mtime: mtime,
        dependencies: parse_depend(path, content)?,
    })
}

/// Returns the remainder of the line after `depend()` if it opens the block
fn depend_header(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("depend")?.trim_start();
    let rest = rest.strip_prefix("()")?.trim_start();
    Some(rest)
}

/// Drop a `#` comment that starts a word
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace() || bytes[i - 1] == b';') {
            return &line[..i];
        }
    }
    line
}

fn parse_statement(
    path: &Path,
    line: usize,
    statement: &str,
    deps: &mut Vec<Dependency>,
) -> Result<(), ParseError> {
    let statement = statement.trim();
    if statement.is_empty() {
        return Ok(());
    }

    let words = shlex::split(statement).ok_or_else(|| ParseError::Quoting {
        path: path.display().to_string(),
        line,
    })?;

    let Some((keyword, targets)) = words.split_first() else {
        return Ok(());
    };

    let kind: DependencyKind = keyword.parse().map_err(|_| ParseError::UnknownKeyword {
        path: path.display().to_string(),
        line,
        keyword: keyword.clone(),
    })?;

    deps.extend(targets.iter().map(|t| Dependency::new(kind, t.as_str())));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Vec<Dependency>, ParseError> {
        parse_depend(Path::new("/etc/init.d/test"), content)
    }

    #[test]
    fn test_multiline_block() {
        let deps = parse(
            r#"#!/sbin/runscript
# Copyright header

depend() {
    need net localmount
    use logger
    after bootmisc
    provide sshd-server
}

start() {
    need_not_a_dependency here
}
"#,
        )
        .unwrap();

        assert_eq!(
            deps,
            vec![
                Dependency::new(DependencyKind::Need, "net"),
                Dependency::new(DependencyKind::Need, "localmount"),
                Dependency::new(DependencyKind::Use, "logger"),
                Dependency::new(DependencyKind::After, "bootmisc"),
                Dependency::new(DependencyKind::Provide, "sshd-server"),
            ]
        );
    }

    #[test]
    fn test_single_line_block() {
        let deps = parse("depend() { need net; use dns; }\n").unwrap();
        assert_eq!(
            deps,
            vec![
                Dependency::new(DependencyKind::Need, "net"),
                Dependency::new(DependencyKind::Use, "dns"),
            ]
        );
    }

    #[test]
    fn test_comments_and_spacing() {
        let deps = parse(
            "depend ()\n{\n    # need nothing\n    before net # trailing comment\n}\n",
        )
        .unwrap();
        assert_eq!(deps, vec![Dependency::new(DependencyKind::Before, "net")]);
    }

    #[test]
    fn test_no_depend_block() {
        assert!(parse("start() {\n  ebegin\n}\n").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_keyword() {
        let err = parse("depend() {\n  require net\n}\n").unwrap_err();
        match err {
            ParseError::UnknownKeyword { line, keyword, .. } => {
                assert_eq!(line, 2);
                assert_eq!(keyword, "require");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unterminated_block() {
        let err = parse("depend() {\n  need net\n").unwrap_err();
        assert!(matches!(err, ParseError::Unterminated { .. }));
    }

    #[test]
    fn test_bad_quoting() {
        let err = parse("depend() {\n  need \"net\n}\n").unwrap_err();
        assert!(matches!(err, ParseError::Quoting { line: 2, .. }));
    }
}
