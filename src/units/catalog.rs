//! Service catalog
//!
//! Discovers init scripts in the init directory and turns each into a
//! [`ServiceDescriptor`].

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::parser::{parse_descriptor, ParseError};
use super::ServiceDescriptor;

/// File name suffixes that are never services (editor leftovers, helpers)
pub const IGNORED_SUFFIXES: &[&str] = &["~", ".sh", ".bak", ".swp", ".orig"];

/// Scans a directory of init scripts
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    init_dir: PathBuf,
}

impl ServiceCatalog {
    pub fn new(init_dir: impl Into<PathBuf>) -> Self {
        Self {
            init_dir: init_dir.into(),
        }
    }

    pub fn init_dir(&self) -> &Path {
        &self.init_dir
    }

    /// Load every service in the init directory, sorted by name
    pub async fn scan(&self) -> Result<Vec<ServiceDescriptor>, ParseError> {
        let mut entries = tokio::fs::read_dir(&self.init_dir)
            .await
            .map_err(|e| io_error(&self.init_dir, e))?;

        let mut descriptors = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.init_dir, e))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                log::debug!("Skipping non UTF-8 entry {:?}", entry.path());
                continue;
            };
            if !is_service_name(&name) {
                continue;
            }

            let path = entry.path();
            // Follows symlinks; dangling links and directories are not services
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            }

            descriptors.push(load_descriptor(&name, &path).await?);
        }

        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        log::debug!(
            "Found {} services in {}",
            descriptors.len(),
            self.init_dir.display()
        );
        Ok(descriptors)
    }

    /// Load a single service by name
    pub async fn load(&self, name: &str) -> Result<ServiceDescriptor, ParseError> {
        load_descriptor(name, &self.init_dir.join(name)).await
    }
}

/// Read one script and its modification time
pub async fn load_descriptor(name: &str, path: &Path) -> Result<ServiceDescriptor, ParseError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error(path, e))?;
    let mtime: DateTime<Utc> = meta.modified().map_err(|e| io_error(path, e))?.into();
    // Only depend() must be ASCII; comments elsewhere may be in any encoding
    let bytes = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
    let content = String::from_utf8_lossy(&bytes);

    parse_descriptor(name, path, mtime, &content)
}

fn is_service_name(name: &str) -> bool {
    !name.starts_with('.') && !IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn io_error(path: &Path, source: std::io::Error) -> ParseError {
    ParseError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{Dependency, DependencyKind};

    fn write_script(dir: &Path, name: &str, depend: &str) {
        let body = format!("#!/sbin/runscript\n\ndepend() {{\n{}\n}}\n", depend);
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_service_name_filter() {
        assert!(is_service_name("sshd"));
        assert!(is_service_name("net.eth0"));
        assert!(!is_service_name(".hidden"));
        assert!(!is_service_name("sshd~"));
        assert!(!is_service_name("functions.sh"));
        assert!(!is_service_name("sshd.swp"));
    }

    #[tokio::test]
    async fn test_scan_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "sshd", "need net");
        write_script(dir.path(), "net", "provide network");
        write_script(dir.path(), "sshd~", "need nothing");
        std::fs::write(dir.path().join("functions.sh"), "ebegin() { :; }\n").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let catalog = ServiceCatalog::new(dir.path());
        let services = catalog.scan().await.unwrap();

        let names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["net", "sshd"]);
        assert_eq!(
            services[1].dependencies,
            vec![Dependency::new(DependencyKind::Need, "net")]
        );
        assert_eq!(services[1].source_path, dir.path().join("sshd"));
    }

    #[tokio::test]
    async fn test_scan_reports_bad_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "broken", "requires net");

        let err = ServiceCatalog::new(dir.path()).scan().await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_scan_missing_dir() {
        let catalog = ServiceCatalog::new("/nonexistent/depscan/init.d");
        let result = tokio_test::block_on(catalog.scan());
        assert!(matches!(result, Err(ParseError::Io { .. })));
    }

    #[tokio::test]
    async fn test_load_non_utf8_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("net"),
            b"#!/sbin/runscript\n# Copyright Ren\xe9\ndepend() {\n\tneed localmount\n}\n",
        )
        .unwrap();

        let services = ServiceCatalog::new(dir.path()).scan().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(
            services[0].dependencies,
            vec![Dependency::new(DependencyKind::Need, "localmount")]
        );
    }

    #[tokio::test]
    async fn test_load_records_mtime() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "cron", "use logger");

        let file = std::fs::File::options()
            .write(true)
            .open(dir.path().join("cron"))
            .unwrap();
        let when = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        file.set_modified(when).unwrap();

        let svc = ServiceCatalog::new(dir.path()).load("cron").await.unwrap();
        assert_eq!(svc.source_mtime.timestamp(), 1_000_000);
    }
}
