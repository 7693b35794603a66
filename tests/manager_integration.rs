//! Integration tests for the Manager

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use depscan::cache::{self, Staleness};
use depscan::manager::{Direction, Manager, ManagerError, ResolveError, ServiceState};
use depscan::Settings;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("depscan-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(dir.join("init.d")).unwrap();
    fs::create_dir_all(dir.join("runlevels")).unwrap();
    dir
}

fn write_script(root: &Path, name: &str, depend: &str) -> PathBuf {
    let path = root.join("init.d").join(name);
    fs::write(
        &path,
        format!("#!/sbin/runscript\n\ndepend() {{\n\t{}\n}}\n\nstart() {{\n\t:\n}}\n", depend),
    )
    .unwrap();
    path
}

fn set_mtime(path: &Path, when: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

fn manager(root: &Path) -> Manager {
    Manager::new(Settings::rooted(root)).skip_root_check()
}

#[tokio::test]
async fn test_update_builds_skeleton_and_cache() {
    let dir = unique_test_dir();
    write_script(&dir, "net", "");
    write_script(&dir, "sshd", "need net");

    let manager = manager(&dir);
    let report = manager.update(false).await.unwrap();

    assert_eq!(report.staleness, Staleness::Missing);
    assert!(report.rebuilt);
    assert_eq!(report.services, 2);

    let svcdir = &manager.settings().svcdir;
    for sub in depscan::vardir::PERSISTENT_SUBDIRS
        .iter()
        .chain(depscan::vardir::VOLATILE_SUBDIRS)
    {
        assert!(svcdir.join(sub).is_dir(), "{sub}");
    }

    let snapshot = cache::load(&manager.cache_path()).unwrap().unwrap();
    assert_eq!(snapshot.graph.len(), 2);
    assert_eq!(snapshot.format_version, cache::FORMAT_VERSION);

    let store = manager.state_store().unwrap();
    assert_eq!(store.state("sshd").unwrap(), Some(ServiceState::Inactive));
    assert_eq!(store.state("net").unwrap(), Some(ServiceState::Inactive));
}

#[tokio::test]
async fn test_second_update_keeps_fresh_cache() {
    let dir = unique_test_dir();
    write_script(&dir, "net", "");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();
    let before = fs::read(manager.cache_path()).unwrap();

    let report = manager.update(false).await.unwrap();
    assert_eq!(report.staleness, Staleness::Fresh);
    assert!(!report.rebuilt);
    assert_eq!(fs::read(manager.cache_path()).unwrap(), before);

    let forced = manager.update(true).await.unwrap();
    assert!(forced.rebuilt);
}

#[tokio::test]
async fn test_modified_script_triggers_rebuild() {
    let dir = unique_test_dir();
    write_script(&dir, "net", "");
    let sshd = write_script(&dir, "sshd", "");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();

    // Older than the cache: still fresh
    set_mtime(&sshd, SystemTime::now() - Duration::from_secs(3600));
    assert!(!manager.update(false).await.unwrap().rebuilt);

    write_script(&dir, "sshd", "need net");
    set_mtime(&sshd, SystemTime::now() + Duration::from_secs(3600));
    let report = manager.update(false).await.unwrap();
    assert_eq!(
        report.staleness,
        Staleness::ModifiedSince {
            service: "sshd".to_string()
        }
    );
    assert!(report.rebuilt);

    let graph = cache::load(&manager.cache_path()).unwrap().unwrap().graph;
    assert_eq!(graph.dependencies("sshd", depscan::DependencyKind::Need), vec!["net"]);
}

#[tokio::test]
async fn test_order_services() {
    let dir = unique_test_dir();
    write_script(&dir, "localmount", "");
    write_script(&dir, "net", "need localmount");
    write_script(&dir, "sshd", "need net\n\tuse logger");
    write_script(&dir, "syslog", "provide logger\n\tneed localmount");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();

    let start = manager
        .order(&["sshd".to_string()], Direction::Start)
        .await
        .unwrap();
    assert_eq!(start, vec!["localmount", "net", "sshd"]);

    let both = manager
        .order(&["syslog".to_string(), "sshd".to_string()], Direction::Start)
        .await
        .unwrap();
    assert_eq!(both, vec!["localmount", "syslog", "net", "sshd"]);

    let stop = manager
        .order(&["syslog".to_string(), "sshd".to_string()], Direction::Stop)
        .await
        .unwrap();
    assert_eq!(stop, vec!["sshd", "net", "syslog", "localmount"]);
}

#[tokio::test]
async fn test_order_runlevel() {
    let dir = unique_test_dir();
    write_script(&dir, "localmount", "");
    write_script(&dir, "net", "need localmount");
    write_script(&dir, "sshd", "need net");
    write_script(&dir, "cron", "after net");

    let default = dir.join("runlevels").join("default");
    fs::create_dir(&default).unwrap();
    for member in ["sshd", "cron"] {
        std::os::unix::fs::symlink(dir.join("init.d").join(member), default.join(member)).unwrap();
    }

    let manager = manager(&dir);
    manager.update(false).await.unwrap();

    let order = manager
        .order(&["default".to_string()], Direction::Start)
        .await
        .unwrap();
    // Members are taken in name order; cron's after-hint pulls net ahead of it
    assert_eq!(order, vec!["localmount", "net", "cron", "sshd"]);

    let err = manager
        .order(&["nosuchlevel".to_string()], Direction::Start)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Resolve(ResolveError::UnknownService(_))
    ));
}

#[tokio::test]
async fn test_cycle_keeps_previous_cache() {
    let dir = unique_test_dir();
    let a = write_script(&dir, "a", "");
    let b = write_script(&dir, "b", "need a");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();
    let before = fs::read(manager.cache_path()).unwrap();

    write_script(&dir, "a", "need b");
    let later = SystemTime::now() + Duration::from_secs(3600);
    set_mtime(&a, later);
    set_mtime(&b, later);

    let err = manager.update(false).await.unwrap_err();
    match err {
        ManagerError::Resolve(ResolveError::Cycle(cycle)) => {
            let members = cycle.members();
            assert!(members.contains("a"));
            assert!(members.contains("b"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(fs::read(manager.cache_path()).unwrap(), before);
}

#[tokio::test]
async fn test_missing_need_fails_update() {
    let dir = unique_test_dir();
    write_script(&dir, "sshd", "need net");

    let err = manager(&dir).update(false).await.unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Resolve(ResolveError::MissingDependency { .. })
    ));
}

#[tokio::test]
async fn test_bad_script_is_fatal() {
    let dir = unique_test_dir();
    write_script(&dir, "sshd", "requires net");

    let err = manager(&dir).update(false).await.unwrap_err();
    assert!(matches!(err, ManagerError::Catalog(_)));
    assert!(err.to_string().contains("sshd"));
}

#[tokio::test]
async fn test_corrupt_cache_is_rebuilt() {
    let dir = unique_test_dir();
    write_script(&dir, "net", "");
    write_script(&dir, "sshd", "need net");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();
    fs::write(manager.cache_path(), b"not a cache").unwrap();

    let order = manager
        .order(&["sshd".to_string()], Direction::Start)
        .await
        .unwrap();
    assert_eq!(order, vec!["net", "sshd"]);

    // Written back in the current format
    let snapshot = cache::load(&manager.cache_path()).unwrap().unwrap();
    assert_eq!(snapshot.graph.len(), 2);

    fs::write(manager.cache_path(), b"DEPSCAN").unwrap();
    let report = manager.update(false).await.unwrap();
    assert_eq!(report.staleness, Staleness::Missing);
    assert!(report.rebuilt);
}

#[tokio::test]
async fn test_order_without_cache() {
    let dir = unique_test_dir();
    write_script(&dir, "net", "");

    // No update yet: nothing on disk to reuse or write back to
    let order = manager(&dir)
        .order(&["net".to_string()], Direction::Start)
        .await
        .unwrap();
    assert_eq!(order, vec!["net"]);
    assert!(!dir.join("svcdir").exists());
}

#[tokio::test]
async fn test_update_sweeps_stale_temps() {
    let dir = unique_test_dir();
    write_script(&dir, "net", "");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();

    let leftover = manager.settings().svcdir.join("depcache.Ab12Cd");
    fs::write(&leftover, b"partial").unwrap();
    set_mtime(&leftover, SystemTime::now() - cache::STALE_TEMP_AGE * 2);

    let report = manager.update(false).await.unwrap();
    assert_eq!(report.swept, 1);
    assert!(!leftover.exists());
}

#[tokio::test]
async fn test_state_lifecycle_and_recovery() {
    let dir = unique_test_dir();
    write_script(&dir, "net", "");
    write_script(&dir, "sshd", "need net");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();

    manager
        .transition("net", ServiceState::Inactive, ServiceState::Starting)
        .unwrap();
    manager
        .transition("net", ServiceState::Starting, ServiceState::Started)
        .unwrap();
    manager
        .transition("sshd", ServiceState::Inactive, ServiceState::Starting)
        .unwrap();

    let err = manager
        .transition("net", ServiceState::Started, ServiceState::Inactive)
        .unwrap_err();
    assert!(matches!(
        err,
        ManagerError::State(depscan::manager::StateError::InvalidTransition { .. })
    ));

    // Crash while sshd was starting
    let recovered = manager.recover().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].service, "sshd");

    let store = manager.state_store().unwrap();
    assert_eq!(store.state("sshd").unwrap(), Some(ServiceState::Broken));
    assert_eq!(store.state("net").unwrap(), Some(ServiceState::Started));

    // broken is volatile: the next update forgets it and re-registers sshd
    manager.update(false).await.unwrap();
    assert_eq!(store.state("sshd").unwrap(), Some(ServiceState::Inactive));
    assert_eq!(store.state("net").unwrap(), Some(ServiceState::Started));
}

#[tokio::test]
async fn test_mutations_require_root() {
    if nix::unistd::geteuid().is_root() {
        return;
    }

    let dir = unique_test_dir();
    write_script(&dir, "net", "");
    let manager = Manager::new(Settings::rooted(&dir));

    assert!(matches!(
        manager.update(false).await,
        Err(ManagerError::Permission)
    ));
    assert!(matches!(manager.prune(), Err(ManagerError::Permission)));
    assert!(!dir.join("svcdir").exists());

    // Reading works without privileges
    let order = manager
        .order(&["net".to_string()], Direction::Start)
        .await
        .unwrap();
    assert_eq!(order, vec!["net"]);
}

#[tokio::test]
async fn test_failed_update_keeps_broken_services_registered() {
    let dir = unique_test_dir();
    let a = write_script(&dir, "a", "");
    let b = write_script(&dir, "b", "need a");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();
    manager
        .transition("a", ServiceState::Inactive, ServiceState::Starting)
        .unwrap();
    manager.recover().unwrap();

    let store = manager.state_store().unwrap();
    assert_eq!(store.state("a").unwrap(), Some(ServiceState::Broken));

    write_script(&dir, "a", "need b");
    let later = SystemTime::now() + Duration::from_secs(3600);
    set_mtime(&a, later);
    set_mtime(&b, later);

    let err = manager.update(false).await.unwrap_err();
    assert!(matches!(err, ManagerError::Resolve(ResolveError::Cycle(_))));

    assert_eq!(store.state("a").unwrap(), Some(ServiceState::Inactive));
    assert_eq!(store.state("b").unwrap(), Some(ServiceState::Inactive));
}

#[tokio::test]
async fn test_prune_resets_broken_services() {
    let dir = unique_test_dir();
    write_script(&dir, "net", "");

    let manager = manager(&dir);
    manager.update(false).await.unwrap();
    manager
        .transition("net", ServiceState::Inactive, ServiceState::Broken)
        .unwrap();

    manager.prune().unwrap();

    let store = manager.state_store().unwrap();
    assert_eq!(store.state("net").unwrap(), Some(ServiceState::Inactive));
    assert!(store.in_state(ServiceState::Broken).unwrap().is_empty());
}
