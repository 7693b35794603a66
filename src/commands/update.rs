//! Refresh the svcdir skeleton and dependency cache

use depscan::manager::{Manager, ManagerError};

pub async fn update(manager: &Manager, force: bool) -> Result<(), ManagerError> {
    let report = manager.update(force).await?;

    if report.swept > 0 {
        log::info!("Removed {} stale temporary cache files", report.swept);
    }
    if report.rebuilt {
        println!(
            "Cached dependencies of {} services in {}",
            report.services,
            manager.cache_path().display()
        );
    } else {
        println!("Dependency cache is current ({} services)", report.services);
    }

    Ok(())
}
