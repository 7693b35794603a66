//! Remove volatile svcdir subdirectories

use depscan::manager::{Manager, ManagerError};

pub fn prune(manager: &Manager) -> Result<(), ManagerError> {
    manager.prune()?;
    log::info!("Pruned volatile directories in {}", manager.settings().svcdir.display());
    Ok(())
}
