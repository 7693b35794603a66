//! Move a service between states

use depscan::manager::{Manager, ManagerError, ServiceState};

pub fn transition(
    manager: &Manager,
    service: &str,
    from: ServiceState,
    to: ServiceState,
) -> Result<(), ManagerError> {
    manager.transition(service, from, to)?;
    log::info!("{}: {} -> {}", service, from, to);
    Ok(())
}
