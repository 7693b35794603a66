//! Show service states

use depscan::manager::{Manager, ManagerError, ServiceState};

fn symbol(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Started => "●",
        ServiceState::Inactive => "○",
        ServiceState::Broken => "×",
        ServiceState::Starting | ServiceState::Stopping => "◐",
    }
}

pub fn status(manager: &Manager, service: Option<&str>) -> Result<(), ManagerError> {
    let store = manager.state_store()?;

    if let Some(name) = service {
        match store.state(name)? {
            Some(state) => println!("{} {} - {}", symbol(state), name, state),
            None => println!("{} - unknown", name),
        }
        return Ok(());
    }

    let entries = store.list()?;
    if entries.is_empty() {
        println!("No services registered");
        return Ok(());
    }

    let width = entries.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, state) in entries {
        println!("{} {:<width$}  {}", symbol(state), name, state, width = width);
    }

    Ok(())
}
