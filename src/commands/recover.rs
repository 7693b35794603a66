//! Crash recovery

use depscan::manager::{Manager, ManagerError};

pub fn recover(manager: &Manager) -> Result<(), ManagerError> {
    let recovered = manager.recover()?;

    for entry in &recovered {
        let states: Vec<&str> = entry.found_in.iter().map(|s| s.as_str()).collect();
        println!("{}: {} -> broken", entry.service, states.join(", "));
    }
    if recovered.is_empty() {
        log::info!("Nothing to recover");
    }

    Ok(())
}
