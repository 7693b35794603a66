//! Print a start or stop order

use depscan::manager::{Direction, Manager, ManagerError};

pub async fn order(manager: &Manager, targets: &[String], stop: bool) -> Result<(), ManagerError> {
    let direction = if stop { Direction::Stop } else { Direction::Start };

    for name in manager.order(targets, direction).await? {
        println!("{}", name);
    }

    Ok(())
}
