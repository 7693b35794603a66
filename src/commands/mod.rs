mod order;
mod prune;
mod recover;
mod status;
mod transition;
mod update;

pub use order::order;
pub use prune::prune;
pub use recover::recover;
pub use status::status;
pub use transition::transition;
pub use update::update;
