//! Local persistence on SQLite: the event log, sync bookkeeping and alert
//! history.

mod events;
mod history;
mod pool;
mod rows;

pub use events::*;
pub use history::*;
pub use pool::*;
