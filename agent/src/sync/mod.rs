//! Per-device sync workers and the registry that connects them to the
//! control API.

mod registry;
mod worker;

pub use registry::*;
pub use worker::*;
