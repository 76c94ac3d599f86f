//! Alert delivery: at-most-once admission, rendering, channels and retries.

mod channel;
mod dispatcher;
mod render;

pub use channel::*;
pub use dispatcher::*;
pub use render::*;
