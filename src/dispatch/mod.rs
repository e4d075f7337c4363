//! Bounded dispatch of delivered messages to listener handlers.
//!
//! Receipt (broker push callbacks and pull loops) is decoupled from
//! processing by one worker pool per listener, so a slow handler never
//! stalls delivery beyond the pool's queue capacity.

mod dispatcher;
mod pool;

pub use dispatcher::DispatchStats;
pub use pool::DrainMode;

pub(crate) use dispatcher::{Dispatcher, SinkPtr};
