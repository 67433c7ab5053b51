//! Worker runtime: claim, dispatch, heartbeat, recover

mod dispatch;
mod runtime;

pub use dispatch::Dispatcher;
pub use runtime::{Worker, WorkerConfig, WorkerError, WorkerState};
