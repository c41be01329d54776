//! Worker-side runtime
//!
//! The coordinator never executes tasks itself. External workers follow the
//! contract implemented here: consume the capability work queue, report each
//! task with exactly one `task.completed` or `task.failed` event, and send
//! `agent.heartbeat` periodically. [`WorkerPool`] is that contract run
//! in-process, used by `coordinator run --local` and by tests.

pub mod executor;
pub mod pool;

pub use executor::{EchoExecutor, ExecutorRegistry, TaskExecutor};
pub use pool::WorkerPool;
