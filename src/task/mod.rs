//! Task catalogue, records and the task store

pub mod catalog;
pub mod record;
pub mod store;

pub use catalog::TaskCatalog;
pub use record::{HistoryEntry, TaskCounts, TaskRecord, TaskStatus, TaskStatusReport};
pub use store::{Assignment, SchedulingReport, TaskStore};
