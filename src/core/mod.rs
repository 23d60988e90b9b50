pub mod async_task;
pub mod context;
pub mod error;
pub mod flow;
pub mod fork;
pub(crate) mod scheduler;

/// The Alias for serde_json::Value since it is the currency of every step:
/// positional arguments, the shared data bag, fork items and join results.
pub type TaskValue = serde_json::Value;
