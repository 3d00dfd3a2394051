//! Run bookkeeping and execution.
//!
//! - `types`: lanes, sources, run options and metadata
//! - `registry`: in-flight runs indexed by id/session, TTL sweeping
//! - `queue`: executes a task as a registered, cancellable run
//! - `disconnect`: grace period between client disconnect and cancellation

pub mod disconnect;
pub mod queue;
pub mod registry;
pub mod types;

pub use disconnect::DisconnectGuard;
pub use queue::ExecutionQueue;
pub use registry::{RunRegistry, spawn_sweep_task};
pub use types::{Lane, LaneStats, RunMetadata, RunOptions, RunSource};
