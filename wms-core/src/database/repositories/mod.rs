//! Stores of the workload-management core.
//!
//! Each store is a stateless set of operations on a caller-supplied
//! connection; transactions are owned by the lifecycle layer.

pub mod job_store;
pub(crate) mod query;
pub mod status_ledger;
pub mod task_queue;

pub use job_store::JobStore;
pub use status_ledger::StatusLedger;
pub use task_queue::TaskQueueStore;
