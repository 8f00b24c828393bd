//! wms-core library crate.
//!
//! Workload-management core: the job store, the status ledger, the
//! fair-share task queue store and the lifecycle orchestrator that ties them
//! together.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod logging;

pub use config::WmsConfig;
pub use error::{Error, Result};
pub use lifecycle::{BulkResult, JobLifecycle};
