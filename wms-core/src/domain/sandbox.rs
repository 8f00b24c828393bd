//! Sandbox unassignment hook.

use async_trait::async_trait;
use tracing::info;

use crate::Result;

/// Releases the sandboxes of removed jobs. Failures are not propagated to the
/// removal itself.
#[async_trait]
pub trait SandboxUnassigner: Send + Sync {
    async fn unassign(&self, job_ids: &[i64]) -> Result<()>;
}

/// Unassigner for deployments without sandbox storage: only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSandboxUnassigner;

#[async_trait]
impl SandboxUnassigner for LoggingSandboxUnassigner {
    async fn unassign(&self, job_ids: &[i64]) -> Result<()> {
        info!(count = job_ids.len(), ?job_ids, "Unassigning job sandboxes");
        Ok(())
    }
}
