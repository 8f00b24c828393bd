//! Hard removal of jobs from every store.

use std::collections::BTreeSet;
use tracing::{info, warn};

use super::{BulkResult, JobLifecycle};
use crate::database::begin_immediate;
use crate::database::repositories::{JobStore, StatusLedger, TaskQueueStore};
use crate::{Error, Result};

impl JobLifecycle {
    /// Erase jobs, their history and their task-queue membership, then
    /// release their sandboxes.
    ///
    /// This is the legacy cleanup path; [`JobLifecycle::delete_bulk`] is the
    /// auditable way to delete jobs.
    pub async fn remove_bulk(&self, job_ids: &[i64]) -> Result<BulkResult<()>> {
        let job_ids: Vec<i64> = job_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

        let mut tx = begin_immediate(&self.pools.write).await?;
        let result = async {
            let existing = JobStore::get_jobs(&mut tx, &job_ids).await?;
            let cleanup = TaskQueueStore::tq_infos_for_jobs(&mut tx, &job_ids).await?;
            TaskQueueStore::remove_jobs(&mut tx, &job_ids).await?;
            StatusLedger::delete(&mut tx, &job_ids).await?;
            JobStore::delete(&mut tx, &job_ids).await?;

            let mut result = BulkResult::default();
            for &job_id in &job_ids {
                if existing.contains_key(&job_id) {
                    result.success.insert(job_id, ());
                } else {
                    result.fail(job_id, Error::not_found("Job", job_id).detail());
                }
            }
            Ok::<_, Error>((result, cleanup))
        }
        .await;
        let (result, cleanup) = tx.finish(result).await?;

        let removed: Vec<i64> = result.success.keys().copied().collect();
        if !removed.is_empty() {
            if let Err(e) = self.sandbox.unassign(&removed).await {
                warn!(error = %e, count = removed.len(), "Failed to unassign sandboxes");
            }
            info!(count = removed.len(), "Jobs removed");
        }
        self.schedule_cleanup(cleanup).await;
        Ok(result)
    }
}
