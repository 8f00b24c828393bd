//! Aggregate status decision for a batch of proposed updates.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::Result;
use crate::database::models::ledger::JobStatusUpdate;
use crate::domain::status::JobStatus;

/// New values for the job row; `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDecision {
    pub status: Option<JobStatus>,
    pub minor_status: Option<String>,
    pub application_status: Option<String>,
}

impl StatusDecision {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.minor_status.is_none() && self.application_status.is_none()
    }
}

/// Decides the new aggregate status of one job.
///
/// `updates` are in chronological order. `last_time` is the most recent major
/// transition already recorded for the job. Implementations may reject the
/// whole batch with [`crate::Error::IllegitimateTransition`]; the orchestrator
/// treats that as "no change".
pub trait StatusDecider: Send + Sync {
    fn decide(
        &self,
        job_id: i64,
        updates: &[(DateTime<Utc>, JobStatusUpdate)],
        last_time: DateTime<Utc>,
        current_status: JobStatus,
        force: bool,
    ) -> Result<StatusDecision>;
}

/// Walks the updates through the transition table of [`JobStatus`].
///
/// Updates older than `last_time` are ignored. Without `force`, an update
/// proposing an illegal transition is skipped as a whole and the walk carries
/// on from the unchanged status.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMachineDecider;

impl StatusDecider for StateMachineDecider {
    fn decide(
        &self,
        job_id: i64,
        updates: &[(DateTime<Utc>, JobStatusUpdate)],
        last_time: DateTime<Utc>,
        current_status: JobStatus,
        force: bool,
    ) -> Result<StatusDecision> {
        let mut current = current_status;
        let mut decision = StatusDecision::default();

        for (time, update) in updates.iter().filter(|(time, _)| *time >= last_time) {
            if let Some(next) = update.status {
                if !force && !current.can_transition_to(next) {
                    warn!(
                        job_id,
                        from = %current,
                        to = %next,
                        %time,
                        "Ignoring illegitimate status transition"
                    );
                    continue;
                }
                current = next;
                decision.status = Some(next);
            }
            if let Some(minor) = &update.minor_status {
                decision.minor_status = Some(minor.clone());
            }
            if let Some(application) = &update.application_status {
                decision.application_status = Some(application.clone());
            }
        }

        Ok(decision)
    }
}
