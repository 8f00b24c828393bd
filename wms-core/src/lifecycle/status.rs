//! Status changes: `set_status_bulk`, `kill_bulk` and `delete_bulk`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::{BulkResult, JOB_MANAGER_SOURCE, JobLifecycle};
use crate::database::begin_immediate;
use crate::database::models::job::{JobAttributes, JobColumn};
use crate::database::models::ledger::{JobStatusUpdate, NewStatusRecord};
use crate::database::models::task_queue::TaskQueueOwner;
use crate::database::repositories::{JobStore, StatusLedger, TaskQueueStore};
use crate::database::time::parse_status_time;
use crate::domain::decision::StatusDecision;
use crate::domain::status::{JobStatus, minor};
use crate::{Error, Result};

/// Proposed updates per job, keyed by the time each update happened.
pub type StatusChanges = BTreeMap<i64, BTreeMap<DateTime<Utc>, JobStatusUpdate>>;

/// Wire form of [`StatusChanges`]: timestamps as strings.
///
/// Every timestamp must carry an offset; naive ones are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusChangeRequest(pub BTreeMap<i64, BTreeMap<String, JobStatusUpdate>>);

impl StatusChangeRequest {
    pub fn into_changes(self) -> Result<StatusChanges> {
        self.0
            .into_iter()
            .map(|(job_id, updates)| {
                let updates = updates
                    .into_iter()
                    .map(|(time, update)| Ok((parse_status_time(&time)?, update)))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                Ok((job_id, updates))
            })
            .collect()
    }
}

/// What `set_status_bulk` changed on one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusOutcome {
    pub status: Option<JobStatus>,
    pub minor_status: Option<String>,
    pub application_status: Option<String>,
    pub heart_beat_time: Option<DateTime<Utc>>,
    pub start_exec_time: Option<DateTime<Utc>>,
    pub end_exec_time: Option<DateTime<Utc>>,
}

fn secs_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

/// Earliest time the job entered a status matching `wanted`, from the ledger
/// and the proposed updates together.
fn first_entered(
    stamps: Option<&BTreeMap<JobStatus, f64>>,
    updates: &BTreeMap<DateTime<Utc>, JobStatusUpdate>,
    wanted: impl Fn(JobStatus) -> bool,
) -> Option<DateTime<Utc>> {
    let recorded = stamps
        .into_iter()
        .flatten()
        .filter(|(status, _)| wanted(**status))
        .filter_map(|(_, secs)| secs_to_datetime(*secs));
    let proposed = updates
        .iter()
        .filter(|(_, update)| update.status.is_some_and(&wanted))
        .map(|(time, _)| *time);
    recorded.chain(proposed).min()
}

/// Changes of one call that must reach other stores after the per-job loop.
#[derive(Default)]
pub(super) struct StatusEffects {
    pub(super) cleanup: BTreeSet<TaskQueueOwner>,
}

impl JobLifecycle {
    /// Apply timestamped status updates to many jobs.
    ///
    /// Jobs that do not exist are reported as failed with "Not found"; the
    /// others are processed regardless.
    pub async fn set_status_bulk(
        &self,
        changes: &StatusChanges,
        force: bool,
    ) -> Result<BulkResult<StatusOutcome>> {
        let mut tx = begin_immediate(&self.pools.write).await?;
        let result = self
            .set_status_in_tx(&mut tx, changes, force, &BTreeMap::new())
            .await;
        let (result, effects) = tx.finish(result).await?;
        self.schedule_cleanup(effects.cleanup).await;
        Ok(result)
    }

    /// `extra` holds per-job attributes written only when the job's status
    /// actually changes.
    pub(super) async fn set_status_in_tx(
        &self,
        conn: &mut SqliteConnection,
        changes: &StatusChanges,
        force: bool,
        extra: &BTreeMap<i64, JobAttributes>,
    ) -> Result<(BulkResult<StatusOutcome>, StatusEffects)> {
        let mut result = BulkResult::default();
        let mut effects = StatusEffects::default();
        if changes.is_empty() {
            return Ok((result, effects));
        }

        let job_ids: Vec<i64> = changes.keys().copied().collect();
        let jobs = JobStore::get_jobs(conn, &job_ids).await?;
        let stamps = StatusLedger::wms_time_stamps(conn, &job_ids).await?;

        let mut attr_updates: BTreeMap<i64, JobAttributes> = BTreeMap::new();
        let mut records = Vec::new();
        let mut stopped = Vec::new();

        for (&job_id, updates) in changes {
            let Some(job) = jobs.get(&job_id) else {
                result.fail(job_id, Error::not_found("Job", job_id).detail());
                continue;
            };
            let mut outcome = StatusOutcome::default();
            let mut attrs = JobAttributes::new();
            let job_stamps = stamps.get(&job_id);

            if let Some((&latest, _)) = updates.last_key_value() {
                let last_time = job_stamps
                    .and_then(|s| s.values().copied().reduce(f64::max))
                    .and_then(secs_to_datetime)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);

                if latest >= last_time {
                    let current = match job.status {
                        JobStatus::Stalled => JobStatus::Running,
                        status => status,
                    };
                    let timeline: Vec<(DateTime<Utc>, JobStatusUpdate)> = updates
                        .iter()
                        .map(|(time, update)| (*time, update.clone()))
                        .collect();
                    let decision =
                        match self
                            .decider
                            .decide(job_id, &timeline, last_time, current, force)
                        {
                            Ok(decision) => decision,
                            Err(e @ Error::IllegitimateTransition { .. }) => {
                                warn!(job_id, error = %e, "Status update rejected");
                                StatusDecision::default()
                            }
                            Err(e) => {
                                result.fail(job_id, e.detail());
                                continue;
                            }
                        };

                    if let Some(status) = decision.status {
                        if let Some(extra) = extra.get(&job_id) {
                            attrs.extend(extra.clone());
                        }
                        attrs.insert(JobColumn::Status, status.into());
                        if status.is_kill_or_delete() {
                            stopped.push(job_id);
                        }
                    }
                    if let Some(minor) = &decision.minor_status {
                        attrs.insert(JobColumn::MinorStatus, minor.as_str().into());
                    }
                    if let Some(application) = &decision.application_status {
                        attrs.insert(JobColumn::ApplicationStatus, application.as_str().into());
                    }
                    outcome.status = decision.status;
                    outcome.minor_status = decision.minor_status;
                    outcome.application_status = decision.application_status;
                }
            }

            let heart_beat = updates
                .iter()
                .filter(|(_, u)| u.source.as_deref().is_some_and(|s| s.starts_with("Job")))
                .map(|(time, _)| *time)
                .max();
            if let Some(time) = heart_beat {
                attrs.insert(JobColumn::HeartBeatTime, time.into());
                outcome.heart_beat_time = Some(time);
            }

            if job.start_exec_time.is_none()
                && let Some(time) = first_entered(job_stamps, updates, |s| s == JobStatus::Running)
            {
                attrs.insert(JobColumn::StartExecTime, time.into());
                outcome.start_exec_time = Some(time);
            }
            if job.end_exec_time.is_none()
                && let Some(time) = first_entered(job_stamps, updates, |s| s.is_final())
            {
                attrs.insert(JobColumn::EndExecTime, time.into());
                outcome.end_exec_time = Some(time);
            }

            if !attrs.is_empty() {
                attr_updates.insert(job_id, attrs);
            }
            records.extend(
                updates
                    .iter()
                    .map(|(time, update)| NewStatusRecord::from_update(job_id, *time, update)),
            );
            result.success.insert(job_id, outcome);
        }

        JobStore::update_attributes(conn, &attr_updates).await?;

        if !stopped.is_empty() {
            effects.cleanup = TaskQueueStore::tq_infos_for_jobs(conn, &stopped).await?;
            TaskQueueStore::remove_jobs(conn, &stopped).await?;
            let commands: Vec<(i64, &str, &str)> =
                stopped.iter().map(|&job_id| (job_id, "Kill", "")).collect();
            JobStore::enqueue_commands(conn, &commands).await?;
            info!(count = stopped.len(), "Jobs killed or deleted; removed from task queues");
        }

        StatusLedger::append(conn, &records).await?;
        debug!(
            succeeded = result.success.len(),
            failed = result.failed.len(),
            records = records.len(),
            "Status changes applied"
        );
        Ok((result, effects))
    }

    /// Apply the same forced update to every job, stamped now.
    async fn transition_all(
        &self,
        job_ids: &[i64],
        update: JobStatusUpdate,
    ) -> Result<BulkResult<StatusOutcome>> {
        let now = Utc::now();
        let changes: StatusChanges = job_ids
            .iter()
            .map(|&job_id| (job_id, BTreeMap::from([(now, update.clone())])))
            .collect();
        self.set_status_bulk(&changes, true).await
    }

    /// Mark jobs KILLED / "Marked for termination".
    pub async fn kill_bulk(&self, job_ids: &[i64]) -> Result<BulkResult<StatusOutcome>> {
        self.transition_all(
            job_ids,
            JobStatusUpdate::status(JobStatus::Killed)
                .with_minor(minor::MARKED_FOR_TERMINATION)
                .with_source(JOB_MANAGER_SOURCE),
        )
        .await
    }

    /// Soft delete: DELETED / "Checking accounting". Rows and history stay.
    pub async fn delete_bulk(&self, job_ids: &[i64]) -> Result<BulkResult<StatusOutcome>> {
        self.transition_all(
            job_ids,
            JobStatusUpdate::status(JobStatus::Deleted)
                .with_minor(minor::CHECKING_ACCOUNTING)
                .with_source(JOB_MANAGER_SOURCE),
        )
        .await
    }
}
