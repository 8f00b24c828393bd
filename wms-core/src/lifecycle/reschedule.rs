//! Rescheduling: send jobs back to RECEIVED with a re-compiled description.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use super::status::{StatusChanges, StatusEffects};
use super::{BulkResult, JOB_MANAGER_SOURCE, JobLifecycle};
use crate::database::begin_immediate;
use crate::database::models::job::{JobAttributes, JobColumn};
use crate::database::models::ledger::JobStatusUpdate;
use crate::database::repositories::{JobStore, TaskQueueStore};
use crate::domain::jdl::JobOwner;
use crate::domain::status::{JobStatus, UNKNOWN, minor};
use crate::{Error, Result};

/// A successfully rescheduled job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RescheduleOutcome {
    pub status: JobStatus,
    pub minor_status: String,
    pub reschedule_counter: i64,
    pub reschedule_time: DateTime<Utc>,
}

/// A job that passed validation, waiting for its description to compile.
struct Candidate {
    job_id: i64,
    counter: i64,
    raw: String,
    owner: JobOwner,
}

impl JobLifecycle {
    /// Reschedule many jobs. Validation, compilation and status failures are
    /// reported per job.
    ///
    /// A job that would exceed the rescheduling limit is forced to FAILED
    /// and reported as failed.
    pub async fn reschedule_bulk(
        &self,
        job_ids: &[i64],
        reset_counter: bool,
    ) -> Result<BulkResult<RescheduleOutcome>> {
        let mut tx = begin_immediate(&self.pools.write).await?;
        let result = self.reschedule_in_tx(&mut tx, job_ids, reset_counter).await;
        let (result, effects) = tx.finish(result).await?;
        self.schedule_cleanup(effects.cleanup).await;
        Ok(result)
    }

    /// Reschedule one job, failing with the job's own error.
    pub async fn reschedule(&self, job_id: i64, reset_counter: bool) -> Result<RescheduleOutcome> {
        let mut tx = begin_immediate(&self.pools.write).await?;
        let jobs = match JobStore::get_jobs(&mut tx, &[job_id]).await {
            Ok(jobs) => jobs,
            Err(e) => return tx.finish(Err(e)).await,
        };
        let check = match jobs.get(&job_id) {
            None => Err(Error::not_found("Job", job_id)),
            Some(job) => JobStore::check_reschedule(job, self.config.max_rescheduling, reset_counter),
        };

        match check {
            // The forced FAILED transition must still be committed.
            Err(e @ Error::MaxReschedulingExceeded { .. }) => {
                let applied = self.reschedule_in_tx(&mut tx, &[job_id], reset_counter).await;
                let (_, effects) = tx.finish(applied).await?;
                self.schedule_cleanup(effects.cleanup).await;
                Err(e)
            }
            Err(e) => tx.finish(Err(e)).await,
            Ok(_) => {
                let applied = self.reschedule_in_tx(&mut tx, &[job_id], reset_counter).await;
                let (mut result, effects) = tx.finish(applied).await?;
                self.schedule_cleanup(effects.cleanup).await;
                match result.success.remove(&job_id) {
                    Some(outcome) => Ok(outcome),
                    None => Err(Error::Other(
                        result
                            .failed
                            .remove(&job_id)
                            .unwrap_or_else(|| format!("Job {job_id} was not rescheduled")),
                    )),
                }
            }
        }
    }

    async fn reschedule_in_tx(
        &self,
        conn: &mut SqliteConnection,
        job_ids: &[i64],
        reset_counter: bool,
    ) -> Result<(BulkResult<RescheduleOutcome>, StatusEffects)> {
        let job_ids: Vec<i64> = job_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let mut result = BulkResult::default();
        let jobs = JobStore::get_jobs(conn, &job_ids).await?;
        let originals = JobStore::get_jdls(conn, &job_ids, true).await?;
        let now = Utc::now();
        let max = self.config.max_rescheduling;

        let mut changes = StatusChanges::new();
        let mut candidates = Vec::new();
        for &job_id in &job_ids {
            let Some(job) = jobs.get(&job_id) else {
                result.fail(job_id, Error::not_found("Job", job_id).detail());
                continue;
            };
            match JobStore::check_reschedule(job, max, reset_counter) {
                Ok(counter) => {
                    let Some(original) = originals.get(&job_id) else {
                        result.fail(job_id, format!("No original description for job {job_id}"));
                        continue;
                    };
                    candidates.push(Candidate {
                        job_id,
                        counter,
                        raw: original.replace("%j", &job_id.to_string()),
                        owner: JobOwner::new(&job.owner, &job.owner_group, &job.vo),
                    });
                }
                Err(e @ Error::MaxReschedulingExceeded { .. }) => {
                    warn!(job_id, max, "Maximum of reschedulings reached; failing job");
                    changes.insert(
                        job_id,
                        BTreeMap::from([(
                            now,
                            JobStatusUpdate::status(JobStatus::Failed)
                                .with_minor(minor::MAX_RESCHEDULING)
                                .with_application(UNKNOWN)
                                .with_source(JOB_MANAGER_SOURCE),
                        )]),
                    );
                    result.fail(job_id, e.detail());
                }
                Err(e) => result.fail(job_id, e.detail()),
            }
        }

        let compiled = join_all(
            candidates
                .iter()
                .map(|c| self.compiler.compile(&c.raw, &c.owner)),
        )
        .await;

        let mut attr_updates: BTreeMap<i64, JobAttributes> = BTreeMap::new();
        let mut jdl_updates: BTreeMap<i64, String> = BTreeMap::new();
        let mut rescheduled = Vec::new();
        for (candidate, compiled) in candidates.iter().zip(compiled) {
            let job_id = candidate.job_id;
            let compiled = match compiled {
                Ok(compiled) => compiled,
                Err(e) => {
                    result.fail(job_id, e.detail());
                    continue;
                }
            };
            attr_updates.insert(
                job_id,
                JobAttributes::from([
                    (JobColumn::Site, compiled.description.site_summary().into()),
                    (JobColumn::UserPriority, compiled.priority().into()),
                    (JobColumn::RescheduleTime, now.into()),
                    (JobColumn::RescheduleCounter, candidate.counter.into()),
                ]),
            );
            jdl_updates.insert(job_id, compiled.jdl());
            changes.insert(
                job_id,
                BTreeMap::from([(
                    now,
                    JobStatusUpdate::status(JobStatus::Received)
                        .with_minor(minor::RESCHEDULED)
                        .with_application(UNKNOWN)
                        .with_source(JOB_MANAGER_SOURCE),
                )]),
            );
            rescheduled.push(job_id);
            result.success.insert(
                job_id,
                RescheduleOutcome {
                    status: JobStatus::Received,
                    minor_status: minor::RESCHEDULED.to_string(),
                    reschedule_counter: candidate.counter,
                    reschedule_time: now,
                },
            );
        }

        let (status_result, mut effects) = self
            .set_status_in_tx(conn, &changes, true, &attr_updates)
            .await?;
        for (job_id, reason) in status_result.failed {
            if result.success.contains_key(&job_id) {
                result.fail(job_id, reason);
            }
        }
        for (job_id, outcome) in &status_result.success {
            if outcome.status.is_none() && result.success.contains_key(job_id) {
                result.fail(*job_id, format!("Status of job {job_id} was not changed"));
            }
        }

        rescheduled.retain(|job_id| result.success.contains_key(job_id));
        jdl_updates.retain(|job_id, _| result.success.contains_key(job_id));
        JobStore::update_jdls(conn, &jdl_updates).await?;

        // Rescheduled jobs wait to be queued again from scratch.
        effects
            .cleanup
            .extend(TaskQueueStore::tq_infos_for_jobs(conn, &rescheduled).await?);
        TaskQueueStore::remove_jobs(conn, &rescheduled).await?;

        if !rescheduled.is_empty() {
            info!(count = rescheduled.len(), "Jobs rescheduled");
        }
        Ok((result, effects))
    }
}
