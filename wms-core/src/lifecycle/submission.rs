//! Job submission and task-queue placement.

use chrono::Utc;
use futures::future::join_all;
use sqlx::SqliteConnection;
use tracing::{info, warn};

use super::{BulkResult, JOB_MANAGER_SOURCE, JobLifecycle};
use crate::database::begin_immediate;
use crate::database::models::job::InsertedJob;
use crate::database::models::ledger::NewStatusRecord;
use crate::database::repositories::{JobStore, StatusLedger, TaskQueueStore};
use crate::domain::jdl::{CompiledJob, JobDescription, JobOwner};
use crate::domain::status::{JobStatus, UNKNOWN, minor};
use crate::{Error, Result};

/// Expand the submitted descriptions into one text per job.
///
/// Returns the texts and whether they came from a parametric description.
fn expand_batch(descriptions: &[String]) -> Result<(Vec<String>, bool)> {
    if let [single] = descriptions {
        return match JobDescription::parse(single) {
            Ok(description) if description.is_parametric() => Ok((
                description
                    .expand_parametric()?
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                true,
            )),
            // Unparseable descriptions still become (failed) jobs.
            _ => Ok((vec![single.clone()], false)),
        };
    }

    if descriptions.iter().any(|text| {
        JobDescription::parse(text).is_ok_and(|description| description.is_parametric())
    }) {
        return Err(Error::validation(
            "Parametric jobs cannot be submitted together with other jobs",
        ));
    }
    Ok((descriptions.to_vec(), false))
}

impl JobLifecycle {
    /// Submit a batch of job descriptions on behalf of `owner`.
    ///
    /// Descriptions that fail to compile still become jobs, recorded as
    /// FAILED / "Error in JDL syntax" and listed in `failed`.
    pub async fn submit_bulk(
        &self,
        descriptions: &[String],
        owner: &JobOwner,
    ) -> Result<BulkResult<InsertedJob>> {
        if descriptions.is_empty() {
            return Ok(BulkResult::default());
        }
        let (texts, parametric) = expand_batch(descriptions)?;
        let max = self.config.max_jobs_per_submission;
        if texts.len() > max {
            return Err(Error::validation(format!(
                "Cannot submit {} jobs at once, the limit is {max}",
                texts.len()
            )));
        }
        let (status, minor_status) = if parametric {
            (JobStatus::Submitting, minor::BULK_CONFIRMATION)
        } else {
            (JobStatus::Received, minor::JOB_ACCEPTED)
        };

        let mut tx = begin_immediate(&self.pools.write).await?;
        let result = self
            .submit_in_tx(&mut tx, &texts, owner, status, minor_status)
            .await;
        let result = tx.finish(result).await?;
        info!(
            owner = %owner.owner,
            owner_group = %owner.owner_group,
            submitted = result.success.len(),
            rejected = result.failed.len(),
            "Jobs submitted"
        );
        Ok(result)
    }

    async fn submit_in_tx(
        &self,
        conn: &mut SqliteConnection,
        texts: &[String],
        owner: &JobOwner,
        status: JobStatus,
        minor_status: &str,
    ) -> Result<BulkResult<InsertedJob>> {
        let mut job_ids = Vec::with_capacity(texts.len());
        for text in texts {
            job_ids.push(JobStore::insert_jdl(conn, text).await?);
        }

        let raws: Vec<String> = job_ids
            .iter()
            .zip(texts)
            .map(|(job_id, text)| text.replace("%j", &job_id.to_string()))
            .collect();
        let compiled = join_all(raws.iter().map(|raw| self.compiler.compile(raw, owner))).await;

        let now = Utc::now();
        let mut result = BulkResult::default();
        let mut records = Vec::with_capacity(job_ids.len());
        for (job_id, compiled) in job_ids.into_iter().zip(compiled) {
            let inserted = match compiled {
                Ok(compiled) => {
                    JobStore::store_compiled(conn, job_id, &compiled, status, minor_status, now)
                        .await?
                }
                Err(Error::SyntaxError(detail)) => {
                    warn!(job_id, %detail, "Job description rejected");
                    result
                        .failed
                        .insert(job_id, format!("{}: {detail}", minor::JDL_SYNTAX_ERROR));
                    JobStore::store_rejected(conn, job_id, owner, now).await?
                }
                Err(e) => return Err(e),
            };

            records.push(NewStatusRecord {
                job_id,
                status: Some(inserted.status),
                minor_status: Some(inserted.minor_status.clone()),
                application_status: Some(UNKNOWN.to_string()),
                date: now,
                source: JOB_MANAGER_SOURCE.to_string(),
            });
            if inserted.status != JobStatus::Failed {
                result.success.insert(job_id, inserted);
            }
        }

        StatusLedger::append(conn, &records).await?;
        Ok(result)
    }

    /// Place jobs in the task queues matching their compiled descriptions.
    ///
    /// Returns the queue id of every placed job.
    pub async fn queue_jobs(&self, job_ids: &[i64]) -> Result<BulkResult<i64>> {
        let mut tx = begin_immediate(&self.pools.write).await?;
        let result = self.queue_jobs_in_tx(&mut tx, job_ids).await;
        tx.finish(result).await
    }

    async fn queue_jobs_in_tx(
        &self,
        conn: &mut SqliteConnection,
        job_ids: &[i64],
    ) -> Result<BulkResult<i64>> {
        let jobs = JobStore::get_jobs(conn, job_ids).await?;
        let jdls = JobStore::get_jdls(conn, job_ids, false).await?;
        let mut result = BulkResult::default();

        for &job_id in job_ids {
            let (Some(job), Some(jdl)) = (jobs.get(&job_id), jdls.get(&job_id)) else {
                result.fail(job_id, Error::not_found("Job", job_id).detail());
                continue;
            };
            if !job.status.is_queueable() {
                warn!(job_id, status = %job.status, "Refusing to queue job");
                result.fail(job_id, format!("Job in status {} cannot be queued", job.status));
                continue;
            }
            let description = match JobDescription::parse(jdl) {
                Ok(description) => description,
                Err(e) => {
                    result.fail(job_id, e.detail());
                    continue;
                }
            };
            let compiled = CompiledJob {
                description,
                owner: JobOwner::new(&job.owner, &job.owner_group, &job.vo),
            };
            let policy = self.config.group_policy(&job.vo, &job.owner_group);
            let tq_id = TaskQueueStore::insert_job(
                conn,
                job_id,
                &compiled.task_queue_definition(),
                job.user_priority,
                &policy,
                self.calculator(),
            )
            .await?;
            result.success.insert(job_id, tq_id);
        }
        Ok(result)
    }
}
