//! Job store: current job state, descriptions, input data, command mailbox
//! and heartbeat data.
//!
//! All operations run on a caller-supplied connection, usually the
//! connection of an open [`crate::database::ImmediateTransaction`], and never
//! commit.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet};
use strum::IntoEnumIterator;
use tracing::{debug, warn};

use crate::database::models::job::{
    AttrValue, CommandStatus, HeartBeatName, InsertedJob, JobAttributes, JobColumn, JobCommand,
    JobRecord, JobRow, JobStatusInfo,
};
use crate::database::models::search::{SearchFilter, SearchParams, SearchResult};
use crate::database::repositories::query::{push_columns, push_order_by, push_where};
use crate::database::time::{now, to_db_text};
use crate::domain::jdl::{CompiledJob, DescriptionCompiler, JobOwner};
use crate::domain::status::{JobStatus, UNKNOWN, minor};
use crate::{Error, Result};

/// Rows per bulk statement; keeps bind counts well below SQLite's limit.
const BULK_CHUNK_SIZE: usize = 500;

fn ids_json(job_ids: &[i64]) -> Result<String> {
    Ok(serde_json::to_string(job_ids)?)
}

/// Job store operations.
pub struct JobStore;

impl JobStore {
    // ----- descriptions -------------------------------------------------

    /// Store an original description and allocate its job id.
    pub async fn insert_jdl(conn: &mut SqliteConnection, original_jdl: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO job_jdls (original_jdl) VALUES (?)")
            .bind(original_jdl)
            .execute(&mut *conn)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Replace the compiled descriptions of existing jobs.
    pub async fn update_jdls(
        conn: &mut SqliteConnection,
        jdls: &BTreeMap<i64, String>,
    ) -> Result<()> {
        for (job_id, jdl) in jdls {
            sqlx::query("UPDATE job_jdls SET jdl = ? WHERE job_id = ?")
                .bind(jdl)
                .bind(job_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Original (as submitted) or compiled descriptions of `job_ids`.
    pub async fn get_jdls(
        conn: &mut SqliteConnection,
        job_ids: &[i64],
        original: bool,
    ) -> Result<BTreeMap<i64, String>> {
        let column = if original { "original_jdl" } else { "jdl" };
        let rows = sqlx::query(&format!(
            "SELECT job_id, {column} FROM job_jdls WHERE job_id IN (SELECT value FROM json_each(?))"
        ))
        .bind(ids_json(job_ids)?)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get::<i64, _>(0)?, row.try_get::<String, _>(1)?)))
            .collect()
    }

    // ----- creation -----------------------------------------------------

    /// Insert the `jobs` row of an allocated job id.
    pub async fn insert_attributes(
        conn: &mut SqliteConnection,
        job_id: i64,
        attrs: &JobAttributes,
    ) -> Result<()> {
        let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO jobs (job_id");
        let columns: Vec<_> = attrs
            .iter()
            .filter(|(column, _)| **column != JobColumn::JobId)
            .collect();
        for (column, _) in &columns {
            qb.push(", ").push(column.sql_name());
        }
        qb.push(") VALUES (").push_bind(job_id);
        for (_, value) in &columns {
            qb.push(", ");
            value.push_bind(&mut qb);
        }
        qb.push(")");
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }

    pub async fn insert_input_data(
        conn: &mut SqliteConnection,
        job_id: i64,
        lfns: &[String],
    ) -> Result<()> {
        for lfn in lfns.iter().filter(|lfn| !lfn.is_empty()) {
            sqlx::query("INSERT OR IGNORE INTO input_data (job_id, lfn) VALUES (?, ?)")
                .bind(job_id)
                .bind(lfn)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    pub async fn get_input_data(
        conn: &mut SqliteConnection,
        job_ids: &[i64],
    ) -> Result<BTreeMap<i64, Vec<String>>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT job_id, lfn FROM input_data WHERE job_id IN (SELECT value FROM json_each(?)) ORDER BY job_id, lfn",
        )
        .bind(ids_json(job_ids)?)
        .fetch_all(&mut *conn)
        .await?;

        let mut result: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for (job_id, lfn) in rows {
            result.entry(job_id).or_default().push(lfn);
        }
        Ok(result)
    }

    /// Persist a successfully compiled job under `job_id`.
    pub async fn store_compiled(
        conn: &mut SqliteConnection,
        job_id: i64,
        compiled: &CompiledJob,
        status: JobStatus,
        minor_status: &str,
        time_stamp: DateTime<Utc>,
    ) -> Result<InsertedJob> {
        let mut attrs = compiled.attributes();
        attrs.insert(JobColumn::Status, status.into());
        attrs.insert(JobColumn::MinorStatus, minor_status.into());
        attrs.insert(JobColumn::ApplicationStatus, UNKNOWN.into());
        attrs.insert(JobColumn::SubmissionTime, time_stamp.into());
        attrs.insert(JobColumn::LastUpdateTime, time_stamp.into());
        attrs.insert(JobColumn::VerifiedFlag, true.into());

        Self::insert_attributes(conn, job_id, &attrs).await?;
        Self::update_jdls(conn, &BTreeMap::from([(job_id, compiled.jdl())])).await?;
        Self::insert_input_data(conn, job_id, &compiled.input_data()).await?;

        Ok(InsertedJob {
            job_id,
            status,
            minor_status: minor_status.to_string(),
            time_stamp,
        })
    }

    /// Persist a job whose description did not compile, as FAILED.
    pub async fn store_rejected(
        conn: &mut SqliteConnection,
        job_id: i64,
        owner: &JobOwner,
        time_stamp: DateTime<Utc>,
    ) -> Result<InsertedJob> {
        let attrs = JobAttributes::from([
            (JobColumn::Owner, owner.owner.as_str().into()),
            (JobColumn::OwnerGroup, owner.owner_group.as_str().into()),
            (JobColumn::Vo, owner.vo.as_str().into()),
            (JobColumn::Status, JobStatus::Failed.into()),
            (JobColumn::MinorStatus, minor::JDL_SYNTAX_ERROR.into()),
            (JobColumn::ApplicationStatus, UNKNOWN.into()),
            (JobColumn::SubmissionTime, time_stamp.into()),
            (JobColumn::LastUpdateTime, time_stamp.into()),
            (JobColumn::VerifiedFlag, false.into()),
        ]);
        Self::insert_attributes(conn, job_id, &attrs).await?;

        Ok(InsertedJob {
            job_id,
            status: JobStatus::Failed,
            minor_status: minor::JDL_SYNTAX_ERROR.to_string(),
            time_stamp,
        })
    }

    /// Create one job from a raw description.
    ///
    /// A description the compiler rejects with a syntax error still yields a
    /// job, recorded as FAILED / "Error in JDL syntax".
    pub async fn create(
        conn: &mut SqliteConnection,
        compiler: &dyn DescriptionCompiler,
        raw: &str,
        owner: &JobOwner,
    ) -> Result<InsertedJob> {
        let job_id = Self::insert_jdl(conn, raw).await?;
        let time_stamp = now();
        let raw = raw.replace("%j", &job_id.to_string());

        match compiler.compile(&raw, owner).await {
            Ok(compiled) => {
                Self::store_compiled(
                    conn,
                    job_id,
                    &compiled,
                    JobStatus::Received,
                    minor::JOB_ACCEPTED,
                    time_stamp,
                )
                .await
            }
            Err(Error::SyntaxError(detail)) => {
                warn!(job_id, %detail, "Job description rejected");
                Self::store_rejected(conn, job_id, owner, time_stamp).await
            }
            Err(e) => Err(e),
        }
    }

    // ----- queries ------------------------------------------------------

    fn selected_columns(params: &SearchParams) -> Result<Vec<JobColumn>> {
        match params.parameters.as_deref() {
            Some(names) if !names.is_empty() => names.iter().map(|n| JobColumn::parse(n)).collect(),
            _ => Ok(JobColumn::iter().collect()),
        }
    }

    /// Search jobs. `total` counts every match, ignoring pagination.
    pub async fn search(conn: &mut SqliteConnection, params: &SearchParams) -> Result<SearchResult> {
        let columns = Self::selected_columns(params)?;
        if let Some(page) = &params.page {
            page.validate()?;
        }
        let select = if params.distinct { "SELECT DISTINCT " } else { "SELECT " };

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM (");
        count_qb.push(select);
        push_columns(&mut count_qb, &columns);
        count_qb.push(" FROM jobs");
        push_where(&mut count_qb, &params.search)?;
        count_qb.push(")");

        let mut qb = QueryBuilder::<Sqlite>::new(select);
        push_columns(&mut qb, &columns);
        qb.push(" FROM jobs");
        push_where(&mut qb, &params.search)?;
        push_order_by(&mut qb, &params.sort)?;
        if let Some(page) = &params.page {
            qb.push(" LIMIT ").push_bind(page.per_page);
            qb.push(" OFFSET ").push_bind(page.offset());
        }

        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await?;
        let rows = qb.build().fetch_all(&mut *conn).await?;

        let rows = rows
            .iter()
            .map(|row| {
                let mut out = JobRow::new();
                for (i, column) in columns.iter().enumerate() {
                    out.insert(column.to_string(), column.decode(row, i)?);
                }
                Ok(out)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(total, returned = rows.len(), "Job search");
        Ok(SearchResult { total, rows })
    }

    /// Count jobs grouped by `group_by`; each row carries a `count` field.
    pub async fn summary(
        conn: &mut SqliteConnection,
        group_by: &[String],
        filters: &[SearchFilter],
    ) -> Result<Vec<JobRow>> {
        let columns = group_by
            .iter()
            .map(|name| JobColumn::parse(name))
            .collect::<Result<Vec<_>>>()?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        push_columns(&mut qb, &columns);
        if !columns.is_empty() {
            qb.push(", ");
        }
        qb.push("COUNT(*) FROM jobs");
        push_where(&mut qb, filters)?;
        if !columns.is_empty() {
            qb.push(" GROUP BY ");
            push_columns(&mut qb, &columns);
        }

        let rows = qb.build().fetch_all(&mut *conn).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let count: i64 = row.try_get(columns.len())?;
            if count == 0 {
                continue;
            }
            let mut out = JobRow::new();
            for (i, column) in columns.iter().enumerate() {
                out.insert(column.to_string(), column.decode(row, i)?);
            }
            out.insert("count".to_string(), count.into());
            result.push(out);
        }
        Ok(result)
    }

    pub async fn get_status(conn: &mut SqliteConnection, job_id: i64) -> Result<JobStatusInfo> {
        let row = sqlx::query(
            "SELECT status, minor_status, application_status FROM jobs WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("Job", job_id))?;

        let status: String = row.try_get("status")?;
        Ok(JobStatusInfo {
            status: JobStatus::parse(&status)
                .ok_or_else(|| Error::Database(format!("Unknown status {status} for job {job_id}")))?,
            minor_status: row.try_get("minor_status")?,
            application_status: row.try_get("application_status")?,
        })
    }

    /// Typed rows of the existing jobs among `job_ids`.
    pub async fn get_jobs(
        conn: &mut SqliteConnection,
        job_ids: &[i64],
    ) -> Result<BTreeMap<i64, JobRecord>> {
        let jobs: Vec<JobRecord> = sqlx::query_as(
            "SELECT * FROM jobs WHERE job_id IN (SELECT value FROM json_each(?))",
        )
        .bind(ids_json(job_ids)?)
        .fetch_all(&mut *conn)
        .await?;
        Ok(jobs.into_iter().map(|job| (job.job_id, job)).collect())
    }

    // ----- attribute updates --------------------------------------------

    /// Add LastUpdateTime when the update changes Status (or when asked to).
    fn with_timestamp(attrs: &JobAttributes, bump: bool, time: DateTime<Utc>) -> JobAttributes {
        let mut attrs = attrs.clone();
        if (bump || attrs.contains_key(&JobColumn::Status))
            && !attrs.contains_key(&JobColumn::LastUpdateTime)
        {
            attrs.insert(JobColumn::LastUpdateTime, time.into());
        }
        attrs
    }

    /// Update one job; NotFound when it does not exist.
    pub async fn set_attributes(
        conn: &mut SqliteConnection,
        job_id: i64,
        attrs: &JobAttributes,
        bump_timestamp: bool,
    ) -> Result<()> {
        let attrs = Self::with_timestamp(attrs, bump_timestamp, now());
        if attrs.is_empty() {
            return Self::get_status(conn, job_id).await.map(|_| ());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET ");
        for (i, (column, value)) in attrs.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(column.sql_name()).push(" = ");
            value.push_bind(&mut qb);
        }
        qb.push(" WHERE job_id = ").push_bind(job_id);

        let result = qb.build().execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Job", job_id));
        }
        Ok(())
    }

    /// Update many jobs with one statement per chunk.
    ///
    /// Every item must name the same columns, otherwise the whole call fails
    /// with [`Error::ConflictingBulkShape`].
    pub async fn set_attributes_bulk(
        conn: &mut SqliteConnection,
        updates: &BTreeMap<i64, JobAttributes>,
    ) -> Result<()> {
        let Some(first) = updates.values().next() else {
            return Ok(());
        };
        let shape: BTreeSet<JobColumn> = first.keys().copied().collect();
        if updates
            .values()
            .any(|attrs| !attrs.keys().copied().eq(shape.iter().copied()))
        {
            return Err(Error::ConflictingBulkShape);
        }
        if shape.is_empty() {
            return Ok(());
        }

        let time = now();
        let updates: Vec<(i64, JobAttributes)> = updates
            .iter()
            .map(|(job_id, attrs)| (*job_id, Self::with_timestamp(attrs, false, time)))
            .collect();
        let columns: Vec<JobColumn> = updates[0].1.keys().copied().collect();

        for chunk in updates.chunks(BULK_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET ");
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push(column.sql_name()).push(" = CASE job_id");
                for (job_id, attrs) in chunk {
                    qb.push(" WHEN ").push_bind(*job_id).push(" THEN ");
                    attrs
                        .get(column)
                        .unwrap_or(&AttrValue::Null)
                        .push_bind(&mut qb);
                }
                qb.push(" END");
            }
            let ids: Vec<i64> = chunk.iter().map(|(job_id, _)| *job_id).collect();
            qb.push(" WHERE job_id IN (SELECT value FROM json_each(")
                .push_bind(ids_json(&ids)?)
                .push("))");
            qb.build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Update jobs with per-job column sets.
    ///
    /// Items are grouped by column set and each group is written with
    /// [`Self::set_attributes_bulk`].
    pub async fn update_attributes(
        conn: &mut SqliteConnection,
        updates: &BTreeMap<i64, JobAttributes>,
    ) -> Result<()> {
        let mut groups: BTreeMap<Vec<JobColumn>, BTreeMap<i64, JobAttributes>> = BTreeMap::new();
        for (job_id, attrs) in updates.iter().filter(|(_, attrs)| !attrs.is_empty()) {
            groups
                .entry(attrs.keys().copied().collect())
                .or_default()
                .insert(*job_id, attrs.clone());
        }
        for group in groups.values() {
            Self::set_attributes_bulk(conn, group).await?;
        }
        Ok(())
    }

    /// New RescheduleCounter for `job`, or why it may not be rescheduled.
    pub fn check_reschedule(job: &JobRecord, max_rescheduling: u32, reset: bool) -> Result<i64> {
        if !job.verified_flag {
            return Err(Error::NotVerified {
                job_id: job.job_id,
                detail: format!(
                    "VerifiedFlag is False: Status {}, Minor Status: {}",
                    job.status, job.minor_status
                ),
            });
        }
        let counter = if reset { 0 } else { job.reschedule_counter + 1 };
        if counter > i64::from(max_rescheduling) {
            return Err(Error::MaxReschedulingExceeded {
                job_id: job.job_id,
                max: max_rescheduling,
            });
        }
        Ok(counter)
    }

    // ----- commands -----------------------------------------------------

    /// Queue commands for jobs known to exist.
    pub async fn enqueue_commands(
        conn: &mut SqliteConnection,
        commands: &[(i64, &str, &str)],
    ) -> Result<()> {
        let reception_time = to_db_text(now());
        for (job_id, command, arguments) in commands {
            sqlx::query(
                r#"
                INSERT INTO job_commands (job_id, command, arguments, status, reception_time, reception_order)
                VALUES (?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(reception_order), 0) + 1 FROM job_commands WHERE job_id = ?))
                "#,
            )
            .bind(job_id)
            .bind(command)
            .bind(arguments)
            .bind(CommandStatus::Received.as_str())
            .bind(&reception_time)
            .bind(job_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Queue one command; NotFound when the job does not exist.
    pub async fn command(
        conn: &mut SqliteConnection,
        job_id: i64,
        command: &str,
        arguments: &str,
    ) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT job_id FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&mut *conn)
            .await?;
        if exists.is_none() {
            return Err(Error::not_found("Job", job_id));
        }
        Self::enqueue_commands(conn, &[(job_id, command, arguments)]).await
    }

    /// Pending commands of `job_ids`, marked as sent.
    pub async fn take_commands(
        conn: &mut SqliteConnection,
        job_ids: &[i64],
    ) -> Result<Vec<JobCommand>> {
        let ids = ids_json(job_ids)?;
        let commands: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT job_id, command, arguments FROM job_commands
            WHERE job_id IN (SELECT value FROM json_each(?)) AND status = ?
            ORDER BY job_id, reception_order
            "#,
        )
        .bind(&ids)
        .bind(CommandStatus::Received.as_str())
        .fetch_all(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            UPDATE job_commands SET status = ?, execution_time = ?
            WHERE job_id IN (SELECT value FROM json_each(?)) AND status = ?
            "#,
        )
        .bind(CommandStatus::Sent.as_str())
        .bind(to_db_text(now()))
        .bind(&ids)
        .bind(CommandStatus::Received.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(commands
            .into_iter()
            .map(|(job_id, command, arguments)| JobCommand {
                job_id,
                command,
                arguments,
            })
            .collect())
    }

    // ----- heartbeats ---------------------------------------------------

    /// Record heartbeat metrics; names outside [`HeartBeatName`] are rejected.
    pub async fn add_heartbeat_data(
        conn: &mut SqliteConnection,
        job_id: i64,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        let entries = data
            .iter()
            .map(|(name, value)| Ok((HeartBeatName::parse(name)?, value)))
            .collect::<Result<Vec<_>>>()?;

        let time = to_db_text(now());
        for (name, value) in entries {
            sqlx::query(
                "INSERT OR REPLACE INTO heart_beat_logging_info (job_id, name, value, heart_beat_time) VALUES (?, ?, ?, ?)",
            )
            .bind(job_id)
            .bind(name.to_string())
            .bind(value)
            .bind(&time)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    // ----- removal ------------------------------------------------------

    /// Delete jobs and everything hanging off them.
    pub async fn delete(conn: &mut SqliteConnection, job_ids: &[i64]) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM job_jdls WHERE job_id IN (SELECT value FROM json_each(?))")
                .bind(ids_json(job_ids)?)
                .execute(&mut *conn)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::search::{FilterOperator, SortSpec};
    use crate::database::test_pool;
    use crate::domain::jdl::JdlCompiler;

    fn owner() -> JobOwner {
        JobOwner::new("alice", "lhcb_user", "lhcb")
    }

    async fn create(conn: &mut SqliteConnection, jdl: &str) -> InsertedJob {
        JobStore::create(conn, &JdlCompiler, jdl, &owner()).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_status() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let job = create(&mut conn, r#"[Executable = "run.sh"; Arguments = "%j";]"#).await;
        assert_eq!(job.status, JobStatus::Received);
        assert_eq!(job.minor_status, "Job accepted");

        let status = JobStore::get_status(&mut conn, job.job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Received);
        assert_eq!(status.application_status, "Unknown");

        let compiled = JobStore::get_jdls(&mut conn, &[job.job_id], false).await.unwrap();
        assert!(compiled[&job.job_id].contains(&format!("Arguments = \"{}\"", job.job_id)));
        let original = JobStore::get_jdls(&mut conn, &[job.job_id], true).await.unwrap();
        assert!(original[&job.job_id].contains("%j"));

        let record = &JobStore::get_jobs(&mut conn, &[job.job_id]).await.unwrap()[&job.job_id];
        assert!(record.verified_flag);
        assert_eq!(record.owner, "alice");
        assert!(record.submission_time.is_some());
    }

    #[tokio::test]
    async fn test_syntax_error_is_recorded_as_failed_job() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let job = create(&mut conn, r#"[Arguments = "no executable";]"#).await;
        assert_eq!(job.status, JobStatus::Failed);

        let status = JobStore::get_status(&mut conn, job.job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.minor_status, "Error in JDL syntax");

        let record = &JobStore::get_jobs(&mut conn, &[job.job_id]).await.unwrap()[&job.job_id];
        assert!(!record.verified_flag);
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        assert!(matches!(
            JobStore::get_status(&mut conn, 404).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_filters_columns_and_pagination() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let jdl = format!(r#"[Executable = "x"; JobName = "{name}";]"#);
            ids.push(create(&mut conn, &jdl).await.job_id);
        }

        let params = SearchParams::default()
            .columns(["JobID", "JobName"])
            .filter(SearchFilter::scalar("JobName", FilterOperator::Neq, "a"))
            .sort_by(SortSpec::desc("JobID"))
            .paginate(1, 1);
        let result = JobStore::search(&mut conn, &params).await.unwrap();

        assert_eq!(result.total, 2);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["JobID"], ids[2]);
        assert_eq!(result.rows[0]["JobName"], "c");
        assert_eq!(result.rows[0].len(), 2);

        let all = JobStore::search(&mut conn, &SearchParams::default()).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.rows[0]["VerifiedFlag"], true);
        assert_eq!(all.rows[0].len(), JobColumn::iter().count());
    }

    #[tokio::test]
    async fn test_search_rejects_unknown_column_and_bad_page() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let bad_column = SearchParams::default().columns(["Nope"]);
        assert!(matches!(
            JobStore::search(&mut conn, &bad_column).await,
            Err(Error::InvalidQuery(_))
        ));

        let bad_filter = SearchParams::default().filter(SearchFilter::eq("Nope", 1i64));
        assert!(matches!(
            JobStore::search(&mut conn, &bad_filter).await,
            Err(Error::InvalidQuery(_))
        ));

        let bad_page = SearchParams::default().paginate(0, 10);
        assert!(matches!(
            JobStore::search(&mut conn, &bad_page).await,
            Err(Error::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_search_partial_date_literal() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = create(&mut conn, r#"[Executable = "x";]"#).await;

        let submitted = DateTime::parse_from_rfc3339("2024-02-10T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        JobStore::set_attributes(
            &mut conn,
            job.job_id,
            &JobAttributes::from([(JobColumn::SubmissionTime, submitted.into())]),
            false,
        )
        .await
        .unwrap();

        for (literal, expected) in [("2024-02", 1), ("2024-02-10T08", 1), ("2024-03", 0), ("2024", 1)] {
            let params = SearchParams::default().filter(SearchFilter::eq("SubmissionTime", literal));
            let result = JobStore::search(&mut conn, &params).await.unwrap();
            assert_eq!(result.total, expected, "{literal}");
        }

        let params = SearchParams::default()
            .columns(["SubmissionTime"])
            .filter(SearchFilter::scalar("SubmissionTime", FilterOperator::Lt, "2024-03"));
        let result = JobStore::search(&mut conn, &params).await.unwrap();
        assert_eq!(result.rows[0]["SubmissionTime"], "2024-02-10T08:30:00Z");
    }

    #[tokio::test]
    async fn test_summary_groups() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        create(&mut conn, r#"[Executable = "x";]"#).await;
        create(&mut conn, r#"[Executable = "x";]"#).await;
        create(&mut conn, r#"[Arguments = "broken";]"#).await;

        let rows = JobStore::summary(&mut conn, &["Status".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let received = rows.iter().find(|r| r["Status"] == "Received").unwrap();
        assert_eq!(received["count"], 2);

        let none = JobStore::summary(
            &mut conn,
            &["Status".to_string()],
            &[SearchFilter::eq("Owner", "nobody")],
        )
        .await
        .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_update_requires_same_shape() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let a = create(&mut conn, r#"[Executable = "x";]"#).await.job_id;
        let b = create(&mut conn, r#"[Executable = "x";]"#).await.job_id;

        let conflicting = BTreeMap::from([
            (a, JobAttributes::from([(JobColumn::Site, "A".into())])),
            (b, JobAttributes::from([(JobColumn::JobName, "B".into())])),
        ]);
        assert!(matches!(
            JobStore::set_attributes_bulk(&mut conn, &conflicting).await,
            Err(Error::ConflictingBulkShape)
        ));

        let uniform = BTreeMap::from([
            (a, JobAttributes::from([(JobColumn::Site, "A".into())])),
            (b, JobAttributes::from([(JobColumn::Site, "B".into())])),
        ]);
        JobStore::set_attributes_bulk(&mut conn, &uniform).await.unwrap();
        let jobs = JobStore::get_jobs(&mut conn, &[a, b]).await.unwrap();
        assert_eq!(jobs[&a].site, "A");
        assert_eq!(jobs[&b].site, "B");

        // Heterogeneous updates go through update_attributes.
        JobStore::update_attributes(&mut conn, &conflicting).await.unwrap();
        let jobs = JobStore::get_jobs(&mut conn, &[a, b]).await.unwrap();
        assert_eq!(jobs[&b].job_name, "B");
    }

    #[tokio::test]
    async fn test_status_update_bumps_last_update_time() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = create(&mut conn, r#"[Executable = "x";]"#).await.job_id;
        sqlx::query("UPDATE jobs SET last_update_time = '2000-01-01 00:00:00'")
            .execute(&mut *conn)
            .await
            .unwrap();

        JobStore::set_attributes(
            &mut conn,
            job,
            &JobAttributes::from([(JobColumn::Status, JobStatus::Checking.into())]),
            false,
        )
        .await
        .unwrap();

        let record = &JobStore::get_jobs(&mut conn, &[job]).await.unwrap()[&job];
        assert_eq!(record.status, JobStatus::Checking);
        assert!(record.last_update_time.unwrap().timestamp() > 946_684_800);

        assert!(matches!(
            JobStore::set_attributes(&mut conn, 999, &JobAttributes::new(), true).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_command_mailbox() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = create(&mut conn, r#"[Executable = "x";]"#).await.job_id;

        JobStore::command(&mut conn, job, "Kill", "").await.unwrap();
        JobStore::command(&mut conn, job, "Peek", "--all").await.unwrap();
        assert!(matches!(
            JobStore::command(&mut conn, 999, "Kill", "").await,
            Err(Error::NotFound { .. })
        ));

        let commands = JobStore::take_commands(&mut conn, &[job]).await.unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].command, "Kill");
        assert_eq!(commands[1].arguments, "--all");

        assert!(JobStore::take_commands(&mut conn, &[job]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_names_are_validated() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = create(&mut conn, r#"[Executable = "x";]"#).await.job_id;

        let good = BTreeMap::from([
            ("LoadAverage".to_string(), "1.5".to_string()),
            ("CPUConsumed".to_string(), "120".to_string()),
        ]);
        JobStore::add_heartbeat_data(&mut conn, job, &good).await.unwrap();

        let bad = BTreeMap::from([("Temperature".to_string(), "hot".to_string())]);
        assert!(matches!(
            JobStore::add_heartbeat_data(&mut conn, job, &bad).await,
            Err(Error::InvalidQuery(_))
        ));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM heart_beat_logging_info")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = create(
            &mut conn,
            r#"[Executable = "x"; InputData = {"/lhcb/a", "/lhcb/b"};]"#,
        )
        .await
        .job_id;
        assert_eq!(
            JobStore::get_input_data(&mut conn, &[job]).await.unwrap()[&job],
            vec!["/lhcb/a", "/lhcb/b"]
        );
        JobStore::command(&mut conn, job, "Kill", "").await.unwrap();

        assert_eq!(JobStore::delete(&mut conn, &[job]).await.unwrap(), 1);
        assert!(JobStore::get_jobs(&mut conn, &[job]).await.unwrap().is_empty());
        assert!(JobStore::get_input_data(&mut conn, &[job]).await.unwrap().is_empty());
        assert!(JobStore::take_commands(&mut conn, &[job]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_reschedule() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = create(&mut conn, r#"[Executable = "x";]"#).await.job_id;
        let mut record = JobStore::get_jobs(&mut conn, &[job]).await.unwrap()[&job].clone();

        assert_eq!(JobStore::check_reschedule(&record, 3, false).unwrap(), 1);
        record.reschedule_counter = 3;
        assert!(matches!(
            JobStore::check_reschedule(&record, 3, false),
            Err(Error::MaxReschedulingExceeded { max: 3, .. })
        ));
        assert_eq!(JobStore::check_reschedule(&record, 3, true).unwrap(), 0);

        record.verified_flag = false;
        assert!(matches!(
            JobStore::check_reschedule(&record, 3, true),
            Err(Error::NotVerified { .. })
        ));
    }
}
