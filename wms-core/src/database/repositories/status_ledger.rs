//! Append-only status history of jobs.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::database::models::ledger::{NewStatusRecord, StatusRecord};
use crate::database::time::{ORDERING_EPOCH_SECS, order_to_unix_secs, status_time_order, to_db_text};
use crate::domain::status::{JobStatus, UNKNOWN};
use crate::{Error, Result};

/// Records per insert statement (8 binds each).
const INSERT_CHUNK_SIZE: usize = 200;

#[derive(sqlx::FromRow)]
struct LedgerRow {
    job_id: i64,
    seq_num: i64,
    status: Option<String>,
    minor_status: Option<String>,
    application_status: Option<String>,
    status_time_order: i64,
    status_source: String,
}

/// Status ledger operations.
pub struct StatusLedger;

impl StatusLedger {
    /// Append records. SeqNums continue from each job's current maximum, in
    /// input order.
    ///
    /// Callers must hold the write lock (an immediate transaction) so that
    /// concurrent appends cannot allocate the same SeqNum.
    pub async fn append(conn: &mut SqliteConnection, records: &[NewStatusRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let job_ids: Vec<i64> = records
            .iter()
            .map(|r| r.job_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let current: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT job_id, MAX(seq_num) FROM logging_info
            WHERE job_id IN (SELECT value FROM json_each(?))
            GROUP BY job_id
            "#,
        )
        .bind(serde_json::to_string(&job_ids)?)
        .fetch_all(&mut *conn)
        .await?;
        let mut next_seq: BTreeMap<i64, i64> = current
            .into_iter()
            .map(|(job_id, max)| (job_id, max + 1))
            .collect();

        let numbered: Vec<(i64, &NewStatusRecord)> = records
            .iter()
            .map(|record| {
                let seq = next_seq.entry(record.job_id).or_insert(1);
                let this = *seq;
                *seq += 1;
                (this, record)
            })
            .collect();

        for chunk in numbered.chunks(INSERT_CHUNK_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO logging_info (job_id, seq_num, status, minor_status, application_status, status_time, status_time_order, status_source) ",
            );
            qb.push_values(chunk, |mut b, (seq_num, record)| {
                b.push_bind(record.job_id)
                    .push_bind(*seq_num)
                    .push_bind(record.status.map(|s| s.as_str()))
                    .push_bind(record.minor_status.clone())
                    .push_bind(record.application_status.clone())
                    .push_bind(to_db_text(record.date))
                    .push_bind(status_time_order(record.date))
                    .push_bind(record.source.clone());
            });
            qb.build().execute(&mut *conn).await?;
        }

        debug!(records = records.len(), jobs = job_ids.len(), "Appended status records");
        Ok(())
    }

    /// History of each job, oldest first, with idem fields resolved.
    ///
    /// Records are ordered by time, then SeqNum. A NULL field repeats the
    /// resolved value of the previous record; on the first record it is
    /// "Unknown".
    pub async fn get(
        conn: &mut SqliteConnection,
        job_ids: &[i64],
    ) -> Result<BTreeMap<i64, Vec<StatusRecord>>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT job_id, seq_num, status, minor_status, application_status,
                   status_time_order, status_source
            FROM logging_info
            WHERE job_id IN (SELECT value FROM json_each(?))
            ORDER BY job_id, status_time_order, status_time, seq_num
            "#,
        )
        .bind(serde_json::to_string(job_ids)?)
        .fetch_all(&mut *conn)
        .await?;

        let mut result: BTreeMap<i64, Vec<StatusRecord>> = BTreeMap::new();
        for row in rows {
            let history = result.entry(row.job_id).or_default();
            let previous = history.last();
            let resolve = |value: Option<String>, prev: Option<&String>| {
                value.unwrap_or_else(|| prev.cloned().unwrap_or_else(|| UNKNOWN.to_string()))
            };
            let record = StatusRecord {
                seq_num: row.seq_num,
                status: resolve(row.status, previous.map(|p| &p.status)),
                minor_status: resolve(row.minor_status, previous.map(|p| &p.minor_status)),
                application_status: resolve(
                    row.application_status,
                    previous.map(|p| &p.application_status),
                ),
                status_time: order_to_datetime(row.status_time_order)?,
                status_time_order: row.status_time_order,
                source: row.status_source,
            };
            history.push(record);
        }
        Ok(result)
    }

    pub async fn delete(conn: &mut SqliteConnection, job_ids: &[i64]) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM logging_info WHERE job_id IN (SELECT value FROM json_each(?))")
                .bind(serde_json::to_string(job_ids)?)
                .execute(&mut *conn)
                .await?;
        Ok(result.rows_affected())
    }

    /// When each major status was entered, as Unix seconds.
    ///
    /// Only records with an explicit status count. If a status was entered
    /// more than once, the record with the highest SeqNum wins.
    pub async fn wms_time_stamps(
        conn: &mut SqliteConnection,
        job_ids: &[i64],
    ) -> Result<BTreeMap<i64, BTreeMap<JobStatus, f64>>> {
        let rows: Vec<(i64, String, i64)> = sqlx::query_as(
            r#"
            SELECT job_id, status, status_time_order FROM logging_info
            WHERE job_id IN (SELECT value FROM json_each(?)) AND status IS NOT NULL
            ORDER BY job_id, seq_num
            "#,
        )
        .bind(serde_json::to_string(job_ids)?)
        .fetch_all(&mut *conn)
        .await?;

        let mut result: BTreeMap<i64, BTreeMap<JobStatus, f64>> = BTreeMap::new();
        for (job_id, status, order) in rows {
            let Some(status) = JobStatus::parse(&status) else {
                debug!(job_id, %status, "Skipping unknown status in ledger");
                continue;
            };
            result
                .entry(job_id)
                .or_default()
                .insert(status, order_to_unix_secs(order));
        }
        Ok(result)
    }
}

fn order_to_datetime(order: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(order + ORDERING_EPOCH_SECS * 1000)
        .single()
        .ok_or_else(|| Error::Database(format!("invalid status_time_order {order}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ledger::JobStatusUpdate;
    use crate::database::test_pool;
    use chrono::Duration;

    async fn new_job(conn: &mut SqliteConnection) -> i64 {
        sqlx::query("INSERT INTO job_jdls (original_jdl) VALUES ('[]')")
            .execute(&mut *conn)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(job_id: i64, date: DateTime<Utc>, update: JobStatusUpdate) -> NewStatusRecord {
        NewStatusRecord::from_update(job_id, date, &update)
    }

    #[tokio::test]
    async fn test_seq_nums_are_contiguous_per_job() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let a = new_job(&mut conn).await;
        let b = new_job(&mut conn).await;

        StatusLedger::append(
            &mut conn,
            &[
                record(a, t(0), JobStatusUpdate::status(JobStatus::Received)),
                record(b, t(0), JobStatusUpdate::status(JobStatus::Received)),
                record(a, t(1), JobStatusUpdate::status(JobStatus::Checking)),
            ],
        )
        .await
        .unwrap();
        StatusLedger::append(
            &mut conn,
            &[record(a, t(2), JobStatusUpdate::status(JobStatus::Waiting))],
        )
        .await
        .unwrap();

        let history = StatusLedger::get(&mut conn, &[a, b]).await.unwrap();
        let seqs: Vec<i64> = history[&a].iter().map(|r| r.seq_num).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(history[&b].len(), 1);
        assert_eq!(history[&b][0].seq_num, 1);
    }

    #[tokio::test]
    async fn test_idem_resolution_and_ordering() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = new_job(&mut conn).await;

        // Appended out of time order on purpose.
        StatusLedger::append(
            &mut conn,
            &[
                record(
                    job,
                    t(10),
                    JobStatusUpdate::default().with_minor("Input staged"),
                ),
                record(
                    job,
                    t(5),
                    JobStatusUpdate::status(JobStatus::Staging)
                        .with_minor("Request sent")
                        .with_source("StagerAgent"),
                ),
                record(job, t(0), JobStatusUpdate::default().with_application("Setup")),
            ],
        )
        .await
        .unwrap();

        let history = &StatusLedger::get(&mut conn, &[job]).await.unwrap()[&job];
        assert_eq!(
            history.iter().map(|r| r.seq_num).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );

        assert_eq!(history[0].status, "Unknown");
        assert_eq!(history[0].minor_status, "Unknown");
        assert_eq!(history[0].application_status, "Setup");
        assert_eq!(history[0].source, "Unknown");

        assert_eq!(history[1].status, "Staging");
        assert_eq!(history[1].application_status, "Setup");
        assert_eq!(history[1].source, "StagerAgent");

        assert_eq!(history[2].status, "Staging");
        assert_eq!(history[2].minor_status, "Input staged");
        assert_eq!(history[2].status_time, t(10));
    }

    #[tokio::test]
    async fn test_same_time_orders_by_seq_num() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = new_job(&mut conn).await;
        StatusLedger::append(
            &mut conn,
            &[
                record(job, t(1), JobStatusUpdate::status(JobStatus::Received)),
                record(job, t(1), JobStatusUpdate::status(JobStatus::Checking)),
            ],
        )
        .await
        .unwrap();

        let history = &StatusLedger::get(&mut conn, &[job]).await.unwrap()[&job];
        assert_eq!(history[0].status, "Received");
        assert_eq!(history[1].status, "Checking");
    }

    #[tokio::test]
    async fn test_millisecond_ordering() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = new_job(&mut conn).await;
        StatusLedger::append(
            &mut conn,
            &[
                record(
                    job,
                    t(1) + Duration::milliseconds(500),
                    JobStatusUpdate::status(JobStatus::Running),
                ),
                record(
                    job,
                    t(1) + Duration::milliseconds(200),
                    JobStatusUpdate::status(JobStatus::Matched),
                ),
            ],
        )
        .await
        .unwrap();

        let history = &StatusLedger::get(&mut conn, &[job]).await.unwrap()[&job];
        assert_eq!(history[0].status, "Matched");
        assert_eq!(history[1].status_time, t(1) + Duration::milliseconds(500));
    }

    #[tokio::test]
    async fn test_wms_time_stamps_last_write_wins() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = new_job(&mut conn).await;
        StatusLedger::append(
            &mut conn,
            &[
                record(job, t(0), JobStatusUpdate::status(JobStatus::Received)),
                record(job, t(5), JobStatusUpdate::status(JobStatus::Waiting)),
                record(job, t(6), JobStatusUpdate::default().with_minor("Pilot")),
                record(job, t(3), JobStatusUpdate::status(JobStatus::Waiting)),
            ],
        )
        .await
        .unwrap();

        let stamps = &StatusLedger::wms_time_stamps(&mut conn, &[job]).await.unwrap()[&job];
        assert_eq!(stamps.len(), 2);
        assert_eq!(stamps[&JobStatus::Received], 1_700_000_000.0);
        assert_eq!(stamps[&JobStatus::Waiting], 1_700_000_003.0);
    }

    #[tokio::test]
    async fn test_delete() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = new_job(&mut conn).await;
        StatusLedger::append(
            &mut conn,
            &[record(job, t(0), JobStatusUpdate::status(JobStatus::Received))],
        )
        .await
        .unwrap();

        assert_eq!(StatusLedger::delete(&mut conn, &[job]).await.unwrap(), 1);
        assert!(StatusLedger::get(&mut conn, &[job]).await.unwrap().is_empty());
    }
}
