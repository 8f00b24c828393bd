//! Task queue store: buckets of waiting jobs with identical scheduling
//! requirements, and the fair-share priorities across them.

use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use std::collections::{BTreeMap, BTreeSet};
use strum::IntoEnumIterator;
use tracing::{debug, info};

use crate::config::GroupPolicy;
use crate::database::models::task_queue::{
    Criterion, TaskQueueCriteria, TaskQueueDefinition, TaskQueueInfo, TaskQueueOwner, TaskQueueRow,
};
use crate::domain::priority::{PriorityCalculator, TQ_MIN_SHARE};
use crate::{Error, Result};

/// Highest job priority inside a queue.
pub const MAX_JOB_PRIORITY: i64 = 10;

#[derive(FromRow)]
struct QueueRow {
    tq_id: i64,
    owner: String,
    owner_group: String,
    vo: String,
    cpu_time: i64,
    priority: f64,
    enabled: i64,
}

/// Task queue store operations.
pub struct TaskQueueStore;

impl TaskQueueStore {
    /// Distinct queues (with ownership) containing any of `job_ids`.
    pub async fn tq_infos_for_jobs(
        conn: &mut SqliteConnection,
        job_ids: &[i64],
    ) -> Result<BTreeSet<TaskQueueOwner>> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT q.tq_id, q.owner, q.owner_group, q.vo
            FROM tq_task_queues q JOIN tq_jobs j ON j.tq_id = q.tq_id
            WHERE j.job_id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(serde_json::to_string(job_ids)?)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(tq_id, owner, owner_group, vo)| TaskQueueOwner {
                tq_id,
                owner,
                owner_group,
                vo,
            })
            .collect())
    }

    /// Remove jobs from whatever queues hold them.
    pub async fn remove_jobs(conn: &mut SqliteConnection, job_ids: &[i64]) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM tq_jobs WHERE job_id IN (SELECT value FROM json_each(?))")
                .bind(serde_json::to_string(job_ids)?)
                .execute(&mut *conn)
                .await?;
        Ok(result.rows_affected())
    }

    /// Enabled and without members. A queue that does not exist is not empty.
    pub async fn is_empty(conn: &mut SqliteConnection, tq_id: i64) -> Result<bool> {
        let empty: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT q.tq_id FROM tq_task_queues q
            WHERE q.tq_id = ? AND q.enabled >= 1
              AND NOT EXISTS (SELECT 1 FROM tq_jobs j WHERE j.tq_id = q.tq_id)
            "#,
        )
        .bind(tq_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(empty.is_some())
    }

    /// Delete a queue if it is empty, then rebalance its owner's shares.
    ///
    /// Returns whether the queue was deleted. Calling it again for the same
    /// queue is a no-op returning `false`.
    pub async fn delete_if_empty(
        conn: &mut SqliteConnection,
        tq_id: i64,
        owner: &str,
        owner_group: &str,
        policy: &GroupPolicy,
        calculator: &dyn PriorityCalculator,
    ) -> Result<bool> {
        if !Self::is_empty(conn, tq_id).await? {
            return Ok(false);
        }
        sqlx::query("DELETE FROM tq_task_queues WHERE tq_id = ?")
            .bind(tq_id)
            .execute(&mut *conn)
            .await?;
        info!(tq_id, owner, owner_group, "Deleted empty task queue");

        Self::recalculate_shares(conn, owner, owner_group, policy, calculator).await?;
        Ok(true)
    }

    /// Queue count per owner within a group.
    pub async fn owners_by_group(
        conn: &mut SqliteConnection,
        owner_group: &str,
    ) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT owner, COUNT(*) FROM tq_task_queues WHERE owner_group = ? GROUP BY owner",
        )
        .bind(owner_group)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn owner_for_task_queue(
        conn: &mut SqliteConnection,
        tq_id: i64,
    ) -> Result<TaskQueueOwner> {
        let (owner, owner_group, vo): (String, String, String) = sqlx::query_as(
            "SELECT owner, owner_group, vo FROM tq_task_queues WHERE tq_id = ?",
        )
        .bind(tq_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("TaskQueue", tq_id))?;
        Ok(TaskQueueOwner {
            tq_id,
            owner,
            owner_group,
            vo,
        })
    }

    /// Rebalance the shares of `owner_group` after `owner`'s queues changed.
    ///
    /// With the JobSharing property the whole group splits one share.
    /// Otherwise every owner gets `job_share / owners`; only the acting owner
    /// is recomputed when it has several queues, otherwise all owners are.
    pub async fn recalculate_shares(
        conn: &mut SqliteConnection,
        owner: &str,
        owner_group: &str,
        policy: &GroupPolicy,
        calculator: &dyn PriorityCalculator,
    ) -> Result<()> {
        if policy.job_sharing() {
            return Self::set_priorities_for_entity(
                conn,
                owner_group,
                None,
                policy.job_share,
                policy.allow_background_tqs,
                calculator,
            )
            .await;
        }

        let owners = Self::owners_by_group(conn, owner_group).await?;
        if owners.is_empty() {
            return Ok(());
        }
        // TODO: apply a SharesCorrector here once per-owner usage accounting
        // is available; the flag is carried but has no effect yet.
        if policy.enable_shares_correction {
            debug!(owner_group, "Shares correction requested but not available");
        }
        let share = policy.job_share / owners.len() as f64;

        match owners.get(owner) {
            Some(&count) if count > 1 => {
                Self::set_priorities_for_entity(
                    conn,
                    owner_group,
                    Some(owner),
                    share,
                    policy.allow_background_tqs,
                    calculator,
                )
                .await
            }
            _ => {
                for entity in owners.keys() {
                    Self::set_priorities_for_entity(
                        conn,
                        owner_group,
                        Some(entity),
                        share,
                        policy.allow_background_tqs,
                        calculator,
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    /// Average RealPriority of the members of each non-empty queue.
    pub async fn task_queue_priorities(
        conn: &mut SqliteConnection,
        owner_group: &str,
        owner: Option<&str>,
    ) -> Result<BTreeMap<i64, f64>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT q.tq_id, AVG(j.real_priority) FROM tq_task_queues q \
             JOIN tq_jobs j ON j.tq_id = q.tq_id WHERE q.owner_group = ",
        );
        qb.push_bind(owner_group.to_string());
        if let Some(owner) = owner {
            qb.push(" AND q.owner = ").push_bind(owner.to_string());
        }
        qb.push(" GROUP BY q.tq_id");

        let rows: Vec<(i64, f64)> = qb.build_query_as().fetch_all(&mut *conn).await?;
        Ok(rows.into_iter().collect())
    }

    /// Recompute and store the priorities of one entity's queues: a single
    /// owner, or the whole group when `owner` is `None`.
    pub async fn set_priorities_for_entity(
        conn: &mut SqliteConnection,
        owner_group: &str,
        owner: Option<&str>,
        share: f64,
        allow_background: bool,
        calculator: &dyn PriorityCalculator,
    ) -> Result<()> {
        let averages = Self::task_queue_priorities(conn, owner_group, owner).await?;
        if averages.is_empty() {
            return Ok(());
        }

        let tq_ids: Vec<i64> = averages.keys().copied().collect();
        let rows = Self::load_rows(conn, Some(&tq_ids)).await?;
        let groups = calculator.compute(&averages, &rows, share, allow_background);

        for (priority, ids) in &groups {
            sqlx::query(
                "UPDATE tq_task_queues SET priority = ? WHERE tq_id IN (SELECT value FROM json_each(?))",
            )
            .bind(*priority)
            .bind(serde_json::to_string(ids)?)
            .execute(&mut *conn)
            .await?;
        }
        debug!(
            owner_group,
            owner = owner.unwrap_or("*"),
            share,
            queues = tq_ids.len(),
            "Updated task queue priorities"
        );
        Ok(())
    }

    async fn load_criteria(
        conn: &mut SqliteConnection,
        tq_ids: &[i64],
    ) -> Result<BTreeMap<i64, TaskQueueCriteria>> {
        let ids = serde_json::to_string(tq_ids)?;
        let mut result: BTreeMap<i64, TaskQueueCriteria> = BTreeMap::new();
        for criterion in Criterion::iter() {
            let rows: Vec<(i64, String)> = sqlx::query_as(&format!(
                "SELECT tq_id, value FROM {} WHERE tq_id IN (SELECT value FROM json_each(?))",
                criterion.table()
            ))
            .bind(&ids)
            .fetch_all(&mut *conn)
            .await?;
            for (tq_id, value) in rows {
                result.entry(tq_id).or_default().get_mut(criterion).insert(value);
            }
        }
        Ok(result)
    }

    /// Queue rows with their criteria; all queues when `tq_ids` is `None`.
    async fn load_rows(
        conn: &mut SqliteConnection,
        tq_ids: Option<&[i64]>,
    ) -> Result<Vec<TaskQueueRow>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT tq_id, owner, owner_group, vo, cpu_time, priority, enabled FROM tq_task_queues",
        );
        if let Some(ids) = tq_ids {
            qb.push(" WHERE tq_id IN (SELECT value FROM json_each(")
                .push_bind(serde_json::to_string(ids)?)
                .push("))");
        }
        qb.push(" ORDER BY tq_id");
        let rows: Vec<QueueRow> = qb.build_query_as().fetch_all(&mut *conn).await?;

        let ids: Vec<i64> = rows.iter().map(|r| r.tq_id).collect();
        let mut criteria = Self::load_criteria(conn, &ids).await?;

        Ok(rows
            .into_iter()
            .map(|r| TaskQueueRow {
                criteria: criteria.remove(&r.tq_id).unwrap_or_default(),
                tq_id: r.tq_id,
                owner: r.owner,
                owner_group: r.owner_group,
                vo: r.vo,
                cpu_time: r.cpu_time,
                priority: r.priority,
                enabled: r.enabled >= 1,
            })
            .collect())
    }

    /// Queues with their member counts; all queues when `tq_ids` is `None`.
    pub async fn retrieve(
        conn: &mut SqliteConnection,
        tq_ids: Option<&[i64]>,
    ) -> Result<BTreeMap<i64, TaskQueueInfo>> {
        if tq_ids.is_some_and(|ids| ids.is_empty()) {
            return Ok(BTreeMap::new());
        }
        let rows = Self::load_rows(conn, tq_ids).await?;
        let counts: Vec<(i64, i64)> =
            sqlx::query_as("SELECT tq_id, COUNT(*) FROM tq_jobs GROUP BY tq_id")
                .fetch_all(&mut *conn)
                .await?;
        let counts: BTreeMap<i64, i64> = counts.into_iter().collect();

        Ok(rows
            .into_iter()
            .map(|row| {
                let job_count = counts.get(&row.tq_id).copied().unwrap_or(0);
                (row.tq_id, TaskQueueInfo { row, job_count })
            })
            .collect())
    }

    /// Existing queue with exactly this definition.
    pub async fn find_task_queue(
        conn: &mut SqliteConnection,
        definition: &TaskQueueDefinition,
    ) -> Result<Option<i64>> {
        let candidates: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT tq_id FROM tq_task_queues
            WHERE owner = ? AND owner_group = ? AND vo = ? AND cpu_time = ?
            ORDER BY tq_id
            "#,
        )
        .bind(&definition.owner)
        .bind(&definition.owner_group)
        .bind(&definition.vo)
        .bind(definition.cpu_time)
        .fetch_all(&mut *conn)
        .await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let criteria = Self::load_criteria(conn, &candidates).await?;
        let empty = TaskQueueCriteria::default();
        Ok(candidates
            .into_iter()
            .find(|tq_id| criteria.get(tq_id).unwrap_or(&empty) == &definition.criteria))
    }

    async fn create_task_queue(
        conn: &mut SqliteConnection,
        definition: &TaskQueueDefinition,
    ) -> Result<i64> {
        let tq_id = sqlx::query(
            r#"
            INSERT INTO tq_task_queues (owner, owner_group, vo, cpu_time, priority, enabled)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&definition.owner)
        .bind(&definition.owner_group)
        .bind(&definition.vo)
        .bind(definition.cpu_time)
        .bind(TQ_MIN_SHARE)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        for criterion in Criterion::iter() {
            for value in definition.criteria.get(criterion) {
                sqlx::query(&format!(
                    "INSERT INTO {} (tq_id, value) VALUES (?, ?)",
                    criterion.table()
                ))
                .bind(tq_id)
                .bind(value)
                .execute(&mut *conn)
                .await?;
            }
        }
        info!(tq_id, owner = %definition.owner, owner_group = %definition.owner_group, "Created task queue");
        Ok(tq_id)
    }

    /// Place a job in the queue matching `definition`, creating the queue if
    /// needed, and rebalance the owner's shares. Returns the queue id.
    pub async fn insert_job(
        conn: &mut SqliteConnection,
        job_id: i64,
        definition: &TaskQueueDefinition,
        user_priority: i64,
        policy: &GroupPolicy,
        calculator: &dyn PriorityCalculator,
    ) -> Result<i64> {
        let tq_id = match Self::find_task_queue(conn, definition).await? {
            Some(tq_id) => tq_id,
            None => Self::create_task_queue(conn, definition).await?,
        };

        let priority = user_priority.clamp(0, MAX_JOB_PRIORITY);
        let real_priority = (user_priority as f64).clamp(TQ_MIN_SHARE, MAX_JOB_PRIORITY as f64);
        sqlx::query(
            "INSERT OR REPLACE INTO tq_jobs (tq_id, job_id, priority, real_priority) VALUES (?, ?, ?, ?)",
        )
        .bind(tq_id)
        .bind(job_id)
        .bind(priority)
        .bind(real_priority)
        .execute(&mut *conn)
        .await?;
        sqlx::query("UPDATE tq_task_queues SET enabled = 1 WHERE tq_id = ? AND enabled = 0")
            .bind(tq_id)
            .execute(&mut *conn)
            .await?;

        Self::recalculate_shares(
            conn,
            &definition.owner,
            &definition.owner_group,
            policy,
            calculator,
        )
        .await?;
        debug!(job_id, tq_id, priority, "Job queued");
        Ok(tq_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JOB_SHARING;
    use crate::database::test_pool;
    use crate::domain::priority::ShareProportionalCalculator;

    async fn new_job(conn: &mut SqliteConnection) -> i64 {
        let job_id = sqlx::query("INSERT INTO job_jdls (original_jdl) VALUES ('[]')")
            .execute(&mut *conn)
            .await
            .unwrap()
            .last_insert_rowid();
        sqlx::query("INSERT INTO jobs (job_id) VALUES (?)")
            .bind(job_id)
            .execute(&mut *conn)
            .await
            .unwrap();
        job_id
    }

    fn definition(owner: &str, cpu_time: i64, sites: &[&str]) -> TaskQueueDefinition {
        TaskQueueDefinition {
            owner: owner.into(),
            owner_group: "user".into(),
            vo: "vo".into(),
            cpu_time,
            criteria: TaskQueueCriteria {
                sites: sites.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    fn policy(job_share: f64) -> GroupPolicy {
        GroupPolicy {
            job_share,
            ..Default::default()
        }
    }

    async fn insert(
        conn: &mut SqliteConnection,
        def: &TaskQueueDefinition,
        policy: &GroupPolicy,
    ) -> (i64, i64) {
        let job = new_job(conn).await;
        let tq = TaskQueueStore::insert_job(conn, job, def, 1, policy, &ShareProportionalCalculator)
            .await
            .unwrap();
        (job, tq)
    }

    #[tokio::test]
    async fn test_identical_definitions_share_a_queue() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let p = policy(100.0);

        let (_, tq1) = insert(&mut conn, &definition("alice", 100, &["A"]), &p).await;
        let (_, tq2) = insert(&mut conn, &definition("alice", 100, &["A"]), &p).await;
        let (_, tq3) = insert(&mut conn, &definition("alice", 100, &["B"]), &p).await;
        assert_eq!(tq1, tq2);
        assert_ne!(tq1, tq3);

        let queues = TaskQueueStore::retrieve(&mut conn, None).await.unwrap();
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[&tq1].job_count, 2);
        assert!(queues[&tq1].row.enabled);
        assert!(queues[&tq1].row.criteria.sites.contains("A"));
    }

    #[tokio::test]
    async fn test_job_priority_is_clamped() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let job = new_job(&mut conn).await;
        TaskQueueStore::insert_job(
            &mut conn,
            job,
            &definition("alice", 100, &[]),
            0,
            &policy(100.0),
            &ShareProportionalCalculator,
        )
        .await
        .unwrap();

        let (priority, real): (i64, f64) =
            sqlx::query_as("SELECT priority, real_priority FROM tq_jobs WHERE job_id = ?")
                .bind(job)
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(priority, 0);
        assert_eq!(real, TQ_MIN_SHARE);
    }

    #[tokio::test]
    async fn test_delete_if_empty_is_idempotent() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let p = policy(100.0);
        let (job, tq) = insert(&mut conn, &definition("alice", 100, &[]), &p).await;

        let calc = ShareProportionalCalculator;
        assert!(
            !TaskQueueStore::delete_if_empty(&mut conn, tq, "alice", "user", &p, &calc)
                .await
                .unwrap()
        );

        let owners = TaskQueueStore::tq_infos_for_jobs(&mut conn, &[job]).await.unwrap();
        assert_eq!(owners.len(), 1);
        TaskQueueStore::remove_jobs(&mut conn, &[job]).await.unwrap();

        assert!(
            TaskQueueStore::delete_if_empty(&mut conn, tq, "alice", "user", &p, &calc)
                .await
                .unwrap()
        );
        assert!(
            !TaskQueueStore::delete_if_empty(&mut conn, tq, "alice", "user", &p, &calc)
                .await
                .unwrap()
        );
        assert!(TaskQueueStore::retrieve(&mut conn, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_queue_is_not_deleted() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        sqlx::query(
            "INSERT INTO tq_task_queues (owner, owner_group, vo, cpu_time, priority) VALUES ('a', 'user', 'vo', 100, 1.0)",
        )
        .execute(&mut *conn)
        .await
        .unwrap();
        assert!(!TaskQueueStore::is_empty(&mut conn, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_shares_split_between_owners() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let p = policy(100.0);

        let (_, alice_tq) = insert(&mut conn, &definition("alice", 100, &[]), &p).await;
        let queues = TaskQueueStore::retrieve(&mut conn, Some(&[alice_tq])).await.unwrap();
        assert!((queues[&alice_tq].row.priority - 100.0).abs() < 1e-9);

        let (_, bob_tq) = insert(&mut conn, &definition("bob", 100, &[]), &p).await;
        let queues = TaskQueueStore::retrieve(&mut conn, None).await.unwrap();
        assert!((queues[&alice_tq].row.priority - 50.0).abs() < 1e-9);
        assert!((queues[&bob_tq].row.priority - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_removing_an_owner_rebalances_the_rest() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let p = policy(100.0);
        let calc = ShareProportionalCalculator;

        let (_, alice_tq) = insert(&mut conn, &definition("alice", 100, &[]), &p).await;
        let (_, bob_tq) = insert(&mut conn, &definition("bob", 100, &[]), &p).await;
        let (carol_job, carol_tq) = insert(&mut conn, &definition("carol", 100, &[]), &p).await;

        let queues = TaskQueueStore::retrieve(&mut conn, None).await.unwrap();
        for tq in [alice_tq, bob_tq, carol_tq] {
            assert!((queues[&tq].row.priority - 100.0 / 3.0).abs() < 1e-9);
        }

        TaskQueueStore::remove_jobs(&mut conn, &[carol_job]).await.unwrap();
        assert!(
            TaskQueueStore::delete_if_empty(&mut conn, carol_tq, "carol", "user", &p, &calc)
                .await
                .unwrap()
        );

        let queues = TaskQueueStore::retrieve(&mut conn, None).await.unwrap();
        assert!(!queues.contains_key(&carol_tq));
        assert!((queues[&alice_tq].row.priority - 50.0).abs() < 1e-9);
        assert!((queues[&bob_tq].row.priority - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_job_sharing_pools_the_group() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let p = GroupPolicy {
            job_share: 90.0,
            properties: vec![JOB_SHARING.to_string()],
            ..Default::default()
        };

        let mut tqs = Vec::new();
        for (owner, cpu) in [("alice", 100), ("bob", 200), ("carol", 300)] {
            tqs.push(insert(&mut conn, &definition(owner, cpu, &[]), &p).await.1);
        }
        let queues = TaskQueueStore::retrieve(&mut conn, None).await.unwrap();
        for tq in tqs {
            assert!((queues[&tq].row.priority - 30.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_owners_and_priorities() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let p = policy(100.0);
        let (_, tq) = insert(&mut conn, &definition("alice", 100, &[]), &p).await;
        insert(&mut conn, &definition("alice", 200, &[]), &p).await;

        let owners = TaskQueueStore::owners_by_group(&mut conn, "user").await.unwrap();
        assert_eq!(owners["alice"], 2);

        let owner = TaskQueueStore::owner_for_task_queue(&mut conn, tq).await.unwrap();
        assert_eq!(owner.owner, "alice");
        assert!(matches!(
            TaskQueueStore::owner_for_task_queue(&mut conn, 999).await,
            Err(Error::NotFound { .. })
        ));

        let averages = TaskQueueStore::task_queue_priorities(&mut conn, "user", Some("alice"))
            .await
            .unwrap();
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[&tq], 1.0);
    }
}
