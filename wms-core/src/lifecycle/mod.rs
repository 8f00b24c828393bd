//! Lifecycle orchestrator.
//!
//! [`JobLifecycle`] sequences the three stores for every multi-job
//! operation. Each write operation runs in one `BEGIN IMMEDIATE` transaction
//! on the write pool. Per-job failures are collected into
//! [`BulkResult::failed`] and never abort the rest of the batch.
//!
//! Emptied task queues are cleaned up after the triggering transaction has
//! committed, either inline in a follow-up transaction or through a
//! background [`BatchWriter`], depending on [`DeferredCleanup`].

mod removal;
mod reschedule;
mod status;
mod submission;

pub use reschedule::RescheduleOutcome;
pub use status::{StatusChangeRequest, StatusChanges, StatusOutcome};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::Result;
use crate::config::{DeferredCleanup, WmsConfig};
use crate::database::models::job::{JobCommand, JobRow, JobStatusInfo};
use crate::database::models::ledger::StatusRecord;
use crate::database::models::search::{SearchFilter, SearchParams, SearchResult};
use crate::database::models::task_queue::{TaskQueueInfo, TaskQueueOwner};
use crate::database::repositories::{JobStore, StatusLedger, TaskQueueStore};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{BatchWriter, BatchWriterConfig, Pools, WritePool, begin_immediate};
use crate::domain::decision::{StateMachineDecider, StatusDecider};
use crate::domain::jdl::{DescriptionCompiler, JdlCompiler};
use crate::domain::priority::{PriorityCalculator, ShareProportionalCalculator};
use crate::domain::sandbox::{LoggingSandboxUnassigner, SandboxUnassigner};

/// Source recorded on ledger entries written by the orchestrator itself.
pub const JOB_MANAGER_SOURCE: &str = "JobManager";

/// Outcome of a bulk operation: per-job values and per-job failure reasons.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkResult<T> {
    pub success: BTreeMap<i64, T>,
    pub failed: BTreeMap<i64, String>,
}

impl<T> Default for BulkResult<T> {
    fn default() -> Self {
        Self {
            success: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }
}

impl<T> BulkResult<T> {
    pub(crate) fn fail(&mut self, job_id: i64, reason: impl Into<String>) {
        self.success.remove(&job_id);
        self.failed.insert(job_id, reason.into());
    }
}

/// What the deferred task-queue cleanup needs, shared with the batch writer.
struct CleanupContext {
    write: WritePool,
    config: Arc<WmsConfig>,
    calculator: Arc<dyn PriorityCalculator>,
}

/// Delete the given queues if they are now empty, in a fresh transaction.
async fn run_cleanup(ctx: &CleanupContext, queues: &BTreeSet<TaskQueueOwner>) -> Result<()> {
    if queues.is_empty() {
        return Ok(());
    }
    retry_on_sqlite_busy("task_queue_cleanup", move || async move {
        let mut tx = begin_immediate(&ctx.write).await?;
        let result = async {
            let mut deleted = 0usize;
            for queue in queues {
                let policy = ctx.config.group_policy(&queue.vo, &queue.owner_group);
                if TaskQueueStore::delete_if_empty(
                    &mut tx,
                    queue.tq_id,
                    &queue.owner,
                    &queue.owner_group,
                    &policy,
                    ctx.calculator.as_ref(),
                )
                .await?
                {
                    deleted += 1;
                }
            }
            Ok::<_, crate::Error>(deleted)
        }
        .await;
        let deleted = tx.finish(result).await?;
        debug!(checked = queues.len(), deleted, "Task queue cleanup done");
        Ok(())
    })
    .await
}

/// Builder for [`JobLifecycle`]; every collaborator has a default.
pub struct JobLifecycleBuilder {
    pools: Pools,
    config: Arc<WmsConfig>,
    compiler: Arc<dyn DescriptionCompiler>,
    decider: Arc<dyn StatusDecider>,
    calculator: Arc<dyn PriorityCalculator>,
    sandbox: Arc<dyn SandboxUnassigner>,
    cleanup_batch: BatchWriterConfig,
}

impl JobLifecycleBuilder {
    pub fn compiler(mut self, compiler: Arc<dyn DescriptionCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn decider(mut self, decider: Arc<dyn StatusDecider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn calculator(mut self, calculator: Arc<dyn PriorityCalculator>) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxUnassigner>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Buffering of the background cleanup writer.
    pub fn cleanup_batch(mut self, config: BatchWriterConfig) -> Self {
        self.cleanup_batch = config;
        self
    }

    /// Build the orchestrator. In background cleanup mode this spawns the
    /// cleanup task, so it must run inside a tokio runtime.
    pub fn build(self) -> JobLifecycle {
        let cleanup = Arc::new(CleanupContext {
            write: self.pools.write.clone(),
            config: self.config.clone(),
            calculator: self.calculator.clone(),
        });

        let cleanup_writer = match self.config.deferred_cleanup {
            DeferredCleanup::Inline => None,
            DeferredCleanup::Background => {
                let ctx = cleanup.clone();
                Some(BatchWriter::new(
                    self.cleanup_batch,
                    move |items: Vec<TaskQueueOwner>| {
                        let ctx = ctx.clone();
                        async move {
                            let queues: BTreeSet<_> = items.into_iter().collect();
                            run_cleanup(&ctx, &queues).await
                        }
                    },
                ))
            }
        };

        JobLifecycle {
            pools: self.pools,
            config: self.config,
            compiler: self.compiler,
            decider: self.decider,
            sandbox: self.sandbox,
            cleanup,
            cleanup_writer,
        }
    }
}

/// Orchestrates job submission, status changes, rescheduling and removal.
pub struct JobLifecycle {
    pools: Pools,
    config: Arc<WmsConfig>,
    compiler: Arc<dyn DescriptionCompiler>,
    decider: Arc<dyn StatusDecider>,
    sandbox: Arc<dyn SandboxUnassigner>,
    cleanup: Arc<CleanupContext>,
    cleanup_writer: Option<BatchWriter<TaskQueueOwner>>,
}

impl JobLifecycle {
    pub fn builder(pools: Pools, config: WmsConfig) -> JobLifecycleBuilder {
        JobLifecycleBuilder {
            pools,
            config: Arc::new(config),
            compiler: Arc::new(JdlCompiler),
            decider: Arc::new(StateMachineDecider),
            calculator: Arc::new(ShareProportionalCalculator),
            sandbox: Arc::new(LoggingSandboxUnassigner),
            cleanup_batch: BatchWriterConfig::default(),
        }
    }

    /// Orchestrator with the default collaborators.
    pub fn new(pools: Pools, config: WmsConfig) -> Self {
        Self::builder(pools, config).build()
    }

    pub fn config(&self) -> &WmsConfig {
        &self.config
    }

    pub(crate) fn calculator(&self) -> &dyn PriorityCalculator {
        self.cleanup.calculator.as_ref()
    }

    /// Hand emptied-queue candidates to the deferred cleanup. Failures are
    /// logged; the triggering operation has already committed.
    async fn schedule_cleanup(&self, queues: BTreeSet<TaskQueueOwner>) {
        if queues.is_empty() {
            return;
        }
        match &self.cleanup_writer {
            Some(writer) => {
                for queue in queues {
                    let tq_id = queue.tq_id;
                    if let Err(e) = writer.add(queue).await {
                        warn!(tq_id, error = %e, "Failed to queue task queue cleanup");
                    }
                }
            }
            None => {
                if let Err(e) = run_cleanup(&self.cleanup, &queues).await {
                    warn!(error = %e, "Task queue cleanup failed");
                }
            }
        }
    }

    /// Flush pending background cleanup and stop the writer.
    pub async fn shutdown(self) {
        if let Some(writer) = self.cleanup_writer {
            writer.shutdown().await;
        }
    }

    // ----- read pass-throughs -------------------------------------------

    pub async fn search(&self, params: &SearchParams) -> Result<SearchResult> {
        let mut conn = self.pools.read.acquire().await?;
        JobStore::search(&mut conn, params).await
    }

    /// Search, with the status history of every returned job attached.
    ///
    /// Rows are matched to histories through their `JobID` column, so the
    /// column list must include it for any history to be returned.
    pub async fn search_with_history(
        &self,
        params: &SearchParams,
    ) -> Result<(SearchResult, BTreeMap<i64, Vec<StatusRecord>>)> {
        let mut conn = self.pools.read.acquire().await?;
        let result = JobStore::search(&mut conn, params).await?;
        let job_ids: Vec<i64> = result
            .rows
            .iter()
            .filter_map(|row| row.get("JobID").and_then(|v| v.as_i64()))
            .collect();
        let history = StatusLedger::get(&mut conn, &job_ids).await?;
        Ok((result, history))
    }

    pub async fn summary(
        &self,
        group_by: &[String],
        filters: &[SearchFilter],
    ) -> Result<Vec<JobRow>> {
        let mut conn = self.pools.read.acquire().await?;
        JobStore::summary(&mut conn, group_by, filters).await
    }

    pub async fn get_status(&self, job_id: i64) -> Result<JobStatusInfo> {
        let mut conn = self.pools.read.acquire().await?;
        JobStore::get_status(&mut conn, job_id).await
    }

    pub async fn job_history(&self, job_ids: &[i64]) -> Result<BTreeMap<i64, Vec<StatusRecord>>> {
        let mut conn = self.pools.read.acquire().await?;
        StatusLedger::get(&mut conn, job_ids).await
    }

    pub async fn retrieve_task_queues(
        &self,
        tq_ids: Option<&[i64]>,
    ) -> Result<BTreeMap<i64, TaskQueueInfo>> {
        let mut conn = self.pools.read.acquire().await?;
        TaskQueueStore::retrieve(&mut conn, tq_ids).await
    }

    // ----- mailbox and heartbeats ---------------------------------------

    pub async fn command(&self, job_id: i64, command: &str, arguments: &str) -> Result<()> {
        let mut tx = begin_immediate(&self.pools.write).await?;
        let result = JobStore::command(&mut tx, job_id, command, arguments).await;
        tx.finish(result).await
    }

    pub async fn take_commands(&self, job_ids: &[i64]) -> Result<Vec<JobCommand>> {
        let mut tx = begin_immediate(&self.pools.write).await?;
        let result = JobStore::take_commands(&mut tx, job_ids).await;
        tx.finish(result).await
    }

    pub async fn add_heartbeat_data(
        &self,
        job_id: i64,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut tx = begin_immediate(&self.pools.write).await?;
        let result = JobStore::add_heartbeat_data(&mut tx, job_id, data).await;
        tx.finish(result).await
    }
}
