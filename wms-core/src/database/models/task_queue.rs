//! Task queue models.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::jdl::JobDescription;

/// Default CPU time (seconds) of a job that does not request one.
pub const DEFAULT_CPU_TIME: i64 = 86400;

/// One of the six matching-criteria sets of a task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
pub enum Criterion {
    Sites,
    GridCes,
    BannedSites,
    Platforms,
    JobTypes,
    Tags,
}

impl Criterion {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Sites => "tq_to_sites",
            Self::GridCes => "tq_to_grid_ces",
            Self::BannedSites => "tq_to_banned_sites",
            Self::Platforms => "tq_to_platforms",
            Self::JobTypes => "tq_to_job_types",
            Self::Tags => "tq_to_tags",
        }
    }

    /// Attribute of a job description the criterion is read from.
    pub fn description_key(&self) -> &'static str {
        match self {
            Self::Sites => "Site",
            Self::GridCes => "GridCE",
            Self::BannedSites => "BannedSites",
            Self::Platforms => "Platform",
            Self::JobTypes => "JobType",
            Self::Tags => "Tags",
        }
    }
}

/// Matching criteria of a task queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskQueueCriteria {
    pub sites: BTreeSet<String>,
    #[serde(rename = "GridCEs")]
    pub grid_ces: BTreeSet<String>,
    pub banned_sites: BTreeSet<String>,
    pub platforms: BTreeSet<String>,
    pub job_types: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

impl TaskQueueCriteria {
    pub fn get(&self, criterion: Criterion) -> &BTreeSet<String> {
        match criterion {
            Criterion::Sites => &self.sites,
            Criterion::GridCes => &self.grid_ces,
            Criterion::BannedSites => &self.banned_sites,
            Criterion::Platforms => &self.platforms,
            Criterion::JobTypes => &self.job_types,
            Criterion::Tags => &self.tags,
        }
    }

    pub fn get_mut(&mut self, criterion: Criterion) -> &mut BTreeSet<String> {
        match criterion {
            Criterion::Sites => &mut self.sites,
            Criterion::GridCes => &mut self.grid_ces,
            Criterion::BannedSites => &mut self.banned_sites,
            Criterion::Platforms => &mut self.platforms,
            Criterion::JobTypes => &mut self.job_types,
            Criterion::Tags => &mut self.tags,
        }
    }
}

/// Scheduling attributes that decide which bucket a job lands in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueueDefinition {
    pub owner: String,
    pub owner_group: String,
    pub vo: String,
    pub cpu_time: i64,
    pub criteria: TaskQueueCriteria,
}

impl TaskQueueDefinition {
    /// Derive the definition from a compiled job description.
    ///
    /// "ANY" in the site list means no site restriction.
    pub fn from_description(
        description: &JobDescription,
        owner: &str,
        owner_group: &str,
        vo: &str,
    ) -> Self {
        let mut criteria = TaskQueueCriteria::default();
        for criterion in <Criterion as strum::IntoEnumIterator>::iter() {
            let values = description
                .get_list(criterion.description_key())
                .into_iter()
                .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("ANY"));
            criteria.get_mut(criterion).extend(values);
        }

        Self {
            owner: owner.to_string(),
            owner_group: owner_group.to_string(),
            vo: vo.to_string(),
            cpu_time: description.get_int("CPUTime").unwrap_or(DEFAULT_CPU_TIME),
            criteria,
        }
    }
}

/// A `tq_task_queues` row plus its criteria.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskQueueRow {
    #[serde(rename = "TQId")]
    pub tq_id: i64,
    pub owner: String,
    pub owner_group: String,
    #[serde(rename = "VO")]
    pub vo: String,
    #[serde(rename = "CPUTime")]
    pub cpu_time: i64,
    pub priority: f64,
    pub enabled: bool,
    #[serde(flatten)]
    pub criteria: TaskQueueCriteria,
}

/// `retrieve` entry: a task queue with its member count.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskQueueInfo {
    #[serde(flatten)]
    pub row: TaskQueueRow,
    pub job_count: i64,
}

/// Ownership of a task queue, as needed for cleanup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskQueueOwner {
    pub tq_id: i64,
    pub owner: String,
    pub owner_group: String,
    pub vo: String,
}
