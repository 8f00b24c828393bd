//! Status ledger models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::status::JobStatus;

/// A proposed status change. `None` fields mean "unchanged" (idem).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobStatusUpdate {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub minor_status: Option<String>,
    #[serde(default)]
    pub application_status: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl JobStatusUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_minor(mut self, minor: impl Into<String>) -> Self {
        self.minor_status = Some(minor.into());
        self
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application_status = Some(application.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A ledger record to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStatusRecord {
    pub job_id: i64,
    pub status: Option<JobStatus>,
    pub minor_status: Option<String>,
    pub application_status: Option<String>,
    pub date: DateTime<Utc>,
    pub source: String,
}

impl NewStatusRecord {
    /// Record an update verbatim, defaulting a missing source to "Unknown".
    pub fn from_update(job_id: i64, date: DateTime<Utc>, update: &JobStatusUpdate) -> Self {
        Self {
            job_id,
            status: update.status,
            minor_status: update.minor_status.clone(),
            application_status: update.application_status.clone(),
            date,
            source: update
                .source
                .clone()
                .unwrap_or_else(|| crate::domain::status::UNKNOWN.to_string()),
        }
    }
}

/// A ledger record as returned by `get`, with idem fields resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusRecord {
    pub seq_num: i64,
    pub status: String,
    pub minor_status: String,
    pub application_status: String,
    pub status_time: DateTime<Utc>,
    /// Millisecond ordering key.
    pub status_time_order: i64,
    pub source: String,
}
