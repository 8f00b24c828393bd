//! Job table models.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::collections::BTreeMap;

use crate::database::time::{from_db_text, to_db_text};
use crate::domain::status::JobStatus;
use crate::{Error, Result};

/// Storage type of a job column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Text,
    DateTime,
    Bool,
}

/// A column of the `jobs` table, addressed by its external name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum JobColumn {
    #[strum(serialize = "JobID")]
    #[serde(rename = "JobID")]
    JobId,
    JobType,
    JobGroup,
    Site,
    JobName,
    Owner,
    OwnerGroup,
    #[strum(serialize = "VO")]
    #[serde(rename = "VO")]
    Vo,
    SubmissionTime,
    RescheduleTime,
    LastUpdateTime,
    StartExecTime,
    HeartBeatTime,
    EndExecTime,
    Status,
    MinorStatus,
    ApplicationStatus,
    UserPriority,
    RescheduleCounter,
    VerifiedFlag,
    AccountedFlag,
}

impl JobColumn {
    /// Resolve an external column name.
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| Error::invalid_query(format!("Unknown job column: {name}")))
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::JobId => "job_id",
            Self::JobType => "job_type",
            Self::JobGroup => "job_group",
            Self::Site => "site",
            Self::JobName => "job_name",
            Self::Owner => "owner",
            Self::OwnerGroup => "owner_group",
            Self::Vo => "vo",
            Self::SubmissionTime => "submission_time",
            Self::RescheduleTime => "reschedule_time",
            Self::LastUpdateTime => "last_update_time",
            Self::StartExecTime => "start_exec_time",
            Self::HeartBeatTime => "heart_beat_time",
            Self::EndExecTime => "end_exec_time",
            Self::Status => "status",
            Self::MinorStatus => "minor_status",
            Self::ApplicationStatus => "application_status",
            Self::UserPriority => "user_priority",
            Self::RescheduleCounter => "reschedule_counter",
            Self::VerifiedFlag => "verified_flag",
            Self::AccountedFlag => "accounted_flag",
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::JobId | Self::UserPriority | Self::RescheduleCounter => ColumnKind::Int,
            Self::SubmissionTime
            | Self::RescheduleTime
            | Self::LastUpdateTime
            | Self::StartExecTime
            | Self::HeartBeatTime
            | Self::EndExecTime => ColumnKind::DateTime,
            Self::VerifiedFlag => ColumnKind::Bool,
            _ => ColumnKind::Text,
        }
    }

    /// Decode column `index` of `row` as a JSON value according to its kind.
    pub(crate) fn decode(&self, row: &SqliteRow, index: usize) -> Result<Value> {
        let value = match self.kind() {
            ColumnKind::Int => row.try_get::<Option<i64>, _>(index)?.map(Value::from),
            ColumnKind::Bool => row.try_get::<Option<bool>, _>(index)?.map(Value::from),
            ColumnKind::Text => row.try_get::<Option<String>, _>(index)?.map(Value::from),
            ColumnKind::DateTime => match row.try_get::<Option<String>, _>(index)? {
                Some(text) => Some(Value::from(
                    from_db_text(&text)?.to_rfc3339_opts(SecondsFormat::Secs, true),
                )),
                None => None,
            },
        };
        Ok(value.unwrap_or(Value::Null))
    }
}

/// A value written into a job column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    DateTime(DateTime<Utc>),
}

impl AttrValue {
    /// Push this value as a bind parameter.
    pub(crate) fn push_bind(&self, qb: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>) {
        match self {
            Self::Null => {
                qb.push_bind(Option::<String>::None);
            }
            Self::Bool(b) => {
                qb.push_bind(*b);
            }
            Self::Int(i) => {
                qb.push_bind(*i);
            }
            Self::Text(s) => {
                qb.push_bind(s.clone());
            }
            Self::DateTime(dt) => {
                qb.push_bind(to_db_text(*dt));
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl From<JobStatus> for AttrValue {
    fn from(value: JobStatus) -> Self {
        Self::Text(value.as_str().to_string())
    }
}

/// A set of column assignments for one job.
pub type JobAttributes = BTreeMap<JobColumn, AttrValue>;

/// One row of the search/summary result, keyed by external column name.
pub type JobRow = Map<String, Value>;

/// Current status triple of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobStatusInfo {
    pub status: JobStatus,
    pub minor_status: String,
    pub application_status: String,
}

/// Typed view of a `jobs` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobRecord {
    #[serde(rename = "JobID")]
    pub job_id: i64,
    pub job_type: String,
    pub job_group: String,
    pub site: String,
    pub job_name: String,
    pub owner: String,
    pub owner_group: String,
    #[serde(rename = "VO")]
    pub vo: String,
    pub submission_time: Option<DateTime<Utc>>,
    pub reschedule_time: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub start_exec_time: Option<DateTime<Utc>>,
    pub heart_beat_time: Option<DateTime<Utc>>,
    pub end_exec_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub minor_status: String,
    pub application_status: String,
    pub user_priority: i64,
    pub reschedule_counter: i64,
    pub verified_flag: bool,
    pub accounted_flag: String,
}

fn optional_time(row: &SqliteRow, column: &str) -> std::result::Result<Option<DateTime<Utc>>, sqlx::Error> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(text) => from_db_text(&text)
            .map(Some)
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: column.to_string(),
                source: Box::new(std::io::Error::other(e.to_string())),
            }),
        None => Ok(None),
    }
}

impl<'r> FromRow<'r, SqliteRow> for JobRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = JobStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(std::io::Error::other(format!("unknown job status {status}"))),
        })?;

        Ok(Self {
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            job_group: row.try_get("job_group")?,
            site: row.try_get("site")?,
            job_name: row.try_get("job_name")?,
            owner: row.try_get("owner")?,
            owner_group: row.try_get("owner_group")?,
            vo: row.try_get("vo")?,
            submission_time: optional_time(row, "submission_time")?,
            reschedule_time: optional_time(row, "reschedule_time")?,
            last_update_time: optional_time(row, "last_update_time")?,
            start_exec_time: optional_time(row, "start_exec_time")?,
            heart_beat_time: optional_time(row, "heart_beat_time")?,
            end_exec_time: optional_time(row, "end_exec_time")?,
            status,
            minor_status: row.try_get("minor_status")?,
            application_status: row.try_get("application_status")?,
            user_priority: row.try_get("user_priority")?,
            reschedule_counter: row.try_get("reschedule_counter")?,
            verified_flag: row.try_get("verified_flag")?,
            accounted_flag: row.try_get("accounted_flag")?,
        })
    }
}

/// Result entry of a job submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InsertedJob {
    #[serde(rename = "JobID")]
    pub job_id: i64,
    pub status: JobStatus,
    pub minor_status: String,
    pub time_stamp: DateTime<Utc>,
}

/// Delivery state of a mailbox command.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum CommandStatus {
    Received,
    Sent,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "Received",
            Self::Sent => "Sent",
        }
    }
}

/// A command waiting in (or delivered from) a job's mailbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobCommand {
    #[serde(rename = "JobID")]
    pub job_id: i64,
    pub command: String,
    pub arguments: String,
}

/// Heartbeat metrics accepted from running jobs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum HeartBeatName {
    LoadAverage,
    MemoryUsed,
    Vsize,
    AvailableDiskSpace,
    #[strum(serialize = "CPUConsumed")]
    #[serde(rename = "CPUConsumed")]
    CpuConsumed,
    WallClockTime,
}

impl HeartBeatName {
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| Error::invalid_query(format!("Invalid heartbeat data name: {name}")))
    }
}
