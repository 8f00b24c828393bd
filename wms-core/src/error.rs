//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Illegitimate transition for job {job_id}: cannot go from {from} to {to}")]
    IllegitimateTransition {
        job_id: i64,
        from: String,
        to: String,
    },

    #[error("Job {job_id} is not verified: {detail}")]
    NotVerified { job_id: i64, detail: String },

    #[error("Maximum number of reschedules exceeded ({max}) for job {job_id}")]
    MaxReschedulingExceeded { job_id: i64, max: u32 },

    #[error("All the jobs should update the same set of attributes")]
    ConflictingBulkShape,

    #[error("Error in JDL syntax: {0}")]
    SyntaxError(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::SyntaxError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Short reason used in the `failed` map of bulk results.
    pub fn detail(&self) -> String {
        match self {
            Self::NotFound { .. } => "Not found".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detail_is_stable() {
        let err = Error::not_found("Job", 42);
        assert_eq!(err.detail(), "Not found");
        assert_eq!(err.to_string(), "Entity not found: Job with id 42");
    }

    #[test]
    fn test_max_rescheduling_message() {
        let err = Error::MaxReschedulingExceeded { job_id: 7, max: 3 };
        assert_eq!(
            err.detail(),
            "Maximum number of reschedules exceeded (3) for job 7"
        );
    }
}
