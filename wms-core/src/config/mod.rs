//! Service configuration.
//!
//! Loaded from an optional JSON file (path in `WMS_CONFIG`) with a handful of
//! environment overrides on top. The registry maps VO → group → fair-share
//! policy, which the task-queue store consumes on every share recalculation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{Error, Result};

/// Environment variable holding the path of the JSON config file.
pub const CONFIG_PATH_ENV: &str = "WMS_CONFIG";

pub const DEFAULT_DATABASE_URL: &str = "sqlite:wms.db?mode=rwc";
pub const DEFAULT_MAX_RESCHEDULING: u32 = 3;
pub const DEFAULT_MAX_JOBS_PER_SUBMISSION: usize = 20;
pub const DEFAULT_JOB_SHARE: f64 = 1000.0;

/// Group property that pools the job share across all owners of a group.
pub const JOB_SHARING: &str = "JobSharing";

/// Where task-queue cleanup runs after a kill/delete/reschedule commits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeferredCleanup {
    /// In a follow-up transaction before the call returns.
    #[default]
    Inline,
    /// Queued to a background batch writer.
    Background,
}

/// Fair-share policy of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPolicy {
    pub job_share: f64,
    pub properties: Vec<String>,
    pub allow_background_tqs: bool,
    pub enable_shares_correction: bool,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            job_share: DEFAULT_JOB_SHARE,
            properties: Vec::new(),
            allow_background_tqs: false,
            enable_shares_correction: false,
        }
    }
}

impl GroupPolicy {
    pub fn has_property(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }

    pub fn job_sharing(&self) -> bool {
        self.has_property(JOB_SHARING)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoRegistry {
    pub groups: BTreeMap<String, GroupPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WmsConfig {
    pub database_url: String,
    pub read_pool_size: u32,
    pub max_rescheduling: u32,
    pub max_jobs_per_submission: usize,
    pub deferred_cleanup: DeferredCleanup,
    pub log_dir: Option<String>,
    pub registry: BTreeMap<String, VoRegistry>,
}

impl Default for WmsConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            read_pool_size: crate::database::default_read_pool_size(),
            max_rescheduling: DEFAULT_MAX_RESCHEDULING,
            max_jobs_per_submission: DEFAULT_MAX_JOBS_PER_SUBMISSION,
            deferred_cleanup: DeferredCleanup::default(),
            log_dir: None,
            registry: BTreeMap::new(),
        }
    }
}

impl WmsConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Load from `WMS_CONFIG` (when set) and apply environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(max) = lookup("WMS_MAX_RESCHEDULING") {
            self.max_rescheduling = max.trim().parse().map_err(|_| {
                Error::config(format!("WMS_MAX_RESCHEDULING must be an integer, got '{max}'"))
            })?;
        }
        if let Some(dir) = lookup("WMS_LOG_DIR") {
            self.log_dir = Some(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        if self.read_pool_size == 0 {
            return Err(Error::config("read_pool_size must be at least 1"));
        }
        if self.max_jobs_per_submission == 0 {
            return Err(Error::config("max_jobs_per_submission must be at least 1"));
        }
        for (vo, registry) in &self.registry {
            for (group, policy) in &registry.groups {
                if !policy.job_share.is_finite() || policy.job_share < 0.0 {
                    return Err(Error::config(format!(
                        "job_share of {vo}/{group} must be a non-negative number"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Policy of `group` in `vo`, or the default policy when unregistered.
    pub fn group_policy(&self, vo: &str, group: &str) -> GroupPolicy {
        self.registry
            .get(vo)
            .and_then(|registry| registry.groups.get(group))
            .cloned()
            .unwrap_or_default()
    }
}
