use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::backoff::BackoffPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub job: JobSettings,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Per-job coordination knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct JobSettings {
    /// Minimum spacing between durable checkpoint writes, in milliseconds.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// Backoff applied to retried store round trips.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_checkpoint_interval_ms() -> u64 {
    5_000
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
