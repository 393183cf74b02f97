use crate::retry::RetryPolicy;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject a configuration that cannot start a run.
    pub fn validate(&self) -> Result<()> {
        self.producer.validate()?;
        self.report.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Topic every message is sent to
    pub topic: String,
    /// Comma-separated name server addresses
    pub name_server: String,
    /// Producer group identifier
    pub group_id: String,
    /// Number of concurrent send loops
    pub instance_count: u32,
    /// Test duration in minutes
    pub test_minutes: u64,
    /// Message body size in bytes
    pub body_size: usize,
    /// Per-send timeout in milliseconds
    pub send_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: "BenchmarkTest".to_string(),
            name_server: String::new(),
            group_id: "benchmark_producer".to_string(),
            instance_count: 1,
            test_minutes: 10,
            body_size: 32,
            send_timeout_ms: 3_000,
        }
    }
}

impl ProducerConfig {
    pub fn name_servers(&self) -> Vec<String> {
        self.name_server
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn test_duration(&self) -> Duration {
        Duration::from_secs(self.test_minutes.saturating_mul(60))
    }

    fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            bail!("empty topic");
        }
        if self.group_id.trim().is_empty() {
            bail!("empty group id");
        }
        if self.name_servers().is_empty() {
            bail!("empty namesrv");
        }
        if self.instance_count == 0 {
            bail!("instance count must be positive integer");
        }
        if self.test_minutes == 0 {
            bail!("test time must be positive integer");
        }
        if self.body_size == 0 {
            bail!("body size must be positive integer");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Period between snapshots of the counters in milliseconds
    pub snapshot_interval_ms: u64,
    /// Period between report lines in milliseconds
    pub report_interval_ms: u64,
    /// Number of snapshots retained for the trailing window
    pub history_capacity: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 1_000,
            report_interval_ms: 10_000,
            history_capacity: crate::stats::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl ReportConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.snapshot_interval_ms == 0 {
            bail!("snapshot interval must be positive");
        }
        if self.report_interval_ms == 0 {
            bail!("report interval must be positive");
        }
        if self.history_capacity < 2 {
            bail!("history capacity must hold at least two snapshots");
        }
        Ok(())
    }
}
