use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::manager::DEFAULT_MAX_QUEUED_PER_THREAD_PER_CONSUMER;
use crate::queue::overload::DEFAULT_OVERLOAD_COOLDOWN;
use crate::queue::EvictionPolicy;
use crate::save_cache::CLEANUP_CHECK_INTERVAL;
use crate::transport::congestion::INTERVAL as DEFAULT_CONGESTION_INTERVAL;
use crate::transport::receiver::DEFAULT_REASSEMBLY_TIMEOUT;
use crate::transport::sender::{DEFAULT_SEGMENT_SIZE, DEFAULT_TICK_RATE_HZ};

mod budget;
pub use budget::ThreadBudget;

/// Upper bound for the default worker thread count.
const MAX_DEFAULT_THREADS: usize = 8;

pub const DEFAULT_SAVE_DELAY: Duration = Duration::from_millis(4_000);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(5_000);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("thread count must be greater than zero")]
    InvalidThreadCount,
    #[error("failed reading configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Configuration inputs, from the command line, the environment or a file.
///
/// Every field is optional; [`ConfigArgs::build`] fills the gaps from the
/// configuration file and then from the defaults.
#[derive(clap::Parser, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigArgs {
    /// Path to a TOML or JSON configuration file.
    #[arg(long = "config", env = "CHUNKFLOW_CONFIG")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// Worker threads shared by every executor.
    /// Default: available parallelism, clamped to 1-8.
    #[arg(long, env = "CHUNKFLOW_THREAD_COUNT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<usize>,

    /// Outgoing rate cap per connection in KB/s, 0 for unlimited.
    #[arg(long, env = "CHUNKFLOW_PER_CONNECTION_RATE_LIMIT_KBPS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_connection_rate_limit_kbps: Option<u64>,

    /// Outgoing rate cap shared by all connections in KB/s, 0 for unlimited.
    #[arg(long, env = "CHUNKFLOW_GLOBAL_BANDWIDTH_LIMIT_KBPS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_bandwidth_limit_kbps: Option<u64>,

    /// How long merged data may sit in memory before it is saved.
    #[arg(long, env = "CHUNKFLOW_SAVE_DELAY_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_delay_ms: Option<u64>,

    /// Minimum time between two overload warnings.
    #[arg(long, env = "CHUNKFLOW_OVERLOAD_LOG_COOLDOWN_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overload_log_cooldown_ms: Option<u64>,

    /// Queued updates allowed per worker thread and consumer.
    #[arg(long, env = "CHUNKFLOW_MAX_QUEUED_PER_THREAD_PER_CONSUMER")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queued_per_thread_per_consumer: Option<usize>,

    /// Which stage loses an item first when the update queues are full.
    #[arg(long, value_enum, env = "CHUNKFLOW_EVICTION_POLICY")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction_policy: Option<EvictionPolicy>,

    /// Skip updates whose content hash did not change.
    #[arg(long, env = "CHUNKFLOW_CHANGE_DETECTION")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_detection: Option<bool>,

    #[arg(long, hide = true, env = "CHUNKFLOW_SEGMENT_SIZE_BYTES")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_size_bytes: Option<usize>,

    #[arg(long, hide = true, env = "CHUNKFLOW_SENDER_TICK_RATE_HZ")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_tick_rate_hz: Option<u32>,

    #[arg(long, hide = true, env = "CHUNKFLOW_CONGESTION_INTERVAL_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_interval_ms: Option<u64>,

    #[arg(long, hide = true, env = "CHUNKFLOW_REASSEMBLY_TIMEOUT_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reassembly_timeout_ms: Option<u64>,

    /// Time each executor gets to finish running work on shutdown.
    #[arg(long, env = "CHUNKFLOW_SHUTDOWN_GRACE_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,
}

impl ConfigArgs {
    /// Merges the configuration file (if any) under the explicitly set values
    /// and validates the result.
    pub fn build(mut self) -> Result<PipelineConfig, ConfigError> {
        if let Some(path) = self.config_path.clone() {
            let file = Self::read_config(&path)?;
            self.merge(file);
        }

        let defaults = PipelineConfig::default();
        let thread_count = self.thread_count.unwrap_or(defaults.thread_count);
        if thread_count == 0 {
            return Err(ConfigError::InvalidThreadCount);
        }

        let config = PipelineConfig {
            thread_count,
            per_connection_rate_limit_kbps: self
                .per_connection_rate_limit_kbps
                .unwrap_or(defaults.per_connection_rate_limit_kbps),
            global_bandwidth_limit_kbps: self
                .global_bandwidth_limit_kbps
                .unwrap_or(defaults.global_bandwidth_limit_kbps),
            save_delay: self
                .save_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.save_delay),
            overload_log_cooldown: self
                .overload_log_cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.overload_log_cooldown),
            max_queued_per_thread_per_consumer: self
                .max_queued_per_thread_per_consumer
                .unwrap_or(defaults.max_queued_per_thread_per_consumer)
                .max(1),
            eviction_policy: self.eviction_policy.unwrap_or(defaults.eviction_policy),
            change_detection: self.change_detection.unwrap_or(defaults.change_detection),
            segment_size_bytes: self
                .segment_size_bytes
                .unwrap_or(defaults.segment_size_bytes)
                .max(1),
            sender_tick_rate_hz: self
                .sender_tick_rate_hz
                .unwrap_or(defaults.sender_tick_rate_hz)
                .max(1),
            congestion_interval: self
                .congestion_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.congestion_interval),
            reassembly_timeout: self
                .reassembly_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reassembly_timeout),
            shutdown_grace: self
                .shutdown_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace),
        };

        if config.save_delay < CLEANUP_CHECK_INTERVAL {
            tracing::warn!(
                save_delay = ?config.save_delay,
                cleanup_interval = ?CLEANUP_CHECK_INTERVAL,
                "Save delay is shorter than the cleanup interval, \
                 cached data will be saved later than configured"
            );
        }
        Ok(config)
    }

    /// Fills every unset field from `file`.
    fn merge(&mut self, file: ConfigArgs) {
        macro_rules! fill {
            ($($field:ident),* $(,)?) => {
                $(if self.$field.is_none() {
                    self.$field = file.$field;
                })*
            };
        }
        fill!(
            thread_count,
            per_connection_rate_limit_kbps,
            global_bandwidth_limit_kbps,
            save_delay_ms,
            overload_log_cooldown_ms,
            max_queued_per_thread_per_consumer,
            eviction_policy,
            change_detection,
            segment_size_bytes,
            sender_tick_rate_hz,
            congestion_interval_ms,
            reassembly_timeout_ms,
            shutdown_grace_ms,
        );
    }

    fn read_config(path: &Path) -> Result<ConfigArgs, ConfigError> {
        tracing::debug!(path = ?path, "Reading configuration file");
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string())),
            Some("toml") | None => toml::from_str(&content).map_err(|e| parse_error(e.to_string())),
            Some(ext) => Err(parse_error(format!(
                "invalid configuration file extension: {ext}"
            ))),
        }
    }
}

/// Validated configuration of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub thread_count: usize,
    pub per_connection_rate_limit_kbps: u64,
    pub global_bandwidth_limit_kbps: u64,
    pub save_delay: Duration,
    pub overload_log_cooldown: Duration,
    pub max_queued_per_thread_per_consumer: usize,
    pub eviction_policy: EvictionPolicy,
    pub change_detection: bool,
    pub segment_size_bytes: usize,
    pub sender_tick_rate_hz: u32,
    pub congestion_interval: Duration,
    pub reassembly_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            per_connection_rate_limit_kbps: 0,
            global_bandwidth_limit_kbps: 0,
            save_delay: DEFAULT_SAVE_DELAY,
            overload_log_cooldown: DEFAULT_OVERLOAD_COOLDOWN,
            max_queued_per_thread_per_consumer: DEFAULT_MAX_QUEUED_PER_THREAD_PER_CONSUMER,
            eviction_policy: EvictionPolicy::default(),
            change_detection: true,
            segment_size_bytes: DEFAULT_SEGMENT_SIZE,
            sender_tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            congestion_interval: DEFAULT_CONGESTION_INTERVAL,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().clamp(1, MAX_DEFAULT_THREADS))
        .unwrap_or(1)
}

/// Installs the global logger once; later calls are no-ops.
pub fn set_logger(
    level: Option<tracing::level_filters::LevelFilter>,
    json: bool,
) -> anyhow::Result<()> {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::AtomicBool;

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        crate::tracing::tracer::init_tracer(level, json)?;
    }
    #[cfg(not(feature = "trace"))]
    let _ = (level, json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() -> testresult::TestResult {
        let config = ConfigArgs::default().build()?;
        assert!((1..=MAX_DEFAULT_THREADS).contains(&config.thread_count));
        assert_eq!(config.global_bandwidth_limit_kbps, 0);
        assert_eq!(config.save_delay, Duration::from_millis(4_000));
        assert_eq!(config.segment_size_bytes, 1_048_000);
        assert_eq!(config.eviction_policy, EvictionPolicy::MainFirst);
        assert!(config.change_detection);
        Ok(())
    }

    #[test]
    fn test_zero_threads_is_rejected() {
        let args = ConfigArgs {
            thread_count: Some(0),
            ..Default::default()
        };
        assert!(matches!(args.build(), Err(ConfigError::InvalidThreadCount)));
    }

    #[test]
    fn test_explicit_values_override_file() -> testresult::TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chunkflow.toml");
        let mut file = fs::File::create(&path)?;
        writeln!(
            file,
            "thread-count = 6\nglobal-bandwidth-limit-kbps = 2000\neviction-policy = \"pre-first\""
        )?;

        let args = ConfigArgs {
            config_path: Some(path),
            thread_count: Some(2),
            ..Default::default()
        };
        let config = args.build()?;
        assert_eq!(config.thread_count, 2);
        assert_eq!(config.global_bandwidth_limit_kbps, 2000);
        assert_eq!(config.eviction_policy, EvictionPolicy::PreFirst);
        Ok(())
    }

    #[test]
    fn test_json_file() -> testresult::TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chunkflow.json");
        fs::write(&path, r#"{ "save-delay-ms": 250, "change-detection": false }"#)?;

        let config = ConfigArgs {
            config_path: Some(path),
            ..Default::default()
        }
        .build()?;
        assert_eq!(config.save_delay, Duration::from_millis(250));
        assert!(!config.change_detection);
        Ok(())
    }

    #[test]
    fn test_malformed_file_reports_path() -> testresult::TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.toml");
        fs::write(&path, "thread-count = \"many\"")?;

        let err = ConfigArgs {
            config_path: Some(path.clone()),
            ..Default::default()
        }
        .build()
        .expect_err("malformed file");
        assert!(matches!(err, ConfigError::Parse { path: p, .. } if p == path));
        Ok(())
    }

    #[test]
    fn test_cli_parsing() -> testresult::TestResult {
        use clap::Parser;
        let args = ConfigArgs::try_parse_from([
            "chunkflow",
            "--thread-count",
            "3",
            "--eviction-policy",
            "pre-first",
            "--global-bandwidth-limit-kbps",
            "500",
        ])?;
        let config = args.build()?;
        assert_eq!(config.thread_count, 3);
        assert_eq!(config.global_bandwidth_limit_kbps, 500);
        assert_eq!(config.eviction_policy, EvictionPolicy::PreFirst);
        Ok(())
    }
}
