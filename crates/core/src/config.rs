// crates/core/src/config.rs
//! Runtime configuration.
//!
//! One `AppConfig` is built at startup (TOML file, then environment
//! overrides) and handed to each component by reference. Durations are
//! written in milliseconds in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Floor applied to timer intervals built from configs that skipped
/// validation (constructed in code rather than loaded).
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Default HTTP port for the server binary.
pub const DEFAULT_PORT: u16 = 47900;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub consumer: ConsumerConfig,
    pub pipeline: PipelineConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    /// Root for per-job scratch directories. Defaults to `$TMPDIR/charart`.
    pub temp_dir: Option<PathBuf>,
    /// Scratch directories untouched for longer than this are swept.
    #[serde(with = "duration_ms", rename = "temp_retention_ms")]
    pub temp_retention: Duration,
    #[serde(with = "nonzero_ms", rename = "temp_sweep_interval_ms")]
    pub temp_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: "127.0.0.1".into(),
            temp_dir: None,
            temp_retention: Duration::from_secs(24 * 60 * 60),
            temp_sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Progress hub tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Delay between a job's last terminal activity and its retirement.
    #[serde(with = "duration_ms", rename = "retirement_grace_ms")]
    pub retirement_grace: Duration,
    /// Longest a producer waits on one listener's full queue.
    #[serde(with = "duration_ms", rename = "enqueue_timeout_ms")]
    pub enqueue_timeout: Duration,
    pub listener_capacity: usize,
    /// How long a retired id stays blocked from being recreated.
    #[serde(with = "duration_ms", rename = "tombstone_ttl_ms")]
    pub tombstone_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            retirement_grace: Duration::from_secs(60),
            enqueue_timeout: Duration::from_secs(1),
            listener_capacity: 256,
            tombstone_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    #[serde(with = "nonzero_ms", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Frame pipeline sizing and pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fraction of available parallelism given to frame workers.
    pub worker_factor: f64,
    pub min_workers: usize,
    pub max_frame_workers: usize,
    /// Fine-grained counters are reported every this many units.
    pub unit_report_interval: u64,
    #[serde(with = "nonzero_ms", rename = "frame_timeout_ms")]
    pub frame_timeout: Duration,
    #[serde(with = "nonzero_ms", rename = "progress_update_interval_ms")]
    pub progress_update_interval: Duration,
    /// Number of steps the encode poll takes from frame end to encode end.
    pub encode_poll_steps: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_factor: 0.5,
            min_workers: 1,
            max_frame_workers: 4,
            unit_report_interval: 1000,
            frame_timeout: Duration::from_secs(60),
            progress_update_interval: Duration::from_millis(500),
            encode_poll_steps: 20,
        }
    }
}

/// Remote worker service client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL of the remote worker. `None` disables delegation.
    pub base_url: Option<String>,
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    pub heartbeat_threshold: u32,
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms", rename = "stabilize_delay_ms")]
    pub stabilize_delay: Duration,
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            max_attempts: 4,
            retry_delay: Duration::from_millis(500),
            heartbeat_threshold: 12,
            connect_timeout: Duration::from_secs(30),
            stabilize_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    pub json: bool,
    /// When set, logs also go to a daily rolling file in this directory.
    pub directory: Option<PathBuf>,
}

impl ServerConfig {
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("charart"))
    }
}

impl AppConfig {
    /// Load from `path` (or `CHARART_CONFIG`), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os("CHARART_CONFIG").map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `CHARART_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("CHARART_PORT").or_else(|| lookup("PORT")) {
            self.server.port = parse_value("CHARART_PORT", &port)?;
        }
        if let Some(url) = lookup("CHARART_REMOTE_URL") {
            self.relay.base_url = (!url.trim().is_empty()).then(|| url.trim().to_string());
        }
        if let Some(ms) = lookup("CHARART_GRACE_MS") {
            self.hub.retirement_grace = Duration::from_millis(parse_value("CHARART_GRACE_MS", &ms)?);
        }
        if let Some(ms) = lookup("CHARART_HEARTBEAT_MS") {
            self.consumer.heartbeat_interval = parse_nonzero_ms("CHARART_HEARTBEAT_MS", &ms)?;
        }
        if let Some(ms) = lookup("CHARART_TEMP_RETENTION_MS") {
            self.server.temp_retention = Duration::from_millis(parse_value("CHARART_TEMP_RETENTION_MS", &ms)?);
        }
        if let Some(flag) = lookup("CHARART_LOG_JSON") {
            self.logging.json = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

/// Intervals that drive timers must be positive.
fn parse_nonzero_ms(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    match parse_value::<u64>(key, raw)? {
        0 => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
        ms => Ok(Duration::from_millis(ms)),
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod nonzero_ms {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub use super::duration_ms::serialize;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match u64::deserialize(d)? {
            0 => Err(D::Error::custom("interval must be greater than zero")),
            ms => Ok(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.hub.retirement_grace, Duration::from_secs(60));
        assert_eq!(config.hub.enqueue_timeout, Duration::from_secs(1));
        assert_eq!(config.consumer.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.pipeline.max_frame_workers, 4);
        assert_eq!(config.pipeline.unit_report_interval, 1000);
        assert_eq!(config.relay.heartbeat_threshold, 12);
        assert!(config.relay.base_url.is_none());
        assert_eq!(config.server.temp_retention, Duration::from_secs(86_400));
        assert_eq!(config.server.temp_sweep_interval, Duration::from_secs(3_600));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [hub]
            retirement_grace_ms = 250

            [relay]
            base_url = "http://127.0.0.1:5000"
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.hub.retirement_grace, Duration::from_millis(250));
        assert_eq!(config.hub.listener_capacity, 256);
        assert_eq!(config.relay.base_url.as_deref(), Some("http://127.0.0.1:5000"));
        assert_eq!(config.relay.max_attempts, 2);
        assert_eq!(config.relay.retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "8080"),
            ("CHARART_GRACE_MS", "1500"),
            ("CHARART_LOG_JSON", "true"),
            ("CHARART_REMOTE_URL", " http://worker:5000 "),
            ("CHARART_TEMP_RETENTION_MS", "60000"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.hub.retirement_grace, Duration::from_millis(1500));
        assert!(config.logging.json);
        assert_eq!(config.relay.base_url.as_deref(), Some("http://worker:5000"));
        assert_eq!(config.server.temp_retention, Duration::from_secs(60));
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|k| (k == "CHARART_HEARTBEAT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "CHARART_HEARTBEAT_MS", .. }
        ));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for raw in [
            "[pipeline]\nprogress_update_interval_ms = 0\n",
            "[pipeline]\nframe_timeout_ms = 0\n",
            "[consumer]\nheartbeat_interval_ms = 0\n",
            "[server]\ntemp_sweep_interval_ms = 0\n",
        ] {
            let err = AppConfig::from_toml(raw).unwrap_err();
            assert!(err.to_string().contains("greater than zero"), "{raw}: {err}");
        }

        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|k| (k == "CHARART_HEARTBEAT_MS").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "CHARART_HEARTBEAT_MS", .. }
        ));
        assert_eq!(config.consumer.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_from_file_missing() {
        let err = AppConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    #[serial_test::serial]
    fn test_load_reads_config_env_var() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("charart.toml");
        std::fs::write(&path, "[consumer]\nheartbeat_interval_ms = 2000\n").unwrap();

        std::env::set_var("CHARART_CONFIG", &path);
        let loaded = AppConfig::load(None);
        std::env::remove_var("CHARART_CONFIG");

        let config = loaded.unwrap();
        assert_eq!(config.consumer.heartbeat_interval, Duration::from_secs(2));
    }
}
