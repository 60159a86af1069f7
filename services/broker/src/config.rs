use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Broker service configuration sourced from environment variables, with
// an optional YAML override file and CLI flags layered on top.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // TCP listener port.
    pub port: u16,
    // Coordination service address (host:port).
    pub coordination_addr: String,
    // Root for the record store.
    pub data_dir: PathBuf,
    // Root for rotating log files.
    pub log_dir: PathBuf,
    // Default log filter when RUST_LOG is unset.
    pub log_level: String,
    // A session read idling longer than this is closed.
    pub session_read_timeout_ms: u64,
    // Per-call deadline for coordination operations.
    pub coordination_timeout_ms: u64,
    // Coalescing interval for pushing last offsets to coordination.
    pub offset_flush_interval_ms: u64,
    // Max frame size accepted on sessions.
    pub max_frame_bytes: usize,
    // Optional Prometheus listener address.
    pub metrics_bind: Option<SocketAddr>,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/quiver/config.yml";
pub const DEFAULT_PORT: u16 = 1101;
const DEFAULT_SESSION_READ_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_COORDINATION_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_OFFSET_FLUSH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    port: Option<u16>,
    coordination_addr: Option<String>,
    data_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
    session_read_timeout_ms: Option<u64>,
    coordination_timeout_ms: Option<u64>,
    offset_flush_interval_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    metrics_bind: Option<String>,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_data_dir() -> PathBuf {
    home_dir().join(".quiver").join("data")
}

pub fn default_log_dir() -> PathBuf {
    home_dir().join(".quiver").join("log")
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            coordination_addr: "127.0.0.1:2181".to_string(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            log_level: "info".to_string(),
            session_read_timeout_ms: DEFAULT_SESSION_READ_TIMEOUT_MS,
            coordination_timeout_ms: DEFAULT_COORDINATION_TIMEOUT_MS,
            offset_flush_interval_ms: DEFAULT_OFFSET_FLUSH_INTERVAL_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            metrics_bind: None,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let mut config = Self::default();
        if let Ok(value) = std::env::var("QUIVER_PORT") {
            config.port = value.parse().with_context(|| "parse QUIVER_PORT")?;
        }
        if let Ok(value) = std::env::var("QUIVER_ZK_ADDR") {
            config.coordination_addr = value;
        }
        if let Ok(value) = std::env::var("QUIVER_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("QUIVER_LOG_DIR") {
            config.log_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("QUIVER_LOG_LEVEL") {
            config.log_level = value;
        }
        if let Some(value) = parse_env_u64("QUIVER_SESSION_READ_TIMEOUT_MS")? {
            config.session_read_timeout_ms = value;
        }
        if let Some(value) = parse_env_u64("QUIVER_COORDINATION_TIMEOUT_MS")? {
            config.coordination_timeout_ms = value;
        }
        if let Some(value) = parse_env_u64("QUIVER_OFFSET_FLUSH_INTERVAL_MS")? {
            config.offset_flush_interval_ms = value;
        }
        if let Ok(value) = std::env::var("QUIVER_MAX_FRAME_BYTES") {
            let parsed: usize = value.parse().with_context(|| "parse QUIVER_MAX_FRAME_BYTES")?;
            if parsed > 0 {
                config.max_frame_bytes = parsed;
            }
        }
        if let Ok(value) = std::env::var("QUIVER_METRICS_BIND") {
            config.metrics_bind =
                Some(value.parse().with_context(|| "parse QUIVER_METRICS_BIND")?);
        }
        Ok(config)
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("QUIVER_BROKER_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err)
                        .with_context(|| format!("read QUIVER_BROKER_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read broker config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            if let Some(value) = override_cfg.port {
                config.port = value;
            }
            if let Some(value) = override_cfg.coordination_addr {
                config.coordination_addr = value;
            }
            if let Some(value) = override_cfg.data_dir {
                config.data_dir = value;
            }
            if let Some(value) = override_cfg.log_dir {
                config.log_dir = value;
            }
            if let Some(value) = override_cfg.log_level {
                config.log_level = value;
            }
            if let Some(value) = override_cfg.session_read_timeout_ms {
                config.session_read_timeout_ms = value;
            }
            if let Some(value) = override_cfg.coordination_timeout_ms {
                config.coordination_timeout_ms = value;
            }
            if let Some(value) = override_cfg.offset_flush_interval_ms {
                config.offset_flush_interval_ms = value;
            }
            if let Some(value) = override_cfg.max_frame_bytes {
                if value > 0 {
                    config.max_frame_bytes = value;
                }
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind =
                    Some(value.parse().with_context(|| "parse metrics_bind")?);
            }
        }
        Ok(config)
    }

    pub fn session_read_timeout(&self) -> Duration {
        Duration::from_millis(self.session_read_timeout_ms)
    }

    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination_timeout_ms)
    }

    pub fn offset_flush_interval(&self) -> Duration {
        Duration::from_millis(self.offset_flush_interval_ms)
    }
}

fn parse_env_u64(name: &'static str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value.parse().with_context(|| format!("parse {name}"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_under_home() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.data_dir.ends_with(".quiver/data"));
        assert!(config.log_dir.ends_with(".quiver/log"));
        assert_eq!(config.coordination_timeout(), Duration::from_secs(3));
        assert_eq!(config.offset_flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn yaml_overrides_apply() {
        let yaml = "port: 2202\nlog_level: debug\nmax_frame_bytes: 1024\n";
        let override_cfg: BrokerConfigOverride = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(override_cfg.port, Some(2202));
        assert_eq!(override_cfg.log_level.as_deref(), Some("debug"));
        assert_eq!(override_cfg.max_frame_bytes, Some(1024));
    }
}
