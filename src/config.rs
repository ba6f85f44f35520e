use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::heartbeat::HeartbeatTimings;
use crate::sandbox::error::{ConfigError, ConfigResult};

/// Smallest stdin ring that still fits one 4-byte codepoint after the cursor.
pub const MIN_STDIN_CELLS: usize = 8;
pub const MIN_FETCH_BYTES: usize = 64;

// ---------------------------------------------------------------------------
// Shared buffers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    /// Stdin ring size in 32-bit cells, cursor included.
    #[serde(default = "default_stdin_cells")]
    pub stdin_cells: usize,
    /// Fetch buffer size in bytes.
    #[serde(default = "default_fetch_bytes")]
    pub fetch_bytes: usize,
}

fn default_stdin_cells() -> usize {
    100
}
fn default_fetch_bytes() -> usize {
    128 * 1024
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            stdin_cells: default_stdin_cells(),
            fetch_bytes: default_fetch_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_push_rate_limit_ms")]
    pub push_rate_limit_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    1_000
}
fn default_probe_interval_ms() -> u64 {
    20_000
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_push_rate_limit_ms() -> u64 {
    200
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            timeout_ms: default_timeout_ms(),
            push_rate_limit_ms: default_push_rate_limit_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub fn timings(&self) -> HeartbeatTimings {
        HeartbeatTimings {
            check_interval: Duration::from_millis(self.check_interval_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            push_rate_limit: Duration::from_millis(self.push_rate_limit_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Connection establishment only; requests themselves are not timed out.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

fn default_user_agent() -> String {
    concat!("sandbox-bridge/", env!("CARGO_PKG_VERSION")).into()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// text | compact | json
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Also write daily-rolled files here when set.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_true")]
    pub show_target: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
            show_target: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl BridgeConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.buffers.stdin_cells < MIN_STDIN_CELLS {
            return Err(ConfigError::InvalidValue(format!(
                "buffers.stdinCells must be at least {}",
                MIN_STDIN_CELLS
            )));
        }
        if self.buffers.fetch_bytes < MIN_FETCH_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "buffers.fetchBytes must be at least {}",
                MIN_FETCH_BYTES
            )));
        }
        if i32::try_from(self.buffers.stdin_cells).is_err()
            || i32::try_from(self.buffers.fetch_bytes).is_err()
        {
            return Err(ConfigError::InvalidValue(
                "buffer sizes must fit in a 32-bit cell".into(),
            ));
        }

        let hb = &self.heartbeat;
        if hb.check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat.checkIntervalMs must be positive".into(),
            ));
        }
        if !(hb.check_interval_ms < hb.probe_interval_ms && hb.probe_interval_ms < hb.timeout_ms) {
            return Err(ConfigError::InvalidValue(
                "heartbeat intervals must satisfy checkIntervalMs < probeIntervalMs < timeoutMs".into(),
            ));
        }

        if !matches!(self.log.format.to_lowercase().as_str(), "text" | "compact" | "json") {
            return Err(ConfigError::InvalidValue(format!(
                "unknown log format: {}",
                self.log.format
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths & loading
// ---------------------------------------------------------------------------

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sandbox-bridge")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

pub fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    let cfg = if p.exists() {
        let text = std::fs::read_to_string(&p)
            .with_context(|| format!("reading config from {}", p.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config from {}", p.display()))?
    } else {
        BridgeConfig::default()
    };
    cfg.validate()
        .with_context(|| format!("validating config from {}", p.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &BridgeConfig, path: Option<&Path>) -> Result<()> {
    let p = path.map(PathBuf::from).unwrap_or_else(config_path);

    if let Some(parent) = p.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(cfg)?;
    std::fs::write(&p, json)?;
    Ok(())
}
