//! Configuration for every component of the execution engine.
//!
//! One TOML document with a section per component. Every field has a
//! default, so an absent file or an absent section means "stock behaviour".
//! Intervals are stored in milliseconds and exposed as [`Duration`]s; tests
//! shrink them to near zero instead of waiting out production timings.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FABRIC_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub controller: ControllerConfig,
    pub worker: WorkerConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one JSON document per namespace.
    pub path: PathBuf,
    /// Number of namespace handles kept open at once.
    pub cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("datastore"),
            cache_capacity: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long `Engine::start` waits for the dispatch thread to come up.
    pub start_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Poll interval while waiting for an execution to finish.
    pub tick_ms: u64,
    /// Re-send a liveness CHECK every this many ticks.
    pub check_every: u32,
    /// Interface both channel listeners bind to.
    pub host: String,
    /// Worker program and leading arguments. Empty means the current
    /// executable with a single `worker` argument.
    pub worker_command: Vec<String>,
    /// Grace period for the worker to exit after EXIT before it is killed.
    pub shutdown_grace_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            check_every: 10,
            host: "127.0.0.1".to_string(),
            worker_command: Vec::new(),
            shutdown_grace_ms: 2_000,
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub tick_ms: u64,
    /// Idle time before the suspend predicate is first consulted.
    pub suspend_after_ms: u64,
    /// Idle time before asking again after the predicate said no.
    pub suspend_retry_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            suspend_after_ms: 5_000,
            suspend_retry_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Idle ticks before the first suspend check.
    #[must_use]
    pub fn suspend_after_ticks(&self) -> u64 {
        ticks(self.suspend_after_ms, self.tick_ms)
    }

    /// Idle ticks between suspend checks after a denial.
    #[must_use]
    pub fn suspend_retry_ticks(&self) -> u64 {
        ticks(self.suspend_retry_ms, self.tick_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Granularity of every sleep in the remote client.
    pub tick_ms: u64,
    /// How often the watchdog inspects outstanding requests.
    pub check_interval_ms: u64,
    /// Silence after which the watchdog asks the server to resync a request.
    pub update_interval_ms: u64,
    /// Silence after which the watchdog gives up on a request.
    pub max_silence_ms: u64,
    /// Longest pause between failed connection attempts.
    pub reconnect_delay_ms: u64,
    /// How long construction waits for the first connection.
    pub connect_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            check_interval_ms: 5_000,
            update_interval_ms: 5_000,
            max_silence_ms: 15_000,
            reconnect_delay_ms: 15_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl ProxyConfig {
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    #[must_use]
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    #[must_use]
    pub fn max_silence(&self) -> Duration {
        Duration::from_millis(self.max_silence_ms)
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn ticks(total_ms: u64, tick_ms: u64) -> u64 {
    total_ms.div_ceil(tick_ms.max(1))
}

impl FabricConfig {
    /// Load from the first config file found, or `None` if there is none.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        for path in config_candidates() {
            if path.exists() {
                return Self::load_from(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Load, falling back to defaults when no file exists or it is unusable.
    #[must_use]
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!(path = %e.path().display(), "Using default config: {e}");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Search order: `$FABRIC_CONFIG`, `./fabric.toml`, `~/.fabric/config.toml`.
#[must_use]
pub fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(explicit) = env::var_os(CONFIG_ENV) {
        candidates.push(PathBuf::from(explicit));
    }
    candidates.push(PathBuf::from("fabric.toml"));
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".fabric").join("config.toml"));
    }
    candidates
}
