//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the poll interval of timed acquisitions
pub const MAX_POLL_INTERVAL_MS: u64 = 1000;

/// Arbiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Directory holding the registry, shared by every process on the host
    pub lock_dir: PathBuf,

    /// Poll interval for timed acquisitions
    pub poll_interval_ms: u64,

    /// Heartbeat staleness threshold; `None` relies on process liveness only
    pub stale_after_ms: Option<u64>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            poll_interval_ms: 10,
            stale_after_ms: None,
        }
    }
}

/// Host-wide lock directory, independent of the caller's environment
///
/// Every process on the host must land on the same directory, so neither
/// `TMPDIR` nor the user matters here. `/dev/shm` is preferred, which also
/// clears stale records on reboot.
pub fn default_lock_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if cfg!(unix) && shm.is_dir() {
        shm.join("arbiter").join("locks")
    } else if cfg!(unix) {
        PathBuf::from("/tmp/arbiter/locks")
    } else {
        env::temp_dir().join("arbiter").join("locks")
    }
}

impl ArbiterConfig {
    /// Create a config with a custom lock directory
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enable heartbeat staleness
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after_ms = Some(u64::try_from(stale_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_ms.map(Duration::from_millis)
    }

    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("ARBITER_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("arbiter")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or fall back to defaults
    ///
    /// `ARBITER_LOCK_DIR` overrides the lock directory from either source.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(dir) = env::var("ARBITER_LOCK_DIR") {
            config.lock_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: ArbiterConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Serialize as TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be at least 1"));
        }
        if self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(anyhow!(
                "poll_interval_ms must be at most {} (got {})",
                MAX_POLL_INTERVAL_MS,
                self.poll_interval_ms
            ));
        }
        if self.stale_after_ms == Some(0) {
            return Err(anyhow!("stale_after_ms must be positive when set"));
        }
        if self.lock_dir.as_os_str().is_empty() {
            return Err(anyhow!("lock_dir must not be empty"));
        }
        Ok(())
    }
}
