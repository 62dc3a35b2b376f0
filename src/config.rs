// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for the download manager and the CLI.
//!
//! Stored as JSON at `~/.torrentctl/config.json`. A missing file means
//! defaults; `TORRENTCTL_TICK_MS` and `TORRENTCTL_LOG` override the file.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::StorageMode;

pub const TICK_ENV: &str = "TORRENTCTL_TICK_MS";
pub const LOG_ENV: &str = "TORRENTCTL_LOG";

const MIN_TICK_MS: u64 = 10;
const MAX_TICK_MS: u64 = 60_000;
const MAX_COALESCE_DEPTH: usize = 1024;

/// Settings for a [`DownloadManager`](crate::download::DownloadManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Poll interval per download (default: 1000 ms)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Status failures in a row before a download stops itself (default: 5)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Undelivered snapshots kept per download (default: 1, freshest wins)
    #[serde(default = "default_coalesce_depth")]
    pub coalesce_depth: usize,
    #[serde(default)]
    pub storage_mode: StorageMode,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_coalesce_depth() -> usize {
    1
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            coalesce_depth: default_coalesce_depth(),
            storage_mode: StorageMode::default(),
        }
    }
}

impl ManagerConfig {
    /// Poll interval as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Clamp out-of-range values, warning about each one changed.
    pub fn normalized(mut self) -> Self {
        let tick = self.tick_interval_ms.clamp(MIN_TICK_MS, MAX_TICK_MS);
        if tick != self.tick_interval_ms {
            warn!(requested = self.tick_interval_ms, used = tick, "tick_interval_ms out of range");
            self.tick_interval_ms = tick;
        }
        if self.max_consecutive_failures == 0 {
            warn!("max_consecutive_failures must be at least 1");
            self.max_consecutive_failures = 1;
        }
        let depth = self.coalesce_depth.clamp(1, MAX_COALESCE_DEPTH);
        if depth != self.coalesce_depth {
            warn!(requested = self.coalesce_depth, used = depth, "coalesce_depth out of range");
            self.coalesce_depth = depth;
        }
        self
    }
}

/// Everything stored in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Where downloads land when `--save-path` is not given
    #[serde(default)]
    pub default_save_dir: Option<PathBuf>,
    /// tracing level: error, warn, info, debug, trace (default: "warn")
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            default_save_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Apply `TORRENTCTL_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(TICK_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.manager.tick_interval_ms = ms,
                Err(_) => warn!(value = %raw, "ignoring invalid {}", TICK_ENV),
            }
        }
        if let Some(level) = lookup(LOG_ENV) {
            if !level.trim().is_empty() {
                self.log_level = level.trim().to_string();
            }
        }
    }

    /// Directory for new downloads: configured, else the user's download dir, else cwd.
    pub fn save_dir(&self) -> PathBuf {
        self.default_save_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".torrentctl"))
}

/// Path of the JSON config file under the user's config directory.
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load the config file (defaults if absent), then apply environment overrides.
pub fn load_config() -> Result<AppConfig> {
    let path = config_path()?;
    let mut config = if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))?
    } else {
        AppConfig::default()
    };
    config.apply_env(|key| std::env::var(key).ok());
    config.manager = config.manager.normalized();
    Ok(config)
}

/// Write `config` as pretty JSON and return the path written.
pub fn save_config(config: &AppConfig) -> Result<PathBuf> {
    let dir = config_dir()?;
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    let path = dir.join("config.json");
    let content = serde_json::to_string_pretty(config)?;
    fs::write(&path, content)?;
    Ok(path)
}
