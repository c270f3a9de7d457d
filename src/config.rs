//! Host configuration.
//!
//! The config file is plain ASCII, one `key = value` per line. Lines starting
//! with `#` and blank lines are ignored. Binary map fields are stored as
//! whitespace-separated decimal bytes and parsed by the map loader.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Raw key/value view of a config file. Lookups fall back to per-key
/// defaults supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    /// Reads and parses a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file: {}", path.display()))?;
        tracing::info!("[config] [loaded] file={}", path.display());
        Ok(Self::parse(&contents))
    }

    /// Parses config text. Malformed lines are skipped.
    pub fn parse(contents: &str) -> Self {
        let mut values = HashMap::new();
        for line in contents.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                continue;
            }
            values.insert(key.to_string(), value.to_string());
        }
        Self { values }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values.get(key).cloned().unwrap_or_else(|| default.to_string())
    }

    /// Integer lookup. A present-but-unparsable value falls back to the
    /// default, with a warning.
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.values.get(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!("[config] [bad_int] key={} value={}", key, raw);
                default
            }),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

/// Typed session settings extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Advertised lobby name.
    pub game_name: String,
    /// Synthetic host player name, at most 15 bytes.
    pub virtual_host_name: String,
    /// Protocol minor version byte.
    pub war3_version: u8,
    /// Milliseconds between action broadcasts.
    pub latency: u32,
    /// Minimum players to start automatically; 0 = manual start.
    pub autostart: u32,
    /// TCP listen port.
    pub host_port: u16,
    /// Milliseconds a player may stay on the lag screen before being dropped.
    pub lag_timeout: u32,
}

impl GameConfig {
    pub const DEFAULT_LATENCY: u32 = 100;
    /// Floor for the broadcast cadence; anything lower floods clients.
    pub const MIN_LATENCY: u32 = 20;

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let game_name = cfg.get_string("game_name", "Local Game");
        let virtual_host_name = cfg.get_string("virtual_host_name", "|cFF4080C0Host");
        anyhow::ensure!(!game_name.is_empty(), "game_name cannot be empty");
        anyhow::ensure!(
            !virtual_host_name.is_empty() && virtual_host_name.len() <= 15,
            "virtual_host_name must be 1-15 bytes, got {}",
            virtual_host_name.len()
        );

        let mut latency = cfg.get_int("latency", Self::DEFAULT_LATENCY as i32) as u32;
        if latency < Self::MIN_LATENCY {
            tracing::warn!("[config] [latency_clamped] requested={} floor={}", latency, Self::MIN_LATENCY);
            latency = Self::MIN_LATENCY;
        }

        Ok(Self {
            game_name,
            virtual_host_name,
            war3_version: cfg.get_int("war3_version", 26) as u8,
            latency,
            autostart: cfg.get_int("autostart", 0).max(0) as u32,
            host_port: cfg.get_int("host_port", 6112) as u16,
            lag_timeout: cfg.get_int("lag_timeout", 60_000).max(0) as u32,
        })
    }
}
