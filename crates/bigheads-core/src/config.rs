//! Runtime configuration: typed tunables with JSON persistence.
//!
//! Defaults are compiled in; a `config.json` in the data directory overrides
//! them, and individual keys may additionally be overridden from the `meta`
//! table so settings changed at runtime survive restarts.

use crate::error::{Error, Result};
use crate::protocol::FIXED_HEADER_LEN;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// GATT service UUID advertised by every BigHeads node.
pub const SERVICE_UUID: &str = "4fdb7f0a-96e4-4ecf-8d2b-6f57494701a1";

/// Characteristic the peer writes inbound frames to.
pub const WRITE_CHAR_UUID: &str = "4fdb7f0b-96e4-4ecf-8d2b-6f57494701a1";

/// Characteristic we subscribe to for outbound-from-peer frames.
pub const NOTIFY_CHAR_UUID: &str = "4fdb7f0c-96e4-4ecf-8d2b-6f57494701a1";

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Database file name inside the data directory.
pub const DB_FILE: &str = "bigheads.db";

/// Application tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Initial TTL for originated envelopes.
    pub ttl_default: u8,
    /// Seconds between BLE rescans.
    pub scan_interval_sec: u32,
    /// Upper bound on concurrent GATT links.
    pub max_connections: u32,
    /// Shared secret for the group broadcast channel.
    pub group_passphrase: String,
    /// Per-envelope byte cap on the wire.
    pub packet_size_limit: u32,
    /// Durable dedupe window (entries).
    pub seen_lru_limit: u32,
    /// Reject inline file transfers above this many bytes.
    pub max_inline_file_bytes: u32,
    /// Seconds between autosave flushes.
    pub autosave_sec: u32,
    /// Seconds between encrypted presence broadcasts.
    pub presence_interval_sec: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl_default: 6,
            scan_interval_sec: 10,
            max_connections: 8,
            group_passphrase: "change-me".to_string(),
            packet_size_limit: 512,
            seen_lru_limit: 50_000,
            max_inline_file_bytes: 2_000_000,
            autosave_sec: 30,
            presence_interval_sec: 15,
        }
    }
}

impl Config {
    /// Load from `<data_dir>/config.json`, writing defaults when absent.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
            let cfg: Config = serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
            cfg.validate()?;
            return Ok(cfg);
        }
        let cfg = Config::default();
        cfg.save(data_dir)?;
        Ok(cfg)
    }

    /// Persist to `<data_dir>/config.json`.
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Config(format!("cannot create data dir: {}", e)))?;
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(data_dir.join(CONFIG_FILE), raw)
            .map_err(|e| Error::Config(format!("cannot write config: {}", e)))?;
        Ok(())
    }

    /// Path of the database file under a data directory.
    pub fn db_path(data_dir: &Path) -> PathBuf {
        data_dir.join(DB_FILE)
    }

    /// Apply a single `meta`-table override. Unknown keys are ignored so old
    /// databases keep working across releases.
    pub fn apply_override(&mut self, key: &str, value: &str) {
        match key {
            "ttl_default" => {
                if let Ok(v) = value.parse() {
                    self.ttl_default = v;
                }
            }
            "scan_interval_sec" => {
                if let Ok(v) = value.parse() {
                    self.scan_interval_sec = v;
                }
            }
            "max_connections" => {
                if let Ok(v) = value.parse() {
                    self.max_connections = v;
                }
            }
            "group_passphrase" => self.group_passphrase = value.to_string(),
            "packet_size_limit" => {
                if let Ok(v) = value.parse() {
                    self.packet_size_limit = v;
                }
            }
            "seen_lru_limit" => {
                if let Ok(v) = value.parse() {
                    self.seen_lru_limit = v;
                }
            }
            "max_inline_file_bytes" => {
                if let Ok(v) = value.parse() {
                    self.max_inline_file_bytes = v;
                }
            }
            _ => {}
        }
    }

    /// Reject configurations the mesh cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.ttl_default == 0 {
            return Err(Error::Config("ttl_default must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if (self.packet_size_limit as usize) <= FIXED_HEADER_LEN {
            return Err(Error::Config(format!(
                "packet_size_limit must exceed the {} byte envelope header",
                FIXED_HEADER_LEN
            )));
        }
        if self.group_passphrase.is_empty() {
            return Err(Error::Config("group_passphrase must not be empty".into()));
        }
        Ok(())
    }

    /// Largest ciphertext that fits a single envelope.
    pub fn max_ciphertext_len(&self) -> usize {
        self.packet_size_limit as usize - FIXED_HEADER_LEN
    }
}
