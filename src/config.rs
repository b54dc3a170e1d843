//! Enumerated configuration consumed by the WAL and coordination subsystems.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// One gibibyte, the default `wal.max_size`.
const DEFAULT_WAL_MAX_SIZE: u64 = 1 << 30;

/// Write-ahead log options. Zero-valued fields defer to the backing
/// filesystem (`replication`) or are derived from `max_size` (`block_size`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// `wal.replication` — per-file replication; `0` uses the filesystem default.
    pub replication: u16,
    /// `wal.block_size` — per-file block size; `0` derives `1.1 × max_size`.
    pub block_size: u64,
    /// `wal.sync_mode` — request the stronger durable-sync primitive at create time.
    pub sync_mode: bool,
    /// `wal.max_size` — used only to derive the block size.
    pub max_size: u64,
    /// `crypto.module_class` — cipher module name embedded in the v3 header.
    pub crypto_module: String,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            replication: 0,
            block_size: 0,
            sync_mode: true,
            max_size: DEFAULT_WAL_MAX_SIZE,
            crypto_module: crate::walog::crypto::NULL_CIPHER_MODULE.to_string(),
        }
    }
}

impl WalConfig {
    /// Block size to pass to the volume manager. A zero override derives
    /// `1.1 × max_size` so a single file never rolls over a block boundary.
    pub fn effective_block_size(&self) -> u64 {
        if self.block_size > 0 {
            self.block_size
        } else {
            self.max_size.saturating_add(self.max_size / 10)
        }
    }
}

/// Key material for the cipher modules. The key itself is configuration;
/// everything else needed for decryption lives in the file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub key_epoch: u32,
    pub key: [u8; 32],
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            key_epoch: 0,
            key: [0u8; 32],
        }
    }
}

/// Coordination store connection options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Comma-separated host list for the coordination store.
    pub connect: String,
    /// `coord.session_timeout` in milliseconds.
    pub session_timeout_ms: u64,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            connect: "localhost:2181".to_string(),
            session_timeout_ms: 30_000,
        }
    }
}

impl CoordConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Loads any of the config documents from a JSON file.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
