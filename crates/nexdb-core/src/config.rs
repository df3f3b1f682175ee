//! nexdb configuration.
//!
//! One TOML file with `[transport]`, `[pool]` and `[server]` sections. Any
//! missing key takes its default, and a handful of keys can be overridden
//! with `NEXDB_<SECTION>__<KEY>` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::FRAME_OVERHEAD;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NexdbConfig {
    pub transport: TransportConfig,
    pub pool: PoolConfig,
    pub server: ServerConfig,
}

/// Per-circuit transport limits. Both peers of a circuit must agree on
/// `segment_size`; the receiver rejects length prefixes above it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest frame on the wire, header and footer included.
    pub segment_size: usize,
    /// Capacity of the outbound (to-wire) byte buffer.
    pub outbound_capacity: usize,
    /// Capacity of the inbound (from-wire) byte buffer.
    pub inbound_capacity: usize,
    /// Largest logical message accepted by `send` or reassembled by `read`.
    pub max_message_size: usize,
    /// Partial messages held at once before the least recently updated one
    /// is evicted.
    pub max_reassembly_entries: usize,
    /// Default wait for blocking buffer operations driven by the bridge.
    pub io_timeout_ms: u64,
    /// Wait used by drain passes before concluding no more bytes are coming.
    /// Also bounds how long a stalled partial message survives.
    pub drain_timeout_ms: u64,
    /// zstd level for circuits with compression enabled.
    pub compression_level: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Total worker threads shared by every circuit.
    pub worker_threads: usize,
    /// Share of the workers given to inbound processing.
    pub inbound_share_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address for the daemon.
    pub listen: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024;
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            outbound_capacity: DEFAULT_BUFFER_CAPACITY,
            inbound_capacity: DEFAULT_BUFFER_CAPACITY,
            max_message_size: MAX_MESSAGE_SIZE,
            max_reassembly_entries: 64,
            io_timeout_ms: 1000,
            drain_timeout_ms: 20,
            compression_level: crate::compress::DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            inbound_share_percent: 75,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7878".to_string(),
        }
    }
}

impl TransportConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Payload bytes one frame can carry once the header, footer and any
    /// per-frame cipher overhead are paid for.
    pub fn max_chunk(&self, cipher_overhead: usize) -> usize {
        self.segment_size
            .saturating_sub(FRAME_OVERHEAD)
            .saturating_sub(cipher_overhead)
    }

    /// Reject settings the transport cannot honour.
    pub fn validate(&self, cipher_overhead: usize) -> Result<(), ConfigError> {
        if self.max_chunk(cipher_overhead) == 0 {
            return Err(ConfigError::Invalid(format!(
                "segment_size {} leaves no room for payload after {} bytes of framing and {} of cipher overhead",
                self.segment_size, FRAME_OVERHEAD, cipher_overhead
            )));
        }
        if u32::try_from(self.segment_size).is_err() {
            return Err(ConfigError::Invalid(format!(
                "segment_size {} does not fit a u32 length prefix",
                self.segment_size
            )));
        }
        if self.segment_size > self.outbound_capacity || self.segment_size > self.inbound_capacity
        {
            return Err(ConfigError::Invalid(format!(
                "segment_size {} exceeds a buffer capacity (outbound {}, inbound {})",
                self.segment_size, self.outbound_capacity, self.inbound_capacity
            )));
        }
        if self.max_reassembly_entries == 0 {
            return Err(ConfigError::Invalid(
                "max_reassembly_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize defaults: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl NexdbConfig {
    /// Defaults, overlaid by the config file if present, overlaid by
    /// `NEXDB_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => {
                Self::from_toml(&text).map_err(|source| ConfigError::Parse { path, source })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// `$NEXDB_CONFIG`, else `nexdb/config.toml` under the XDG config home.
    pub fn file_path() -> PathBuf {
        if let Some(explicit) = std::env::var_os("NEXDB_CONFIG") {
            return PathBuf::from(explicit);
        }
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(std::env::temp_dir);
        base.join("nexdb").join("config.toml")
    }

    /// Create the config file with default contents unless it exists.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if path.exists() {
            return Ok(path);
        }
        let text = toml::to_string_pretty(&Self::default())?;
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(&path, text));
        match written {
            Ok(()) => Ok(path),
            Err(source) => Err(ConfigError::Write { path, source }),
        }
    }

    fn apply_env_overrides(&mut self) {
        env_override("NEXDB_SERVER__LISTEN", &mut self.server.listen);
        env_override("NEXDB_POOL__WORKER_THREADS", &mut self.pool.worker_threads);
        env_override("NEXDB_TRANSPORT__SEGMENT_SIZE", &mut self.transport.segment_size);
        env_override(
            "NEXDB_TRANSPORT__COMPRESSION_LEVEL",
            &mut self.transport.compression_level,
        );
    }
}

/// Replace `slot` with the parsed value of `key`. Unset or unparsable
/// variables leave it alone.
fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Some(value) = std::env::var(key).ok().and_then(|v| v.parse().ok()) {
        *slot = value;
    }
}
