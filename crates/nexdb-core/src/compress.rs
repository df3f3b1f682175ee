//! Message compression.
//!
//! The transport compresses a whole logical message once, before it is
//! segmented, and decompresses it once after reassembly. It only ever talks
//! to the `Compressor` trait; `Zstd` is the implementation the daemon uses.

use thiserror::Error;

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError>;

    /// Inflate `data`, failing rather than producing more than `max_len`
    /// bytes.
    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>, CompressError>;
}

/// zstd single-shot ("bulk") compression.
#[derive(Debug, Clone, Copy)]
pub struct Zstd {
    level: i32,
}

impl Zstd {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for Zstd {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

impl Compressor for Zstd {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        zstd::bulk::compress(data, self.level).map_err(|e| CompressError::Compress(e.to_string()))
    }

    fn decompress(&self, data: &[u8], max_len: usize) -> Result<Vec<u8>, CompressError> {
        zstd::bulk::decompress(data, max_len).map_err(|e| CompressError::Decompress(e.to_string()))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompressError {
    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_shrinks_repetitive_input() {
        let zstd = Zstd::default();
        let input = b"nexdb ".repeat(2000);
        let packed = zstd.compress(&input).unwrap();
        assert!(packed.len() < input.len() / 10);
        assert_eq!(zstd.decompress(&packed, input.len()).unwrap(), input);
    }

    #[test]
    fn output_limit_is_enforced() {
        let zstd = Zstd::default();
        let input = vec![7u8; 4096];
        let packed = zstd.compress(&input).unwrap();
        assert!(zstd.decompress(&packed, 1024).is_err());
    }

    #[test]
    fn garbage_fails_to_decompress() {
        let zstd = Zstd::default();
        assert!(matches!(
            zstd.decompress(b"definitely not zstd", 1024),
            Err(CompressError::Decompress(_))
        ));
    }
}
