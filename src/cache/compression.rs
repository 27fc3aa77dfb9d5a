//! Envelope Compression
//!
//! LZ4 block compression for artifact envelopes shipped to the origin store.
//! Small or incompressible bodies are stored as-is; the algorithm travels in
//! the envelope header so the reader never has to guess.

use bytes::Bytes;

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Header byte identifying the algorithm
    pub fn wire_code(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    /// Parse a header byte
    pub fn from_wire_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            other => Err(Error::ArtifactDecode(format!(
                "unknown compression code {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Algorithm applied to bodies at or above `min_size_bytes`
    pub default_algorithm: CompressionAlgorithm,
    /// Minimum size to compress (smaller bodies are stored uncompressed)
    pub min_size_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: 4 * 1024,
            level: 4,
        }
    }
}

// =============================================================================
// Compressors
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block compressor; the uncompressed size is prepended to each block.
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    /// Create with a high-compression level
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Picks an algorithm per body and falls back to storing it raw
pub struct CompressionManager {
    config: CompressionConfig,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    /// Create a new compression manager with default config
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            noop: NoopCompressor,
            config,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Compress a body, returning the bytes and the algorithm actually used.
    ///
    /// Never fails: a body that is small, incompressible, or rejected by the
    /// compressor is returned unchanged with [`CompressionAlgorithm::None`].
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if data.len() < self.config.min_size_bytes
            || self.config.default_algorithm == CompressionAlgorithm::None
        {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.compressor(self.config.default_algorithm).compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), self.config.default_algorithm)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!("Compression failed, using uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Decompress a body produced by [`CompressionManager::compress`]
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn repetitive(len: usize) -> Vec<u8> {
        b"pose-tensor-row "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn test_lz4_roundtrip() {
        let data = repetitive(16 * 1024);
        let compressor = Lz4Compressor::with_level(4);

        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_small_bodies_stay_raw() {
        let manager = CompressionManager::new();
        let (out, algorithm) = manager.compress(b"tiny");
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(out.as_ref(), b"tiny");
    }

    #[test]
    fn test_manager_compresses_large_repetitive_bodies() {
        let manager = CompressionManager::new();
        let data = repetitive(64 * 1024);

        let (compressed, algorithm) = manager.compress(&data);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert!(compressed.len() < data.len());

        let restored = manager.decompress(&compressed, algorithm).unwrap();
        assert_eq!(restored.as_ref(), data.as_slice());
    }

    #[test]
    fn test_disabled_compression() {
        let manager = CompressionManager::with_config(CompressionConfig {
            default_algorithm: CompressionAlgorithm::None,
            ..Default::default()
        });
        let data = repetitive(64 * 1024);
        let (_, algorithm) = manager.compress(&data);
        assert_eq!(algorithm, CompressionAlgorithm::None);
    }

    #[test]
    fn test_wire_codes() {
        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Lz4] {
            assert_eq!(
                CompressionAlgorithm::from_wire_code(algorithm.wire_code()).unwrap(),
                algorithm
            );
        }
        assert_matches!(
            CompressionAlgorithm::from_wire_code(9),
            Err(Error::ArtifactDecode(_))
        );
    }
}
