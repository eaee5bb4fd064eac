/*!
Compression adapters for document payloads.

The compressed and chunked payload variants are defined over gzip, so
`GzipCompressor` is the adapter used for archives. The trait keeps the codec
independent of flate2 and lets tests substitute a pass-through or a failing
implementation.
*/

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::{KeepsakeError, Result};

/// Incremental compression sink
///
/// Bytes written are compressed as they arrive; `finish` flushes the trailer
/// and hands back the compressed buffer.
pub trait CompressSink: Write + Send {
    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

/// Compression abstraction for document payloads
pub trait CompressionAdapter: Send + Sync {
    /// Compress a whole buffer
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress a whole buffer
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Open a streaming sink for producing one compressed buffer piecewise
    fn stream_encoder(&self) -> Result<Box<dyn CompressSink>>;

    /// Pull-based decompressor over a compressed buffer
    ///
    /// Reading yields decompressed bytes on demand; the decompressed form is
    /// never held in full.
    fn stream_decoder<'a>(&self, compressed_data: &'a [u8]) -> Box<dyn Read + Send + 'a>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip adapter, the compressor of every archive payload
///
/// # Example
/// ```rust
/// use keepsake_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = b"application state to compress";
/// let compressed = compressor.compress(data)?;
/// let decompressed = compressor.decompress(&compressed)?;
/// assert_eq!(data, &decompressed[..]);
/// # Ok::<(), keepsake_core::KeepsakeError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Level 6, the level archives are written with unless configured
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Gzip level 0-9; configuration validation keeps it in range
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressSink for GzEncoder<Vec<u8>> {
    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        (*self)
            .finish()
            .map_err(|e| KeepsakeError::compression(format!("Failed to finish compression: {e}")))
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut sink = self.stream_encoder()?;
        sink.write_all(data)
            .map_err(|e| KeepsakeError::compression(format!("Failed to gzip {} bytes: {e}", data.len())))?;
        sink.finish()
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(compressed_data.len() * 4);
        self.stream_decoder(compressed_data)
            .read_to_end(&mut out)
            .map_err(|e| KeepsakeError::compression(format!("Corrupt gzip stream: {e}")))?;
        Ok(out)
    }

    fn stream_encoder(&self) -> Result<Box<dyn CompressSink>> {
        Ok(Box::new(GzEncoder::new(Vec::new(), self.compression_level)))
    }

    fn stream_decoder<'a>(&self, compressed_data: &'a [u8]) -> Box<dyn Read + Send + 'a> {
        Box::new(GzDecoder::new(compressed_data))
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter, useful in tests for inspecting payload bodies
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressSink for Vec<u8> {
    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        Ok(*self)
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn stream_encoder(&self) -> Result<Box<dyn CompressSink>> {
        Ok(Box::new(Vec::new()))
    }

    fn stream_decoder<'a>(&self, compressed_data: &'a [u8]) -> Box<dyn Read + Send + 'a> {
        Box::new(compressed_data)
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}
