/*!
Buffered document codec.

Encodes a document to a raw or compressed payload in one pass and decodes
payloads of every variant. Chunked payloads are handed to the streaming
decoder.
*/

use serde_json::Value;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::format::{split_payload, with_header, PayloadVariant};
use crate::progress::{NoProgress, ProgressTracker};
use crate::stream::decode_chunked_body;
use crate::{KeepsakeError, Result};

/// Buffered encoding modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Serialized JSON, uncompressed
    Raw,
    /// Serialized JSON compressed as a whole
    Compressed,
}

impl From<EncodeMode> for PayloadVariant {
    fn from(mode: EncodeMode) -> Self {
        match mode {
            EncodeMode::Raw => PayloadVariant::Raw,
            EncodeMode::Compressed => PayloadVariant::Compressed,
        }
    }
}

/// Document codec over a compression adapter
///
/// # Example
/// ```rust
/// use keepsake_core::{DocumentCodec, EncodeMode};
/// use serde_json::json;
///
/// let codec = DocumentCodec::default();
/// let document = json!({ "formatversion": 4, "characters": [] });
///
/// let payload = codec.encode(&document, EncodeMode::Compressed)?;
/// assert_eq!(codec.decode_buffered(&payload)?, document);
/// # Ok::<(), keepsake_core::KeepsakeError>(())
/// ```
#[derive(Debug, Clone)]
pub struct DocumentCodec<C = GzipCompressor> {
    compressor: C,
}

impl DocumentCodec<GzipCompressor> {
    /// Codec with gzip at the given level (0-9)
    pub fn gzip(level: u32) -> Self {
        Self::new(GzipCompressor::with_level(level))
    }
}

impl Default for DocumentCodec<GzipCompressor> {
    fn default() -> Self {
        Self::new(GzipCompressor::new())
    }
}

impl<C: CompressionAdapter> DocumentCodec<C> {
    pub fn new(compressor: C) -> Self {
        Self { compressor }
    }

    pub fn compressor(&self) -> &C {
        &self.compressor
    }

    /// Encode `document` into a self-describing payload
    ///
    /// # Arguments
    /// * `document` - Document to encode
    /// * `mode` - Whether to compress the serialized form
    ///
    /// # Returns
    /// The payload, header included
    pub fn encode(&self, document: &Value, mode: EncodeMode) -> Result<Vec<u8>> {
        let json = serialize(document)?;

        let payload = match mode {
            EncodeMode::Raw => with_header(PayloadVariant::Raw, &json),
            EncodeMode::Compressed => {
                let compressed = self.compressor.compress(&json)?;
                with_header(PayloadVariant::Compressed, &compressed)
            }
        };

        debug!(
            mode = ?mode,
            serialized = json.len(),
            payload = payload.len(),
            "Encoded document"
        );
        Ok(payload)
    }

    /// Decode a raw or compressed payload
    ///
    /// # Errors
    /// `Validation` for a chunked payload, which needs [`DocumentCodec::decode`]
    pub fn decode_buffered(&self, payload: &[u8]) -> Result<Value> {
        let (variant, body) = split_payload(payload)?;
        match variant {
            PayloadVariant::Raw => Ok(serde_json::from_slice(body)?),
            PayloadVariant::Compressed => {
                let json = self.compressor.decompress(body)?;
                Ok(serde_json::from_slice(&json)?)
            }
            PayloadVariant::Chunked => Err(KeepsakeError::validation(
                "chunked payloads must be decoded asynchronously",
            )),
        }
    }

}

/// Run a CPU-bound codec step on tokio's blocking pool
async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| KeepsakeError::Io(e.into()))?
}

impl<C: CompressionAdapter + Clone + 'static> DocumentCodec<C> {
    /// Like [`DocumentCodec::encode`], with compression off the async workers
    ///
    /// Serialization happens on the caller's task so the document is never
    /// copied; only the serialized bytes move to the blocking pool.
    pub async fn encode_async(&self, document: &Value, mode: EncodeMode) -> Result<Vec<u8>> {
        let json = serialize(document)?;
        let payload = match mode {
            EncodeMode::Raw => with_header(PayloadVariant::Raw, &json),
            EncodeMode::Compressed => {
                let compressor = self.compressor.clone();
                let compressed = run_blocking(move || compressor.compress(&json)).await?;
                with_header(PayloadVariant::Compressed, &compressed)
            }
        };
        debug!(mode = ?mode, payload = payload.len(), "Encoded document off-thread");
        Ok(payload)
    }

    /// Like [`DocumentCodec::decode_buffered`], with decompression and
    /// parsing on the blocking pool
    pub async fn decode_buffered_async(&self, payload: &[u8]) -> Result<Value> {
        let (variant, body) = split_payload(payload)?;
        match variant {
            PayloadVariant::Raw => Ok(serde_json::from_slice(body)?),
            PayloadVariant::Compressed => {
                let compressor = self.compressor.clone();
                let body = body.to_vec();
                run_blocking(move || {
                    let json = compressor.decompress(&body)?;
                    Ok(serde_json::from_slice(&json)?)
                })
                .await
            }
            PayloadVariant::Chunked => Err(KeepsakeError::validation(
                "chunked payloads must be decoded with DocumentCodec::decode",
            )),
        }
    }

    /// Decode a payload of any variant
    pub async fn decode(&self, payload: &[u8]) -> Result<Value> {
        let (variant, body) = split_payload(payload)?;
        match variant {
            PayloadVariant::Chunked => {
                let tracker = ProgressTracker::new(&NoProgress);
                decode_chunked_body(&self.compressor, body, &tracker, &CancellationToken::new()).await
            }
            _ => self.decode_buffered_async(payload).await,
        }
    }
}

fn serialize(document: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(document)
        .map_err(|e| KeepsakeError::encoding(format!("Failed to serialize document: {e}")))
}
