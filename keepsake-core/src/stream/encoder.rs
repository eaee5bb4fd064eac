use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::estimate::{estimate_document_size, select_bulk_field};
use super::frame::{collection_key, write_frame, StreamMetadata, CHUNKING_VERSION, METADATA_KEY, OTHER_KEY};
use super::BatchPolicy;
use crate::cancel::CancellationToken;
use crate::codec::{DocumentCodec, EncodeMode};
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::format::{with_header, PayloadVariant};
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::{KeepsakeError, Result};

/// Default estimated size at which documents are chunked (16 MiB)
pub const DEFAULT_CHUNKING_THRESHOLD: u64 = 16 * 1024 * 1024;

/// The encoder yields to the runtime after this many batches
const YIELD_EVERY_BATCHES: usize = 5;

/// Result of [`StreamingEncoder::encode`]
#[derive(Debug, Clone)]
pub struct EncodedDocument {
    /// Complete payload, header included
    pub payload: Vec<u8>,
    /// Variant actually written
    pub variant: PayloadVariant,
    /// Size estimate that drove the path decision
    pub estimated_size: u64,
    /// The chunked attempt failed and the compressed path was used instead
    pub fell_back: bool,
}

/// Size-gated document encoder
///
/// Documents estimated below the threshold are encoded buffered and
/// compressed. Larger ones are split into frames, with a transparent fallback
/// to the compressed path if chunking fails for any reason other than
/// cancellation.
#[derive(Debug, Clone)]
pub struct StreamingEncoder<C = GzipCompressor> {
    codec: DocumentCodec<C>,
    threshold: u64,
    policy: BatchPolicy,
    bulk_field: Option<String>,
}

impl Default for StreamingEncoder<GzipCompressor> {
    fn default() -> Self {
        Self::new(DocumentCodec::default())
    }
}

impl<C: CompressionAdapter + Clone + 'static> StreamingEncoder<C> {
    pub fn new(codec: DocumentCodec<C>) -> Self {
        Self {
            codec,
            threshold: DEFAULT_CHUNKING_THRESHOLD,
            policy: BatchPolicy::default(),
            bulk_field: None,
        }
    }

    /// Estimated size at which the chunked path is taken
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Name the array field to partition instead of auto-detecting it
    pub fn with_bulk_field(mut self, field: impl Into<String>) -> Self {
        self.bulk_field = Some(field.into());
        self
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn codec(&self) -> &DocumentCodec<C> {
        &self.codec
    }

    /// Encode `document`, choosing the variant by estimated size
    ///
    /// # Arguments
    /// * `document` - Document to encode
    /// * `progress` - Receives non-decreasing percentages and stage labels
    /// * `token` - Checked at entry and before every batch
    ///
    /// # Errors
    /// `Aborted` if `token` trips; otherwise only errors of the compressed
    /// fallback path are surfaced.
    pub async fn encode(
        &self,
        document: &Value,
        progress: &dyn ProgressReporter,
        token: &CancellationToken,
    ) -> Result<EncodedDocument> {
        token.check()?;
        let tracker = ProgressTracker::new(progress);
        tracker.update(0.0, "Analyzing document");

        let fields = document.as_object();
        let bulk = fields.and_then(|map| select_bulk_field(map, self.bulk_field.as_deref()));

        let estimated_size = estimate_document_size(document, bulk).unwrap_or_else(|e| {
            warn!(error = %e, "Size estimation failed, forcing chunked encoding");
            self.threshold
        });

        let fields = match fields {
            Some(fields) if estimated_size >= self.threshold => fields,
            _ => {
                debug!(estimated_size, threshold = self.threshold, "Using compressed encoding");
                tracker.update(10.0, "Compressing document");
                let payload = self.codec.encode_async(document, EncodeMode::Compressed).await?;
                tracker.update(100.0, "Complete");
                return Ok(EncodedDocument {
                    payload,
                    variant: PayloadVariant::Compressed,
                    estimated_size,
                    fell_back: false,
                });
            }
        };

        info!(
            estimated_size,
            threshold = self.threshold,
            bulk_field = bulk.unwrap_or("<none>"),
            compression = self.codec.compressor().algorithm_name(),
            "Using chunked encoding"
        );

        match self.encode_chunked(fields, bulk, &tracker, token).await {
            Ok(payload) => {
                tracker.update(100.0, "Complete");
                Ok(EncodedDocument {
                    payload,
                    variant: PayloadVariant::Chunked,
                    estimated_size,
                    fell_back: false,
                })
            }
            Err(KeepsakeError::Aborted) => Err(KeepsakeError::Aborted),
            Err(e) => {
                warn!(error = %e, "Chunked encoding failed, falling back to compressed encoding");
                token.check()?;
                tracker.update(90.0, "Compressing document");
                let payload = self.codec.encode_async(document, EncodeMode::Compressed).await?;
                tracker.update(100.0, "Complete");
                Ok(EncodedDocument {
                    payload,
                    variant: PayloadVariant::Compressed,
                    estimated_size,
                    fell_back: true,
                })
            }
        }
    }

    async fn encode_chunked(
        &self,
        fields: &Map<String, Value>,
        bulk: Option<&str>,
        tracker: &ProgressTracker<'_>,
        token: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let items: &[Value] = bulk
            .and_then(|name| fields.get(name))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut scalars = Map::new();
        let mut others = BTreeMap::new();
        for (key, value) in fields {
            if Some(key.as_str()) == bulk {
                continue;
            }
            match value {
                Value::Array(_) | Value::Object(_) => {
                    others.insert(key.as_str(), value);
                }
                _ => {
                    scalars.insert(key.clone(), value.clone());
                }
            }
        }

        let total = self.policy.batch_count(items.len());
        let metadata = StreamMetadata {
            chunking_version: CHUNKING_VERSION,
            collection: bulk.map(str::to_owned),
            count: items.len(),
            batches: total,
            has_other: true,
            fields: scalars,
        };

        let mut sink = self.codec.compressor().stream_encoder()?;
        tracker.update(10.0, "Writing metadata");
        write_frame(&mut *sink, METADATA_KEY, &metadata, Utc::now().timestamp_millis())?;

        if let Some(name) = bulk {
            for (index, batch) in self.policy.partition(items).enumerate() {
                token.check()?;

                let written = write_frame(
                    &mut *sink,
                    &collection_key(name, index),
                    batch,
                    Utc::now().timestamp_millis(),
                )?;
                debug!(collection = name, index, elements = batch.len(), bytes = written, "Wrote batch frame");

                let done = index + 1;
                tracker.update_counts(
                    10.0 + 75.0 * done as f32 / total as f32,
                    &format!("Encoding {name}"),
                    done,
                    total,
                );

                if done % YIELD_EVERY_BATCHES == 0 {
                    tokio::task::yield_now().await;
                    token.check()?;
                }
            }
        }

        token.check()?;
        tracker.update(85.0, "Writing remaining fields");
        write_frame(&mut *sink, OTHER_KEY, &others, Utc::now().timestamp_millis())?;

        tracker.update(95.0, "Finalizing");
        let body = sink.finish()?;
        token.check()?;

        debug!(batches = total, compressed = body.len(), "Finished chunked payload");
        Ok(with_header(PayloadVariant::Chunked, &body))
    }
}
