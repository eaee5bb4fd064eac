use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::frame::{parse_collection_key, read_frame, ChunkFrame, FrameRead, StreamMetadata, METADATA_KEY, OTHER_KEY};
use crate::cancel::CancellationToken;
use crate::codec::DocumentCodec;
use crate::compression::{CompressionAdapter, GzipCompressor};
use crate::format::{split_payload, PayloadVariant};
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::{KeepsakeError, Result};

/// The decoder polls cancellation and yields after this many frames
const CHECK_EVERY_FRAMES: usize = 10;

/// Decoder for payloads of every variant, with progress and cancellation
#[derive(Debug, Clone)]
pub struct StreamingDecoder<C = GzipCompressor> {
    codec: DocumentCodec<C>,
}

impl Default for StreamingDecoder<GzipCompressor> {
    fn default() -> Self {
        Self::new(DocumentCodec::default())
    }
}

impl<C: CompressionAdapter + Clone + 'static> StreamingDecoder<C> {
    pub fn new(codec: DocumentCodec<C>) -> Self {
        Self { codec }
    }

    /// Decode `payload` back into the document it was encoded from
    ///
    /// Chunked payloads are decompressed and parsed frame by frame. A
    /// malformed tail ends the frame walk; when the metadata frame is
    /// present its batch count is used to tell a truncated payload from a
    /// complete one.
    ///
    /// # Errors
    /// * `Aborted` if `token` trips
    /// * `TruncatedPayload` / `UnknownFormat` for an unusable header
    /// * `CorruptArchive` if the frames disagree with the metadata frame
    pub async fn decode(
        &self,
        payload: &[u8],
        progress: &dyn ProgressReporter,
        token: &CancellationToken,
    ) -> Result<Value> {
        token.check()?;
        let tracker = ProgressTracker::new(progress);
        tracker.update(0.0, "Detecting format");

        let (variant, body) = split_payload(payload)?;
        debug!(variant = %variant, len = payload.len(), "Decoding document payload");

        let document = match variant {
            PayloadVariant::Chunked => decode_chunked_body(self.codec.compressor(), body, &tracker, token).await?,
            PayloadVariant::Raw | PayloadVariant::Compressed => {
                tracker.update(10.0, "Decoding document");
                let document = self.codec.decode_buffered_async(payload).await?;
                token.check()?;
                document
            }
        };

        tracker.update(100.0, "Complete");
        Ok(document)
    }
}

/// Frames collected from one chunked body, before reassembly
#[derive(Default)]
struct Collected {
    metadata: Option<StreamMetadata>,
    other: Option<Map<String, Value>>,
    batches: Vec<(String, usize, Vec<Value>)>,
}

impl Collected {
    fn accept(&mut self, frame: ChunkFrame) -> Result<()> {
        match frame.key.as_str() {
            METADATA_KEY => {
                let metadata = serde_json::from_value(frame.data)
                    .map_err(|e| KeepsakeError::corrupt(format!("unreadable metadata frame: {e}")))?;
                self.metadata = Some(metadata);
            }
            OTHER_KEY => match frame.data {
                Value::Object(fields) => self.other = Some(fields),
                _ => return Err(KeepsakeError::corrupt("'other' frame is not an object")),
            },
            key => match (parse_collection_key(key), frame.data) {
                (Some((collection, index)), Value::Array(items)) => {
                    self.batches.push((collection.to_owned(), index, items));
                }
                (Some(_), _) => {
                    return Err(KeepsakeError::corrupt(format!("batch frame '{key}' is not an array")));
                }
                (None, _) => warn!(key, "Ignoring unrecognized frame"),
            },
        }
        Ok(())
    }

    fn reassemble(self) -> Result<Value> {
        let Collected {
            metadata,
            other,
            mut batches,
        } = self;

        let collection = metadata
            .as_ref()
            .and_then(|m| m.collection.clone())
            .or_else(|| batches.first().map(|(name, _, _)| name.clone()));

        batches.retain(|(name, index, _)| {
            let keep = Some(name) == collection.as_ref();
            if !keep {
                warn!(collection = %name, index, "Dropping batch of unexpected collection");
            }
            keep
        });
        batches.sort_by_key(|(_, index, _)| *index);

        let mut document = Map::new();

        if let Some(metadata) = &metadata {
            if batches.len() != metadata.batches {
                return Err(KeepsakeError::corrupt(format!(
                    "chunked payload holds {} of {} batch frames",
                    batches.len(),
                    metadata.batches
                )));
            }
            if metadata.has_other && other.is_none() {
                return Err(KeepsakeError::corrupt("chunked payload is missing its 'other' frame"));
            }
        }

        if let Some(name) = collection {
            let items: Vec<Value> = batches.into_iter().flat_map(|(_, _, items)| items).collect();
            if let Some(metadata) = &metadata {
                if items.len() != metadata.count {
                    return Err(KeepsakeError::corrupt(format!(
                        "collection '{name}' holds {} of {} elements",
                        items.len(),
                        metadata.count
                    )));
                }
            }
            document.insert(name, Value::Array(items));
        }

        if let Some(metadata) = metadata {
            document.extend(metadata.fields);
        }
        if let Some(other) = other {
            document.extend(other);
        }

        Ok(Value::Object(document))
    }
}

/// Walk the frames of a chunked body and reassemble the document
///
/// Progress is reported into the `10..85` range of `tracker` while frames
/// are read, then up to 95 while reassembling.
pub(crate) async fn decode_chunked_body<C>(
    compressor: &C,
    body: &[u8],
    tracker: &ProgressTracker<'_>,
    token: &CancellationToken,
) -> Result<Value>
where
    C: CompressionAdapter + ?Sized,
{
    token.check()?;
    tracker.update(10.0, "Reading frames");

    let mut source = compressor.stream_decoder(body);
    let mut collected = Collected::default();
    let mut frames = 0usize;

    loop {
        let frame = match read_frame(&mut *source) {
            FrameRead::Frame(frame) => frame,
            FrameRead::End => break,
            FrameRead::Malformed(reason) => {
                warn!(frames, reason = %reason, "Stopping at malformed frame");
                break;
            }
        };

        debug!(key = %frame.key, index = frames, "Read frame");
        collected.accept(frame)?;
        frames += 1;

        if frames % CHECK_EVERY_FRAMES == 0 {
            token.check()?;

            let expected = collected.metadata.as_ref().map(|m| m.batches + 2);
            let percent = match expected {
                Some(expected) => 10.0 + 75.0 * (frames as f32 / expected as f32).min(1.0),
                None => 10.0,
            };
            match expected {
                Some(expected) => tracker.update_counts(percent, "Reading frames", frames, expected),
                None => tracker.update(percent, "Reading frames"),
            }

            tokio::task::yield_now().await;
            token.check()?;
        }
    }

    token.check()?;
    tracker.update(85.0, "Reassembling document");
    let document = collected.reassemble()?;
    tracker.update(95.0, "Reassembled document");

    info!(frames, "Decoded chunked document");
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::NoCompression;
    use crate::format::with_header;
    use crate::progress::{NoProgress, Progress};
    use crate::stream::frame::{collection_key, write_frame, CHUNKING_VERSION};
    use crate::stream::{BatchPolicy, StreamingEncoder};
    use serde_json::json;
    use std::sync::Mutex;

    fn plain_decoder() -> StreamingDecoder<NoCompression> {
        StreamingDecoder::new(DocumentCodec::new(NoCompression::new()))
    }

    fn metadata(collection: Option<&str>, count: usize, batches: usize) -> StreamMetadata {
        StreamMetadata {
            chunking_version: CHUNKING_VERSION,
            collection: collection.map(str::to_owned),
            count,
            batches,
            has_other: true,
            fields: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_chunked_roundtrip_through_gzip() {
        let characters: Vec<Value> = (0..321).map(|i| json!({ "id": i, "name": format!("c{i}") })).collect();
        let document = json!({
            "formatversion": 4,
            "title": "my save",
            "characters": characters,
            "modules": [{ "id": "m" }],
            "settings": { "theme": "dark" },
        });

        let encoder = StreamingEncoder::default().with_threshold(0);
        let encoded = encoder.encode(&document, &NoProgress, &CancellationToken::new()).await.unwrap();
        assert_eq!(encoded.variant, PayloadVariant::Chunked);

        let decoded = StreamingDecoder::default()
            .decode(&encoded.payload, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decoded, document);
    }

    #[tokio::test]
    async fn test_empty_collection_roundtrips_as_empty_array() {
        let document = json!({ "characters": [], "formatversion": 4 });
        let encoder = StreamingEncoder::default().with_threshold(0);
        let encoded = encoder.encode(&document, &NoProgress, &CancellationToken::new()).await.unwrap();

        let decoded = StreamingDecoder::default()
            .decode(&encoded.payload, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decoded, document);
    }

    #[tokio::test]
    async fn test_frames_are_sorted_numerically() {
        let mut body = Vec::new();
        write_frame(&mut body, "characters_10", &json!([3]), 0).unwrap();
        write_frame(&mut body, "characters_2", &json!([2]), 0).unwrap();
        write_frame(&mut body, "characters_0", &json!([1]), 0).unwrap();

        let payload = with_header(PayloadVariant::Chunked, &body);
        let decoded = plain_decoder()
            .decode(&payload, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decoded, json!({ "characters": [1, 2, 3] }));
    }

    #[tokio::test]
    async fn test_missing_metadata_and_other_are_tolerated() {
        let mut body = Vec::new();
        write_frame(&mut body, &collection_key("items", 0), &json!(["a"]), 0).unwrap();
        body.extend_from_slice(&[7, 0]);

        let payload = with_header(PayloadVariant::Chunked, &body);
        let decoded = plain_decoder()
            .decode(&payload, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decoded, json!({ "items": ["a"] }));
    }

    #[tokio::test]
    async fn test_truncation_detected_by_metadata() {
        let mut body = Vec::new();
        write_frame(&mut body, METADATA_KEY, &metadata(Some("items"), 3, 3), 0).unwrap();
        write_frame(&mut body, "items_0", &json!([1]), 0).unwrap();
        write_frame(&mut body, "items_1", &json!([2]), 0).unwrap();
        let cut = body.len() - 2;

        let payload = with_header(PayloadVariant::Chunked, &body[..cut]);
        let result = plain_decoder()
            .decode(&payload, &NoProgress, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(KeepsakeError::CorruptArchive(_))));
    }

    #[tokio::test]
    async fn test_missing_other_frame_detected_by_metadata() {
        let mut body = Vec::new();
        write_frame(&mut body, METADATA_KEY, &metadata(Some("items"), 1, 1), 0).unwrap();
        write_frame(&mut body, "items_0", &json!([1]), 0).unwrap();

        let payload = with_header(PayloadVariant::Chunked, &body);
        let result = plain_decoder()
            .decode(&payload, &NoProgress, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(KeepsakeError::CorruptArchive(_))));
    }

    #[tokio::test]
    async fn test_decodes_buffered_variants() {
        let document = json!({ "a": [1, 2], "b": "x" });
        let decoder = StreamingDecoder::default();

        for mode in [crate::EncodeMode::Raw, crate::EncodeMode::Compressed] {
            let payload = DocumentCodec::default().encode(&document, mode).unwrap();
            let decoded = decoder
                .decode(&payload, &NoProgress, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(decoded, document);
        }
    }

    #[tokio::test]
    async fn test_pre_aborted_decode() {
        let token = CancellationToken::new();
        token.abort();
        let payload = DocumentCodec::default()
            .encode(&json!({}), crate::EncodeMode::Raw)
            .unwrap();

        let result = StreamingDecoder::default().decode(&payload, &NoProgress, &token).await;
        assert!(matches!(result, Err(KeepsakeError::Aborted)));
    }

    #[tokio::test]
    async fn test_abort_mid_decode_stops_within_check_interval() {
        let characters: Vec<Value> = (0..100).map(|i| json!(i)).collect();
        let document = json!({ "characters": characters });
        let encoder = StreamingEncoder::default()
            .with_threshold(0)
            .with_batch_policy(BatchPolicy::Fixed(1));
        let encoded = encoder.encode(&document, &NoProgress, &CancellationToken::new()).await.unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        let reports = Mutex::new(Vec::<Progress>::new());
        let reporter = |p: Progress| {
            if p.current.is_some() {
                trigger.abort();
            }
            reports.lock().unwrap().push(p);
        };

        let result = StreamingDecoder::default().decode(&encoded.payload, &reporter, &token).await;
        assert!(matches!(result, Err(KeepsakeError::Aborted)));

        let counted: Vec<_> = reports.lock().unwrap().iter().filter_map(|p| p.current).collect();
        assert_eq!(counted, vec![CHECK_EVERY_FRAMES]);
    }
}
