/*!
Property-style tests of the document codec and archive container.

Documents are generated from a seeded RNG so failures are reproducible.
*/

use keepsake_core::stream::frame::{parse_collection_key, read_frame, FrameRead, StreamMetadata, METADATA_KEY};
use keepsake_core::{
    detect_variant, parse, write_archive, ArchiveDecoder, ArchiveEntry, BatchPolicy, CancellationToken,
    DocumentCodec, EncodeMode, KeepsakeError, NoCompression, NoProgress, PayloadVariant, Progress,
    StreamingDecoder, StreamingEncoder, HEADER_LEN,
};
use keepsake_core::stream::estimate_document_size;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Value};

fn random_character(rng: &mut StdRng, index: usize) -> Value {
    let tags: Vec<Value> = (0..rng.gen_range(0..4))
        .map(|_| json!(format!("tag-{}", rng.gen_range(0..50))))
        .collect();
    json!({
        "name": format!("character {index} ✨"),
        "description": "x".repeat(rng.gen_range(0..120)),
        "level": rng.gen_range(1..100),
        "ratio": rng.gen_range(0.0..1.0),
        "tags": tags,
        "extensions": { "depth": { "nested": rng.gen_bool(0.5) } },
    })
}

fn random_document(seed: u64, characters: usize) -> Value {
    let mut rng = StdRng::seed_from_u64(seed);
    let characters: Vec<Value> = (0..characters).map(|i| random_character(&mut rng, i)).collect();
    json!({
        "formatversion": 4,
        "title": format!("save {seed}"),
        "empty": null,
        "characters": characters,
        "modules": [{ "id": "core", "enabled": true }],
        "settings": { "theme": "dark", "fontSize": rng.gen_range(10..20) },
    })
}

async fn decode(payload: &[u8]) -> Value {
    StreamingDecoder::default()
        .decode(payload, &NoProgress, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_roundtrip_in_every_mode() {
    let codec = DocumentCodec::default();
    let chunked = StreamingEncoder::default().with_threshold(0);

    for (seed, size) in [(1u64, 0usize), (2, 1), (3, 37), (4, 250), (5, 1200)] {
        let document = random_document(seed, size);

        let raw = codec.encode(&document, EncodeMode::Raw).unwrap();
        assert_eq!(decode(&raw).await, document, "raw, seed {seed}");

        let compressed = codec.encode(&document, EncodeMode::Compressed).unwrap();
        assert_eq!(decode(&compressed).await, document, "compressed, seed {seed}");

        let streamed = chunked.encode(&document, &NoProgress, &CancellationToken::new()).await.unwrap();
        assert_eq!(streamed.variant, PayloadVariant::Chunked);
        assert_eq!(decode(&streamed.payload).await, document, "chunked, seed {seed}");
        assert_eq!(codec.decode(&streamed.payload).await.unwrap(), document);
    }
}

fn float_bits(document: &Value) -> Vec<u64> {
    document["characters"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["ratio"].as_f64().unwrap().to_bits())
        .collect()
}

#[tokio::test]
async fn test_floats_roundtrip_bit_exact() {
    let mut rng = StdRng::seed_from_u64(77);
    let characters: Vec<Value> = (0..5_000)
        .map(|_| {
            let ratio = rng.gen_range(-1e6..1e6) * 10f64.powi(rng.gen_range(-30..30));
            json!({ "ratio": ratio })
        })
        .collect();
    let document = json!({ "characters": characters });
    let expected = float_bits(&document);

    let codec = DocumentCodec::default();
    for mode in [EncodeMode::Raw, EncodeMode::Compressed] {
        let payload = codec.encode(&document, mode).unwrap();
        let decoded = decode(&payload).await;
        assert_eq!(float_bits(&decoded), expected, "{mode:?}");
        assert_eq!(decoded, document);
    }

    let streamed = StreamingEncoder::default()
        .with_threshold(0)
        .encode(&document, &NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    let decoded = decode(&streamed.payload).await;
    assert_eq!(float_bits(&decoded), expected, "chunked");
    assert_eq!(decoded, document);
}

#[tokio::test]
async fn test_roundtrip_without_bulk_array() {
    let document = json!({ "name": "solo", "settings": { "a": [1, 2] }, "count": 3 });
    let encoded = StreamingEncoder::default()
        .with_bulk_field("missing")
        .with_threshold(0)
        .encode(&document, &NoProgress, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(encoded.variant, PayloadVariant::Chunked);
    assert_eq!(decode(&encoded.payload).await, document);
}

#[test]
fn test_format_detection_by_tag() {
    for variant in [PayloadVariant::Raw, PayloadVariant::Compressed, PayloadVariant::Chunked] {
        let mut payload = variant.header().to_vec();
        payload.extend_from_slice(b"\xff\x00 arbitrary, not a valid body");
        assert_eq!(detect_variant(&payload).unwrap(), variant);
    }

    let header_only = PayloadVariant::Chunked.header();
    assert_eq!(detect_variant(&header_only).unwrap(), PayloadVariant::Chunked);

    assert!(matches!(
        detect_variant(&header_only[..HEADER_LEN - 1]),
        Err(KeepsakeError::TruncatedPayload { len }) if len == HEADER_LEN - 1
    ));
}

#[tokio::test]
async fn test_threshold_boundary_is_exclusive() {
    let document = random_document(9, 40);
    let estimate = estimate_document_size(&document, Some("characters")).unwrap();

    let at = StreamingEncoder::default()
        .with_threshold(estimate)
        .encode(&document, &NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(at.estimated_size, estimate);
    assert_eq!(at.variant, PayloadVariant::Chunked);

    let above = StreamingEncoder::default()
        .with_threshold(estimate + 1)
        .encode(&document, &NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(above.variant, PayloadVariant::Compressed);
}

/// Split an uncompressed chunked payload into its batches, in frame order
fn collect_batches(payload: &[u8]) -> (StreamMetadata, Vec<(usize, Vec<Value>)>) {
    let mut body = &payload[HEADER_LEN..];
    let mut metadata = None;
    let mut batches = Vec::new();

    loop {
        match read_frame(&mut body) {
            FrameRead::Frame(frame) if frame.key == METADATA_KEY => {
                metadata = Some(serde_json::from_value(frame.data).unwrap());
            }
            FrameRead::Frame(frame) => {
                if let Some((_, index)) = parse_collection_key(&frame.key) {
                    batches.push((index, frame.data.as_array().unwrap().clone()));
                }
            }
            FrameRead::End => break,
            FrameRead::Malformed(reason) => panic!("malformed frame: {reason}"),
        }
    }
    (metadata.unwrap(), batches)
}

#[tokio::test]
async fn test_batch_partition_completeness() {
    let encoder = StreamingEncoder::new(DocumentCodec::new(NoCompression::new())).with_threshold(0);

    for n in [0usize, 1, 99, 100, 999, 1000, 5000, 5001] {
        let items: Vec<Value> = (0..n).map(|i| json!(i)).collect();
        let document = json!({ "items": items, "label": "partition" });

        let encoded = encoder.encode(&document, &NoProgress, &CancellationToken::new()).await.unwrap();
        let (metadata, batches) = collect_batches(&encoded.payload);

        let expected_size = BatchPolicy::Adaptive.batch_size(n);
        assert_eq!(metadata.count, n);
        assert_eq!(metadata.batches, batches.len(), "n={n}");
        assert!(batches.iter().enumerate().all(|(i, (index, _))| *index == i), "n={n}");
        assert!(batches.iter().all(|(_, batch)| batch.len() <= expected_size), "n={n}");

        let rejoined: Vec<Value> = batches.into_iter().flat_map(|(_, batch)| batch).collect();
        assert_eq!(rejoined, items, "n={n}");

        let decoded = StreamingDecoder::new(DocumentCodec::new(NoCompression::new()))
            .decode(&encoded.payload, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decoded, document, "n={n}");
    }
}

#[tokio::test]
async fn test_cancellation_before_start() {
    let token = CancellationToken::new();
    token.abort();
    let document = random_document(11, 10);

    let encoded = StreamingEncoder::default().encode(&document, &NoProgress, &token).await;
    assert!(matches!(encoded, Err(KeepsakeError::Aborted)));

    let payload = DocumentCodec::default().encode(&document, EncodeMode::Compressed).unwrap();
    let decoded = StreamingDecoder::default().decode(&payload, &NoProgress, &token).await;
    assert!(matches!(decoded, Err(KeepsakeError::Aborted)));
}

#[tokio::test]
async fn test_cancellation_mid_encode_is_bounded() {
    let document = random_document(12, 3000);
    let token = CancellationToken::new();
    let trigger = token.clone();

    let batches_seen = std::sync::Mutex::new(Vec::new());
    let reporter = |p: Progress| {
        if let Some(current) = p.current {
            batches_seen.lock().unwrap().push(current);
            if current == 3 {
                trigger.abort();
            }
        }
    };

    let result = StreamingEncoder::default()
        .with_threshold(0)
        .encode(&document, &reporter, &token)
        .await;
    assert!(matches!(result, Err(KeepsakeError::Aborted)));
    assert_eq!(*batches_seen.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_archive_framing() {
    let archive = write_archive(&[
        ArchiveEntry::new("a", &b"first"[..]),
        ArchiveEntry::new("b", &b"second entry"[..]),
    ])
    .unwrap();

    let entries: Vec<ArchiveEntry> = parse(&archive).collect::<Result<_, _>>().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!((entries[0].name.as_str(), &entries[0].data[..]), ("a", &b"first"[..]));
    assert_eq!((entries[1].name.as_str(), &entries[1].data[..]), ("b", &b"second entry"[..]));

    let truncated = &archive[..archive.len() - 3];
    let results: Vec<_> = parse(truncated).collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(KeepsakeError::CorruptArchive(_))));
}

#[test]
fn test_incremental_archive_decoding_waits_for_more_data() {
    let archive = write_archive(&[
        ArchiveEntry::new("a.png", vec![7u8; 300]),
        ArchiveEntry::new("database.bin", &b"document"[..]),
    ])
    .unwrap();

    let mut decoder = ArchiveDecoder::new();
    let mut names = Vec::new();
    for chunk in archive.chunks(7) {
        decoder.feed(chunk);
        while let Some(entry) = decoder.decode_next() {
            names.push(entry.name);
        }
    }
    assert_eq!(names, vec!["a.png", "database.bin"]);
    decoder.finish().unwrap();

    let mut short = ArchiveDecoder::new();
    short.feed(&archive[..archive.len() - 1]);
    assert!(short.decode_next().is_some());
    assert!(short.decode_next().is_none());
    assert!(matches!(short.finish(), Err(KeepsakeError::CorruptArchive(_))));
}
