/*!
End-to-end tests of saving and restoring archives on the local filesystem.
*/

use std::path::Path;
use std::sync::{Arc, Mutex};

use keepsake_core::{
    create_local_orchestrator, parse, AssetStorage, BackupConfig, BackupMetrics, BatchPolicy,
    CancellationToken, DocumentCodec, EncodeMode, KeepsakeError, LocalFileStorage, NoProgress,
    PayloadVariant, Progress, StreamingDecoder,
};
use serde_json::{json, Value};
use tempfile::TempDir;

fn campaign_document(characters: usize) -> Value {
    let characters: Vec<Value> = (0..characters)
        .map(|i| {
            json!({
                "chaId": format!("cha-{i}"),
                "name": format!("Adventurer {i}"),
                "chats": [{ "message": [{ "role": "char", "data": "Hello there!" }] }],
                "image": format!("portrait-{i}.png"),
            })
        })
        .collect();

    json!({
        "formatversion": 4,
        "username": "player",
        "characters": characters,
        "botPresets": [{ "name": "default", "temperature": 0.7 }],
        "customCSS": "",
    })
}

fn write_file(root: &Path, relative: &str, data: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

fn seed_data_dir(root: &Path, document: &Value, config: &BackupConfig) {
    write_file(root, "assets/portrait-0.png", &[0x89, b'P', b'N', b'G', 1, 2, 3]);
    write_file(root, "assets/portrait-1.png", &vec![42u8; 4096]);
    write_file(root, "assets/theme.css", b"body { color: red; }");

    let payload = DocumentCodec::default()
        .encode(document, EncodeMode::Compressed)
        .unwrap();
    write_file(root, &config.document_install_key, &payload);
}

fn windowed_config() -> BackupConfig {
    BackupConfig {
        asset_streaming_threshold: 1024,
        asset_window_size: 300,
        ..BackupConfig::default()
    }
}

#[tokio::test]
async fn test_save_and_restore_between_data_dirs() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let config = windowed_config();
    let document = campaign_document(12);
    seed_data_dir(source.path(), &document, &config);

    let saver = create_local_orchestrator(source.path(), config.clone()).unwrap();
    let installed = saver.load_installed_document(&CancellationToken::new()).await.unwrap();
    assert_eq!(installed, document);

    let report = saver
        .save_to_key(&installed, "backups/latest.bin", &NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.assets, 3);
    assert_eq!(report.asset_bytes, 7 + 4096 + 20);
    assert_eq!(report.document_variant, PayloadVariant::Compressed);
    assert!(!report.fell_back);

    let archive_path = source.path().join("backups/latest.bin");
    let archive = std::fs::read(&archive_path).unwrap();
    assert_eq!(archive.len() as u64, report.archive_bytes);

    let names: Vec<String> = parse(&archive).map(|entry| entry.unwrap().name).collect();
    assert_eq!(
        names,
        vec!["portrait-0.png", "portrait-1.png", "theme.css", "database.bin"]
    );

    let restorer = create_local_orchestrator(target.path(), config.clone()).unwrap();
    let file = tokio::fs::File::open(&archive_path).await.unwrap();
    let restored = restorer
        .restore(file, Some(report.archive_bytes), &NoProgress, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(restored.document, document);
    assert_eq!(restored.assets_restored, 3);
    assert_eq!(restored.bytes_restored, report.asset_bytes);

    for name in ["portrait-0.png", "portrait-1.png", "theme.css"] {
        let original = std::fs::read(source.path().join("assets").join(name)).unwrap();
        let copy = std::fs::read(target.path().join("assets").join(name)).unwrap();
        assert_eq!(original, copy, "{name}");
    }

    let reinstalled = restorer.load_installed_document(&CancellationToken::new()).await.unwrap();
    assert_eq!(reinstalled, document);
}

#[tokio::test]
async fn test_large_document_is_chunked_and_restored() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let config = BackupConfig {
        chunking_threshold: 1024,
        batch_policy: BatchPolicy::Fixed(7),
        ..windowed_config()
    };
    let document = campaign_document(150);
    seed_data_dir(source.path(), &document, &config);

    let metrics = Arc::new(BackupMetrics::new().unwrap());
    let saver = create_local_orchestrator(source.path(), config.clone())
        .unwrap()
        .with_metrics(metrics.clone());

    let seen = Mutex::new(Vec::new());
    let reporter = |p: Progress| seen.lock().unwrap().push(p.percent);
    let report = saver
        .save_to_key(&document, "out/chunked.bin", &reporter, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.document_variant, PayloadVariant::Chunked);

    let percents = seen.into_inner().unwrap();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100.0));

    let archive = std::fs::read(source.path().join("out/chunked.bin")).unwrap();
    let payload = parse(&archive)
        .map(|entry| entry.unwrap())
        .find(|entry| entry.name == config.document_entry_name)
        .unwrap()
        .data;
    let decoded = StreamingDecoder::default()
        .decode(&payload, &NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(decoded, document);

    std::fs::copy(
        source.path().join("out/chunked.bin"),
        target.path().join("incoming.bin"),
    )
    .unwrap();
    let restorer = create_local_orchestrator(target.path(), config).unwrap();
    let restored = restorer
        .restore_from_key("incoming.bin", &NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(restored.document, document);
    assert_eq!(restored.document_variant, PayloadVariant::Chunked);
}

#[tokio::test]
async fn test_aborted_save_publishes_nothing() {
    let source = TempDir::new().unwrap();
    let config = windowed_config();
    let document = campaign_document(3);
    seed_data_dir(source.path(), &document, &config);

    let orchestrator = create_local_orchestrator(source.path(), config).unwrap();
    let token = CancellationToken::new();
    let trigger = token.clone();
    let reporter = move |p: Progress| {
        if p.current == Some(2) {
            trigger.abort();
        }
    };

    let result = orchestrator
        .save_to_key(&document, "backups/aborted.bin", &reporter, &token)
        .await;
    assert!(matches!(result, Err(KeepsakeError::Aborted)));

    let storage = LocalFileStorage::with_base_dir(source.path());
    assert!(!storage.exists("backups/aborted.bin").await.unwrap());
    let leftovers = storage.list("backups").await.unwrap();
    assert!(leftovers.is_empty(), "staged files left behind: {leftovers:?}");
}

#[tokio::test]
async fn test_restore_rejects_truncated_archive() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let config = windowed_config();
    let document = campaign_document(2);
    seed_data_dir(source.path(), &document, &config);

    let saver = create_local_orchestrator(source.path(), config.clone()).unwrap();
    saver
        .save_to_key(&document, "full.bin", &NoProgress, &CancellationToken::new())
        .await
        .unwrap();

    let archive = std::fs::read(source.path().join("full.bin")).unwrap();
    write_file(target.path(), "cut.bin", &archive[..archive.len() - 10]);

    let restorer = create_local_orchestrator(target.path(), config.clone()).unwrap();
    let result = restorer
        .restore_from_key("cut.bin", &NoProgress, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(KeepsakeError::CorruptArchive(_))));
    assert!(!target.path().join(&config.document_install_key).exists());
}

#[tokio::test]
async fn test_config_file_drives_orchestrator() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("keepsake.json");
    std::fs::write(
        &config_path,
        r#"{ "asset_extensions": ["png"], "batch_policy": { "fixed": 25 } }"#,
    )
    .unwrap();

    let config = BackupConfig::from_json_file(&config_path).unwrap();
    assert_eq!(config.batch_policy, BatchPolicy::Fixed(25));

    let document = campaign_document(1);
    seed_data_dir(dir.path(), &document, &config);
    let orchestrator = create_local_orchestrator(dir.path(), config).unwrap();
    let report = orchestrator
        .save_to_key(&document, "filtered.bin", &NoProgress, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.assets, 2);
}
