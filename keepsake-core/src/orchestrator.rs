/*!
Backup orchestration: building archives from storage and restoring them.

A save writes every asset first and the document entry last, into a staged
destination that is committed only once the archive is complete. A restore
walks the archive once, writing assets back as they are met and decoding
the document entry before installing it.
*/

use std::path::Path;
use std::sync::Arc;
#[cfg(feature = "remote-precheck")]
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::cancel::CancellationToken;
use crate::codec::DocumentCodec;
use crate::config::BackupConfig;
use crate::format::{detect_variant, PayloadVariant};
use crate::observability::BackupMetrics;
use crate::precheck::{DocumentPrecheck, PrecheckVerdict};
use crate::progress::{NoProgress, ProgressReporter, ProgressTracker};
use crate::storage::{join_key, AssetStorage, StagedWriter};
#[cfg(feature = "local")]
use crate::storage::LocalFileStorage;
use crate::stream::{estimate_document_size, select_bulk_field, StreamingDecoder, StreamingEncoder};
use crate::{KeepsakeError, Result};

/// Outcome of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    /// Assets written to the archive
    pub assets: usize,
    /// Asset body bytes written
    pub asset_bytes: u64,
    /// Encoded document payload size
    pub document_bytes: usize,
    pub document_variant: PayloadVariant,
    /// Chunked encoding failed and the compressed form was stored instead
    pub fell_back: bool,
    /// Total archive size
    pub archive_bytes: u64,
    /// Hex SHA-256 of the archive
    pub digest: String,
}

/// Outcome of a successful restore
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub document: Value,
    pub document_variant: PayloadVariant,
    pub assets_restored: usize,
    /// Asset body bytes written back to storage
    pub bytes_restored: u64,
}

/// Coordinates saves and restores against one storage backend
///
/// # Example
/// ```rust,no_run
/// use keepsake_core::{create_local_orchestrator, BackupConfig, CancellationToken, NoProgress};
/// use keepsake_core::storage::{AssetStorage, LocalFileStorage};
/// use serde_json::json;
///
/// # async fn run() -> keepsake_core::Result<()> {
/// let orchestrator = create_local_orchestrator("/var/lib/app", BackupConfig::default())?;
/// let destination = LocalFileStorage::new().open_staged("/tmp/backup.bin").await?;
///
/// let document = json!({ "formatversion": 4, "characters": [] });
/// let report = orchestrator
///     .save(&document, destination, &NoProgress, &CancellationToken::new())
///     .await?;
/// println!("archived {} assets, digest {}", report.assets, report.digest);
/// # Ok(())
/// # }
/// ```
pub struct BackupOrchestrator<S> {
    storage: S,
    config: BackupConfig,
    encoder: StreamingEncoder,
    decoder: StreamingDecoder,
    precheck: Option<Box<dyn DocumentPrecheck>>,
    metrics: Option<Arc<BackupMetrics>>,
}

impl<S: AssetStorage> BackupOrchestrator<S> {
    /// Create an orchestrator over `storage`
    ///
    /// With the `remote-precheck` feature, a configured pre-check endpoint is
    /// wired up automatically.
    pub fn new(storage: S, config: BackupConfig) -> Result<Self> {
        config.validate()?;

        let mut encoder = StreamingEncoder::new(DocumentCodec::gzip(config.compression_level))
            .with_threshold(config.chunking_threshold)
            .with_batch_policy(config.batch_policy);
        if let Some(field) = &config.bulk_field {
            encoder = encoder.with_bulk_field(field.clone());
        }

        let mut orchestrator = Self {
            storage,
            encoder,
            decoder: StreamingDecoder::new(DocumentCodec::gzip(config.compression_level)),
            precheck: None,
            metrics: None,
            config,
        };

        if let Some(endpoint) = orchestrator.config.precheck.endpoint.clone() {
            orchestrator.configure_remote_precheck(&endpoint)?;
        }
        Ok(orchestrator)
    }

    #[cfg(feature = "remote-precheck")]
    fn configure_remote_precheck(&mut self, endpoint: &str) -> Result<()> {
        let timeout = Duration::from_secs(self.config.precheck.timeout_secs);
        self.precheck = Some(Box::new(crate::precheck::HttpPrecheck::new(endpoint, timeout)?));
        Ok(())
    }

    #[cfg(not(feature = "remote-precheck"))]
    fn configure_remote_precheck(&mut self, endpoint: &str) -> Result<()> {
        warn!(endpoint, "Pre-check endpoint configured but remote-precheck support is not compiled in");
        Ok(())
    }

    /// Replace the document pre-check
    pub fn with_precheck(mut self, precheck: impl DocumentPrecheck + 'static) -> Self {
        self.precheck = Some(Box::new(precheck));
        self
    }

    /// Record operations into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<BackupMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn record(&self, f: impl FnOnce(&BackupMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    /// Fail with `Aborted` if `token` tripped before the operation started
    fn check_entry(&self, token: &CancellationToken) -> Result<()> {
        token.check().map_err(|e| {
            self.record(BackupMetrics::record_abort);
            e
        })
    }

    fn record_outcome<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {}
            Err(KeepsakeError::Aborted) => self.record(BackupMetrics::record_abort),
            Err(_) => self.record(BackupMetrics::record_failure),
        }
    }

    /// Build an archive of every asset plus `document` into `destination`
    ///
    /// `destination` is committed only after the whole archive is written;
    /// on any error or cancellation it is dropped and nothing is published.
    ///
    /// # Errors
    /// * `Aborted` if `token` trips, including before the call
    /// * `PrecheckRejected` if the remote pre-check reports corruption
    /// * `Storage` for failures reading assets or writing the archive
    pub async fn save(
        &self,
        document: &Value,
        destination: Box<dyn StagedWriter>,
        progress: &dyn ProgressReporter,
        token: &CancellationToken,
    ) -> Result<BackupReport> {
        self.check_entry(token)?;

        let timer = self.metrics.as_ref().map(|m| m.start_timer());
        let result = self.run_save(document, destination, progress, token).await;
        if let Some(timer) = timer {
            timer.finish();
        }

        self.record_outcome(&result);
        match &result {
            Ok(report) => {
                self.record(BackupMetrics::record_save);
                info!(
                    assets = report.assets,
                    archive_bytes = report.archive_bytes,
                    variant = %report.document_variant,
                    digest = %report.digest,
                    "Backup saved"
                );
            }
            Err(e) => warn!(error = %e, "Backup save failed"),
        }
        result
    }

    /// Save into a staged object at `key` of this orchestrator's storage
    pub async fn save_to_key(
        &self,
        document: &Value,
        key: &str,
        progress: &dyn ProgressReporter,
        token: &CancellationToken,
    ) -> Result<BackupReport> {
        self.check_entry(token)?;
        let destination = self.storage.open_staged(key).await;
        self.record_outcome(&destination);
        self.save(document, destination?, progress, token).await
    }

    async fn run_save(
        &self,
        document: &Value,
        destination: Box<dyn StagedWriter>,
        progress: &dyn ProgressReporter,
        token: &CancellationToken,
    ) -> Result<BackupReport> {
        let tracker = ProgressTracker::new(progress);
        tracker.update(0.0, "Preparing backup");

        self.run_precheck(document).await?;
        token.check()?;

        let names = self.backup_assets().await?;
        let mut writer = ArchiveWriter::new(destination);
        let mut asset_bytes = 0u64;

        for (index, name) in names.iter().enumerate() {
            token.check()?;
            asset_bytes += self.archive_asset(&mut writer, name, token).await?;

            let done = index + 1;
            tracker.update_counts(
                5.0 + 65.0 * done as f32 / names.len() as f32,
                "Archiving assets",
                done,
                names.len(),
            );
        }

        token.check()?;
        tracker.update(70.0, "Encoding document");
        let encoded = {
            let document_progress = ProgressTracker::scaled(&tracker, 70.0, 95.0);
            self.encoder.encode(document, &document_progress, token).await?
        };
        if encoded.fell_back {
            self.record(BackupMetrics::record_fallback);
        }
        self.record(|m| m.record_document_size(encoded.payload.len()));

        writer
            .write_entry(&self.config.document_entry_name, &encoded.payload)
            .await?;

        token.check()?;
        tracker.update(97.0, "Finalizing archive");
        let (destination, summary) = writer.finish().await?;

        token.check()?;
        destination.commit().await?;
        tracker.update(100.0, "Backup complete");

        Ok(BackupReport {
            assets: names.len(),
            asset_bytes,
            document_bytes: encoded.payload.len(),
            document_variant: encoded.variant,
            fell_back: encoded.fell_back,
            archive_bytes: summary.bytes_written,
            digest: summary.digest,
        })
    }

    async fn run_precheck(&self, document: &Value) -> Result<()> {
        let Some(precheck) = &self.precheck else {
            return Ok(());
        };

        let bulk = document
            .as_object()
            .and_then(|map| select_bulk_field(map, self.config.bulk_field.as_deref()));
        let limit = self.config.precheck.max_document_bytes;
        match estimate_document_size(document, bulk) {
            Ok(size) if size <= limit => {}
            Ok(size) => {
                info!(size, limit, "Skipping pre-check for oversized document");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Skipping pre-check, document size unknown");
                return Ok(());
            }
        }

        match precheck.check(document).await {
            PrecheckVerdict::Healthy => {
                debug!("Pre-check passed");
                Ok(())
            }
            PrecheckVerdict::Corrupt(reason) => Err(KeepsakeError::PrecheckRejected(reason)),
            PrecheckVerdict::Unavailable(reason) => {
                warn!(reason = %reason, "Pre-check unavailable, continuing with backup");
                Ok(())
            }
        }
    }

    /// Asset names to archive, sorted and filtered
    async fn backup_assets(&self) -> Result<Vec<String>> {
        let names = self.storage.list(&self.config.asset_dir).await?;
        Ok(names
            .into_iter()
            .filter(|name| {
                if *name == self.config.document_entry_name {
                    warn!(name = %name, "Skipping asset that shares the document entry name");
                    return false;
                }
                self.config.includes_asset(name)
            })
            .collect())
    }

    async fn archive_asset<W>(&self, writer: &mut ArchiveWriter<W>, name: &str, token: &CancellationToken) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let key = join_key(&self.config.asset_dir, name);
        let size = self.storage.size(&key).await?;

        if size < self.config.asset_streaming_threshold {
            let data = self.storage.read(&key).await?;
            writer.write_entry(name, &data).await?;
            debug!(name, bytes = data.len(), "Archived asset");
            self.record(|m| m.record_asset(data.len() as u64));
            return Ok(data.len() as u64);
        }

        writer.begin_entry(name, size).await?;
        let mut offset = 0u64;
        while offset < size {
            token.check()?;
            let want = self.config.asset_window_size.min(size - offset);
            let window = self.storage.read_range(&key, offset, want).await?;
            if window.is_empty() {
                return Err(KeepsakeError::storage(format!(
                    "asset {key} ended at {offset} of {size} bytes while archiving"
                )));
            }
            writer.write_body(&window).await?;
            offset += window.len() as u64;
        }

        debug!(name, bytes = size, "Archived asset in windows");
        self.record(|m| m.record_asset(size));
        Ok(size)
    }

    /// Decode the document currently installed in storage
    pub async fn load_installed_document(&self, token: &CancellationToken) -> Result<Value> {
        token.check()?;
        let payload = self.storage.read(&self.config.document_install_key).await?;
        self.decoder.decode(&payload, &NoProgress, token).await
    }

    /// Restore an archive read from `source`
    ///
    /// # Arguments
    /// * `source` - Archive bytes
    /// * `archive_len` - Total archive size, if known, for byte-based progress
    /// * `progress` - Receives non-decreasing percentages
    /// * `token` - Checked at entry, per entry and per window
    ///
    /// # Errors
    /// * `CorruptArchive` for framing errors, unsafe asset names, or a missing
    ///   or duplicated document entry
    /// * `Aborted` if `token` trips; assets already written stay in place
    pub async fn restore<R>(
        &self,
        source: R,
        archive_len: Option<u64>,
        progress: &dyn ProgressReporter,
        token: &CancellationToken,
    ) -> Result<RestoreReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check_entry(token)?;

        let timer = self.metrics.as_ref().map(|m| m.start_timer());
        let result = self.run_restore(source, archive_len, progress, token).await;
        if let Some(timer) = timer {
            timer.finish();
        }

        self.record_outcome(&result);
        match &result {
            Ok(report) => {
                self.record(BackupMetrics::record_restore);
                info!(
                    assets = report.assets_restored,
                    bytes = report.bytes_restored,
                    variant = %report.document_variant,
                    "Backup restored"
                );
            }
            Err(e) => warn!(error = %e, "Restore failed"),
        }
        result
    }

    /// Restore the archive stored at `key` of this orchestrator's storage
    pub async fn restore_from_key(
        &self,
        key: &str,
        progress: &dyn ProgressReporter,
        token: &CancellationToken,
    ) -> Result<RestoreReport> {
        self.check_entry(token)?;
        let opened = match self.storage.size(key).await {
            Ok(len) => self.storage.open_reader(key).await.map(|source| (source, len)),
            Err(e) => Err(e),
        };
        self.record_outcome(&opened);
        let (source, len) = opened?;
        self.restore(source, Some(len), progress, token).await
    }

    async fn run_restore<R>(
        &self,
        source: R,
        archive_len: Option<u64>,
        progress: &dyn ProgressReporter,
        token: &CancellationToken,
    ) -> Result<RestoreReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        let tracker = ProgressTracker::new(progress);
        tracker.update(0.0, "Reading archive");

        let mut reader = ArchiveReader::new(source);
        let mut document: Option<(Value, PayloadVariant)> = None;
        let mut assets_restored = 0usize;
        let mut bytes_restored = 0u64;

        while let Some(header) = reader.next_entry().await? {
            token.check()?;

            if header.name == self.config.document_entry_name {
                if document.is_some() {
                    return Err(KeepsakeError::corrupt("archive holds more than one document entry"));
                }
                let start = percent_of(reader.bytes_read(), archive_len);
                let end = percent_of(reader.bytes_read() + header.len, archive_len);
                tracker.update(start, "Decoding document");
                let payload = reader.read_body().await?;
                let variant = detect_variant(&payload)?;
                let value = {
                    let document_progress = ProgressTracker::scaled(&tracker, start, end);
                    self.decoder.decode(&payload, &document_progress, token).await?
                };
                self.install_document(&payload).await?;
                document = Some((value, variant));
            } else {
                check_asset_name(&header.name)?;
                bytes_restored += self.restore_asset(&mut reader, &header.name, header.len, token).await?;
                assets_restored += 1;
                self.record(|m| m.record_asset(header.len));
            }

            tracker.update(percent_of(reader.bytes_read(), archive_len), "Restoring entries");
        }

        let Some((document, document_variant)) = document else {
            return Err(KeepsakeError::corrupt(format!(
                "archive has no '{}' document entry",
                self.config.document_entry_name
            )));
        };

        tracker.update(100.0, "Restore complete");
        Ok(RestoreReport {
            document,
            document_variant,
            assets_restored,
            bytes_restored,
        })
    }

    async fn install_document(&self, payload: &[u8]) -> Result<()> {
        let mut staged = self.storage.open_staged(&self.config.document_install_key).await?;
        staged.write_all(payload).await.map_err(|e| {
            KeepsakeError::storage(format!("Failed to install document: {e}"))
        })?;
        staged.commit().await?;
        debug!(key = %self.config.document_install_key, bytes = payload.len(), "Installed document");
        Ok(())
    }

    async fn restore_asset<R>(
        &self,
        reader: &mut ArchiveReader<R>,
        name: &str,
        len: u64,
        token: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = join_key(&self.config.asset_dir, name);

        if len < self.config.asset_streaming_threshold {
            let body = reader.read_body().await?;
            self.storage.write(&key, &body).await?;
            debug!(name, bytes = body.len(), "Restored asset");
            return Ok(body.len() as u64);
        }

        let window_size = usize::try_from(self.config.asset_window_size).unwrap_or(usize::MAX);
        let mut staged = self.storage.open_staged(&key).await?;
        let mut written = 0u64;
        while let Some(window) = reader.read_window(window_size).await? {
            token.check()?;
            staged
                .write_all(&window)
                .await
                .map_err(|e| KeepsakeError::storage(format!("Failed to write {key}: {e}")))?;
            written += window.len() as u64;
        }
        staged.commit().await?;

        debug!(name, bytes = written, "Restored asset in windows");
        Ok(written)
    }
}

fn percent_of(done: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (done as f64 / total as f64 * 100.0).min(99.0) as f32,
        _ => 0.0,
    }
}

/// Asset entries must name a single file inside the asset directory
fn check_asset_name(name: &str) -> Result<()> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute();
    if unsafe_name {
        return Err(KeepsakeError::corrupt(format!("unsafe asset entry name '{name}'")));
    }
    Ok(())
}

/// Create an orchestrator over a local data directory
///
/// # Arguments
/// * `data_dir` - Directory holding the asset directory and the installed document
/// * `config` - Backup configuration; validated here
#[cfg(feature = "local")]
pub fn create_local_orchestrator(
    data_dir: impl AsRef<Path>,
    config: BackupConfig,
) -> Result<BackupOrchestrator<LocalFileStorage>> {
    BackupOrchestrator::new(LocalFileStorage::with_base_dir(data_dir), config)
}
