/*!
Local filesystem storage adapter implementation.
*/

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{AssetStorage, StagedWriter};
use crate::{KeepsakeError, Result};

/// Local filesystem storage adapter
///
/// Keys are resolved against an optional base directory. Parent directories
/// are created on write; staged writes go to a temporary file in the target
/// directory and are renamed into place on commit.
///
/// # Example
/// ```rust
/// use keepsake_core::storage::LocalFileStorage;
///
/// let storage = LocalFileStorage::with_base_dir("/var/lib/keepsake/data");
/// // "assets/a.png" resolves to "/var/lib/keepsake/data/assets/a.png"
/// ```
#[derive(Debug, Clone, Default)]
pub struct LocalFileStorage {
    /// Optional base directory for all keys
    base_dir: Option<PathBuf>,
}

impl LocalFileStorage {
    /// Create a new local file storage adapter without a base directory
    ///
    /// Keys are used as paths as-is.
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    /// Create a new local file storage adapter with a base directory
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: Some(base_dir.as_ref().to_path_buf()),
        }
    }

    fn resolve_path(&self, key: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(key),
            None => PathBuf::from(key),
        }
    }

    async fn ensure_parent_dir(path: &Path) -> Result<PathBuf> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(|e| {
            KeepsakeError::storage(format!("Failed to create directory {}: {e}", parent.display()))
        })?;
        Ok(parent)
    }

    async fn open_file(&self, key: &str) -> Result<(fs::File, PathBuf)> {
        let path = self.resolve_path(key);
        let file = fs::File::open(&path)
            .await
            .map_err(|e| KeepsakeError::storage(format!("Failed to open {}: {e}", path.display())))?;
        Ok((file, path))
    }
}

#[async_trait]
impl AssetStorage for LocalFileStorage {
    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.resolve_path(dir);
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(KeepsakeError::storage(format!(
                    "Failed to list {}: {e}",
                    path.display()
                )))
            }
        };

        let mut names = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| KeepsakeError::storage(format!("Failed to list {}: {e}", path.display())))?;
            let Some(entry) = entry else { break };

            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let path = self.resolve_path(key);
        fs::metadata(&path)
            .await
            .map(|meta| meta.len())
            .map_err(|e| KeepsakeError::storage(format!("Failed to stat {}: {e}", path.display())))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve_path(key);
        fs::read(&path)
            .await
            .map_err(|e| KeepsakeError::storage(format!("Failed to read {}: {e}", path.display())))
    }

    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let (mut file, path) = self.open_file(key).await?;
        let io_error = |e: io::Error| {
            KeepsakeError::storage(format!("Failed to read range of {}: {e}", path.display()))
        };

        file.seek(SeekFrom::Start(offset)).await.map_err(io_error)?;
        let mut window = Vec::with_capacity(usize::try_from(len).unwrap_or(0).min(64 * 1024 * 1024));
        file.take(len).read_to_end(&mut window).await.map_err(io_error)?;
        Ok(window)
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve_path(key);
        Self::ensure_parent_dir(&path).await?;
        fs::write(&path, data)
            .await
            .map_err(|e| KeepsakeError::storage(format!("Failed to write {}: {e}", path.display())))?;
        debug!(path = %path.display(), bytes = data.len(), "Wrote object");
        Ok(())
    }

    async fn open_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let (file, _) = self.open_file(key).await?;
        Ok(Box::new(file))
    }

    async fn open_staged(&self, key: &str) -> Result<Box<dyn StagedWriter>> {
        let target = self.resolve_path(key);
        let parent = Self::ensure_parent_dir(&target).await?;

        let staging = NamedTempFile::new_in(&parent).map_err(|e| {
            KeepsakeError::storage(format!("Failed to stage write in {}: {e}", parent.display()))
        })?;
        let (file, temp_path) = staging.into_parts();

        Ok(Box::new(LocalStagedWriter {
            file: fs::File::from_std(file),
            temp_path,
            target,
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve_path(key);
        fs::try_exists(&path)
            .await
            .map_err(|e| KeepsakeError::storage(format!("Failed to stat {}: {e}", path.display())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeepsakeError::storage(format!(
                "Failed to delete {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Temporary file renamed over the target on commit
///
/// Dropping it uncommitted removes the temporary file.
struct LocalStagedWriter {
    file: fs::File,
    temp_path: TempPath,
    target: PathBuf,
}

impl AsyncWrite for LocalStagedWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl StagedWriter for LocalStagedWriter {
    async fn commit(self: Box<Self>) -> Result<()> {
        let LocalStagedWriter {
            mut file,
            temp_path,
            target,
        } = *self;

        let sync_error =
            |e: io::Error| KeepsakeError::storage(format!("Failed to sync staged {}: {e}", target.display()));
        file.flush().await.map_err(sync_error)?;
        file.sync_all().await.map_err(sync_error)?;
        drop(file);

        temp_path.persist(&target).map_err(|e| {
            KeepsakeError::storage(format!("Failed to commit {}: {}", target.display(), e.error))
        })?;
        debug!(path = %target.display(), "Committed staged write");
        Ok(())
    }
}
