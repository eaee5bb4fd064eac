/*!
Storage adapters for assets, documents and archives.

This module defines the storage abstraction (port) the orchestrator works
against and the concrete implementations (adapters). Keys are `/`-separated
relative paths; how they map onto a backend is up to the adapter.

Writes that must be all-or-nothing go through a [`StagedWriter`]: content is
invisible at its key until `commit` succeeds, and a writer dropped without
committing leaves the key untouched.
*/

#[cfg(feature = "local")]
pub mod local;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{KeepsakeError, Result};

#[cfg(feature = "local")]
pub use local::LocalFileStorage;

/// Join a storage directory and an entry name into a key
pub fn join_key(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Destination whose content only becomes visible on commit
#[async_trait]
pub trait StagedWriter: AsyncWrite + Unpin + Send {
    /// Publish everything written so far at the target key
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Storage abstraction used by the backup orchestrator
///
/// Failures are reported as `KeepsakeError::Storage` and are not retried.
#[async_trait]
pub trait AssetStorage: Send + Sync {
    /// Names of the entries directly inside `dir`, sorted
    ///
    /// A missing directory lists as empty.
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Size in bytes of the object at `key`
    async fn size(&self, key: &str) -> Result<u64>;

    /// Read the whole object at `key`
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Read up to `len` bytes starting at `offset`
    ///
    /// # Returns
    /// Fewer than `len` bytes only when the object ends first
    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Replace the object at `key`
    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Open the object at `key` for sequential reading
    async fn open_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>>;

    /// Open a staged writer targeting `key`
    async fn open_staged(&self, key: &str) -> Result<Box<dyn StagedWriter>>;

    /// Check if an object exists at `key`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete the object at `key`; deleting a missing object succeeds
    async fn delete(&self, key: &str) -> Result<()>;
}

type SharedMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Memory-based storage adapter
///
/// Objects live in a shared map; clones see the same objects. Useful for
/// tests and for hosts that hand archives around in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: SharedMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.data).keys().cloned().collect();
        keys.sort();
        keys
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        lock(&self.data)
            .get(key)
            .cloned()
            .ok_or_else(|| KeepsakeError::storage(format!("Object not found: {key}")))
    }
}

fn lock(data: &SharedMap) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl AssetStorage for MemoryStorage {
    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = join_key(dir, "");
        let mut names: Vec<String> = lock(&self.data)
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(str::to_owned)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn size(&self, key: &str) -> Result<u64> {
        lock(&self.data)
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| KeepsakeError::storage(format!("Object not found: {key}")))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.get(key)
    }

    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let data = lock(&self.data);
        let object = data
            .get(key)
            .ok_or_else(|| KeepsakeError::storage(format!("Object not found: {key}")))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(object.len());
        let end = start.saturating_add(usize::try_from(len).unwrap_or(usize::MAX)).min(object.len());
        Ok(object[start..end].to_vec())
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        lock(&self.data).insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn open_reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        Ok(Box::new(io::Cursor::new(self.get(key)?)))
    }

    async fn open_staged(&self, key: &str) -> Result<Box<dyn StagedWriter>> {
        Ok(Box::new(MemoryStagedWriter {
            key: key.to_string(),
            buffer: Vec::new(),
            data: Arc::clone(&self.data),
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(lock(&self.data).contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        lock(&self.data).remove(key);
        Ok(())
    }
}

/// Buffers writes and inserts them into the map on commit
struct MemoryStagedWriter {
    key: String,
    buffer: Vec<u8>,
    data: SharedMap,
}

impl AsyncWrite for MemoryStagedWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.buffer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.buffer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.buffer).poll_shutdown(cx)
    }
}

#[async_trait]
impl StagedWriter for MemoryStagedWriter {
    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryStagedWriter { key, buffer, data } = *self;
        lock(&data).insert(key, buffer);
        Ok(())
    }
}
