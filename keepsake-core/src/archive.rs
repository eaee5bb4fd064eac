/*!
Archive container: a flat sequence of length-prefixed named entries.

Each entry is laid out as

```text
u32 LE name length | name bytes (UTF-8) | u32 LE data length | data bytes
```

Entries follow each other with no padding, no index and no trailer. An archive
is valid when it splits into a whole number of complete entries.

Three ways to read are provided:
- [`parse`] walks an in-memory archive lazily.
- [`ArchiveDecoder`] is fed arbitrary byte chunks and yields entries as soon
  as they are complete; an incomplete tail means "need more data".
- [`ArchiveReader`] pulls from an `AsyncRead` and lets the caller consume each
  entry body whole or in bounded windows.
*/

use bytes::{Buf, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{KeepsakeError, Result};

const LEN_PREFIX: usize = 4;

/// Entry names longer than this are treated as corruption by the reader
const MAX_NAME_LEN: usize = 64 * 1024;

/// One named entry of an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Bytes,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Size of this entry once framed
    pub fn encoded_len(&self) -> usize {
        LEN_PREFIX * 2 + self.name.len() + self.data.len()
    }
}

/// Header of an entry whose body has not been read yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub len: u64,
}

fn checked_len(len: u64, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        KeepsakeError::validation(format!("{what} of {len} bytes exceeds the 4 GiB entry limit"))
    })
}

/// Append the framed form of one entry to `out`
pub fn encode_entry(name: &str, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let name_len = checked_len(name.len() as u64, "entry name")?;
    let data_len = checked_len(data.len() as u64, "entry data")?;

    out.reserve(LEN_PREFIX * 2 + name.len() + data.len());
    out.extend_from_slice(&name_len.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// Frame a sequence of entries in submission order
pub fn write_archive<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a ArchiveEntry>,
{
    let mut out = Vec::new();
    for entry in entries {
        encode_entry(&entry.name, &entry.data, &mut out)?;
    }
    Ok(out)
}

/// Byte ranges of the first complete entry in a buffer
struct EntryLayout {
    name_start: usize,
    name_end: usize,
    data_start: usize,
    total: usize,
}

/// Locate the first entry in `buf`, or `None` if it is not complete yet
fn locate_entry(buf: &[u8]) -> Option<EntryLayout> {
    let name_len = read_u32_le(buf, 0)? as usize;
    let name_start = LEN_PREFIX;
    let name_end = name_start.checked_add(name_len)?;
    let data_len = read_u32_le(buf, name_end)? as usize;
    let data_start = name_end + LEN_PREFIX;
    let total = data_start.checked_add(data_len)?;

    (total <= buf.len()).then_some(EntryLayout {
        name_start,
        name_end,
        data_start,
        total,
    })
}

fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(LEN_PREFIX)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn decode_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Lazily walk the entries of an in-memory archive
///
/// The iterator is fused: after yielding a `CorruptArchive` error for an
/// incomplete tail it yields nothing more.
///
/// # Example
/// ```rust
/// use keepsake_core::archive::{parse, write_archive, ArchiveEntry};
///
/// let bytes = write_archive(&[ArchiveEntry::new("a", &b"1"[..])])?;
/// let entries: Vec<_> = parse(&bytes).collect::<Result<_, _>>()?;
/// assert_eq!(entries[0].name, "a");
/// # Ok::<(), keepsake_core::KeepsakeError>(())
/// ```
pub fn parse(bytes: &[u8]) -> ArchiveEntries<'_> {
    ArchiveEntries {
        remaining: bytes,
        offset: 0,
        done: false,
    }
}

/// Iterator returned by [`parse`]
pub struct ArchiveEntries<'a> {
    remaining: &'a [u8],
    offset: usize,
    done: bool,
}

impl Iterator for ArchiveEntries<'_> {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining.is_empty() {
            return None;
        }

        match locate_entry(self.remaining) {
            Some(layout) => {
                let entry = ArchiveEntry {
                    name: decode_name(&self.remaining[layout.name_start..layout.name_end]),
                    data: Bytes::copy_from_slice(&self.remaining[layout.data_start..layout.total]),
                };
                self.remaining = &self.remaining[layout.total..];
                self.offset += layout.total;
                Some(Ok(entry))
            }
            None => {
                self.done = true;
                Some(Err(KeepsakeError::corrupt(format!(
                    "incomplete entry at offset {} ({} trailing bytes)",
                    self.offset,
                    self.remaining.len()
                ))))
            }
        }
    }
}

impl std::iter::FusedIterator for ArchiveEntries<'_> {}

/// Push-based incremental archive parser
///
/// Feed it chunks as they arrive from storage; `decode_next` returns complete
/// entries and `None` while the buffered tail is still incomplete. Only
/// `finish`, called once the input is exhausted, turns leftover bytes into an
/// error.
#[derive(Debug, Default)]
pub struct ArchiveDecoder {
    buffer: BytesMut,
    consumed: u64,
}

impl ArchiveDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append more input
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes held back waiting for the rest of an entry
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete entry, if one is buffered
    pub fn decode_next(&mut self) -> Option<ArchiveEntry> {
        let layout = locate_entry(&self.buffer)?;

        let mut frame = self.buffer.split_to(layout.total).freeze();
        let name = decode_name(&frame[layout.name_start..layout.name_end]);
        frame.advance(layout.data_start);
        self.consumed += layout.total as u64;

        trace!(name = %name, len = frame.len(), "Decoded archive entry");
        Some(ArchiveEntry { name, data: frame })
    }

    /// Declare end of input
    ///
    /// # Errors
    /// `CorruptArchive` if bytes of an incomplete entry remain buffered
    pub fn finish(self) -> Result<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(KeepsakeError::corrupt(format!(
                "archive ends inside an entry at offset {} ({} bytes buffered)",
                self.consumed,
                self.buffer.len()
            )))
        }
    }
}

/// Summary of a finished archive write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: usize,
    pub bytes_written: u64,
    /// Hex SHA-256 of every byte written
    pub digest: String,
}

/// Streaming archive writer over any `AsyncWrite`
///
/// Entries can be written whole with [`write_entry`](Self::write_entry) or
/// piecewise with [`begin_entry`](Self::begin_entry) followed by
/// [`write_body`](Self::write_body) calls that must add up to the declared
/// length.
pub struct ArchiveWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
    entries: usize,
    body_remaining: u64,
}

impl<W: AsyncWrite + Unpin> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
            entries: 0,
            body_remaining: 0,
        }
    }

    async fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .await
            .map_err(|e| KeepsakeError::storage(format!("Failed to write archive: {e}")))?;
        self.hasher.update(bytes);
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Write a complete entry
    pub async fn write_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.begin_entry(name, data.len() as u64).await?;
        self.write_body(data).await
    }

    /// Write an entry header announcing `len` body bytes
    pub async fn begin_entry(&mut self, name: &str, len: u64) -> Result<()> {
        if self.body_remaining != 0 {
            return Err(KeepsakeError::encoding(format!(
                "cannot start entry '{name}': previous entry is missing {} body bytes",
                self.body_remaining
            )));
        }

        let name_len = checked_len(name.len() as u64, "entry name")?;
        let data_len = checked_len(len, "entry data")?;

        self.put(&name_len.to_le_bytes()).await?;
        self.put(name.as_bytes()).await?;
        self.put(&data_len.to_le_bytes()).await?;

        self.body_remaining = len;
        self.entries += 1;
        debug!(name = %name, len, "Writing archive entry");
        Ok(())
    }

    /// Write part of the current entry body
    pub async fn write_body(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() as u64 > self.body_remaining {
            return Err(KeepsakeError::encoding(format!(
                "entry body overflow: {} bytes written with {} remaining",
                chunk.len(),
                self.body_remaining
            )));
        }
        self.put(chunk).await?;
        self.body_remaining -= chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and return the underlying writer together with a summary
    pub async fn finish(mut self) -> Result<(W, ArchiveSummary)> {
        if self.body_remaining != 0 {
            return Err(KeepsakeError::encoding(format!(
                "archive closed with {} body bytes missing",
                self.body_remaining
            )));
        }

        self.inner
            .flush()
            .await
            .map_err(|e| KeepsakeError::storage(format!("Failed to flush archive: {e}")))?;

        let summary = ArchiveSummary {
            entries: self.entries,
            bytes_written: self.bytes_written,
            digest: format!("{:x}", self.hasher.finalize()),
        };
        Ok((self.inner, summary))
    }
}

/// Largest single allocation `ArchiveReader::read_body` makes up front
const BODY_WINDOW: usize = 1 << 20;

/// Pull-based archive reader over any `AsyncRead`
///
/// End of input exactly between entries is the normal end of the archive;
/// end of input anywhere else is `CorruptArchive`.
pub struct ArchiveReader<R> {
    inner: R,
    body_remaining: u64,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            body_remaining: 0,
            bytes_read: 0,
        }
    }

    /// Bytes consumed from the underlying reader so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Body bytes of the current entry not yet consumed
    pub fn body_remaining(&self) -> u64 {
        self.body_remaining
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .inner
                .read(&mut buf[filled..])
                .await
                .map_err(|e| KeepsakeError::storage(format!("Failed to read archive: {e}")))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.bytes_read += filled as u64;
        Ok(filled)
    }

    async fn fill_exact(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let offset = self.bytes_read;
        let filled = self.fill(buf).await?;
        if filled < buf.len() {
            return Err(KeepsakeError::corrupt(format!(
                "archive ends inside {what} at offset {offset} ({filled} of {} bytes)",
                buf.len()
            )));
        }
        Ok(())
    }

    /// Advance to the next entry, skipping any unread body of the current one
    ///
    /// Returns `None` at the clean end of the archive.
    pub async fn next_entry(&mut self) -> Result<Option<EntryHeader>> {
        while self.body_remaining > 0 {
            let skip = self.body_remaining.min(64 * 1024) as usize;
            self.read_window(skip).await?;
        }

        let mut prefix = [0u8; LEN_PREFIX];
        let offset = self.bytes_read;
        match self.fill(&mut prefix).await? {
            0 => return Ok(None),
            LEN_PREFIX => {}
            n => {
                return Err(KeepsakeError::corrupt(format!(
                    "archive ends inside a length prefix at offset {offset} ({n} of 4 bytes)"
                )))
            }
        }

        let name_len = u32::from_le_bytes(prefix) as usize;
        if name_len > MAX_NAME_LEN {
            return Err(KeepsakeError::corrupt(format!(
                "entry name length {name_len} at offset {offset} is implausible"
            )));
        }
        let mut name = vec![0u8; name_len];
        self.fill_exact(&mut name, "an entry name").await?;
        self.fill_exact(&mut prefix, "a length prefix").await?;

        let header = EntryHeader {
            name: decode_name(&name),
            len: u32::from_le_bytes(prefix) as u64,
        };
        self.body_remaining = header.len;
        trace!(name = %header.name, len = header.len, "Read archive entry header");
        Ok(Some(header))
    }

    /// Read the rest of the current entry body in one buffer
    ///
    /// The body is read in windows so a corrupt length prefix cannot
    /// allocate more than the input actually holds.
    pub async fn read_body(&mut self) -> Result<Vec<u8>> {
        let expected = self.body_remaining;
        let mut body = Vec::with_capacity(expected.min(BODY_WINDOW as u64) as usize);
        while let Some(window) = self.read_window(BODY_WINDOW).await? {
            body.extend_from_slice(&window);
        }
        debug_assert_eq!(body.len() as u64, expected);
        Ok(body)
    }

    /// Read at most `max` bytes of the current entry body
    ///
    /// Returns `None` once the body is exhausted.
    pub async fn read_window(&mut self, max: usize) -> Result<Option<Vec<u8>>> {
        if self.body_remaining == 0 {
            return Ok(None);
        }
        let len = self.body_remaining.min(max.max(1) as u64) as usize;
        let mut window = vec![0u8; len];
        self.fill_exact(&mut window, "an entry body").await?;
        self.body_remaining -= len as u64;
        Ok(Some(window))
    }
}
