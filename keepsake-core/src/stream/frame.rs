/*!
Chunk frames of the chunked payload variant.

After decompression the body is a sequence of frames, each
`u32 LE length | JSON {key, data, timestamp}`. The length prefix makes every
frame self-delimiting without re-encoding it.
*/

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{KeepsakeError, Result};

/// Key of the single frame carrying document-level scalar fields
pub const METADATA_KEY: &str = "metadata";

/// Key of the single frame carrying every remaining field
pub const OTHER_KEY: &str = "other";

/// Version of the frame layout written by this crate
pub const CHUNKING_VERSION: u32 = 2;

/// Frames larger than this are rejected as corrupt
pub const MAX_FRAME_LEN: usize = 1 << 30;

const INITIAL_BODY_CAPACITY: usize = 64 * 1024;

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChunkFrame {
    pub key: String,
    pub data: Value,
    pub timestamp: i64,
}

#[derive(Serialize)]
struct FrameOut<'a, T: Serialize + ?Sized> {
    key: &'a str,
    data: &'a T,
    timestamp: i64,
}

/// Content of the `"metadata"` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    pub chunking_version: u32,
    /// Name of the bulk array field, if the document had one
    pub collection: Option<String>,
    /// Number of elements in the bulk array
    pub count: usize,
    /// Number of collection frames that follow
    pub batches: usize,
    /// Whether an `"other"` frame follows
    pub has_other: bool,
    /// Top-level scalar fields of the document
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Frame key for batch `index` of `collection`
pub fn collection_key(collection: &str, index: usize) -> String {
    format!("{collection}_{index}")
}

/// Split a `"<collection>_<index>"` key
pub fn parse_collection_key(key: &str) -> Option<(&str, usize)> {
    let (collection, index) = key.rsplit_once('_')?;
    if collection.is_empty() {
        return None;
    }
    Some((collection, index.parse().ok()?))
}

/// Serialize one frame with its length prefix into `sink`
///
/// Returns the number of bytes written.
pub fn write_frame<W, T>(sink: &mut W, key: &str, data: &T, timestamp: i64) -> Result<usize>
where
    W: Write + ?Sized,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(&FrameOut {
        key,
        data,
        timestamp,
    })
    .map_err(|e| KeepsakeError::encoding(format!("Failed to serialize frame '{key}': {e}")))?;

    if body.len() > MAX_FRAME_LEN {
        return Err(KeepsakeError::encoding(format!(
            "frame '{key}' is {} bytes, above the {MAX_FRAME_LEN} byte limit",
            body.len()
        )));
    }

    sink.write_all(&(body.len() as u32).to_le_bytes())
        .and_then(|_| sink.write_all(&body))
        .map_err(|e| KeepsakeError::encoding(format!("Failed to write frame '{key}': {e}")))?;

    Ok(body.len() + 4)
}

/// Outcome of pulling one frame from a decompressed stream
#[derive(Debug)]
pub enum FrameRead {
    Frame(ChunkFrame),
    /// Input ended cleanly between frames
    End,
    /// Input ended or became unreadable inside a frame
    Malformed(String),
}

/// Pull the next frame from `source`
pub fn read_frame<R: Read + ?Sized>(source: &mut R) -> FrameRead {
    let mut prefix = [0u8; 4];
    match read_fully(source, &mut prefix) {
        Ok(0) => return FrameRead::End,
        Ok(4) => {}
        Ok(n) => return FrameRead::Malformed(format!("length prefix cut after {n} bytes")),
        Err(e) => return FrameRead::Malformed(format!("unreadable length prefix: {e}")),
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return FrameRead::Malformed(format!("frame length {len} exceeds limit"));
    }

    // The buffer grows with the bytes actually present, not the declared length
    let mut body = Vec::with_capacity(len.min(INITIAL_BODY_CAPACITY));
    match (&mut *source).take(len as u64).read_to_end(&mut body) {
        Ok(n) if n == len => {}
        Ok(n) => return FrameRead::Malformed(format!("frame body cut after {n} of {len} bytes")),
        Err(e) => return FrameRead::Malformed(format!("unreadable frame body: {e}")),
    }

    match serde_json::from_slice(&body) {
        Ok(frame) => FrameRead::Frame(frame),
        Err(e) => FrameRead::Malformed(format!("undecodable frame: {e}")),
    }
}

fn read_fully<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
