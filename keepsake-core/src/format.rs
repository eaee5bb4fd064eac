/*!
Document payload header and variant detection.

Every document payload starts with an 11-byte header: a fixed 10-byte magic
prefix followed by a single variant tag.
*/

use std::fmt;

use crate::{KeepsakeError, Result};

/// Fixed prefix shared by every payload variant
pub const MAGIC_PREFIX: [u8; 10] = [0, 82, 73, 83, 85, 83, 65, 86, 69, 0];

/// Total header length, prefix plus variant tag
pub const HEADER_LEN: usize = MAGIC_PREFIX.len() + 1;

/// The three document payload encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadVariant {
    /// Serialized document with no compression
    Raw,
    /// Serialized document compressed as a single buffer
    Compressed,
    /// Compressed sequence of length-prefixed chunk frames
    Chunked,
}

impl PayloadVariant {
    pub const fn tag(self) -> u8 {
        match self {
            PayloadVariant::Raw => 7,
            PayloadVariant::Compressed => 8,
            PayloadVariant::Chunked => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            7 => Some(PayloadVariant::Raw),
            8 => Some(PayloadVariant::Compressed),
            9 => Some(PayloadVariant::Chunked),
            _ => None,
        }
    }

    /// The full 11-byte header for this variant
    pub fn header(self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..MAGIC_PREFIX.len()].copy_from_slice(&MAGIC_PREFIX);
        header[MAGIC_PREFIX.len()] = self.tag();
        header
    }

    pub fn name(self) -> &'static str {
        match self {
            PayloadVariant::Raw => "raw",
            PayloadVariant::Compressed => "compressed",
            PayloadVariant::Chunked => "chunked",
        }
    }
}

impl fmt::Display for PayloadVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classify a payload by its header without touching the body
///
/// # Errors
/// * `TruncatedPayload` - fewer than 11 bytes are present
/// * `UnknownFormat` - the prefix does not match or the tag is not recognised
pub fn detect_variant(payload: &[u8]) -> Result<PayloadVariant> {
    if payload.len() < HEADER_LEN {
        return Err(KeepsakeError::TruncatedPayload { len: payload.len() });
    }

    if payload[..MAGIC_PREFIX.len()] != MAGIC_PREFIX {
        return Err(KeepsakeError::UnknownFormat(
            "missing document magic prefix".to_string(),
        ));
    }

    let tag = payload[MAGIC_PREFIX.len()];
    PayloadVariant::from_tag(tag)
        .ok_or_else(|| KeepsakeError::UnknownFormat(format!("unrecognised variant tag {tag}")))
}

/// Split a payload into its variant and body
pub fn split_payload(payload: &[u8]) -> Result<(PayloadVariant, &[u8])> {
    let variant = detect_variant(payload)?;
    Ok((variant, &payload[HEADER_LEN..]))
}

/// Prepend the variant header to a body
pub fn with_header(variant: PayloadVariant, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HEADER_LEN + body.len());
    payload.extend_from_slice(&variant.header());
    payload.extend_from_slice(body);
    payload
}
