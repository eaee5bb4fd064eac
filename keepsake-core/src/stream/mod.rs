/*!
Chunked streaming encode and decode of oversized documents.

A document whose estimated size reaches the chunking threshold is split into
a metadata frame, one frame per batch of its bulk array, and a frame holding
every remaining field. Frames are compressed as they are produced and decoded
as they are decompressed, so neither side holds a second full copy of the
bulk array in serialized form.
*/

mod decoder;
mod encoder;
mod estimate;
pub mod frame;

pub use decoder::StreamingDecoder;
pub use encoder::{EncodedDocument, StreamingEncoder};
pub use estimate::{estimate_document_size, select_bulk_field, SAMPLE_SIZE};

pub(crate) use decoder::decode_chunked_body;

use serde::{Deserialize, Serialize};

/// How the bulk array is partitioned into frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Batch size shrinks as the collection grows: fewer than 100 elements go
    /// in one batch, then 50, 100 and 200 per batch at 100, 1 000 and 5 000
    /// elements.
    #[default]
    Adaptive,
    /// Every batch holds this many elements (the last may hold fewer)
    Fixed(usize),
}

impl BatchPolicy {
    /// Elements per batch for a collection of `total` elements
    pub fn batch_size(&self, total: usize) -> usize {
        match *self {
            BatchPolicy::Adaptive => match total {
                0..=99 => total.max(1),
                100..=999 => 50,
                1000..=4999 => 100,
                _ => 200,
            },
            BatchPolicy::Fixed(size) => size.max(1),
        }
    }

    /// Number of batches a collection of `total` elements splits into
    pub fn batch_count(&self, total: usize) -> usize {
        total.div_ceil(self.batch_size(total))
    }

    /// Split `items` into consecutive batches, in order
    pub fn partition<'a, T>(&self, items: &'a [T]) -> std::slice::Chunks<'a, T> {
        items.chunks(self.batch_size(items.len()))
    }
}
