/*!
# Keepsake Core

Backup archives for application state: one structured document plus any
number of binary assets, packed into a single flat archive and restored in
one pass.

This crate provides:

- A length-prefixed archive container with in-memory, push-based and
  streaming readers
- A self-describing document codec with raw, compressed and chunked payloads
- Chunked streaming encode/decode so very large documents never need a
  second full copy in memory
- Cooperative cancellation and monotonic progress reporting
- An orchestrator that builds and restores archives against pluggable
  storage, with an optional remote pre-check of the document

## Architecture

The core follows hexagonal architecture principles:
- Storage, compression and the remote pre-check are ports with adapters
- Archives are written into staged destinations that only become visible
  once complete

## Usage

```rust
use keepsake_core::{CancellationToken, NoProgress, StreamingDecoder, StreamingEncoder};
use serde_json::json;

# tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
let document = json!({
    "formatversion": 4,
    "characters": [{ "name": "Alice" }, { "name": "Bob" }],
});

// A zero threshold forces the chunked variant
let encoder = StreamingEncoder::default().with_threshold(0);
let encoded = encoder.encode(&document, &NoProgress, &CancellationToken::new()).await?;

let decoded = StreamingDecoder::default()
    .decode(&encoded.payload, &NoProgress, &CancellationToken::new())
    .await?;
assert_eq!(decoded, document);
# Ok::<(), keepsake_core::KeepsakeError>(())
# }).unwrap();
```
*/

pub mod archive;
pub mod cancel;
pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod format;
pub mod observability;
pub mod orchestrator;
pub mod precheck;
pub mod progress;
pub mod storage;
pub mod stream;

pub use archive::{parse, write_archive, ArchiveDecoder, ArchiveEntry, ArchiveReader, ArchiveSummary, ArchiveWriter, EntryHeader};
pub use cancel::CancellationToken;
pub use codec::{DocumentCodec, EncodeMode};
pub use compression::{CompressSink, CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{BackupConfig, PrecheckConfig};
pub use error::{KeepsakeError, Result};
pub use format::{detect_variant, PayloadVariant, HEADER_LEN};
pub use observability::{init_observability, BackupMetrics};
#[cfg(feature = "local")]
pub use orchestrator::create_local_orchestrator;
pub use orchestrator::{BackupOrchestrator, BackupReport, RestoreReport};
#[cfg(feature = "remote-precheck")]
pub use precheck::HttpPrecheck;
pub use precheck::{DocumentPrecheck, PrecheckVerdict};
pub use progress::{NoProgress, Progress, ProgressReporter};
#[cfg(feature = "local")]
pub use storage::LocalFileStorage;
pub use storage::{AssetStorage, MemoryStorage, StagedWriter};
pub use stream::{BatchPolicy, EncodedDocument, StreamingDecoder, StreamingEncoder};
