/*!
Cooperative cancellation for encode, decode and backup operations.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{KeepsakeError, Result};

/// One-way abort signal shared between a running operation and its caller
///
/// Clones observe the same flag. Once aborted a token never resets, so a new
/// token must be created for every operation.
///
/// # Example
/// ```rust
/// use keepsake_core::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// handle.abort();
/// assert!(token.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    aborted: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the not-aborted state
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Idempotent and safe to call from any thread.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::debug!("Cancellation requested");
        }
    }

    /// Whether `abort` has been called on this token or any clone of it
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Fail with `KeepsakeError::Aborted` if the token has been tripped
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(KeepsakeError::Aborted)
        } else {
            Ok(())
        }
    }
}
