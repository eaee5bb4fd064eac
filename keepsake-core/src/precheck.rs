/*!
Optional remote validation of a document before it is archived.

The pre-check is best effort: only an explicit "corrupt" answer from the
remote stops a save. Timeouts, transport failures and unexpected responses
are reported as `Unavailable` and the save goes ahead.
*/

use async_trait::async_trait;
use serde_json::Value;

/// Outcome of a pre-check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrecheckVerdict {
    /// The remote accepted the document
    Healthy,
    /// The remote confirmed the document is corrupt
    Corrupt(String),
    /// No answer could be obtained
    Unavailable(String),
}

/// Remote document validation port
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentPrecheck: Send + Sync {
    async fn check(&self, document: &Value) -> PrecheckVerdict;
}

#[cfg(feature = "remote-precheck")]
pub use http::HttpPrecheck;

#[cfg(feature = "remote-precheck")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::Value;
    use tracing::debug;

    use super::{DocumentPrecheck, PrecheckVerdict};
    use crate::{KeepsakeError, Result};

    /// POSTs the serialized document to an HTTP endpoint
    ///
    /// A `400 Bad Request` answer means the document is corrupt, any `2xx`
    /// means it is healthy.
    #[derive(Debug, Clone)]
    pub struct HttpPrecheck {
        client: reqwest::Client,
        endpoint: String,
    }

    impl HttpPrecheck {
        pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| KeepsakeError::validation(format!("Failed to build HTTP client: {e}")))?;
            Ok(Self {
                client,
                endpoint: endpoint.into(),
            })
        }

        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    #[async_trait]
    impl DocumentPrecheck for HttpPrecheck {
        async fn check(&self, document: &Value) -> PrecheckVerdict {
            let response = match self.client.post(&self.endpoint).json(document).send().await {
                Ok(response) => response,
                Err(e) => return PrecheckVerdict::Unavailable(format!("request failed: {e}")),
            };

            let status = response.status();
            debug!(endpoint = %self.endpoint, status = status.as_u16(), "Pre-check answered");

            if status == StatusCode::BAD_REQUEST {
                let reason = response.text().await.unwrap_or_default();
                PrecheckVerdict::Corrupt(if reason.is_empty() {
                    "remote reported a corrupt document".to_string()
                } else {
                    reason
                })
            } else if status.is_success() {
                PrecheckVerdict::Healthy
            } else {
                PrecheckVerdict::Unavailable(format!(
                    "unexpected status {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ))
            }
        }
    }
}
