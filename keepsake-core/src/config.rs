//! Configuration for backup and restore operations
//!
//! `BackupConfig` collects every tunable of the orchestrator: where the
//! document and assets live in storage, when the document is chunked and when
//! assets are transferred in windows, and the optional remote pre-check.
//! Every field has a default, so a JSON config file only needs the fields it
//! changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::stream::BatchPolicy;
use crate::{KeepsakeError, Result};

const MIB: u64 = 1024 * 1024;

/// Settings for the optional remote document pre-check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecheckConfig {
    /// Endpoint the document is POSTed to; `None` disables the pre-check
    pub endpoint: Option<String>,
    /// Documents estimated above this size skip the pre-check
    pub max_document_bytes: u64,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for PrecheckConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_document_bytes: 8 * MIB,
            timeout_secs: 30,
        }
    }
}

/// Configuration for a [`crate::BackupOrchestrator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Reserved archive entry name for the document
    pub document_entry_name: String,
    /// Storage key the document payload is read from and restored to
    pub document_install_key: String,
    /// Storage directory enumerated for assets
    pub asset_dir: String,
    /// Lower-case extensions to include; empty includes every asset
    pub asset_extensions: Vec<String>,
    /// Estimated document size at which chunked encoding is used
    pub chunking_threshold: u64,
    pub batch_policy: BatchPolicy,
    /// Array field to partition; `None` picks the largest one
    pub bulk_field: Option<String>,
    /// Gzip level, 0-9
    pub compression_level: u32,
    /// Assets of at least this size are transferred in windows
    pub asset_streaming_threshold: u64,
    /// Window size for windowed asset transfer
    pub asset_window_size: u64,
    pub precheck: PrecheckConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            document_entry_name: "database.bin".to_string(),
            document_install_key: "database/database.bin".to_string(),
            asset_dir: "assets".to_string(),
            asset_extensions: Vec::new(),
            chunking_threshold: 16 * MIB,
            batch_policy: BatchPolicy::Adaptive,
            bulk_field: None,
            compression_level: 6,
            asset_streaming_threshold: 64 * MIB,
            asset_window_size: 32 * MIB,
            precheck: PrecheckConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|e| {
            KeepsakeError::validation(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether an asset with storage name `name` is included in backups
    pub fn includes_asset(&self, name: &str) -> bool {
        if self.asset_extensions.is_empty() {
            return true;
        }
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.asset_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.document_entry_name.is_empty() {
            return Err(KeepsakeError::validation("document_entry_name must not be empty"));
        }
        if self.document_install_key.is_empty() {
            return Err(KeepsakeError::validation("document_install_key must not be empty"));
        }
        let asset_dir = self.asset_dir.trim_end_matches('/');
        if asset_dir.is_empty() {
            return Err(KeepsakeError::validation("asset_dir must not be empty"));
        }
        if self
            .document_install_key
            .strip_prefix(asset_dir)
            .is_some_and(|rest| rest.starts_with('/'))
        {
            return Err(KeepsakeError::validation(
                "document_install_key must not live inside asset_dir",
            ));
        }
        if self.chunking_threshold == 0 {
            return Err(KeepsakeError::validation("chunking_threshold must be positive"));
        }
        if self.asset_window_size == 0 {
            return Err(KeepsakeError::validation("asset_window_size must be positive"));
        }
        if self.asset_streaming_threshold == 0 {
            return Err(KeepsakeError::validation(
                "asset_streaming_threshold must be positive",
            ));
        }
        if self.compression_level > 9 {
            return Err(KeepsakeError::validation(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if let BatchPolicy::Fixed(0) = self.batch_policy {
            return Err(KeepsakeError::validation("fixed batch size must be positive"));
        }
        if self.precheck.endpoint.as_deref().is_some_and(str::is_empty) {
            return Err(KeepsakeError::validation("precheck endpoint must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = BackupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.document_entry_name, "database.bin");
        assert_eq!(config.chunking_threshold, 16 * 1024 * 1024);
        assert_eq!(config.precheck.max_document_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: BackupConfig = serde_json::from_str(
            r#"{ "asset_extensions": ["png"], "batch_policy": { "fixed": 25 }, "precheck": { "endpoint": "http://localhost:9000/check" } }"#,
        )
        .unwrap();

        assert_eq!(config.asset_extensions, vec!["png".to_string()]);
        assert_eq!(config.batch_policy, BatchPolicy::Fixed(25));
        assert_eq!(config.precheck.timeout_secs, 30);
        assert_eq!(config.asset_dir, "assets");
    }

    #[test]
    fn test_validation_failures() {
        let cases: Vec<Box<dyn Fn(&mut BackupConfig)>> = vec![
            Box::new(|c| c.document_entry_name.clear()),
            Box::new(|c| c.chunking_threshold = 0),
            Box::new(|c| c.asset_window_size = 0),
            Box::new(|c| c.compression_level = 10),
            Box::new(|c| c.batch_policy = BatchPolicy::Fixed(0)),
            Box::new(|c| c.document_install_key = "assets/database.bin".into()),
            Box::new(|c| c.precheck.endpoint = Some(String::new())),
        ];

        for mutate in cases {
            let mut config = BackupConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(KeepsakeError::Validation(_))),
                "expected validation failure for {config:?}"
            );
        }
    }

    #[test]
    fn test_extension_filter() {
        let mut config = BackupConfig::default();
        assert!(config.includes_asset("anything.bin"));

        config.asset_extensions = vec!["png".into(), "webp".into()];
        assert!(config.includes_asset("avatar.PNG"));
        assert!(config.includes_asset("bg.webp"));
        assert!(!config.includes_asset("notes.txt"));
        assert!(!config.includes_asset("no_extension"));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "compression_level": 9, "asset_dir": "media" }}"#).unwrap();

        let config = BackupConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.asset_dir, "media");

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"{{ "compression_level": 12 }}"#).unwrap();
        assert!(BackupConfig::from_json_file(bad.path()).is_err());
    }
}
