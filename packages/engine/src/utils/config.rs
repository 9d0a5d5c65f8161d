// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Layered through the `config` crate: built-in defaults, then an optional
//! file (TOML, YAML or JSON, chosen by extension), then environment
//! overrides such as `CALLTRACE__RECORDER__PAGE_COUNT=512`.
//!
//! The core never reads configuration on its own; hosts load an
//! [`EngineConfig`] and pass the sections into the recorder, reader and index.

use crate::index::IndexBackend;
use crate::observability::ObservabilityConfig;
use crate::reader::ReaderConfig;
use crate::recording::RecorderConfig;
use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Writer side: paging and chunk flushing
    pub recorder: RecorderConfig,

    /// Reader side: tailing behaviour
    pub reader: ReaderConfig,

    /// Call state index backend
    pub index: IndexBackend,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Loading configuration from {:?}", path);
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CALLTRACE")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: EngineConfig = builder
            .build()
            .map_err(|e| EngineError::ConfigError(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| EngineError::ConfigError(format!("Invalid configuration: {}", e)))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.recorder.validate()?;
        self.reader.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recorder.page_count, 256);
        assert!(matches!(config.index, IndexBackend::Memory));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[recorder]
page_count = 16
chunk_max_records = 10

[reader]
follow = true
poll_interval_ms = 50
"#
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.recorder.page_count, 16);
        assert_eq!(config.recorder.chunk_max_records, Some(10));
        assert!(config.reader.follow);
        assert_eq!(config.reader.poll_interval_ms, 50);
        // untouched sections keep their defaults
        assert_eq!(config.recorder.page_size, RecorderConfig::default().page_size);
    }

    #[test]
    fn test_invalid_page_count_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[recorder]\npage_count = 12").unwrap();

        let result = EngineConfig::load(Some(file.path()));
        assert!(matches!(result, Err(EngineError::ConfigError(_))));
    }
}
