// packages/engine/src/observability/mod.rs
//! Logging and metrics setup
//!
//! The engine logs through `tracing` and counts through `metrics`. Neither
//! does anything until a host installs a subscriber / recorder, which is what
//! [`init_tracing`] and [`init_metrics`] are for.

use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Counter: recording sessions started
pub const RECORDINGS_STARTED: &str = "calltrace.recordings.started";
/// Counter: recording sessions whose root call exited
pub const RECORDINGS_FINISHED: &str = "calltrace.recordings.finished";
/// Counter: enter records written
pub const CALLS_RECORDED: &str = "calltrace.calls.recorded";
/// Counter: chunks handed to a sink
pub const CHUNKS_FLUSHED: &str = "calltrace.chunks.flushed";
/// Counter: values recorded by identity after a recorder failed
pub const VALUES_DEGRADED: &str = "calltrace.values.degraded";
/// Counter: frames dispatched by log readers
pub const READER_FRAMES: &str = "calltrace.reader.frames";
/// Counter: data-loss conditions observed while assembling trees
pub const READER_DATA_LOSS: &str = "calltrace.reader.data_loss";

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Observability configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Emit logs as JSON lines instead of human readable text
    pub json_logs: bool,

    /// Install the Prometheus metrics recorder
    pub metrics_enabled: bool,
}

/// Install the global tracing subscriber (`RUST_LOG` honoured, `info` otherwise)
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    installed.map_err(|e| EngineError::ConfigError(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus recorder once per process
pub fn init_metrics() -> Result<()> {
    if PROMETHEUS.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EngineError::ConfigError(format!("Failed to install metrics recorder: {}", e)))?;

    metrics::describe_counter!(RECORDINGS_STARTED, "Recording sessions started");
    metrics::describe_counter!(RECORDINGS_FINISHED, "Recording sessions finished");
    metrics::describe_counter!(CALLS_RECORDED, "Method calls recorded");
    metrics::describe_counter!(CHUNKS_FLUSHED, "Call record chunks flushed to a sink");
    metrics::describe_counter!(VALUES_DEGRADED, "Values recorded by identity after a recorder failure");
    metrics::describe_counter!(READER_FRAMES, "Frames dispatched by log readers");
    metrics::describe_counter!(READER_DATA_LOSS, "Data loss conditions observed by readers");

    let _ = PROMETHEUS.set(handle);
    Ok(())
}

/// Current Prometheus exposition text, if metrics were initialized
pub fn render_metrics() -> Option<String> {
    PROMETHEUS.get().map(|handle| handle.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_not_rendered_before_init() {
        if PROMETHEUS.get().is_none() {
            assert!(render_metrics().is_none());
        }
    }

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert!(!config.json_logs);
        assert!(!config.metrics_enabled);
    }
}
