// packages/engine/src/main.rs
//! Calltrace log dump
//!
//! Reads a call log to its end and prints every recording as JSON.
//!
//! Usage: `calltrace-dump <log> [config]`

use anyhow::{bail, Context, Result};
use calltrace_engine::observability::{init_metrics, init_tracing, render_metrics};
use calltrace_engine::reader::{LogReader, ReaderConfig};
use calltrace_engine::tree::{ExportFormat, TreeExporter};
use calltrace_engine::utils::config::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(log_path) = args.next().map(PathBuf::from) else {
        bail!("usage: calltrace-dump <log> [config]");
    };
    let config_path = args.next().map(PathBuf::from);

    let config = EngineConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    init_tracing(config.observability.json_logs)?;
    if config.observability.metrics_enabled {
        init_metrics()?;
    }

    info!("Calltrace dump v{}", calltrace_engine::VERSION);

    let index = config.index.build()?;
    let reader_config = ReaderConfig {
        follow: false,
        ..config.reader.clone()
    };
    let reader = LogReader::open_file(&log_path, reader_config, index)
        .await
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    if !reader.await_finished(READ_TIMEOUT).await? {
        warn!("Gave up waiting for {} after {:?}", log_path.display(), READ_TIMEOUT);
        reader.close().await;
    }

    let recordings = reader.recordings();
    let incomplete = recordings.iter().filter(|r| !r.is_complete()).count();
    info!("Read {} recordings ({} incomplete)", recordings.len(), incomplete);

    let exporter = TreeExporter::new(ExportFormat::Json);
    println!("{}", exporter.export_all(reader.process_metadata().as_ref(), &recordings)?);

    if let Some(metrics) = render_metrics() {
        eprintln!("{}", metrics);
    }
    Ok(())
}
