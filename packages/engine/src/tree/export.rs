// packages/engine/src/tree/export.rs
//! Export recordings as JSON
//!
//! Partial recordings export too: calls whose exit has not arrived have
//! neither `result` nor `thrown`, and values that fail to decode are
//! exported as `not_recorded`.

use crate::model::{ProcessMetadata, RecordingMetadata};
use crate::objects::ObjectRecord;
use crate::tree::recording::{CallRecord, Recording};
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use tracing::{debug, warn};

/// Output layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Indented JSON document
    Json,

    /// One recording per line
    JsonLines,
}

/// Exported recording
#[derive(Debug, Serialize)]
pub struct ExportedRecording {
    pub id: i32,
    pub complete: bool,
    pub data_loss: bool,
    pub metadata: Option<RecordingMetadata>,
    pub root: Option<ExportedCall>,
}

/// Exported call with its subtree
#[derive(Debug, Serialize)]
pub struct ExportedCall {
    pub call_id: u64,
    pub method: String,
    pub callee: ObjectRecord,
    pub args: Vec<ObjectRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ObjectRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thrown: Option<ObjectRecord>,
    pub fully_recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enter_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_timestamp: Option<i64>,
    pub children: Vec<ExportedCall>,
}

#[derive(Serialize)]
struct ExportedLog<'a> {
    process: Option<&'a ProcessMetadata>,
    recordings: &'a [ExportedRecording],
}

/// Serializes assembled recordings
pub struct TreeExporter {
    format: ExportFormat,
}

impl TreeExporter {
    pub fn new(format: ExportFormat) -> Self {
        Self { format }
    }

    /// Export one recording
    pub fn export(&self, recording: &Recording) -> Result<String> {
        let exported = self.build(recording)?;
        match self.format {
            ExportFormat::Json => to_pretty(&exported),
            ExportFormat::JsonLines => to_line(&exported),
        }
    }

    /// Export a whole log
    pub fn export_all(&self, process: Option<&ProcessMetadata>, recordings: &[Recording]) -> Result<String> {
        debug!("Exporting {} recordings to {:?}", recordings.len(), self.format);
        let exported = recordings
            .iter()
            .map(|recording| self.build(recording))
            .collect::<Result<Vec<_>>>()?;

        match self.format {
            ExportFormat::Json => to_pretty(&ExportedLog {
                process,
                recordings: &exported,
            }),
            ExportFormat::JsonLines => {
                let lines = exported.iter().map(to_line).collect::<Result<Vec<_>>>()?;
                Ok(lines.join("\n"))
            }
        }
    }

    /// Build the serializable tree of a recording
    pub fn build(&self, recording: &Recording) -> Result<ExportedRecording> {
        Ok(ExportedRecording {
            id: recording.id(),
            complete: recording.is_complete(),
            data_loss: recording.has_data_loss(),
            metadata: recording.metadata(),
            root: recording.root()?.map(|root| export_call(&root)).transpose()?,
        })
    }
}

fn export_call(call: &CallRecord) -> Result<ExportedCall> {
    let children = call
        .children()?
        .iter()
        .map(export_call)
        .collect::<Result<Vec<_>>>()?;

    Ok(ExportedCall {
        call_id: call.call_id().0,
        method: call.method_name(),
        callee: or_not_recorded(call, "callee", call.callee()),
        args: call.args().unwrap_or_else(|e| {
            warn!("Arguments of call {} not decodable: {}", call.call_id(), e);
            Vec::new()
        }),
        result: call.return_value().unwrap_or(None),
        thrown: call.thrown().unwrap_or(None),
        fully_recorded: call.is_fully_recorded(),
        enter_timestamp: call.enter_timestamp().unwrap_or(None),
        exit_timestamp: call.exit_timestamp().unwrap_or(None),
        children,
    })
}

fn or_not_recorded(call: &CallRecord, what: &str, value: Result<ObjectRecord>) -> ObjectRecord {
    value.unwrap_or_else(|e| {
        warn!("The {} of call {} is not decodable: {}", what, call.call_id(), e);
        ObjectRecord::NotRecorded
    })
}

fn to_pretty<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::EncodingFailed(format!("JSON serialization error: {}", e)))
}

fn to_line<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| EngineError::EncodingFailed(format!("JSON serialization error: {}", e)))
}
