//! Notebook data model: attached files, code cells and their outputs.
//!
//! The persisted form of a turn is a JSON array of [`CodeCell`] using the
//! camelCase field names the transcript UI reads back.

use crate::{
    errors::{Result, SandboxError},
    executor::ExecutionResult,
    metadata::TabularMetadata,
};
use serde::{Deserialize, Serialize};

/// A stored file attached to a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub file_name: String,
    pub source_url: String,
    pub media_type: String,
    /// Structural metadata; absent when extraction failed or was not run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TabularMetadata>,
}

impl FileDescriptor {
    pub fn new(
        file_name: impl Into<String>,
        source_url: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            file_name: file_name.into(),
            source_url: source_url.into(),
            media_type: media_type.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: TabularMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Same stored object, regardless of id
    pub fn same_source(&self, other: &FileDescriptor) -> bool {
        self.file_name == other.file_name && self.source_url == other.source_url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    #[default]
    Code,
    Markdown,
    Output,
}

/// Cell lifecycle: idle → running → success | error, never backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

impl CellStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CellStatus::Success | CellStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Text,
    Image,
    Error,
    Table,
}

/// One typed output record of a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOutput {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub content: String,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl CellOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Text,
            content: content.into(),
            mime_type: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Error,
            content: content.into(),
            mime_type: None,
        }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Image,
            content: data.into(),
            mime_type: Some(mime_type.into()),
        }
    }

    pub fn html(content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Text,
            content: content.into(),
            mime_type: Some("text/html".to_string()),
        }
    }
}

/// A cell as emitted by the code generator, before it becomes a [`CodeCell`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCellDraft {
    #[serde(default)]
    pub content: String,
}

impl From<&str> for CodeCellDraft {
    fn from(content: &str) -> Self {
        Self {
            content: content.to_string(),
        }
    }
}

/// One unit of code plus its execution outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeCell {
    pub id: String,
    #[serde(rename = "type", default)]
    pub cell_type: CellType,
    pub content: String,
    #[serde(default)]
    pub status: CellStatus,
    #[serde(default)]
    pub outputs: Vec<CellOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u32>,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CodeCell {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cell_type: CellType::Code,
            content: content.into(),
            status: CellStatus::Idle,
            outputs: Vec::new(),
            execution_count: None,
            execution_time: None,
            error: None,
        }
    }

    /// idle → running
    pub fn start(&mut self, execution_count: u32) -> Result<()> {
        if self.status != CellStatus::Idle {
            return Err(SandboxError::InternalError(format!(
                "cell {} cannot start from {:?}",
                self.id, self.status
            )));
        }
        self.status = CellStatus::Running;
        self.execution_count = Some(execution_count);
        Ok(())
    }

    /// running → success | error
    pub fn complete(&mut self, result: ExecutionResult) -> Result<()> {
        if self.status != CellStatus::Running {
            return Err(SandboxError::InternalError(format!(
                "cell {} cannot complete from {:?}",
                self.id, self.status
            )));
        }
        self.outputs = result.outputs;
        self.execution_time = Some(result.execution_time_ms);
        if result.success {
            self.status = CellStatus::Success;
            self.error = None;
        } else {
            self.status = CellStatus::Error;
            self.error = Some(
                result
                    .error
                    .unwrap_or_else(|| "Unknown execution error".to_string()),
            );
        }
        Ok(())
    }
}

/// Serialize cells to the persisted document format
pub fn cells_to_json(cells: &[CodeCell]) -> Result<String> {
    Ok(serde_json::to_string(cells)?)
}

/// Parse cells from the persisted document format
pub fn cells_from_json(content: &str) -> Result<Vec<CodeCell>> {
    Ok(serde_json::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(success: bool) -> ExecutionResult {
        ExecutionResult {
            success,
            outputs: vec![CellOutput::text("partial\n")],
            error: (!success).then(|| "ZeroDivisionError: division by zero".to_string()),
            execution_time_ms: 12,
        }
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut cell = CodeCell::new("1/0");
        assert!(cell.complete(finished(false)).is_err());

        cell.start(1).unwrap();
        assert!(cell.start(1).is_err());
        cell.complete(finished(false)).unwrap();

        assert_eq!(cell.status, CellStatus::Error);
        assert_eq!(
            cell.error.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );
        assert_eq!(cell.outputs, vec![CellOutput::text("partial\n")]);
        assert!(cell.start(2).is_err());
        assert!(cell.complete(finished(true)).is_err());
        assert_eq!(cell.status, CellStatus::Error);
    }

    #[test]
    fn test_persisted_format_round_trip() {
        let mut ok = CodeCell::new("print('hi')");
        ok.start(1).unwrap();
        ok.complete(ExecutionResult {
            success: true,
            outputs: vec![
                CellOutput::text("hi\n"),
                CellOutput::image("iVBOR", "image/png"),
            ],
            error: None,
            execution_time_ms: 40,
        })
        .unwrap();
        let mut failed = CodeCell::new("1/0");
        failed.start(2).unwrap();
        failed.complete(finished(false)).unwrap();

        let cells = vec![ok, failed];
        let json = cells_to_json(&cells).unwrap();
        let restored = cells_from_json(&json).unwrap();

        assert_eq!(restored, cells);
    }

    #[test]
    fn test_persisted_field_names() {
        let mut cell = CodeCell::new("x = 1");
        cell.start(1).unwrap();
        cell.complete(ExecutionResult {
            success: true,
            outputs: vec![CellOutput::html("<table/>")],
            error: None,
            execution_time_ms: 3,
        })
        .unwrap();

        let value = serde_json::to_value(&cell).unwrap();
        assert_eq!(value["type"], "code");
        assert_eq!(value["status"], "success");
        assert_eq!(value["executionCount"], 1);
        assert_eq!(value["executionTime"], 3);
        assert_eq!(value["outputs"][0]["type"], "text");
        assert_eq!(value["outputs"][0]["mimeType"], "text/html");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_reads_minimal_cells() {
        let cells = cells_from_json(r#"[{"id":"a","content":"x = 1"}]"#).unwrap();
        assert_eq!(cells[0].status, CellStatus::Idle);
        assert_eq!(cells[0].cell_type, CellType::Code);
        assert!(cells[0].outputs.is_empty());
    }
}
