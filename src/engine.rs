use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Captured stream output of one submission, as emitted chunk by chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogs {
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
}

/// Top-level exception raised by the interpreter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterError {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub traceback: String,
}

impl InterpreterError {
    /// "ExceptionType: message"
    pub fn summary(&self) -> String {
        if self.value.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.value)
        }
    }
}

/// One rich result object exactly as the interpreter reports it.
///
/// The payload fields are mutually exclusive in practice but the wire format
/// does not guarantee it; [`RichResult::payload`] applies the precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub png: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jpeg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// The single payload a rich result contributes to a cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RichPayload {
    /// Base64 encoded image bytes
    Image {
        data: String,
        mime_type: &'static str,
    },
    Text(String),
    Html(String),
}

impl RichResult {
    /// First populated field wins: png, jpeg, text, html.
    pub fn payload(&self) -> Option<RichPayload> {
        fn present(field: &Option<String>) -> Option<&String> {
            field.as_ref().filter(|v| !v.is_empty())
        }

        if let Some(data) = present(&self.png) {
            return Some(RichPayload::Image {
                data: data.clone(),
                mime_type: "image/png",
            });
        }
        if let Some(data) = present(&self.jpeg) {
            return Some(RichPayload::Image {
                data: data.clone(),
                mime_type: "image/jpeg",
            });
        }
        if let Some(text) = present(&self.text) {
            return Some(RichPayload::Text(text.clone()));
        }
        present(&self.html).map(|html| RichPayload::Html(html.clone()))
    }
}

/// Raw multi-channel outcome of one code submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExecution {
    #[serde(default)]
    pub logs: ExecutionLogs,
    #[serde(default)]
    pub results: Vec<RichResult>,
    #[serde(default)]
    pub error: Option<InterpreterError>,
}

/// A live, stateful interpreter environment with its own filesystem
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Provider-assigned identifier
    fn id(&self) -> &str;

    /// Directory attached files are written into
    fn workspace_root(&self) -> &str;

    /// Write bytes to an absolute path inside the sandbox
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Run code against the sandbox's persistent interpreter state
    async fn run_code(&self, code: &str) -> Result<RawExecution>;

    /// Whether the sandbox can still accept work
    fn is_alive(&self) -> bool {
        true
    }

    /// Tear the sandbox down
    async fn kill(&self) -> Result<()>;
}

/// Creates sandboxes on demand
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Provision a fresh sandbox
    async fn create(&self) -> Result<Arc<dyn Sandbox>>;
}

/// Shared reference to a registered sandbox.
///
/// The session registry owns the lifecycle; clones handed to a turn are only
/// used to submit work and never tear the sandbox down themselves.
#[derive(Clone)]
pub struct SandboxHandle {
    sandbox: Arc<dyn Sandbox>,
    materialized: Arc<Mutex<HashSet<String>>>,
}

impl SandboxHandle {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            materialized: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn id(&self) -> &str {
        self.sandbox.id()
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    /// Deterministic path for an attached file: `<root>/<fileName>`
    pub fn path_for(&self, file_name: &str) -> String {
        format!(
            "{}/{}",
            self.sandbox.workspace_root().trim_end_matches('/'),
            file_name
        )
    }

    /// True when both handles reference the same underlying sandbox
    pub fn same_sandbox(&self, other: &SandboxHandle) -> bool {
        Arc::ptr_eq(&self.materialized, &other.materialized)
    }

    pub(crate) async fn is_materialized(&self, key: &str) -> bool {
        self.materialized.lock().await.contains(key)
    }

    pub(crate) async fn mark_materialized(&self, key: String) {
        self.materialized.lock().await.insert(key);
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.sandbox.id())
            .field("workspace_root", &self.sandbox.workspace_root())
            .finish()
    }
}
