use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("Failed to download {file}: {reason}")]
    Download { file: String, reason: String },

    #[error("Failed to write {path} into sandbox: {reason}")]
    Write { path: String, reason: String },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Execution timeout exceeded after {0}ms")]
    Timeout(u64),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Code generation failed: {0}")]
    Generation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Sandbox {0} is no longer running")]
    SandboxTerminated(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Microsandbox error: {0}")]
    MicrosandboxError(String),
}

impl SandboxError {
    /// Errors that abort a whole notebook turn rather than a single file or cell.
    pub fn is_turn_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::Provisioning(_)
                | SandboxError::Generation(_)
                | SandboxError::InvalidRequest(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }
}

/// Structural parse failure reported by a metadata extractor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("file is empty")]
    Empty,

    #[error("no header row found")]
    MissingHeader,

    #[error("row {row} has {found} fields, expected {expected}")]
    FieldMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("unterminated quoted field starting on row {0}")]
    UnterminatedQuote(usize),

    #[error("unsupported media type: {0}")]
    Unsupported(String),
}
