use crate::{
    engine::{RawExecution, RichPayload, SandboxHandle},
    errors::SandboxError,
    notebook::CellOutput,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Normalized outcome of one code submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// False when the interpreter raised or the submission never completed
    pub success: bool,
    /// stdout, then stderr, then rich results in emission order
    pub outputs: Vec<CellOutput>,
    /// "ExceptionType: message" or a transport failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    fn failed(error: String, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            outputs: Vec::new(),
            error: Some(error),
            execution_time_ms,
        }
    }
}

/// Submits code to a sandbox and normalizes what comes back.
///
/// `execute` never returns an error: transport failures and timeouts are
/// folded into a failed [`ExecutionResult`].
pub struct CodeExecutor {
    timeout: Duration,
}

impl CodeExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn execute(&self, handle: &SandboxHandle, code: &str) -> ExecutionResult {
        let started = Instant::now();
        debug!(
            "[EXEC] Submitting {} chars to sandbox {}",
            code.len(),
            handle.id()
        );

        let outcome = tokio::time::timeout(self.timeout, handle.sandbox().run_code(code)).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(raw)) => {
                let result = normalize(raw, elapsed);
                if result.success {
                    info!(
                        "[EXEC] Sandbox {} finished in {}ms ({} outputs)",
                        handle.id(),
                        elapsed,
                        result.outputs.len()
                    );
                } else {
                    info!(
                        "[EXEC] Sandbox {} raised after {}ms: {}",
                        handle.id(),
                        elapsed,
                        result.error.as_deref().unwrap_or_default()
                    );
                }
                result
            }
            Ok(Err(e)) => {
                warn!("[EXEC] Sandbox {} transport failure: {}", handle.id(), e);
                ExecutionResult::failed(failure_message(&e), elapsed)
            }
            Err(_) => {
                let budget = self.timeout.as_millis() as u64;
                warn!(
                    "[EXEC] Sandbox {} exceeded its {}ms budget",
                    handle.id(),
                    budget
                );
                ExecutionResult::failed(failure_message(&SandboxError::Timeout(budget)), elapsed)
            }
        }
    }

    /// pip-install packages into the sandbox's interpreter
    pub async fn install_packages(
        &self,
        handle: &SandboxHandle,
        packages: &[String],
    ) -> ExecutionResult {
        if packages.is_empty() {
            return ExecutionResult {
                success: true,
                outputs: Vec::new(),
                error: None,
                execution_time_ms: 0,
            };
        }

        // A JSON list of strings is also a valid Python list literal
        let list = serde_json::to_string(packages).unwrap_or_else(|_| "[]".to_string());
        let code = format!(
            r#"import subprocess
import sys

packages = {list}
for package in packages:
    subprocess.check_call([sys.executable, "-m", "pip", "install", "-q", package])

print(f"Successfully installed: {{', '.join(packages)}}")
"#
        );
        info!(
            "[EXEC] Installing {} package(s) in sandbox {}",
            packages.len(),
            handle.id()
        );
        self.execute(handle, &code).await
    }
}

/// Fold the interpreter's channels into ordered output records
pub fn normalize(raw: RawExecution, execution_time_ms: u64) -> ExecutionResult {
    let mut outputs = Vec::new();

    let stdout = raw.logs.stdout.concat();
    if !stdout.is_empty() {
        outputs.push(CellOutput::text(stdout));
    }

    let stderr = raw.logs.stderr.concat();
    if !stderr.is_empty() {
        outputs.push(CellOutput::error(stderr));
    }

    for result in &raw.results {
        match result.payload() {
            Some(RichPayload::Image { data, mime_type }) => {
                outputs.push(CellOutput::image(data, mime_type))
            }
            Some(RichPayload::Text(text)) => outputs.push(CellOutput::text(text)),
            Some(RichPayload::Html(html)) => outputs.push(CellOutput::html(html)),
            None => {}
        }
    }

    ExecutionResult {
        success: raw.error.is_none(),
        outputs,
        error: raw.error.map(|e| e.summary()),
        execution_time_ms,
    }
}

fn failure_message(error: &SandboxError) -> String {
    match error {
        SandboxError::Timeout(ms) => format!("TimeoutError: execution exceeded {}ms", ms),
        other => other.to_string(),
    }
}
