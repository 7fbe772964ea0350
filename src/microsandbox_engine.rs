use crate::{
    engine::{ExecutionLogs, InterpreterError, RawExecution, Sandbox, SandboxProvider},
    errors::{Result, SandboxError},
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use microsandbox::{BaseSandbox, PythonSandbox, StartOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const WORKSPACE_ROOT: &str = "/workspace";

/// Seconds the VM may take to boot
const START_TIMEOUT_SECS: f32 = 180.0;

/// One started microVM per session, driven through the official SDK
pub struct MicrosandboxProvider {
    image: String,
    memory_mb: u32,
    name_prefix: String,
}

impl MicrosandboxProvider {
    pub fn new(image: impl Into<String>, memory_mb: u32) -> Self {
        Self {
            image: image.into(),
            memory_mb,
            name_prefix: format!("nbsandbox-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

#[async_trait]
impl SandboxProvider for MicrosandboxProvider {
    fn name(&self) -> &str {
        "microsandbox"
    }

    async fn create(&self) -> Result<Arc<dyn Sandbox>> {
        crate::microsandbox_auth::setup_auth()?;

        let name = format!(
            "{}-{}",
            self.name_prefix,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut vm = PythonSandbox::create(&name)
            .await
            .map_err(|e| SandboxError::Provisioning(format!("failed to create microVM: {}", e)))?;

        vm.start(Some(StartOptions {
            image: Some(self.image.clone()),
            memory: self.memory_mb,
            cpus: 1.0,
            timeout: START_TIMEOUT_SECS,
        }))
        .await
        .map_err(|e| SandboxError::Provisioning(format!("failed to start microVM: {}", e)))?;

        let sandbox = MicrosandboxSandbox {
            id: name,
            vm: Mutex::new(vm),
            alive: AtomicBool::new(true),
        };
        sandbox
            .exec(&format!(
                "import os\nos.makedirs('{0}', exist_ok=True)\nos.chdir('{0}')",
                WORKSPACE_ROOT
            ))
            .await
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;

        info!("[MICROSANDBOX] Started {} from {}", sandbox.id, self.image);
        Ok(Arc::new(sandbox))
    }
}

pub struct MicrosandboxSandbox {
    id: String,
    vm: Mutex<PythonSandbox>,
    alive: AtomicBool,
}

impl MicrosandboxSandbox {
    async fn exec(&self, code: &str) -> Result<RawExecution> {
        if !self.is_alive() {
            return Err(SandboxError::SandboxTerminated(self.id.clone()));
        }
        #[allow(unused_mut)]
        let mut vm = self.vm.lock().await;
        let execution = vm
            .run(code)
            .await
            .map_err(|e| SandboxError::MicrosandboxError(format!("run failed: {}", e)))?;

        let stdout = execution
            .output()
            .await
            .map_err(|e| SandboxError::MicrosandboxError(format!("failed to read output: {}", e)))?;

        let error = if execution.has_error() {
            let text = execution
                .error()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Some(parse_traceback(&text))
        } else {
            None
        };

        Ok(RawExecution {
            logs: ExecutionLogs {
                stdout: if stdout.is_empty() { vec![] } else { vec![stdout] },
                stderr: vec![],
            },
            results: vec![],
            error,
        })
    }
}

#[async_trait]
impl Sandbox for MicrosandboxSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace_root(&self) -> &str {
        WORKSPACE_ROOT
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let raw = self.exec(&write_file_code(path, data)).await?;
        if let Some(error) = raw.error {
            return Err(SandboxError::Write {
                path: path.to_string(),
                reason: error.summary(),
            });
        }
        Ok(())
    }

    async fn run_code(&self, code: &str) -> Result<RawExecution> {
        self.exec(code).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn kill(&self) -> Result<()> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut vm = self.vm.lock().await;
        if let Err(e) = vm.stop().await {
            warn!("[MICROSANDBOX] Failed to stop {}: {}", self.id, e);
            return Err(SandboxError::MicrosandboxError(e.to_string()));
        }
        info!("[MICROSANDBOX] Stopped {}", self.id);
        Ok(())
    }
}

/// Python snippet that recreates `data` at `path` inside the VM
fn write_file_code(path: &str, data: &[u8]) -> String {
    let path = serde_json::Value::String(path.to_string()).to_string();
    format!(
        "import base64 as _b64, os as _os\n\
         _os.makedirs(_os.path.dirname({path}) or '.', exist_ok=True)\n\
         with open({path}, 'wb') as _f:\n    _f.write(_b64.b64decode('{data}'))\n\
         del _b64, _os, _f",
        path = path,
        data = BASE64.encode(data)
    )
}

/// Turn traceback text into name/value using its last `Name: value` line
fn parse_traceback(text: &str) -> InterpreterError {
    let last = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Error");
    let (name, value) = match last.split_once(':') {
        Some((name, value)) if !name.contains(' ') => (name.trim(), value.trim()),
        _ => ("Error", last),
    };
    InterpreterError {
        name: name.to_string(),
        value: value.to_string(),
        traceback: text.to_string(),
    }
}
