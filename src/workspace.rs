use crate::errors::{Result, SandboxError};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Per-sandbox working directory on the host.
///
/// The native kernel runs with this directory as its cwd, and attached files
/// are written directly into it. Removed on drop.
#[derive(Debug)]
pub struct IsolatedWorkspace {
    path: PathBuf,
}

impl IsolatedWorkspace {
    /// Create `<base>/<uuid>`
    pub fn new(base: &Path) -> Result<Self> {
        let path = base.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path)?;
        // Symlinked temp dirs (macOS /var → /private/var) would defeat containment checks
        let path = path.canonicalize()?;

        info!("[NATIVE] Created workspace: {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map a sandbox path onto the host, refusing anything outside the workspace.
    ///
    /// Absolute paths must already sit under the workspace; relative ones are
    /// joined onto it.
    pub fn resolve(&self, sandbox_path: &str) -> Result<PathBuf> {
        let requested = Path::new(sandbox_path);
        let relative = if requested.is_absolute() {
            requested.strip_prefix(&self.path).map_err(|_| SandboxError::Write {
                path: sandbox_path.to_string(),
                reason: "path is outside the sandbox workspace".to_string(),
            })?
        } else {
            requested
        };

        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(SandboxError::Write {
                path: sandbox_path.to_string(),
                reason: "path is outside the sandbox workspace".to_string(),
            });
        }
        Ok(self.path.join(relative))
    }

    /// Write a file, creating intermediate directories
    pub async fn write(&self, sandbox_path: &str, data: &[u8]) -> Result<PathBuf> {
        let target = self.resolve(sandbox_path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        Ok(target)
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!("[NATIVE] Failed to cleanup workspace {:?}: {}", self.path, e);
        } else {
            info!("[NATIVE] Cleaned up workspace: {:?}", self.path);
        }
    }
}
