use crate::{
    engine::SandboxHandle,
    errors::{Result, SandboxError},
    notebook::FileDescriptor,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where attached file bytes are fetched from
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fetches `http(s)://` URLs with reqwest; other schemes are refused
pub struct HttpFileSource {
    client: reqwest::Client,
}

impl HttpFileSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFileSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSource for HttpFileSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let scheme = url.split_once("://").map(|(s, _)| s.to_ascii_lowercase());
        if !matches!(scheme.as_deref(), Some("http") | Some("https")) {
            return Err(SandboxError::Download {
                file: url.to_string(),
                reason: "unsupported URL scheme".to_string(),
            });
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SandboxError::Download {
                file: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SandboxError::Download {
                file: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let bytes = response.bytes().await.map_err(|e| SandboxError::Download {
            file: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

/// One file that could not be copied into the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationFailure {
    pub file_name: String,
    pub error: String,
}

/// Outcome of copying a turn's attachments into a sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationReport {
    /// Sandbox paths written during this call
    pub uploaded: Vec<String>,
    /// Sandbox paths already present from an earlier turn
    pub skipped: Vec<String>,
    pub failed: Vec<MaterializationFailure>,
}

impl MaterializationReport {
    /// Every path the code can rely on
    pub fn available_paths(&self) -> Vec<String> {
        self.uploaded
            .iter()
            .chain(self.skipped.iter())
            .cloned()
            .collect()
    }
}

/// Copies stored files into a sandbox filesystem
pub struct FileMaterializer {
    source: Arc<dyn FileSource>,
}

impl FileMaterializer {
    pub fn new(source: Arc<dyn FileSource>) -> Self {
        Self { source }
    }

    /// Fetch `file` and write it to `<workspace_root>/<fileName>`.
    ///
    /// Always transfers; a file sharing a name with an earlier one overwrites it.
    pub async fn materialize(&self, handle: &SandboxHandle, file: &FileDescriptor) -> Result<String> {
        let name = sandbox_file_name(&file.file_name)?;
        let path = handle.path_for(&name);

        debug!(
            "[MATERIALIZE] Fetching {} from {}",
            file.file_name, file.source_url
        );
        let bytes = self
            .source
            .fetch(&file.source_url)
            .await
            .map_err(|e| match e {
                SandboxError::Download { reason, .. } => SandboxError::Download {
                    file: file.file_name.clone(),
                    reason,
                },
                other => SandboxError::Download {
                    file: file.file_name.clone(),
                    reason: other.to_string(),
                },
            })?;

        handle
            .sandbox()
            .write_file(&path, &bytes)
            .await
            .map_err(|e| SandboxError::Write {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        info!(
            "[MATERIALIZE] {} -> {} ({} bytes) in sandbox {}",
            file.file_name,
            path,
            bytes.len(),
            handle.id()
        );
        Ok(path)
    }

    /// Materialize every file, continuing past individual failures.
    ///
    /// With `skip_present`, files this sandbox already received are not
    /// transferred again.
    pub async fn materialize_all(
        &self,
        handle: &SandboxHandle,
        files: &[FileDescriptor],
        skip_present: bool,
    ) -> MaterializationReport {
        let mut report = MaterializationReport::default();

        for file in files {
            let key = materialized_key(file);
            if skip_present && handle.is_materialized(&key).await {
                let path = handle.path_for(&sandbox_file_name(&file.file_name).unwrap_or_default());
                debug!("[MATERIALIZE] {} already present at {}", file.file_name, path);
                report.skipped.push(path);
                continue;
            }

            match self.materialize(handle, file).await {
                Ok(path) => {
                    handle.mark_materialized(key).await;
                    report.uploaded.push(path);
                }
                Err(e) => {
                    warn!("[MATERIALIZE] Skipping {}: {}", file.file_name, e);
                    report.failed.push(MaterializationFailure {
                        file_name: file.file_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

fn materialized_key(file: &FileDescriptor) -> String {
    format!("{}\u{0}{}", file.file_name, file.source_url)
}

/// Final path component of a stored file name; the name it is written under
pub(crate) fn sandbox_file_name(file_name: &str) -> Result<String> {
    let normalized = file_name.replace('\\', "/");
    Path::new(&normalized)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .map(|n| n.to_string())
        .ok_or_else(|| SandboxError::Write {
            path: file_name.to_string(),
            reason: "file name has no usable final component".to_string(),
        })
}
