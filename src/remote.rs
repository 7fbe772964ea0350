//! Hosted code-interpreter backend.
//!
//! Speaks a small REST API: create a sandbox, upload files into it, execute
//! code against its kernel, delete it. Every request carries the API key in
//! the `X-API-Key` header.

use crate::{
    engine::{RawExecution, Sandbox, SandboxProvider},
    errors::{Result, SandboxError},
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest<'a> {
    template: &'a str,
    timeout_ms: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxResponse {
    sandbox_id: String,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
}

pub struct RemoteProvider {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    template: String,
    sandbox_timeout: Duration,
    workspace_root: String,
}

impl RemoteProvider {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        template: impl Into<String>,
        sandbox_timeout: Duration,
        workspace_root: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            template: template.into(),
            sandbox_timeout,
            workspace_root: workspace_root.into(),
        }
    }
}

#[async_trait]
impl SandboxProvider for RemoteProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn create(&self) -> Result<Arc<dyn Sandbox>> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(SandboxError::Provisioning(
                "NBSANDBOX_API_KEY is not set".to_string(),
            ));
        };

        let response = self
            .client
            .post(format!("{}/sandboxes", self.api_url))
            .header(API_KEY_HEADER, &api_key)
            .json(&CreateSandboxRequest {
                template: &self.template,
                timeout_ms: self.sandbox_timeout.as_millis() as u64,
            })
            .send()
            .await
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::Provisioning(format!(
                "HTTP {}: {}",
                status,
                body.trim()
            )));
        }
        let created: CreateSandboxResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Provisioning(format!("malformed create response: {}", e)))?;

        info!(
            "[REMOTE] Created sandbox {} (template {})",
            created.sandbox_id, self.template
        );
        Ok(Arc::new(RemoteSandbox {
            client: self.client.clone(),
            base: format!("{}/sandboxes/{}", self.api_url, created.sandbox_id),
            id: created.sandbox_id,
            api_key,
            workspace_root: self.workspace_root.clone(),
            alive: AtomicBool::new(true),
        }))
    }
}

pub struct RemoteSandbox {
    client: Client,
    id: String,
    base: String,
    api_key: String,
    workspace_root: String,
    alive: AtomicBool,
}

impl RemoteSandbox {
    /// Map a non-success status; 404/410 mean the provider already reaped the sandbox
    fn check_status(&self, status: StatusCode, body: &str) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            self.alive.store(false, Ordering::SeqCst);
            return Err(SandboxError::SandboxTerminated(self.id.clone()));
        }
        Err(SandboxError::Execution(format!("HTTP {}: {}", status, body.trim())))
    }
}

#[async_trait]
impl Sandbox for RemoteSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace_root(&self) -> &str {
        &self.workspace_root
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/files", self.base))
            .query(&[("path", path)])
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await?;
        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        self.check_status(status, &body)?;
        debug!("[REMOTE] Uploaded {} bytes to {}:{}", data.len(), self.id, path);
        Ok(())
    }

    async fn run_code(&self, code: &str) -> Result<RawExecution> {
        let response = self
            .client
            .post(format!("{}/execute", self.base))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&ExecuteRequest { code })
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        self.check_status(status, &body)?;
        Ok(serde_json::from_str(&body)?)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn kill(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        let response = self
            .client
            .delete(&self.base)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            info!("[REMOTE] Deleted sandbox {}", self.id);
            return Ok(());
        }
        Err(SandboxError::Execution(format!(
            "delete of sandbox {} returned HTTP {}",
            self.id, status
        )))
    }
}
