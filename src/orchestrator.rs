//! Notebook orchestrator: one assistant turn from prompt to executed cells.
//!
//! A turn moves through resolving → generating → provisioning →
//! materializing → executing → finalizing. Only provisioning (and a broken
//! generation stream) fails the turn; file and cell failures are recorded in
//! place and the turn carries on.

use crate::{
    config::NotebookConfig,
    engine::SandboxHandle,
    errors::{Result, SandboxError},
    executor::{CodeExecutor, ExecutionResult},
    materializer::{FileMaterializer, FileSource, MaterializationReport},
    notebook::{cells_to_json, CodeCell, CodeCellDraft, FileDescriptor},
    prompt::{build_user_prompt, NOTEBOOK_SYSTEM_PROMPT},
    registry::{SessionRegistry, SessionStatus},
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// One partial object from the code generator. The latest value seen for a
/// field replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cells: Option<Vec<CodeCellDraft>>,
}

impl GenerationDelta {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            cells: None,
        }
    }

    pub fn cells(cells: Vec<CodeCellDraft>) -> Self {
        Self {
            code: None,
            cells: Some(cells),
        }
    }
}

/// Finite, non-restartable sequence of generation deltas
pub type DeltaStream = BoxStream<'static, Result<GenerationDelta>>;

/// LLM-backed code generation
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate_code(&self, system_prompt: &str, user_prompt: &str) -> Result<DeltaStream>;
}

/// A notebook document as handed to persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedDocument {
    pub id: String,
    pub conversation_id: String,
    pub title: String,
    pub kind: String,
    /// JSON array of cells
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Persistence collaborator
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save_document(&self, document: SavedDocument) -> Result<()>;

    async fn file_metadata_by_chat_id(&self, chat_id: &str) -> Result<Vec<FileDescriptor>>;
}

/// Progress emitted while a turn runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum NotebookEvent {
    Kind(String),
    Title(String),
    /// Latest full code text, not an increment
    CodeDelta(String),
    CellsDelta(Vec<CodeCellDraft>),
    Warning(String),
    CellUpdate(CodeCell),
    Error(String),
    Finish,
}

impl NotebookEvent {
    /// Transient events are UI progress only and need not be kept in the transcript
    pub fn is_transient(&self) -> bool {
        !matches!(self, NotebookEvent::CellUpdate(_) | NotebookEvent::Error(_))
    }
}

/// Fire-and-forget event channel; a closed receiver never affects the turn
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<NotebookEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<NotebookEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn emit(&self, event: NotebookEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("[NOTEBOOK] Event receiver closed; dropping event");
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub title: String,
    pub prompt: String,
    /// Files attached to this message; merged with the conversation's stored files
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
}

/// Terminal result of a turn that got past provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    pub document_id: String,
    pub sandbox_id: Option<String>,
    pub cells: Vec<CodeCell>,
    pub uploaded: Vec<String>,
    pub warnings: Vec<String>,
    pub persisted: bool,
    pub expires_in_ms: Option<u64>,
}

pub struct NotebookOrchestrator {
    registry: Arc<SessionRegistry>,
    materializer: FileMaterializer,
    executor: CodeExecutor,
    generator: Arc<dyn CodeGenerator>,
    store: Arc<dyn DocumentStore>,
    config: NotebookConfig,
}

impl NotebookOrchestrator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        files: Arc<dyn FileSource>,
        generator: Arc<dyn CodeGenerator>,
        store: Arc<dyn DocumentStore>,
        config: NotebookConfig,
    ) -> Self {
        Self {
            registry,
            materializer: FileMaterializer::new(files),
            executor: CodeExecutor::new(config.session.execution_timeout),
            generator,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn execute_turn(&self, request: TurnRequest, events: &EventSink) -> Result<TurnReport> {
        if request.conversation_id.trim().is_empty() {
            return Err(SandboxError::InvalidRequest(
                "conversation id is required".to_string(),
            ));
        }
        if request.prompt.len() > self.config.max_prompt_len {
            return Err(SandboxError::InvalidRequest(format!(
                "prompt exceeds {} characters",
                self.config.max_prompt_len
            )));
        }

        let conversation_id = request.conversation_id.as_str();
        let document_id = request
            .document_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut warnings = Vec::new();

        info!(
            "[NOTEBOOK] Turn started for conversation {} (document {})",
            conversation_id, document_id
        );
        events.emit(NotebookEvent::Kind("notebook".to_string()));
        events.emit(NotebookEvent::Title(request.title.clone()));

        // Resolving
        let files = self
            .resolve_files(conversation_id, &request.files, &mut warnings)
            .await;

        // Generating
        let sources = match self.generate(&request.prompt, &files, events).await {
            Ok(sources) => sources,
            Err(e) => {
                error!("[NOTEBOOK] Generation failed for {}: {}", conversation_id, e);
                events.emit(NotebookEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let mut cells = Vec::new();
        for source in sources {
            if source.len() > self.config.max_code_len {
                let warning = format!(
                    "Dropped a generated cell longer than {} characters",
                    self.config.max_code_len
                );
                warn!("[NOTEBOOK] {}", warning);
                events.emit(NotebookEvent::Warning(warning.clone()));
                warnings.push(warning);
                continue;
            }
            cells.push(CodeCell::new(source));
        }

        let mut sandbox_id = None;
        let mut uploaded = Vec::new();

        if cells.is_empty() {
            info!("[NOTEBOOK] No code generated; skipping sandbox");
        } else {
            // Provisioning
            let handle = match self.registry.acquire(conversation_id).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!("[NOTEBOOK] {}", e);
                    events.emit(NotebookEvent::Error(e.to_string()));
                    return Err(e);
                }
            };
            sandbox_id = Some(handle.id().to_string());

            // Materializing
            let report = self.materialize(&handle, &files).await;
            for failure in &report.failed {
                let warning = format!("Could not load {}: {}", failure.file_name, failure.error);
                events.emit(NotebookEvent::Warning(warning.clone()));
                warnings.push(warning);
            }
            if !files.is_empty() && report.available_paths().is_empty() {
                let warning = "None of the attached files could be loaded into the sandbox".to_string();
                events.emit(NotebookEvent::Warning(warning.clone()));
                warnings.push(warning);
            }
            uploaded = report.uploaded;

            // Executing
            self.run_cells(&handle, &mut cells, events).await?;
        }

        // Finalizing
        let persisted = self
            .persist(&request, &document_id, &cells, &mut warnings)
            .await;
        let status = self.registry.describe(conversation_id).await;

        let failed = cells.iter().filter(|c| c.error.is_some()).count();
        info!(
            "[NOTEBOOK] Turn finished for conversation {}: {} cell(s), {} failed",
            conversation_id,
            cells.len(),
            failed
        );
        events.emit(NotebookEvent::Finish);

        Ok(TurnReport {
            document_id,
            sandbox_id,
            cells,
            uploaded,
            warnings,
            persisted,
            expires_in_ms: status.expires_in_ms,
        })
    }

    /// Execute one block of code against the conversation's sandbox
    pub async fn run_code(&self, conversation_id: &str, code: &str) -> Result<ExecutionResult> {
        self.validate_code(conversation_id, code)?;
        let handle = self.registry.acquire(conversation_id).await?;

        let mut warnings = Vec::new();
        let files = self.resolve_files(conversation_id, &[], &mut warnings).await;
        let report = self.materialize(&handle, &files).await;
        for failure in &report.failed {
            warn!(
                "[NOTEBOOK] Conversation {}: could not load {} before running code: {}",
                conversation_id, failure.file_name, failure.error
            );
        }

        Ok(self.executor.execute(&handle, code).await)
    }

    /// pip-install packages into the conversation's sandbox
    pub async fn install_packages(
        &self,
        conversation_id: &str,
        packages: &[String],
    ) -> Result<ExecutionResult> {
        self.validate_code(conversation_id, "")?;
        let handle = self.registry.acquire(conversation_id).await?;
        Ok(self.executor.install_packages(&handle, packages).await)
    }

    pub async fn get_session_status(&self, conversation_id: &str) -> SessionStatus {
        self.registry.describe(conversation_id).await
    }

    pub async fn terminate_session(&self, conversation_id: &str) {
        self.registry.release(conversation_id).await;
    }

    fn validate_code(&self, conversation_id: &str, code: &str) -> Result<()> {
        if conversation_id.trim().is_empty() {
            return Err(SandboxError::InvalidRequest(
                "conversation id is required".to_string(),
            ));
        }
        if code.len() > self.config.max_code_len {
            return Err(SandboxError::InvalidRequest(format!(
                "code exceeds {} characters",
                self.config.max_code_len
            )));
        }
        Ok(())
    }

    /// Explicit files first, then stored ones not already listed
    async fn resolve_files(
        &self,
        conversation_id: &str,
        explicit: &[FileDescriptor],
        warnings: &mut Vec<String>,
    ) -> Vec<FileDescriptor> {
        let mut files = explicit.to_vec();
        match self.store.file_metadata_by_chat_id(conversation_id).await {
            Ok(stored) => {
                for file in stored {
                    if !files.iter().any(|f| f.same_source(&file)) {
                        files.push(file);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "[NOTEBOOK] Could not load stored files for {}: {}",
                    conversation_id, e
                );
                warnings.push(format!("Stored files unavailable: {}", e));
            }
        }
        debug!(
            "[NOTEBOOK] Resolved {} file(s) for conversation {}",
            files.len(),
            conversation_id
        );
        files
    }

    /// Drain the generator, returning the final cell sources
    async fn generate(
        &self,
        prompt: &str,
        files: &[FileDescriptor],
        events: &EventSink,
    ) -> Result<Vec<String>> {
        let user_prompt =
            build_user_prompt(prompt, files, self.config.provider.workspace_root());
        let mut stream = self
            .generator
            .generate_code(NOTEBOOK_SYSTEM_PROMPT, &user_prompt)
            .await
            .map_err(into_generation)?;

        let mut code = String::new();
        let mut drafts: Vec<CodeCellDraft> = Vec::new();
        while let Some(delta) = stream.next().await {
            let delta = delta.map_err(into_generation)?;
            if let Some(latest) = delta.code.filter(|c| !c.is_empty()) {
                events.emit(NotebookEvent::CodeDelta(latest.clone()));
                code = latest;
            }
            if let Some(latest) = delta.cells {
                events.emit(NotebookEvent::CellsDelta(latest.clone()));
                drafts = latest;
            }
        }

        let sources: Vec<String> = drafts
            .into_iter()
            .map(|d| d.content)
            .filter(|c| !c.trim().is_empty())
            .collect();
        if !sources.is_empty() {
            return Ok(sources);
        }
        if code.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![code])
    }

    async fn materialize(&self, handle: &SandboxHandle, files: &[FileDescriptor]) -> MaterializationReport {
        if files.is_empty() {
            return MaterializationReport::default();
        }
        self.materializer
            .materialize_all(handle, files, !self.config.reupload_files_each_turn)
            .await
    }

    /// Run cells in order; a failing cell does not stop the ones after it.
    async fn run_cells(
        &self,
        handle: &SandboxHandle,
        cells: &mut [CodeCell],
        events: &EventSink,
    ) -> Result<()> {
        for (index, cell) in cells.iter_mut().enumerate() {
            cell.start(index as u32 + 1)?;
            events.emit(NotebookEvent::CellUpdate(cell.clone()));

            let result = self.executor.execute(handle, &cell.content).await;
            cell.complete(result)?;
            if let Some(error) = &cell.error {
                info!("[NOTEBOOK] Cell {} failed: {}", index + 1, error);
            }
            events.emit(NotebookEvent::CellUpdate(cell.clone()));
        }
        Ok(())
    }

    async fn persist(
        &self,
        request: &TurnRequest,
        document_id: &str,
        cells: &[CodeCell],
        warnings: &mut Vec<String>,
    ) -> bool {
        let content = match cells_to_json(cells) {
            Ok(content) => content,
            Err(e) => {
                warnings.push(format!("Notebook could not be serialized: {}", e));
                return false;
            }
        };
        let document = SavedDocument {
            id: document_id.to_string(),
            conversation_id: request.conversation_id.clone(),
            title: request.title.clone(),
            kind: "notebook".to_string(),
            content,
            user_id: request.user_id.clone(),
        };

        match self.store.save_document(document).await {
            Ok(()) => true,
            Err(e) => {
                error!("[NOTEBOOK] Failed to save document {}: {}", document_id, e);
                warnings.push(format!("Notebook was not saved: {}", e));
                false
            }
        }
    }
}

fn into_generation(error: SandboxError) -> SandboxError {
    match error {
        SandboxError::Generation(msg) => SandboxError::Generation(msg),
        other => SandboxError::Generation(other.to_string()),
    }
}
