use async_trait::async_trait;
use futures::stream;
use nbsandbox::{
    create_provider, CodeCellDraft, CodeGenerator, CsvMetadataExtractor, DeltaStream,
    EventSink, FileDescriptor, FileSource, GenerationDelta, HttpFileSource,
    MemoryDocumentStore, MetadataExtractor, NotebookConfig, NotebookEvent, NotebookOrchestrator,
    ProviderConfig, Result, SandboxError, SessionRegistry, TurnRequest,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct WorkerConfig {
    notebook: NotebookConfig,
    store_dir: Option<PathBuf>,
}

impl WorkerConfig {
    /// `NBSANDBOX_*` environment first, command line flags override
    fn from_env_and_args() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut notebook = NotebookConfig::from_env();
        let mut store_dir = std::env::var("NBSANDBOX_STORE_DIR").ok().map(PathBuf::from);
        let mut python_path = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--provider" => {
                    if let Some(v) = args.get(i + 1) {
                        match v.trim().to_ascii_lowercase().as_str() {
                            "native" | "local" => {
                                if !matches!(notebook.provider, ProviderConfig::Native { .. }) {
                                    notebook.provider = ProviderConfig::native();
                                }
                            }
                            "microsandbox" => notebook.provider = ProviderConfig::microsandbox(),
                            "remote" => {
                                if !matches!(notebook.provider, ProviderConfig::Remote { .. }) {
                                    notebook.provider = NotebookConfig::from_lookup(|key| {
                                        (key != "NBSANDBOX_PROVIDER")
                                            .then(|| std::env::var(key).ok())
                                            .flatten()
                                    })
                                    .provider;
                                }
                            }
                            other => tracing::warn!("[WORKER] Unknown provider '{}'", other),
                        }
                    }
                    i += 2;
                }
                "--python-path" => {
                    if let Some(v) = args.get(i + 1) {
                        python_path = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--store-dir" => {
                    if let Some(v) = args.get(i + 1) {
                        store_dir = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }

        if let (Some(path), ProviderConfig::Native { python_path: slot, .. }) =
            (python_path, &mut notebook.provider)
        {
            *slot = Some(path);
        }

        Self {
            notebook,
            store_dir,
        }
    }
}

/// Replays code supplied by the host instead of calling a model.
///
/// The host runs the LLM; each `notebook/executeTurn` carries the generated
/// `code` or `cells`, which are streamed back as a single delta.
#[derive(Default)]
struct ReplayGenerator {
    delta: Option<GenerationDelta>,
}

#[async_trait]
impl CodeGenerator for ReplayGenerator {
    async fn generate_code(&self, _system_prompt: &str, _user_prompt: &str) -> Result<DeltaStream> {
        let deltas: Vec<Result<GenerationDelta>> = self.delta.clone().map(Ok).into_iter().collect();
        Ok(Box::pin(stream::iter(deltas)))
    }
}

struct Worker {
    config: NotebookConfig,
    registry: Arc<SessionRegistry>,
    files: Arc<HttpFileSource>,
    store: Arc<MemoryDocumentStore>,
}

impl Worker {
    fn orchestrator(&self, generator: ReplayGenerator) -> NotebookOrchestrator {
        NotebookOrchestrator::new(
            self.registry.clone(),
            self.files.clone(),
            Arc::new(generator),
            self.store.clone(),
            self.config.clone(),
        )
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteTurnParams {
    #[serde(flatten)]
    request: TurnRequest,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    cells: Option<Vec<CodeCellDraft>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCodeParams {
    conversation_id: String,
    code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationParams {
    conversation_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallParams {
    conversation_id: String,
    packages: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterFileParams {
    chat_id: String,
    file_name: String,
    url: String,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct DocumentParams {
    id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries JSON-RPC, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nbsandbox_worker=info,nbsandbox=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = WorkerConfig::from_env_and_args();
    tracing::info!(
        "[WORKER] nbsandbox-worker starting ({}, store_dir={:?})",
        cfg.notebook.provider.description(),
        cfg.store_dir
    );

    let provider = create_provider(&cfg.notebook.provider)?;
    let registry = SessionRegistry::init(provider, cfg.notebook.session.clone());
    let store = match &cfg.store_dir {
        Some(dir) => MemoryDocumentStore::with_directory(dir).await?,
        None => MemoryDocumentStore::new(),
    };
    let worker = Arc::new(Worker {
        config: cfg.notebook,
        registry,
        files: Arc::new(HttpFileSource::new()),
        store: Arc::new(store),
    });

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(message) = out_rx.recv().await {
            let Ok(line) = serde_json::to_string(&message) else {
                continue;
            };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[WORKER] invalid json-rpc line: {} | err={}", line, e);
                continue;
            }
        };

        let method = parsed.get("method").and_then(|m| m.as_str()).unwrap_or("");
        if method == "exit" {
            break;
        }
        if method == "shutdown" {
            worker.registry.shutdown().await;
            if let Some(id) = parsed.get("id").cloned() {
                let _ = out_tx.send(json!({ "jsonrpc": "2.0", "result": null, "id": id }));
            }
            break;
        }

        // Long turns must not block status queries or termination
        let worker = worker.clone();
        let out = out_tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handle_message(&worker, parsed, &out).await {
                let _ = out.send(response);
            }
        });
    }

    worker.registry.shutdown().await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_message(
    worker: &Worker,
    msg: Value,
    out: &UnboundedSender<Value>,
) -> Option<Value> {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    // Notifications have no id and get no response
    let id = msg.get("id").cloned()?;
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method {
        "initialize" => Ok(json!({
            "serverInfo": {
                "name": "nbsandbox-worker",
                "version": env!("CARGO_PKG_VERSION")
            },
            "provider": worker.config.provider.description(),
            "capabilities": {
                "methods": [
                    "notebook/executeTurn",
                    "notebook/runCode",
                    "session/status",
                    "session/terminate",
                    "session/installPackages",
                    "files/register",
                    "documents/get",
                    "shutdown"
                ],
                "notifications": ["notebook/event"]
            }
        })),
        "notebook/executeTurn" => execute_turn(worker, params, out).await,
        "notebook/runCode" => run_code(worker, params).await,
        "session/status" => session_status(worker, params).await,
        "session/terminate" => terminate_session(worker, params).await,
        "session/installPackages" => install_packages(worker, params).await,
        "files/register" => register_file(worker, params).await,
        "documents/get" => get_document(worker, params).await,
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    Some(match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    })
}

type RpcResult = std::result::Result<Value, Value>;

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> std::result::Result<T, Value> {
    serde_json::from_value(params)
        .map_err(|e| json!({ "code": -32602, "message": format!("Invalid params: {}", e) }))
}

fn rpc_error(error: SandboxError) -> Value {
    let code = match &error {
        SandboxError::InvalidRequest(_) => -32602,
        _ => -32000,
    };
    json!({ "code": code, "message": error.to_string() })
}

fn to_value<T: serde::Serialize>(value: &T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| json!({ "code": -32603, "message": e.to_string() }))
}

async fn execute_turn(worker: &Worker, params: Value, out: &UnboundedSender<Value>) -> RpcResult {
    let ExecuteTurnParams {
        request,
        code,
        cells,
    } = parse_params(params)?;
    let delta = match (cells, code) {
        (Some(cells), _) => Some(GenerationDelta::cells(cells)),
        (None, Some(code)) => Some(GenerationDelta::code(code)),
        (None, None) => None,
    };
    let conversation_id = request.conversation_id.clone();

    let (tx, mut rx) = mpsc::unbounded_channel::<NotebookEvent>();
    let forward_out = out.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let transient = event.is_transient();
            let _ = forward_out.send(json!({
                "jsonrpc": "2.0",
                "method": "notebook/event",
                "params": {
                    "conversationId": conversation_id,
                    "event": event,
                    "transient": transient
                }
            }));
        }
    });

    let orchestrator = worker.orchestrator(ReplayGenerator { delta });
    let report = orchestrator
        .execute_turn(request, &EventSink::new(tx))
        .await;
    // Sender dropped with the sink; let queued events flush before the response
    let _ = forwarder.await;

    to_value(&report.map_err(rpc_error)?)
}

async fn run_code(worker: &Worker, params: Value) -> RpcResult {
    let p: RunCodeParams = parse_params(params)?;
    let result = worker
        .orchestrator(ReplayGenerator::default())
        .run_code(&p.conversation_id, &p.code)
        .await
        .map_err(rpc_error)?;
    to_value(&result)
}

async fn session_status(worker: &Worker, params: Value) -> RpcResult {
    let p: ConversationParams = parse_params(params)?;
    let status = worker.registry.describe(&p.conversation_id).await;
    to_value(&status)
}

async fn terminate_session(worker: &Worker, params: Value) -> RpcResult {
    let p: ConversationParams = parse_params(params)?;
    worker.registry.release(&p.conversation_id).await;
    Ok(json!({ "terminated": true }))
}

async fn install_packages(worker: &Worker, params: Value) -> RpcResult {
    let p: InstallParams = parse_params(params)?;
    let result = worker
        .orchestrator(ReplayGenerator::default())
        .install_packages(&p.conversation_id, &p.packages)
        .await
        .map_err(rpc_error)?;
    to_value(&result)
}

/// Remember a file for a conversation, extracting tabular metadata when possible
async fn register_file(worker: &Worker, params: Value) -> RpcResult {
    let p: RegisterFileParams = parse_params(params)?;
    let media_type = p
        .media_type
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| nbsandbox::guess_media_type(&p.file_name).to_string());
    let mut file = FileDescriptor::new(p.file_name, p.url, media_type);
    file.id = p.id;

    let mut warning = None;
    if nbsandbox::is_tabular_media_type(&file.media_type) {
        match worker.files.fetch(&file.source_url).await {
            Ok(bytes) => match CsvMetadataExtractor.parse_tabular(&bytes, &file.media_type) {
                Ok(metadata) => file = file.with_metadata(metadata),
                Err(e) => warning = Some(format!("{}: {}", file.file_name, e)),
            },
            Err(e) => warning = Some(e.to_string()),
        }
    }
    if let Some(w) = &warning {
        tracing::warn!("[WORKER] Registered {} without metadata: {}", file.file_name, w);
    }

    worker.store.register_file(&p.chat_id, file.clone()).await;
    Ok(json!({ "file": to_value(&file)?, "warning": warning }))
}

async fn get_document(worker: &Worker, params: Value) -> RpcResult {
    let p: DocumentParams = parse_params(params)?;
    let Some(document) = worker.store.document(&p.id).await else {
        return Err(json!({
            "code": -32004,
            "message": format!("Document not found: {}", p.id)
        }));
    };
    let cells = nbsandbox::cells_from_json(&document.content).map_err(rpc_error)?;
    Ok(json!({ "document": to_value(&document)?, "cells": to_value(&cells)? }))
}
