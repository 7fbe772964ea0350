//! In-crate fakes shared by the unit tests.

use crate::{
    engine::{InterpreterError, RawExecution, RichResult, Sandbox, SandboxProvider},
    errors::{Result, SandboxError},
    notebook::{CodeCellDraft, FileDescriptor},
    orchestrator::{CodeGenerator, DeltaStream, DocumentStore, GenerationDelta, SavedDocument},
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FAKE_PNG: &str = "iVBORw0KGgoAAAANSUhEUg==";

#[derive(Default)]
struct FakeState {
    files: HashMap<String, Vec<u8>>,
    vars: HashMap<String, String>,
    submitted: Vec<String>,
    writes: usize,
}

/// Sandbox with an in-memory filesystem and a toy interpreter.
///
/// The interpreter understands just enough Python for the tests: `print`,
/// simple assignments, `len`, `pd.read_csv`, `raise`, `plt.show()` and
/// division by zero. Variables persist across submissions.
pub struct FakeSandbox {
    id: String,
    state: Mutex<FakeState>,
    run_failure: Mutex<Option<String>>,
    killed: AtomicBool,
    dead: AtomicBool,
    fail_kill: AtomicBool,
    fail_writes: AtomicBool,
}

impl FakeSandbox {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(FakeState::default()),
            run_failure: Mutex::new(None),
            killed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            fail_kill: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn fail_kill(&self) {
        self.fail_kill.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_runs(&self, message: &str) {
        *self.run_failure.lock().unwrap() = Some(message.to_string());
    }

    fn interpret(&self, code: &str) -> RawExecution {
        let mut state = self.state.lock().unwrap();
        let mut raw = RawExecution::default();

        let statements = code
            .split(['\n', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty());
        for statement in statements {
            if let Err(error) = step(statement, &mut state, &mut raw) {
                raw.error = Some(error);
                break;
            }
        }
        raw
    }
}

fn exception(name: &str, value: impl Into<String>) -> InterpreterError {
    InterpreterError {
        name: name.to_string(),
        value: value.into(),
        traceback: String::new(),
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(|c: char| c.is_ascii_digit())
        && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn unquote(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn call_arg<'a>(expr: &'a str, function: &str) -> Option<&'a str> {
    expr.strip_prefix(function)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
}

fn step(
    statement: &str,
    state: &mut FakeState,
    raw: &mut RawExecution,
) -> std::result::Result<(), InterpreterError> {
    if statement.starts_with("import ") || statement.starts_with("from ") || statement.starts_with('#')
    {
        return Ok(());
    }
    if statement == "plt.show()" {
        raw.results.push(RichResult {
            png: Some(FAKE_PNG.to_string()),
            text: Some("<Figure size 640x480 with 1 Axes>".to_string()),
            ..Default::default()
        });
        return Ok(());
    }
    if let Some(arg) = call_arg(statement, "print") {
        let value = eval(arg, state)?;
        raw.logs.stdout.push(format!("{}\n", value));
        return Ok(());
    }
    if let Some(raised) = statement.strip_prefix("raise ") {
        let (name, message) = match raised.split_once('(') {
            Some((name, rest)) => {
                let rest = rest.trim_end_matches(')');
                (name, unquote(rest).unwrap_or(rest).to_string())
            }
            None => (raised, String::new()),
        };
        return Err(exception(name.trim(), message));
    }
    if let Some((target, expr)) = statement.split_once('=') {
        let target = target.trim();
        if is_identifier(target) && !expr.starts_with('=') {
            let value = eval(expr.trim(), state)?;
            state.vars.insert(target.to_string(), value);
            return Ok(());
        }
    }
    eval(statement, state).map(|_| ())
}

fn eval(expr: &str, state: &FakeState) -> std::result::Result<String, InterpreterError> {
    let expr = expr.trim();
    if expr.contains("/0") {
        return Err(exception("ZeroDivisionError", "division by zero"));
    }
    if let Some(text) = unquote(expr) {
        return Ok(text.to_string());
    }
    if let Some(arg) = call_arg(expr, "pd.read_csv") {
        let path = unquote(arg).unwrap_or(arg);
        let bytes = state.files.get(path).ok_or_else(|| {
            exception(
                "FileNotFoundError",
                format!("[Errno 2] No such file or directory: '{}'", path),
            )
        })?;
        let lines = String::from_utf8_lossy(bytes)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();
        return Ok(format!("<DataFrame rows={}>", lines.saturating_sub(1)));
    }
    if let Some(arg) = call_arg(expr, "len") {
        let value = eval(arg, state)?;
        let len = match value
            .strip_prefix("<DataFrame rows=")
            .and_then(|v| v.strip_suffix('>'))
        {
            Some(rows) => rows.to_string(),
            None => value.chars().count().to_string(),
        };
        return Ok(len);
    }
    if expr.parse::<i64>().is_ok() {
        return Ok(expr.to_string());
    }
    if is_identifier(expr) {
        return state
            .vars
            .get(expr)
            .cloned()
            .ok_or_else(|| exception("NameError", format!("name '{}' is not defined", expr)));
    }
    Ok(expr.to_string())
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace_root(&self) -> &str {
        "/workspace"
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) || self.is_killed() {
            return Err(SandboxError::SandboxTerminated(self.id.clone()));
        }
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_string(), data.to_vec());
        state.writes += 1;
        Ok(())
    }

    async fn run_code(&self, code: &str) -> Result<RawExecution> {
        self.state.lock().unwrap().submitted.push(code.to_string());

        if let Some(message) = self.run_failure.lock().unwrap().clone() {
            return Err(SandboxError::Execution(message));
        }
        if self.is_killed() {
            return Err(SandboxError::SandboxTerminated(self.id.clone()));
        }
        if code.contains("time.sleep(") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(self.interpret(code))
    }

    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst) && !self.is_killed()
    }

    async fn kill(&self) -> Result<()> {
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(SandboxError::Execution("kill request refused".to_string()));
        }
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider handing out [`FakeSandbox`]es named `fake-0`, `fake-1`, ...
pub struct FakeProvider {
    next_id: AtomicUsize,
    created: Mutex<Vec<Arc<FakeSandbox>>>,
    failure: Mutex<Option<String>>,
    create_delay: Mutex<Option<Duration>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            create_delay: Mutex::new(None),
        }
    }

    /// Make every later `create` sleep for `delay` before answering
    pub fn slow_create(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn sandbox(&self, index: usize) -> Arc<FakeSandbox> {
        self.created.lock().unwrap()[index].clone()
    }

    pub fn fail_provisioning(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self) -> Result<Arc<dyn Sandbox>> {
        tokio::task::yield_now().await;
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(SandboxError::Provisioning(message));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let sandbox = Arc::new(FakeSandbox::new(&id));
        self.created.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }
}

/// URL → bytes map; unknown URLs answer like a 404
pub struct MemoryFileSource {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryFileSource {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, url: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.to_vec());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::materializer::FileSource for MemoryFileSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| SandboxError::Download {
                file: url.to_string(),
                reason: "HTTP 404 Not Found".to_string(),
            })
    }
}

/// Generator replaying a fixed list of deltas, optionally ending in an error
pub struct ScriptedGenerator {
    deltas: Vec<GenerationDelta>,
    failure: Option<String>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    pub fn new(deltas: Vec<GenerationDelta>) -> Self {
        Self {
            deltas,
            failure: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Streams `code` as a growing prefix, the way partial objects arrive
    pub fn code(code: &str) -> Self {
        let mid = code
            .char_indices()
            .map(|(i, _)| i)
            .nth(code.chars().count() / 2)
            .unwrap_or(0);
        let mut deltas = Vec::new();
        if mid > 0 {
            deltas.push(GenerationDelta::code(&code[..mid]));
        }
        deltas.push(GenerationDelta::code(code));
        Self::new(deltas)
    }

    pub fn cells(cells: &[&str]) -> Self {
        let drafts: Vec<CodeCellDraft> = cells.iter().map(|c| CodeCellDraft::from(*c)).collect();
        let mut deltas = Vec::new();
        if drafts.len() > 1 {
            deltas.push(GenerationDelta::cells(drafts[..1].to_vec()));
        }
        deltas.push(GenerationDelta::cells(drafts));
        Self::new(deltas)
    }

    pub fn failing_after(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate_code(&self, system_prompt: &str, user_prompt: &str) -> Result<DeltaStream> {
        self.prompts
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_prompt.to_string()));

        let mut items: Vec<Result<GenerationDelta>> = self.deltas.iter().cloned().map(Ok).collect();
        if let Some(message) = &self.failure {
            items.push(Err(SandboxError::Generation(message.clone())));
        }
        Ok(futures::stream::iter(items).boxed())
    }
}

/// Store whose writes always fail
pub struct FailingDocumentStore;

#[async_trait]
impl DocumentStore for FailingDocumentStore {
    async fn save_document(&self, _document: SavedDocument) -> Result<()> {
        Err(SandboxError::Persistence("database unavailable".to_string()))
    }

    async fn file_metadata_by_chat_id(&self, _chat_id: &str) -> Result<Vec<FileDescriptor>> {
        Err(SandboxError::Persistence("database unavailable".to_string()))
    }
}
