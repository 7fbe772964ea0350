use crate::{
    config::{ImportPolicy, ResourceLimits},
    engine::{RawExecution, Sandbox, SandboxProvider},
    errors::{Result, SandboxError},
    workspace::IsolatedWorkspace,
};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Prefix of the one line per request the kernel writes back on its real stdout
const REPLY_MARKER: &str = "__NBSANDBOX_REPLY__";

/// Long-lived interpreter loop. Placeholders are substituted before launch.
const KERNEL_DRIVER: &str = r#"
import ast
import base64
import builtins
import io
import json
import sys
import traceback

_REPLY = "__REPLY_MARKER__"
_POLICY_MODE = "__POLICY_MODE__"
_POLICY_MODULES = __POLICY_MODULES__
_real_stdout = sys.stdout
_real_stderr = sys.stderr
_original_import = builtins.__import__


def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    # Only imports written in cell code are policed; libraries import freely
    if level == 0 and globals is not None and globals.get("__name__") == "__main__":
        root = name.split(".")[0]
        if _POLICY_MODE == "blacklist" and root in _POLICY_MODULES:
            raise ImportError(f"Module '{root}' is blocked in this sandbox")
        if _POLICY_MODE == "whitelist" and root not in _POLICY_MODULES:
            raise ImportError(f"Module '{root}' is not in the allowed module list")
    return _original_import(name, globals, locals, fromlist, level)


builtins.__import__ = _guarded_import
_namespace = {"__name__": "__main__", "__builtins__": builtins}


class _Chunks(io.TextIOBase):
    def __init__(self):
        self.chunks = []

    def writable(self):
        return True

    def write(self, text):
        if text:
            self.chunks.append(text)
        return len(text)


def _rich(value):
    item = {"text": repr(value)}
    render = getattr(value, "_repr_html_", None)
    if callable(render):
        try:
            html = render()
            if html:
                item["html"] = html
        except Exception:
            pass
    return item


def _figures():
    plt = sys.modules.get("matplotlib.pyplot")
    if plt is None:
        return []
    out = []
    for num in plt.get_fignums():
        fig = plt.figure(num)
        buf = io.BytesIO()
        fig.savefig(buf, format="png", bbox_inches="tight")
        out.append({"png": base64.b64encode(buf.getvalue()).decode("ascii"), "text": repr(fig)})
    plt.close("all")
    return out


def _run(code):
    stdout, stderr = _Chunks(), _Chunks()
    results, error = [], None
    sys.stdout, sys.stderr = stdout, stderr
    try:
        tree = ast.parse(code, "<cell>", "exec")
        last = None
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            last = ast.Expression(tree.body.pop().value)
        exec(compile(tree, "<cell>", "exec"), _namespace)
        if last is not None:
            value = eval(compile(last, "<cell>", "eval"), _namespace)
            if value is not None:
                results.append(_rich(value))
    except BaseException as exc:
        error = {"name": type(exc).__name__, "value": str(exc), "traceback": traceback.format_exc()}
    finally:
        sys.stdout, sys.stderr = _real_stdout, _real_stderr
    try:
        results.extend(_figures())
    except Exception as exc:
        stderr.chunks.append(f"figure capture failed: {exc}\n")
    return {"logs": {"stdout": stdout.chunks, "stderr": stderr.chunks}, "results": results, "error": error}


for _line in sys.stdin:
    _line = _line.strip()
    if not _line:
        continue
    try:
        _request = json.loads(_line)
        _reply = _run(_request.get("code", ""))
        _reply["id"] = _request.get("id")
    except Exception as exc:
        _reply = {"error": {"name": type(exc).__name__, "value": str(exc), "traceback": ""}}
    _real_stdout.write(_REPLY + json.dumps(_reply) + "\n")
    _real_stdout.flush()
"#;

fn render_driver(policy: &ImportPolicy) -> String {
    let (mode, modules) = policy.python_literal();
    KERNEL_DRIVER
        .replace("__REPLY_MARKER__", REPLY_MARKER)
        .replace("__POLICY_MODE__", mode)
        .replace("__POLICY_MODULES__", &modules)
}

/// Local provider: each sandbox is a persistent `python3 -u` kernel process
/// running in its own workspace directory.
pub struct NativeKernelProvider {
    python_path: PathBuf,
    workspace_base: PathBuf,
    limits: ResourceLimits,
    import_policy: ImportPolicy,
}

impl NativeKernelProvider {
    /// Use `python_path` if given, otherwise find `python3`/`python` in PATH
    pub fn new(
        python_path: Option<PathBuf>,
        workspace_base: PathBuf,
        limits: ResourceLimits,
        import_policy: ImportPolicy,
    ) -> Result<Self> {
        let python_path = match python_path {
            Some(path) if path.exists() => path,
            Some(_) => return Err(SandboxError::PythonNotFound),
            None => which::which("python3")
                .or_else(|_| which::which("python"))
                .map_err(|_| SandboxError::PythonNotFound)?,
        };
        std::fs::create_dir_all(&workspace_base)?;

        Ok(Self {
            python_path,
            workspace_base,
            limits,
            import_policy,
        })
    }

    pub fn python_path(&self) -> &PathBuf {
        &self.python_path
    }

    /// Apply rlimits and a fresh process group before exec
    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command) {
        let cpu_seconds = self.limits.cpu_seconds;
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = self.limits.memory_mb * 1024 * 1024;

        unsafe {
            cmd.pre_exec(move || {
                libc::setpgid(0, 0);

                // RLIMIT_AS is not enforced reliably on macOS
                #[cfg(not(target_os = "macos"))]
                {
                    let rlimit = libc::rlimit {
                        rlim_cur: memory_bytes as libc::rlim_t,
                        rlim_max: memory_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command) {}
}

#[async_trait]
impl SandboxProvider for NativeKernelProvider {
    fn name(&self) -> &str {
        "native"
    }

    async fn create(&self) -> Result<Arc<dyn Sandbox>> {
        let workspace = IsolatedWorkspace::new(&self.workspace_base)?;
        let threads = self.limits.max_threads.to_string();

        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-u")
            .arg("-c")
            .arg(render_driver(&self.import_policy))
            .current_dir(workspace.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg")
            .env("OMP_NUM_THREADS", &threads)
            .env("OPENBLAS_NUM_THREADS", &threads)
            .env("MKL_NUM_THREADS", &threads);
        self.apply_resource_limits(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Provisioning(format!("failed to start kernel: {}", e)))?;
        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SandboxError::Provisioning(
                "kernel stdio was not captured".to_string(),
            ));
        };

        let id = format!("native-{}", uuid::Uuid::new_v4());
        if let Some(stderr) = child.stderr.take() {
            let kernel_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[NATIVE] {} stderr: {}", kernel_id, line);
                }
            });
        }

        info!(
            "[NATIVE] Started kernel {} (pid {:?}) in {:?}",
            id,
            pid,
            workspace.path()
        );
        let root = workspace.path().to_string_lossy().into_owned();
        Ok(Arc::new(NativeKernel {
            id,
            root,
            workspace,
            pid,
            process: Mutex::new(Some(KernelProcess {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
            })),
            alive: AtomicBool::new(true),
            next_request: AtomicU64::new(1),
        }))
    }
}

struct KernelProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[derive(Serialize)]
struct KernelRequest<'a> {
    id: u64,
    code: &'a str,
}

pub struct NativeKernel {
    id: String,
    root: String,
    workspace: IsolatedWorkspace,
    pid: Option<u32>,
    process: Mutex<Option<KernelProcess>>,
    alive: AtomicBool,
    next_request: AtomicU64,
}

impl NativeKernel {
    fn kill_process_group(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Kills the kernel if a request is abandoned mid-flight (e.g. by a timeout),
/// since its reply would otherwise be read as the answer to the next request.
struct InFlight<'a> {
    kernel: &'a NativeKernel,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "[NATIVE] Request abandoned; killing kernel {}",
                self.kernel.id
            );
            self.kernel.mark_dead();
            self.kernel.kill_process_group();
        }
    }
}

#[async_trait]
impl Sandbox for NativeKernel {
    fn id(&self) -> &str {
        &self.id
    }

    fn workspace_root(&self) -> &str {
        &self.root
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(SandboxError::SandboxTerminated(self.id.clone()));
        }
        let written = self.workspace.write(path, data).await?;
        debug!("[NATIVE] Wrote {} bytes to {:?}", data.len(), written);
        Ok(())
    }

    async fn run_code(&self, code: &str) -> Result<RawExecution> {
        let mut guard = self.process.lock().await;
        let process = match guard.as_mut() {
            Some(process) if self.is_alive() => process,
            _ => return Err(SandboxError::SandboxTerminated(self.id.clone())),
        };

        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_string(&KernelRequest {
            id: request_id,
            code,
        })?;
        line.push('\n');

        let mut in_flight = InFlight {
            kernel: self,
            finished: false,
        };

        if let Err(e) = process.stdin.write_all(line.as_bytes()).await {
            return Err(SandboxError::Execution(format!("kernel stdin closed: {}", e)));
        }
        process.stdin.flush().await?;

        loop {
            let Some(reply) = process.stdout.next_line().await? else {
                return Err(SandboxError::Execution(
                    "kernel exited while running code".to_string(),
                ));
            };
            match reply.strip_prefix(REPLY_MARKER) {
                Some(json) => {
                    let raw: RawExecution = serde_json::from_str(json)?;
                    in_flight.finished = true;
                    return Ok(raw);
                }
                // Output written straight to fd 1 by native extensions
                None => debug!("[NATIVE] {} stray stdout: {}", self.id, reply),
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn kill(&self) -> Result<()> {
        self.mark_dead();
        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            self.kill_process_group();
            if let Err(e) = process.child.kill().await {
                debug!("[NATIVE] Kernel {} already gone: {}", self.id, e);
            }
        }
        info!("[NATIVE] Kernel {} stopped", self.id);
        Ok(())
    }
}
