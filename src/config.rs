use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Default remote sandbox root; attached files land at `<root>/<fileName>`.
pub const DEFAULT_WORKSPACE_ROOT: &str = "/workspace";

/// Timing knobs for the session registry and executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long an idle conversation keeps its sandbox
    #[serde(with = "duration_ms")]
    pub session_timeout: Duration,
    /// How often the registry sweeps expired sessions
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Wall clock budget for a single code submission
    #[serde(with = "duration_ms")]
    pub execution_timeout: Duration,
    /// Wall clock budget for creating a sandbox
    #[serde(with = "duration_ms")]
    pub provisioning_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(2 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            execution_timeout: Duration::from_secs(5 * 60),
            provisioning_timeout: Duration::from_secs(60),
        }
    }
}

/// Which sandbox backend the registry provisions from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Hosted code-interpreter service reached over HTTP
    Remote {
        api_url: String,
        /// Missing key is reported on first provisioning, not at startup
        api_key: Option<String>,
        template: String,
        #[serde(with = "duration_ms")]
        sandbox_timeout: Duration,
        workspace_root: String,
    },
    /// Persistent local Python kernel per conversation
    Native {
        python_path: Option<PathBuf>,
        workspace_base: PathBuf,
        limits: ResourceLimits,
        import_policy: ImportPolicy,
    },
    /// Microsandbox microVM per conversation
    Microsandbox { image: String, memory_mb: u32 },
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Remote {
            api_url: "https://api.e2b.dev".to_string(),
            api_key: None,
            template: "code-interpreter-v1".to_string(),
            sandbox_timeout: Duration::from_millis(7_200_000),
            workspace_root: DEFAULT_WORKSPACE_ROOT.to_string(),
        }
    }
}

impl ProviderConfig {
    /// Local kernel with default limits, rooted in the system temp dir
    pub fn native() -> Self {
        ProviderConfig::Native {
            python_path: None,
            workspace_base: std::env::temp_dir().join("nbsandbox-workspaces"),
            limits: ResourceLimits::default(),
            import_policy: ImportPolicy::default(),
        }
    }

    pub fn microsandbox() -> Self {
        ProviderConfig::Microsandbox {
            image: "microsandbox/python".to_string(),
            memory_mb: 2048,
        }
    }

    /// Description for logging/debugging
    pub fn description(&self) -> &'static str {
        match self {
            ProviderConfig::Remote { .. } => "Remote code-interpreter sandbox",
            ProviderConfig::Native { .. } => "Local persistent Python kernel",
            ProviderConfig::Microsandbox { .. } => "Microsandbox VM",
        }
    }

    /// Directory attached files land in, when known before a sandbox exists.
    /// Native kernels get a fresh temp directory each, so they report `None`.
    pub fn workspace_root(&self) -> Option<&str> {
        match self {
            ProviderConfig::Remote { workspace_root, .. } => Some(workspace_root),
            ProviderConfig::Native { .. } => None,
            ProviderConfig::Microsandbox { .. } => Some(DEFAULT_WORKSPACE_ROOT),
        }
    }
}

/// Top level configuration for the notebook pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookConfig {
    pub session: SessionConfig,
    pub provider: ProviderConfig,
    /// Upload every attached file on every turn even if the sandbox already has it
    pub reupload_files_each_turn: bool,
    /// Maximum accepted length of a single code cell
    pub max_code_len: usize,
    /// Maximum accepted length of a turn's natural-language request
    pub max_prompt_len: usize,
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            provider: ProviderConfig::default(),
            reupload_files_each_turn: false,
            max_code_len: 50_000,
            max_prompt_len: 20_000,
        }
    }
}

impl NotebookConfig {
    /// Build configuration from `NBSANDBOX_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`NotebookConfig::from_env`] with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let millis = |key: &str| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let mut cfg = NotebookConfig::default();

        if let Some(v) = millis("NBSANDBOX_SESSION_TIMEOUT_MS") {
            cfg.session.session_timeout = v;
        }
        if let Some(v) = millis("NBSANDBOX_SWEEP_INTERVAL_MS") {
            cfg.session.sweep_interval = v;
        }
        if let Some(v) = millis("NBSANDBOX_EXEC_TIMEOUT_MS") {
            cfg.session.execution_timeout = v;
        }
        if let Some(v) = millis("NBSANDBOX_PROVISION_TIMEOUT_MS") {
            cfg.session.provisioning_timeout = v;
        }
        if let Some(v) = get("NBSANDBOX_MAX_PROMPT_LEN").and_then(|v| v.parse().ok()) {
            cfg.max_prompt_len = v;
        }
        if let Some(v) = get("NBSANDBOX_REUPLOAD_FILES") {
            cfg.reupload_files_each_turn = matches!(v.as_str(), "1" | "true" | "yes");
        }

        let provider_kind = get("NBSANDBOX_PROVIDER").unwrap_or_else(|| "remote".to_string());
        cfg.provider = match provider_kind.to_ascii_lowercase().as_str() {
            "native" | "local" => {
                let mut provider = ProviderConfig::native();
                if let ProviderConfig::Native {
                    python_path,
                    workspace_base,
                    ..
                } = &mut provider
                {
                    *python_path = get("NBSANDBOX_PYTHON_PATH").map(PathBuf::from);
                    if let Some(base) = get("NBSANDBOX_WORKSPACE_BASE") {
                        *workspace_base = PathBuf::from(base);
                    }
                }
                provider
            }
            "microsandbox" => ProviderConfig::microsandbox(),
            _ => {
                let mut provider = ProviderConfig::default();
                if let ProviderConfig::Remote {
                    api_url,
                    api_key,
                    template,
                    sandbox_timeout,
                    workspace_root,
                } = &mut provider
                {
                    if let Some(v) = get("NBSANDBOX_API_URL") {
                        *api_url = v;
                    }
                    *api_key = get("NBSANDBOX_API_KEY");
                    if let Some(v) = get("NBSANDBOX_TEMPLATE") {
                        *template = v;
                    }
                    if let Some(v) = millis("NBSANDBOX_SANDBOX_TIMEOUT_MS") {
                        *sandbox_timeout = v;
                    }
                    if let Some(v) = get("NBSANDBOX_WORKSPACE_ROOT") {
                        *workspace_root = v;
                    }
                }
                provider
            }
        };

        cfg
    }
}

/// Resource limits for the local Python kernel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory in MB
    pub memory_mb: usize,
    /// Maximum CPU time in seconds over the kernel's whole lifetime
    pub cpu_seconds: u64,
    /// Maximum number of threads for scientific libraries
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            cpu_seconds: 1800,
            max_threads: 4,
        }
    }
}

/// Import control policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ImportPolicy {
    /// Block specific modules
    Blacklist(HashSet<String>),
    /// Only allow specific modules
    Whitelist(HashSet<String>),
}

impl Default for ImportPolicy {
    fn default() -> Self {
        // os stays importable: pandas and matplotlib need it at import time
        let blacklist = [
            "subprocess",
            "multiprocessing",
            "socket",
            "ctypes",
            "pty",
            "fcntl",
            "resource",
            "webbrowser",
            "antigravity",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        ImportPolicy::Blacklist(blacklist)
    }
}

impl ImportPolicy {
    /// Allow everything
    pub fn unrestricted() -> Self {
        ImportPolicy::Blacklist(HashSet::new())
    }

    /// Check if an import is allowed
    pub fn is_allowed(&self, module: &str) -> bool {
        let root_module = module.split('.').next().unwrap_or(module);

        match self {
            ImportPolicy::Blacklist(blacklist) => !blacklist.contains(root_module),
            ImportPolicy::Whitelist(whitelist) => whitelist.contains(root_module),
        }
    }

    /// Render the policy as a Python set literal plus the mode name
    pub(crate) fn python_literal(&self) -> (&'static str, String) {
        let (mode, modules) = match self {
            ImportPolicy::Blacklist(set) => ("blacklist", set),
            ImportPolicy::Whitelist(set) => ("whitelist", set),
        };
        if modules.is_empty() {
            return (mode, "set()".to_string());
        }
        let mut names: Vec<&String> = modules.iter().collect();
        names.sort();
        let literal = format!(
            "{{{}}}",
            names
                .iter()
                .map(|s| format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")))
                .collect::<Vec<_>>()
                .join(", ")
        );
        (mode, literal)
    }
}

/// Serialize `Duration` as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
