use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeaverError};

/// Top-level Weaver configuration (`weaver.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Execution state machine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running nodes per execution (0 = unlimited).
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
    /// How long `abort` waits for lanes to observe cancellation before force-failing them.
    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,
    /// Coalescing window for CLI output events, per node.
    #[serde(default = "default_output_coalesce_ms")]
    pub output_coalesce_ms: u64,
    /// Terminal executions kept in the registry before the oldest are archived.
    #[serde(default = "default_retain_terminal")]
    pub retain_terminal: usize,
    /// Runner attempt timeout for nodes that do not set their own.
    #[serde(default)]
    pub default_node_timeout_secs: Option<u64>,
}

fn default_max_concurrent_nodes() -> usize {
    0
}

fn default_abort_grace_secs() -> u64 {
    10
}

fn default_output_coalesce_ms() -> u64 {
    100
}

fn default_retain_terminal() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            abort_grace_secs: default_abort_grace_secs(),
            output_coalesce_ms: default_output_coalesce_ms(),
            retain_terminal: default_retain_terminal(),
            default_node_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.output_coalesce_ms.max(1))
    }
}

/// Event stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Idle interval after which a heartbeat frame is sent.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Reconnect delay recommended to clients in the connected snapshot.
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    /// Ring-buffer size of the replay log; unset keeps every event.
    #[serde(default)]
    pub replay_capacity: Option<usize>,
    /// Live fan-out buffer per execution; lagging subscribers resync from the replay log.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_retry_ms() -> u64 {
    3_000
}

fn default_broadcast_capacity() -> usize {
    1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            retry_ms: default_retry_ms(),
            replay_capacity: None,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared admin token accepted as `Bearer` header or `?token=` query parameter.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

fn default_bind() -> String {
    "127.0.0.1:18790".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    /// Read executions and subscribe to streams
    Viewer,
    /// Start, control and decide gates
    #[default]
    Operator,
    /// Full access
    Admin,
}

/// Built-in shell runner used by the `weaver` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_shell() -> String {
    "bash".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            working_dir: None,
        }
    }
}

impl RunnerConfig {
    /// Resolve the working directory (expand ~).
    pub fn working_dir(&self) -> Option<PathBuf> {
        let dir = self.working_dir.as_ref()?;
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(dir))
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaverError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeaverError::Config(e.to_string()))
    }

    /// Load the file when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "Config file absent, using defaults");
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference verbatim when unset
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
