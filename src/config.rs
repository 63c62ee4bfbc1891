//! System configuration
//!
//! All options are read from `CUMULUS_*` environment variables with
//! documented defaults. The configuration is immutable once built;
//! components hold it behind an `Arc`.

use std::path::PathBuf;
use std::time::Duration;

/// Where function state (snapshots, reduction accumulators) lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMode {
    /// State is held in this process and served to peers over TCP.
    InMemory,
    /// State lives in an external key-value store.
    ExternalKv,
}

impl StateMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in-memory" | "inmemory" => Some(StateMode::InMemory),
            "external-kv" | "external" => Some(StateMode::ExternalKv),
            _ => None,
        }
    }
}

/// Configuration consumed by the sandbox, OMP runtime and worker pool.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// How long the global queue listener waits for a message before
    /// draining out.
    pub global_message_timeout: Duration,
    /// How long a parent waits for each chained OMP child result.
    pub chained_call_timeout: Duration,
    /// State backend selection.
    pub state_mode: StateMode,
    /// Whether to submit a python preload invocation at pool start.
    pub python_preload: bool,
    /// Number of executor slots in the worker pool.
    pub thread_pool_size: usize,
    /// Identity of this node on the sharing and MPI buses.
    pub node_id: String,
    /// Name of the global queue this node listens on.
    pub queue_name: String,
    /// Bind address for the TCP state server (in-memory mode only).
    pub state_server_addr: String,
    /// Team size used when a fork has no pushed or wanted override.
    pub default_team_size: usize,
    /// Host file served when the guest opens `/etc/hosts`.
    pub hosts_file: PathBuf,
    /// Host file served when the guest opens `/etc/resolv.conf`.
    pub resolv_file: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            global_message_timeout: Duration::from_secs(60),
            chained_call_timeout: Duration::from_secs(10),
            state_mode: StateMode::InMemory,
            python_preload: false,
            thread_pool_size: cores,
            node_id: "local".to_string(),
            queue_name: "incoming".to_string(),
            state_server_addr: "127.0.0.1:8005".to_string(),
            default_team_size: cores,
            hosts_file: PathBuf::from("/usr/share/cumulus/net/hosts"),
            resolv_file: PathBuf::from("/usr/share/cumulus/net/resolv.conf"),
        }
    }
}

pub const ENV_GLOBAL_MESSAGE_TIMEOUT_MS: &str = "CUMULUS_GLOBAL_MESSAGE_TIMEOUT_MS";
pub const ENV_CHAINED_CALL_TIMEOUT_MS: &str = "CUMULUS_CHAINED_CALL_TIMEOUT_MS";
pub const ENV_STATE_MODE: &str = "CUMULUS_STATE_MODE";
pub const ENV_PYTHON_PRELOAD: &str = "CUMULUS_PYTHON_PRELOAD";
pub const ENV_THREAD_POOL_SIZE: &str = "CUMULUS_THREAD_POOL_SIZE";
pub const ENV_NODE_ID: &str = "CUMULUS_NODE_ID";
pub const ENV_QUEUE_NAME: &str = "CUMULUS_QUEUE_NAME";
pub const ENV_STATE_SERVER_ADDR: &str = "CUMULUS_STATE_SERVER_ADDR";
pub const ENV_DEFAULT_TEAM_SIZE: &str = "CUMULUS_DEFAULT_TEAM_SIZE";
pub const ENV_HOSTS_FILE: &str = "CUMULUS_HOSTS_FILE";
pub const ENV_RESOLV_FILE: &str = "CUMULUS_RESOLV_FILE";

impl SystemConfig {
    /// Build a configuration from the environment, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut conf = Self::default();

        if let Some(ms) = env_u64(ENV_GLOBAL_MESSAGE_TIMEOUT_MS) {
            conf.global_message_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64(ENV_CHAINED_CALL_TIMEOUT_MS) {
            conf.chained_call_timeout = Duration::from_millis(ms);
        }
        if let Some(mode) = env_str(ENV_STATE_MODE).and_then(|s| StateMode::parse(&s)) {
            conf.state_mode = mode;
        }
        if let Some(v) = env_str(ENV_PYTHON_PRELOAD) {
            conf.python_preload = v == "on" || v == "1" || v == "true";
        }
        if let Some(n) = env_u64(ENV_THREAD_POOL_SIZE) {
            conf.thread_pool_size = (n as usize).max(1);
        }
        if let Some(v) = env_str(ENV_NODE_ID) {
            conf.node_id = v;
        }
        if let Some(v) = env_str(ENV_QUEUE_NAME) {
            conf.queue_name = v;
        }
        if let Some(v) = env_str(ENV_STATE_SERVER_ADDR) {
            conf.state_server_addr = v;
        }
        if let Some(n) = env_u64(ENV_DEFAULT_TEAM_SIZE) {
            conf.default_team_size = (n as usize).max(1);
        }
        if let Some(v) = env_str(ENV_HOSTS_FILE) {
            conf.hosts_file = PathBuf::from(v);
        }
        if let Some(v) = env_str(ENV_RESOLV_FILE) {
            conf.resolv_file = PathBuf::from(v);
        }

        conf
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|v| v.parse().ok())
}
