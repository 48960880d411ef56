//! Environment-driven configuration.
//!
//! Every knob this crate reads is an environment variable, optionally backed
//! by a `.env` file loaded at startup via `dotenvy`. There is no TOML/TOON
//! behavioral configuration layer in this crate.

use std::env;
use std::time::Duration;

/// A single configured tool server (one `TOOL_SERVER_<N>_CMD` entry).
#[derive(Debug, Clone)]
pub struct ToolServerConfig {
    /// Name used to address this server (`TOOL_SERVER_<N>_NAME`, defaults to `server_<N>`).
    pub name: String,
    /// Command and arguments used to spawn the subprocess.
    pub command: Vec<String>,
}

/// Full set of environment-derived settings for one run of the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which `LlmBridge` implementation to construct ("openai" or "anthropic").
    pub llm_provider: String,
    /// API key for the configured LLM provider.
    pub llm_api_key: String,
    /// Model identifier to request from the provider.
    pub llm_model_name: String,

    /// Tool servers to spawn at startup.
    pub tool_servers: Vec<ToolServerConfig>,
    /// How long to wait for a spawned server's first `tools/list` response.
    pub tool_server_startup_timeout: Duration,
    /// Maximum number of in-flight calls per tool server.
    pub tool_server_max_inflight: usize,

    /// Maximum model round-trips per planner run.
    pub agentic_max_iterations: usize,
    /// Maximum tool calls dispatched per planner run.
    pub agentic_max_tool_calls: usize,
    /// Wall-clock budget for an entire planner run.
    pub agentic_timeout: Duration,
    /// Per-call timeout applied to each individual tool invocation.
    pub per_call_timeout: Duration,

    /// How long an idle session may go before a new one is started on next use.
    pub session_idle_timeout: Duration,
    /// Number of recent messages hydrated into the planner's transcript prefix.
    pub history_window: usize,
    /// Retention window after which `purge_older_than` may reclaim rows.
    pub history_retention: Duration,
    /// Filesystem path to the conversation store's libsql database file.
    pub conversation_db_path: String,
}

impl Config {
    /// Load configuration from the process environment, applying `.env` first.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let llm_provider =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());

        let llm_api_key = env::var("LLM_API_KEY").unwrap_or_else(|_| {
            tracing::warn!("LLM_API_KEY not set; requests to the model backend will fail");
            String::new()
        });

        let llm_model_name = env::var("LLM_MODEL_NAME")
            .unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let tool_servers = Self::parse_tool_servers();

        Ok(Config {
            llm_provider,
            llm_api_key,
            llm_model_name,
            tool_servers,
            tool_server_startup_timeout: Duration::from_secs(env_u64(
                "TOOL_SERVER_STARTUP_TIMEOUT_SECONDS",
                30,
            )?),
            tool_server_max_inflight: env_usize("TOOL_SERVER_MAX_INFLIGHT", 16)?,
            agentic_max_iterations: env_usize("AGENTIC_MAX_ITERATIONS", 8)?,
            agentic_max_tool_calls: env_usize("AGENTIC_MAX_TOOL_CALLS", 30)?,
            agentic_timeout: Duration::from_secs(env_u64("AGENTIC_TIMEOUT_SECONDS", 90)?),
            per_call_timeout: Duration::from_secs(env_u64("PER_CALL_TIMEOUT_SECONDS", 30)?),
            session_idle_timeout: Duration::from_secs(
                env_u64("SESSION_IDLE_TIMEOUT_MINUTES", 30)? * 60,
            ),
            history_window: env_usize("HISTORY_WINDOW", 10)?,
            history_retention: Duration::from_secs(env_u64("HISTORY_RETENTION_HOURS", 24)? * 3600),
            conversation_db_path: env::var("CONVERSATION_DB_PATH")
                .unwrap_or_else(|_| "./state.db".to_string()),
        })
    }

    /// Parse `TOOL_SERVER_<N>_CMD` / `TOOL_SERVER_<N>_NAME` pairs for N = 1, 2, ...
    /// stopping at the first gap.
    fn parse_tool_servers() -> Vec<ToolServerConfig> {
        let mut servers = Vec::new();
        let mut n = 1;
        loop {
            let cmd_key = format!("TOOL_SERVER_{n}_CMD");
            let Ok(cmd_line) = env::var(&cmd_key) else {
                break;
            };
            let command: Vec<String> = cmd_line
                .split_whitespace()
                .map(|s| s.to_string())
                .collect();
            let name = env::var(format!("TOOL_SERVER_{n}_NAME"))
                .unwrap_or_else(|_| format!("server_{n}"));
            servers.push(ToolServerConfig { name, command });
            n += 1;
        }
        servers
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(v) => Ok(v.parse()?),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(v) => Ok(v.parse()?),
        Err(_) => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            llm_provider: "openai".to_string(),
            llm_api_key: String::new(),
            llm_model_name: "gpt-4o-mini".to_string(),
            tool_servers: Vec::new(),
            tool_server_startup_timeout: Duration::from_secs(30),
            tool_server_max_inflight: 16,
            agentic_max_iterations: 8,
            agentic_max_tool_calls: 30,
            agentic_timeout: Duration::from_secs(90),
            per_call_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(30 * 60),
            history_window: 10,
            history_retention: Duration::from_secs(24 * 3600),
            conversation_db_path: "./state.db".to_string(),
        }
    }
}
