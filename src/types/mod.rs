//! Core types shared across the tool server manager, planner, and
//! conversation store.
//!
//! This module contains the data model described by the system's entity
//! table (tool servers, tool calls/results, sessions, messages, planner
//! runs) and the stable error taxonomy every fallible operation returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============= Tool Server / Catalog Types =============

/// A subprocess-backed tool server as discovered from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServer {
    /// Name used to address this server in `server_name` fields and config keys.
    pub name: String,
    /// Command used to spawn the subprocess.
    pub command: String,
    /// Arguments passed to the command.
    pub args: Vec<String>,
}

/// Definition of a single tool as advertised by a tool server's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Name of the server that owns this tool.
    pub server_name: String,
    /// Tool name, unique within its server.
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    /// The fully-qualified name the planner and LLM bridge use to disambiguate
    /// tools with the same short name on different servers.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.server_name, self.name)
    }
}

/// A snapshot of every tool currently advertised by every running server.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolSpec>,
}

impl ToolCatalog {
    /// Build a catalog from a flat list of tool specs.
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self { tools }
    }

    /// All tools currently known, across all servers.
    pub fn all(&self) -> &[ToolSpec] {
        &self.tools
    }

    /// Look up a tool by server name and tool name.
    pub fn find(&self, server_name: &str, tool_name: &str) -> Option<&ToolSpec> {
        self.tools
            .iter()
            .find(|t| t.server_name == server_name && t.name == tool_name)
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the model for this call (preserved end to end).
    pub id: String,
    /// Server that owns the tool being called.
    pub server_name: String,
    /// Name of the tool to call.
    pub name: String,
    /// Arguments to pass to the tool.
    pub arguments: serde_json::Value,
}

/// Outcome of executing a single `ToolCall`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// ID of the tool call this result corresponds to.
    pub tool_call_id: String,
    /// Whether the call succeeded.
    pub ok: bool,
    /// The tool's return payload on success, or a synthetic
    /// `{"error": {"kind": ..., "message": ...}}` object on failure.
    pub payload: serde_json::Value,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
}

impl ToolResult {
    /// Build a success result.
    pub fn ok(tool_call_id: impl Into<String>, payload: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            ok: true,
            payload,
            duration_ms,
        }
    }

    /// Build a failure result carrying the synthetic error envelope.
    pub fn err(
        tool_call_id: impl Into<String>,
        kind: &str,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            ok: false,
            payload: serde_json::json!({"error": {"kind": kind, "message": message.into()}}),
            duration_ms,
        }
    }
}

// ============= Conversation Types =============

/// A persisted conversation session, scoped to a `user_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Opaque key identifying the owning user/caller.
    pub user_key: String,
    /// When this session was first created.
    pub created_at: DateTime<Utc>,
}

/// A single message in a conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Database row id, assigned on insert.
    #[serde(default)]
    pub id: Option<i64>,
    /// Session this message belongs to.
    pub session_id: String,
    /// Opaque key identifying the owning user/caller.
    pub user_key: String,
    /// The role of the message sender.
    pub role: MessageRole,
    /// The message content.
    pub content: String,
    /// Free-form metadata (e.g. tool call ids, confidence, mentioned entities).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// When the message was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the user.
    User,
    /// Response from the assistant.
    Assistant,
    /// Synthetic message carrying a tool's result back into the transcript.
    Tool,
}

impl MessageRole {
    /// The lowercase string stored in the database `role` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "tool" => Ok(MessageRole::Tool),
            other => Err(CoreError::StorageError(format!(
                "unknown message role in storage: {other}"
            ))),
        }
    }
}

// ============= Planner Types =============

/// Terminal state a planner run can end in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlannerState {
    /// The run is still iterating.
    Planning,
    /// The run is waiting on in-flight tool calls.
    Executing,
    /// The model produced a final answer within budget.
    Done,
    /// The wall-clock timeout elapsed before a final answer was produced.
    TimedOut,
    /// Iteration or tool-call budgets were exhausted.
    BudgetExhausted,
    /// The run was aborted by the caller.
    Aborted,
}

/// Bookkeeping for a single invocation of the agentic loop.
#[derive(Debug, Clone)]
pub struct PlannerRun {
    /// Iterations (model round-trips) completed so far.
    pub iterations: usize,
    /// Total tool calls dispatched so far, across all iterations.
    pub tool_calls_made: usize,
    /// Current state of the run.
    pub state: PlannerState,
}

impl PlannerRun {
    /// A fresh run, about to begin its first iteration.
    pub fn new() -> Self {
        Self {
            iterations: 0,
            tool_calls_made: 0,
            state: PlannerState::Planning,
        }
    }
}

impl Default for PlannerRun {
    fn default() -> Self {
        Self::new()
    }
}

// ============= Error Taxonomy =============

/// Stable error kinds returned by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The requested tool does not exist on any known server.
    #[error("no such tool: {0}")]
    NoSuchTool(String),

    /// The named tool server has no running process to dispatch to.
    #[error("tool server unavailable: {0}")]
    ServerUnavailable(String),

    /// The tool server's subprocess exited or was restarted mid-call.
    #[error("tool server crashed: {0}")]
    ServerCrashed(String),

    /// A tool call did not complete within its deadline.
    #[error("tool call timed out after {0:?}")]
    CallTimeout(std::time::Duration),

    /// The tool server sent a line that could not be parsed as a wire message.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The tool server returned a JSON-RPC error response.
    #[error("remote error {code}: {msg}")]
    RemoteError {
        /// JSON-RPC error code reported by the tool server.
        code: i64,
        /// Human-readable error message reported by the tool server.
        msg: String,
    },

    /// The LLM backend could not be reached or returned a transport failure.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The LLM backend explicitly refused the request (e.g. content policy).
    #[error("model refused: {0}")]
    ModelRefused(String),

    /// The model's plan did not conform to the expected tool-call/final shape,
    /// or its arguments failed schema validation.
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    /// An iteration, tool-call, or wall-clock budget was exceeded.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// The conversation store failed to read or write.
    #[error("storage error: {0}")]
    StorageError(String),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, CoreError>;
