//! # agentbridge
//!
//! An agentic tool-orchestration core: it spawns subprocess tool servers
//! speaking a line-delimited JSON-RPC subset, runs a bounded think-act-observe
//! planning loop against a pluggable LLM backend, and persists conversation
//! history to an embedded libsql database.
//!
//! ## Modules
//!
//! - [`config`] - environment-driven configuration
//! - [`types`] - shared data model and error taxonomy
//! - [`tsm`] - Tool Server Manager: subprocess lifecycle, wire protocol, dispatch
//! - [`llm`] - pluggable LLM bridges (OpenAI, Anthropic)
//! - [`memory`] - conversation history persistence and prompt hydration
//! - [`planner`] - the agentic loop
//! - [`cli`] - command-line argument parsing and terminal output

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// Command-line argument parsing and terminal output.
pub mod cli;
/// Environment-driven configuration.
pub mod config;
/// Pluggable LLM bridges.
pub mod llm;
/// Conversation history persistence and prompt hydration.
pub mod memory;
/// The agentic loop.
pub mod planner;
/// Tool Server Manager.
pub mod tsm;
/// Shared data model and error taxonomy.
pub mod types;

use crate::config::Config;
use crate::llm::LlmBridge;
use crate::memory::store::ConversationStore;
use crate::planner::{Planner, PlannerOutcome};
use crate::tsm::ToolServerManager;
use crate::types::Result;
use std::sync::Arc;

/// Top-level facade wiring the tool server manager, LLM bridge, conversation
/// store, and planner together into a single entry point for driving turns.
pub struct AgentCore {
    planner: Planner,
    store: Arc<ConversationStore>,
    tsm: Arc<ToolServerManager>,
}

impl AgentCore {
    /// Start every configured tool server, open the conversation store, and
    /// wire up the planner. `llm` is constructed by the caller since its
    /// concrete type depends on which provider feature is enabled.
    pub async fn start(config: Config, llm: Arc<dyn LlmBridge>) -> Result<Self> {
        let tsm = ToolServerManager::start(
            config.tool_servers.clone(),
            config.tool_server_startup_timeout,
            config.tool_server_max_inflight,
        )
        .await?;

        let store = Arc::new(ConversationStore::open(&config.conversation_db_path).await?);
        let planner = Planner::new(Arc::clone(&tsm), llm, Arc::clone(&store), config);

        Ok(Self { planner, store, tsm })
    }

    /// Run one user turn through the agentic loop.
    pub async fn run(&self, user_key: &str, user_text: &str) -> Result<PlannerOutcome> {
        self.planner.run(user_key, user_text).await
    }

    /// Clear a user's stored conversation history.
    pub async fn clear(&self, user_key: &str) -> Result<()> {
        self.store.clear(user_key).await
    }

    /// Gracefully stop every tool server subprocess.
    pub async fn shutdown(&self) {
        self.tsm.shutdown().await;
    }
}
