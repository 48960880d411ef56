//! The agentic loop: alternates model round-trips with parallel tool
//! dispatch until the model returns a final answer or a budget is hit.

use crate::config::Config;
use crate::llm::{validate_arguments, LlmBridge, ModelParams, Plan};
use crate::memory::store::ConversationStore;
use crate::memory::{format_history_for_prompt, truncate_history_to_tokens};
use crate::tsm::ToolServerManager;
use crate::types::{
    CoreError, Message, MessageRole, PlannerRun, PlannerState, Result, ToolCall, ToolResult,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on estimated tokens hydrated from history into a run's
/// transcript prefix, independent of `HISTORY_WINDOW`'s message count cap.
const HISTORY_TOKEN_BUDGET: usize = 4000;

/// Result of a single `Planner::run` invocation.
#[derive(Debug, Clone)]
pub struct PlannerOutcome {
    /// The assistant's final answer, if the run reached `Done`.
    pub assistant_text: String,
    /// Every tool call dispatched across all iterations, in request order.
    pub tool_calls_made: Vec<ToolCall>,
    /// The state the run ended in.
    pub state: PlannerState,
}

/// Drives one conversation turn through the agentic loop.
pub struct Planner {
    tsm: Arc<ToolServerManager>,
    llm: Arc<dyn LlmBridge>,
    store: Arc<ConversationStore>,
    config: Config,
}

impl Planner {
    pub fn new(
        tsm: Arc<ToolServerManager>,
        llm: Arc<dyn LlmBridge>,
        store: Arc<ConversationStore>,
        config: Config,
    ) -> Self {
        Self {
            tsm,
            llm,
            store,
            config,
        }
    }

    /// Run the agentic loop for one user turn, returning once the model
    /// produces a final answer or a budget is exhausted.
    pub async fn run(&self, user_key: &str, user_text: &str) -> Result<PlannerOutcome> {
        let started = Instant::now();
        let session = self
            .store
            .open_or_reuse_session(user_key, self.config.session_idle_timeout)
            .await?;

        let mut transcript = self.store.recent(user_key, self.config.history_window).await;
        transcript = truncate_history_to_tokens(&transcript, HISTORY_TOKEN_BUDGET);
        tracing::debug!(user_key, history = %format_history_for_prompt(&transcript), "hydrated transcript prefix");

        let user_message = Message {
            id: None,
            session_id: session.id.clone(),
            user_key: user_key.to_string(),
            role: MessageRole::User,
            content: user_text.to_string(),
            metadata: None,
            timestamp: chrono::Utc::now(),
        };
        self.store.append(&user_message).await;
        transcript.push(user_message);

        let mut run = PlannerRun::new();
        let mut tool_calls_made = Vec::new();

        loop {
            if started.elapsed() >= self.config.agentic_timeout {
                run.state = PlannerState::TimedOut;
                break;
            }
            if run.iterations >= self.config.agentic_max_iterations {
                run.state = PlannerState::BudgetExhausted;
                break;
            }

            run.state = PlannerState::Planning;
            let catalog = self.tsm.list_all_tools();
            let (plan, _usage) = self
                .llm
                .plan(&transcript, catalog.all(), &ModelParams::default())
                .await?;
            run.iterations += 1;

            // No tool calls and no text is treated as an implicit empty final answer.
            let plan = match plan {
                Plan::ToolCalls(calls) if calls.is_empty() => Plan::Final(String::new()),
                other => other,
            };

            match plan {
                Plan::Final(text) => {
                    let assistant_message = Message {
                        id: None,
                        session_id: session.id.clone(),
                        user_key: user_key.to_string(),
                        role: MessageRole::Assistant,
                        content: text.clone(),
                        metadata: None,
                        timestamp: chrono::Utc::now(),
                    };
                    self.store.append(&assistant_message).await;
                    run.state = PlannerState::Done;
                    return Ok(PlannerOutcome {
                        assistant_text: text,
                        tool_calls_made,
                        state: run.state,
                    });
                }
                Plan::ToolCalls(calls) => {
                    run.state = PlannerState::Executing;
                    let assistant_note = Message {
                        id: None,
                        session_id: session.id.clone(),
                        user_key: user_key.to_string(),
                        role: MessageRole::Assistant,
                        content: format!("requesting {} tool call(s)", calls.len()),
                        metadata: Some(serde_json::json!({
                            "tool_calls": calls,
                        })),
                        timestamp: chrono::Utc::now(),
                    };
                    self.store.append(&assistant_note).await;
                    transcript.push(assistant_note);

                    // Calls beyond the remaining tool-call budget are denied
                    // rather than aborting the run outright, so the model
                    // still gets a chance to finalize on its next turn.
                    let remaining_budget =
                        self.config.agentic_max_tool_calls.saturating_sub(run.tool_calls_made);
                    let (to_execute, denied) = if calls.len() > remaining_budget {
                        (calls[..remaining_budget].to_vec(), calls[remaining_budget..].to_vec())
                    } else {
                        (calls.clone(), Vec::new())
                    };

                    let mut results = self.execute_parallel(&to_execute, catalog.as_ref()).await;
                    for call in &denied {
                        results.push(ToolResult::err(
                            &call.id,
                            "budget_exceeded",
                            "tool-call budget exhausted; this call was not executed",
                            0,
                        ));
                    }
                    let dispatched: Vec<ToolCall> =
                        to_execute.iter().cloned().chain(denied.iter().cloned()).collect();

                    for (call, result) in dispatched.iter().zip(results.iter()) {
                        let tool_message = Message {
                            id: None,
                            session_id: session.id.clone(),
                            user_key: user_key.to_string(),
                            role: MessageRole::Tool,
                            content: result.payload.to_string(),
                            metadata: Some(serde_json::json!({
                                "tool_call_id": result.tool_call_id,
                            })),
                            timestamp: chrono::Utc::now(),
                        };
                        self.store.append(&tool_message).await;
                        transcript.push(tool_message);
                        tracing::debug!(tool = %call.qualified_display(), ok = result.ok, "tool call completed");
                    }

                    run.tool_calls_made += to_execute.len();
                    tool_calls_made.extend(to_execute);
                }
            }
        }

        let synthesis = self.synthesize_on_exhaustion(&transcript, run.state).await;
        let synthesis_message = Message {
            id: None,
            session_id: session.id.clone(),
            user_key: user_key.to_string(),
            role: MessageRole::Assistant,
            content: synthesis.clone(),
            metadata: None,
            timestamp: chrono::Utc::now(),
        };
        self.store.append(&synthesis_message).await;

        Ok(PlannerOutcome {
            assistant_text: synthesis,
            tool_calls_made,
            state: run.state,
        })
    }

    /// Dispatch every call in `calls` concurrently, preserving request order
    /// and the call's `id`/`name` on every outcome, including failures.
    async fn execute_parallel(
        &self,
        calls: &[ToolCall],
        catalog: &crate::types::ToolCatalog,
    ) -> Vec<ToolResult> {
        let futures = calls.iter().map(|call| {
            let tsm = Arc::clone(&self.tsm);
            let deadline = self.config.per_call_timeout;
            let validation = catalog
                .find(&call.server_name, &call.name)
                .ok_or_else(|| CoreError::NoSuchTool(format!("{}/{}", call.server_name, call.name)))
                .and_then(|spec| validate_arguments(call, spec));
            async move {
                match validation {
                    Ok(()) => tsm.call(call, deadline).await,
                    Err(e) => ToolResult::err(&call.id, "malformed_plan", e.to_string(), 0),
                }
            }
        });
        join_all(futures).await
    }

    /// Best-effort wrap-up once a budget has been exhausted: ask the model
    /// for one final answer with no tools offered, so it cannot extend the
    /// run. Falls back to a fixed polite message if that call also fails or
    /// still wants to call a tool.
    async fn synthesize_on_exhaustion(&self, transcript: &[Message], state: PlannerState) -> String {
        if matches!(state, PlannerState::TimedOut | PlannerState::BudgetExhausted) {
            if let Ok((Plan::Final(text), _)) = self.llm.plan(transcript, &[], &ModelParams::default()).await {
                if !text.is_empty() {
                    return text;
                }
            }
        }

        match state {
            PlannerState::TimedOut => {
                "The request took too long to complete; here is what was gathered before the timeout.".to_string()
            }
            PlannerState::BudgetExhausted => {
                "The task required more tool calls or iterations than allowed; returning partial progress.".to_string()
            }
            _ => transcript
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        }
    }
}

impl ToolCall {
    fn qualified_display(&self) -> String {
        format!("{}/{}", self.server_name, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolSpec;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FinalAnswerBridge {
        answer: String,
    }

    #[async_trait]
    impl LlmBridge for FinalAnswerBridge {
        async fn plan(
            &self,
            _transcript: &[Message],
            _tools: &[ToolSpec],
            _params: &ModelParams,
        ) -> Result<(Plan, crate::llm::TokenUsage)> {
            Ok((Plan::Final(self.answer.clone()), crate::llm::TokenUsage::default()))
        }

        fn model_name(&self) -> &str {
            "test-model"
        }
    }

    struct CountingToolThenFinalBridge {
        calls_remaining: AtomicUsize,
    }

    #[async_trait]
    impl LlmBridge for CountingToolThenFinalBridge {
        async fn plan(
            &self,
            _transcript: &[Message],
            _tools: &[ToolSpec],
            _params: &ModelParams,
        ) -> Result<(Plan, crate::llm::TokenUsage)> {
            let remaining = self.calls_remaining.fetch_sub(1, Ordering::SeqCst);
            if remaining == 0 {
                Ok((Plan::Final("done".to_string()), crate::llm::TokenUsage::default()))
            } else {
                Ok((
                    Plan::ToolCalls(vec![ToolCall {
                        id: format!("call-{remaining}"),
                        server_name: "missing_server".to_string(),
                        name: "noop".to_string(),
                        arguments: serde_json::json!({}),
                    }]),
                    crate::llm::TokenUsage::default(),
                ))
            }
        }

        fn model_name(&self) -> &str {
            "test-model"
        }
    }

    struct TwoCallsThenFinalBridge {
        already_called: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LlmBridge for TwoCallsThenFinalBridge {
        async fn plan(
            &self,
            _transcript: &[Message],
            _tools: &[ToolSpec],
            _params: &ModelParams,
        ) -> Result<(Plan, crate::llm::TokenUsage)> {
            if self.already_called.swap(true, Ordering::SeqCst) {
                return Ok((Plan::Final("wrapped up".to_string()), crate::llm::TokenUsage::default()));
            }
            Ok((
                Plan::ToolCalls(vec![
                    ToolCall {
                        id: "call-a".to_string(),
                        server_name: "missing_server".to_string(),
                        name: "noop".to_string(),
                        arguments: serde_json::json!({}),
                    },
                    ToolCall {
                        id: "call-b".to_string(),
                        server_name: "missing_server".to_string(),
                        name: "noop".to_string(),
                        arguments: serde_json::json!({}),
                    },
                ]),
                crate::llm::TokenUsage::default(),
            ))
        }

        fn model_name(&self) -> &str {
            "test-model"
        }
    }

    async fn planner_with(
        llm: Arc<dyn LlmBridge>,
        config: Config,
    ) -> (Planner, Arc<ConversationStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("planner_test.db");
        let store = Arc::new(ConversationStore::open(db_path.to_str().unwrap()).await.unwrap());
        let tsm = ToolServerManager::start(Vec::new(), std::time::Duration::from_secs(1), 4)
            .await
            .unwrap();
        (Planner::new(tsm, llm, Arc::clone(&store), config), store, dir)
    }

    #[tokio::test]
    async fn a_final_answer_on_the_first_turn_ends_the_run_as_done() {
        let bridge = Arc::new(FinalAnswerBridge {
            answer: "hello there".to_string(),
        });
        let (planner, _store, _dir) = planner_with(bridge, Config::default()).await;

        let outcome = planner.run("alice", "hi").await.unwrap();
        assert_eq!(outcome.state, PlannerState::Done);
        assert_eq!(outcome.assistant_text, "hello there");
        assert!(outcome.tool_calls_made.is_empty());
    }

    #[tokio::test]
    async fn exceeding_max_iterations_ends_in_budget_exhausted() {
        let mut config = Config::default();
        config.agentic_max_iterations = 2;
        let bridge = Arc::new(CountingToolThenFinalBridge {
            calls_remaining: AtomicUsize::new(10),
        });
        let (planner, _store, _dir) = planner_with(bridge, config).await;

        let outcome = planner.run("bob", "do a lot of tool calls").await.unwrap();
        assert_eq!(outcome.state, PlannerState::BudgetExhausted);
        assert_eq!(outcome.tool_calls_made.len(), 2);
    }

    #[tokio::test]
    async fn a_call_to_an_unknown_server_preserves_id_and_name_on_failure() {
        let bridge = Arc::new(CountingToolThenFinalBridge {
            calls_remaining: AtomicUsize::new(1),
        });
        let (planner, _store, _dir) = planner_with(bridge, Config::default()).await;

        let outcome = planner.run("carol", "call a missing tool").await.unwrap();
        assert_eq!(outcome.tool_calls_made.len(), 1);
        assert_eq!(outcome.tool_calls_made[0].server_name, "missing_server");
        assert_eq!(outcome.tool_calls_made[0].name, "noop");
    }

    #[tokio::test]
    async fn a_call_beyond_the_remaining_tool_budget_is_denied_not_aborted() {
        let mut config = Config::default();
        config.agentic_max_tool_calls = 1;
        let bridge = Arc::new(TwoCallsThenFinalBridge {
            already_called: std::sync::atomic::AtomicBool::new(false),
        });
        let (planner, _store, _dir) = planner_with(bridge, config).await;

        let outcome = planner.run("dina", "call two things").await.unwrap();

        // Only the first call actually runs; the run keeps going and the
        // model still gets to finalize rather than aborting outright.
        assert_eq!(outcome.state, PlannerState::Done);
        assert_eq!(outcome.assistant_text, "wrapped up");
        assert_eq!(outcome.tool_calls_made.len(), 1);
        assert_eq!(outcome.tool_calls_made[0].id, "call-a");
    }

    #[tokio::test]
    async fn a_timed_out_run_still_persists_its_synthesized_answer() {
        let mut config = Config::default();
        config.agentic_timeout = std::time::Duration::from_secs(0);
        let bridge = Arc::new(FinalAnswerBridge {
            answer: "still got something for you".to_string(),
        });
        let (planner, store, _dir) = planner_with(bridge, config).await;

        let outcome = planner.run("tia", "hi").await.unwrap();
        assert_eq!(outcome.state, PlannerState::TimedOut);

        let history = store.recent("tia", 10).await;
        assert!(history.iter().any(|m| m.content == outcome.assistant_text));
    }
}
