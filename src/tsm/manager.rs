//! Owns every tool server, publishes an atomic catalog snapshot, and
//! restarts crashed servers with exponential backoff.

use crate::config::ToolServerConfig;
use crate::tsm::server::ToolServerHandle;
use crate::types::{CoreError, Result, ToolCall, ToolCatalog, ToolResult};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct ServerSlot {
    handle: Arc<ToolServerHandle>,
    config: ToolServerConfig,
}

/// Coordinates the lifecycle of all configured tool servers and the single
/// atomically-swapped `ToolCatalog` consumers read from.
pub struct ToolServerManager {
    servers: RwLock<HashMap<String, ServerSlot>>,
    catalog: ArcSwap<ToolCatalog>,
    startup_timeout: Duration,
    max_inflight: usize,
}

impl ToolServerManager {
    /// Spawn every configured server and build the initial catalog. A
    /// server that fails to start is logged and skipped rather than
    /// aborting startup of the others.
    pub async fn start(
        configs: Vec<ToolServerConfig>,
        startup_timeout: Duration,
        max_inflight: usize,
    ) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            servers: RwLock::new(HashMap::new()),
            catalog: ArcSwap::from_pointee(ToolCatalog::default()),
            startup_timeout,
            max_inflight,
        });

        for config in configs {
            if let Err(e) = manager.clone().spawn_and_register(config.clone()).await {
                tracing::error!(server = %config.name, error = %e, "failed to start tool server");
            }
        }
        manager.rebuild_catalog().await;
        Ok(manager)
    }

    async fn spawn_and_register(self: Arc<Self>, config: ToolServerConfig) -> Result<()> {
        let (handle, _tools) = ToolServerHandle::spawn(
            config.name.clone(),
            config.command.clone(),
            self.startup_timeout,
            self.max_inflight,
        )
        .await?;

        self.servers.write().await.insert(
            config.name.clone(),
            ServerSlot {
                handle,
                config,
            },
        );
        Ok(())
    }

    async fn rebuild_catalog(&self) {
        let servers = self.servers.read().await;
        let mut tools = Vec::new();
        for slot in servers.values() {
            match slot.handle.list_tools(self.startup_timeout).await {
                Ok(specs) => tools.extend(specs),
                Err(e) => {
                    tracing::warn!(server = %slot.config.name, error = %e, "tools/list failed during catalog rebuild");
                }
            }
        }
        self.catalog.store(Arc::new(ToolCatalog::new(tools)));
    }

    /// Every tool currently known across all servers, as of the last catalog
    /// publish. Call this once per planner run; the snapshot is immutable
    /// for the lifetime of that run.
    pub fn list_all_tools(&self) -> Arc<ToolCatalog> {
        self.catalog.load_full()
    }

    /// Dispatch a single tool call, returning a fully-formed `ToolResult`
    /// that always preserves the call's original `id`.
    pub async fn call(self: &Arc<Self>, call: &ToolCall, deadline: Duration) -> ToolResult {
        let servers = self.servers.read().await;
        let Some(slot) = servers.get(&call.server_name) else {
            return ToolResult::err(
                &call.id,
                "server_unavailable",
                format!("no such tool server: {}", call.server_name),
                0,
            );
        };
        let handle = slot.handle.clone();
        drop(servers);

        let (result, duration_ms) = handle.call(&call.name, call.arguments.clone(), deadline).await;

        if handle.should_restart() {
            tracing::warn!(server = %call.server_name, "triple malformed line fault, scheduling restart");
            self.spawn_restart_loop(call.server_name.clone());
        }

        match result {
            Ok(payload) => ToolResult::ok(&call.id, payload, duration_ms),
            Err(CoreError::CallTimeout(_)) => {
                ToolResult::err(&call.id, "timeout", "tool call timed out", duration_ms)
            }
            Err(CoreError::RemoteError { code, msg }) => ToolResult::err(
                &call.id,
                "remote_error",
                format!("{code}: {msg}"),
                duration_ms,
            ),
            Err(e) => ToolResult::err(&call.id, "server_error", e.to_string(), duration_ms),
        }
    }

    /// Restart a crashed or wedged server with exponential backoff, retrying
    /// indefinitely in the background.
    pub fn spawn_restart_loop(self: &Arc<Self>, server_name: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                let config = {
                    let servers = manager.servers.read().await;
                    servers.get(&server_name).map(|s| s.config.clone())
                };
                let Some(config) = config else { return };

                {
                    let servers = manager.servers.read().await;
                    if let Some(slot) = servers.get(&server_name) {
                        slot.handle.fail_all_pending();
                        slot.handle.shutdown(SHUTDOWN_GRACE).await;
                    }
                }

                match Arc::clone(&manager).spawn_and_register(config).await {
                    Ok(()) => {
                        manager.rebuild_catalog().await;
                        tracing::info!(server = %server_name, "tool server restarted");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(server = %server_name, error = %e, backoff = ?backoff, "restart attempt failed");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });
    }

    /// Gracefully stop every tool server (SIGTERM, then SIGKILL after the
    /// grace period).
    pub async fn shutdown(&self) {
        let mut servers = self.servers.write().await;
        for (_, slot) in servers.drain() {
            slot.handle.shutdown(SHUTDOWN_GRACE).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[tokio::test]
    async fn calling_an_unconfigured_server_returns_a_server_unavailable_error() {
        let manager = ToolServerManager::start(Vec::new(), Duration::from_secs(1), 4)
            .await
            .unwrap();

        let call = ToolCall {
            id: "call-1".to_string(),
            server_name: "nonexistent".to_string(),
            name: "noop".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = manager.call(&call, Duration::from_secs(1)).await;

        assert_eq!(result.tool_call_id, "call-1");
        assert!(!result.ok);
        assert_eq!(result.payload["error"]["kind"], "server_unavailable");
    }

    #[tokio::test]
    async fn an_empty_catalog_is_published_when_no_servers_are_configured() {
        let manager = ToolServerManager::start(Vec::new(), Duration::from_secs(1), 4)
            .await
            .unwrap();
        assert!(manager.list_all_tools().all().is_empty());
    }
}
