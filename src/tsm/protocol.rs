//! Wire types for the line-delimited JSON-RPC 2.0 subset spoken with tool
//! server subprocesses over stdio.
//!
//! Every message is exactly one line of UTF-8 JSON followed by `\n`. Three
//! shapes exist: requests we send, responses we receive keyed by `id`, and
//! `log` notifications the server may send unsolicited.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request sent to a tool server over stdin.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    /// Build the `tools/list` discovery request.
    pub fn tools_list(id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: "tools/list".to_string(),
            params: serde_json::json!({}),
        }
    }

    /// Build a `tools/call` request for the given tool and arguments.
    pub fn tools_call(id: u64, tool_name: &str, arguments: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: "tools/call".to_string(),
            params: serde_json::json!({ "name": tool_name, "arguments": arguments }),
        }
    }

    /// Serialize to a single line, including the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }
}

/// A remote error reported inside an `RpcResponse`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// An inbound message from a tool server's stdout. Responses are correlated
/// to a pending request by `id`; a `log` method with no `id` is a
/// notification and is forwarded to `tracing` rather than the pending table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    /// A response to a previously sent request.
    Response(RpcResponse),
    /// An unsolicited `log` notification.
    Notification(RpcNotification),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcNotification {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// The `tools/list` result payload: `{"tools":[{name,description,inputSchema}...]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<RawToolEntry>,
}

/// One entry from a `tools/list` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RawToolEntry {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_trailing_newline() {
        let req = RpcRequest::tools_list(1);
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"method\":\"tools/list\""));
    }

    #[test]
    fn response_parses_as_response_not_notification() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::Response(r) => {
                assert_eq!(r.id, 7);
                assert!(r.error.is_none());
            }
            InboundMessage::Notification(_) => panic!("expected a response"),
        }
    }

    #[test]
    fn log_notification_has_no_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"log","params":{"level":"info","message":"hi"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::Notification(n) => assert_eq!(n.method, "log"),
            InboundMessage::Response(_) => panic!("expected a notification"),
        }
    }

    #[test]
    fn tools_list_result_parses_the_wrapped_array_and_input_schema_field() {
        let raw = r#"{"tools":[{"name":"search","description":"web search","inputSchema":{"type":"object"}}]}"#;
        let result: ToolsListResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name, "search");
        assert_eq!(result.tools[0].input_schema, serde_json::json!({"type": "object"}));
    }

    #[test]
    fn error_response_carries_code_and_message() {
        let raw = r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no such tool"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        match msg {
            InboundMessage::Response(r) => {
                let err = r.error.unwrap();
                assert_eq!(err.code, -32601);
                assert_eq!(err.message, "no such tool");
            }
            InboundMessage::Notification(_) => panic!("expected a response"),
        }
    }
}
