//! MCP stdio host: kernel verbs exposed as JSON-RPC 2.0 tools.
//!
//! Implements `initialize`, `tools/list`, and `tools/call` over
//! line-delimited JSON on stdin/stdout. Tool names are the kernel verb
//! names and satisfy `^[A-Za-z0-9_-]{1,64}$`.

use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use teambook_kernel::{Kernel, KERNEL_VERBS};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Run the stdio loop until stdin closes. Returns the process exit code.
pub async fn serve_stdio(kernel: Arc<Kernel>) -> i32 {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let Some(response) = handle_line(&kernel, &line).await else {
            continue; // notification: no response
        };
        let mut payload = response.to_string();
        payload.push('\n');
        if stdout.write_all(payload.as_bytes()).await.is_err() {
            return 1;
        }
        let _ = stdout.flush().await;
    }
    0
}

async fn handle_line(kernel: &Kernel, line: &str) -> Option<JsonValue> {
    let request: JsonValue = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "malformed json-rpc frame");
            return Some(error_response(JsonValue::Null, PARSE_ERROR, "parse error"));
        }
    };

    let id = request.get("id").cloned();
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let params = request.get("params").cloned().unwrap_or(json!({}));

    // Notifications carry no id and get no response.
    let Some(id) = id else {
        debug!(method, "notification");
        return None;
    };

    if request["jsonrpc"].as_str() != Some("2.0") {
        return Some(error_response(id, INVALID_REQUEST, "jsonrpc must be '2.0'"));
    }

    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {
                "name": "teambook",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
        "tools/list" => json!({"tools": tool_definitions()}),
        "tools/call" => {
            let name = params["name"].as_str().unwrap_or_default();
            if !is_valid_tool_name(name) || !KERNEL_VERBS.contains(&name) {
                return Some(error_response(
                    id,
                    INVALID_PARAMS,
                    &format!("unknown tool '{}'", name),
                ));
            }
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            let response = kernel.execute(name, &arguments).await;
            let text =
                serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
            json!({
                "content": [{"type": "text", "text": text}],
                "isError": !response.success,
            })
        }
        "ping" => json!({}),
        _ => {
            return Some(error_response(
                id,
                METHOD_NOT_FOUND,
                &format!("method '{}' not found", method),
            ))
        }
    };

    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn error_response(id: JsonValue, code: i64, message: &str) -> JsonValue {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn tool_definitions() -> Vec<JsonValue> {
    KERNEL_VERBS
        .iter()
        .map(|verb| {
            json!({
                "name": verb,
                "description": format!("Teambook verb: {}", verb),
                "inputSchema": {
                    "type": "object",
                    "additionalProperties": true,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use teambook_core::TeambookConfig;
    use teambook_events::EventBus;
    use teambook_storage::SqliteBackend;

    async fn kernel() -> (tempfile::TempDir, Arc<Kernel>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = TeambookConfig {
            root: dir.path().to_path_buf(),
            identity_dir: Some(dir.path().join("identity")),
            ..Default::default()
        };
        let store = Arc::new(SqliteBackend::new(config.root.clone()));
        (dir, Arc::new(Kernel::new(config, store, EventBus::new(64))))
    }

    #[tokio::test]
    async fn test_initialize() {
        let (_dir, kernel) = kernel().await;
        let response = handle_line(
            &kernel,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        )
        .await
        .expect("response");
        assert_eq!(response["result"]["serverInfo"]["name"], "teambook");
        assert_eq!(response["id"], 1);
    }

    #[tokio::test]
    async fn test_tools_list_names_valid() {
        let (_dir, kernel) = kernel().await;
        let response = handle_line(
            &kernel,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        )
        .await
        .expect("response");
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), KERNEL_VERBS.len());
        for tool in tools {
            assert!(is_valid_tool_name(tool["name"].as_str().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_tools_call_roundtrip() {
        let (_dir, kernel) = kernel().await;
        let response = handle_line(
            &kernel,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"write_note","arguments":{"content":"via mcp"}}}"#,
        )
        .await
        .expect("response");
        assert_eq!(response["result"]["isError"], false);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        let inner: JsonValue = serde_json::from_str(text).unwrap();
        assert_eq!(inner["success"], true);
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let (_dir, kernel) = kernel().await;
        let response = handle_line(
            &kernel,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"rm -rf"}}"#,
        )
        .await
        .expect("response");
        assert_eq!(response["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let (_dir, kernel) = kernel().await;
        let response = handle_line(
            &kernel,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert!(response.is_none());
    }
}
