//! MCP passthrough shim.
//!
//! Launched by the session library as a stdio MCP server. Every
//! `tools/list` and `tools/call` is forwarded over HTTP to the proxy's
//! tool bridge, which parks the call until Xcode delivers the result.
//! `MCP_SERVER_PORT` selects the bridge port. stdout carries only JSON-RPC;
//! logging goes to stderr.

use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, ErrorCode, Implementation,
        InitializeRequestParam, InitializeResult, ListToolsResult, PaginatedRequestParam,
        ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
    },
    service::{RequestContext, RoleServer},
    transport::stdio,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::Deserialize;
use serde_json::Value;

use xcproxy::constants::{DEFAULT_PORT, MCP_SERVER_PORT_ENV};

/// A tool entry as the bridge's `/internal/tools` serves it.
#[derive(Debug, Deserialize)]
struct BridgeTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "inputSchema", default)]
    input_schema: Value,
}

impl From<BridgeTool> for Tool {
    fn from(tool: BridgeTool) -> Self {
        let input_schema = match tool.input_schema {
            Value::Object(obj) => Arc::new(obj),
            _ => Arc::new(serde_json::Map::new()),
        };
        Tool {
            name: tool.name.into(),
            description: Some(tool.description.into()),
            input_schema,
            annotations: None,
        }
    }
}

/// MCP server that impersonates the Xcode tool catalog and routes every
/// call back through the bridge.
struct BridgePassthrough {
    client: reqwest::Client,
    base_url: String,
}

impl BridgePassthrough {
    fn new(port: u16) -> Self {
        let client = reqwest::Client::builder()
            // Must outlive the bridge's 5-minute park.
            .timeout(Duration::from_secs(330))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: format!("http://127.0.0.1:{}", port),
        }
    }
}

fn internal_error(message: impl std::fmt::Display) -> McpError {
    McpError::new(ErrorCode::INTERNAL_ERROR, message.to_string(), None)
}

/// The bridge replies `{"content": ...}`; MCP wants a text item.
fn content_text(payload: &Value) -> String {
    match payload.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl ServerHandler for BridgePassthrough {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "xcproxy MCP shim".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Forwards tool calls to the Xcode tool bridge for local execution".to_string(),
            ),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let url = format!("{}/internal/tools", self.base_url);
        let tools: Vec<BridgeTool> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(internal_error)?
            .error_for_status()
            .map_err(internal_error)?
            .json()
            .await
            .map_err(internal_error)?;

        log::debug!("Bridge served {} tool(s)", tools.len());
        Ok(ListToolsResult {
            tools: tools.into_iter().map(Tool::from).collect(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let url = format!("{}/internal/tool-call", self.base_url);
        let body = serde_json::json!({
            "name": request.name,
            "arguments": Value::Object(request.arguments.unwrap_or_default()),
        });

        log::debug!("Forwarding tool call {} to bridge", body["name"]);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(internal_error)?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(internal_error)?;

        if status.is_success() {
            Ok(CallToolResult {
                content: vec![Content::text(content_text(&payload))].into(),
                is_error: Some(false),
            })
        } else {
            // The session library surfaces this as a tool error and the
            // conversation continues.
            let message = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("tool call failed")
                .to_string();
            log::warn!("Bridge rejected tool call: {}", message);
            Ok(CallToolResult {
                content: vec![Content::text(message)].into(),
                is_error: Some(true),
            })
        }
    }
}

fn setup_stderr_logger() {
    let _ = fern::Dispatch::new()
        .level(log::LevelFilter::Info)
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}] {}",
                chrono::Local::now().format("%H:%M:%S.%3f "),
                record.level(),
                message
            ))
        })
        .chain(std::io::stderr())
        .apply();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_stderr_logger();

    let port = std::env::var(MCP_SERVER_PORT_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    log::info!("MCP shim forwarding to bridge on port {}", port);

    let service = BridgePassthrough::new(port).serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bridge_tool_conversion() {
        let tool = BridgeTool {
            name: "mcp__xcode-tools__XcodeRead".to_string(),
            description: "Read a file".to_string(),
            input_schema: json!({"type": "object", "properties": {"file_path": {}}}),
        };
        let tool: Tool = tool.into();
        assert_eq!(tool.name.as_ref(), "mcp__xcode-tools__XcodeRead");
        assert!(tool.input_schema.contains_key("properties"));
    }

    #[test]
    fn test_bridge_tool_conversion_with_bad_schema() {
        let tool = BridgeTool {
            name: "T".to_string(),
            description: String::new(),
            input_schema: json!("not a schema"),
        };
        let tool: Tool = tool.into();
        assert!(tool.input_schema.is_empty());
    }

    #[test]
    fn test_content_text_extraction() {
        assert_eq!(content_text(&json!({"content": "FILE"})), "FILE");
        assert_eq!(
            content_text(&json!({"content": {"lines": 3}})),
            r#"{"lines":3}"#
        );
        assert_eq!(content_text(&json!({})), "");
    }
}
