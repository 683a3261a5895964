use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::bridge::manager::Conversation;
use crate::AppContext;

/// Bridge endpoints. Conversation-scoped paths carry the id the session
/// config embedded in the bridge URL; the `/internal` pair serves
/// single-conversation deployments where the caller has no id.
pub fn routes(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/mcp/{conversation_id}/tools", get(conversation_tools))
        .route("/mcp/{conversation_id}/tool-call", post(conversation_tool_call))
        .route("/internal/tools", get(global_tools))
        .route("/internal/tool-call", post(global_tool_call))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

async fn conversation_tools(
    State(ctx): State<Arc<AppContext>>,
    Path(conversation_id): Path<String>,
) -> Response {
    match ctx.manager.get(&conversation_id) {
        Some(conversation) => Json(render_tools(&conversation)).into_response(),
        None => unknown_conversation(&conversation_id),
    }
}

async fn global_tools(State(ctx): State<Arc<AppContext>>) -> Response {
    let tools = ctx
        .manager
        .latest_active()
        .map(|conversation| render_tools(&conversation))
        .unwrap_or_else(|| json!([]));
    Json(tools).into_response()
}

async fn conversation_tool_call(
    State(ctx): State<Arc<AppContext>>,
    Path(conversation_id): Path<String>,
    Json(request): Json<ToolCallRequest>,
) -> Response {
    match ctx.manager.get(&conversation_id) {
        Some(conversation) => park_tool_call(conversation, request).await,
        None => unknown_conversation(&conversation_id),
    }
}

async fn global_tool_call(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<ToolCallRequest>,
) -> Response {
    // No id in the path: route by the expected-call queues, falling back
    // to name resolution against the live conversation's catalog.
    let conversation = ctx.manager.find_by_expected_tool(&request.name).or_else(|| {
        ctx.manager.latest_active().filter(|c| {
            let resolved = c.state.resolve_tool_name(&request.name);
            c.state.has_expected_tool(&resolved)
        })
    });

    match conversation {
        Some(conversation) => park_tool_call(conversation, request).await,
        None => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("No expected tool call for {}", request.name),
        ),
    }
}

/// Parks the shim's HTTP call until Xcode resolves it, the 5-minute timer
/// fires, or the session tears down.
async fn park_tool_call(conversation: Arc<Conversation>, request: ToolCallRequest) -> Response {
    let resolved = conversation.state.resolve_tool_name(&request.name);
    log::debug!(
        "Bridge tool call `{}` -> `{}` on {}",
        request.name,
        resolved,
        conversation.id
    );

    let parked = match conversation.state.register_mcp_request(&resolved) {
        Ok(parked) => parked,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    // Await outside the state lock.
    match parked.await {
        Ok(Ok(content)) => Json(json!({ "content": content })).into_response(),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "tool call dropped without resolution".to_string(),
        ),
    }
}

/// The cached catalog in the shim's wire shape (`inputSchema`, not
/// `input_schema`).
fn render_tools(conversation: &Conversation) -> Value {
    let tools: Vec<Value> = conversation
        .state
        .tools()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description.unwrap_or_default(),
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    Value::Array(tools)
}

fn unknown_conversation(conversation_id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("unknown conversation {}", conversation_id),
    )
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
