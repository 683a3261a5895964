use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::bridge::manager::Conversation;
use crate::bridge::tool_cache::ToolDefinition;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::connection_monitor::{ConnectionMonitor, MonitoredStream};
use crate::proxy::helper::prompt::format_prompt;
use crate::proxy::stream::{message_start_frame, new_message_id, StreamingTransform};
use crate::proxy::types::claude::{ClaudeMessagesRequest, ClaudeTool};
use crate::session::{build_session_config, config::SessionConfigParams};
use crate::AppContext;

/// `POST /v1/messages`: decides between opening a session and feeding tool
/// results into one that is already streaming.
pub async fn handle_messages(State(ctx): State<Arc<AppContext>>, body: Bytes) -> Response {
    let request: ClaudeMessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Rejected malformed messages request: {}", e);
            return ProxyError::InvalidRequest(format!("invalid request body: {}", e))
                .into_response();
        }
    };
    if let Err(message) = request.validate() {
        return ProxyError::InvalidRequest(message).into_response();
    }

    if let Some(conversation) = ctx.manager.find_by_continuation(&request.messages) {
        log::debug!("Continuation routed to conversation {}", conversation.id);
        continuation_response(conversation, &request)
    } else {
        new_session_response(ctx, request)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    }
}

/// Continuation path: attach a fresh reply, deliver the tool results, and
/// let the still-running transform stream the rest of the turn into it.
fn continuation_response(
    conversation: Arc<Conversation>,
    request: &ClaudeMessagesRequest,
) -> Response {
    let (reply, response) = attach_reply(&conversation, &request.model);

    // Register the waiter before resolution can wake the transform; a fast
    // terminal would otherwise notify into the void.
    let done = conversation.state.wait_for_streaming_done();

    if let Some(last) = request.messages.last() {
        for (call_id, content) in last.tool_results() {
            if conversation.state.resolve_tool_call(call_id, content.clone()) {
                log::debug!("Resolved tool call {}", call_id);
            } else {
                log::warn!(
                    "Continuation carried unknown tool call id {} for {}",
                    call_id,
                    conversation.id
                );
            }
        }
    }

    // When the transform finishes this reply, detach it if it is somehow
    // still attached (the error/cleanup paths leave that to us).
    let state = conversation.state.clone();
    tokio::spawn(async move {
        let _ = done.await;
        if state.is_current_reply(reply) {
            state.clear_reply();
        }
    });

    response
}

/// New-session path: mint a conversation, open a session for it, and pump
/// its events through the streaming transform.
async fn new_session_response(
    ctx: Arc<AppContext>,
    request: ClaudeMessagesRequest,
) -> ProxyResult<Response> {
    let model = ctx
        .catalog
        .resolve(&request.model)
        .ok_or_else(|| ProxyError::UnknownModel(request.model.clone()))?
        .clone();

    let conversation = ctx.manager.create();

    let has_tool_bridge = request.tools.as_ref().is_some_and(|t| !t.is_empty());
    if let Some(tools) = &request.tools {
        conversation
            .state
            .cache_tools(tools.iter().map(to_tool_definition).collect());
    }

    let config = build_session_config(SessionConfigParams {
        model: &model,
        system_message: request.system.clone(),
        server_config: &ctx.config,
        working_directory: ctx.working_directory.clone(),
        has_tool_bridge,
        port: ctx.port,
        conversation_id: &conversation.id,
    });

    let prompt = format_prompt(&request.messages, &ctx.exclude_patterns);
    conversation.set_sent_message_count(request.messages.len());

    let handle = match ctx.driver.open(config, prompt).await {
        Ok(handle) => handle,
        Err(e) => {
            ctx.manager.remove(&conversation.id);
            return Err(ProxyError::Session(e.to_string()));
        }
    };
    *conversation.session.lock().await = Some(handle.control.clone());

    let (reply, response) = attach_reply(&conversation, &request.model);

    let done = conversation.state.wait_for_streaming_done();
    let state = conversation.state.clone();
    tokio::spawn(async move {
        let _ = done.await;
        if state.is_current_reply(reply) {
            state.clear_reply();
        }
    });

    let transform = StreamingTransform::new(conversation.clone());
    tokio::spawn(transform.run(handle.events));

    Ok(response)
}

/// Creates the reply channel, wires the close handler, writes the SSE
/// preamble, and builds the streaming response.
fn attach_reply(conversation: &Arc<Conversation>, model: &str) -> (u64, Response) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reply = conversation.state.set_reply(tx);

    let monitor = ConnectionMonitor::new();
    let close_conversation = conversation.clone();
    monitor.on_close(move || {
        // Runs on normal completion too; only a reply that is still the
        // current one means the client went away mid-stream.
        if close_conversation.state.is_current_reply(reply)
            && close_conversation.state.is_session_active()
        {
            log::info!(
                "Client disconnected from conversation {}, cleaning up",
                close_conversation.id
            );
            close_conversation.state.cleanup();
            close_conversation.state.notify_streaming_done();
            tokio::spawn(async move {
                let control = close_conversation.session.lock().await.take();
                if let Some(control) = control {
                    control.stop().await;
                }
            });
        }
    });

    conversation
        .state
        .send_frame(message_start_frame(&new_message_id(), model));

    let stream = MonitoredStream::new(UnboundedReceiverStream::new(rx), monitor);
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            ProxyError::Internal(format!("failed to build SSE response: {}", e)).into_response()
        });

    (reply, response)
}

fn to_tool_definition(tool: &ClaudeTool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::session::{
        SessionConfig, SessionControl, SessionDriver, SessionError, SessionEvent, SessionHandle,
    };
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use serde_json::json;
    use std::sync::Mutex;

    /// One step of a scripted session: emit an event, wait for the test to
    /// let the session continue (a real session blocks on its MCP call
    /// until the bridge resolves it), or hang forever.
    enum ScriptStep {
        Emit(SessionEvent),
        Pause(tokio::sync::oneshot::Receiver<()>),
        Hang,
    }

    /// Driver that hands out scripted event streams and records the
    /// configs it was opened with.
    struct ScriptedDriver {
        scripts: Mutex<Vec<Vec<ScriptStep>>>,
        opened: Mutex<Vec<SessionConfig>>,
    }

    impl ScriptedDriver {
        fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                opened: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SessionDriver for ScriptedDriver {
        async fn open(
            &self,
            config: SessionConfig,
            _prompt: String,
        ) -> Result<SessionHandle, SessionError> {
            self.opened.lock().unwrap().push(config);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| SessionError::Start("script exhausted".to_string()))?;
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for step in script {
                    match step {
                        ScriptStep::Emit(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        ScriptStep::Pause(resume) => {
                            if resume.await.is_err() {
                                break;
                            }
                        }
                        ScriptStep::Hang => std::future::pending::<()>().await,
                    }
                }
            });
            Ok(SessionHandle {
                events: rx,
                control: SessionControl::noop(),
            })
        }
    }

    fn ctx_with(driver: ScriptedDriver) -> (Arc<AppContext>, Arc<ScriptedDriver>) {
        let driver = Arc::new(driver);
        let ctx = Arc::new(
            AppContext::new(ProxyConfig::default(), driver.clone(), 50505).unwrap(),
        );
        (ctx, driver)
    }

    fn plain_turn() -> Vec<ScriptStep> {
        vec![
            ScriptStep::Emit(SessionEvent::Text {
                delta: "Hello there".to_string(),
            }),
            ScriptStep::Emit(SessionEvent::Idle {
                stop_reason: Some("end_turn".to_string()),
                usage: None,
            }),
        ]
    }

    fn hello_request() -> Bytes {
        Bytes::from(
            json!({
                "model": "claude-sonnet-4.5",
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": "Hello"}]
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn test_new_session_streams_message_start_first() {
        let (ctx, _) = ctx_with(ScriptedDriver::new(vec![plain_turn()]));
        let response = handle_messages(State(ctx.clone()), hello_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("event: message_start\n"));
        assert!(text.contains("text_delta"));
        assert!(text.contains("message_stop"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_request() {
        let (ctx, _) = ctx_with(ScriptedDriver::new(vec![]));
        let response = handle_messages(State(ctx), Bytes::from_static(b"not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected_without_conversation() {
        let (ctx, _) = ctx_with(ScriptedDriver::new(vec![plain_turn()]));
        let request = Bytes::from(
            json!({
                "model": "made-up-model",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "Hello"}]
            })
            .to_string(),
        );
        let response = handle_messages(State(ctx.clone()), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(ctx.manager.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_opens_create_two_conversations() {
        // Both sessions stay open so both conversations stay registered.
        let (ctx, _) = ctx_with(ScriptedDriver::new(vec![
            vec![ScriptStep::Hang],
            vec![ScriptStep::Hang],
        ]));

        let (a, b) = tokio::join!(
            handle_messages(State(ctx.clone()), hello_request()),
            handle_messages(State(ctx.clone()), hello_request()),
        );
        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        // Never collapsed into one conversation.
        assert_eq!(ctx.manager.len(), 2);
    }

    #[tokio::test]
    async fn test_session_open_failure_removes_conversation() {
        let (ctx, _) = ctx_with(ScriptedDriver::new(vec![]));
        let response = handle_messages(State(ctx.clone()), hello_request()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(ctx.manager.is_empty());
    }

    #[tokio::test]
    async fn test_tools_enable_the_bridge() {
        let (ctx, driver) = ctx_with(ScriptedDriver::new(vec![vec![ScriptStep::Hang]]));
        let request = Bytes::from(
            json!({
                "model": "claude-sonnet-4.5",
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": "Hello"}],
                "tools": [{
                    "name": "mcp__xcode-tools__XcodeRead",
                    "description": "Read",
                    "input_schema": {"type": "object", "properties": {}}
                }]
            })
            .to_string(),
        );
        let response = handle_messages(State(ctx.clone()), request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let conversation = ctx.manager.all().into_iter().next().unwrap();
        assert_eq!(conversation.state.tools().len(), 1);
        assert_eq!(conversation.sent_message_count(), 1);

        // The session config grew the synthetic bridge server.
        let opened = driver.opened.lock().unwrap();
        let config = &opened[0];
        let bridge = config
            .mcp_servers
            .get(crate::constants::BRIDGE_SERVER_NAME)
            .unwrap();
        match bridge {
            crate::session::config::SessionMcpServer::Http { url, .. } => {
                assert_eq!(
                    url,
                    &format!("http://127.0.0.1:50505/mcp/{}", conversation.id)
                );
            }
            other => panic!("expected http bridge server, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_tool_round_trip() {
        // Turn 1: the model asks for a tool, then the session blocks on
        // its MCP call. Turn 2 runs once the bridge resolves it.
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel();
        let script = vec![
            ScriptStep::Emit(SessionEvent::ToolUse {
                id: "tc1".to_string(),
                name: "mcp__xcode-tools__XcodeRead".to_string(),
                input: json!({"file_path": "main.swift"}),
            }),
            ScriptStep::Emit(SessionEvent::Idle {
                stop_reason: Some("tool_use".to_string()),
                usage: None,
            }),
            ScriptStep::Pause(resume_rx),
            ScriptStep::Emit(SessionEvent::Text {
                delta: "It prints hello".to_string(),
            }),
            ScriptStep::Emit(SessionEvent::Idle {
                stop_reason: Some("end_turn".to_string()),
                usage: None,
            }),
        ];
        let (ctx, _) = ctx_with(ScriptedDriver::new(vec![script]));

        let request = Bytes::from(
            json!({
                "model": "claude-sonnet-4.5",
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": "What does main.swift do?"}],
                "tools": [{
                    "name": "mcp__xcode-tools__XcodeRead",
                    "input_schema": {"type": "object", "properties": {"file_path": {}}}
                }]
            })
            .to_string(),
        );

        let first = handle_messages(State(ctx.clone()), request).await;
        let first_body = to_bytes(first.into_body(), 1024 * 1024).await.unwrap();
        let first_text = String::from_utf8(first_body.to_vec()).unwrap();
        assert!(first_text.contains("tool_use"));
        assert!(first_text.contains("\"stop_reason\":\"tool_use\""));

        // The session (via the shim) parks its MCP call meanwhile.
        let conversation = ctx.manager.all().into_iter().next().unwrap();
        let parked = conversation
            .state
            .register_mcp_request("mcp__xcode-tools__XcodeRead")
            .unwrap();

        // Xcode sends the continuation with the tool result.
        let continuation = Bytes::from(
            json!({
                "model": "claude-sonnet-4.5",
                "max_tokens": 1024,
                "messages": [
                    {"role": "user", "content": "What does main.swift do?"},
                    {"role": "assistant", "content": [
                        {"type": "tool_use", "id": "tc1",
                         "name": "mcp__xcode-tools__XcodeRead",
                         "input": {"file_path": "main.swift"}}
                    ]},
                    {"role": "user", "content": [
                        {"type": "tool_result", "tool_use_id": "tc1", "content": "print(\"hello\")"}
                    ]}
                ]
            })
            .to_string(),
        );

        let second = handle_messages(State(ctx.clone()), continuation).await;
        assert_eq!(second.status(), StatusCode::OK);

        // The parked bridge call received Xcode's result.
        let reply = parked.await.unwrap().unwrap();
        assert_eq!(reply, json!("print(\"hello\")"));

        // No new conversation was created for the continuation.
        assert!(ctx.manager.len() <= 1);

        // The session got its tool result and finishes the turn.
        resume_tx.send(()).unwrap();

        let second_body = to_bytes(second.into_body(), 1024 * 1024).await.unwrap();
        let second_text = String::from_utf8(second_body.to_vec()).unwrap();
        assert!(second_text.starts_with("event: message_start\n"));
        assert!(second_text.contains("It prints hello"));
        assert!(second_text.contains("\"stop_reason\":\"end_turn\""));
    }
}
