//! The streaming transform: consumes session events, emits Anthropic SSE
//! frames into the conversation's attached reply, and keeps the
//! tool-bridge state in lockstep with what Xcode has seen.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bridge::manager::Conversation;
use crate::proxy::helper::sse::Event;
use crate::session::{SessionEvent, SessionUsage};

pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Renders the `message_start` frame that opens every SSE reply.
pub fn message_start_frame(message_id: &str, model: &str) -> String {
    Event::default()
        .event("message_start")
        .data(
            json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            })
            .to_string(),
        )
        .to_string()
}

/// Per-turn state machine: `Idle → Streaming { blocks } → (Tool → …)* →
/// Done | Errored`, spread across as many HTTP replies as the model needs
/// tool rounds.
pub struct StreamingTransform {
    conversation: Arc<Conversation>,
    next_index: usize,
    open_text_index: Option<usize>,
}

impl StreamingTransform {
    pub fn new(conversation: Arc<Conversation>) -> Self {
        Self {
            conversation,
            next_index: 0,
            open_text_index: None,
        }
    }

    /// Drives the session's event stream to completion. Returns when the
    /// session reaches a terminal state or the conversation is torn down
    /// under us.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        self.conversation.state.mark_session_active();

        while let Some(event) = events.recv().await {
            if !self.conversation.state.is_session_active() {
                // cleanup() ran concurrently; the session is already being
                // stopped and nobody is listening for frames.
                return;
            }
            match event {
                SessionEvent::Text { delta } => self.on_text(&delta),
                SessionEvent::ToolUse { id, name, input } => self.on_tool_use(&id, &name, input),
                SessionEvent::Idle { stop_reason, usage } => {
                    if self.on_idle(stop_reason, usage) {
                        return;
                    }
                }
                SessionEvent::Error { message } => {
                    self.on_error(&message);
                    return;
                }
            }
        }

        // The event stream closed without a terminal event.
        if self.conversation.state.is_session_active() {
            self.on_error("session closed unexpectedly");
        }
    }

    fn emit(&self, event: Event) {
        self.conversation.state.send_frame(event.to_string());
    }

    fn alloc_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn on_text(&mut self, delta: &str) {
        if self.open_text_index.is_none() {
            let index = self.alloc_index();
            self.open_text_index = Some(index);
            self.emit(
                Event::default().event("content_block_start").data(
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "text", "text": ""}
                    })
                    .to_string(),
                ),
            );
        }
        let index = self.open_text_index.unwrap_or(0);
        self.emit(
            Event::default().event("content_block_delta").data(
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "text_delta", "text": delta}
                })
                .to_string(),
            ),
        );
    }

    fn close_text_block(&mut self) {
        if let Some(index) = self.open_text_index.take() {
            self.emit(
                Event::default().event("content_block_stop").data(
                    json!({"type": "content_block_stop", "index": index}).to_string(),
                ),
            );
        }
    }

    fn on_tool_use(&mut self, id: &str, name: &str, input: serde_json::Value) {
        self.close_text_block();

        let index = self.alloc_index();
        let state = &self.conversation.state;
        let resolved = state.resolve_tool_name(name);
        let input = state.normalize_tool_args(&resolved, input);

        // The expected-queue entry must exist before the block reaches
        // Xcode, or the continuation carrying its result could race an
        // unregistered id.
        state.register_expected(id, &resolved);

        self.emit(
            Event::default().event("content_block_start").data(
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "tool_use", "id": id, "name": resolved, "input": {}}
                })
                .to_string(),
            ),
        );
        self.emit(
            Event::default().event("content_block_delta").data(
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "input_json_delta", "partial_json": input.to_string()}
                })
                .to_string(),
            ),
        );
        self.emit(
            Event::default()
                .event("content_block_stop")
                .data(json!({"type": "content_block_stop", "index": index}).to_string()),
        );
    }

    /// Ends the current reply. Returns true when the session is done for
    /// good; false when the turn merely paused for tool results.
    fn on_idle(&mut self, stop_reason: Option<String>, usage: Option<SessionUsage>) -> bool {
        self.close_text_block();

        let state = &self.conversation.state;
        let paused = state.has_pending();
        let stop_reason = if paused {
            "tool_use".to_string()
        } else {
            stop_reason.unwrap_or_else(|| "end_turn".to_string())
        };

        self.emit(
            Event::default().event("message_delta").data(
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                    "usage": {"output_tokens": usage.map(|u| u.output_tokens).unwrap_or(0)}
                })
                .to_string(),
            ),
        );
        self.emit(Event::default().event("message_stop"));
        state.clear_reply();

        // Next reply (if any) numbers its blocks from zero again.
        self.next_index = 0;

        if paused {
            log::debug!(
                "Conversation {} paused for tool results",
                self.conversation.id
            );
            state.notify_streaming_done();
            false
        } else {
            log::debug!("Conversation {} finished streaming", self.conversation.id);
            state.mark_session_inactive();
            state.notify_streaming_done();
            true
        }
    }

    fn on_error(&mut self, message: &str) {
        log::error!(
            "Session error on conversation {}: {}",
            self.conversation.id,
            message
        );
        let state = &self.conversation.state;
        state.set_had_error();
        self.emit(
            Event::default().event("error").data(
                json!({
                    "type": "error",
                    "error": {"type": "api_error", "message": message}
                })
                .to_string(),
            ),
        );
        state.clear_reply();
        state.mark_session_inactive();
        state.notify_streaming_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::manager::ConversationManager;
    use crate::bridge::tool_cache::ToolDefinition;
    use serde_json::Value;

    async fn collect_frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Some(data) = frame
                .lines()
                .find(|l| l.starts_with("data: "))
                .map(|l| &l["data: ".len()..])
            {
                frames.push(serde_json::from_str(data).unwrap());
            } else {
                // Frames without data (message_stop) keep their event name.
                let event = frame
                    .lines()
                    .find(|l| l.starts_with("event: "))
                    .map(|l| &l["event: ".len()..])
                    .unwrap_or("");
                frames.push(json!({"type": event}));
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_text_turn_ends_with_end_turn() {
        let manager = ConversationManager::new();
        let conversation = manager.create();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        conversation.state.set_reply(reply_tx);

        let (tx, rx) = mpsc::channel(8);
        tx.send(SessionEvent::Text {
            delta: "Hello".to_string(),
        })
        .await
        .unwrap();
        tx.send(SessionEvent::Idle {
            stop_reason: Some("end_turn".to_string()),
            usage: Some(SessionUsage {
                input_tokens: 5,
                output_tokens: 2,
            }),
        })
        .await
        .unwrap();
        drop(tx);

        StreamingTransform::new(conversation.clone())
            .run(rx)
            .await;

        let frames = collect_frames(&mut reply_rx).await;
        let types: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec![
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(frames[1]["delta"]["text"], "Hello");
        assert_eq!(frames[3]["delta"]["stop_reason"], "end_turn");
        assert_eq!(frames[3]["usage"]["output_tokens"], 2);

        assert!(!conversation.state.is_session_active());
        // Terminal transition unregistered the conversation.
        assert!(manager.get(&conversation.id).is_none());
    }

    #[tokio::test]
    async fn test_tool_use_pauses_and_registers_expected() {
        let manager = ConversationManager::new();
        let conversation = manager.create();
        conversation.state.cache_tools(vec![ToolDefinition {
            name: "mcp__xcode-tools__XcodeRead".to_string(),
            description: None,
            input_schema: json!({
                "type": "object",
                "properties": {"file_path": {"type": "string"}}
            }),
        }]);

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        conversation.state.set_reply(reply_tx);

        let (tx, rx) = mpsc::channel(8);
        tx.send(SessionEvent::Text {
            delta: "Let me read that".to_string(),
        })
        .await
        .unwrap();
        // Session announces a shortened name with camelCase args.
        tx.send(SessionEvent::ToolUse {
            id: "tc1".to_string(),
            name: "XcodeRead".to_string(),
            input: json!({"filePath": "main.swift"}),
        })
        .await
        .unwrap();
        tx.send(SessionEvent::Idle {
            stop_reason: Some("tool_use".to_string()),
            usage: None,
        })
        .await
        .unwrap();

        let transform = StreamingTransform::new(conversation.clone());
        // Register the waiter before the transform can pause.
        let done = conversation.state.wait_for_streaming_done();
        let task = tokio::spawn(transform.run(rx));

        // Wait for the pause: the reply detaches when message_stop goes out.
        done.await.unwrap();

        let frames = collect_frames(&mut reply_rx).await;
        let tool_start = frames
            .iter()
            .find(|f| f["type"] == "content_block_start" && f["content_block"]["type"] == "tool_use")
            .unwrap();
        assert_eq!(tool_start["content_block"]["id"], "tc1");
        assert_eq!(
            tool_start["content_block"]["name"],
            "mcp__xcode-tools__XcodeRead"
        );

        let input_delta = frames
            .iter()
            .find(|f| f["type"] == "content_block_delta"
                && f["delta"]["type"] == "input_json_delta")
            .unwrap();
        let partial: Value =
            serde_json::from_str(input_delta["delta"]["partial_json"].as_str().unwrap()).unwrap();
        assert_eq!(partial, json!({"file_path": "main.swift"}));

        let message_delta = frames.iter().find(|f| f["type"] == "message_delta").unwrap();
        assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");

        // Session stays live, call registered under the resolved name.
        assert!(conversation.state.is_session_active());
        assert!(conversation
            .state
            .has_expected_tool("mcp__xcode-tools__XcodeRead"));
        assert!(conversation.state.contains_tool_call("tc1"));

        // Second round: continuation attaches a fresh reply, session ends.
        let (reply_tx2, mut reply_rx2) = mpsc::unbounded_channel();
        conversation.state.set_reply(reply_tx2);
        let _ = conversation.state.register_mcp_request("mcp__xcode-tools__XcodeRead");
        conversation.state.resolve_tool_call("tc1", json!("FILE"));

        tx.send(SessionEvent::Text {
            delta: "Done".to_string(),
        })
        .await
        .unwrap();
        tx.send(SessionEvent::Idle {
            stop_reason: Some("end_turn".to_string()),
            usage: None,
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let frames = collect_frames(&mut reply_rx2).await;
        // Indices restart at zero on the new reply.
        assert_eq!(frames[0]["type"], "content_block_start");
        assert_eq!(frames[0]["index"], 0);
        let message_delta = frames.iter().find(|f| f["type"] == "message_delta").unwrap();
        assert_eq!(message_delta["delta"]["stop_reason"], "end_turn");
        assert!(!conversation.state.is_session_active());
    }

    #[tokio::test]
    async fn test_error_emits_anthropic_error_frame() {
        let manager = ConversationManager::new();
        let conversation = manager.create();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        conversation.state.set_reply(reply_tx);

        let (tx, rx) = mpsc::channel(8);
        tx.send(SessionEvent::Error {
            message: "upstream blew up".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        StreamingTransform::new(conversation.clone())
            .run(rx)
            .await;

        let frames = collect_frames(&mut reply_rx).await;
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["error"]["message"], "upstream blew up");
        assert!(conversation.state.had_error());
        assert!(!conversation.state.is_session_active());
    }

    #[tokio::test]
    async fn test_channel_close_without_terminal_is_an_error() {
        let manager = ConversationManager::new();
        let conversation = manager.create();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        conversation.state.set_reply(reply_tx);

        let (tx, rx) = mpsc::channel::<SessionEvent>(1);
        drop(tx);

        StreamingTransform::new(conversation.clone())
            .run(rx)
            .await;

        let frames = collect_frames(&mut reply_rx).await;
        assert_eq!(frames[0]["type"], "error");
        assert!(conversation.state.had_error());
    }
}
