use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::bridge::tool_cache::{ToolCache, ToolDefinition};
use crate::constants::TOOL_CALL_TIMEOUT;

/// Ways a parked tool call can fail instead of resolving.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The shim invoked a tool the streaming transform never announced.
    #[error("No expected tool call for {0}")]
    NoExpectedToolCall(String),
    /// Xcode never delivered a result for the call.
    #[error("Tool call {0} timed out")]
    ToolCallTimeout(String),
    /// The session reached its terminal state with the call still parked.
    #[error("Session ended")]
    SessionEnded,
    /// Hard teardown: client disconnect or manager removal.
    #[error("Session cleanup")]
    SessionCleanup,
}

/// What a parked bridge request eventually receives.
pub type ToolCallReply = Result<Value, BridgeError>;

struct PendingToolCall {
    respond: oneshot::Sender<ToolCallReply>,
    timeout: AbortHandle,
}

type SessionEndCallback = Box<dyn FnOnce() + Send>;

/// The reply currently attached to the conversation, tagged with a
/// generation number so stale close-handlers can tell they lost the race.
struct ReplySlot {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct StateInner {
    tool_cache: ToolCache,
    expected_by_name: HashMap<String, VecDeque<String>>,
    pending_by_call_id: HashMap<String, PendingToolCall>,
    reply: Option<ReplySlot>,
    reply_seq: u64,
    streaming_done: Option<oneshot::Sender<()>>,
    session_end: Option<SessionEndCallback>,
    session_active: bool,
    had_error: bool,
}

/// Per-conversation tool-bridge state.
///
/// Three interlocking maps plus flags, guarded by one mutex. Operations
/// that can suspend (awaiting a parked call, the 5-minute timer) happen
/// outside the lock; the lock only covers map surgery.
///
/// Invariants:
/// - an id lives in `expected_by_name` *or* `pending_by_call_id`, never both;
/// - every pending entry is answered exactly once, and its timer is aborted
///   on both the resolve and the reject path;
/// - once the session is inactive both maps are empty.
pub struct ConversationState {
    /// Self-reference handed to timer tasks; a fired timer must not keep a
    /// torn-down conversation alive.
    weak: Weak<ConversationState>,
    inner: Mutex<StateInner>,
}

impl ConversationState {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            inner: Mutex::new(StateInner::default()),
        })
    }

    // ------------------------------------------------------------------
    // Tool cache
    // ------------------------------------------------------------------

    /// Replaces the cached tool catalog wholesale.
    pub fn cache_tools(&self, tools: Vec<ToolDefinition>) {
        self.lock().tool_cache.cache(tools);
    }

    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.lock().tool_cache.get().to_vec()
    }

    pub fn resolve_tool_name(&self, name: &str) -> String {
        self.lock().tool_cache.resolve_name(name).to_string()
    }

    pub fn normalize_tool_args(&self, tool_name: &str, args: Value) -> Value {
        self.lock().tool_cache.normalize_args(tool_name, args)
    }

    // ------------------------------------------------------------------
    // Expected / pending tool calls
    // ------------------------------------------------------------------

    /// Appends `call_id` to the expected queue for `tool_name`. Called by
    /// the streaming transform before the matching `tool_use` block is
    /// emitted to Xcode.
    pub fn register_expected(&self, call_id: &str, tool_name: &str) {
        let mut inner = self.lock();
        inner
            .expected_by_name
            .entry(tool_name.to_string())
            .or_default()
            .push_back(call_id.to_string());
    }

    /// Promotes the head of `name`'s expected queue into a pending call.
    ///
    /// Returns the receiver the bridge endpoint parks on. The call either
    /// resolves with Xcode's tool result or rejects on timeout / session
    /// teardown. Queue order is strict FIFO per tool name.
    pub fn register_mcp_request(
        &self,
        name: &str,
    ) -> Result<oneshot::Receiver<ToolCallReply>, BridgeError> {
        let mut inner = self.lock();

        let call_id = inner
            .expected_by_name
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| BridgeError::NoExpectedToolCall(name.to_string()))?;

        let (tx, rx) = oneshot::channel();

        let state = self.weak.clone();
        let timer_id = call_id.clone();
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(TOOL_CALL_TIMEOUT).await;
            if let Some(state) = state.upgrade() {
                state.expire_tool_call(&timer_id);
            }
        })
        .abort_handle();

        log::debug!("Parking tool call {} ({})", call_id, name);
        inner.pending_by_call_id.insert(
            call_id,
            PendingToolCall {
                respond: tx,
                timeout,
            },
        );
        Ok(rx)
    }

    /// Delivers Xcode's result for `call_id`. Returns false when the id is
    /// unknown (already resolved, timed out, or never parked).
    pub fn resolve_tool_call(&self, call_id: &str, result: Value) -> bool {
        let Some(pending) = self.lock().pending_by_call_id.remove(call_id) else {
            return false;
        };
        pending.timeout.abort();
        let _ = pending.respond.send(Ok(result));
        true
    }

    /// Timer path: rejects and evicts a call Xcode never answered.
    fn expire_tool_call(&self, call_id: &str) {
        let Some(pending) = self.lock().pending_by_call_id.remove(call_id) else {
            return;
        };
        log::warn!("Tool call {} timed out after {:?}", call_id, TOOL_CALL_TIMEOUT);
        let _ = pending
            .respond
            .send(Err(BridgeError::ToolCallTimeout(call_id.to_string())));
    }

    /// True while any tool call is announced or parked.
    pub fn has_pending(&self) -> bool {
        let inner = self.lock();
        !inner.pending_by_call_id.is_empty()
            || inner.expected_by_name.values().any(|q| !q.is_empty())
    }

    pub fn has_expected_tool(&self, name: &str) -> bool {
        self.lock()
            .expected_by_name
            .get(name)
            .is_some_and(|q| !q.is_empty())
    }

    /// True when `call_id` is known to this conversation, either still
    /// expected or already parked. Continuation routing matches on this.
    pub fn contains_tool_call(&self, call_id: &str) -> bool {
        let inner = self.lock();
        inner.pending_by_call_id.contains_key(call_id)
            || inner
                .expected_by_name
                .values()
                .any(|q| q.iter().any(|id| id == call_id))
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub fn mark_session_active(&self) {
        self.lock().session_active = true;
    }

    pub fn is_session_active(&self) -> bool {
        self.lock().session_active
    }

    /// Terminal transition: the session stopped accepting events. Any
    /// leftover expected or pending calls are stale and are rejected.
    pub fn mark_session_inactive(&self) {
        self.fail_outstanding(BridgeError::SessionEnded);
    }

    /// Hard teardown (client disconnect, manager removal). Same drain as
    /// inactivation with a distinct rejection cause.
    pub fn cleanup(&self) {
        self.fail_outstanding(BridgeError::SessionCleanup);
    }

    fn fail_outstanding(&self, cause: BridgeError) {
        let (drained, callback) = {
            let mut inner = self.lock();
            inner.session_active = false;
            inner.expected_by_name.clear();
            let drained: Vec<PendingToolCall> =
                inner.pending_by_call_id.drain().map(|(_, p)| p).collect();
            (drained, inner.session_end.take())
        };

        // Rejections and the session-end notification run outside the lock.
        for pending in drained {
            pending.timeout.abort();
            let _ = pending.respond.send(Err(cause.clone()));
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Installs the single-shot notifier the manager uses for auto-removal.
    pub fn set_session_end_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.lock().session_end = Some(Box::new(callback));
    }

    pub fn set_had_error(&self) {
        self.lock().had_error = true;
    }

    pub fn had_error(&self) -> bool {
        self.lock().had_error
    }

    // ------------------------------------------------------------------
    // Reply attachment
    // ------------------------------------------------------------------

    /// Attaches the HTTP reply channel SSE frames are written to, replacing
    /// any previous one. Returns a generation id for `is_current_reply`.
    pub fn set_reply(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let mut inner = self.lock();
        inner.reply_seq += 1;
        let id = inner.reply_seq;
        inner.reply = Some(ReplySlot { id, tx });
        id
    }

    pub fn clear_reply(&self) {
        self.lock().reply = None;
    }

    pub fn is_current_reply(&self, id: u64) -> bool {
        self.lock().reply.as_ref().is_some_and(|r| r.id == id)
    }

    /// Writes one rendered SSE frame to the attached reply. Returns false
    /// when no reply is attached or the client went away (the dead channel
    /// is detached so later frames don't keep hitting it).
    pub fn send_frame(&self, frame: String) -> bool {
        let mut inner = self.lock();
        let delivered = match &inner.reply {
            Some(slot) => slot.tx.send(frame).is_ok(),
            None => return false,
        };
        if !delivered {
            inner.reply = None;
        }
        delivered
    }

    // ------------------------------------------------------------------
    // Streaming-done rendezvous
    // ------------------------------------------------------------------

    /// Registers a waiter for the next end-of-reply notification. A new
    /// waiter replaces (and thereby wakes) a previous one.
    pub fn wait_for_streaming_done(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().streaming_done = Some(tx);
        rx
    }

    /// Wakes the current waiter, if any. Without a waiter this is a no-op.
    pub fn notify_streaming_done(&self) {
        if let Some(tx) = self.lock().streaming_done.take() {
            let _ = tx.send(());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
