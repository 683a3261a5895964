use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::bridge::conversation::ConversationState;
use crate::proxy::types::claude::{ClaudeMessage, MessageContent};
use crate::session::SessionControl;

/// One conversation: a new-session request plus every continuation that
/// delivers tool results for it, until the session terminates.
pub struct Conversation {
    pub id: String,
    pub state: Arc<ConversationState>,
    /// Control handle of the live session, once one is opened.
    pub session: AsyncMutex<Option<SessionControl>>,
    /// How many incoming messages have already been shipped to the session.
    pub sent_message_count: AtomicUsize,
    /// Creation order; the continuation scan is deterministic because of it.
    seq: u64,
}

impl Conversation {
    pub fn set_sent_message_count(&self, count: usize) {
        self.sent_message_count.store(count, Ordering::Relaxed);
    }

    pub fn sent_message_count(&self) -> usize {
        self.sent_message_count.load(Ordering::Relaxed)
    }
}

/// Process-wide registry of live conversations.
///
/// A conversation is registered exactly as long as its session-end callback
/// has not fired: `create` installs a callback that unregisters the id, and
/// both the terminal session transition and hard cleanup fire it.
pub struct ConversationManager {
    conversations: Mutex<HashMap<String, Arc<Conversation>>>,
    next_seq: AtomicU64,
}

impl ConversationManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            conversations: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Mints a conversation with a fresh id and empty state and registers
    /// it for continuation lookup.
    pub fn create(self: &Arc<Self>) -> Arc<Conversation> {
        let id = format!("conv_{}", Uuid::new_v4().simple());
        let state = ConversationState::new();

        let manager = Arc::downgrade(self);
        let callback_id = id.clone();
        state.set_session_end_callback(move || {
            if let Some(manager) = manager.upgrade() {
                manager.unregister(&callback_id);
            }
        });

        let conversation = Arc::new(Conversation {
            id: id.clone(),
            state,
            session: AsyncMutex::new(None),
            sent_message_count: AtomicUsize::new(0),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        });

        self.lock().insert(id.clone(), conversation.clone());
        log::debug!("Created conversation {}", id);
        conversation
    }

    pub fn get(&self, id: &str) -> Option<Arc<Conversation>> {
        self.lock().get(id).cloned()
    }

    /// Hard removal: unregisters the conversation and tears its state down
    /// (outstanding tool calls reject with "Session cleanup").
    pub fn remove(&self, id: &str) -> Option<Arc<Conversation>> {
        let conversation = self.lock().remove(id);
        if let Some(ref conversation) = conversation {
            log::debug!("Removing conversation {}", id);
            conversation.state.cleanup();
        }
        conversation
    }

    /// Drops the registry entry without touching state. Session-end
    /// callbacks land here, after the state already drained itself.
    fn unregister(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            log::debug!("Conversation {} ended, unregistered", id);
        }
    }

    /// Decides whether `messages` continues an existing conversation.
    ///
    /// A continuation is a user message carrying `tool_result` blocks whose
    /// `tool_use_id`s match calls a conversation is tracking. When no id
    /// matches but some session is still live, that conversation is assumed
    /// to have retried internally with fresh ids.
    pub fn find_by_continuation(&self, messages: &[ClaudeMessage]) -> Option<Arc<Conversation>> {
        let last = messages.last()?;
        if last.role != "user" {
            return None;
        }
        if matches!(last.content, MessageContent::Text(_)) {
            return None;
        }

        let conversations = self.in_creation_order();

        for (id, _) in last.tool_results() {
            for conversation in &conversations {
                if conversation.state.contains_tool_call(id) {
                    return Some(conversation.clone());
                }
            }
        }

        conversations
            .into_iter()
            .find(|c| c.state.is_session_active())
    }

    /// First conversation (in creation order) expecting a call for `name`.
    /// The global bridge endpoints use this when the path carries no
    /// conversation id.
    pub fn find_by_expected_tool(&self, name: &str) -> Option<Arc<Conversation>> {
        self.in_creation_order()
            .into_iter()
            .find(|c| c.state.has_expected_tool(name))
    }

    /// Most recently created conversation with a live session; the global
    /// tools endpoint serves its catalog.
    pub fn latest_active(&self) -> Option<Arc<Conversation>> {
        self.in_creation_order()
            .into_iter()
            .rev()
            .find(|c| c.state.is_session_active())
    }

    /// Every registered conversation, for shutdown teardown.
    pub fn all(&self) -> Vec<Arc<Conversation>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn in_creation_order(&self) -> Vec<Arc<Conversation>> {
        let mut conversations: Vec<Arc<Conversation>> = self.lock().values().cloned().collect();
        conversations.sort_by_key(|c| c.seq);
        conversations
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Conversation>>> {
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
