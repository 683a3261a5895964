//! Interface to the session library that actually talks to Copilot.
//!
//! The proxy core only depends on the seam defined here: a driver opens a
//! session from a [`SessionConfig`] and a prompt, the session emits
//! [`SessionEvent`]s until it goes idle, and a [`SessionControl`] can stop
//! it. The concrete binding in this repo drives the Copilot CLI as a child
//! process (see [`cli`]).

pub mod cli;
pub mod config;
pub mod models;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use config::{build_session_config, HookDecision, PermissionPolicy, SessionConfig, ToolGate};
pub use models::{ModelCatalog, ModelInfo};

use crate::constants::SESSION_STOP_TIMEOUT;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start session: {0}")]
    Start(String),
    #[error("invalid session configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// What a streaming session emits.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A chunk of assistant text.
    Text { delta: String },
    /// The model requested a tool call. Announced before the session
    /// invokes the tool through its MCP servers.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// The session finished an assistant turn. With tool calls still
    /// outstanding this is a pause; otherwise the session is done.
    Idle {
        stop_reason: Option<String>,
        usage: Option<SessionUsage>,
    },
    /// The session failed; no further events follow.
    Error { message: String },
}

/// A live session: its event stream plus a control handle.
pub struct SessionHandle {
    pub events: mpsc::Receiver<SessionEvent>,
    pub control: SessionControl,
}

/// Driver-specific teardown.
#[async_trait]
pub trait SessionStopper: Send + Sync {
    async fn stop(&self);
}

/// Clonable stop handle. `stop` is best-effort and hard-capped so shutdown
/// never hangs on a wedged session.
#[derive(Clone)]
pub struct SessionControl {
    stopper: Arc<dyn SessionStopper>,
}

impl SessionControl {
    pub fn new(stopper: impl SessionStopper + 'static) -> Self {
        Self {
            stopper: Arc::new(stopper),
        }
    }

    /// A control that has nothing to stop.
    pub fn noop() -> Self {
        struct Noop;
        #[async_trait]
        impl SessionStopper for Noop {
            async fn stop(&self) {}
        }
        Self::new(Noop)
    }

    pub async fn stop(&self) {
        if tokio::time::timeout(SESSION_STOP_TIMEOUT, self.stopper.stop())
            .await
            .is_err()
        {
            log::warn!(
                "Session stop exceeded {:?}, abandoning teardown",
                SESSION_STOP_TIMEOUT
            );
        }
    }
}

/// Opens sessions. The proxy holds exactly one driver, injected at startup.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn open(
        &self,
        config: SessionConfig,
        prompt: String,
    ) -> Result<SessionHandle, SessionError>;
}
