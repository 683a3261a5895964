//! Session driver that spawns the Copilot CLI as a child process and
//! parses its `--output-format stream-json` event stream.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::config::ProxyConfig;
use crate::constants::DEFAULT_CLI_COMMAND;
use crate::session::{
    PermissionPolicy, SessionConfig, SessionControl, SessionDriver, SessionError, SessionEvent,
    SessionHandle, SessionStopper, SessionUsage,
};

pub struct CopilotCliDriver {
    command: String,
}

impl CopilotCliDriver {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config
                .cli_command
                .clone()
                .unwrap_or_else(|| DEFAULT_CLI_COMMAND.to_string()),
        )
    }
}

#[async_trait]
impl SessionDriver for CopilotCliDriver {
    async fn open(
        &self,
        config: SessionConfig,
        prompt: String,
    ) -> Result<SessionHandle, SessionError> {
        let mcp_config_file = write_mcp_config(&config)
            .map_err(|e| SessionError::Config(format!("mcp config: {}", e)))?;

        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg(&prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(&config.model)
            .arg("--mcp-config")
            .arg(mcp_config_file.path());

        if let Some(system) = &config.system_message {
            cmd.arg("--system-prompt").arg(system);
        }
        if let Some(effort) = config.reasoning_effort {
            cmd.arg("--reasoning-effort").arg(effort.as_str());
        }
        if let Some(dir) = &config.working_directory {
            cmd.current_dir(dir);
        }
        if let Some(available) = &config.available_tools {
            cmd.arg("--available-tools").arg(available.join(","));
        }

        cmd.arg("--allowed-tools")
            .arg(config.tool_gate.allow_patterns().join(","));

        // Blanket auto-approval maps to the CLI's non-interactive accept
        // mode; anything finer stays interactive on the CLI side.
        if matches!(config.permission_policy, PermissionPolicy::Uniform(true)) {
            cmd.arg("--permission-mode").arg("acceptEdits");
        }

        log::info!(
            "Opening session for conversation {} with model {}",
            config.conversation_id,
            config.model
        );

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::Start(format!("spawn `{}`: {}", self.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Start("failed to capture stdout".to_string()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_events(stdout, tx));

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!(target: "copilot_cli", "{}", line);
                }
            });
        }

        let control = SessionControl::new(CliSessionStopper {
            child: Arc::new(AsyncMutex::new(Some(child))),
            _mcp_config: mcp_config_file,
        });

        Ok(SessionHandle {
            events: rx,
            control,
        })
    }
}

struct CliSessionStopper {
    child: Arc<AsyncMutex<Option<Child>>>,
    // Keeps the generated --mcp-config file alive for the child's lifetime.
    _mcp_config: NamedTempFile,
}

#[async_trait]
impl SessionStopper for CliSessionStopper {
    async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.start_kill() {
                log::debug!("Session child already gone: {}", e);
                return;
            }
            let _ = child.wait().await;
        }
    }
}

/// Writes the `{"mcpServers": {...}}` document the CLI consumes.
fn write_mcp_config(config: &SessionConfig) -> std::io::Result<NamedTempFile> {
    let servers: HashMap<&String, Value> = config
        .mcp_servers
        .iter()
        .map(|(name, server)| (name, serde_json::to_value(server).unwrap_or(Value::Null)))
        .collect();
    let document = json!({ "mcpServers": servers });

    let file = NamedTempFile::new()?;
    serde_json::to_writer_pretty(file.as_file(), &document).map_err(std::io::Error::other)?;
    file.as_file().sync_all()?;
    Ok(file)
}

/// Reads NDJSON lines from the CLI and converts them to session events.
async fn pump_events(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<SessionEvent>) {
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<CliMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Unparseable CLI event ({}): {}", e, line);
                continue;
            }
        };

        let mut done = false;
        for event in adapt_cli_message(message, &mut done) {
            if tx.send(event).await.is_err() {
                // Receiver gone; the transform has shut down.
                return;
            }
        }
        if done {
            break;
        }
    }
    // Dropping tx closes the event stream; EOF without a result message
    // surfaces as an unexpected close on the consumer side.
}

/// Converts one CLI message into zero or more session events. Sets `done`
/// when the message is the session's final result.
fn adapt_cli_message(message: CliMessage, done: &mut bool) -> Vec<SessionEvent> {
    match message {
        CliMessage::System { session_id } => {
            if let Some(session_id) = session_id {
                log::debug!("CLI session id: {}", session_id);
            }
            Vec::new()
        }
        CliMessage::Assistant { message } => {
            let usage = message.usage.map(|u| SessionUsage {
                input_tokens: u.input_tokens.unwrap_or(0),
                output_tokens: u.output_tokens.unwrap_or(0),
            });
            let mut events = Vec::new();
            let mut saw_tool_use = false;
            for block in message.content {
                match block {
                    CliContentBlock::Text { text } => {
                        if !text.is_empty() {
                            events.push(SessionEvent::Text { delta: text });
                        }
                    }
                    CliContentBlock::ToolUse { id, name, input } => {
                        saw_tool_use = true;
                        events.push(SessionEvent::ToolUse { id, name, input });
                    }
                    CliContentBlock::Other => {}
                }
            }
            if saw_tool_use {
                // The turn pauses here; results come back through the bridge.
                events.push(SessionEvent::Idle {
                    stop_reason: Some("tool_use".to_string()),
                    usage,
                });
            }
            events
        }
        // Tool results ride the bridge; the echo in the CLI stream is noise.
        CliMessage::User {} => Vec::new(),
        CliMessage::Result {
            is_error,
            result,
            usage,
        } => {
            *done = true;
            let usage = usage.map(|u| SessionUsage {
                input_tokens: u.input_tokens.unwrap_or(0),
                output_tokens: u.output_tokens.unwrap_or(0),
            });
            if is_error {
                vec![SessionEvent::Error {
                    message: result.unwrap_or_else(|| "session failed".to_string()),
                }]
            } else {
                vec![SessionEvent::Idle {
                    stop_reason: Some("end_turn".to_string()),
                    usage,
                }]
            }
        }
        CliMessage::Other => Vec::new(),
    }
}

/// Copilot CLI streaming JSON message envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliMessage {
    System {
        session_id: Option<String>,
    },
    Assistant {
        message: CliAssistantMessage,
    },
    User {},
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<CliUsage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CliAssistantMessage {
    content: Vec<CliContentBlock>,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CliUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}
