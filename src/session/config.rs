use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::{AutoApprove, ProxyConfig, ReasoningEffort};
use crate::constants::{BRIDGE_SERVER_NAME, USER_INPUT_REFUSAL};
use crate::session::ModelInfo;

/// An MCP server entry handed to the session library.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionMcpServer {
    Stdio {
        command: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
        tools: Vec<String>,
    },
    Http {
        url: String,
        tools: Vec<String>,
    },
}

/// Uniform or per-kind permission auto-approval.
#[derive(Debug, Clone)]
pub enum PermissionPolicy {
    Uniform(bool),
    Kinds(Vec<String>),
}

impl PermissionPolicy {
    pub fn from_config(auto_approve: &AutoApprove) -> Self {
        match auto_approve {
            AutoApprove::All(value) => PermissionPolicy::Uniform(*value),
            AutoApprove::Kinds(kinds) => PermissionPolicy::Kinds(kinds.clone()),
        }
    }

    /// Whether a permission request of `kind` is approved without asking.
    pub fn allows(&self, kind: &str) -> bool {
        match self {
            PermissionPolicy::Uniform(value) => *value,
            PermissionPolicy::Kinds(kinds) => kinds.iter().any(|k| k == kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Deny,
}

/// The pre-tool-use hook: decides per tool name whether the session may
/// run it. Bridge traffic is always allowed; everything else must be
/// allowlisted either as a CLI tool or by the user MCP server it belongs to.
#[derive(Debug, Clone, Default)]
pub struct ToolGate {
    allowed_cli_tools: Vec<String>,
    /// (server name, allowed tool names) per user MCP server.
    mcp_allowed: Vec<(String, Vec<String>)>,
}

impl ToolGate {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let mcp_allowed = config
            .mcp_servers
            .iter()
            .filter_map(|(name, server)| {
                server
                    .allowed_tools
                    .as_ref()
                    .map(|tools| (name.clone(), tools.clone()))
            })
            .collect();
        Self {
            allowed_cli_tools: config.allowed_cli_tools.clone(),
            mcp_allowed,
        }
    }

    pub fn evaluate(&self, tool_name: &str) -> HookDecision {
        if tool_name.starts_with(&format!("{}-", BRIDGE_SERVER_NAME)) {
            return HookDecision::Allow;
        }
        if self
            .allowed_cli_tools
            .iter()
            .any(|t| t == "*" || t == tool_name)
        {
            return HookDecision::Allow;
        }
        for (server, allowed) in &self.mcp_allowed {
            let from_server = tool_name.starts_with(&format!("{}-", server));
            for tool in allowed {
                if tool == tool_name || (tool == "*" && from_server) {
                    return HookDecision::Allow;
                }
            }
        }
        HookDecision::Deny
    }

    /// Allowlist patterns for drivers that take tool filters as flags.
    pub fn allow_patterns(&self) -> Vec<String> {
        let mut patterns = vec![format!("{}-*", BRIDGE_SERVER_NAME)];
        patterns.extend(self.allowed_cli_tools.iter().cloned());
        for (server, allowed) in &self.mcp_allowed {
            for tool in allowed {
                if tool == "*" {
                    patterns.push(format!("{}-*", server));
                } else {
                    patterns.push(tool.clone());
                }
            }
        }
        patterns
    }
}

/// Everything the session library needs to open one streaming session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub system_message: Option<String>,
    pub streaming: bool,
    pub infinite_sessions: bool,
    pub mcp_servers: HashMap<String, SessionMcpServer>,
    /// Restriction on CLI-native tools; `None` leaves them all available
    /// (the pre-tool-use hook filters instead).
    pub available_tools: Option<Vec<String>>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub working_directory: Option<PathBuf>,
    pub conversation_id: String,
    pub permission_policy: PermissionPolicy,
    pub tool_gate: ToolGate,
    /// Fixed answer to any user-input request the session raises.
    pub user_input_response: &'static str,
}

pub struct SessionConfigParams<'a> {
    pub model: &'a ModelInfo,
    pub system_message: Option<String>,
    pub server_config: &'a ProxyConfig,
    pub working_directory: Option<PathBuf>,
    pub has_tool_bridge: bool,
    pub port: u16,
    pub conversation_id: &'a str,
}

/// Builds the session configuration from the server config. Pure: no IO,
/// no clocks.
pub fn build_session_config(params: SessionConfigParams<'_>) -> SessionConfig {
    let SessionConfigParams {
        model,
        system_message,
        server_config,
        working_directory,
        has_tool_bridge,
        port,
        conversation_id,
    } = params;

    let mut mcp_servers: HashMap<String, SessionMcpServer> = server_config
        .mcp_servers
        .iter()
        .map(|(name, server)| {
            (
                name.clone(),
                SessionMcpServer::Stdio {
                    command: server.command.clone(),
                    args: server.args.clone(),
                    env: server.env.clone(),
                    // The hook filters; the server itself exposes everything.
                    tools: vec!["*".to_string()],
                },
            )
        })
        .collect();

    if has_tool_bridge {
        mcp_servers.insert(
            BRIDGE_SERVER_NAME.to_string(),
            SessionMcpServer::Http {
                url: format!("http://127.0.0.1:{}/mcp/{}", port, conversation_id),
                tools: vec!["*".to_string()],
            },
        );
    }

    // Without a bridge the CLI tool list is a hard restriction; with one,
    // all CLI tools stay available and the hook decides per call.
    let available_tools = if !has_tool_bridge && !server_config.allowed_cli_tools.is_empty() {
        Some(server_config.allowed_cli_tools.clone())
    } else {
        None
    };

    let reasoning_effort = server_config
        .reasoning_effort
        .filter(|_| model.supports_reasoning_effort);

    SessionConfig {
        model: model.id.clone(),
        system_message,
        streaming: true,
        infinite_sessions: true,
        mcp_servers,
        available_tools,
        reasoning_effort,
        working_directory,
        conversation_id: conversation_id.to_string(),
        permission_policy: PermissionPolicy::from_config(&server_config.auto_approve_permissions),
        tool_gate: ToolGate::from_config(server_config),
        user_input_response: USER_INPUT_REFUSAL,
    }
}
