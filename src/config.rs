use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::DEFAULT_BODY_LIMIT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid excludedFilePatterns entry `{pattern}`: {source}")]
    Pattern { pattern: String, source: regex::Error },
}

/// A user-configured MCP server, launched by the session library as a
/// stdio child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMcpServer {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Tool names the pre-tool-use hook accepts from this server.
    /// `"*"` allows everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Permission auto-approval: either a blanket yes/no or a list of
/// permission kinds that are approved without asking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AutoApprove {
    All(bool),
    Kinds(Vec<String>),
}

impl Default for AutoApprove {
    fn default() -> Self {
        AutoApprove::All(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// The proxy's config document.
///
/// Stored as JSON; every field has a default so an absent file means a
/// default configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// User MCP servers handed to every session.
    pub mcp_servers: HashMap<String, UserMcpServer>,
    /// CLI-native tools the session may run. `"*"` allows all of them.
    pub allowed_cli_tools: Vec<String>,
    /// Regex fragments; fenced code blocks in user messages whose fence
    /// header matches one are stripped before reaching the session.
    pub excluded_file_patterns: Vec<String>,
    /// Request body limit in bytes.
    pub body_limit: usize,
    pub auto_approve_permissions: AutoApprove,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Executable for the Copilot session CLI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_command: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mcp_servers: HashMap::new(),
            allowed_cli_tools: Vec::new(),
            excluded_file_patterns: Vec::new(),
            body_limit: DEFAULT_BODY_LIMIT,
            auto_approve_permissions: AutoApprove::default(),
            reasoning_effort: None,
            cli_command: None,
        }
    }
}

impl ProxyConfig {
    /// Loads the config from `path`. A missing file yields the default
    /// configuration; a present-but-broken file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ProxyConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config)
    }

    /// Default config file location: `~/.config/xcproxy/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("xcproxy")
            .join("config.json")
    }

    /// Compiles `excluded_file_patterns` into regexes, rejecting the first
    /// invalid fragment.
    pub fn compile_exclude_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.excluded_file_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"{
            "mcpServers": {
                "xcode-tools": {
                    "command": "xcrun",
                    "args": ["mcpbridge"],
                    "allowedTools": ["*"],
                    "env": {"FOO": "bar"}
                }
            },
            "allowedCliTools": ["Read", "Grep"],
            "excludedFilePatterns": ["\\.env$", "secrets/"],
            "bodyLimit": 1048576,
            "autoApprovePermissions": ["read", "execute"],
            "reasoningEffort": "high"
        }"#;
        let config: ProxyConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.mcp_servers["xcode-tools"].command, "xcrun");
        assert_eq!(config.allowed_cli_tools, vec!["Read", "Grep"]);
        assert_eq!(config.body_limit, 1048576);
        assert!(matches!(
            config.auto_approve_permissions,
            AutoApprove::Kinds(ref kinds) if kinds.len() == 2
        ));
        assert_eq!(config.reasoning_effort, Some(ReasoningEffort::High));
        assert_eq!(config.compile_exclude_patterns().unwrap().len(), 2);
    }

    #[test]
    fn test_auto_approve_accepts_bool() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"autoApprovePermissions": true}"#).unwrap();
        assert!(matches!(config.auto_approve_permissions, AutoApprove::All(true)));
    }

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.body_limit, DEFAULT_BODY_LIMIT);
        assert!(config.mcp_servers.is_empty());
        assert!(config.reasoning_effort.is_none());
    }

    #[test]
    fn test_bad_pattern_is_rejected() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"excludedFilePatterns": ["("]}"#).unwrap();
        assert!(config.compile_exclude_patterns().is_err());
    }
}
