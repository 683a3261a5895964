use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Anthropic Messages API request, as Xcode sends it.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ClaudeMessagesRequest {
    pub model: String,
    pub messages: Vec<ClaudeMessage>,
    #[serde(default, deserialize_with = "deserialize_system_field")]
    pub system: Option<String>,
    #[serde(default)]
    pub max_tokens: i32,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub tools: Option<Vec<ClaudeTool>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Message content is either a raw string or a list of typed blocks.
/// The distinction is load-bearing: continuation routing treats a plain
/// string as "definitely a new conversation".
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    /// Blocks this proxy doesn't act on (images, thinking, ...).
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

impl ClaudeMessage {
    /// `tool_use_id`s of every `tool_result` block in this message, with
    /// the result content each carries.
    pub fn tool_results(&self) -> Vec<(&str, &Value)> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => Some((tool_use_id.as_str(), content)),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Concatenated text of the message, for prompt assembly.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl ClaudeMessagesRequest {
    /// Validates request parameters the handler relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.model.is_empty() || self.model.len() > 256 {
            return Err("model must be between 1 and 256 characters".to_string());
        }
        if self.messages.is_empty() {
            return Err("messages must not be empty".to_string());
        }
        if self.max_tokens < 0 {
            return Err("max_tokens must be non-negative".to_string());
        }
        if let Some(temp) = self.temperature {
            if !(0.0..=1.0).contains(&temp) {
                return Err("temperature must be between 0.0 and 1.0".to_string());
            }
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err("top_p must be between 0.0 and 1.0".to_string());
            }
        }
        Ok(())
    }
}

// The `system` field arrives either as a plain string or as an array of
// text blocks; both collapse into one string.
fn deserialize_system_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SystemInput {
        String(String),
        Array(Vec<SystemBlock>),
    }

    let system_input = Option::<SystemInput>::deserialize(deserializer)?;

    match system_input {
        Some(SystemInput::String(s)) => Ok(Some(s)),
        Some(SystemInput::Array(blocks)) => Ok(Some(
            blocks
                .into_iter()
                .map(|block| block.text)
                .collect::<Vec<String>>()
                .join("\n\n"),
        )),
        None => Ok(None),
    }
}
