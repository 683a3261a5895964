//! Turns an Anthropic message history into the prompt text handed to the
//! session, stripping code fences the user configured as excluded.

use regex::Regex;

use crate::proxy::types::claude::ClaudeMessage;

/// Formats `messages` into a role-tagged transcript.
///
/// `tool_result` blocks are skipped entirely: tool results travel through
/// the bridge, not the prompt. A lone user message is passed through
/// unwrapped so simple prompts stay simple.
pub fn format_prompt(messages: &[ClaudeMessage], exclude: &[Regex]) -> String {
    if let [only] = messages {
        if only.role == "user" {
            return strip_excluded_fences(&only.text(), exclude);
        }
    }

    let mut sections = Vec::new();
    for message in messages {
        let text = match message.role.as_str() {
            "user" => strip_excluded_fences(&message.text(), exclude),
            _ => message.text(),
        };
        if text.trim().is_empty() {
            continue;
        }
        let label = match message.role.as_str() {
            "user" => "User",
            "assistant" => "Assistant",
            "system" => "System",
            _ => continue,
        };
        sections.push(format!("{}: {}", label, text));
    }
    sections.join("\n\n")
}

/// Replaces the body of fenced code blocks whose fence header matches any
/// of `patterns` with a placeholder. The fences themselves survive so the
/// surrounding text keeps its shape.
pub fn strip_excluded_fences(text: &str, patterns: &[Regex]) -> String {
    if patterns.is_empty() {
        return text.to_string();
    }

    let mut out: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut excluding = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            if in_fence {
                in_fence = false;
                excluding = false;
                out.push(line);
            } else {
                in_fence = true;
                let header = trimmed.trim_start_matches('`').trim();
                excluding = patterns.iter().any(|p| p.is_match(header));
                out.push(line);
                if excluding {
                    out.push("[contents excluded]");
                }
            }
        } else if !excluding {
            out.push(line);
        }
    }
    out.join("\n")
}
