use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::TOOL_NAME_SPLIT;

/// A tool definition as Xcode advertises it: a name, an optional
/// description and a JSON-schema-shaped `input_schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Holds the tool catalog of one conversation.
///
/// Models hallucinate shortened tool names and inconsistent key casings;
/// the cache resolves those against the advertised catalog instead of
/// letting the calls fail inside Xcode.
#[derive(Debug, Default)]
pub struct ToolCache {
    tools: Vec<ToolDefinition>,
}

impl ToolCache {
    /// Replaces the stored catalog wholesale.
    pub fn cache(&mut self, tools: Vec<ToolDefinition>) {
        self.tools = tools;
    }

    /// Returns the stored catalog (may be empty).
    pub fn get(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Resolves `name` against the catalog.
    ///
    /// An exact match wins. Otherwise, if exactly one cached tool ends with
    /// `__name` the model dropped the server prefix and we restore it.
    /// Ambiguous or unknown names pass through unchanged.
    pub fn resolve_name<'a>(&'a self, name: &'a str) -> &'a str {
        if self.tools.iter().any(|t| t.name == name) {
            return name;
        }

        let suffix = format!("{}{}", TOOL_NAME_SPLIT, name);
        let mut candidates = self.tools.iter().filter(|t| t.name.ends_with(&suffix));
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => only.name.as_str(),
            _ => name,
        }
    }

    /// Normalizes argument keys and enum values against the tool's schema.
    ///
    /// Unknown tools, schema-less tools and non-object arguments pass
    /// through untouched. Keys are matched exactly, then via
    /// camelCase/snake_case conversion, then via a fixed flag-alias table.
    /// String values are converted between casings when the target property
    /// declares a string enum. Unknown keys are preserved, never dropped.
    pub fn normalize_args(&self, tool_name: &str, args: Value) -> Value {
        let Some(tool) = self.tools.iter().find(|t| t.name == tool_name) else {
            return args;
        };
        let Some(props) = tool
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
        else {
            return args;
        };
        let map = match args {
            Value::Object(map) => map,
            other => return other,
        };

        let mut normalized = serde_json::Map::with_capacity(map.len());
        for (key, value) in map {
            let target_key = normalize_key(&key, props);
            let value = normalize_enum_value(props.get(&target_key), value);
            normalized.insert(target_key, value);
        }
        Value::Object(normalized)
    }
}

fn normalize_key(key: &str, props: &serde_json::Map<String, Value>) -> String {
    if props.contains_key(key) {
        return key.to_string();
    }
    let snake = camel_to_snake(key);
    if props.contains_key(&snake) {
        return snake;
    }
    let camel = snake_to_camel(key);
    if props.contains_key(&camel) {
        return camel;
    }
    if let Some(alias) = flag_alias(key) {
        if props.contains_key(alias) {
            return alias.to_string();
        }
    }
    key.to_string()
}

/// Common camelCase spellings for single-letter grep-style flags.
fn flag_alias(key: &str) -> Option<&'static str> {
    match key {
        "ignoreCase" => Some("-i"),
        "lineNumbers" => Some("-n"),
        "afterContext" => Some("-A"),
        "beforeContext" => Some("-B"),
        "context" => Some("-C"),
        _ => None,
    }
}

fn normalize_enum_value(prop: Option<&Value>, value: Value) -> Value {
    let Some(members) = prop
        .and_then(|p| p.get("enum"))
        .and_then(Value::as_array)
    else {
        return value;
    };
    let Some(s) = value.as_str() else {
        return value;
    };
    if members.iter().any(|m| m.as_str() == Some(s)) {
        return value;
    }

    for candidate in [camel_to_snake(s), snake_to_camel(s)] {
        if members.iter().any(|m| m.as_str() == Some(candidate.as_str())) {
            return Value::String(candidate);
        }
    }
    value
}

fn camel_to_snake(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for ch in input.chars() {
        if ch.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn snake_to_camel(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut upper_next = false;
    for ch in input.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}
