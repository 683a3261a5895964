//! Adapter shim for Xcode's native MCP server (`xcrun mcpbridge`).
//!
//! The native server's `tools/call` responses carry a `content` array but
//! no `structuredContent`, which some session libraries require. This shim
//! sits between the session library and the native server, pipes the
//! newline-delimited JSON-RPC traffic through verbatim, and injects
//! `structuredContent` into responses that lack it: the first text item is
//! parsed as JSON when possible, otherwise wrapped as `{"text": ...}`.

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

fn setup_stderr_logger() {
    let _ = fern::Dispatch::new()
        .level(log::LevelFilter::Info)
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}] {}",
                chrono::Local::now().format("%H:%M:%S.%3f "),
                record.level(),
                message
            ))
        })
        .chain(std::io::stderr())
        .apply();
}

/// Adds `structuredContent` to a `tools/call` response that lacks it.
/// Anything that isn't such a response passes through untouched.
fn inject_structured_content(mut message: Value) -> Value {
    let Some(result) = message.get_mut("result") else {
        return message;
    };
    if result.get("structuredContent").is_some() {
        return message;
    }
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return message;
    };

    let first_text = content.iter().find_map(|item| {
        if item.get("type").and_then(Value::as_str) == Some("text") {
            item.get("text").and_then(Value::as_str)
        } else {
            None
        }
    });
    let Some(text) = first_text else {
        return message;
    };

    let structured = match serde_json::from_str::<Value>(text) {
        Ok(parsed) => parsed,
        Err(_) => json!({ "text": text }),
    };
    result["structuredContent"] = structured;
    message
}

/// Rewrites one line of child output before it reaches the session
/// library. Unparseable lines pass through untouched.
fn adapt_child_line(line: &str) -> String {
    match serde_json::from_str::<Value>(line) {
        Ok(message) => inject_structured_content(message).to_string(),
        Err(_) => line.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_stderr_logger();

    // Default target is the native bridge; any override comes via argv.
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        args = vec!["xcrun".to_string(), "mcpbridge".to_string()];
    }
    let (command, command_args) = args.split_first().expect("command checked above");

    log::info!("Spawning native MCP server: {} {:?}", command, command_args);
    let mut child = Command::new(command)
        .args(command_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let mut child_stdin = child.stdin.take().expect("child stdin is piped");
    let child_stdout = child.stdout.take().expect("child stdout is piped");

    // Parent stdin -> child stdin, verbatim.
    let downstream = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if child_stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if child_stdin.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = child_stdin.flush().await;
        }
        // Parent went away; closing child stdin lets the child exit.
    });

    // Child stdout -> parent stdout, with response rewriting.
    let upstream = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(child_stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let adapted = adapt_child_line(&line);
            if stdout.write_all(adapted.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let _ = tokio::join!(downstream, upstream);
    let status = child.wait().await?;
    log::info!("Native MCP server exited with {}", status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_text_becomes_structured_content() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {
                "content": [{"type": "text", "text": "{\"files\": 2}"}]
            }
        });
        let adapted = inject_structured_content(response);
        assert_eq!(adapted["result"]["structuredContent"], json!({"files": 2}));
    }

    #[test]
    fn test_plain_text_is_wrapped() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {
                "content": [{"type": "text", "text": "build succeeded"}]
            }
        });
        let adapted = inject_structured_content(response);
        assert_eq!(
            adapted["result"]["structuredContent"],
            json!({"text": "build succeeded"})
        );
    }

    #[test]
    fn test_existing_structured_content_is_kept() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {
                "content": [{"type": "text", "text": "{\"a\": 1}"}],
                "structuredContent": {"already": "here"}
            }
        });
        let adapted = inject_structured_content(response.clone());
        assert_eq!(adapted, response);
    }

    #[test]
    fn test_requests_and_errors_pass_through() {
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        assert_eq!(inject_structured_content(request.clone()), request);

        let error = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "nope"}});
        assert_eq!(inject_structured_content(error.clone()), error);
    }

    #[test]
    fn test_unparseable_line_passes_through() {
        assert_eq!(adapt_child_line("not json"), "not json");
    }
}
