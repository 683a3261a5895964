use std::time::Duration;

// =================================================
// Server defaults
// =================================================

/// Default listen port for the proxy. The bridge endpoints share it.
pub const DEFAULT_PORT: u16 = 50505;

/// Only the loopback interface is ever bound; the proxy is strictly local.
pub const LISTEN_ADDR: &str = "127.0.0.1";

/// Default request body limit in bytes. Xcode ships whole files in messages.
pub const DEFAULT_BODY_LIMIT: usize = 50 * 1024 * 1024;

/// User agents must start with this prefix to reach the `/v1` surface.
pub const XCODE_UA_PREFIX: &str = "Xcode/";

// =================================================
// Tool bridge
// =================================================

/// How long a parked tool call waits for Xcode before it is rejected.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Name of the synthetic MCP server injected into every bridged session.
pub const BRIDGE_SERVER_NAME: &str = "xcode-bridge";

/// Separator MCP-style tool names use between server and tool segments.
pub const TOOL_NAME_SPLIT: &str = "__";

// =================================================
// Session
// =================================================

/// Hard cap on session teardown at shutdown.
pub const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Default executable for the Copilot session CLI.
pub const DEFAULT_CLI_COMMAND: &str = "copilot";

/// Fixed reply for any user-input request a session raises; the proxy has
/// no interactive surface to forward it to.
pub const USER_INPUT_REFUSAL: &str =
    "User input is not available through this integration. Continue with your best judgment.";

// =================================================
// Shims
// =================================================

/// Environment variable the passthrough shim reads to locate the bridge.
pub const MCP_SERVER_PORT_ENV: &str = "MCP_SERVER_PORT";
