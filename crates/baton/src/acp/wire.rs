//! NDJSON JSON-RPC framing helpers for the agent stdio channel.
//!
//! Each line is one JSON-RPC 2.0 message; either side may issue requests.
//! Helpers here are protocol-agnostic: they operate on raw JSON values and
//! async stream halves without knowledge of specific method names.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// ACP method names spoken over the agent channel.
pub mod methods {
    // client → agent
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const SESSION_NEW: &str = "session/new";
    pub const SESSION_PROMPT: &str = "session/prompt";
    pub const SESSION_CANCEL: &str = "session/cancel";
    pub const SESSION_SET_MODE: &str = "session/set_mode";
    pub const SESSION_SET_MODEL: &str = "session/set_model";

    // agent → client
    pub const SESSION_UPDATE: &str = "session/update";
    pub const SESSION_REQUEST_PERMISSION: &str = "session/request_permission";
    pub const FS_READ_TEXT_FILE: &str = "fs/read_text_file";
    pub const FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";
    pub const TERMINAL_CREATE: &str = "terminal/create";
    pub const TERMINAL_OUTPUT: &str = "terminal/output";
    pub const TERMINAL_WAIT_FOR_EXIT: &str = "terminal/wait_for_exit";
    pub const TERMINAL_RELEASE: &str = "terminal/release";
    pub const TERMINAL_KILL: &str = "terminal/kill";
}

/// JSON-RPC error code for invalid params (also used for sandbox denials).
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code for unknown methods.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code for request handler failures.
pub const INTERNAL_ERROR: i64 = -32603;

/// Builds a JSON-RPC request payload.
pub fn request_payload(id: &str, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    })
}

/// Builds a JSON-RPC notification payload (no id, no response expected).
pub fn notification_payload(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params
    })
}

/// Builds a JSON-RPC success response echoing the peer's request id.
pub fn response_payload(id: &Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

/// Builds a JSON-RPC error response echoing the peer's request id.
pub fn error_payload(id: &Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}

/// Extracts a top-level `error.message` string from a JSON-RPC error payload.
pub fn extract_error_message(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Writes one JSON-RPC payload as a newline-delimited line.
///
/// # Errors
/// Returns an error when the write or flush fails.
pub async fn write_json_line<W>(writer: &mut W, payload: &Value) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    let serialized = payload.to_string();

    writer
        .write_all(serialized.as_bytes())
        .await
        .map_err(|error| format!("Failed writing to agent channel: {error}"))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|error| format!("Failed writing newline to agent channel: {error}"))?;
    writer
        .flush()
        .await
        .map_err(|error| format!("Failed flushing agent channel: {error}"))
}
