//! MCP (Model Context Protocol) wire types.
//!
//! The protocol is JSON-RPC 2.0, one message per line, carried over the
//! authenticated TCP connection. This module holds the message envelopes
//! and the tool-result shapes shared by the session loop, the dispatcher,
//! and the service adapters.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol revision advertised in the `initialize` response.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name advertised in the `initialize` response.
pub const SERVER_NAME: &str = "iMCP";

// ---------------------------------------------------------------------------
// Heartbeat sideband
// ---------------------------------------------------------------------------

/// Binary heartbeat frames interleaved in the TCP byte stream.
///
/// The session writes one as its periodic transport-liveness probe; the
/// bridge strips them before stdout ever sees a byte. A frame is the
/// 4-byte magic followed by an 8-byte big-endian payload (epoch seconds).
pub mod heartbeat {
    /// UTF-8 encoding of U+1F493.
    pub const MAGIC: [u8; 4] = [0xF0, 0x9F, 0x92, 0x93];

    /// Total frame length: magic + 8-byte payload.
    pub const FRAME_LEN: usize = 12;

    /// Build a heartbeat frame carrying the current epoch seconds.
    pub fn frame() -> [u8; FRAME_LEN] {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        frame_with_payload(now)
    }

    /// Build a heartbeat frame with an explicit payload.
    pub fn frame_with_payload(payload: u64) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[..4].copy_from_slice(&MAGIC);
        frame[4..].copy_from_slice(&payload.to_be_bytes());
        frame
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC message types
// ---------------------------------------------------------------------------

/// Standard JSON-RPC error codes used by the session loop.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
}

/// One parsed line of client traffic. A missing `id` marks a client
/// notification, which never gets a reply.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Reply envelope. Exactly one of `result`/`error` is populated and serde
/// drops the other from the serialized line.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Error payload carried inside a failed reply.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-originated message without an `id`. The peer never answers
/// these; delivery is best effort.
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcResponse {
    fn reply(id: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: None,
        }
    }

    /// Successful reply carrying `result`.
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::reply(id)
        }
    }

    /// Protocol-level failure with a standard error code.
    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            ..Self::reply(id)
        }
    }
}

impl JsonRpcNotification {
    /// The `notifications/tools/list_changed` notification.
    pub fn tools_list_changed() -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: "notifications/tools/list_changed".into(),
            params: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

/// A tool exposed through `tools/list`.
///
/// `read_only` maps to the MCP `readOnlyHint` annotation and is the sole
/// criterion deciding whether a token with `readOnly` permission may see
/// and call the tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub read_only: bool,
}

impl ToolSpec {
    /// Render as the MCP `tools/list` JSON object.
    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "annotations": { "readOnlyHint": self.read_only },
        })
    }
}

// ---------------------------------------------------------------------------
// Tool results
// ---------------------------------------------------------------------------

/// Result of a `tools/call`, matching the MCP tool result format:
///
/// ```json
/// {
///   "content": [{ "type": "text", "text": "..." }],
///   "isError": false
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

/// A single content block in an MCP tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "audio")]
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl McpToolResult {
    /// Successful text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Error text result. This is a user-visible tool failure, not a
    /// protocol-level JSON-RPC error.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Result carrying a single base64 blob content block.
    pub fn blob(data: String, mime_type: String) -> Self {
        let block = if mime_type.starts_with("audio/") {
            McpContent::Audio {
                data,
                mime_type,
            }
        } else {
            McpContent::Image {
                data,
                mime_type,
            }
        };
        Self {
            content: vec![block],
            is_error: false,
        }
    }
}

/// Build the `initialize` result payload.
pub fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {
                "listChanged": true
            },
            "prompts": {},
            "resources": {}
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
