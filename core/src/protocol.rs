//! Wire protocol: one JSON object per WebSocket text frame, discriminated by
//! `type`. Unknown types are ignored on both sides so old servers and new
//! clients can coexist; malformed frames get an `error` reply instead.

use serde::{Deserialize, Serialize};

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMsg {
    /// Ask for the current session list.
    List,
    /// Create a named session (does not attach the creator).
    Create { name: String },
    /// Attach to a session; detaches from the previous one first.
    Attach { name: String },
    /// Kill a session and its shell.
    Kill { name: String },
    /// Rename a session.
    Rename {
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
    },
    /// Keystrokes for the attached session's PTY.
    Input { data: String },
    /// New window size for the attached session's PTY.
    Resize { cols: u16, rows: u16 },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMsg {
    Sessions {
        list: Vec<SessionEntry>,
    },
    Created {
        name: String,
    },
    Attached {
        name: String,
    },
    Killed {
        name: String,
    },
    Renamed {
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
    },
    /// Child exit report. `signal` is null for a plain exit.
    Exited {
        name: String,
        #[serde(rename = "exitCode")]
        exit_code: u32,
        signal: Option<String>,
    },
    /// PTY bytes as UTF-8. Chunk boundaries are not meaningful; partial
    /// escape sequences may cross frames.
    Output {
        data: String,
    },
    Error {
        message: String,
    },
}

/// One row of the `sessions` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub name: String,
    #[serde(rename = "clientCount")]
    pub client_count: usize,
}

/// `type` values this server understands. Everything else is ignored.
const CLIENT_TYPES: &[&str] = &[
    "list", "create", "attach", "kill", "rename", "input", "resize",
];

/// Decode one inbound text frame.
///
/// `Ok(Some(..))` — a known, well-formed message. `Ok(None)` — unknown
/// `type`, dropped for forward compatibility. `Err(..)` — malformed JSON or
/// bad fields; the caller replies with an `error` frame.
pub fn decode_client(text: &str) -> std::result::Result<Option<ClientMsg>, String> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("malformed JSON: {e}"))?;
    let ty = match value.get("type").and_then(|t| t.as_str()) {
        Some(t) => t.to_owned(),
        None => return Err("missing \"type\" field".to_string()),
    };
    if !CLIENT_TYPES.contains(&ty.as_str()) {
        return Ok(None);
    }
    serde_json::from_value::<ClientMsg>(value)
        .map(Some)
        .map_err(|e| format!("bad \"{ty}\" frame: {e}"))
}

/// Serialize an outbound frame to its wire form.
pub fn encode_server(msg: &ServerMsg) -> String {
    serde_json::to_string(msg).unwrap_or_default()
}
