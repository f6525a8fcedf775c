//! Wire shapes shared between the CDP router, the extension link, and the
//! target registry.
//!
//! CDP itself has no fixed schema — fields are extracted by name and unknown
//! ones pass through untouched when forwarding. These types only pin down the handful of fields the relay
//! actually reads or synthesizes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `Target.*` target description as carried in attach/detach/info-changed
/// events and in synthesized `Target.getTargets` replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "type", default = "page_type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
}

fn page_type() -> String {
    "page".to_string()
}

/// A frame received on the `/cdp` WebSocket from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpClientFrame {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

/// A message received on the `/extension` WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExtensionInbound {
    /// `{id, result}` or `{id, error}` — a reply to an outstanding relay call.
    Reply {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ExtensionErrorBody>,
    },
    /// `{method, params}` — an unsolicited event or registry update.
    Event {
        method: String,
        #[serde(default)]
        params: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionErrorBody {
    pub message: String,
    #[serde(default)]
    pub code: Option<i32>,
}

/// Payload of a `forwardCDPEvent` extension message.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardedCdpEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredTabInfo {
    #[serde(rename = "tabId")]
    pub tab_id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub active: bool,
}

/// Payload of a `tabUpdated` extension message: an upsert of one field set.
#[derive(Debug, Clone, Deserialize)]
pub struct TabUpdatedParams {
    #[serde(rename = "tabId")]
    pub tab_id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabRemovedParams {
    #[serde(rename = "tabId")]
    pub tab_id: u64,
}

/// Result payload the extension returns for an `attachDiscoveredTab` call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachDiscoveredTabResult {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "targetId")]
    pub target_id: String,
}

/// Build a CDP-shaped JSON-RPC success reply: `{id, result}`.
pub fn cdp_result(id: u64, result: Value) -> Value {
    serde_json::json!({ "id": id, "result": result })
}

/// Build a CDP-shaped JSON-RPC error reply: `{id, error:{code,message}}`.
pub fn cdp_error(id: u64, code: i32, message: impl Into<String>) -> Value {
    serde_json::json!({
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

/// Build a CDP event frame: `{method, params}` (optionally `sessionId`).
pub fn cdp_event(method: &str, params: Value, session_id: Option<&str>) -> Value {
    let mut frame = serde_json::json!({ "method": method, "params": params });
    if let Some(sid) = session_id {
        frame["sessionId"] = Value::String(sid.to_string());
    }
    frame
}
