// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol: the JSON envelope and payload schemas spoken on both
//! WebSocket populations.
//!
//! Every frame is one JSON object: `{type, session_id?, timestamp, payload}`.
//! The type tags form a closed catalog, but payloads tolerate unknown fields
//! so optional recovery hints (`endpoint_id`, `native_handle`) pass through
//! implementations that do not understand them.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One WebSocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope with the current timestamp.
    pub fn new(kind: &str, session_id: Option<String>, payload: impl Serialize) -> Self {
        Self {
            kind: kind.to_owned(),
            session_id,
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    /// Build an envelope carrying a raw payload value (used when forwarding
    /// frames whose payloads must be preserved verbatim).
    pub fn with_value(kind: &str, session_id: Option<String>, payload: Value) -> Self {
        Self { kind: kind.to_owned(), session_id, timestamp: Utc::now(), payload }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

// -- Runtime → Hub payloads ---------------------------------------------------

/// An agent endpoint offered by a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRegistration {
    pub id: String,
    pub profile: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub security: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeHello {
    pub runtime_id: String,
    pub token: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointRegistration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    pub channel: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStarted {
    #[serde(default)]
    pub in_response_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCompleted {
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub native_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub resource: String,
}

/// Metadata describing a staged file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAvailable {
    pub metadata: FileMeta,
    /// Standard (not url-safe) base64.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfigAck {
    pub endpoint_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// -- Hub → Runtime payloads ---------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreate {
    pub endpoint_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfigUpdate {
    pub endpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefresh {
    pub token: String,
}

// -- Client ↔ Hub payloads ----------------------------------------------------

/// A user message as submitted by a client. Unknown fields are preserved on
/// the raw payload when forwarding, so this struct only names what the hub
/// itself inspects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub message_id: String,
    pub content: String,
    #[serde(default)]
    pub endpoint_id: Option<String>,
    #[serde(default)]
    pub native_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribe {
    #[serde(default)]
    pub after_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub request_id: String,
    pub approved: bool,
}

/// Transcript row shape used in `history.response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub direction: String,
    pub channel: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<StoredMessage>,
}

// -- Frame size limits --------------------------------------------------------

/// Hard cap on runtime frames when file transfer is disabled.
pub const RUNTIME_FRAME_LIMIT: usize = 1024 * 1024;

/// Envelope overhead allowance on top of payload content.
pub const FRAME_OVERHEAD: usize = 4 * 1024;

/// Max inbound frame size for a runtime connection.
///
/// Base64 inflates file payloads by 4/3; the 1.4 factor covers that plus JSON
/// escaping, and the flat overhead covers the envelope itself.
pub fn max_runtime_frame_bytes(max_file_bytes: usize) -> usize {
    if max_file_bytes == 0 {
        return RUNTIME_FRAME_LIMIT;
    }
    let inflated = (max_file_bytes * 14).div_ceil(10) + FRAME_OVERHEAD;
    inflated.max(RUNTIME_FRAME_LIMIT)
}

/// Max inbound frame size for a client connection.
pub fn max_client_frame_bytes(max_client_msg_bytes: usize) -> usize {
    max_client_msg_bytes + FRAME_OVERHEAD
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
