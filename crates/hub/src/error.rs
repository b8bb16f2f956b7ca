// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::Envelope;

/// Client-visible error codes for the hub API.
///
/// The same taxonomy is surfaced on WebSocket `error.response` frames and on
/// HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubError {
    SessionNotFound,
    Forbidden,
    TurnInProgress,
    MessageTooLarge,
    PersistFailed,
    MaxSessions,
    InvalidCredentials,
    RateLimited,
    BadRequest,
}

impl HubError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::SessionNotFound => 404,
            Self::Forbidden => 403,
            Self::TurnInProgress => 409,
            Self::MessageTooLarge => 413,
            Self::PersistFailed => 500,
            Self::MaxSessions => 429,
            Self::InvalidCredentials => 401,
            Self::RateLimited => 429,
            Self::BadRequest => 400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "session_not_found",
            Self::Forbidden => "forbidden",
            Self::TurnInProgress => "turn_in_progress",
            Self::MessageTooLarge => "message_too_large",
            Self::PersistFailed => "persist_failed",
            Self::MaxSessions => "max_sessions",
            Self::InvalidCredentials => "invalid_credentials",
            Self::RateLimited => "rate_limited",
            Self::BadRequest => "bad_request",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    /// Build an `error.response` frame for a WebSocket client.
    pub fn to_envelope(&self, session_id: Option<String>, message: impl Into<String>) -> Envelope {
        Envelope::new("error.response", session_id, self.to_error_body(message))
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level HTTP error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
