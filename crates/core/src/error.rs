//! Error taxonomy shared by list fetches and mutations.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// A field-level validation message (422-style responses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Failures surfaced by a collection backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    /// Request never produced an HTTP response (DNS, connect, timeout).
    #[error("transport: {0}")]
    Transport(String),
    #[error("validation: {message}")]
    Validation { message: String, fields: Vec<FieldError> },
    /// Business-rule rejection, e.g. delete blocked by active references.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("server({status}): {message}")]
    Server { status: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Classify an HTTP error response. `body` is the raw response body.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let envelope = parse_envelope(body);
        let message = envelope.message.unwrap_or_default();
        match status {
            401 | 403 => ApiError::Unauthorized(message),
            404 => ApiError::NotFound(message),
            422 => ApiError::Validation { message, fields: envelope.fields },
            400 | 409 | 412 => {
                if envelope.fields.is_empty() {
                    ApiError::Conflict(message)
                } else {
                    ApiError::Validation { message, fields: envelope.fields }
                }
            }
            s if s >= 500 => ApiError::Server { status: s, message },
            s => ApiError::Conflict(if message.is_empty() { format!("unexpected status {}", s) } else { message }),
        }
    }

    /// Transport and 5xx failures may succeed on retry; the rest will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Server { .. })
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ApiError::NotFound(_)) }

    /// Server-provided text, when the server sent one.
    pub fn server_message(&self) -> Option<&str> {
        let m = match self {
            ApiError::Validation { message, .. } => message,
            ApiError::Conflict(m) | ApiError::NotFound(m) | ApiError::Unauthorized(m) => m,
            ApiError::Server { message, .. } => message,
            ApiError::Transport(_) | ApiError::Decode(_) => return None,
        };
        let m = m.trim();
        if m.is_empty() { None } else { Some(m) }
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ApiError::Validation { fields, .. } => fields,
            _ => &[],
        }
    }

    /// Text shown to the user for a failed `action` ("delete", "load badges", ...).
    ///
    /// Business-rule and validation messages are passed through verbatim;
    /// transport and server failures get a generic retry hint.
    pub fn user_message(&self, action: &str) -> String {
        match self {
            ApiError::Transport(_) => {
                format!("Network error while trying to {}. Check your connection and try again.", action)
            }
            ApiError::Server { .. } | ApiError::Decode(_) => {
                format!("Something went wrong while trying to {}. Please try again.", action)
            }
            ApiError::Unauthorized(_) => "Your session has expired. Please sign in again.".to_string(),
            ApiError::Validation { fields, .. } => match self.server_message() {
                Some(m) => m.to_string(),
                None if !fields.is_empty() => "Please correct the highlighted fields.".to_string(),
                None => format!("Failed to {}.", action),
            },
            ApiError::Conflict(_) | ApiError::NotFound(_) => match self.server_message() {
                Some(m) => m.to_string(),
                None => format!("Failed to {}.", action),
            },
        }
    }
}

#[derive(Default)]
struct Envelope {
    message: Option<String>,
    fields: Vec<FieldError>,
}

// Accepts `{message}`, `{detail: "..."}`, `{detail: [{loc, msg}]}` and `{errors: {field: [..]}}`.
fn parse_envelope(body: &[u8]) -> Envelope {
    let mut env = Envelope::default();
    let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) else {
        let text = String::from_utf8_lossy(body).trim().to_string();
        if !text.is_empty() && text.len() <= 512 && !text.starts_with('<') { env.message = Some(text); }
        return env;
    };
    if let Some(m) = v.get("message").and_then(|m| m.as_str()) {
        env.message = Some(m.to_string());
    }
    match v.get("detail") {
        Some(serde_json::Value::String(s)) => {
            if env.message.is_none() { env.message = Some(s.clone()); }
        }
        Some(serde_json::Value::Array(entries)) => {
            for e in entries {
                let msg = e.get("msg").and_then(|m| m.as_str()).unwrap_or("invalid value");
                let field = e
                    .get("loc")
                    .and_then(|l| l.as_array())
                    .and_then(|l| l.iter().rev().find_map(|p| p.as_str()))
                    .unwrap_or("")
                    .to_string();
                env.fields.push(FieldError { field, message: msg.to_string() });
            }
        }
        _ => {}
    }
    if let Some(errors) = v.get("errors").and_then(|e| e.as_object()) {
        for (field, msgs) in errors {
            let message = match msgs {
                serde_json::Value::Array(a) => a.iter().filter_map(|m| m.as_str()).collect::<Vec<_>>().join("; "),
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.fields.push(FieldError { field: field.clone(), message });
        }
    }
    env
}
