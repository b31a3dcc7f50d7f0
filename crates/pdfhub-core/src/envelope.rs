//! JSON envelope carried inside WebSocket text frames.
//!
//! # Message flow
//!
//! ```text
//! Browser → Backend:  {"type":"open_pdf","request_id":"r1","data":{...}}   → Request
//! Backend → Browser:  Reply::Success / Reply::Error                         → JSON text
//! ```
//!
//! Every inbound object names its handler in `"type"`.  `"request_id"` is
//! optional; when present it is echoed verbatim on the reply so the browser
//! can match asynchronous answers to the calls that caused them.
//!
//! Replies are an internally tagged enum, so serde produces exactly the wire
//! shape the browser expects:
//!
//! ```json
//! {"type":"success","request_id":"r1","data":{"original_type":"open_pdf","result":{}}}
//! {"type":"error","data":{"code":"UNKNOWN_TYPE","message":"...","original_type":"nope"}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `original_type` used when the request never got far enough to name one.
pub const UNKNOWN_ORIGINAL_TYPE: &str = "unknown";

// ── Error codes ───────────────────────────────────────────────────────────────

/// Stable, machine-checkable error codes.
///
/// Clients branch on the code only; the accompanying message is for humans.
/// Handlers are free to report codes outside this list, which is why
/// [`ErrorData::code`] is a plain string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The frame was not JSON, not an object, or had no string `type`.
    InvalidMessage,
    /// No handler is registered for `type`.
    UnknownType,
    /// The handler failed unexpectedly (including panics).
    InternalError,
    /// The handler rejected its `data` payload.
    InvalidParams,
    FileExists,
    FileNotFound,
    PermissionDenied,
}

impl ErrorCode {
    /// The wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnknownType => "UNKNOWN_TYPE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::FileExists => "FILE_EXISTS",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// The `"type"` discriminator used to pick a handler.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Handler input; `{}` when the field is absent.
    #[serde(default = "empty_object")]
    pub data: Value,
}

/// Why an inbound text could not be turned into a [`Request`].
///
/// Carries whatever correlation could still be recovered so the error reply
/// can be matched by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    pub reason: String,
    pub request_id: Option<String>,
    pub original_type: Option<String>,
}

impl Request {
    /// Decodes one inbound text payload.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMessage`] when the text is not JSON, is not an object,
    /// lacks a string `type`, or carries a non-string `request_id`.
    pub fn decode(raw: &str) -> Result<Self, InvalidMessage> {
        let value: Value = serde_json::from_str(raw).map_err(|e| InvalidMessage {
            reason: format!("invalid JSON: {e}"),
            request_id: None,
            original_type: None,
        })?;

        let Value::Object(mut object) = value else {
            return Err(InvalidMessage {
                reason: "message must be a JSON object".to_string(),
                request_id: None,
                original_type: None,
            });
        };

        let request_id = match object.remove("request_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(_) => {
                return Err(InvalidMessage {
                    reason: "request_id must be a string".to_string(),
                    request_id: None,
                    original_type: string_field(&object, "type"),
                })
            }
        };

        let kind = match object.remove("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            _ => {
                return Err(InvalidMessage {
                    reason: "missing or non-string \"type\" field".to_string(),
                    request_id,
                    original_type: None,
                })
            }
        };

        let data = object.remove("data").unwrap_or_else(empty_object);

        Ok(Self {
            kind,
            request_id,
            data,
        })
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Payload of a success reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessData {
    pub original_type: String,
    pub result: Value,
}

/// Payload of an error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    pub original_type: String,
}

/// The one reply sent for every inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reply {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: SuccessData,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: ErrorData,
    },
}

impl Reply {
    pub fn success(request_id: Option<String>, original_type: impl Into<String>, result: Value) -> Self {
        Reply::Success {
            request_id,
            data: SuccessData {
                original_type: original_type.into(),
                result,
            },
        }
    }

    pub fn error(
        request_id: Option<String>,
        original_type: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Reply::Error {
            request_id,
            data: ErrorData {
                code: code.into(),
                message: message.into(),
                original_type: original_type.into(),
            },
        }
    }

    /// Builds the `INVALID_MESSAGE` reply for an undecodable request.
    pub fn invalid(invalid: InvalidMessage) -> Self {
        Reply::error(
            invalid.request_id,
            invalid
                .original_type
                .unwrap_or_else(|| UNKNOWN_ORIGINAL_TYPE.to_string()),
            ErrorCode::InvalidMessage.as_str(),
            invalid.reason,
        )
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Reply::Success { request_id, .. } | Reply::Error { request_id, .. } => {
                request_id.as_deref()
            }
        }
    }

    /// The `type` of the request this reply answers.
    pub fn original_type(&self) -> &str {
        match self {
            Reply::Success { data, .. } => &data.original_type,
            Reply::Error { data, .. } => &data.original_type,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success { .. })
    }

    /// The error code, or `None` for a success reply.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Reply::Error { data, .. } => Some(&data.code),
            Reply::Success { .. } => None,
        }
    }

    /// Serialises the reply to its JSON wire text.
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` serialisation failures.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The application-level heartbeat the server sends on every connection.
///
/// This is an ordinary text message, not a protocol ping frame.
pub fn heartbeat_message() -> String {
    serde_json::json!({ "type": "ping" }).to_string()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
