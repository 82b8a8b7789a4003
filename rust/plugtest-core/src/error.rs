//! Error types shared by both ends of a session.

use std::fmt;

use rmpv::Value;
use serde::{Deserialize, Serialize};

/// Transport-level errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),
}

/// Errors surfaced by [`RpcSession`](crate::RpcSession) operations and dispatch handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The peer answered a call with an error payload.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// No handler is registered under this name.
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    /// Arguments did not have the shape the method expects.
    #[error("invalid arguments: {0}")]
    InvalidArgument(String),
    /// The session was torn down before the call completed.
    #[error("session closed")]
    SessionClosed,
    /// A response arrived for an id nobody is waiting on.
    #[error("no pending call for response id {0}")]
    UnexpectedResponse(u32),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("deserialize error: {0}")]
    Deserialize(String),
}

impl RpcError {
    /// Shorthand for a plain application failure raised by a handler.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Remote(RemoteError::new(RemoteError::DEFAULT_KIND, message))
    }

    /// Convert into the structured form that travels in a response's error slot.
    pub fn to_remote(&self) -> RemoteError {
        let kind = match self {
            Self::Remote(remote) => return remote.clone(),
            Self::UnknownMethod(_) => "UnknownMethod",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::SessionClosed => "SessionClosed",
            Self::UnexpectedResponse(_) => "UnexpectedResponse",
            Self::Transport(_) => "TransportError",
            Self::Serialize(_) => "SerializeError",
            Self::Deserialize(_) => "DeserializeError",
        };
        let remote = RemoteError::new(kind, self.to_string());
        match std::error::Error::source(self) {
            Some(source) => remote.with_cause(RemoteError::new(
                RemoteError::DEFAULT_KIND,
                source.to_string(),
            )),
            None => remote,
        }
    }
}

/// An error that crossed the process boundary.
///
/// On the wire it is a JSON string holding `{kind, message, cause?}`. Values the
/// peer sends that are not in that shape are kept as their plain string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<RemoteError>>,
}

impl RemoteError {
    pub const DEFAULT_KIND: &'static str = "Error";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Encode for the error slot of a response.
    pub fn to_value(&self) -> Value {
        match serde_json::to_string(self) {
            Ok(json) => Value::from(json),
            // Only string fields: serialization cannot fail, but never drop the message.
            Err(_) => Value::from(self.message.as_str()),
        }
    }

    /// Rebuild from whatever the peer put in the error slot.
    pub fn from_value(value: &Value) -> Self {
        if let Some(text) = value.as_str() {
            return serde_json::from_str::<RemoteError>(text)
                .unwrap_or_else(|_| Self::new(Self::DEFAULT_KIND, text));
        }
        Self::new(Self::DEFAULT_KIND, plain_string(value))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_survives_the_error_slot() {
        let err = RemoteError::new("TypeError", "bad input")
            .with_cause(RemoteError::new("Error", "root cause"));
        let decoded = RemoteError::from_value(&err.to_value());
        assert_eq!(decoded, err);
        assert_eq!(
            std::error::Error::source(&decoded).map(|e| e.to_string()),
            Some("Error: root cause".to_string())
        );
    }

    #[test]
    fn plain_string_error_becomes_generic_error() {
        let decoded = RemoteError::from_value(&Value::from("something broke"));
        assert_eq!(decoded.kind, "Error");
        assert_eq!(decoded.message, "something broke");
    }

    #[test]
    fn non_string_error_uses_its_display_form() {
        let decoded = RemoteError::from_value(&Value::from(42));
        assert_eq!(decoded.message, "42");
    }

    #[test]
    fn json_that_is_not_an_error_object_is_kept_verbatim() {
        let decoded = RemoteError::from_value(&Value::from("[1, 2]"));
        assert_eq!(decoded.message, "[1, 2]");
    }

    #[test]
    fn local_errors_keep_their_kind_remotely() {
        let remote = RpcError::UnknownMethod("nope".into()).to_remote();
        assert_eq!(remote.kind, "UnknownMethod");
        assert_eq!(remote.message, "unknown method 'nope'");
        assert!(remote.cause.is_none());
    }
}
