//! Wire frames.
//!
//! Clients send JSON text frames of two shapes, chat or file announcement,
//! plus raw binary frames carrying file bytes. Parsing is a single
//! tagged step: anything outside the known shapes is a
//! [`ChatError::MalformedFrame`].
//!
//! ```text
//! {"message": "hello"}                                   -> Text
//! {"file_name": "a.png", "file_content": .., "file_size": 42} -> FileAnnounce
//! <binary>                                               -> BinaryPayload
//! ```
//!
//! The server answers with `{"message": "..."}` broadcasts, or with
//! `{"error": {"code": .., "message": ..}}` sent to one client only.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::ChatError;

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Chat text.
    Text {
        /// Message body, unmodified.
        content: String,
    },
    /// First half of a file pair. The next frame must be a
    /// [`InboundFrame::BinaryPayload`].
    FileAnnounce {
        /// Client-supplied file name.
        filename: String,
        /// Declared size in bytes, when the client sent one.
        size: Option<u64>,
    },
    /// Raw file bytes, second half of a file pair.
    BinaryPayload(Bytes),
}

impl InboundFrame {
    /// Parse a JSON text frame.
    pub fn parse_text(text: &str) -> Result<Self, ChatError> {
        let wire: WireFrame = serde_json::from_str(text).map_err(|e| {
            ChatError::MalformedFrame(format!(
                "expected {{\"message\"}} or {{\"file_name\"}} object: {e}"
            ))
        })?;
        Ok(match wire {
            WireFrame::Chat { message } => Self::Text { content: message },
            WireFrame::File {
                file_name,
                file_size,
                file_content: _,
            } => Self::FileAnnounce {
                filename: file_name,
                size: file_size,
            },
        })
    }

    /// Short frame kind for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::FileAnnounce { .. } => "file announcement",
            Self::BinaryPayload(_) => "binary",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireFrame {
    Chat {
        message: String,
    },
    File {
        file_name: String,
        #[serde(default)]
        file_size: Option<u64>,
        #[serde(default)]
        #[allow(dead_code)]
        file_content: Option<serde_json::Value>,
    },
}

/// Error details carried by an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code, see [`ChatError::code`].
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// A frame sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    /// A formatted room message, broadcast verbatim.
    Message {
        /// Formatted text, e.g. `alice: hello`.
        message: String,
    },
    /// An error addressed to a single client.
    Error {
        /// Error details.
        error: ErrorBody,
    },
}

impl OutboundFrame {
    /// Build a message frame.
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message {
            message: text.into(),
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> String {
        // Both variants are plain string maps; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&ChatError> for OutboundFrame {
    fn from(err: &ChatError) -> Self {
        Self::Error {
            error: ErrorBody {
                code: err.code().to_owned(),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_chat() {
        let frame = InboundFrame::parse_text(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Text {
                content: "hello".into()
            }
        );
    }

    #[test]
    fn parse_chat_keeps_markup() {
        let frame = InboundFrame::parse_text(r#"{"message":"<b>hi</b>"}"#).unwrap();
        assert_matches!(frame, InboundFrame::Text { content } if content == "<b>hi</b>");
    }

    #[test]
    fn parse_file_announcement() {
        let frame =
            InboundFrame::parse_text(r#"{"file_name":"a.png","file_content":"pending"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::FileAnnounce {
                filename: "a.png".into(),
                size: None
            }
        );
    }

    #[test]
    fn parse_file_announcement_with_size() {
        let frame = InboundFrame::parse_text(r#"{"file_name":"a.png","file_size":12}"#).unwrap();
        assert_matches!(frame, InboundFrame::FileAnnounce { size: Some(12), .. });
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert_matches!(
            InboundFrame::parse_text("not json"),
            Err(ChatError::MalformedFrame(_))
        );
    }

    #[test]
    fn unknown_shape_is_malformed() {
        assert_matches!(
            InboundFrame::parse_text(r#"{"msg":"hello"}"#),
            Err(ChatError::MalformedFrame(_))
        );
        assert_matches!(
            InboundFrame::parse_text("[1,2,3]"),
            Err(ChatError::MalformedFrame(_))
        );
    }

    #[test]
    fn wrong_field_type_is_malformed() {
        assert_matches!(
            InboundFrame::parse_text(r#"{"message":42}"#),
            Err(ChatError::MalformedFrame(_))
        );
        assert_matches!(
            InboundFrame::parse_text(r#"{"file_name":"a","file_size":-1}"#),
            Err(ChatError::MalformedFrame(_))
        );
    }

    #[test]
    fn kinds() {
        assert_eq!(InboundFrame::Text { content: String::new() }.kind(), "text");
        assert_eq!(InboundFrame::BinaryPayload(Bytes::new()).kind(), "binary");
    }

    #[test]
    fn message_frame_json() {
        let json = OutboundFrame::message("alice: hello").to_json();
        assert_eq!(json, r#"{"message":"alice: hello"}"#);
    }

    #[test]
    fn error_frame_json() {
        let frame = OutboundFrame::from(&ChatError::StorageFailed("disk full".into()));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["error"]["code"], "STORAGE_FAILED");
        assert_eq!(value["error"]["message"], "file storage failed: disk full");
        assert!(value.get("message").is_none());
    }
}
