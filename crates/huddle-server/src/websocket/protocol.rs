//! Per-connection frame sequencing.
//!
//! A file is sent as two consecutive frames: a JSON announcement carrying
//! the name, then one binary frame with the bytes. Between the two the
//! connection is in [`ProtocolState::AwaitingPayload`] and any other frame
//! is a fatal [`ChatError::UnexpectedFrame`]. A binary frame with no
//! pending announcement is fatal too.
//!
//! ```text
//!            Text ─────────────────────► Chat
//!   Idle ──  FileAnnounce ─► AwaitingPayload ── Binary ─► File, Idle
//!            Binary ─► UnexpectedFrame        └─ other ─► UnexpectedFrame
//! ```

use bytes::Bytes;
use huddle_core::{ChatError, InboundFrame};

/// Where a connection is in the frame sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolState {
    /// Accepting chat text or a file announcement.
    Idle,
    /// An announcement was accepted; the next frame must be binary.
    AwaitingPayload {
        /// Announced file name.
        filename: String,
        /// Announced size, if the client declared one.
        size: Option<u64>,
    },
}

impl ProtocolState {
    /// State label used in protocol errors.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingPayload { .. } => "awaiting file payload",
        }
    }
}

/// A fully received unit ready for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completed {
    /// Chat text.
    Chat(String),
    /// A complete announcement + payload pair.
    File(FileUpload),
}

/// A shared file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    /// Validated file name.
    pub filename: String,
    /// File contents.
    pub bytes: Bytes,
}

/// The file-pair state machine for one connection.
#[derive(Debug)]
pub struct FileProtocol {
    state: ProtocolState,
    max_file_bytes: u64,
}

impl FileProtocol {
    /// Start idle, accepting files up to `max_file_bytes`.
    pub fn new(max_file_bytes: u64) -> Self {
        Self {
            state: ProtocolState::Idle,
            max_file_bytes,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ProtocolState {
        &self.state
    }

    /// Feed one inbound frame.
    ///
    /// `Ok(None)` means the frame was absorbed (an accepted announcement).
    /// `MalformedFrame` errors leave the connection idle and usable;
    /// `UnexpectedFrame` errors are fatal.
    pub fn advance(&mut self, frame: InboundFrame) -> Result<Option<Completed>, ChatError> {
        match std::mem::replace(&mut self.state, ProtocolState::Idle) {
            ProtocolState::Idle => match frame {
                InboundFrame::Text { content } => Ok(Some(Completed::Chat(content))),
                InboundFrame::FileAnnounce { filename, size } => {
                    validate_filename(&filename)?;
                    if let Some(declared) = size {
                        self.check_size(declared)?;
                    }
                    self.state = ProtocolState::AwaitingPayload { filename, size };
                    Ok(None)
                }
                InboundFrame::BinaryPayload(_) => Err(ChatError::UnexpectedFrame {
                    state: ProtocolState::Idle.label(),
                    got: "binary",
                }),
            },
            ProtocolState::AwaitingPayload { filename, size } => {
                let got = frame.kind();
                let InboundFrame::BinaryPayload(bytes) = frame else {
                    self.state = ProtocolState::AwaitingPayload { filename, size };
                    return Err(ChatError::UnexpectedFrame {
                        state: self.state.label(),
                        got,
                    });
                };
                let actual = bytes.len() as u64;
                if let Some(declared) = size.filter(|declared| *declared != actual) {
                    return Err(ChatError::MalformedFrame(format!(
                        "file {filename:?} declared {declared} bytes but {actual} arrived"
                    )));
                }
                self.check_size(actual)?;
                Ok(Some(Completed::File(FileUpload { filename, bytes })))
            }
        }
    }

    /// Map a text frame that failed to parse onto the current state.
    ///
    /// While idle the parse error stands. While a payload is pending, any
    /// text frame breaks the pair, so it becomes `UnexpectedFrame`.
    pub fn reject_malformed(&self, err: ChatError) -> ChatError {
        match self.state {
            ProtocolState::Idle => err,
            ProtocolState::AwaitingPayload { .. } => ChatError::UnexpectedFrame {
                state: self.state.label(),
                got: "text",
            },
        }
    }

    fn check_size(&self, bytes: u64) -> Result<(), ChatError> {
        if bytes > self.max_file_bytes {
            return Err(ChatError::MalformedFrame(format!(
                "file of {bytes} bytes exceeds the {} byte limit",
                self.max_file_bytes
            )));
        }
        Ok(())
    }
}

/// Reject names that are blank or could escape a storage directory.
pub fn validate_filename(name: &str) -> Result<(), ChatError> {
    if name.trim().is_empty() {
        return Err(ChatError::MalformedFrame("file name is blank".into()));
    }
    if name == "." || name == ".." {
        return Err(ChatError::MalformedFrame(format!(
            "file name {name:?} is reserved"
        )));
    }
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(ChatError::MalformedFrame(format!(
            "file name {name:?} contains a path separator or control character"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const LIMIT: u64 = 1024;

    fn announce(name: &str, size: Option<u64>) -> InboundFrame {
        InboundFrame::FileAnnounce {
            filename: name.into(),
            size,
        }
    }

    fn text(s: &str) -> InboundFrame {
        InboundFrame::Text { content: s.into() }
    }

    fn binary(data: &'static [u8]) -> InboundFrame {
        InboundFrame::BinaryPayload(Bytes::from_static(data))
    }

    #[test]
    fn text_passes_through_while_idle() {
        let mut proto = FileProtocol::new(LIMIT);
        assert_eq!(
            proto.advance(text("hi")).unwrap(),
            Some(Completed::Chat("hi".into()))
        );
        assert_eq!(proto.state(), &ProtocolState::Idle);
    }

    #[test]
    fn file_pair_completes() {
        let mut proto = FileProtocol::new(LIMIT);
        assert_eq!(proto.advance(announce("a.png", None)).unwrap(), None);
        assert_matches!(proto.state(), ProtocolState::AwaitingPayload { filename, .. } if filename == "a.png");

        let done = proto.advance(binary(b"\x89PNG")).unwrap();
        assert_eq!(
            done,
            Some(Completed::File(FileUpload {
                filename: "a.png".into(),
                bytes: Bytes::from_static(b"\x89PNG"),
            }))
        );
        assert_eq!(proto.state(), &ProtocolState::Idle);
    }

    #[test]
    fn binary_while_idle_is_unexpected() {
        let mut proto = FileProtocol::new(LIMIT);
        let err = proto.advance(binary(b"x")).unwrap_err();
        assert_eq!(
            err,
            ChatError::UnexpectedFrame {
                state: "idle",
                got: "binary"
            }
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn text_while_awaiting_is_unexpected() {
        let mut proto = FileProtocol::new(LIMIT);
        let _ = proto.advance(announce("a.txt", None)).unwrap();
        let err = proto.advance(text("oops")).unwrap_err();
        assert_eq!(
            err,
            ChatError::UnexpectedFrame {
                state: "awaiting file payload",
                got: "text"
            }
        );
    }

    #[test]
    fn second_announcement_is_unexpected() {
        let mut proto = FileProtocol::new(LIMIT);
        let _ = proto.advance(announce("a.txt", None)).unwrap();
        assert_matches!(
            proto.advance(announce("b.txt", None)),
            Err(ChatError::UnexpectedFrame { got: "file announcement", .. })
        );
    }

    #[test]
    fn malformed_text_while_awaiting_breaks_the_pair() {
        let mut proto = FileProtocol::new(LIMIT);
        let parse_err = ChatError::MalformedFrame("bad json".into());
        assert_eq!(proto.reject_malformed(parse_err.clone()), parse_err);

        let _ = proto.advance(announce("a.txt", None)).unwrap();
        assert_matches!(
            proto.reject_malformed(parse_err),
            ChatError::UnexpectedFrame { got: "text", .. }
        );
    }

    #[test]
    fn oversized_announcement_rejected_and_stays_idle() {
        let mut proto = FileProtocol::new(LIMIT);
        assert_matches!(
            proto.advance(announce("big.bin", Some(LIMIT + 1))),
            Err(ChatError::MalformedFrame(_))
        );
        assert_eq!(proto.state(), &ProtocolState::Idle);
        // next frame is treated normally
        assert!(proto.advance(text("still here")).is_ok());
    }

    #[test]
    fn size_mismatch_rejected_and_resets() {
        let mut proto = FileProtocol::new(LIMIT);
        let _ = proto.advance(announce("a.bin", Some(10))).unwrap();
        assert_matches!(
            proto.advance(binary(b"short")),
            Err(ChatError::MalformedFrame(_))
        );
        assert_eq!(proto.state(), &ProtocolState::Idle);
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut proto = FileProtocol::new(4);
        let _ = proto.advance(announce("a.bin", None)).unwrap();
        assert_matches!(
            proto.advance(binary(b"too long")),
            Err(ChatError::MalformedFrame(_))
        );
        assert_eq!(proto.state(), &ProtocolState::Idle);
    }

    #[test]
    fn empty_payload_accepted() {
        let mut proto = FileProtocol::new(LIMIT);
        let _ = proto.advance(announce("empty.txt", Some(0))).unwrap();
        assert_matches!(
            proto.advance(binary(b"")),
            Ok(Some(Completed::File(FileUpload { bytes, .. }))) if bytes.is_empty()
        );
    }

    #[test]
    fn bad_filenames_rejected() {
        for name in ["", "   ", ".", "..", "../etc/passwd", "a/b", "a\\b", "nul\0"] {
            let mut proto = FileProtocol::new(LIMIT);
            assert_matches!(
                proto.advance(announce(name, None)),
                Err(ChatError::MalformedFrame(_)),
                "{name:?} should be rejected"
            );
            assert_eq!(proto.state(), &ProtocolState::Idle);
        }
    }

    #[test]
    fn ordinary_filenames_accepted() {
        for name in ["report.pdf", "no-extension", ".hidden", "spaced name.txt", "ünïcode.md"] {
            assert!(validate_filename(name).is_ok(), "{name:?}");
        }
    }
}
