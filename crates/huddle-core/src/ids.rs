//! Identifier newtypes.
//!
//! [`ConnectionId`] is an opaque, time-ordered handle (UUID v7) for one
//! client connection. [`RoomName`] is a human-chosen room name that has
//! passed validation; holding one proves the name is usable.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ChatError;

/// Maximum room name length in characters, matching the room store's
/// column width.
pub const MAX_ROOM_NAME_LEN: usize = 255;

/// Opaque identifier for one client connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new random ID (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7().simple()))
    }

    /// Return the inner string as a slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A validated room name.
///
/// Valid names are non-blank, at most [`MAX_ROOM_NAME_LEN`] characters,
/// and contain no `/`, `\` or control characters. `.` and `..` are
/// reserved. Surrounding whitespace is trimmed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
    /// Validate and wrap a room name.
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidRoomName("room name is blank".into()));
        }
        if name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(ChatError::InvalidRoomName(format!(
                "room name longer than {MAX_ROOM_NAME_LEN} characters"
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| *c == '/' || *c == '\\' || c.is_control())
        {
            return Err(ChatError::InvalidRoomName(format!(
                "room name contains forbidden character {bad:?}"
            )));
        }
        if name == "." || name == ".." {
            return Err(ChatError::InvalidRoomName(format!(
                "room name {name:?} is reserved"
            )));
        }
        Ok(Self(name.to_owned()))
    }

    /// Return the inner string as a slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for RoomName {
    type Error = ChatError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl<'de> Deserialize<'de> for RoomName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
