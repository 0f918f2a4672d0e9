//! Turns completed inbound units into room broadcasts.
//!
//! Chat text is prefixed with the sender's display name; a completed file
//! pair is handed to the [`FileStore`] and announced with the URL it
//! returns. Content is passed through unmodified (no HTML escaping).

use std::sync::Arc;

use chrono::Local;
use huddle_core::{ChatError, OutboundFrame, RoomName};
use metrics::counter;
use tracing::{debug, error};

use super::protocol::{Completed, FileUpload};
use crate::metrics::FILES_SHARED_TOTAL;
use crate::storage::FileStore;

/// Routing decision for one completed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Send this frame to every member of the sender's room.
    Broadcast(OutboundFrame),
    /// Nothing to send (empty chat text).
    Ignored,
}

/// Formats chat text and stores shared files.
pub struct MessageRouter {
    store: Arc<dyn FileStore>,
    timestamps: bool,
}

impl MessageRouter {
    /// Create a router. With `timestamps` on, every message gets a
    /// ` (HH:MM)` suffix in server local time.
    pub fn new(store: Arc<dyn FileStore>, timestamps: bool) -> Self {
        Self { store, timestamps }
    }

    /// Route one unit from `sender` in `room`.
    ///
    /// Storage failures come back as `StorageFailed`, meant for the sender
    /// only; the room sees nothing.
    pub async fn route(
        &self,
        room: &RoomName,
        sender: &str,
        unit: Completed,
    ) -> Result<Routed, ChatError> {
        match unit {
            Completed::Chat(content) => {
                if content.is_empty() {
                    debug!(room = %room, sender, "ignoring empty message");
                    return Ok(Routed::Ignored);
                }
                Ok(Routed::Broadcast(self.chat_frame(sender, &content)))
            }
            Completed::File(upload) => self.share_file(room, sender, upload).await,
        }
    }

    async fn share_file(
        &self,
        room: &RoomName,
        sender: &str,
        upload: FileUpload,
    ) -> Result<Routed, ChatError> {
        let FileUpload { filename, bytes } = upload;
        let size = bytes.len();
        let url = self
            .store
            .store(room, &filename, bytes)
            .await
            .map_err(|e| {
                error!(room = %room, sender, file = %filename, error = %e, "file storage failed");
                ChatError::StorageFailed(e.to_string())
            })?;
        counter!(FILES_SHARED_TOTAL).increment(1);
        debug!(room = %room, sender, file = %filename, size, url = %url, "file shared");
        let text = format!("{sender} shared a file: {filename} ({url})");
        Ok(Routed::Broadcast(self.finish(text)))
    }

    fn chat_frame(&self, sender: &str, content: &str) -> OutboundFrame {
        self.finish(format!("{sender}: {content}"))
    }

    fn finish(&self, mut text: String) -> OutboundFrame {
        if self.timestamps {
            text.push_str(&format!(" ({})", Local::now().format("%H:%M")));
        }
        OutboundFrame::message(text)
    }
}
