//! Room fan-out.
//!
//! A broadcast serializes the frame once, takes a member snapshot from the
//! registry and queues the frame on every member without waiting. One
//! member's failure never stops delivery to the rest:
//!
//! - full queue: the frame is dropped for that member and logged
//! - closed queue: the member is handed to a background task that closes
//!   it and removes it from the room

use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use huddle_core::{OutboundFrame, RoomName};
use metrics::counter;
use tracing::{debug, warn};

use super::connection::{Connection, SendError};
use crate::metrics::{BROADCAST_DROPS_TOTAL, BROADCAST_EVICTIONS_TOTAL, BROADCASTS_TOTAL};
use crate::room::RoomRegistry;

/// What happened to one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members in the snapshot.
    pub recipients: usize,
    /// Members the frame was queued for.
    pub delivered: usize,
    /// Members whose queue was full.
    pub dropped: usize,
    /// Members found closed and scheduled for removal.
    pub evicted: usize,
}

/// Sends frames to every member of a room.
pub struct BroadcastDispatcher {
    registry: Arc<RoomRegistry>,
}

impl BroadcastDispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `frame` to every current member of `room`, sender included.
    ///
    /// Must be called from within a Tokio runtime when members may be
    /// closed, since evictions run on a spawned task.
    pub fn broadcast(&self, room: &RoomName, frame: &OutboundFrame) -> BroadcastReport {
        let payload: Utf8Bytes = frame.to_json().into();
        let members = self.registry.members(room);
        let mut report = BroadcastReport {
            recipients: members.len(),
            ..BroadcastReport::default()
        };

        for member in members {
            match member.send_raw(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(SendError::QueueFull) => {
                    report.dropped += 1;
                    counter!(BROADCAST_DROPS_TOTAL).increment(1);
                    warn!(
                        room = %room,
                        conn_id = %member.id(),
                        dropped_total = member.drop_count(),
                        "send queue full, dropping frame"
                    );
                }
                Err(SendError::Closed) => {
                    report.evicted += 1;
                    self.evict(member);
                }
            }
        }

        counter!(BROADCASTS_TOTAL).increment(1);
        debug!(
            room = %room,
            recipients = report.recipients,
            delivered = report.delivered,
            dropped = report.dropped,
            evicted = report.evicted,
            "broadcast to room"
        );
        report
    }

    fn evict(&self, member: Arc<Connection>) {
        counter!(BROADCAST_EVICTIONS_TOTAL).increment(1);
        let registry = self.registry.clone();
        drop(tokio::spawn(async move {
            // Whoever closed the connection first performs the leave.
            if registry.disconnect(&member) {
                debug!(room = %member.room(), conn_id = %member.id(), "evicted closed member");
            }
        }));
    }
}
