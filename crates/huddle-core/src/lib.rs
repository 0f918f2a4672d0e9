//! # huddle-core
//!
//! Foundation types shared by every huddle crate:
//!
//! - **IDs**: [`ConnectionId`] branded newtype and the validated [`RoomName`]
//! - **Frames**: [`InboundFrame`] parsed from the wire, [`OutboundFrame`] sent back
//! - **Errors**: [`ChatError`] taxonomy with machine-readable codes
//! - **Logging**: `tracing` subscriber setup and a capture layer for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod frames;
pub mod ids;
pub mod logging;

pub use errors::ChatError;
pub use frames::{ErrorBody, InboundFrame, OutboundFrame};
pub use ids::{ConnectionId, RoomName};
