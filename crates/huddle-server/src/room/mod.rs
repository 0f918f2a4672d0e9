//! Room membership.

pub mod registry;

pub use registry::{RoomHandle, RoomRegistry};
