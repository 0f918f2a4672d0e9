//! WebSocket connection handling: per-client state, frame sequencing,
//! routing, room fan-out, liveness and the session loop.

pub mod broadcast;
pub mod connection;
pub mod heartbeat;
pub mod protocol;
pub mod router;
pub mod session;
