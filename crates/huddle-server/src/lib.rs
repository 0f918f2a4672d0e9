//! # huddle-server
//!
//! Multi-room real-time chat engine behind an Axum HTTP + `WebSocket` server.
//!
//! - [`room::RoomRegistry`]: room name to member set, sharded locking, snapshots
//! - [`websocket::connection`]: per-client send queue, close state, frame reader
//! - [`websocket::protocol`]: the two-frame file-send state machine
//! - [`websocket::router`]: formats chat text and stores shared files
//! - [`websocket::broadcast`]: fan-out to a room snapshot with failure isolation
//! - [`websocket::session`]: one task per connection from upgrade to cleanup
//! - [`auth`] and [`storage`]: seams to the excluded auth and file services
//! - HTTP endpoints: `/ws/chat/{room}/`, `/health`, `/metrics`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod health;
pub mod metrics;
pub mod room;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod websocket;

pub use config::ServerConfig;
pub use server::ChatServer;
