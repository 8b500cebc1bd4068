//! Snippet Collab - real-time collaborative snippet editing.
//!
//! - [`sync`]: replicated text document, update codec, wire protocol and
//!   the room/session synchronizer
//! - [`storage`]: snapshot and update-log persistence (Sled or in-memory)
//! - [`auth`]: who may join which room
//! - [`editor`]: binding between a local text control and a replica
//! - [`client`]: WebSocket client transport
//! - [`http`]: axum routes for the server binary

pub mod auth;
pub mod client;
pub mod config;
pub mod editor;
pub mod http;
pub mod storage;
pub mod sync;

pub use config::ServerConfig;
