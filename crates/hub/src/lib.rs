//! Realtime connection hub.
//!
//! Tracks which user owns which live WebSocket connections, fans typed
//! [`Event`]s out to every connection of a user (or every member of a
//! chat), and keeps idle connections alive with ping/pong heartbeats.
//!
//! Transport upgrade and authentication happen elsewhere: callers hand
//! [`Hub::register`] an established WebSocket stream together with the
//! already-validated user id.

mod chat;
mod config;
mod connection;
mod directory;
mod handler;
mod hub;
mod registry;
mod types;

#[cfg(test)]
mod testutil;

pub use chat::ChatRelay;
pub use config::HubConfig;
pub use connection::ConnectionHandle;
pub use directory::{ChatDirectory, DirectoryError, DirectoryFuture, InMemoryDirectory};
pub use flippy_protocol::{Event, EventType, UnreadCountPayload};
pub use handler::{EventHandler, HandlerFuture, NoopHandler};
pub use hub::Hub;
pub use registry::Registry;
pub use types::{ConnectionId, InboundContext, UserId};

/// Errors produced by the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid hub configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("hub is shut down")]
    ShutDown,

    #[error("no chat directory configured")]
    NoDirectory,

    #[error("chat directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
