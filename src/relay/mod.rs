//! Reference relay.
//!
//! An in-memory WebSocket service that sequences changes for each document,
//! holds the authoritative text and fans events out to every session joined
//! to that document.

pub mod room;
pub mod server;

pub use room::{DocumentRoom, Submission};
pub use server::{router, serve, RelayServer, RelayStats};

use thiserror::Error;

/// Relay errors, reported to clients as `error` events
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Document {0} is full")]
    DocumentFull(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
