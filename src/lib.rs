//! collab-core - real-time collaborative document editing core.
//!
//! The client side keeps one shared text document consistent across
//! concurrently connected editors:
//! - Typed change model and a simplified offset-adjusting conflict resolver
//! - Presence and cursor tracking with deterministic collaborator colours
//! - A connection manager with heartbeat and single-shot reconnect
//! - A coordinator that routes local and remote events over one dispatch loop
//! - Comment synchronization materialized from relay echoes
//!
//! The `relay` module is an in-memory reference relay speaking the same
//! JSON protocol over WebSocket.

pub mod config;
pub mod relay;
pub mod sync;

pub use config::{CollabConfig, RelayConfig};
pub use relay::RelayServer;
pub use sync::{
    change::{Change, ChangeKind, Edit, Position, Range},
    coordinator::{Coordinator, CoordinatorHandle, Decision, Notice},
    CollabError, CollabResult,
};
