//! `engine_server`
//!
//! Server side of the replication layer:
//! - Client sessions and admission
//! - Message dispatch through registration tables
//! - Per-client delta snapshots of replicated objects
//! - The transport server tying them to a datagram socket
//!
//! Networking model: one UDP socket, connectionless admission, per-client
//! reliable ordered messages plus unreliable snapshots.

pub mod channel;
pub mod dispatcher;
pub mod object_lists;
pub mod server;
pub mod sessions;

pub use server::{ServerState, TransportServer};
