//! `engine_client`
//!
//! Client peer of the replication layer:
//! - Connection handshake and descriptor negotiation
//! - In-order reliable message delivery
//! - String list mirror
//! - Delta snapshot application against stored baselines

pub mod baselines;
pub mod client;

pub use client::{ClientEvent, ClientState, GameClient};
