//! `engine_shared`
//!
//! Networking libraries used by both client and server.
//!
//! Design goals:
//! - Explicit, bounds-checked wire formats; hostile input never panics.
//! - Registration tables built once, frozen before traffic flows.
//! - Traits for abstraction and dependency injection (sockets).
//! - No `unsafe`.

pub mod binary_data;
pub mod config;
pub mod net;
pub mod snapshot;
pub mod string_lists;
pub mod transport;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::binary_data::*;
    pub use crate::config::*;
    pub use crate::net::*;
    pub use crate::snapshot::*;
    pub use crate::string_lists::*;
    pub use crate::transport::*;
}
