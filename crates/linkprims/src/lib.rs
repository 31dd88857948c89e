//! Session and link lifecycle primitives over a serialized protocol engine.
//!
//! # Crate Structure
//!
//! - [`engine`]: single-threaded protocol engine and its command injector
//! - [`session`]: connections, sessions, links and the incoming accept gate

/// Re-export engine types.
pub mod engine {
    pub use linkprims_engine::*;
}

/// Re-export session types.
pub mod session {
    pub use linkprims_session::*;
}
