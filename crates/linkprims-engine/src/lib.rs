//! Single-threaded protocol engine with serialized command injection.
//!
//! This is the lowest layer of linkprims. The engine owns all protocol state
//! on one dedicated thread. Everything else reaches that state by submitting
//! closures through the [`Engine`] handle:
//! - [`Engine::inject`] queues work and returns immediately
//! - [`Engine::inject_wait`] queues work and blocks until it has run
//!
//! Peer-originated [`Event`]s are delivered on the same queue, so injected
//! work and protocol events never run concurrently.

pub mod endpoint;
pub mod error;
pub mod event;
pub mod injector;
pub mod protocol;

pub use endpoint::{Endpoint, EndpointError, EndpointState};
pub use error::{EngineError, Result};
pub use event::{Event, EventHandler, EventSender};
pub use injector::{Engine, EngineConfig};
pub use protocol::{
    Action, ErrorCondition, LinkHandle, LinkRole, ProtoState, Protocol, SessionHandle,
    DEFAULT_ACTION_LIMIT,
};
