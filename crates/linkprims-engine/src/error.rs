use crate::protocol::ErrorCondition;

/// Errors that can occur while submitting work to the engine.
///
/// Cloneable: the termination reason is stored once and handed to every
/// caller that was still waiting on the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine loop has stopped.
    #[error("engine closed")]
    Closed,

    /// The engine loop stopped because the transport failed.
    #[error("engine terminated: {0}")]
    Terminated(ErrorCondition),

    /// A blocking call was made from the engine thread itself.
    #[error("blocking engine call from the engine thread")]
    Reentrant,

    /// The engine thread could not be started.
    #[error("failed to spawn engine thread: {0}")]
    Spawn(String),

    /// The engine thread panicked.
    #[error("engine thread panicked")]
    Panicked,

    /// A protocol object was used in a state that does not allow it.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
