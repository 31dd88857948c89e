//! Open/close/error state shared by every protocol-visible object.
//!
//! State is written only from the engine thread but may be read from any
//! thread. The error is set at most once and never cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::error::EngineError;
use crate::protocol::ErrorCondition;

/// Why an endpoint stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// Closed normally by either side.
    #[error("endpoint closed")]
    Closed,

    /// Closed with an error condition, by either side.
    #[error("{0}")]
    Condition(ErrorCondition),

    /// The engine behind the endpoint stopped.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The incoming request behind the endpoint was already accepted or rejected.
    #[error("incoming endpoint already accepted or rejected")]
    AlreadyAccepted,
}

impl EndpointError {
    /// Map an optional close condition to the error stored on close.
    pub fn from_condition(condition: Option<ErrorCondition>) -> Self {
        match condition {
            Some(condition) => Self::Condition(condition),
            None => Self::Closed,
        }
    }

    /// Condition carried on the wire when closing with this error, if any.
    pub fn condition(&self) -> Option<ErrorCondition> {
        match self {
            Self::Closed => None,
            Self::Condition(condition) => Some(condition.clone()),
            Self::Engine(EngineError::Terminated(condition)) => Some(condition.clone()),
            other => Some(ErrorCondition::internal_error(other.to_string())),
        }
    }
}

/// Lifecycle state of a connection, session or link.
#[derive(Debug)]
pub struct EndpointState {
    id: String,
    error: OnceLock<EndpointError>,
    local_closed: AtomicBool,
    remote_closed: AtomicBool,
}

impl EndpointState {
    /// Create open state with a diagnostic identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: OnceLock::new(),
            local_closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
        }
    }

    /// Create state that is already in error, for endpoints that never went live.
    pub fn failed(id: impl Into<String>, err: EndpointError) -> Self {
        let state = Self::new(id);
        let _ = state.error.set(err);
        state
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stored error, if the endpoint has been closed or failed.
    pub fn error(&self) -> Option<EndpointError> {
        self.error.get().cloned()
    }

    /// `Ok(())` while the endpoint is usable, otherwise the stored error.
    pub fn check(&self) -> Result<(), EndpointError> {
        match self.error.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record an error. Returns false if an error was already stored.
    pub fn set_error(&self, err: EndpointError) -> bool {
        let stored = self.error.set(err).is_ok();
        if stored {
            tracing::trace!(endpoint = %self.id, "endpoint error set");
        }
        stored
    }

    /// Mark the local side closed, storing `err` (or [`EndpointError::Closed`]).
    ///
    /// Returns true on the first local close.
    pub fn close_local(&self, err: Option<EndpointError>) -> bool {
        self.set_error(err.unwrap_or(EndpointError::Closed));
        !self.local_closed.swap(true, Ordering::AcqRel)
    }

    /// Mark the remote side closed, storing `err` (or [`EndpointError::Closed`]).
    ///
    /// Returns true on the first remote close.
    pub fn close_remote(&self, err: Option<EndpointError>) -> bool {
        self.set_error(err.unwrap_or(EndpointError::Closed));
        !self.remote_closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_local_closed(&self) -> bool {
        self.local_closed.load(Ordering::Acquire)
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::Acquire)
    }

    /// True once both sides have closed.
    pub fn is_closed(&self) -> bool {
        self.is_local_closed() && self.is_remote_closed()
    }
}

/// Common behaviour of protocol-visible objects.
pub trait Endpoint {
    /// Shared lifecycle state.
    fn state(&self) -> &EndpointState;

    /// Human-readable identifier.
    fn id(&self) -> &str {
        self.state().id()
    }

    /// Stored error, if closed or failed.
    fn error(&self) -> Option<EndpointError> {
        self.state().error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_set_once() {
        let state = EndpointState::new("session-1");
        assert!(state.check().is_ok());

        assert!(state.set_error(EndpointError::Closed));
        assert!(!state.set_error(EndpointError::AlreadyAccepted));
        assert_eq!(state.error(), Some(EndpointError::Closed));
    }

    #[test]
    fn local_close_keeps_first_error() {
        let state = EndpointState::new("link-3");
        let cond = ErrorCondition::new("amqp:resource-deleted", "gone");
        state.close_remote(Some(EndpointError::Condition(cond.clone())));

        assert!(state.close_local(None));
        assert!(!state.close_local(None));
        assert_eq!(state.error(), Some(EndpointError::Condition(cond)));
        assert!(state.is_closed());
    }

    #[test]
    fn half_closed_is_not_closed() {
        let state = EndpointState::new("session-2");
        state.close_local(None);
        assert!(state.is_local_closed());
        assert!(!state.is_remote_closed());
        assert!(!state.is_closed());
        assert_eq!(state.check(), Err(EndpointError::Closed));
    }

    #[test]
    fn failed_state_starts_in_error() {
        let state = EndpointState::failed("session-9", EndpointError::AlreadyAccepted);
        assert_eq!(state.error(), Some(EndpointError::AlreadyAccepted));
        assert!(!state.is_local_closed());
    }

    #[test]
    fn condition_for_wire() {
        assert_eq!(EndpointError::Closed.condition(), None);
        let cond = ErrorCondition::new("x:y", "z");
        assert_eq!(
            EndpointError::Condition(cond.clone()).condition(),
            Some(cond)
        );
        let internal = EndpointError::Engine(EngineError::Closed)
            .condition()
            .expect("engine errors carry a condition");
        assert_eq!(internal.name, ErrorCondition::INTERNAL_ERROR);
    }
}
