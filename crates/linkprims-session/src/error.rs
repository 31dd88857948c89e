use linkprims_engine::{EndpointError, EngineError};

/// Errors returned by connection, session and link operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The engine could not run the request.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The endpoint the request targets is closed or failed.
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// An option does not apply to the endpoint being created.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// Nothing arrived on the incoming stream in time.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SessionError {
    /// The error to store on an endpoint that failed to go live because of `self`.
    pub fn into_endpoint_error(self) -> EndpointError {
        match self {
            Self::Engine(err) => EndpointError::Engine(err),
            Self::Endpoint(err) => err,
            other => EndpointError::Condition(linkprims_engine::ErrorCondition::internal_error(
                other.to_string(),
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
