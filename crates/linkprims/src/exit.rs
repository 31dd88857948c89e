use std::fmt;
use std::io;

use linkprims_engine::{EndpointError, EngineError};
use linkprims_session::SessionError;

// 64 is sysexits EX_USAGE; 124 matches timeout(1).
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const ENGINE_STOPPED: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::NotFound => USAGE,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn json_error(context: &str, err: serde_json::Error) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn engine_error(context: &str, err: EngineError) -> CliError {
    let code = match err {
        EngineError::Closed | EngineError::Terminated(_) => ENGINE_STOPPED,
        EngineError::Reentrant
        | EngineError::Spawn(_)
        | EngineError::Panicked
        | EngineError::Protocol(_) => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Engine(err) | SessionError::Endpoint(EndpointError::Engine(err)) => {
            engine_error(context, err)
        }
        SessionError::Endpoint(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        SessionError::InvalidOption(_) => CliError::new(USAGE, format!("{context}: {err}")),
        SessionError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use linkprims_engine::ErrorCondition;

    use super::*;

    #[test]
    fn termination_maps_to_engine_stopped() {
        let err = SessionError::Engine(EngineError::Terminated(ErrorCondition::internal_error(
            "gone",
        )));
        assert_eq!(session_error("open", err).code, ENGINE_STOPPED);

        let err = SessionError::Endpoint(EndpointError::Engine(EngineError::Closed));
        assert_eq!(session_error("open", err).code, ENGINE_STOPPED);
    }

    #[test]
    fn option_and_timeout_codes() {
        let err = SessionError::InvalidOption("capacity applies to receivers only".into());
        let cli = session_error("sender", err);
        assert_eq!(cli.code, USAGE);
        assert!(cli.message.starts_with("sender: invalid option"));

        let err = SessionError::Timeout(Duration::from_millis(10));
        assert_eq!(session_error("incoming", err).code, TIMEOUT);
    }

    #[test]
    fn closed_endpoint_is_plain_failure() {
        let err = SessionError::Endpoint(EndpointError::Closed);
        assert_eq!(session_error("sender", err).code, FAILURE);
    }
}
