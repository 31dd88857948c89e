use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use linkprims_engine::{
    Action, Endpoint, EndpointState, Engine, EngineConfig, EngineError, ErrorCondition,
    EventSender, SessionHandle, DEFAULT_ACTION_LIMIT,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::handler::{ConnectionHandler, Pending};
use crate::incoming::{Incoming, IncomingSession};
use crate::session::{self, Session, SessionOption};

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Identifier of this side of the connection.
    pub container_id: String,
    /// Incoming buffer size for sessions opened without an explicit capacity.
    pub default_session_capacity: usize,
    /// Outgoing actions kept for inspection before the oldest are dropped.
    pub action_log_limit: usize,
    pub engine: EngineConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            container_id: "linkprims".to_string(),
            default_session_capacity: 0,
            action_log_limit: DEFAULT_ACTION_LIMIT,
            engine: EngineConfig::default(),
        }
    }
}

/// Feeds peer events into a connection's engine.
pub type PeerEvents = EventSender<ConnectionHandler>;

struct Inner {
    engine: Engine<ConnectionHandler>,
    state: Arc<EndpointState>,
    incoming: Receiver<Pending>,
    container_id: String,
}

/// A connection and the engine thread that serializes all work on it.
///
/// Cheap to clone. The engine keeps running while any clone, session, link
/// or incoming value is alive, until [`Connection::close`] is called or the
/// transport closes.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("container_id", &self.inner.container_id)
            .field("error", &self.inner.state.error())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Start the engine thread for a new connection.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        let state = Arc::new(EndpointState::new(config.container_id.clone()));
        let (tx, rx) = channel::unbounded();
        let handler = ConnectionHandler::new(
            state.clone(),
            config.default_session_capacity,
            config.action_log_limit,
            tx,
        );
        let engine = Engine::spawn(handler, config.engine)?;

        tracing::info!(container_id = %config.container_id, "connection opened");
        Ok(Self {
            inner: Arc::new(Inner {
                engine,
                state,
                incoming: rx,
                container_id: config.container_id,
            }),
        })
    }

    pub fn container_id(&self) -> &str {
        &self.inner.container_id
    }

    /// Begin a new session and wait until it is registered and opened.
    pub fn session(&self, options: &[SessionOption]) -> Result<Session> {
        let connection = self.clone();
        let options = options.to_vec();
        self.engine().inject_wait(move |h| {
            h.state.check()?;
            let handle = h.protocol.session_new();
            session::new_session(h, &connection, handle, &options)
        })?
    }

    #[cfg(feature = "async")]
    pub async fn session_async(&self, options: &[SessionOption]) -> Result<Session> {
        let connection = self.clone();
        let options = options.to_vec();
        self.engine()
            .inject_wait_async(move |h| {
                h.state.check()?;
                let handle = h.protocol.session_new();
                session::new_session(h, &connection, handle, &options)
            })
            .await?
    }

    /// Block until the peer offers a session or link.
    ///
    /// Fails with the termination error once the engine has stopped. Any
    /// number of threads may wait at once; each offer goes to one of them.
    pub fn incoming(&self) -> Result<Incoming> {
        match self.inner.incoming.recv() {
            Ok(pending) => Ok(self.materialize(pending)),
            Err(_) => Err(self.stopped()),
        }
    }

    /// Like [`Self::incoming`], giving up after `timeout`.
    pub fn incoming_timeout(&self, timeout: Duration) -> Result<Incoming> {
        match self.inner.incoming.recv_timeout(timeout) {
            Ok(pending) => Ok(self.materialize(pending)),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(self.stopped()),
        }
    }

    /// Close the connection and every session on it, then stop the engine.
    ///
    /// Does not wait; use [`Self::wait`] to join the engine thread.
    pub fn close(&self, condition: Option<ErrorCondition>) {
        let reason = match &condition {
            Some(condition) => EngineError::Terminated(condition.clone()),
            None => EngineError::Closed,
        };
        if let Err(err) = self
            .engine()
            .inject(move |h| h.close_connection(condition))
        {
            tracing::debug!(error = %err, "connection close not delivered");
            return;
        }
        tracing::info!(container_id = %self.inner.container_id, %reason, "connection closing");
        self.engine().shutdown(reason);
    }

    /// Wait for the engine thread to exit.
    pub fn wait(&self) -> Result<()> {
        Ok(self.engine().join()?)
    }

    /// Sender for events from the peer.
    pub fn events(&self) -> PeerEvents {
        self.engine().events()
    }

    /// Number of live sessions in the connection table.
    pub fn session_count(&self) -> Result<usize> {
        Ok(self.engine().inject_wait(|h| h.sessions.len())?)
    }

    pub fn has_session(&self, handle: SessionHandle) -> Result<bool> {
        Ok(self
            .engine()
            .inject_wait(move |h| h.sessions.contains_key(&handle))?)
    }

    /// Handles of the live sessions, in ascending order.
    pub fn session_ids(&self) -> Result<Vec<SessionHandle>> {
        Ok(self.engine().inject_wait(|h| {
            let mut ids: Vec<_> = h.sessions.keys().copied().collect();
            ids.sort();
            ids
        })?)
    }

    /// Look up a live session by handle.
    pub fn find_session(&self, handle: SessionHandle) -> Result<Option<Session>> {
        let connection = self.clone();
        Ok(self
            .engine()
            .inject_wait(move |h| session::live_session(h, &connection, handle))?)
    }

    /// Outgoing actions still held in the engine's log, oldest first.
    pub fn actions(&self) -> Result<Vec<Action>> {
        Ok(self
            .engine()
            .inject_wait(|h| h.protocol.actions().cloned().collect())?)
    }

    /// Drain the engine's action log.
    pub fn take_actions(&self) -> Result<Vec<Action>> {
        Ok(self.engine().inject_wait(|h| h.protocol.take_actions())?)
    }

    pub(crate) fn engine(&self) -> &Engine<ConnectionHandler> {
        &self.inner.engine
    }

    fn stopped(&self) -> SessionError {
        SessionError::Engine(self.engine().error().unwrap_or(EngineError::Closed))
    }

    fn materialize(&self, pending: Pending) -> Incoming {
        match pending {
            Pending::Session {
                session,
                capacity,
                offer,
            } => Incoming::Session(IncomingSession::new(self.clone(), session, capacity, offer)),
            Pending::Link {
                session,
                link,
                name,
                role,
                offer,
            } => Incoming::link(self.clone(), session, link, name, role, offer),
        }
    }
}

impl Endpoint for Connection {
    fn state(&self) -> &EndpointState {
        &self.inner.state
    }
}
