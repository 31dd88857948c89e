use std::sync::Arc;

use linkprims_engine::{
    Endpoint, EndpointError, EndpointState, ErrorCondition, LinkRole, SessionHandle,
};
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::Result;
use crate::handler::{ConnectionHandler, SessionEntry};
use crate::link::{self, LinkOption, Receiver, Sender};

/// Option applied when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOption {
    /// Size in bytes of the session's incoming data buffer. `0` leaves the
    /// engine default in place.
    IncomingCapacity(usize),
}

/// An AMQP session: a group of sender and receiver links on a connection.
///
/// Cheap to clone. All state changes are made on the engine thread.
#[derive(Debug, Clone)]
pub struct Session {
    connection: Connection,
    handle: SessionHandle,
    state: Arc<EndpointState>,
    capacity: usize,
}

impl Session {
    /// A session that never went live; every operation reports `err`.
    pub(crate) fn failed(connection: Connection, handle: SessionHandle, err: EndpointError) -> Self {
        Self {
            connection,
            handle,
            state: Arc::new(EndpointState::failed(handle.to_string(), err)),
            capacity: 0,
        }
    }

    /// Engine-level handle this session wraps.
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Configured incoming buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The connection this session belongs to.
    pub fn connection(&self) -> Connection {
        self.connection.clone()
    }

    /// Open a new sender link.
    ///
    /// Fails with the session's error if it is already closed or failed.
    pub fn sender(&self, options: &[LinkOption]) -> Result<Sender> {
        self.local_link(LinkRole::Sender, options).map(Sender::new)
    }

    /// Open a new receiver link.
    ///
    /// Fails with the session's error if it is already closed or failed.
    pub fn receiver(&self, options: &[LinkOption]) -> Result<Receiver> {
        self.local_link(LinkRole::Receiver, options)
            .map(Receiver::new)
    }

    #[cfg(feature = "async")]
    pub async fn sender_async(&self, options: &[LinkOption]) -> Result<Sender> {
        let session = self.clone();
        let options = options.to_vec();
        self.connection
            .engine()
            .inject_wait_async(move |h| link::local_link(h, &session, LinkRole::Sender, &options))
            .await?
            .map(Sender::new)
    }

    #[cfg(feature = "async")]
    pub async fn receiver_async(&self, options: &[LinkOption]) -> Result<Receiver> {
        let session = self.clone();
        let options = options.to_vec();
        self.connection
            .engine()
            .inject_wait_async(move |h| link::local_link(h, &session, LinkRole::Receiver, &options))
            .await?
            .map(Receiver::new)
    }

    /// Close the session, sending `condition` to the peer if given.
    ///
    /// Does not wait. No-op if the session is already closed or failed.
    pub fn close(&self, condition: Option<ErrorCondition>) {
        if self.state.error().is_some() {
            return;
        }
        let handle = self.handle;
        let state = self.state.clone();
        let queued = self
            .connection
            .engine()
            .inject(move |h| h.close_session(handle, &state, condition));
        if let Err(err) = queued {
            tracing::debug!(session = %handle, error = %err, "session close not delivered");
        }
    }

    fn local_link(&self, role: LinkRole, options: &[LinkOption]) -> Result<link::Link> {
        let session = self.clone();
        let options = options.to_vec();
        self.connection
            .engine()
            .inject_wait(move |h| link::local_link(h, &session, role, &options))?
    }

    pub(crate) fn shared_state(&self) -> &Arc<EndpointState> {
        &self.state
    }
}

impl Endpoint for Session {
    fn state(&self) -> &EndpointState {
        &self.state
    }
}

/// Build a session on the engine thread.
///
/// The session is registered in the connection's table before the engine
/// session is configured and opened, so events caused by the open already
/// find it. Capacity must be set before the open to take effect.
pub(crate) fn new_session(
    h: &mut ConnectionHandler,
    connection: &Connection,
    handle: SessionHandle,
    options: &[SessionOption],
) -> Result<Session> {
    let mut capacity = h.default_capacity;
    for option in options {
        match option {
            SessionOption::IncomingCapacity(bytes) => capacity = *bytes,
        }
    }

    let state = Arc::new(EndpointState::new(handle.to_string()));
    h.sessions
        .insert(handle, SessionEntry::new(state.clone(), capacity));

    let opened = h
        .protocol
        .set_incoming_capacity(handle, capacity)
        .and_then(|()| h.protocol.open_session(handle));
    if let Err(err) = opened {
        h.sessions.remove(&handle);
        state.set_error(EndpointError::Engine(err.clone()));
        return Err(err.into());
    }

    tracing::debug!(session = %handle, capacity, "session opened");
    Ok(Session {
        connection: connection.clone(),
        handle,
        state,
        capacity,
    })
}

/// Rebuild the handle of a live session from the connection table.
pub(crate) fn live_session(
    h: &ConnectionHandler,
    connection: &Connection,
    handle: SessionHandle,
) -> Option<Session> {
    h.sessions.get(&handle).map(|entry| Session {
        connection: connection.clone(),
        handle,
        state: entry.state.clone(),
        capacity: entry.capacity,
    })
}
