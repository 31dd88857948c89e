//! Peer-initiated endpoints waiting for the application to accept or reject.
//!
//! An incoming value can be turned into a live endpoint at most once. A
//! second `accept`, or an `accept` after `reject`, returns an endpoint that is
//! already in error. Dropping an incoming value without answering it leaves
//! the peer's request unanswered at this layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use linkprims_engine::{
    Endpoint, EndpointError, EndpointState, ErrorCondition, LinkHandle, LinkRole, SessionHandle,
};

use crate::connection::Connection;
use crate::error::SessionError;
use crate::link::{self, Link, Receiver, Sender};
use crate::session::{self, Session, SessionOption};

#[derive(Debug, Default)]
struct Gate(AtomicBool);

impl Gate {
    /// True for the first caller only.
    fn consume(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// A request from the peer to open a session.
#[derive(Debug)]
pub struct IncomingSession {
    connection: Connection,
    session: SessionHandle,
    capacity: usize,
    offer: Arc<EndpointState>,
    gate: Gate,
}

impl IncomingSession {
    pub(crate) fn new(
        connection: Connection,
        session: SessionHandle,
        capacity: usize,
        offer: Arc<EndpointState>,
    ) -> Self {
        Self {
            connection,
            session,
            capacity,
            offer,
            gate: Gate::default(),
        }
    }

    /// Engine-level handle the peer offered.
    pub fn handle(&self) -> SessionHandle {
        self.session
    }

    /// Incoming buffer size the session will be opened with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Set the incoming buffer size in bytes. No effect once accepted.
    pub fn set_capacity(&mut self, bytes: usize) {
        self.capacity = bytes;
    }

    /// Open the offered session.
    ///
    /// Returns a session in error if this request was already answered or the
    /// connection has failed.
    pub fn accept(&self) -> Session {
        if !self.gate.consume() {
            return Session::failed(
                self.connection.clone(),
                self.session,
                EndpointError::AlreadyAccepted,
            );
        }
        if let Some(err) = self.offer.error() {
            return Session::failed(self.connection.clone(), self.session, err);
        }

        let connection = self.connection.clone();
        let handle = self.session;
        let offer = self.offer.clone();
        let options = [SessionOption::IncomingCapacity(self.capacity)];
        let result = self
            .connection
            .engine()
            .inject_wait(move |h| {
                h.claim_session_offer(handle, &offer)?;
                session::new_session(h, &connection, handle, &options)
            })
            .map_err(SessionError::from)
            .and_then(|result| result);

        match result {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(session = %handle, error = %err, "incoming session accept failed");
                Session::failed(self.connection.clone(), handle, err.into_endpoint_error())
            }
        }
    }

    /// Refuse the offered session, sending `condition` to the peer if given.
    pub fn reject(&self, condition: Option<ErrorCondition>) {
        if !self.gate.consume() {
            return;
        }
        let handle = self.session;
        let offer = self.offer.clone();
        let queued = self
            .connection
            .engine()
            .inject(move |h| h.reject_session(handle, &offer, condition));
        if let Err(err) = queued {
            tracing::debug!(session = %handle, error = %err, "session reject not delivered");
        }
    }
}

#[derive(Debug)]
struct IncomingLink {
    connection: Connection,
    session: SessionHandle,
    link: LinkHandle,
    name: String,
    role: LinkRole,
    capacity: Option<u32>,
    offer: Arc<EndpointState>,
    gate: Gate,
}

impl IncomingLink {
    fn accept(&self) -> Link {
        let info = link::incoming_info(self.name.clone(), self.role, self.capacity);
        if !self.gate.consume() {
            return Link::failed(
                self.connection.clone(),
                self.session,
                self.link,
                info,
                EndpointError::AlreadyAccepted,
            );
        }
        if let Some(err) = self.offer.error() {
            return Link::failed(self.connection.clone(), self.session, self.link, info, err);
        }

        let connection = self.connection.clone();
        let (session, handle) = (self.session, self.link);
        let offer = self.offer.clone();
        let accepted = info.clone();
        let result = self.connection.engine().inject_wait(move |h| {
            link::accept_link(h, &connection, session, handle, &offer, accepted)
        })
            .map_err(SessionError::from)
            .and_then(|result| result);

        match result {
            Ok(link) => link,
            Err(err) => {
                tracing::debug!(link = %handle, error = %err, "incoming link accept failed");
                Link::failed(
                    self.connection.clone(),
                    session,
                    handle,
                    info,
                    err.into_endpoint_error(),
                )
            }
        }
    }

    fn reject(&self, condition: Option<ErrorCondition>) {
        if !self.gate.consume() {
            return;
        }
        let handle = self.link;
        let offer = self.offer.clone();
        let queued = self
            .connection
            .engine()
            .inject(move |h| h.reject_link(handle, &offer, condition));
        if let Err(err) = queued {
            tracing::debug!(link = %handle, error = %err, "link reject not delivered");
        }
    }
}

/// A request from the peer to attach a link on which we send.
#[derive(Debug)]
pub struct IncomingSender {
    inner: IncomingLink,
}

/// A request from the peer to attach a link on which we receive.
#[derive(Debug)]
pub struct IncomingReceiver {
    inner: IncomingLink,
}

impl IncomingSender {
    pub fn handle(&self) -> LinkHandle {
        self.inner.link
    }

    /// Handle of the session the link is attached to.
    pub fn session(&self) -> SessionHandle {
        self.inner.session
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn accept(&self) -> Sender {
        Sender::new(self.inner.accept())
    }

    pub fn reject(&self, condition: Option<ErrorCondition>) {
        self.inner.reject(condition);
    }
}

impl IncomingReceiver {
    pub fn handle(&self) -> LinkHandle {
        self.inner.link
    }

    /// Handle of the session the link is attached to.
    pub fn session(&self) -> SessionHandle {
        self.inner.session
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Set the credit window granted to the peer. No effect once accepted.
    pub fn set_capacity(&mut self, credit: u32) {
        self.inner.capacity = Some(credit);
    }

    pub fn accept(&self) -> Receiver {
        Receiver::new(self.inner.accept())
    }

    pub fn reject(&self, condition: Option<ErrorCondition>) {
        self.inner.reject(condition);
    }
}

/// A peer-initiated endpoint delivered on [`Connection::incoming`].
#[derive(Debug)]
pub enum Incoming {
    Session(IncomingSession),
    Sender(IncomingSender),
    Receiver(IncomingReceiver),
}

impl Incoming {
    pub(crate) fn link(
        connection: Connection,
        session: SessionHandle,
        link: LinkHandle,
        name: String,
        role: LinkRole,
        offer: Arc<EndpointState>,
    ) -> Self {
        let inner = IncomingLink {
            connection,
            session,
            link,
            name,
            role,
            capacity: None,
            offer,
            gate: Gate::default(),
        };
        match role {
            LinkRole::Sender => Self::Sender(IncomingSender { inner }),
            LinkRole::Receiver => Self::Receiver(IncomingReceiver { inner }),
        }
    }

    /// Diagnostic identifier of the offered endpoint.
    pub fn id(&self) -> String {
        match self {
            Self::Session(s) => s.handle().to_string(),
            Self::Sender(s) => s.handle().to_string(),
            Self::Receiver(r) => r.handle().to_string(),
        }
    }

    pub fn accept(&self) -> Accepted {
        match self {
            Self::Session(s) => Accepted::Session(s.accept()),
            Self::Sender(s) => Accepted::Sender(s.accept()),
            Self::Receiver(r) => Accepted::Receiver(r.accept()),
        }
    }

    pub fn reject(&self, condition: Option<ErrorCondition>) {
        match self {
            Self::Session(s) => s.reject(condition),
            Self::Sender(s) => s.reject(condition),
            Self::Receiver(r) => r.reject(condition),
        }
    }
}

/// The endpoint produced by [`Incoming::accept`].
#[derive(Debug, Clone)]
pub enum Accepted {
    Session(Session),
    Sender(Sender),
    Receiver(Receiver),
}

impl Endpoint for Accepted {
    fn state(&self) -> &EndpointState {
        match self {
            Self::Session(s) => s.state(),
            Self::Sender(s) => s.state(),
            Self::Receiver(r) => r.state(),
        }
    }
}
