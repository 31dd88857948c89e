//! Peer-originated protocol events.

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::injector::{Status, Work};
use crate::protocol::{ErrorCondition, HandleAllocator, LinkHandle, LinkRole, Protocol, SessionHandle};

/// Something the remote peer did, as decoded by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The peer began a session, or answered one we began.
    SessionOpened { session: SessionHandle },
    /// The peer ended a session.
    SessionClosed {
        session: SessionHandle,
        condition: Option<ErrorCondition>,
    },
    /// The peer attached a link. `role` is the peer's own role.
    LinkOpened {
        session: SessionHandle,
        link: LinkHandle,
        name: String,
        role: LinkRole,
    },
    /// The peer detached a link.
    LinkClosed {
        link: LinkHandle,
        condition: Option<ErrorCondition>,
    },
    /// The transport under the connection is gone. Stops the engine.
    TransportClosed { condition: Option<ErrorCondition> },
}

/// State owned by the engine thread.
///
/// The engine applies each event to [`Protocol`] first, then hands it to
/// [`EventHandler::handle_event`]. Events that the protocol rejects are
/// logged and dropped.
pub trait EventHandler: Send + 'static {
    /// Protocol state machine owned by this handler.
    fn protocol_mut(&mut self) -> &mut Protocol;

    /// React to a peer event that was applied to the protocol.
    fn handle_event(&mut self, event: Event);

    /// Called once on the engine thread when the loop stops.
    ///
    /// Queued work that has not run yet is dropped after this returns.
    fn on_shutdown(&mut self, reason: &EngineError);
}

/// Delivers peer events onto the engine loop.
///
/// Events share the queue with injected work, so they are processed in the
/// order they were submitted relative to it.
pub struct EventSender<S> {
    tx: std::sync::mpsc::Sender<Work<S>>,
    handles: HandleAllocator,
    status: Arc<Status>,
}

impl<S> Clone for EventSender<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            handles: self.handles.clone(),
            status: self.status.clone(),
        }
    }
}

impl<S> std::fmt::Debug for EventSender<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender").finish_non_exhaustive()
    }
}

impl<S> EventSender<S> {
    pub(crate) fn new(
        tx: std::sync::mpsc::Sender<Work<S>>,
        handles: HandleAllocator,
        status: Arc<Status>,
    ) -> Self {
        Self {
            tx,
            handles,
            status,
        }
    }

    /// Queue an event for the engine thread.
    pub fn send(&self, event: Event) -> Result<()> {
        if let Some(err) = self.status.terminated() {
            return Err(err);
        }
        tracing::trace!(?event, "peer event queued");
        self.status.enqueued();
        self.tx
            .send(Work::Event(event))
            .map_err(|_| self.status.termination_error())
    }

    /// The peer begins a new session. Returns the handle it will be known by.
    pub fn open_session(&self) -> Result<SessionHandle> {
        let session = self.handles.session();
        self.send(Event::SessionOpened { session })?;
        Ok(session)
    }

    /// The peer answers a session we began.
    pub fn confirm_session(&self, session: SessionHandle) -> Result<()> {
        self.send(Event::SessionOpened { session })
    }

    pub fn close_session(
        &self,
        session: SessionHandle,
        condition: Option<ErrorCondition>,
    ) -> Result<()> {
        self.send(Event::SessionClosed { session, condition })
    }

    /// The peer attaches a new link in `role` on `session`.
    pub fn open_link(
        &self,
        session: SessionHandle,
        name: impl Into<String>,
        role: LinkRole,
    ) -> Result<LinkHandle> {
        let link = self.handles.link();
        self.send(Event::LinkOpened {
            session,
            link,
            name: name.into(),
            role,
        })?;
        Ok(link)
    }

    pub fn close_link(&self, link: LinkHandle, condition: Option<ErrorCondition>) -> Result<()> {
        self.send(Event::LinkClosed { link, condition })
    }

    /// The transport failed or was closed by the peer.
    pub fn close_transport(&self, condition: Option<ErrorCondition>) -> Result<()> {
        self.send(Event::TransportClosed { condition })
    }
}
