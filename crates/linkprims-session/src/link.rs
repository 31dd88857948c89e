use std::sync::Arc;

use linkprims_engine::{
    Endpoint, EndpointError, EndpointState, ErrorCondition, LinkHandle, LinkRole, SessionHandle,
};
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::handler::ConnectionHandler;
use crate::session::Session;

/// Option applied when a link is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOption {
    /// Link name, unique within the session. Generated if not given.
    Name(String),
    /// Source address.
    Source(String),
    /// Target address.
    Target(String),
    /// Receiver credit window. Only valid for receivers.
    Capacity(u32),
}

/// Static description of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub name: String,
    pub role: LinkRole,
    pub source: Option<String>,
    pub target: Option<String>,
    pub capacity: Option<u32>,
}

impl LinkInfo {
    fn from_options(
        role: LinkRole,
        options: &[LinkOption],
        default_name: impl FnOnce() -> String,
    ) -> Result<Self> {
        let mut name = None;
        let mut source = None;
        let mut target = None;
        let mut capacity = None;
        for option in options {
            match option {
                LinkOption::Name(n) => name = Some(n.clone()),
                LinkOption::Source(s) => source = Some(s.clone()),
                LinkOption::Target(t) => target = Some(t.clone()),
                LinkOption::Capacity(c) => capacity = Some(*c),
            }
        }

        if capacity.is_some() && role == LinkRole::Sender {
            return Err(SessionError::InvalidOption(
                "capacity applies to receivers only".to_string(),
            ));
        }
        let name = match name {
            Some(name) if name.is_empty() => {
                return Err(SessionError::InvalidOption("link name is empty".to_string()));
            }
            Some(name) => name,
            None => default_name(),
        };

        Ok(Self {
            name,
            role,
            source,
            target,
            capacity,
        })
    }
}

/// A unidirectional message channel owned by a session.
///
/// Holds the owning session by handle only; the session table on the engine
/// thread owns the link's state.
#[derive(Debug, Clone)]
pub struct Link {
    connection: Connection,
    session: SessionHandle,
    handle: LinkHandle,
    state: Arc<EndpointState>,
    info: Arc<LinkInfo>,
}

impl Link {
    pub(crate) fn failed(
        connection: Connection,
        session: SessionHandle,
        handle: LinkHandle,
        info: LinkInfo,
        err: EndpointError,
    ) -> Self {
        Self {
            connection,
            session,
            handle,
            state: Arc::new(EndpointState::failed(handle.to_string(), err)),
            info: Arc::new(info),
        }
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle
    }

    /// Handle of the owning session.
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn connection(&self) -> Connection {
        self.connection.clone()
    }

    pub fn info(&self) -> &LinkInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn role(&self) -> LinkRole {
        self.info.role
    }

    pub fn source(&self) -> Option<&str> {
        self.info.source.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.info.target.as_deref()
    }

    /// Close the link, sending `condition` to the peer if given.
    ///
    /// Does not wait. No-op if the link is already closed or failed.
    pub fn close(&self, condition: Option<ErrorCondition>) {
        if self.state.error().is_some() {
            return;
        }
        let handle = self.handle;
        let state = self.state.clone();
        let queued = self
            .connection
            .engine()
            .inject(move |h| h.close_link(handle, &state, condition));
        if let Err(err) = queued {
            tracing::debug!(link = %handle, error = %err, "link close not delivered");
        }
    }
}

impl Endpoint for Link {
    fn state(&self) -> &EndpointState {
        &self.state
    }
}

/// Sending end of a link.
#[derive(Debug, Clone)]
pub struct Sender {
    link: Link,
}

/// Receiving end of a link.
#[derive(Debug, Clone)]
pub struct Receiver {
    link: Link,
}

impl Sender {
    pub(crate) fn new(link: Link) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn handle(&self) -> LinkHandle {
        self.link.handle()
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn target(&self) -> Option<&str> {
        self.link.target()
    }

    pub fn close(&self, condition: Option<ErrorCondition>) {
        self.link.close(condition);
    }
}

impl Receiver {
    pub(crate) fn new(link: Link) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn handle(&self) -> LinkHandle {
        self.link.handle()
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn source(&self) -> Option<&str> {
        self.link.source()
    }

    /// Credit window granted to the peer, if one was configured.
    pub fn capacity(&self) -> Option<u32> {
        self.link.info.capacity
    }

    pub fn close(&self, condition: Option<ErrorCondition>) {
        self.link.close(condition);
    }
}

impl Endpoint for Sender {
    fn state(&self) -> &EndpointState {
        self.link.state()
    }
}

impl Endpoint for Receiver {
    fn state(&self) -> &EndpointState {
        self.link.state()
    }
}

/// Create and open a locally initiated link on the engine thread.
///
/// Nothing is registered unless every step succeeds.
pub(crate) fn local_link(
    h: &mut ConnectionHandler,
    session: &Session,
    role: LinkRole,
    options: &[LinkOption],
) -> Result<Link> {
    session.shared_state().check()?;
    let handle = session.handle();
    let entry = h
        .sessions
        .get_mut(&handle)
        .filter(|entry| Arc::ptr_eq(&entry.state, session.shared_state()))
        .ok_or(EndpointError::Closed)?;

    let info = LinkInfo::from_options(role, options, || entry.next_link_name(handle))?;
    let link = h.protocol.link_new(handle, &info.name, role)?;
    if let Some(credit) = info.capacity {
        h.protocol.set_link_capacity(link, credit)?;
    }
    h.protocol.open_link(link)?;

    let state = Arc::new(EndpointState::new(link.to_string()));
    entry.links.insert(link, state.clone());
    h.link_index.insert(link, handle);
    tracing::debug!(session = %handle, %link, name = %info.name, %role, "link opened");

    Ok(Link {
        connection: session.connection(),
        session: handle,
        handle: link,
        state,
        info: Arc::new(info),
    })
}

/// Open a peer-initiated link on the engine thread.
pub(crate) fn accept_link(
    h: &mut ConnectionHandler,
    connection: &Connection,
    session: SessionHandle,
    link: LinkHandle,
    offer: &Arc<EndpointState>,
    info: LinkInfo,
) -> Result<Link> {
    h.claim_link_offer(session, link, offer)?;
    if let Some(credit) = info.capacity {
        h.protocol.set_link_capacity(link, credit)?;
    }
    h.protocol.open_link(link)?;

    let state = Arc::new(EndpointState::new(link.to_string()));
    if let Some(entry) = h.sessions.get_mut(&session) {
        entry.links.insert(link, state.clone());
    }
    h.link_index.insert(link, session);
    tracing::debug!(%session, %link, name = %info.name, role = %info.role, "incoming link accepted");

    Ok(Link {
        connection: connection.clone(),
        session,
        handle: link,
        state,
        info: Arc::new(info),
    })
}

pub(crate) fn incoming_info(name: String, role: LinkRole, capacity: Option<u32>) -> LinkInfo {
    LinkInfo {
        name,
        role,
        source: None,
        target: None,
        capacity,
    }
}
