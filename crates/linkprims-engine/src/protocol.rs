//! Engine-level protocol objects.
//!
//! [`Protocol`] tracks the local and remote state of every session and link
//! the engine knows about. It is owned by the engine thread and must never be
//! shared. Outgoing protocol actions are appended to a bounded action log in
//! the order they would be written to the wire.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::event::Event;

/// Opaque handle of an engine-level session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(u64);

/// Opaque handle of an engine-level link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkHandle(u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Direction of a link, from the point of view of the side that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    Sender,
    Receiver,
}

impl LinkRole {
    /// The role the other side of the link plays.
    pub fn peer(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// State of one side of a session or link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtoState {
    Uninit,
    Active,
    Closed,
}

/// Error condition carried by a close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {description}")]
pub struct ErrorCondition {
    pub name: String,
    pub description: String,
}

impl ErrorCondition {
    pub const INTERNAL_ERROR: &'static str = "amqp:internal-error";
    pub const NOT_ALLOWED: &'static str = "amqp:not-allowed";
    pub const RESOURCE_DELETED: &'static str = "amqp:resource-deleted";
    pub const CONNECTION_FORCED: &'static str = "amqp:connection:forced";

    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn internal_error(description: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, description)
    }
}

/// An outgoing protocol action, in the order the engine performed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    SessionCapacity {
        session: SessionHandle,
        bytes: usize,
    },
    SessionOpen {
        session: SessionHandle,
    },
    SessionClose {
        session: SessionHandle,
        condition: Option<ErrorCondition>,
    },
    LinkCapacity {
        link: LinkHandle,
        credit: u32,
    },
    LinkOpen {
        session: SessionHandle,
        link: LinkHandle,
        name: String,
        role: LinkRole,
    },
    LinkClose {
        link: LinkHandle,
        condition: Option<ErrorCondition>,
    },
}

/// Allocates session and link handles.
///
/// Shared with [`crate::EventSender`] so peer-initiated endpoints get a handle
/// before their open event reaches the engine thread.
#[derive(Debug, Clone, Default)]
pub struct HandleAllocator {
    next: Arc<AtomicU64>,
}

impl HandleAllocator {
    pub fn session(&self) -> SessionHandle {
        SessionHandle(self.bump())
    }

    pub fn link(&self) -> LinkHandle {
        LinkHandle(self.bump())
    }

    // Handles are never reused; a u64 counter does not wrap in practice.
    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug)]
struct SessionSlot {
    local: ProtoState,
    remote: ProtoState,
    incoming_capacity: usize,
    remote_condition: Option<ErrorCondition>,
    links: Vec<LinkHandle>,
}

#[derive(Debug)]
struct LinkSlot {
    session: SessionHandle,
    name: String,
    role: LinkRole,
    local: ProtoState,
    remote: ProtoState,
    credit: u32,
    remote_condition: Option<ErrorCondition>,
}

/// Actions kept by [`Protocol::new`] before the oldest are discarded.
pub const DEFAULT_ACTION_LIMIT: usize = 4096;

/// Per-connection protocol state machine.
#[derive(Debug)]
pub struct Protocol {
    handles: HandleAllocator,
    sessions: BTreeMap<SessionHandle, SessionSlot>,
    links: BTreeMap<LinkHandle, LinkSlot>,
    actions: VecDeque<Action>,
    action_limit: usize,
    dropped_actions: u64,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::with_action_limit(DEFAULT_ACTION_LIMIT)
    }
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` actions in the log; older ones are discarded.
    /// A limit of `0` keeps none.
    pub fn with_action_limit(limit: usize) -> Self {
        Self {
            handles: HandleAllocator::default(),
            sessions: BTreeMap::new(),
            links: BTreeMap::new(),
            actions: VecDeque::new(),
            action_limit: limit,
            dropped_actions: 0,
        }
    }

    /// Handle allocator shared with peer event senders.
    pub fn allocator(&self) -> HandleAllocator {
        self.handles.clone()
    }

    /// Create a locally initiated session. Nothing is sent until [`Self::open_session`].
    pub fn session_new(&mut self) -> SessionHandle {
        let handle = self.handles.session();
        self.sessions.insert(handle, SessionSlot::new(ProtoState::Uninit));
        handle
    }

    /// Set the incoming buffer size. Only valid before the session is opened.
    pub fn set_incoming_capacity(&mut self, session: SessionHandle, bytes: usize) -> Result<()> {
        let slot = self.session_mut(session)?;
        if slot.local != ProtoState::Uninit {
            return Err(EngineError::Protocol(format!(
                "{session}: incoming capacity must be set before open"
            )));
        }
        slot.incoming_capacity = bytes;
        self.record(Action::SessionCapacity { session, bytes });
        Ok(())
    }

    pub fn open_session(&mut self, session: SessionHandle) -> Result<()> {
        let slot = self.session_mut(session)?;
        if slot.local != ProtoState::Uninit {
            return Err(EngineError::Protocol(format!("{session}: already opened")));
        }
        slot.local = ProtoState::Active;
        self.record(Action::SessionOpen { session });
        Ok(())
    }

    /// Close the local side of a session and every link it still has open.
    pub fn close_session(
        &mut self,
        session: SessionHandle,
        condition: Option<ErrorCondition>,
    ) -> Result<()> {
        let slot = self.session_mut(session)?;
        if slot.local == ProtoState::Closed {
            return Ok(());
        }
        slot.local = ProtoState::Closed;
        let links = slot.links.clone();
        for link in links {
            if let Some(l) = self.links.get_mut(&link) {
                l.local = ProtoState::Closed;
            }
        }
        self.record(Action::SessionClose { session, condition });
        self.prune_session(session);
        Ok(())
    }

    pub fn incoming_capacity(&self, session: SessionHandle) -> Option<usize> {
        self.sessions.get(&session).map(|s| s.incoming_capacity)
    }

    /// `(local, remote)` state of a session.
    pub fn session_state(&self, session: SessionHandle) -> Option<(ProtoState, ProtoState)> {
        self.sessions.get(&session).map(|s| (s.local, s.remote))
    }

    pub fn session_remote_condition(&self, session: SessionHandle) -> Option<&ErrorCondition> {
        self.sessions
            .get(&session)
            .and_then(|s| s.remote_condition.as_ref())
    }

    /// Create a locally initiated link on an open session.
    pub fn link_new(
        &mut self,
        session: SessionHandle,
        name: &str,
        role: LinkRole,
    ) -> Result<LinkHandle> {
        let slot = self.session_ref(session)?;
        if slot.local == ProtoState::Closed {
            return Err(EngineError::Protocol(format!("{session}: session closed")));
        }
        if self.find_link(session, name).is_some() {
            return Err(EngineError::Protocol(format!(
                "{session}: link name '{name}' already in use"
            )));
        }
        let link = self.handles.link();
        self.insert_link(session, link, name, role, ProtoState::Uninit);
        Ok(link)
    }

    /// Set the receive credit window. Only valid before the link is opened.
    pub fn set_link_capacity(&mut self, link: LinkHandle, credit: u32) -> Result<()> {
        let slot = self.link_mut(link)?;
        if slot.local != ProtoState::Uninit {
            return Err(EngineError::Protocol(format!(
                "{link}: capacity must be set before open"
            )));
        }
        slot.credit = credit;
        self.record(Action::LinkCapacity { link, credit });
        Ok(())
    }

    pub fn open_link(&mut self, link: LinkHandle) -> Result<()> {
        let slot = self.link_mut(link)?;
        if slot.local != ProtoState::Uninit {
            return Err(EngineError::Protocol(format!("{link}: already opened")));
        }
        slot.local = ProtoState::Active;
        let action = Action::LinkOpen {
            session: slot.session,
            link,
            name: slot.name.clone(),
            role: slot.role,
        };
        self.record(action);
        Ok(())
    }

    pub fn close_link(&mut self, link: LinkHandle, condition: Option<ErrorCondition>) -> Result<()> {
        let slot = self.link_mut(link)?;
        if slot.local == ProtoState::Closed {
            return Ok(());
        }
        slot.local = ProtoState::Closed;
        self.record(Action::LinkClose { link, condition });
        self.prune_link(link);
        Ok(())
    }

    /// `(local, remote)` state of a link.
    pub fn link_state(&self, link: LinkHandle) -> Option<(ProtoState, ProtoState)> {
        self.links.get(&link).map(|l| (l.local, l.remote))
    }

    pub fn link_credit(&self, link: LinkHandle) -> Option<u32> {
        self.links.get(&link).map(|l| l.credit)
    }

    pub fn link_name(&self, link: LinkHandle) -> Option<&str> {
        self.links.get(&link).map(|l| l.name.as_str())
    }

    pub fn link_role(&self, link: LinkHandle) -> Option<LinkRole> {
        self.links.get(&link).map(|l| l.role)
    }

    pub fn link_session(&self, link: LinkHandle) -> Option<SessionHandle> {
        self.links.get(&link).map(|l| l.session)
    }

    pub fn link_remote_condition(&self, link: LinkHandle) -> Option<&ErrorCondition> {
        self.links
            .get(&link)
            .and_then(|l| l.remote_condition.as_ref())
    }

    /// Number of sessions the engine still tracks.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of links the engine still tracks.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Outgoing actions still held in the log, oldest first.
    pub fn actions(&self) -> impl ExactSizeIterator<Item = &Action> {
        self.actions.iter()
    }

    /// Take the recorded actions, leaving the log empty.
    pub fn take_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    /// Actions discarded because the log was full.
    pub fn dropped_actions(&self) -> u64 {
        self.dropped_actions
    }

    fn record(&mut self, action: Action) {
        self.actions.push_back(action);
        while self.actions.len() > self.action_limit {
            self.actions.pop_front();
            self.dropped_actions += 1;
            if self.dropped_actions == 1 {
                tracing::debug!(limit = self.action_limit, "action log full; discarding oldest");
            }
        }
    }

    /// Apply a peer event to the remote side of the affected endpoints.
    pub fn apply(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::SessionOpened { session } => {
                self.sessions
                    .entry(*session)
                    .or_insert_with(|| SessionSlot::new(ProtoState::Uninit))
                    .remote = ProtoState::Active;
            }
            Event::SessionClosed { session, condition } => {
                let slot = self.session_mut(*session)?;
                slot.remote = ProtoState::Closed;
                slot.remote_condition = condition.clone();
                let links = slot.links.clone();
                for link in links {
                    if let Some(l) = self.links.get_mut(&link) {
                        l.remote = ProtoState::Closed;
                    }
                }
                self.prune_session(*session);
            }
            Event::LinkOpened {
                session,
                link,
                name,
                role,
            } => {
                if let Some(slot) = self.links.get_mut(link) {
                    slot.remote = ProtoState::Active;
                    return Ok(());
                }
                let slot = self.session_ref(*session)?;
                if slot.remote == ProtoState::Closed {
                    return Err(EngineError::Protocol(format!(
                        "{session}: link attach on ended session"
                    )));
                }
                self.insert_link(*session, *link, name, role.peer(), ProtoState::Active);
            }
            Event::LinkClosed { link, condition } => {
                let slot = self.link_mut(*link)?;
                slot.remote = ProtoState::Closed;
                slot.remote_condition = condition.clone();
                self.prune_link(*link);
            }
            Event::TransportClosed { .. } => {}
        }
        Ok(())
    }

    fn insert_link(
        &mut self,
        session: SessionHandle,
        link: LinkHandle,
        name: &str,
        role: LinkRole,
        remote: ProtoState,
    ) {
        self.links.insert(
            link,
            LinkSlot {
                session,
                name: name.to_string(),
                role,
                local: ProtoState::Uninit,
                remote,
                credit: 0,
                remote_condition: None,
            },
        );
        if let Some(slot) = self.sessions.get_mut(&session) {
            slot.links.push(link);
        }
    }

    fn find_link(&self, session: SessionHandle, name: &str) -> Option<LinkHandle> {
        let slot = self.sessions.get(&session)?;
        slot.links
            .iter()
            .copied()
            .find(|l| self.links.get(l).is_some_and(|l| l.name == name))
    }

    // Endpoints are forgotten once both sides are closed, or once the peer
    // has ended one we never opened.
    fn prune_session(&mut self, session: SessionHandle) {
        let done = self
            .sessions
            .get(&session)
            .is_some_and(|s| s.remote == ProtoState::Closed && s.local != ProtoState::Active);
        if done {
            if let Some(slot) = self.sessions.remove(&session) {
                for link in slot.links {
                    self.links.remove(&link);
                }
            }
        }
    }

    fn prune_link(&mut self, link: LinkHandle) {
        let done = self
            .links
            .get(&link)
            .is_some_and(|l| l.remote == ProtoState::Closed && l.local != ProtoState::Active);
        if done {
            if let Some(slot) = self.links.remove(&link) {
                if let Some(session) = self.sessions.get_mut(&slot.session) {
                    session.links.retain(|l| *l != link);
                }
            }
        }
    }

    fn session_ref(&self, session: SessionHandle) -> Result<&SessionSlot> {
        self.sessions
            .get(&session)
            .ok_or_else(|| EngineError::Protocol(format!("unknown {session}")))
    }

    fn session_mut(&mut self, session: SessionHandle) -> Result<&mut SessionSlot> {
        self.sessions
            .get_mut(&session)
            .ok_or_else(|| EngineError::Protocol(format!("unknown {session}")))
    }

    fn link_mut(&mut self, link: LinkHandle) -> Result<&mut LinkSlot> {
        self.links
            .get_mut(&link)
            .ok_or_else(|| EngineError::Protocol(format!("unknown {link}")))
    }
}

impl SessionSlot {
    fn new(remote: ProtoState) -> Self {
        Self {
            local: ProtoState::Uninit,
            remote,
            incoming_capacity: 0,
            remote_condition: None,
            links: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_recorded_before_open() {
        let mut proto = Protocol::new();
        let s = proto.session_new();
        proto.set_incoming_capacity(s, 4096).unwrap();
        proto.open_session(s).unwrap();

        assert_eq!(proto.incoming_capacity(s), Some(4096));
        assert_eq!(
            proto.actions().cloned().collect::<Vec<_>>(),
            vec![
                Action::SessionCapacity {
                    session: s,
                    bytes: 4096
                },
                Action::SessionOpen { session: s },
            ]
        );
    }

    #[test]
    fn capacity_after_open_rejected() {
        let mut proto = Protocol::new();
        let s = proto.session_new();
        proto.open_session(s).unwrap();
        let err = proto.set_incoming_capacity(s, 1).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert_eq!(proto.incoming_capacity(s), Some(0));
    }

    #[test]
    fn duplicate_link_name_rejected() {
        let mut proto = Protocol::new();
        let s = proto.session_new();
        proto.open_session(s).unwrap();
        proto.link_new(s, "orders", LinkRole::Sender).unwrap();
        let err = proto.link_new(s, "orders", LinkRole::Receiver).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert_eq!(proto.link_count(), 1);
    }

    #[test]
    fn link_on_closed_session_rejected() {
        let mut proto = Protocol::new();
        let s = proto.session_new();
        proto.open_session(s).unwrap();
        proto.close_session(s, None).unwrap();
        assert!(proto.link_new(s, "late", LinkRole::Sender).is_err());
    }

    #[test]
    fn session_pruned_after_both_sides_close() {
        let mut proto = Protocol::new();
        let s = proto.session_new();
        proto.open_session(s).unwrap();
        let l = proto.link_new(s, "a", LinkRole::Receiver).unwrap();
        proto.open_link(l).unwrap();

        proto.close_session(s, None).unwrap();
        assert_eq!(proto.session_state(s), Some((ProtoState::Closed, ProtoState::Uninit)));
        assert_eq!(proto.link_state(l), Some((ProtoState::Closed, ProtoState::Uninit)));

        proto
            .apply(&Event::SessionClosed {
                session: s,
                condition: None,
            })
            .unwrap();
        assert_eq!(proto.session_state(s), None);
        assert_eq!(proto.link_count(), 0);
    }

    #[test]
    fn peer_session_and_link_registered() {
        let mut proto = Protocol::new();
        let alloc = proto.allocator();
        let s = alloc.session();
        let l = alloc.link();

        proto.apply(&Event::SessionOpened { session: s }).unwrap();
        proto
            .apply(&Event::LinkOpened {
                session: s,
                link: l,
                name: "events".to_string(),
                role: LinkRole::Sender,
            })
            .unwrap();

        assert_eq!(proto.session_state(s), Some((ProtoState::Uninit, ProtoState::Active)));
        assert_eq!(proto.link_role(l), Some(LinkRole::Receiver));
        assert_eq!(proto.link_name(l), Some("events"));
        assert_eq!(proto.link_session(l), Some(s));
    }

    #[test]
    fn link_attach_for_unknown_session_fails() {
        let mut proto = Protocol::new();
        let alloc = proto.allocator();
        let err = proto
            .apply(&Event::LinkOpened {
                session: alloc.session(),
                link: alloc.link(),
                name: "x".to_string(),
                role: LinkRole::Sender,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn remote_link_close_records_condition() {
        let mut proto = Protocol::new();
        let s = proto.session_new();
        proto.open_session(s).unwrap();
        let l = proto.link_new(s, "a", LinkRole::Sender).unwrap();
        proto.open_link(l).unwrap();

        let cond = ErrorCondition::new(ErrorCondition::RESOURCE_DELETED, "queue deleted");
        proto
            .apply(&Event::LinkClosed {
                link: l,
                condition: Some(cond.clone()),
            })
            .unwrap();
        assert_eq!(proto.link_remote_condition(l), Some(&cond));

        proto.close_link(l, None).unwrap();
        assert_eq!(proto.link_state(l), None);
    }

    #[test]
    fn peer_end_of_open_session_keeps_condition() {
        let mut proto = Protocol::new();
        let s = proto.session_new();
        proto.open_session(s).unwrap();
        let cond = ErrorCondition::new(ErrorCondition::RESOURCE_DELETED, "tenant removed");
        proto
            .apply(&Event::SessionClosed {
                session: s,
                condition: Some(cond.clone()),
            })
            .unwrap();

        assert_eq!(proto.session_state(s), Some((ProtoState::Active, ProtoState::Closed)));
        assert_eq!(proto.session_remote_condition(s), Some(&cond));
        proto.close_session(s, None).unwrap();
        assert_eq!(proto.session_state(s), None);
    }

    #[test]
    fn ended_offers_are_forgotten() {
        let mut proto = Protocol::new();
        let alloc = proto.allocator();
        let s = alloc.session();
        let l = alloc.link();
        proto.apply(&Event::SessionOpened { session: s }).unwrap();
        proto
            .apply(&Event::LinkOpened {
                session: s,
                link: l,
                name: "feed".to_string(),
                role: LinkRole::Receiver,
            })
            .unwrap();

        proto
            .apply(&Event::LinkClosed {
                link: l,
                condition: None,
            })
            .unwrap();
        assert_eq!(proto.link_state(l), None);

        proto
            .apply(&Event::SessionClosed {
                session: s,
                condition: None,
            })
            .unwrap();
        assert_eq!(proto.session_state(s), None);
        assert_eq!(proto.session_count(), 0);
    }

    #[test]
    fn action_log_keeps_newest() {
        let mut proto = Protocol::with_action_limit(4);
        for _ in 0..50 {
            let s = proto.session_new();
            proto.open_session(s).unwrap();
            proto.close_session(s, None).unwrap();
            proto
                .apply(&Event::SessionClosed {
                    session: s,
                    condition: None,
                })
                .unwrap();
        }
        assert_eq!(proto.actions().len(), 4);
        assert_eq!(proto.dropped_actions(), 96);
        assert_eq!(proto.session_count(), 0);
        assert!(matches!(
            proto.actions().last(),
            Some(Action::SessionClose { .. })
        ));

        assert_eq!(proto.take_actions().len(), 4);
        assert_eq!(proto.actions().len(), 0);
    }

    #[test]
    fn handles_continue_past_u32() {
        let alloc = HandleAllocator {
            next: Arc::new(AtomicU64::new(u64::from(u32::MAX))),
        };
        let first = alloc.session();
        let second = alloc.link();
        assert_eq!(first.to_string(), format!("session-{}", u64::from(u32::MAX) + 1));
        assert_eq!(second.to_string(), format!("link-{}", u64::from(u32::MAX) + 2));
    }

    #[test]
    fn handles_display() {
        let alloc = HandleAllocator::default();
        assert_eq!(alloc.session().to_string(), "session-1");
        assert_eq!(alloc.link().to_string(), "link-2");
    }
}
