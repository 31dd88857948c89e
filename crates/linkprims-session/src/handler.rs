//! Engine-thread state of a connection.
//!
//! [`ConnectionHandler`] owns the session table and every session's link
//! table. It lives on the engine thread and is only reached through the
//! engine's injector, so none of it is locked.
//!
//! Peer offers that have not been answered are tracked separately from live
//! endpoints. Each offer carries an [`EndpointState`] shared with the
//! application's incoming value, so an offer the peer withdraws can be
//! forgotten here while its condition stays readable from that value.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::Sender;

use linkprims_engine::{
    EndpointError, EndpointState, EngineError, ErrorCondition, Event, EventHandler, LinkHandle,
    LinkRole, ProtoState, Protocol, SessionHandle,
};

/// A peer-initiated endpoint waiting to be surfaced to the application.
#[derive(Debug)]
pub(crate) enum Pending {
    Session {
        session: SessionHandle,
        capacity: usize,
        offer: Arc<EndpointState>,
    },
    Link {
        session: SessionHandle,
        link: LinkHandle,
        name: String,
        /// Our role on the link.
        role: LinkRole,
        offer: Arc<EndpointState>,
    },
}

/// A live session and the links it owns, keyed by engine link handle.
#[derive(Debug)]
pub(crate) struct SessionEntry {
    pub(crate) state: Arc<EndpointState>,
    pub(crate) capacity: usize,
    pub(crate) links: HashMap<LinkHandle, Arc<EndpointState>>,
    next_link: u64,
}

impl SessionEntry {
    pub(crate) fn new(state: Arc<EndpointState>, capacity: usize) -> Self {
        Self {
            state,
            capacity,
            links: HashMap::new(),
            next_link: 0,
        }
    }

    /// Generated name for a link opened without an explicit name.
    pub(crate) fn next_link_name(&mut self, session: SessionHandle) -> String {
        self.next_link += 1;
        format!("{session}/link-{}", self.next_link)
    }
}

/// Connection state owned by the engine thread.
#[derive(Debug)]
pub struct ConnectionHandler {
    pub(crate) protocol: Protocol,
    pub(crate) state: Arc<EndpointState>,
    pub(crate) default_capacity: usize,
    pub(crate) sessions: HashMap<SessionHandle, SessionEntry>,
    pub(crate) link_index: HashMap<LinkHandle, SessionHandle>,
    session_offers: HashMap<SessionHandle, Arc<EndpointState>>,
    link_offers: HashMap<LinkHandle, (SessionHandle, Arc<EndpointState>)>,
    incoming: Option<Sender<Pending>>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        state: Arc<EndpointState>,
        default_capacity: usize,
        action_limit: usize,
        incoming: Sender<Pending>,
    ) -> Self {
        Self {
            protocol: Protocol::with_action_limit(action_limit),
            state,
            default_capacity,
            sessions: HashMap::new(),
            link_index: HashMap::new(),
            session_offers: HashMap::new(),
            link_offers: HashMap::new(),
            incoming: Some(incoming),
        }
    }

    /// Peer offers not yet accepted, rejected or withdrawn.
    pub(crate) fn offer_count(&self) -> usize {
        self.session_offers.len() + self.link_offers.len()
    }

    /// Locally close the connection and every session on it.
    pub(crate) fn close_connection(&mut self, condition: Option<ErrorCondition>) {
        if !self
            .state
            .close_local(Some(EndpointError::from_condition(condition.clone())))
        {
            return;
        }
        let sessions: Vec<_> = self.sessions.keys().copied().collect();
        for session in sessions {
            self.close_session_unchecked(session, condition.clone());
        }
    }

    /// Locally close `session` if `state` is still the live session's state
    /// and no error has been recorded yet.
    pub(crate) fn close_session(
        &mut self,
        session: SessionHandle,
        state: &Arc<EndpointState>,
        condition: Option<ErrorCondition>,
    ) {
        let live = self.sessions.get(&session).is_some_and(|entry| {
            Arc::ptr_eq(&entry.state, state) && entry.state.error().is_none()
        });
        if live {
            self.close_session_unchecked(session, condition);
        }
    }

    fn close_session_unchecked(&mut self, session: SessionHandle, condition: Option<ErrorCondition>) {
        if let Err(err) = self.protocol.close_session(session, condition.clone()) {
            tracing::warn!(%session, error = %err, "local session close failed");
        }
        let err = EndpointError::from_condition(condition);
        if let Some(entry) = self.sessions.remove(&session) {
            entry.state.close_local(Some(err.clone()));
            for (link, state) in entry.links {
                state.close_local(Some(err.clone()));
                self.link_index.remove(&link);
            }
        }
        self.drop_link_offers(session, |offer| {
            offer.close_local(Some(err.clone()));
        });
        tracing::debug!(%session, "session closed locally");
    }

    /// Locally close `link` if `state` is its live state and no error is recorded.
    pub(crate) fn close_link(
        &mut self,
        link: LinkHandle,
        state: &Arc<EndpointState>,
        condition: Option<ErrorCondition>,
    ) {
        let Some(session) = self.link_index.get(&link).copied() else {
            return;
        };
        let Some(entry) = self.sessions.get_mut(&session) else {
            return;
        };
        let live = entry
            .links
            .get(&link)
            .is_some_and(|live| Arc::ptr_eq(live, state) && live.error().is_none());
        if !live {
            return;
        }

        if let Err(err) = self.protocol.close_link(link, condition.clone()) {
            tracing::warn!(%link, error = %err, "local link close failed");
        }
        if let Some(state) = entry.links.remove(&link) {
            state.close_local(Some(EndpointError::from_condition(condition)));
        }
        self.link_index.remove(&link);
        tracing::debug!(%session, %link, "link closed locally");
    }

    /// Decline a peer-offered session that was never accepted.
    pub(crate) fn reject_session(
        &mut self,
        session: SessionHandle,
        offer: &Arc<EndpointState>,
        condition: Option<ErrorCondition>,
    ) {
        if !self.take_session_offer(session, offer) {
            return;
        }
        offer.close_local(Some(EndpointError::from_condition(condition.clone())));
        if let Some((ProtoState::Uninit, _)) = self.protocol.session_state(session) {
            if let Err(err) = self.protocol.close_session(session, condition) {
                tracing::warn!(%session, error = %err, "session reject failed");
            }
            tracing::debug!(%session, "incoming session rejected");
        }
    }

    /// Decline a peer-offered link that was never accepted.
    pub(crate) fn reject_link(
        &mut self,
        link: LinkHandle,
        offer: &Arc<EndpointState>,
        condition: Option<ErrorCondition>,
    ) {
        if !self.take_link_offer(link, offer) {
            return;
        }
        offer.close_local(Some(EndpointError::from_condition(condition.clone())));
        if let Some((ProtoState::Uninit, _)) = self.protocol.link_state(link) {
            if let Err(err) = self.protocol.close_link(link, condition) {
                tracing::warn!(%link, error = %err, "link reject failed");
            }
            tracing::debug!(%link, "incoming link rejected");
        }
    }

    /// Claim a peer-offered session for acceptance.
    ///
    /// Fails with the peer's condition if the offer was withdrawn.
    pub(crate) fn claim_session_offer(
        &mut self,
        session: SessionHandle,
        offer: &Arc<EndpointState>,
    ) -> Result<(), EndpointError> {
        self.state.check()?;
        if self.sessions.contains_key(&session) {
            return Err(EndpointError::AlreadyAccepted);
        }
        if !self.take_session_offer(session, offer) {
            return Err(offer.error().unwrap_or(EndpointError::Closed));
        }
        match self.protocol.session_state(session) {
            Some((ProtoState::Uninit, ProtoState::Active)) => Ok(()),
            Some(_) => Err(EndpointError::AlreadyAccepted),
            None => Err(EndpointError::Closed),
        }
    }

    /// Claim a peer-offered link for acceptance.
    pub(crate) fn claim_link_offer(
        &mut self,
        session: SessionHandle,
        link: LinkHandle,
        offer: &Arc<EndpointState>,
    ) -> Result<(), EndpointError> {
        self.state.check()?;
        let entry = self.sessions.get(&session).ok_or(EndpointError::Closed)?;
        entry.state.check()?;
        if entry.links.contains_key(&link) {
            return Err(EndpointError::AlreadyAccepted);
        }
        if !self.take_link_offer(link, offer) {
            return Err(offer.error().unwrap_or(EndpointError::Closed));
        }
        match self.protocol.link_state(link) {
            Some((ProtoState::Uninit, ProtoState::Active)) => Ok(()),
            Some(_) => Err(EndpointError::AlreadyAccepted),
            None => Err(EndpointError::Closed),
        }
    }

    // Removes the offer only if it is the one the caller holds.
    fn take_session_offer(&mut self, session: SessionHandle, offer: &Arc<EndpointState>) -> bool {
        let held = self
            .session_offers
            .get(&session)
            .is_some_and(|o| Arc::ptr_eq(o, offer));
        if held {
            self.session_offers.remove(&session);
        }
        held
    }

    fn take_link_offer(&mut self, link: LinkHandle, offer: &Arc<EndpointState>) -> bool {
        let held = self
            .link_offers
            .get(&link)
            .is_some_and(|(_, o)| Arc::ptr_eq(o, offer));
        if held {
            self.link_offers.remove(&link);
        }
        held
    }

    fn drop_link_offers(&mut self, session: SessionHandle, mut fail: impl FnMut(&EndpointState)) {
        self.link_offers.retain(|_, (owner, offer)| {
            if *owner == session {
                fail(&**offer);
                false
            } else {
                true
            }
        });
    }

    fn publish(&mut self, pending: Pending) {
        let Some(tx) = &self.incoming else {
            return;
        };
        if tx.send(pending).is_err() {
            tracing::debug!("incoming stream dropped; peer request left unanswered");
            self.incoming = None;
        }
    }

    fn on_session_opened(&mut self, session: SessionHandle) {
        if self.sessions.contains_key(&session) {
            tracing::debug!(%session, "peer confirmed session");
            return;
        }
        // Only a session we never opened is an offer. Anything else is a
        // confirm arriving after our own close.
        if !matches!(self.protocol.session_state(session), Some((ProtoState::Uninit, _))) {
            tracing::debug!(%session, "late confirm for locally closed session");
            return;
        }
        if self.session_offers.contains_key(&session) || self.state.error().is_some() {
            return;
        }
        tracing::debug!(%session, "peer offered session");
        let offer = Arc::new(EndpointState::new(session.to_string()));
        self.session_offers.insert(session, offer.clone());
        self.publish(Pending::Session {
            session,
            capacity: self.default_capacity,
            offer,
        });
    }

    fn on_session_closed(&mut self, session: SessionHandle, condition: Option<ErrorCondition>) {
        let err = EndpointError::from_condition(condition);
        self.drop_link_offers(session, |offer| {
            offer.close_remote(Some(err.clone()));
        });
        if let Some(offer) = self.session_offers.remove(&session) {
            offer.close_remote(Some(err));
            tracing::debug!(%session, "peer withdrew session offer");
            return;
        }
        let Some(entry) = self.sessions.remove(&session) else {
            tracing::debug!(%session, "peer ended session with no live endpoint");
            return;
        };
        entry.state.close_remote(Some(err.clone()));
        for (link, state) in &entry.links {
            state.close_remote(Some(err.clone()));
            state.close_local(None);
            self.link_index.remove(link);
        }
        // Answer the peer's end with our own.
        if let Err(err) = self.protocol.close_session(session, None) {
            tracing::warn!(%session, error = %err, "answering session end failed");
        }
        entry.state.close_local(None);
        tracing::debug!(%session, error = %err, "session closed by peer");
    }

    fn on_link_opened(&mut self, session: SessionHandle, link: LinkHandle, name: String, role: LinkRole) {
        if self.link_index.contains_key(&link) {
            tracing::debug!(%link, "peer confirmed link");
            return;
        }
        if !matches!(self.protocol.link_state(link), Some((ProtoState::Uninit, _))) {
            tracing::debug!(%link, "late confirm for locally closed link");
            return;
        }
        if self.link_offers.contains_key(&link) {
            return;
        }
        let live = self
            .sessions
            .get(&session)
            .is_some_and(|entry| entry.state.error().is_none());
        if !live {
            tracing::debug!(%session, %link, "peer attached link to a session that is not live");
            return;
        }
        tracing::debug!(%session, %link, %name, "peer offered link");
        let offer = Arc::new(EndpointState::new(link.to_string()));
        self.link_offers.insert(link, (session, offer.clone()));
        self.publish(Pending::Link {
            session,
            link,
            name,
            role: role.peer(),
            offer,
        });
    }

    fn on_link_closed(&mut self, link: LinkHandle, condition: Option<ErrorCondition>) {
        if let Some((session, offer)) = self.link_offers.remove(&link) {
            offer.close_remote(Some(EndpointError::from_condition(condition)));
            tracing::debug!(%session, %link, "peer withdrew link offer");
            return;
        }
        let Some(session) = self.link_index.remove(&link) else {
            tracing::debug!(%link, "peer detached link with no live endpoint");
            return;
        };
        let Some(state) = self
            .sessions
            .get_mut(&session)
            .and_then(|entry| entry.links.remove(&link))
        else {
            return;
        };
        state.close_remote(Some(EndpointError::from_condition(condition)));
        if let Err(err) = self.protocol.close_link(link, None) {
            tracing::warn!(%link, error = %err, "answering link detach failed");
        }
        state.close_local(None);
        tracing::debug!(%session, %link, "link closed by peer");
    }
}

impl EventHandler for ConnectionHandler {
    fn protocol_mut(&mut self) -> &mut Protocol {
        &mut self.protocol
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::SessionOpened { session } => self.on_session_opened(session),
            Event::SessionClosed { session, condition } => self.on_session_closed(session, condition),
            Event::LinkOpened {
                session,
                link,
                name,
                role,
            } => self.on_link_opened(session, link, name, role),
            Event::LinkClosed { link, condition } => self.on_link_closed(link, condition),
            Event::TransportClosed { .. } => {}
        }
    }

    fn on_shutdown(&mut self, reason: &EngineError) {
        let err = EndpointError::Engine(reason.clone());
        self.state.set_error(err.clone());
        for (session, entry) in self.sessions.drain() {
            entry.state.set_error(err.clone());
            for state in entry.links.values() {
                state.set_error(err.clone());
            }
            tracing::debug!(%session, %reason, "session failed with connection");
        }
        self.link_index.clear();
        for offer in self.session_offers.values() {
            offer.set_error(err.clone());
        }
        for (_, offer) in self.link_offers.values() {
            offer.set_error(err.clone());
        }
        self.session_offers.clear();
        self.link_offers.clear();
        self.incoming = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use linkprims_engine::{Endpoint, Event, LinkRole};

    use crate::connection::{Connection, ConnectionConfig};
    use crate::error::SessionError;
    use crate::link::LinkOption;

    const QUIET: Duration = Duration::from_millis(100);

    fn open() -> Connection {
        Connection::open(ConnectionConfig::default()).expect("connection should open")
    }

    #[test]
    fn late_session_confirm_is_not_an_offer() {
        let conn = open();
        let session = conn.session(&[]).unwrap();
        session.close(None);
        conn.events().confirm_session(session.handle()).unwrap();

        assert_eq!(conn.incoming_timeout(QUIET).unwrap_err(), SessionError::Timeout(QUIET));
        let offers = conn.engine().inject_wait(|h| h.offer_count()).unwrap();
        assert_eq!(offers, 0);
        assert_eq!(conn.session_count().unwrap(), 0);
    }

    #[test]
    fn late_link_confirm_is_not_an_offer() {
        let conn = open();
        let session = conn.session(&[]).unwrap();
        let sender = session
            .sender(&[LinkOption::Name("out".to_string())])
            .unwrap();
        sender.close(None);
        assert!(sender.error().is_some());

        conn.events()
            .send(Event::LinkOpened {
                session: session.handle(),
                link: sender.handle(),
                name: "out".to_string(),
                role: LinkRole::Receiver,
            })
            .unwrap();

        assert_eq!(conn.incoming_timeout(QUIET).unwrap_err(), SessionError::Timeout(QUIET));
        let offers = conn.engine().inject_wait(|h| h.offer_count()).unwrap();
        assert_eq!(offers, 0);
        assert!(session.error().is_none());
    }

    #[test]
    fn peer_confirm_of_live_session_is_not_an_offer() {
        let conn = open();
        let session = conn.session(&[]).unwrap();
        conn.events().confirm_session(session.handle()).unwrap();

        assert_eq!(conn.incoming_timeout(QUIET).unwrap_err(), SessionError::Timeout(QUIET));
        assert!(conn.has_session(session.handle()).unwrap());
    }
}
