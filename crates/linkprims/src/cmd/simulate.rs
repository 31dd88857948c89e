use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use linkprims_engine::{Action, Endpoint, EndpointError, ErrorCondition, LinkRole};
use linkprims_session::{
    Connection, ConnectionConfig, Incoming, IncomingSession, LinkOption, PeerEvents, Receiver,
    Sender, Session, SessionOption,
};
use serde::{Deserialize, Serialize};

use crate::cmd::SimulateArgs;
use crate::exit::{
    engine_error, io_error, json_error, session_error, CliError, CliResult, SUCCESS, USAGE,
};
use crate::output::{print_json, print_rows, OutputFormat};

/// What the simulated application and peer do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub connection: ConnectionConfig,
    pub sessions: usize,
    pub senders: usize,
    pub receivers: usize,
    pub peer_sessions: usize,
    pub peer_links: usize,
    pub reject_every: usize,
    pub session_capacity: usize,
    pub receiver_capacity: Option<u32>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            sessions: 2,
            senders: 1,
            receivers: 1,
            peer_sessions: 2,
            peer_links: 1,
            reject_every: 0,
            session_capacity: 0,
            receiver_capacity: None,
        }
    }
}

impl ScenarioConfig {
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| io_error(&format!("read scenario {}", path.display()), err))?;
        serde_json::from_str(&text)
            .map_err(|err| json_error(&format!("parse scenario {}", path.display()), err))
    }

    fn apply(&mut self, args: &SimulateArgs) {
        let overrides = [
            (args.sessions, &mut self.sessions),
            (args.senders, &mut self.senders),
            (args.receivers, &mut self.receivers),
            (args.peer_sessions, &mut self.peer_sessions),
            (args.peer_links, &mut self.peer_links),
            (args.reject_every, &mut self.reject_every),
            (args.session_capacity, &mut self.session_capacity),
        ];
        for (flag, field) in overrides {
            if let Some(value) = flag {
                *field = value;
            }
        }
        if args.receiver_capacity.is_some() {
            self.receiver_capacity = args.receiver_capacity;
        }
    }

    fn session_options(&self) -> Vec<SessionOption> {
        match self.session_capacity {
            0 => Vec::new(),
            bytes => vec![SessionOption::IncomingCapacity(bytes)],
        }
    }

    fn rejects(&self, offer: usize) -> bool {
        self.reject_every != 0 && (offer + 1) % self.reject_every == 0
    }
}

/// Lifecycle counts after the simulated connection has closed.
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub container_id: String,
    pub sessions_opened: usize,
    pub sessions_accepted: usize,
    pub sessions_rejected: usize,
    pub senders: usize,
    pub receivers: usize,
    pub peer_links_accepted: usize,
    /// Endpoints whose final error is something other than a clean close.
    pub endpoint_errors: usize,
    pub actions: usize,
    pub action_counts: BTreeMap<&'static str, usize>,
}

#[derive(Default)]
struct Live {
    sessions: Vec<Session>,
    senders: Vec<Sender>,
    receivers: Vec<Receiver>,
}

pub fn run(args: SimulateArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let mut scenario = match &args.scenario {
        Some(path) => ScenarioConfig::load(path)?,
        None => ScenarioConfig::default(),
    };
    scenario.apply(&args);

    let report = simulate(&scenario, timeout)?;
    print_report(&report, format);
    Ok(SUCCESS)
}

/// Run `scenario` against a fresh in-memory connection.
pub fn simulate(scenario: &ScenarioConfig, timeout: Duration) -> CliResult<Report> {
    let conn = Connection::open(scenario.connection.clone())
        .map_err(|err| session_error("open connection", err))?;
    let mut report = Report {
        container_id: conn.container_id().to_string(),
        ..Report::default()
    };
    let mut live = Live::default();

    for index in 0..scenario.sessions {
        let session = conn
            .session(&scenario.session_options())
            .map_err(|err| session_error("open session", err))?;
        open_links(scenario, &session, index, &mut live)?;
        report.sessions_opened += 1;
        live.sessions.push(session);
    }
    tally_actions(&conn, &mut report)?;

    let peer = conn.events();
    for offer in 0..scenario.peer_sessions {
        peer.open_session()
            .map_err(|err| engine_error("peer session", err))?;
        let incoming = match next_incoming(&conn, timeout)? {
            Incoming::Session(incoming) => incoming,
            other => {
                return Err(CliError::new(
                    USAGE,
                    format!("expected a peer session, got {}", other.id()),
                ))
            }
        };

        if scenario.rejects(offer) {
            tracing::info!(session = %incoming.handle(), "rejecting peer session");
            incoming.reject(Some(ErrorCondition::new(
                ErrorCondition::NOT_ALLOWED,
                "rejected by scenario",
            )));
            report.sessions_rejected += 1;
            continue;
        }

        let session = accept_session(scenario, incoming)?;
        report.sessions_accepted += 1;
        report.peer_links_accepted +=
            attach_peer_links(scenario, &conn, &peer, &session, timeout, &mut live)?;
        live.sessions.push(session);
        tally_actions(&conn, &mut report)?;
    }

    report.senders = live.senders.len();
    report.receivers = live.receivers.len();

    for session in &live.sessions {
        session.close(None);
        tally_actions(&conn, &mut report)?;
    }
    conn.close(None);
    conn.wait()
        .map_err(|err| session_error("wait for engine", err))?;

    report.endpoint_errors = live
        .sessions
        .iter()
        .map(|s| s.error())
        .chain(live.senders.iter().map(|s| s.error()))
        .chain(live.receivers.iter().map(|r| r.error()))
        .filter(|err| !matches!(err, Some(EndpointError::Closed)))
        .count();

    tracing::info!(
        sessions = live.sessions.len(),
        actions = report.actions,
        "simulation finished"
    );
    Ok(report)
}

fn open_links(
    scenario: &ScenarioConfig,
    session: &Session,
    index: usize,
    live: &mut Live,
) -> CliResult<()> {
    for n in 0..scenario.senders {
        let sender = session
            .sender(&[LinkOption::Target(format!("queue://sim/{index}/{n}"))])
            .map_err(|err| session_error("open sender", err))?;
        live.senders.push(sender);
    }
    for n in 0..scenario.receivers {
        let mut options = vec![LinkOption::Source(format!("topic://sim/{index}/{n}"))];
        if let Some(credit) = scenario.receiver_capacity {
            options.push(LinkOption::Capacity(credit));
        }
        let receiver = session
            .receiver(&options)
            .map_err(|err| session_error("open receiver", err))?;
        live.receivers.push(receiver);
    }
    Ok(())
}

fn accept_session(scenario: &ScenarioConfig, mut incoming: IncomingSession) -> CliResult<Session> {
    if scenario.session_capacity > 0 {
        incoming.set_capacity(scenario.session_capacity);
    }
    let session = incoming.accept();
    match session.error() {
        None => Ok(session),
        Some(err) => Err(session_error("accept session", err.into())),
    }
}

/// The peer attaches `peer_links` links to `session`, alternating roles.
fn attach_peer_links(
    scenario: &ScenarioConfig,
    conn: &Connection,
    peer: &PeerEvents,
    session: &Session,
    timeout: Duration,
    live: &mut Live,
) -> CliResult<usize> {
    for n in 0..scenario.peer_links {
        let role = if n % 2 == 0 {
            LinkRole::Sender
        } else {
            LinkRole::Receiver
        };
        peer.open_link(session.handle(), format!("peer-{n}"), role)
            .map_err(|err| engine_error("peer link", err))?;

        match next_incoming(conn, timeout)? {
            Incoming::Receiver(mut incoming) => {
                if let Some(credit) = scenario.receiver_capacity {
                    incoming.set_capacity(credit);
                }
                live.receivers.push(incoming.accept());
            }
            Incoming::Sender(incoming) => live.senders.push(incoming.accept()),
            Incoming::Session(incoming) => {
                return Err(CliError::new(
                    USAGE,
                    format!("expected a peer link, got {}", incoming.handle()),
                ))
            }
        }
    }
    Ok(scenario.peer_links)
}

// Drains the engine's action log so long scenarios never outrun its limit.
fn tally_actions(conn: &Connection, report: &mut Report) -> CliResult<()> {
    let actions = conn
        .take_actions()
        .map_err(|err| session_error("read actions", err))?;
    report.actions += actions.len();
    for action in &actions {
        *report.action_counts.entry(action_name(action)).or_default() += 1;
    }
    Ok(())
}

fn next_incoming(conn: &Connection, timeout: Duration) -> CliResult<Incoming> {
    conn.incoming_timeout(timeout)
        .map_err(|err| session_error("wait for peer", err))
}

fn action_name(action: &Action) -> &'static str {
    match action {
        Action::SessionCapacity { .. } => "session_capacity",
        Action::SessionOpen { .. } => "session_open",
        Action::SessionClose { .. } => "session_close",
        Action::LinkCapacity { .. } => "link_capacity",
        Action::LinkOpen { .. } => "link_open",
        Action::LinkClose { .. } => "link_close",
    }
}

fn print_report(report: &Report, format: OutputFormat) {
    if let OutputFormat::Json = format {
        print_json(report);
        return;
    }
    let mut rows = vec![
        ("container", report.container_id.clone()),
        ("sessions opened", report.sessions_opened.to_string()),
        ("sessions accepted", report.sessions_accepted.to_string()),
        ("sessions rejected", report.sessions_rejected.to_string()),
        ("senders", report.senders.to_string()),
        ("receivers", report.receivers.to_string()),
        ("peer links accepted", report.peer_links_accepted.to_string()),
        ("endpoint errors", report.endpoint_errors.to_string()),
        ("actions", report.actions.to_string()),
    ];
    for (name, count) in &report.action_counts {
        rows.push((*name, count.to_string()));
    }
    print_rows("Simulation Report", &rows, format);
}

/// Accepts `<n>`, `<n>ms`, `<n>s` or `<n>m`. A bare number is seconds.
fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    let digits = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (value, unit) = input.split_at(digits);
    let value: u64 = value
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("timeout {input:?} has no number")))?;

    let timeout = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        other => {
            return Err(CliError::new(
                USAGE,
                format!("timeout unit {other:?} is not one of ms, s, m"),
            ))
        }
    };
    if timeout.is_zero() {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }
    Ok(timeout)
}
