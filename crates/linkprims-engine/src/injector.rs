//! The engine loop and its command injector.
//!
//! One thread owns the handler state `S`. Injected closures and peer events
//! share a single FIFO queue, so they run strictly one at a time in
//! submission order. Once the loop stops, queued closures are dropped without
//! running and every blocked [`Engine::inject_wait`] caller gets the
//! termination error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::event::{Event, EventHandler, EventSender};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

pub(crate) enum Work<S> {
    Job(Job<S>),
    Event(Event),
    Stop(EngineError),
}

/// Engine loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name given to the engine thread.
    pub thread_name: String,
    /// Queue depth at which a warning is logged.
    pub queue_warn_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_name: "linkprims-engine".to_string(),
            queue_warn_depth: 1024,
        }
    }
}

/// Loop status shared between handles and the engine thread.
#[derive(Debug, Default)]
pub(crate) struct Status {
    terminated: OnceLock<EngineError>,
    thread: OnceLock<ThreadId>,
    depth: AtomicUsize,
    warn_depth: usize,
}

impl Status {
    pub(crate) fn terminated(&self) -> Option<EngineError> {
        self.terminated.get().cloned()
    }

    pub(crate) fn termination_error(&self) -> EngineError {
        self.terminated().unwrap_or(EngineError::Closed)
    }

    pub(crate) fn enqueued(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth == self.warn_depth {
            tracing::warn!(depth, "engine queue is backing up");
        }
    }

    fn dequeued(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }

    fn on_engine_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }
}

/// Handle to a running engine loop.
///
/// Cheap to clone; every clone talks to the same loop. The loop stops when
/// [`Engine::shutdown`] is called, when the transport reports
/// [`Event::TransportClosed`], or when every handle and event sender is gone.
pub struct Engine<S> {
    tx: mpsc::Sender<Work<S>>,
    status: Arc<Status>,
    events: EventSender<S>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
            thread: self.thread.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("terminated", &self.status.terminated())
            .field("depth", &self.status.depth.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S: EventHandler> Engine<S> {
    /// Start the engine thread, handing it ownership of `state`.
    pub fn spawn(mut state: S, config: EngineConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let status = Arc::new(Status {
            warn_depth: config.queue_warn_depth,
            ..Status::default()
        });
        let handles = state.protocol_mut().allocator();

        let loop_status = status.clone();
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(state, rx, loop_status))
            .map_err(|err| EngineError::Spawn(err.to_string()))?;

        tracing::debug!(thread = %config.thread_name, "engine started");

        Ok(Self {
            events: EventSender::new(tx.clone(), handles, status.clone()),
            tx,
            status,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }
}

impl<S: 'static> Engine<S> {
    /// Queue `f` to run on the engine thread and return immediately.
    ///
    /// Fails if the engine has already stopped; `f` is then never run.
    pub fn inject<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if let Some(err) = self.status.terminated() {
            return Err(err);
        }
        self.status.enqueued();
        self.tx.send(Work::Job(Box::new(f))).map_err(|_| {
            self.status.dequeued();
            self.status.termination_error()
        })
    }

    /// Queue `f` to run on the engine thread and block until it has run.
    ///
    /// Returns exactly what `f` returned. If the engine stops before `f` runs,
    /// returns the termination error instead. Must not be called from the
    /// engine thread.
    pub fn inject_wait<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.status.on_engine_thread() {
            return Err(EngineError::Reentrant);
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.inject(move |state| {
            let _ = reply_tx.send(f(state));
        })?;
        // The reply sender is dropped with the job if the loop stops first.
        reply_rx.recv().map_err(|_| self.status.termination_error())
    }

    /// Async variant of [`Self::inject_wait`].
    #[cfg(feature = "async")]
    pub async fn inject_wait_async<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.inject(move |state| {
            let _ = reply_tx.send(f(state));
        })?;
        reply_rx.await.map_err(|_| self.status.termination_error())
    }

    /// Ask the loop to stop with `reason` after the work already queued.
    ///
    /// No-op if the loop has already stopped.
    pub fn shutdown(&self, reason: EngineError) {
        if self.status.terminated().is_some() {
            return;
        }
        tracing::debug!(%reason, "engine shutdown requested");
        self.status.enqueued();
        if self.tx.send(Work::Stop(reason)).is_err() {
            self.status.dequeued();
        }
    }

    /// Wait for the engine thread to exit. Later calls return immediately.
    pub fn join(&self) -> Result<()> {
        if self.status.on_engine_thread() {
            return Err(EngineError::Reentrant);
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle.join().map_err(|_| EngineError::Panicked),
            None => Ok(()),
        }
    }

    /// Why the loop stopped, or `None` while it is running.
    pub fn error(&self) -> Option<EngineError> {
        self.status.terminated()
    }

    /// Sender for peer events.
    pub fn events(&self) -> EventSender<S> {
        self.events.clone()
    }

    /// True when called from the engine thread.
    pub fn is_engine_thread(&self) -> bool {
        self.status.on_engine_thread()
    }
}

fn run<S: EventHandler>(mut state: S, rx: mpsc::Receiver<Work<S>>, status: Arc<Status>) {
    let _ = status.thread.set(thread::current().id());

    let reason = loop {
        let work = match rx.recv() {
            Ok(work) => work,
            Err(_) => break EngineError::Closed,
        };
        status.dequeued();

        match work {
            Work::Job(job) => job(&mut state),
            Work::Event(Event::TransportClosed { condition }) => {
                break match condition {
                    Some(condition) => EngineError::Terminated(condition),
                    None => EngineError::Closed,
                };
            }
            Work::Event(event) => dispatch(&mut state, event),
            Work::Stop(reason) => break reason,
        }
    };

    let _ = status.terminated.set(reason.clone());
    tracing::debug!(%reason, "engine stopping");
    state.on_shutdown(&reason);

    let dropped = rx
        .try_iter()
        .filter(|work| matches!(work, Work::Job(_)))
        .count();
    if dropped > 0 {
        tracing::warn!(dropped, "dropped injected work after engine stopped");
    }
}

fn dispatch<S: EventHandler>(state: &mut S, event: Event) {
    if let Err(err) = state.protocol_mut().apply(&event) {
        tracing::warn!(error = %err, ?event, "peer event rejected by protocol");
        return;
    }
    state.handle_event(event);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::time::Duration;

    use super::*;
    use crate::protocol::{ErrorCondition, Protocol};

    #[derive(Default)]
    struct Recorder {
        protocol: Protocol,
        log: Vec<String>,
        events: Vec<Event>,
        shutdown: Option<EngineError>,
        shutdown_flag: Option<Arc<AtomicBool>>,
    }

    impl EventHandler for Recorder {
        fn protocol_mut(&mut self) -> &mut Protocol {
            &mut self.protocol
        }

        fn handle_event(&mut self, event: Event) {
            self.events.push(event);
        }

        fn on_shutdown(&mut self, reason: &EngineError) {
            self.shutdown = Some(reason.clone());
            if let Some(flag) = &self.shutdown_flag {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    fn spawn() -> Engine<Recorder> {
        Engine::spawn(Recorder::default(), EngineConfig::default()).expect("engine should spawn")
    }

    #[test]
    fn inject_wait_returns_value() {
        let engine = spawn();
        let value = engine.inject_wait(|_| 42).expect("engine should run job");
        assert_eq!(value, 42);

        let result: Result<std::result::Result<(), String>> =
            engine.inject_wait(|_| Err("nope".to_string()));
        assert_eq!(result.unwrap(), Err("nope".to_string()));
    }

    #[test]
    fn injected_work_runs_in_order() {
        let engine = spawn();
        for i in 0..100 {
            engine
                .inject(move |s: &mut Recorder| s.log.push(i.to_string()))
                .unwrap();
        }
        let log = engine.inject_wait(|s| s.log.clone()).unwrap();
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(log, expected);
    }

    #[test]
    fn concurrent_callers_are_serialized() {
        let engine = spawn();
        let barrier = Arc::new(Barrier::new(8));
        let mut workers = Vec::new();
        for t in 0..8 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            workers.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..50 {
                    engine
                        .inject_wait(move |s: &mut Recorder| s.log.push(format!("{t}-{i}")))
                        .unwrap();
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }

        let log = engine.inject_wait(|s| s.log.clone()).unwrap();
        assert_eq!(log.len(), 400);
        for t in 0..8 {
            let mine: Vec<_> = log
                .iter()
                .filter(|e| e.starts_with(&format!("{t}-")))
                .cloned()
                .collect();
            let expected: Vec<_> = (0..50).map(|i| format!("{t}-{i}")).collect();
            assert_eq!(mine, expected);
        }
    }

    #[test]
    fn events_are_applied_then_dispatched() {
        let engine = spawn();
        let session = engine.events().open_session().unwrap();
        let (events, state) = engine
            .inject_wait(move |s| (s.events.clone(), s.protocol.session_state(session)))
            .unwrap();
        assert_eq!(events, vec![Event::SessionOpened { session }]);
        assert!(state.is_some());
    }

    #[test]
    fn rejected_events_are_not_dispatched() {
        let engine = spawn();
        let unknown = crate::protocol::HandleAllocator::default().link();
        engine.events().close_link(unknown, None).unwrap();
        let events = engine.inject_wait(|s| s.events.len()).unwrap();
        assert_eq!(events, 0);
    }

    #[test]
    fn calls_after_shutdown_fail() {
        let engine = spawn();
        engine.shutdown(EngineError::Closed);
        engine.join().unwrap();

        assert_eq!(engine.error(), Some(EngineError::Closed));
        assert_eq!(engine.inject(|_| {}), Err(EngineError::Closed));
        assert_eq!(engine.inject_wait(|_| 1), Err(EngineError::Closed));
        assert_eq!(engine.events().open_session(), Err(EngineError::Closed));
    }

    #[test]
    fn pending_waiters_unblock_on_shutdown() {
        let engine = spawn();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // Park the loop so later work stays queued.
        engine
            .inject(move |_| {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();
        started_rx.recv().unwrap();

        let cond = ErrorCondition::new(ErrorCondition::CONNECTION_FORCED, "bye");
        engine.shutdown(EngineError::Terminated(cond.clone()));

        let waiter = {
            let engine = engine.clone();
            thread::spawn(move || engine.inject_wait(|_| "ran"))
        };
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        let result = waiter.join().unwrap();
        assert_eq!(result, Err(EngineError::Terminated(cond)));
        engine.join().unwrap();
    }

    #[test]
    fn transport_close_terminates_engine() {
        let flag = Arc::new(AtomicBool::new(false));
        let engine = Engine::spawn(
            Recorder {
                shutdown_flag: Some(flag.clone()),
                ..Recorder::default()
            },
            EngineConfig::default(),
        )
        .unwrap();

        let cond = ErrorCondition::new(ErrorCondition::CONNECTION_FORCED, "reset");
        engine.events().close_transport(Some(cond.clone())).unwrap();
        engine.join().unwrap();

        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(engine.error(), Some(EngineError::Terminated(cond)));
    }

    #[test]
    fn reentrant_wait_is_refused() {
        let engine = spawn();
        let inner = engine.clone();
        let result = engine.inject_wait(move |_| inner.inject_wait(|_| ())).unwrap();
        assert_eq!(result, Err(EngineError::Reentrant));
        assert!(!engine.is_engine_thread());
    }

    #[test]
    fn dropping_all_handles_stops_loop() {
        let flag = Arc::new(AtomicBool::new(false));
        let engine = Engine::spawn(
            Recorder {
                shutdown_flag: Some(flag.clone()),
                ..Recorder::default()
            },
            EngineConfig::default(),
        )
        .unwrap();
        let thread = engine.thread.lock().unwrap().take().unwrap();
        drop(engine);
        thread.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"thread_name":"amqp-1"}"#).expect("config should parse");
        assert_eq!(config.thread_name, "amqp-1");
        assert_eq!(config.queue_warn_depth, 1024);
    }
}

#[cfg(all(test, feature = "async"))]
mod async_tests {
    use super::*;
    use crate::protocol::Protocol;

    #[derive(Default)]
    struct Counter {
        protocol: Protocol,
        hits: u32,
    }

    impl EventHandler for Counter {
        fn protocol_mut(&mut self) -> &mut Protocol {
            &mut self.protocol
        }

        fn handle_event(&mut self, _event: Event) {
            self.hits += 1;
        }

        fn on_shutdown(&mut self, _reason: &EngineError) {}
    }

    #[tokio::test]
    async fn inject_wait_async_returns_value() {
        let engine = Engine::spawn(Counter::default(), EngineConfig::default()).unwrap();
        engine.events().open_session().unwrap();
        let hits = engine.inject_wait_async(|c| c.hits).await.unwrap();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn inject_wait_async_after_shutdown_fails() {
        let engine = Engine::spawn(Counter::default(), EngineConfig::default()).unwrap();
        engine.shutdown(EngineError::Closed);
        let engine2 = engine.clone();
        tokio::task::spawn_blocking(move || engine2.join())
            .await
            .unwrap()
            .unwrap();
        let result = engine.inject_wait_async(|c| c.hits).await;
        assert_eq!(result, Err(EngineError::Closed));
    }
}
