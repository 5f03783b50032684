//! Test session controller
//!
//! A [`TestSession`] runs one cable test at a time on a dedicated worker
//! thread: connect, provision, then poll both remote streams until a
//! handshake token shows up, the monitoring window closes, or a stop is
//! requested. Every path ends in the same teardown, which runs once per
//! session.
//!
//! The worker owns the state machine. It publishes the current state
//! through an atomic and sends transitions, the detection and the outcome
//! over a channel, so it never waits on anything the control surface
//! holds. The control surface reads those, reads the event log and sets
//! the cancellation flag.

use super::detection::{DetectionEngine, DetectionEvent};
use super::logger::EventLog;
use super::poller::DualStreamPoller;
use super::provision::Provisioner;
use super::state_machine::{
    path_of, AtomicSessionState, SessionState, SessionStateMachine, StateTransition,
};
use super::transport::{ConnectionError, Connector, RemoteShell, SshConnector};
use crate::config::TestConfiguration;
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

const BANNER: &str = "============================================================";

/// Cooperative stop flag shared by the worker and the control surface
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Why a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Credential rejected
    Authentication,
    /// Relay unreachable or refused
    Network,
    /// Relay did not answer in time
    Timeout,
    /// Configuration unusable
    InvalidConfiguration,
    /// Session dropped after it was established
    ConnectionLost,
    /// Worker thread died
    Internal,
}

impl From<&ConnectionError> for FailureKind {
    fn from(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::Authentication(_) => Self::Authentication,
            ConnectionError::Network(_) => Self::Network,
            ConnectionError::Timeout(_) => Self::Timeout,
            ConnectionError::InvalidConfiguration(_) => Self::InvalidConfiguration,
        }
    }
}

/// How a test session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// Handshake token seen
    Detected(DetectionEvent),
    /// Monitoring window elapsed
    TimedOut {
        /// Time spent monitoring
        elapsed: Duration,
    },
    /// Stopped on request
    Stopped,
    /// Connection-level failure
    Failed {
        /// Classification
        kind: FailureKind,
        /// Error text
        message: String,
    },
}

impl TestOutcome {
    /// Terminal state this outcome corresponds to
    pub fn state(&self) -> SessionState {
        match self {
            Self::Detected(_) => SessionState::Detected,
            Self::TimedOut { .. } => SessionState::TimedOut,
            Self::Stopped => SessionState::Stopped,
            Self::Failed { .. } => SessionState::Failed,
        }
    }

    /// Cable carried data
    pub fn is_detected(&self) -> bool {
        matches!(self, Self::Detected(_))
    }

    fn failed(err: &ConnectionError) -> Self {
        Self::Failed {
            kind: err.into(),
            message: err.to_string(),
        }
    }
}

/// Reasons a start request is refused
#[derive(Error, Debug)]
pub enum StartError {
    /// A test is already running; the request is ignored
    #[error("A test is already running")]
    AlreadyRunning,

    /// Configuration rejected before connecting
    #[error(transparent)]
    InvalidConfiguration(#[from] ConnectionError),

    /// The worker thread could not be spawned
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Updates the worker publishes to the control surface
enum WorkerUpdate {
    Transition(StateTransition),
    Detected(DetectionEvent),
    Finished(TestOutcome),
}

/// Flags and counters visible to both the worker and the control surface.
/// None of them is a lock.
struct Shared {
    log: EventLog,
    cancel: CancellationToken,
    state: AtomicSessionState,
    running: AtomicBool,
    torn_down: AtomicBool,
    teardowns: AtomicUsize,
    cycles: AtomicU64,
}

/// What the control surface has received from the current or last worker
#[derive(Default)]
struct Snapshot {
    history: Vec<StateTransition>,
    detection: Option<DetectionEvent>,
    outcome: Option<TestOutcome>,
}

impl Snapshot {
    fn apply(&mut self, update: WorkerUpdate) {
        match update {
            WorkerUpdate::Transition(transition) => self.history.push(transition),
            WorkerUpdate::Detected(event) => self.detection = Some(event),
            WorkerUpdate::Finished(outcome) => self.outcome = Some(outcome),
        }
    }
}

/// Controller for cable test runs
pub struct TestSession {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<TestOutcome>>,
    updates: Receiver<WorkerUpdate>,
    snapshot: Mutex<Snapshot>,
    id: Uuid,
    started_at: Option<DateTime<Local>>,
}

impl Default for TestSession {
    fn default() -> Self {
        Self::ssh()
    }
}

impl TestSession {
    /// Controller using the given connector
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            shared: Arc::new(Shared {
                log: EventLog::new(),
                cancel: CancellationToken::new(),
                state: AtomicSessionState::default(),
                running: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                teardowns: AtomicUsize::new(0),
                cycles: AtomicU64::new(0),
            }),
            handle: None,
            updates: crossbeam_channel::never(),
            snapshot: Mutex::new(Snapshot::default()),
            id: Uuid::nil(),
            started_at: None,
        }
    }

    /// Controller connecting over SSH
    pub fn ssh() -> Self {
        Self::new(Arc::new(SshConnector))
    }

    /// Start a test. Refused while another test is running.
    pub fn start(&mut self, config: TestConfiguration) -> Result<(), StartError> {
        if self.shared.running.load(Ordering::SeqCst) {
            debug!("Start ignored, test already running");
            return Err(StartError::AlreadyRunning);
        }
        config.validate()?;

        // Reap the previous worker, it has already torn down
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        let mut machine = SessionStateMachine::new();
        let _ = machine.transition(SessionState::Connecting, Some("start requested"));
        *self.snapshot.get_mut() = Snapshot {
            history: machine.history().to_vec(),
            ..Snapshot::default()
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        self.updates = rx;

        self.id = Uuid::new_v4();
        self.started_at = Some(Local::now());
        let shared = &self.shared;
        shared.cancel.clear();
        shared.torn_down.store(false, Ordering::SeqCst);
        shared.cycles.store(0, Ordering::SeqCst);
        shared.state.store(machine.state());
        shared.running.store(true, Ordering::SeqCst);

        shared.log.info(BANNER);
        shared.log.info("Starting cable test...");
        shared.log.info(BANNER);

        let worker = Worker {
            id: self.id,
            config,
            connector: Arc::clone(&self.connector),
            shared: Arc::clone(shared),
            machine,
            updates: tx,
        };

        match thread::Builder::new()
            .name("cabletest-worker".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                shared.log.error(format!("Error: {}", e));
                self.snapshot.get_mut().history.push(StateTransition {
                    from: SessionState::Connecting,
                    to: SessionState::Failed,
                    timestamp: Local::now(),
                    reason: Some("worker spawn failed".to_string()),
                });
                shared.state.store(SessionState::Failed);
                shared.running.store(false, Ordering::SeqCst);
                Err(StartError::Spawn(e))
            }
        }
    }

    /// Request a stop. No-op when nothing is running or a stop is
    /// already pending.
    pub fn stop(&self) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.shared.cancel.cancel();
        }
    }

    /// Block until the current worker finishes
    pub fn wait(&mut self) -> Option<TestOutcome> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                let outcome = TestOutcome::Failed {
                    kind: FailureKind::Internal,
                    message: "worker thread panicked".to_string(),
                };
                self.shared.state.store(SessionState::Failed);
                self.shared.running.store(false, Ordering::SeqCst);
                self.received().outcome = Some(outcome.clone());
                Some(outcome)
            }
        }
    }

    /// Everything the worker has published so far. The lock is private to
    /// the control surface.
    fn received(&self) -> MutexGuard<'_, Snapshot> {
        let mut snapshot = self.snapshot.lock();
        for update in self.updates.try_iter() {
            snapshot.apply(update);
        }
        snapshot
    }

    /// Whether a worker is active
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.shared.state.load()
    }

    /// Transitions of the current or last session
    pub fn history(&self) -> Vec<StateTransition> {
        self.received().history.clone()
    }

    /// States visited by the current or last session
    pub fn path(&self) -> Vec<SessionState> {
        path_of(&self.received().history)
    }

    /// The event log (shared handle)
    pub fn log(&self) -> EventLog {
        self.shared.log.clone()
    }

    /// Token that stops the current session when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Latched detection of the current or last session
    pub fn detection(&self) -> Option<DetectionEvent> {
        self.received().detection.clone()
    }

    /// Outcome of the last finished session
    pub fn outcome(&self) -> Option<TestOutcome> {
        self.received().outcome.clone()
    }

    /// Id of the current or last session
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the current or last session started
    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    /// Poll cycles run by the current or last session
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::SeqCst)
    }

    /// Teardowns executed over the controller's lifetime
    pub fn teardown_count(&self) -> usize {
        self.shared.teardowns.load(Ordering::SeqCst)
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Everything the worker thread owns
struct Worker {
    id: Uuid,
    config: TestConfiguration,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    machine: SessionStateMachine,
    updates: Sender<WorkerUpdate>,
}

impl Worker {
    fn run(mut self) -> TestOutcome {
        let span = info_span!("test_session", id = %self.id, relay = %self.config.target());
        let _guard = span.enter();

        let mut shell = None;
        let outcome = self.execute(&mut shell);
        self.teardown(shell, outcome)
    }

    /// Apply a state change and publish it. A closed channel only means
    /// the controller is gone.
    fn transition(&mut self, state: SessionState, reason: Option<&str>) {
        if let Err(e) = self.machine.transition(state, reason) {
            warn!(error = %e, "Ignoring state change");
            return;
        }
        self.shared.state.store(state);
        if let Some(transition) = self.machine.history().last() {
            let _ = self.updates.send(WorkerUpdate::Transition(transition.clone()));
        }
    }

    fn execute(&mut self, slot: &mut Option<Box<dyn RemoteShell>>) -> TestOutcome {
        let log = self.shared.log.clone();
        let config = self.config.clone();

        log.info(format!("Connecting to {}...", config.target()));
        let shell = match self.connector.open(&config, config.connect_timeout) {
            Ok(shell) => slot.insert(shell),
            Err(e) => {
                log.error(format!("Connection error: {}", e));
                return TestOutcome::failed(&e);
            }
        };
        log.success("Connected!");

        self.transition(SessionState::Provisioning, None);
        let report = match Provisioner::new(&config, &log).setup(&mut **shell) {
            Ok(report) => report,
            Err(e) => {
                log.error(format!("Connection lost during setup: {}", e));
                return TestOutcome::Failed {
                    kind: FailureKind::ConnectionLost,
                    message: e.to_string(),
                };
            }
        };
        debug!(warnings = report.warnings.len(), processes = report.processes.len(), "Provisioning done");

        self.transition(SessionState::Monitoring, None);
        log.info("");
        log.success(BANNER);
        log.success("MONITORING FOR DATA");
        log.success(BANNER);
        log.info("");
        log.warning("Initiate connection from Dreamcast NOW");
        log.info("");

        self.monitor(&mut **shell)
    }

    fn monitor(&self, shell: &mut dyn RemoteShell) -> TestOutcome {
        let log = &self.shared.log;
        let timing = &self.config.timing;
        let mut poller = DualStreamPoller::new(&self.config.remote);
        let mut engine = DetectionEngine::new();
        let started = Instant::now();

        loop {
            if self.shared.cancel.is_cancelled() {
                log.warning("Stopping test...");
                return TestOutcome::Stopped;
            }

            let elapsed = started.elapsed();
            if elapsed >= timing.monitor_timeout {
                log.error("");
                log.error("TIMEOUT - No data detected");
                return TestOutcome::TimedOut { elapsed };
            }

            let cycle = match poller.poll(shell, &mut engine) {
                Ok(cycle) => cycle,
                Err(e) => {
                    log.error(format!("Connection lost: {}", e));
                    return TestOutcome::Failed {
                        kind: FailureKind::ConnectionLost,
                        message: e.to_string(),
                    };
                }
            };
            self.shared.cycles.store(cycle.cycle, Ordering::SeqCst);

            for (source, line) in &cycle.lines {
                log.info(format!("[{}] {}", source.tag(), line));
            }

            if let Some(event) = engine.event() {
                let _ = self.updates.send(WorkerUpdate::Detected(event.clone()));
                log.detection("");
                log.detection(BANNER);
                log.detection(">>> CONNECTION DETECTED! <<<");
                log.detection(">>> CABLE WORKS! <<<");
                log.detection(BANNER);
                info!(stream = %event.source, token = %event.token, cycle = event.cycle, "Handshake detected");
                return TestOutcome::Detected(event.clone());
            }

            thread::sleep(timing.poll_interval);
        }
    }

    fn teardown(&mut self, shell: Option<Box<dyn RemoteShell>>, outcome: TestOutcome) -> TestOutcome {
        if self.shared.torn_down.swap(true, Ordering::SeqCst) {
            return outcome;
        }

        if let Some(mut shell) = shell {
            shell.close();
        }

        let reason = match &outcome {
            TestOutcome::Detected(event) => event.line.clone(),
            TestOutcome::TimedOut { elapsed } => format!("no token after {:.1}s", elapsed.as_secs_f32()),
            TestOutcome::Stopped => "stop requested".to_string(),
            TestOutcome::Failed { message, .. } => message.clone(),
        };
        self.transition(outcome.state(), Some(&reason));
        let _ = self.updates.send(WorkerUpdate::Finished(outcome.clone()));

        let shared = &self.shared;
        shared.cancel.clear();
        shared.teardowns.fetch_add(1, Ordering::SeqCst);
        shared.running.store(false, Ordering::SeqCst);
        info!(state = %outcome.state(), "Test session finished");

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    impl Connector for Unreachable {
        fn open(
            &self,
            _config: &TestConfiguration,
            _timeout: Duration,
        ) -> Result<Box<dyn RemoteShell>, ConnectionError> {
            Err(ConnectionError::Network("No route to host".to_string()))
        }
    }

    /// Blocks inside `open` until released, then times out
    struct Gate(crossbeam_channel::Receiver<()>);

    impl Connector for Gate {
        fn open(
            &self,
            _config: &TestConfiguration,
            timeout: Duration,
        ) -> Result<Box<dyn RemoteShell>, ConnectionError> {
            let _ = self.0.recv();
            Err(ConnectionError::Timeout(timeout))
        }
    }

    #[test]
    fn test_control_reads_while_worker_is_busy() {
        let (release, gate) = crossbeam_channel::bounded(0);
        let mut session = TestSession::new(Arc::new(Gate(gate)));
        session.start(TestConfiguration::new("192.0.2.1")).unwrap();

        for _ in 0..100 {
            assert_eq!(session.state(), SessionState::Connecting);
            assert_eq!(session.path(), vec![SessionState::Idle, SessionState::Connecting]);
            assert!(session.outcome().is_none());
            assert!(session.detection().is_none());
        }
        release.send(()).unwrap();

        let outcome = session.wait().unwrap();
        assert!(matches!(outcome, TestOutcome::Failed { kind: FailureKind::Timeout, .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.outcome(), Some(outcome));
        assert_eq!(session.history().last().map(|t| t.to), Some(SessionState::Failed));
    }

    #[test]
    fn test_outcome_states() {
        assert_eq!(TestOutcome::Stopped.state(), SessionState::Stopped);
        assert_eq!(
            TestOutcome::TimedOut { elapsed: Duration::from_secs(120) }.state(),
            SessionState::TimedOut
        );
        let failed = TestOutcome::failed(&ConnectionError::Authentication("bad".to_string()));
        assert_eq!(failed.state(), SessionState::Failed);
        assert!(matches!(failed, TestOutcome::Failed { kind: FailureKind::Authentication, .. }));
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        other.cancel();
        assert!(token.is_cancelled());
        token.clear();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_invalid_config_refused_without_worker() {
        let mut session = TestSession::new(Arc::new(Unreachable));
        let err = session.start(TestConfiguration::default()).unwrap_err();
        assert!(matches!(err, StartError::InvalidConfiguration(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_running());
        assert!(session.wait().is_none());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let session = TestSession::new(Arc::new(Unreachable));
        session.stop();
        session.stop();
        assert!(!session.cancellation_token().is_cancelled());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.teardown_count(), 0);
    }

    #[test]
    fn test_unreachable_host_fails() {
        let mut session = TestSession::new(Arc::new(Unreachable));
        session.start(TestConfiguration::new("192.0.2.1")).unwrap();
        let outcome = session.wait().unwrap();

        assert!(matches!(outcome, TestOutcome::Failed { kind: FailureKind::Network, .. }));
        assert_eq!(
            session.path(),
            vec![SessionState::Idle, SessionState::Connecting, SessionState::Failed]
        );
        assert!(session.log().contains("Network error"));
        assert_eq!(session.teardown_count(), 1);
        assert!(!session.is_running());
    }
}
