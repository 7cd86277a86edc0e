//! The supervisor state machine.
//!
//! One event-loop task owns all supervision state. It consumes service
//! lifecycle events from the bus (`service.start`, `service.stop`,
//! `service.svc-sessionchange`) and internal child-exit completions, and it
//! applies the restart policy: a child that dies young counts against a
//! failure budget, a child that lived past the healthy-runtime threshold
//! resets it, and exhausting the budget parks the supervisor until the next
//! logon.
//!
//! At most one child exists at a time; only `Idle` and `Backoff` accept a
//! start request, so concurrent spawn attempts cannot overlap by
//! construction.

mod connection;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus};
use crate::launcher::{ChildHandle, ChildLauncher, SpawnError, SpawnOptions};
use crate::pidfile::{self, ExitClass, PID_FILE_NAME};
use crate::HostRole;

/// Bus event requesting supervision to start.
pub const EVENT_SERVICE_START: &str = "service.start";
/// Bus event requesting supervision to stop; terminal.
pub const EVENT_SERVICE_STOP: &str = "service.stop";
/// Bus event carrying a session-change notification; the payload `type`
/// field holds the sub-event name.
pub const EVENT_SESSION_CHANGE: &str = "service.svc-sessionchange";
/// Session-change sub-event that triggers a start.
pub const SESSION_LOGON: &str = "session-logon";
/// Published with the child's pid once it has been spawned.
pub const EVENT_STARTED: &str = "started-gpii";
/// Published with the child's pid and exit code once it has terminated.
pub const EVENT_STOPPED: &str = "stopped-gpii";
/// Inbound child messages are republished under this prefix.
pub const EVENT_MESSAGE_PREFIX: &str = "gpii.message";
/// Publishing a message under this name sends it to the connected child.
pub const EVENT_SEND: &str = "gpii.send";

/// Restart throttling parameters.
///
/// The defaults implement the product behavior: up to three consecutive
/// failed starts, a 20-second runtime that counts as healthy, and a backoff
/// of `attempts * 10s + 1s` between retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Consecutive fast failures tolerated before giving up.
    #[serde(default = "default_max_failed_starts")]
    pub max_failed_starts: u32,

    /// Runtime after which a child counts as healthy and the failure count
    /// resets.
    #[serde(default = "default_min_healthy_runtime")]
    #[serde(with = "humantime_serde")]
    pub min_healthy_runtime: Duration,

    /// Per-attempt backoff increment.
    #[serde(default = "default_backoff_step")]
    #[serde(with = "humantime_serde")]
    pub backoff_step: Duration,

    /// Constant added to every backoff delay.
    #[serde(default = "default_backoff_floor")]
    #[serde(with = "humantime_serde")]
    pub backoff_floor: Duration,
}

const fn default_max_failed_starts() -> u32 {
    3
}

const fn default_min_healthy_runtime() -> Duration {
    Duration::from_secs(20)
}

const fn default_backoff_step() -> Duration {
    Duration::from_secs(10)
}

const fn default_backoff_floor() -> Duration {
    Duration::from_secs(1)
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_failed_starts: default_max_failed_starts(),
            min_healthy_runtime: default_min_healthy_runtime(),
            backoff_step: default_backoff_step(),
            backoff_floor: default_backoff_floor(),
        }
    }
}

impl RestartPolicy {
    /// Delay before re-entering `Starting` for the given attempt count.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        self.backoff_step * attempts + self.backoff_floor
    }
}

/// Consecutive-failure accounting for the restart policy.
///
/// Process-local; it is not persisted across service restarts.
#[derive(Debug, Default)]
pub struct RestartLedger {
    consecutive_failures: u32,
    last_start: Option<Instant>,
}

impl RestartLedger {
    /// Record a spawn attempt starting now.
    pub fn record_start(&mut self) {
        self.last_start = Some(Instant::now());
    }

    /// Time since the last recorded start; zero if none was recorded.
    #[must_use]
    pub fn runtime(&self) -> Duration {
        self.last_start.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Count a failure and return the new consecutive total.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    /// Reset the failure count (the child proved healthy, or a fresh logon
    /// starts a new episode).
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Current consecutive failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Externally observable supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// No child and no pending retry.
    Idle,
    /// A spawn attempt is in flight.
    Starting,
    /// A child is alive.
    Running,
    /// Waiting out a restart delay.
    Backoff,
    /// Failure budget exhausted; parked until the next logon.
    GivingUp,
}

impl std::fmt::Display for SupervisorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Backoff => write!(f, "backoff"),
            Self::GivingUp => write!(f, "giving-up"),
        }
    }
}

/// Internal completions posted back into the event loop.
enum Internal {
    SpawnFinished(Result<ChildHandle, SpawnError>),
    ChildExited { pid: u32, exit_code: u32 },
}

enum State {
    Idle,
    Starting,
    Running { pid: u32, driver: JoinHandle<()> },
    Backoff { attempts: u32 },
    GivingUp,
}

impl State {
    const fn status(&self) -> SupervisorStatus {
        match self {
            Self::Idle => SupervisorStatus::Idle,
            Self::Starting => SupervisorStatus::Starting,
            Self::Running { .. } => SupervisorStatus::Running,
            Self::Backoff { .. } => SupervisorStatus::Backoff,
            Self::GivingUp => SupervisorStatus::GivingUp,
        }
    }
}

/// The supervisor. Construct with its collaborators, then [`Supervisor::run`]
/// it on the event loop; it returns once `service.stop` has been processed.
pub struct Supervisor {
    bus: EventBus,
    /// Subscribed at construction so events published between construction
    /// and the first poll of [`Supervisor::run`] are not lost.
    events: tokio::sync::broadcast::Receiver<Event>,
    launcher: Arc<dyn ChildLauncher>,
    role: HostRole,
    command: String,
    policy: RestartPolicy,
    spawn_options: SpawnOptions,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    /// Create a supervisor.
    ///
    /// `command` is the child command line (empty means "host executable
    /// plus default entry"); the launcher, bus, role, and policy are the
    /// constructor-injected collaborators.
    #[must_use]
    pub fn new(
        bus: EventBus,
        launcher: Arc<dyn ChildLauncher>,
        role: HostRole,
        command: String,
        policy: RestartPolicy,
    ) -> Self {
        let (status_tx, _) = watch::channel(SupervisorStatus::Idle);
        let spawn_options = SpawnOptions {
            // A foreground host has no session boundary to respect.
            always_run: !role.is_service(),
            ..SpawnOptions::default()
        };
        let events = bus.subscribe();
        Self {
            bus,
            events,
            launcher,
            role,
            command,
            policy,
            spawn_options,
            status_tx,
        }
    }

    /// Override the spawn options (transport, extra environment, working
    /// directory). `always_run` stays tied to the host role.
    #[must_use]
    pub fn with_spawn_options(mut self, mut options: SpawnOptions) -> Self {
        options.always_run = !self.role.is_service();
        self.spawn_options = options;
        self
    }

    /// Watch externally observable state transitions.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    /// Run the event loop until `service.stop` is processed.
    ///
    /// Errors inside the loop are logged and absorbed; nothing that happens
    /// to one child may take the service down.
    pub async fn run(mut self) {
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let mut loop_state = LoopState {
            state: State::Idle,
            ledger: RestartLedger::default(),
            restart_at: None,
            internal_tx,
        };

        loop {
            let restart_at = loop_state.restart_at;
            let timer = async move {
                match restart_at {
                    Some(when) => tokio::time::sleep_until(when).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => {
                        if self.on_bus_event(&mut loop_state, &event) == Flow::Shutdown {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event bus lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                Some(message) = internal_rx.recv() => {
                    self.on_internal(&mut loop_state, message);
                }
                () = timer => {
                    loop_state.restart_at = None;
                    debug!("backoff elapsed");
                    self.try_start(&mut loop_state);
                }
            }
        }
    }

    fn set_state(&self, loop_state: &mut LoopState, state: State) {
        let status = state.status();
        loop_state.state = state;
        let _ = self.status_tx.send(status);
    }

    fn on_bus_event(&self, loop_state: &mut LoopState, event: &Event) -> Flow {
        match event.name.as_str() {
            EVENT_SERVICE_START => {
                self.request_start(loop_state, false);
                Flow::Continue
            }
            EVENT_SERVICE_STOP => {
                self.stop(loop_state);
                Flow::Shutdown
            }
            EVENT_SESSION_CHANGE => {
                let sub = event
                    .payload
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if sub == SESSION_LOGON {
                    self.request_start(loop_state, true);
                } else {
                    debug!(sub, "session change ignored");
                }
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn request_start(&self, loop_state: &mut LoopState, from_logon: bool) {
        let accepted = match loop_state.state {
            State::Idle | State::Backoff { .. } => true,
            State::GivingUp => from_logon,
            State::Starting | State::Running { .. } => false,
        };
        if !accepted {
            debug!(
                state = %loop_state.state.status(),
                from_logon, "start request rejected"
            );
            return;
        }
        if from_logon && matches!(loop_state.state, State::GivingUp) {
            // A fresh logon opens a new episode.
            loop_state.ledger.reset_failures();
        }
        loop_state.restart_at = None;
        self.try_start(loop_state);
    }

    fn try_start(&self, loop_state: &mut LoopState) {
        if self.role.is_service() && !self.launcher.is_user_logged_on() {
            info!("no interactive user; staying idle");
            self.set_state(loop_state, State::Idle);
            return;
        }

        // An instance may already exist, possibly started by the user.
        if let Some(pid) = self.external_instance() {
            info!(pid, "another instance is already running; not spawning");
            self.set_state(loop_state, State::Idle);
            return;
        }

        self.set_state(loop_state, State::Starting);
        loop_state.ledger.record_start();

        let launcher = Arc::clone(&self.launcher);
        let command = self.command.clone();
        let options = self.spawn_options.clone();
        let tx = loop_state.internal_tx.clone();
        tokio::spawn(async move {
            let result = launcher.spawn_child(&command, options).await;
            let _ = tx.send(Internal::SpawnFinished(result));
        });
    }

    fn external_instance(&self) -> Option<u32> {
        let dir = self.launcher.user_data_dir()?;
        let path = dir.join(PID_FILE_NAME);
        pidfile::live_instance(&path, |pid| self.launcher.process_alive(pid))
    }

    fn on_internal(&self, loop_state: &mut LoopState, message: Internal) {
        match message {
            Internal::SpawnFinished(result) => self.on_spawn_finished(loop_state, result),
            Internal::ChildExited { pid, exit_code } => {
                self.on_child_exited(loop_state, pid, exit_code);
            }
        }
    }

    fn on_spawn_finished(
        &self,
        loop_state: &mut LoopState,
        result: Result<ChildHandle, SpawnError>,
    ) {
        if !matches!(loop_state.state, State::Starting) {
            // A stop raced the spawn; the result is discarded.
            if let Ok(child) = result {
                debug!(pid = child.pid, "discarding spawn result after stop");
                self.launcher.kill(child.pid);
            }
            return;
        }

        match result {
            Ok(child) => {
                let pid = child.pid;
                self.bus.publish(EVENT_STARTED, json!({ "pid": pid }));
                let bus = self.bus.clone();
                let tx = loop_state.internal_tx.clone();
                let driver = tokio::spawn(async move {
                    let exit_code = connection::drive(child, bus).await;
                    let _ = tx.send(Internal::ChildExited { pid, exit_code });
                });
                self.set_state(loop_state, State::Running { pid, driver });
            }
            Err(SpawnError::NoInteractiveUser) => {
                info!("no interactive user; staying idle");
                self.set_state(loop_state, State::Idle);
            }
            Err(err) => {
                warn!(%err, "child start failed");
                self.register_failure(loop_state);
            }
        }
    }

    fn on_child_exited(&self, loop_state: &mut LoopState, pid: u32, exit_code: u32) {
        match loop_state.state {
            State::Running { pid: running, .. } if running == pid => {}
            _ => {
                debug!(pid, "stale child exit ignored");
                return;
            }
        }

        self.bus
            .publish(EVENT_STOPPED, json!({ "pid": pid, "code": exit_code }));

        let runtime = loop_state.ledger.runtime();
        if runtime >= self.policy.min_healthy_runtime {
            loop_state.ledger.reset_failures();
        }

        match self.classify_exit(pid) {
            ExitClass::Clean => {
                info!(pid, exit_code, "user process exited cleanly");
                self.set_state(loop_state, State::Idle);
            }
            ExitClass::Crashed => {
                warn!(pid, exit_code, ?runtime, "user process crashed");
                self.register_failure(loop_state);
            }
        }
    }

    /// Classify an exit against the pid file. An unreadable data directory
    /// counts as clean: without a pid file there is no crash evidence.
    fn classify_exit(&self, pid: u32) -> ExitClass {
        self.launcher.user_data_dir().map_or(ExitClass::Clean, |dir| {
            pidfile::classify_exit(&dir.join(PID_FILE_NAME), pid)
        })
    }

    fn register_failure(&self, loop_state: &mut LoopState) {
        let attempts = loop_state.ledger.record_failure();
        if attempts > self.policy.max_failed_starts {
            error!(
                attempts,
                "user process keeps failing; giving up until the next logon"
            );
            self.set_state(loop_state, State::GivingUp);
            return;
        }
        let delay = self.policy.delay_for_attempt(attempts);
        info!(attempts, ?delay, "scheduling restart");
        loop_state.restart_at = Some(Instant::now() + delay);
        self.set_state(loop_state, State::Backoff { attempts });
    }

    fn stop(&self, loop_state: &mut LoopState) {
        loop_state.restart_at = None;
        if let State::Running { pid, driver } =
            std::mem::replace(&mut loop_state.state, State::Idle)
        {
            info!(pid, "stopping user process");
            self.launcher.kill(pid);
            driver.abort();
        }
        self.set_state(loop_state, State::Idle);
    }
}

struct LoopState {
    state: State,
    ledger: RestartLedger,
    restart_at: Option<Instant>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_from_the_floor() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(11));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(21));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(31));
    }

    #[test]
    fn policy_defaults_match_the_product_constants() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_failed_starts, 3);
        assert_eq!(policy.min_healthy_runtime, Duration::from_secs(20));
    }

    #[test]
    fn policy_deserializes_humantime_durations() {
        let policy: RestartPolicy =
            serde_json::from_str(r#"{"min_healthy_runtime": "30s", "max_failed_starts": 5}"#)
                .unwrap();
        assert_eq!(policy.min_healthy_runtime, Duration::from_secs(30));
        assert_eq!(policy.max_failed_starts, 5);
        // unspecified fields keep their defaults
        assert_eq!(policy.backoff_step, Duration::from_secs(10));
    }

    #[test]
    fn ledger_counts_failures_monotonically() {
        let mut ledger = RestartLedger::default();
        assert_eq!(ledger.record_failure(), 1);
        assert_eq!(ledger.record_failure(), 2);
        assert_eq!(ledger.record_failure(), 3);
        ledger.reset_failures();
        assert_eq!(ledger.consecutive_failures(), 0);
        assert_eq!(ledger.record_failure(), 1);
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
