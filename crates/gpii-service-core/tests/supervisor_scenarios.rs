//! End-to-end supervisor scenarios against a fake launcher.
//!
//! The fake spawns no processes: each "child" is an in-memory duplex stream
//! plus an exit channel, driven by the test body, and the pid file lives in
//! a temp directory. Time is paused, so backoff schedules are observed
//! exactly rather than slept through.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gpii_service_core::bus::EventBus;
use gpii_service_core::launcher::{
    ChildHandle, ChildLauncher, SpawnError, SpawnOptions,
};
use gpii_service_core::pidfile::PID_FILE_NAME;
use gpii_service_core::protocol::{Message, MessageCodec};
use gpii_service_core::supervisor::{
    RestartPolicy, Supervisor, SupervisorStatus, EVENT_SERVICE_START, EVENT_SERVICE_STOP,
    EVENT_SESSION_CHANGE, EVENT_STARTED,
};
use gpii_service_core::transport::ServerEndpoint;
use gpii_service_core::{HostRole, Win32Error};
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;

/// One fake child, handed to the test body to play the user process.
struct FakeChild {
    pid: u32,
    io: DuplexStream,
    exit: oneshot::Sender<u32>,
    pid_file: PathBuf,
}

struct FakeLauncher {
    logged_on: AtomicBool,
    fail_spawns: AtomicBool,
    data_dir: PathBuf,
    alive: Mutex<HashSet<u32>>,
    killed: Mutex<Vec<u32>>,
    next_pid: AtomicU32,
    spawn_times: Mutex<Vec<Instant>>,
    spawned_tx: mpsc::UnboundedSender<FakeChild>,
}

impl FakeLauncher {
    fn new(data_dir: PathBuf) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeChild>) {
        let (spawned_tx, spawned_rx) = mpsc::unbounded_channel();
        let launcher = Arc::new(Self {
            logged_on: AtomicBool::new(true),
            fail_spawns: AtomicBool::new(false),
            data_dir,
            alive: Mutex::new(HashSet::new()),
            killed: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(1000),
            spawn_times: Mutex::new(Vec::new()),
            spawned_tx,
        });
        (launcher, spawned_rx)
    }

    fn spawn_times(&self) -> Vec<Instant> {
        self.spawn_times.lock().unwrap().clone()
    }

    fn mark_alive(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    fn killed_pids(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChildLauncher for FakeLauncher {
    fn is_user_logged_on(&self) -> bool {
        self.logged_on.load(Ordering::SeqCst)
    }

    async fn spawn_child(
        &self,
        _command: &str,
        _opts: SpawnOptions,
    ) -> Result<ChildHandle, SpawnError> {
        self.spawn_times.lock().unwrap().push(Instant::now());
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(SpawnError::ChildStartFailed(Win32Error::new(5)));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (server, client) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exited) = oneshot::channel();
        self.spawned_tx
            .send(FakeChild {
                pid,
                io: client,
                exit: exit_tx,
                pid_file: self.data_dir.join(PID_FILE_NAME),
            })
            .expect("test dropped the spawn receiver");

        Ok(ChildHandle {
            pid,
            started_at: chrono::Utc::now(),
            endpoint: ServerEndpoint::Ready(Box::new(server)),
            exited,
        })
    }

    fn kill(&self, pid: u32) {
        self.killed.lock().unwrap().push(pid);
    }

    fn process_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn user_data_dir(&self) -> Option<PathBuf> {
        Some(self.data_dir.clone())
    }
}

/// Play a child that writes its pid file, lives for `lifetime`, then exits.
/// A crashing child leaves the pid file behind; a clean one removes it.
async fn run_fake_child(child: FakeChild, lifetime: Duration, crash: bool, exit_code: u32) {
    std::fs::write(&child.pid_file, child.pid.to_string()).unwrap();
    tokio::time::sleep(lifetime).await;
    if !crash {
        let _ = std::fs::remove_file(&child.pid_file);
    }
    drop(child.io);
    let _ = child.exit.send(exit_code);
}

struct Harness {
    bus: EventBus,
    launcher: Arc<FakeLauncher>,
    spawned: mpsc::UnboundedReceiver<FakeChild>,
    status: tokio::sync::watch::Receiver<SupervisorStatus>,
    run: Option<tokio::task::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

fn start_supervisor(role: HostRole) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, spawned) = FakeLauncher::new(dir.path().to_path_buf());
    let bus = EventBus::new();
    let supervisor = Supervisor::new(
        bus.clone(),
        Arc::clone(&launcher) as Arc<dyn ChildLauncher>,
        role,
        "node child.js <pipe>".to_string(),
        RestartPolicy::default(),
    );
    let status = supervisor.status();
    let run = tokio::spawn(supervisor.run());
    Harness {
        bus,
        launcher,
        spawned,
        status,
        run: Some(run),
        _dir: dir,
    }
}

async fn next_child(harness: &mut Harness) -> FakeChild {
    timeout(Duration::from_secs(300), harness.spawned.recv())
        .await
        .expect("expected a spawn")
        .expect("launcher gone")
}

async fn expect_no_spawn(harness: &mut Harness, window: Duration) {
    assert!(
        timeout(window, harness.spawned.recv()).await.is_err(),
        "unexpected spawn"
    );
}

async fn wait_for_status(harness: &mut Harness, wanted: SupervisorStatus) {
    timeout(Duration::from_secs(300), async {
        loop {
            if *harness.status.borrow() == wanted {
                return;
            }
            harness.status.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {wanted:?}"));
}

#[tokio::test(start_paused = true)]
async fn happy_spawn_emits_started_then_hello() {
    let mut harness = start_supervisor(HostRole::ForegroundUser);
    let mut events = harness.bus.subscribe();
    harness.bus.publish(EVENT_SERVICE_START, Value::Null);

    let child = next_child(&mut harness).await;
    let pid = child.pid;
    std::fs::write(&child.pid_file, pid.to_string()).unwrap();

    let mut framed = Framed::new(child.io, MessageCodec::new());
    framed
        .send(&Message::new("hello", json!({"cwd": "C:\\work"})))
        .await
        .unwrap();

    // started-gpii first, carrying the pid...
    let started = loop {
        let event = events.recv().await.unwrap();
        if event.name == EVENT_STARTED {
            break event;
        }
        assert!(
            !event.name.starts_with("gpii.message."),
            "message event before started-gpii"
        );
    };
    assert_eq!(started.payload, json!({"pid": pid}));

    // ...then the child's hello, payload intact.
    let hello = loop {
        let event = events.recv().await.unwrap();
        if event.name == "gpii.message.hello" {
            break event;
        }
    };
    assert_eq!(hello.payload, json!({"cwd": "C:\\work"}));

    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
    assert_eq!(harness.launcher.killed_pids(), vec![pid]);
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_with_pong_same_payload() {
    let mut harness = start_supervisor(HostRole::ForegroundUser);
    harness.bus.publish(EVENT_SERVICE_START, Value::Null);

    let child = next_child(&mut harness).await;
    std::fs::write(&child.pid_file, child.pid.to_string()).unwrap();

    let mut framed = Framed::new(child.io, MessageCodec::new());
    framed.send(&Message::new("ping", json!(42))).await.unwrap();

    let pong = timeout(Duration::from_secs(10), async {
        loop {
            let msg = framed.next().await.unwrap().unwrap();
            if msg.kind == Message::PONG {
                return msg;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(pong.payload, json!(42));

    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn crash_loop_backs_off_then_gives_up_until_logon() {
    let mut harness = start_supervisor(HostRole::ForegroundUser);
    harness.bus.publish(EVENT_SERVICE_START, Value::Null);

    // Four fast-crashing children: 1s of life each, pid file left behind.
    for _ in 0..4 {
        let child = next_child(&mut harness).await;
        tokio::spawn(run_fake_child(child, Duration::from_secs(1), true, 3));
    }

    wait_for_status(&mut harness, SupervisorStatus::GivingUp).await;
    expect_no_spawn(&mut harness, Duration::from_secs(120)).await;

    // Gaps between attempts: 1s of life plus backoffs of 11s, 21s, 31s.
    let times = harness.launcher.spawn_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, backoff) in gaps.iter().zip([11u64, 21, 31]) {
        let expected = Duration::from_secs(backoff + 1);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_secs(2),
            "gap {gap:?}, expected about {expected:?}"
        );
    }

    // A fresh logon opens a new episode.
    harness.bus.publish(
        EVENT_SESSION_CHANGE,
        json!({"type": "session-logon", "sessionId": 1}),
    );
    let child = next_child(&mut harness).await;
    assert!(child.pid > 1003);

    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn healthy_run_resets_the_failure_count() {
    let mut harness = start_supervisor(HostRole::ForegroundUser);
    harness.bus.publish(EVENT_SERVICE_START, Value::Null);

    // Two fast crashes first...
    for _ in 0..2 {
        let child = next_child(&mut harness).await;
        tokio::spawn(run_fake_child(child, Duration::from_secs(1), true, 3));
    }

    // ...then a healthy 60s run that still crashes in the end.
    let child = next_child(&mut harness).await;
    tokio::spawn(run_fake_child(child, Duration::from_secs(60), true, 3));

    // The reset means the next backoff is the first tier again (11s), not
    // the third; two more fast crashes may then follow before giving up.
    let child = next_child(&mut harness).await;
    let times = harness.launcher.spawn_times();
    let gap = times[3] - times[2];
    let expected = Duration::from_secs(60 + 11);
    assert!(
        gap >= expected && gap < expected + Duration::from_secs(2),
        "gap {gap:?}, expected about {expected:?}"
    );
    drop(child);

    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn clean_exit_goes_idle_without_restart() {
    let mut harness = start_supervisor(HostRole::ForegroundUser);
    harness.bus.publish(EVENT_SERVICE_START, Value::Null);

    let child = next_child(&mut harness).await;
    wait_for_status(&mut harness, SupervisorStatus::Running).await;
    tokio::spawn(run_fake_child(child, Duration::from_secs(5), false, 0));

    wait_for_status(&mut harness, SupervisorStatus::Idle).await;
    expect_no_spawn(&mut harness, Duration::from_secs(120)).await;

    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn external_instance_prevents_spawning() {
    let mut harness = start_supervisor(HostRole::ForegroundUser);

    // A pid file naming a live, unrelated process.
    std::fs::write(harness.launcher.data_dir.join(PID_FILE_NAME), "9999").unwrap();
    harness.launcher.mark_alive(9999);

    harness.bus.publish(EVENT_SERVICE_START, Value::Null);
    expect_no_spawn(&mut harness, Duration::from_secs(60)).await;
    assert_eq!(*harness.status.borrow(), SupervisorStatus::Idle);

    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_starts_count_against_the_budget() {
    let mut harness = start_supervisor(HostRole::ForegroundUser);
    harness.launcher.fail_spawns.store(true, Ordering::SeqCst);

    harness.bus.publish(EVENT_SERVICE_START, Value::Null);
    wait_for_status(&mut harness, SupervisorStatus::GivingUp).await;
    assert_eq!(harness.launcher.spawn_times().len(), 4);

    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_a_pending_restart() {
    let mut harness = start_supervisor(HostRole::ForegroundUser);
    harness.bus.publish(EVENT_SERVICE_START, Value::Null);

    // One fast crash puts the supervisor into backoff.
    let child = next_child(&mut harness).await;
    run_fake_child(child, Duration::from_secs(1), true, 3).await;
    wait_for_status(&mut harness, SupervisorStatus::Backoff).await;

    // Stop during the backoff window; the timer must not fire afterwards.
    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
    expect_no_spawn(&mut harness, Duration::from_secs(120)).await;
    assert_eq!(harness.launcher.spawn_times().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn service_role_without_user_stays_idle() {
    let mut harness = start_supervisor(HostRole::WindowsService);
    harness.launcher.logged_on.store(false, Ordering::SeqCst);

    harness.bus.publish(EVENT_SERVICE_START, Value::Null);
    expect_no_spawn(&mut harness, Duration::from_secs(60)).await;
    assert_eq!(*harness.status.borrow(), SupervisorStatus::Idle);

    // The user logs on; supervision starts.
    harness.launcher.logged_on.store(true, Ordering::SeqCst);
    harness.bus.publish(
        EVENT_SESSION_CHANGE,
        json!({"type": "session-logon", "sessionId": 2}),
    );
    let _child = next_child(&mut harness).await;

    harness.bus.publish(EVENT_SERVICE_STOP, Value::Null);
    harness.run.take().unwrap().await.unwrap();
}
