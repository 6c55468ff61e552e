//! Shared utilities for handoff integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::unix::io::IntoRawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use graceful_handoff::http::{router, HttpServer, ServingHandle, Workload};
use graceful_handoff::lifecycle::handshake::{memory_channel, MemoryReadyNotifier, ReadyNotifier};
use graceful_handoff::lifecycle::spawner::{descriptor_contract, restart_markers};
use graceful_handoff::lifecycle::{
    event_queue, Coordinator, DrainPolicy, DrainReport, EventSender, LaunchedSuccessor,
    ProcessHandle, ProcessIdentity, RestartState, RestartStatus, SpawnError, SuccessorLauncher,
};
use graceful_handoff::net::{acquire, AcquireMode, ConnectionTracker, ListenerHandle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client with pooling disabled so every request opens a fresh connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

pub async fn get_text(client: &reqwest::Client, addr: SocketAddr) -> String {
    client
        .get(format!("http://{addr}/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

pub fn fast() -> Workload {
    Workload {
        slow_every_n: 0,
        work_duration: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(1),
    }
}

pub fn slow(work_duration: Duration) -> Workload {
    Workload {
        slow_every_n: 1,
        work_duration,
        heartbeat_interval: Duration::from_millis(100),
    }
}

pub fn drain_policy(deadline: Duration) -> DrainPolicy {
    DrainPolicy {
        deadline,
        poll_interval: Duration::from_millis(20),
        flush_grace: Duration::from_millis(500),
    }
}

/// A predecessor running in this test process.
pub struct Predecessor {
    pub identity: ProcessIdentity,
    pub tracker: ConnectionTracker,
    pub addr: SocketAddr,
    pub events: EventSender,
    pub status: watch::Receiver<Option<RestartStatus>>,
    pub run: JoinHandle<DrainReport>,
    listener: Weak<ListenerHandle>,
}

impl Predecessor {
    pub async fn start(
        workload: Workload,
        launcher: Arc<dyn SuccessorLauncher>,
        handshake_timeout: Duration,
        policy: DrainPolicy,
    ) -> Self {
        let identity = ProcessIdentity::fresh();
        let tracker = ConnectionTracker::new();
        let listener = acquire(AcquireMode::Fresh("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();

        let app = router(identity.clone(), workload, tracker.clone(), REQUEST_TIMEOUT);
        let serving = HttpServer::new(app, tracker.clone(), 64, identity.clone()).start(listener);
        let addr = serving.local_addr();
        let weak = serving.listener();

        let coordinator = Coordinator::new(
            identity.clone(),
            serving,
            tracker.clone(),
            launcher,
            handshake_timeout,
            policy,
        );
        let status = coordinator.restart_status();
        let (events, rx) = event_queue(8);
        let run = tokio::spawn(coordinator.run(rx));

        Self {
            identity,
            tracker,
            addr,
            events,
            status,
            run,
            listener: weak,
        }
    }

    pub fn listener_open(&self) -> bool {
        self.listener.upgrade().is_some()
    }

    pub async fn wait_listener_closed(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.listener_open() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("predecessor listener still open");
    }

    pub async fn wait_attempt(&mut self, attempt: u64, state: RestartState) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.status
                .wait_for(|s| matches!(s, Some(s) if s.attempt == attempt && s.state == state)),
        )
        .await
        .expect("restart attempt did not reach expected state")
        .unwrap();
    }
}

pub async fn wait_for_active(tracker: &ConnectionTracker, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while tracker.active_count() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("work did not start");
}

/// An in-process successor serving on the inherited listener.
pub struct Successor {
    pub identity: ProcessIdentity,
    pub serving: ServingHandle,
}

/// Launches a successor inside the test: the duplicated descriptor is adopted
/// through the inherited path and readiness is sent over a memory channel.
pub struct InProcessLauncher {
    workload: Workload,
    pub successor: Arc<Mutex<Option<Successor>>>,
}

impl InProcessLauncher {
    pub fn new(workload: Workload) -> Self {
        Self {
            workload,
            successor: Arc::new(Mutex::new(None)),
        }
    }

    pub fn successor_instance(&self) -> Option<String> {
        self.successor
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.identity.instance().to_string())
    }
}

impl SuccessorLauncher for InProcessLauncher {
    fn launch(&self, listener: &ListenerHandle) -> Result<LaunchedSuccessor, SpawnError> {
        let fd = listener
            .duplicate_for_child()
            .map_err(|source| SpawnError::Descriptor {
                kind: graceful_handoff::lifecycle::spawner::DescriptorKind::Listener,
                source,
            })?
            .into_raw_fd();
        let (mut notifier, waiter) = memory_channel();
        let workload = self.workload;
        let slot = self.successor.clone();

        tokio::spawn(async move {
            let identity = ProcessIdentity::successor();
            let tracker = ConnectionTracker::new();
            let listener = acquire(AcquireMode::Inherited(fd)).await.unwrap();
            let app = router(identity.clone(), workload, tracker.clone(), REQUEST_TIMEOUT);
            let serving = HttpServer::new(app, tracker, 64, identity.clone()).start(listener);
            *slot.lock().unwrap() = Some(Successor { identity, serving });
            notifier.notify_ready().unwrap();
        });

        Ok(LaunchedSuccessor {
            process: ProcessHandle::new(std::process::id(), descriptor_contract(), restart_markers()),
            ready: Box::new(waiter),
        })
    }
}

/// Launches nothing; the test holds the notifier and decides if and when
/// readiness is signalled.
#[derive(Default)]
pub struct SilentLauncher {
    pub notifiers: Mutex<Vec<MemoryReadyNotifier>>,
}

impl SilentLauncher {
    pub fn notify(&self, attempt_index: usize) -> std::io::Result<()> {
        self.notifiers.lock().unwrap()[attempt_index].notify_ready()
    }
}

impl SuccessorLauncher for SilentLauncher {
    fn launch(&self, _listener: &ListenerHandle) -> Result<LaunchedSuccessor, SpawnError> {
        let (notifier, waiter) = memory_channel();
        self.notifiers.lock().unwrap().push(notifier);
        Ok(LaunchedSuccessor {
            process: ProcessHandle::new(0, descriptor_contract(), restart_markers()),
            ready: Box::new(waiter),
        })
    }
}
