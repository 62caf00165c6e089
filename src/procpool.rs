//! Subprocess worker pool (the `process` backend).
//!
//! Each worker is a separate `postguard worker` process with its own
//! configuration and plugin instances. Accepted sockets are handed to
//! workers as file descriptors (`SCM_RIGHTS`) over a Unix datagram
//! socketpair that all workers inherit; a second socketpair carries
//! statistics and state events back to the parent.
//!
//! Hand-off protocol, parent side:
//!   - a worker announces readiness with a one-byte credit datagram;
//!   - the dispatcher matches one queued session to one credit and sends a
//!     task datagram carrying the socket descriptor;
//!   - shutdown closes the queue, answers everything still queued with a
//!     `defer`, then sends one poison-pill datagram per worker.
//!
//! The parent closes its copy of every descriptor after hand-off; the
//! worker owning it closes it at session end.

use std::io::{IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, send, sendmsg, setsockopt, socketpair, sockopt, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::time::TimeVal;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::addrcheck;
use crate::config::Config;
use crate::plugins;
use crate::session::{SessionHandler, UNAVAILABLE_MESSAGE};
use crate::stats::{StatsKeeper, WorkerEvent};
use crate::suspect::{Action, Verdict};

pub const DEFAULT_QUEUE_SIZE: usize = 100;

const JOIN_TIMEOUT: Duration = Duration::from_secs(120);

// Datagram tags on the task queue.
const TAG_POISON: u8 = 0;
const TAG_TASK: u8 = 1;
const TAG_CREDIT: u8 = 2;

// Event-queue sentinel that stops the parent's listener.
const EVENT_SENTINEL: &[u8] = b"null";

const TASK_FD_ENV: &str = "POSTGUARD_TASK_FD";
const EVENT_FD_ENV: &str = "POSTGUARD_EVENT_FD";
const WORKER_NAME_ENV: &str = "POSTGUARD_WORKER_NAME";

pub struct ProcPoolOptions {
    /// Worker process count, already resolved by the controller.
    pub numprocs: usize,
    /// Parent-side task queue capacity.
    pub queuesize: usize,
    /// Configuration file workers load at startup.
    pub config_path: PathBuf,
    /// Executable to spawn; defaults to the current one. Overridable so
    /// integration tests can point at the built binary.
    pub worker_exe: Option<PathBuf>,
}

struct WorkerHandle {
    name: String,
    child: tokio::process::Child,
}

pub struct ProcPool {
    workers: Vec<WorkerHandle>,
    tasks: Option<mpsc::Sender<TcpStream>>,
    dispatcher: JoinHandle<()>,
    listener: JoinHandle<()>,
    /// Parent end of the task pair; used for poison pills at shutdown.
    task_parent: OwnedFd,
    /// Worker end of the event pair; used for the listener sentinel.
    event_child: OwnedFd,
    worker_states: Arc<DashMap<String, String>>,
    stayalive: Arc<AtomicBool>,
    queuesize: usize,
}

impl ProcPool {
    pub async fn start(options: ProcPoolOptions, stats: Arc<StatsKeeper>) -> anyhow::Result<Self> {
        let queuesize = options.queuesize.max(1);
        tracing::info!(
            numprocs = options.numprocs,
            queuesize,
            "starting process pool"
        );

        // Neither pair is CLOEXEC: workers inherit the descriptors at the
        // numbers announced through the environment.
        let (task_parent, task_child) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .context("could not create task socketpair")?;
        let (event_parent, event_child) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .context("could not create event socketpair")?;

        let stayalive = Arc::new(AtomicBool::new(true));
        let worker_states: Arc<DashMap<String, String>> = Arc::new(DashMap::new());

        let exe = match &options.worker_exe {
            Some(path) => path.clone(),
            None => std::env::current_exe().context("could not determine worker executable")?,
        };
        let mut workers = Vec::with_capacity(options.numprocs);
        for id in 1..=options.numprocs {
            let name = format!("Worker-{id}");
            tracing::debug!(worker = %name, "creating worker");
            let child = tokio::process::Command::new(&exe)
                .arg("worker")
                .arg("--config")
                .arg(&options.config_path)
                .env(TASK_FD_ENV, task_child.as_raw_fd().to_string())
                .env(EVENT_FD_ENV, event_child.as_raw_fd().to_string())
                .env(WORKER_NAME_ENV, &name)
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("could not spawn {name}"))?;
            workers.push(WorkerHandle { name, child });
        }
        drop(task_child);

        let (tasks_tx, tasks_rx) = mpsc::channel::<TcpStream>(queuesize);
        let dispatcher_fd = task_parent
            .try_clone()
            .context("could not duplicate task descriptor")?;
        let dispatcher = {
            let stayalive = Arc::clone(&stayalive);
            tokio::task::spawn_blocking(move || dispatch_loop(dispatcher_fd, tasks_rx, stayalive))
        };

        let listener = {
            let stats = Arc::clone(&stats);
            let states = Arc::clone(&worker_states);
            tokio::task::spawn_blocking(move || event_loop(event_parent, stats, states))
        };

        Ok(ProcPool {
            workers,
            tasks: Some(tasks_tx),
            dispatcher,
            listener,
            task_parent,
            event_child,
            worker_states,
            stayalive,
            queuesize,
        })
    }

    /// Queue an accepted connection for the next free worker; waits while
    /// the queue is at capacity. After shutdown has begun the connection is
    /// deferred immediately.
    pub async fn add_task(&self, mut stream: TcpStream) {
        if !self.stayalive.load(Ordering::SeqCst) {
            crate::session::defer_unavailable(&mut stream).await;
            return;
        }
        if let Some(tasks) = &self.tasks {
            if let Err(mut rejected) = tasks.send(stream).await {
                crate::session::defer_unavailable(&mut rejected.0).await;
            }
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn queuesize(&self) -> usize {
        self.queuesize
    }

    /// Per-worker state strings (`"waiting for task"`, `"starting scan
    /// session"`, `"ended"`, `"crashed"`), as last reported.
    pub fn worker_states(&self) -> Arc<DashMap<String, String>> {
        Arc::clone(&self.worker_states)
    }

    /// Poison-pill shutdown: stop intake, defer everything still queued,
    /// send one pill per worker, join children and the event listener.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down process pool, sending poison pills");
        self.stayalive.store(false, Ordering::SeqCst);
        self.tasks.take();

        // The dispatcher drains the closed queue, answering each pending
        // session with a defer so no client is left hanging.
        if tokio::time::timeout(JOIN_TIMEOUT, &mut self.dispatcher)
            .await
            .is_err()
        {
            tracing::warn!("task dispatcher did not stop within join timeout");
        }

        // FIFO: any task already handed to the socket is consumed before
        // the pills that follow it.
        for _ in &self.workers {
            if let Err(err) = send(
                self.task_parent.as_raw_fd(),
                &[TAG_POISON],
                MsgFlags::empty(),
            ) {
                tracing::warn!(%err, "could not send poison pill");
            }
        }

        for worker in &mut self.workers {
            match tokio::time::timeout(JOIN_TIMEOUT, worker.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(worker = %worker.name, %status, "worker exited")
                }
                Ok(Err(err)) => tracing::warn!(worker = %worker.name, %err, "could not join worker"),
                Err(_) => {
                    tracing::warn!(worker = %worker.name, "worker did not exit, killing");
                    let _ = worker.child.start_kill();
                }
            }
        }

        if let Err(err) = send(self.event_child.as_raw_fd(), EVENT_SENTINEL, MsgFlags::empty()) {
            tracing::warn!(%err, "could not send event sentinel");
        }
        if tokio::time::timeout(JOIN_TIMEOUT, &mut self.listener)
            .await
            .is_err()
        {
            tracing::warn!("event listener did not stop within join timeout");
        }
        tracing::debug!("process pool shut down");
    }
}

/// Parent-side dispatcher: one queued session per worker credit. Runs on
/// the blocking pool; the receive timeout keeps shutdown responsive.
fn dispatch_loop(
    fd: OwnedFd,
    mut tasks: mpsc::Receiver<TcpStream>,
    stayalive: Arc<AtomicBool>,
) {
    // Poll interval for the credit wait, so shutdown can interrupt it.
    let credit_poll = TimeVal::new(0, 250_000);
    if let Err(err) = setsockopt(&fd, sockopt::ReceiveTimeout, &credit_poll) {
        tracing::warn!(%err, "could not set credit poll timeout");
    }
    let raw = fd.as_raw_fd();
    let mut deferred: usize = 0;

    'tasks: while let Some(stream) = tasks.blocking_recv() {
        if !stayalive.load(Ordering::SeqCst) {
            defer_blocking(stream);
            deferred += 1;
            continue;
        }
        // wait for a worker to announce readiness
        let mut credit = [0u8; 1];
        loop {
            match nix::sys::socket::recv(raw, &mut credit, MsgFlags::empty()) {
                Ok(_) => break,
                Err(Errno::EAGAIN | Errno::EINTR) => {
                    if !stayalive.load(Ordering::SeqCst) {
                        defer_blocking(stream);
                        deferred += 1;
                        continue 'tasks;
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "task queue receive failed");
                    defer_blocking(stream);
                    deferred += 1;
                    continue 'tasks;
                }
            }
        }

        let std_stream = match stream.into_std() {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(%err, "could not detach session socket");
                continue;
            }
        };
        let payload = [TAG_TASK];
        let iov = [IoSlice::new(&payload)];
        let fds = [std_stream.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        if let Err(err) = sendmsg::<UnixAddr>(raw, &iov, &cmsg, MsgFlags::empty(), None) {
            tracing::error!(%err, "could not hand session to worker, deferring");
            defer_std(std_stream);
            deferred += 1;
        }
        // hand-off complete: std_stream drops here, closing the parent copy
    }

    if deferred > 0 {
        tracing::info!(
            count = deferred,
            message = UNAVAILABLE_MESSAGE,
            "marked queued sessions as deferred to close queue"
        );
    }
}

/// Answer a session with the standard unavailable-defer without running any
/// plugins. Blocking variant for the dispatcher.
fn defer_blocking(stream: TcpStream) {
    match stream.into_std() {
        Ok(std_stream) => defer_std(std_stream),
        Err(err) => tracing::warn!(%err, "could not detach queued session"),
    }
}

fn defer_std(mut stream: std::net::TcpStream) {
    let verdict = Verdict::with_argument(Action::Defer, UNAVAILABLE_MESSAGE);
    let payload = format!("action={}\n\n", verdict);
    let _ = stream.set_nonblocking(false);
    if let Err(err) = stream.write_all(payload.as_bytes()) {
        tracing::warn!(%err, "could not defer queued session");
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

/// Parent-side event listener: applies worker statistics and state updates
/// until the shutdown sentinel arrives.
fn event_loop(fd: OwnedFd, stats: Arc<StatsKeeper>, states: Arc<DashMap<String, String>>) {
    let raw = fd.as_raw_fd();
    let mut buf = [0u8; 4096];
    loop {
        let len = match nix::sys::socket::recv(raw, &mut buf, MsgFlags::empty()) {
            Ok(len) => len,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                tracing::warn!(%err, "event queue receive failed");
                break;
            }
        };
        let payload = &buf[..len];
        if payload == EVENT_SENTINEL {
            break;
        }
        match serde_json::from_slice::<WorkerEvent>(payload) {
            Ok(WorkerEvent::StatsDelta { total, scantime }) => stats.increase(total, scantime),
            Ok(WorkerEvent::WorkerState { name, state }) => {
                tracing::trace!(worker = %name, %state, "worker state");
                states.insert(name, state);
            }
            Err(err) => tracing::warn!(%err, "unreadable worker event"),
        }
    }
    tracing::debug!("event listener stopped");
}

/// Sends events from a worker process back to the parent. Best-effort: a
/// full or torn event queue never takes a worker down.
struct EventSender {
    fd: RawFd,
    name: String,
}

impl EventSender {
    fn send(&self, event: &WorkerEvent) {
        match serde_json::to_vec(event) {
            Ok(payload) => {
                if let Err(err) = send(self.fd, &payload, MsgFlags::empty()) {
                    tracing::debug!(%err, "could not publish worker event");
                }
            }
            Err(err) => tracing::debug!(%err, "could not encode worker event"),
        }
    }

    fn publish_state(&self, state: &str) {
        self.send(&WorkerEvent::WorkerState {
            name: self.name.clone(),
            state: state.to_string(),
        });
    }
}

/// Worker process entry point: load configuration and plugins, then serve
/// sessions from the inherited task queue until the poison pill arrives.
pub fn run_worker(config_path: &Path) -> anyhow::Result<()> {
    // SIGHUP reconfigures the parent; workers are replaced wholesale on
    // reload and must not react to it.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGHUP,
            nix::sys::signal::SigHandler::SigIgn,
        )
    }
    .context("could not ignore SIGHUP")?;

    let name = std::env::var(WORKER_NAME_ENV)
        .unwrap_or_else(|_| format!("Worker-{}", std::process::id()));
    let task_fd: RawFd = std::env::var(TASK_FD_ENV)
        .context("missing task queue descriptor")?
        .parse()
        .context("invalid task queue descriptor")?;
    let event_fd: RawFd = std::env::var(EVENT_FD_ENV)
        .context("missing event queue descriptor")?
        .parse()
        .context("invalid event queue descriptor")?;

    let events = EventSender {
        fd: event_fd,
        name: name.clone(),
    };
    events.publish_state("loading configuration");

    // Workers run an independent copy of configuration and plugins; the
    // address checker must be re-applied rather than assumed.
    let mut config = Config::from_file(config_path)?;
    config.propagate_defaults(crate::controller::core_required_vars(), "main");
    addrcheck::install(
        config
            .get("main", "address_compliance_checker")
            .unwrap_or("Default"),
    );
    let (loaded, all_ok) = plugins::load_all(&config, config.get("main", "plugins").unwrap_or(""));
    if !all_ok {
        events.publish_state("crashed");
        anyhow::bail!("some plugins failed to load in worker {name}");
    }
    plugins::propagate_plugin_defaults(&mut config, &loaded);
    let config = Arc::new(config);
    let plugins = Arc::new(loaded);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not build worker runtime")?;

    tracing::info!(worker = %name, plugins = plugins.len(), "worker ready");
    let result = worker_loop(&runtime, task_fd, &events, config, plugins);
    match &result {
        Ok(()) => events.publish_state("ended"),
        Err(err) => {
            tracing::error!(worker = %name, error = ?err, "worker crashed");
            events.publish_state("crashed");
        }
    }
    result
}

fn worker_loop(
    runtime: &tokio::runtime::Runtime,
    task_fd: RawFd,
    events: &EventSender,
    config: Arc<Config>,
    plugins: Arc<Vec<Arc<dyn plugins::Plugin>>>,
) -> anyhow::Result<()> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    loop {
        events.publish_state("waiting for task");
        send(task_fd, &[TAG_CREDIT], MsgFlags::empty()).context("could not announce readiness")?;

        let mut tag = [0u8; 1];
        let received_fd = {
            let mut iov = [IoSliceMut::new(&mut tag)];
            let msg = loop {
                match recvmsg::<UnixAddr>(task_fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
                {
                    Ok(msg) => break msg,
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err).context("task queue receive failed"),
                }
            };
            let mut received_fd: Option<RawFd> = None;
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    received_fd = fds.first().copied();
                }
            }
            received_fd
        };

        if tag[0] == TAG_POISON {
            tracing::debug!("worker received poison pill, shutting down");
            return Ok(());
        }
        let Some(received_fd) = received_fd else {
            tracing::warn!(tag = tag[0], "task datagram without socket descriptor");
            continue;
        };

        events.publish_state("starting scan session");
        // The descriptor arrived via SCM_RIGHTS and is owned by this worker
        // from here on.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(received_fd) };
        let config = Arc::clone(&config);
        let plugins = Arc::clone(&plugins);
        let outcome = runtime.block_on(async move {
            std_stream.set_nonblocking(true)?;
            let stream = TcpStream::from_std(std_stream)?;
            Ok::<_, std::io::Error>(SessionHandler::new(stream, config, plugins).handle().await)
        });
        match outcome {
            Ok(outcome) => events.send(&WorkerEvent::StatsDelta {
                total: 1,
                scantime: outcome.scantime,
            }),
            Err(err) => tracing::error!(%err, "could not adopt handed-off socket"),
        }
    }
}
