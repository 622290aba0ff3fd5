//! One PTY-backed process, end to end.
//!
//! A [`ProcessSupervisor`] owns the PTY master, a blocking reader thread that
//! fans output out to data subscribers, a blocking waiter thread for the exit
//! status, and a periodic scan task that diffs ports and children and publishes
//! [`Notification`]s on the supervisor's own bus.

use crate::bus::{NotificationBus, SubscriptionId};
use crate::config::{SpawnRequest, SupervisorConfig};
use crate::error::{Result, SupervisorError};
use crate::notification::Notification;
use crate::ports::PortResolver;
use crate::record::{ExitInfo, ProcessSnapshot, WaitOutcome};
use crate::tracker::{scan_tick, TrackedState};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const READ_BUFFER_BYTES: usize = 8192;
const CLEAR_SEQUENCE: &[u8] = b"\x1b[H\x1b[2J\x1b[3J";
// how long exit reporting waits for an open reader to hit EOF
const DRAIN_GRACE: Duration = Duration::from_millis(500);

type Observer = Box<dyn Fn(&Notification) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parses `SIGTERM`, `term`, `15` and the like.
pub fn parse_signal(input: &str) -> Result<Signal> {
    let trimmed = input.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| SupervisorError::InvalidSignal(input.to_string()));
    }
    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| SupervisorError::InvalidSignal(input.to_string()))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    Paused,
    Released,
}

/// Lets the reader thread stall while output is paused. Once released, a
/// paused reader stops for good; an open one keeps draining until EOF.
struct OutputGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl OutputGate {
    fn new(paused: bool) -> Self {
        Self {
            state: Mutex::new(if paused { GateState::Paused } else { GateState::Open }),
            changed: Condvar::new(),
        }
    }

    fn pause(&self) {
        let mut state = lock(&self.state);
        if *state == GateState::Open {
            *state = GateState::Paused;
        }
    }

    fn resume(&self) {
        let mut state = lock(&self.state);
        if *state == GateState::Paused {
            *state = GateState::Open;
            self.changed.notify_all();
        }
    }

    fn release(&self) {
        let mut state = lock(&self.state);
        if *state == GateState::Paused {
            *state = GateState::Released;
            self.changed.notify_all();
        }
    }

    fn is_paused(&self) -> bool {
        *lock(&self.state) == GateState::Paused
    }

    fn wait_open(&self) -> bool {
        let mut state = lock(&self.state);
        while *state == GateState::Paused {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state == GateState::Open
    }
}

struct PtyHandles {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

struct Inner {
    pid: u32,
    name: String,
    cmd: String,
    args: Vec<String>,
    state: Mutex<TrackedState>,
    notify: NotificationBus<Notification>,
    output: Arc<NotificationBus<Vec<u8>>>,
    gate: Arc<OutputGate>,
    pty: Mutex<Option<PtyHandles>>,
    exit: watch::Sender<Option<ExitInfo>>,
    exited: AtomicBool,
    disposed: AtomicBool,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    // held while applying a scan result or running the exit sequence
    publish_lock: Mutex<()>,
}

impl Inner {
    fn is_stopped(&self) -> bool {
        self.exited.load(Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst)
    }

    fn stop_scanning(&self) {
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
    }

    fn snapshot(&self) -> ProcessSnapshot {
        let state = lock(&self.state);
        ProcessSnapshot {
            pid: self.pid,
            name: self.name.clone(),
            ports: state.ports.clone(),
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            children: state.children.clone(),
        }
    }

    fn handle_exit(&self, exit: ExitInfo) {
        let _publishing = lock(&self.publish_lock);
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_scanning();
        lock(&self.pty).take();
        info!(
            event = "process_exited",
            pid = self.pid,
            exit_code = exit.exit_code,
            signal = ?exit.signal
        );

        let children = std::mem::take(&mut lock(&self.state).children);
        for child in children.into_values() {
            // best effort, the child may be gone already
            let _ = kill(Pid::from_raw(child.pid as i32), Signal::SIGTERM);
            self.notify.publish(&Notification::child_exited(child));
        }
        self.notify.publish(&Notification::process_exited(self.pid, exit.clone()));
        self.exit.send_replace(Some(exit));
    }
}

/// Configures and spawns a [`ProcessSupervisor`].
pub struct SupervisorBuilder<'a> {
    request: &'a SpawnRequest,
    config: &'a SupervisorConfig,
    resolver: PortResolver,
    paused: bool,
    observer: Option<Observer>,
}

impl<'a> SupervisorBuilder<'a> {
    /// Start with output reading suspended until [`ProcessSupervisor::resume`].
    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// A notification handler registered before `PROCESS_STARTED` is published,
    /// so it observes every event of the process.
    pub fn observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Spawns the process. Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<ProcessSupervisor> {
        let request = self.request;
        let cmd = request.cmd().to_string();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows(),
                cols: request.cols(),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| SupervisorError::spawn(&cmd, err))?;

        let mut builder = CommandBuilder::new(&cmd);
        builder.args(&request.args);
        builder.cwd(request.cwd(self.config));
        builder.env_clear();
        for (key, value) in request.environment(self.config) {
            builder.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| SupervisorError::spawn(&cmd, err))?;
        drop(pair.slave);
        let pid = child
            .process_id()
            .ok_or_else(|| SupervisorError::spawn(&cmd, "child has no pid"))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| SupervisorError::spawn(&cmd, err))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| SupervisorError::spawn(&cmd, err))?;

        let name = Path::new(&cmd)
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_else(|| cmd.clone());
        let (exit, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            pid,
            name,
            cmd,
            args: request.args.clone(),
            state: Mutex::new(TrackedState::default()),
            notify: NotificationBus::new(),
            output: Arc::new(NotificationBus::new()),
            gate: Arc::new(OutputGate::new(self.paused)),
            pty: Mutex::new(Some(PtyHandles {
                master: pair.master,
                writer,
            })),
            exit,
            exited: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            scan_task: Mutex::new(None),
            publish_lock: Mutex::new(()),
        });

        if let Some(observer) = self.observer {
            inner.notify.subscribe(observer);
        }
        let snapshot = inner.snapshot();
        info!(event = "process_started", pid, cmd = %snapshot.cmd, args = ?snapshot.args);
        inner.notify.publish(&Notification::process_started(snapshot));

        let drained = spawn_reader(reader, inner.output.clone(), inner.gate.clone(), pid);

        let (exit_tx, exit_rx) = oneshot::channel();
        std::thread::spawn(move || {
            let status = child.wait();
            let _ = exit_tx.send(status);
        });
        let exit_inner = inner.clone();
        tokio::spawn(async move {
            let exit = match exit_rx.await {
                Ok(Ok(status)) => ExitInfo {
                    exit_code: status.exit_code(),
                    signal: status.signal().map(str::to_string),
                },
                Ok(Err(err)) => {
                    warn!(event = "wait_failed", pid = exit_inner.pid, error = %err);
                    ExitInfo {
                        exit_code: 1,
                        signal: None,
                    }
                }
                Err(_) => ExitInfo {
                    exit_code: 1,
                    signal: None,
                },
            };
            // trailing output goes out before the exit is reported; a paused
            // reader would never drain, so it is not waited for
            if !exit_inner.gate.is_paused() {
                let _ = tokio::time::timeout(DRAIN_GRACE, drained).await;
            }
            exit_inner.handle_exit(exit);
        });

        let task = spawn_scanner(&inner, self.resolver, self.config.scan_interval);
        *lock(&inner.scan_task) = Some(task);
        if inner.is_stopped() {
            inner.stop_scanning();
        }

        Ok(ProcessSupervisor { inner })
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output: Arc<NotificationBus<Vec<u8>>>,
    gate: Arc<OutputGate>,
    pid: u32,
) -> oneshot::Receiver<()> {
    let (drained_tx, drained_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut buffer = [0u8; READ_BUFFER_BYTES];
        while gate.wait_open() {
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                // EIO once the slave side is gone
                Err(_) => break,
            };
            output.publish(&buffer[..read].to_vec());
        }
        debug!(event = "reader_closed", pid);
        let _ = drained_tx.send(());
    });
    drained_rx
}

fn spawn_scanner(inner: &Arc<Inner>, resolver: PortResolver, interval: Duration) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let pid = inner.pid;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let previous = match weak.upgrade() {
                Some(inner) if !inner.is_stopped() => lock(&inner.state).clone(),
                _ => break,
            };
            let outcome = scan_tick(&resolver, pid, &previous).await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let _publishing = lock(&inner.publish_lock);
            if inner.is_stopped() {
                break;
            }
            *lock(&inner.state) = outcome.state;
            for event in &outcome.events {
                inner.notify.publish(event);
            }
        }
        debug!(event = "scanner_stopped", pid);
    })
}

/// Handle to a supervised PTY process. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn builder<'a>(
        request: &'a SpawnRequest,
        config: &'a SupervisorConfig,
        resolver: PortResolver,
    ) -> SupervisorBuilder<'a> {
        SupervisorBuilder {
            request,
            config,
            resolver,
            paused: false,
            observer: None,
        }
    }

    pub fn spawn(
        request: &SpawnRequest,
        config: &SupervisorConfig,
        resolver: PortResolver,
    ) -> Result<Self> {
        Self::builder(request, config, resolver).spawn()
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        self.inner.snapshot()
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.gate.is_paused()
    }

    /// Forwards raw bytes to the PTY. A no-op once the process has exited.
    pub fn write(&self, data: &[u8]) {
        let mut pty = lock(&self.inner.pty);
        let Some(handles) = pty.as_mut() else {
            return;
        };
        if let Err(err) = handles
            .writer
            .write_all(data)
            .and_then(|_| handles.writer.flush())
        {
            debug!(event = "pty_write_failed", pid = self.inner.pid, error = %err);
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let pty = lock(&self.inner.pty);
        let Some(handles) = pty.as_ref() else {
            return;
        };
        let size = PtySize {
            rows: rows.max(1),
            cols: cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        };
        if let Err(err) = handles.master.resize(size) {
            debug!(event = "pty_resize_failed", pid = self.inner.pid, error = %err);
        }
    }

    pub fn pause(&self) {
        self.inner.gate.pause();
    }

    pub fn resume(&self) {
        self.inner.gate.resume();
    }

    /// Resets the screen of attached terminals; process state is untouched.
    pub fn clear(&self) {
        if !self.has_exited() {
            self.inner.output.publish(&CLEAR_SEQUENCE.to_vec());
        }
    }

    /// Signals the process group (default `SIGTERM`) without waiting for exit.
    pub fn kill(&self, signal: Option<&str>) -> Result<()> {
        let signal = match signal {
            Some(value) if !value.trim().is_empty() => parse_signal(value)?,
            _ => Signal::SIGTERM,
        };
        if self.has_exited() {
            return Ok(());
        }
        info!(event = "process_kill", pid = self.inner.pid, signal = signal.as_str());
        match killpg(Pid::from_raw(self.inner.pid as i32), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(SupervisorError::Io(errno.into())),
        }
    }

    /// Resolves with the exit payload, or with the timeout sentinel when
    /// `timeout` elapses first. The process is left running on timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let mut exit = self.inner.exit.subscribe();
        let exited = async move {
            let changed = exit.wait_for(Option::is_some).await;
            changed.ok().and_then(|value| value.clone())
        };
        let info = match timeout {
            Some(limit) => match tokio::time::timeout(limit, exited).await {
                Ok(info) => info,
                Err(_) => return WaitOutcome::timeout(),
            },
            None => exited.await,
        };
        // the sender outlives every receiver
        info.map(WaitOutcome::Exited).unwrap_or_else(WaitOutcome::timeout)
    }

    /// Exit payload if the process has already exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.inner.exit.borrow().clone()
    }

    pub fn on_notify<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.notify.subscribe(handler)
    }

    pub fn off_notify(&self, id: SubscriptionId) -> bool {
        self.inner.notify.unsubscribe(id)
    }

    /// Subscribes to raw PTY output chunks.
    pub fn on_data<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Vec<u8>) + Send + Sync + 'static,
    {
        self.inner.output.subscribe(handler)
    }

    pub fn off_data(&self, id: SubscriptionId) -> bool {
        self.inner.output.unsubscribe(id)
    }

    /// Stops scanning, kills the process group if still alive and releases all
    /// subscriptions. Idempotent and safe to call from a notification handler
    /// during the exit sequence.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_scanning();
        if !self.has_exited() {
            if let Err(err) = killpg(Pid::from_raw(self.inner.pid as i32), Signal::SIGKILL) {
                debug!(event = "dispose_kill_failed", pid = self.inner.pid, error = %err);
            }
        }
        self.inner.gate.release();
        self.inner.notify.clear();
        debug!(event = "process_disposed", pid = self.inner.pid);
    }
}
