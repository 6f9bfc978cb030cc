//! QEMU process lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! start(Configuration)
//!     └─► tokio::process::Command  →  qemu-system-* child
//!             ├─► supervisor task   (owns the Child, waits for exit, honours kill)
//!             ├─► stderr task       (forwards emulator diagnostics to tracing)
//!             ├─► QmpChannel        (handshake, then one command at a time)
//!             │       └─► close watcher  (disconnect → Crashed)
//!             └─► MonitorConsole    (optional, port P + 1)
//! ```
//!
//! Every state change goes through the `statig` lifecycle machine and is
//! published as [`Notification::State`]. The lifecycle and session locks are
//! never held across an await; when both are needed the lifecycle lock is
//! taken before the session lock. Guest commands that move the run state hold
//! the async `commands` lock from the QMP request until the state is applied,
//! so a stale `query-status` cannot overwrite a newer pause or resume.
//! Shutdown never takes it, so it can cancel a command in flight.
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ControllerOptions, Operation, VmState};
use crate::config::{Configuration, Invocation};
use crate::error::{ControllerError, QmpError};
use crate::logging;
use crate::events::{EventDispatcher, Notification, Subscription};
use crate::monitor::{MonitorChannel, MonitorConsole};
use crate::qmp::{CloseReason, QmpChannel};
use crate::snapshot::SnapshotManager;
use crate::state_machine::lifecycle_sm::{Lifecycle, LifecycleEvent};

/// Searched after `PATH` when no `qemu_dir` is configured.
const QEMU_FALLBACK_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"];

/// How the emulator process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal or the status is unknown.
    pub code: Option<i32>,
}

/// The `query-status` reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuestStatus {
    pub running: bool,
    #[serde(default)]
    pub status: String,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything tied to one emulator process.
struct Session {
    generation: u64,
    pid: Option<u32>,
    qmp: Option<Arc<QmpChannel>>,
    console: Option<MonitorConsole>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    /// Set once we have asked the process to go away; its exit is then not a crash.
    expected_exit: bool,
    watchers: Vec<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }
    }
}

struct Inner {
    options: ControllerOptions,
    dispatcher: EventDispatcher,
    lifecycle: Mutex<Lifecycle>,
    session: Mutex<Option<Session>>,
    commands: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn invalid(op: Operation, state: VmState) -> ControllerError {
    ControllerError::InvalidState {
        operation: op.name(),
        state,
    }
}

impl Inner {
    fn apply(&self, lifecycle: &mut Lifecycle, event: LifecycleEvent) -> VmState {
        let (from, to) = lifecycle.handle(event);
        if from != to {
            info!(%from, %to, ?event, "VM state changed");
            self.dispatcher.publish(Notification::State { from, to });
        }
        to
    }

    fn transition(&self, event: LifecycleEvent) -> VmState {
        let mut lifecycle = lock(&self.lifecycle);
        self.apply(&mut lifecycle, event)
    }

    async fn process_exited(&self, generation: u64, exit: ProcessExit) {
        self.dispatcher
            .publish(Notification::ProcessExited { code: exit.code });
        let reason = match exit.code {
            Some(code) => format!("emulator exited unexpectedly with code {code}"),
            None => "emulator was terminated unexpectedly".to_string(),
        };
        self.crash(generation, &reason).await;
    }

    /// Tear down a running session that died underneath us. A no-op unless
    /// `generation` is still current and nobody asked the process to exit.
    async fn crash(&self, generation: u64, reason: &str) {
        let (qmp, console) = {
            let mut lifecycle = lock(&self.lifecycle);
            // A death during Starting is a failed start, handled by `start`.
            if !matches!(lifecycle.state(), VmState::Running | VmState::Paused) {
                return;
            }
            let mut session = lock(&self.session);
            let Some(s) = session
                .as_mut()
                .filter(|s| s.generation == generation && !s.expected_exit)
            else {
                return;
            };
            s.expected_exit = true;
            if let Some(kill) = s.kill_tx.take() {
                let _ = kill.send(());
            }
            let parts = (s.qmp.take(), s.console.take());
            drop(session);
            self.apply(&mut lifecycle, LifecycleEvent::ProcessLost);
            parts
        };

        error!(generation, reason, "emulator crashed");
        self.dispatcher
            .publish(Notification::failure("emulator", reason));
        if let Some(console) = console {
            console.close();
        }
        if let Some(qmp) = qmp {
            qmp.abandon().await;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping the session signals the supervisor to kill the process.
        if lock(&self.session).take().is_some() {
            debug!("controller dropped with a live emulator, killing it");
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Owns at most one emulator process with its QMP and monitor sessions.
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct VmController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VmController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmController")
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl Default for VmController {
    fn default() -> Self {
        Self::new(ControllerOptions::default())
    }
}

impl VmController {
    pub fn new(options: ControllerOptions) -> Self {
        let dispatcher = EventDispatcher::new(options.event_buffer);
        Self {
            inner: Arc::new(Inner {
                options,
                dispatcher,
                lifecycle: Mutex::new(Lifecycle::default()),
                session: Mutex::new(None),
                commands: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> VmState {
        lock(&self.inner.lifecycle).state()
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    /// Process id of the current emulator, if one is running.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner.session).as_ref().and_then(|s| s.pid)
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.dispatcher.subscribe()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Spawn the emulator described by `config` and complete the QMP
    /// handshake. Returns the invocation that was run, including any
    /// configuration warnings.
    ///
    /// Returns `Err` if:
    /// - the controller is not `NotStarted` or `Stopped` (no side effect)
    /// - `config` fails validation (no state change)
    /// - the process cannot be spawned, exits early, or does not finish the
    ///   handshake in time; the process is killed and the state is `Stopped`
    pub async fn start(&self, config: &Configuration) -> Result<Invocation, ControllerError> {
        let inner = &self.inner;
        let (invocation, generation) = {
            let mut lifecycle = lock(&inner.lifecycle);
            let state = lifecycle.state();
            if !state.permits(Operation::Start) {
                return Err(invalid(Operation::Start, state));
            }
            let invocation = config.build_invocation()?;
            let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
            inner.apply(&mut lifecycle, LifecycleEvent::StartRequested);
            (invocation, generation)
        };

        for warning in invocation.warnings() {
            warn!(warning = %warning, "configuration warning");
        }
        inner
            .dispatcher
            .publish(Notification::status("Starting emulator", Some(0)));

        match self.launch(generation, &invocation).await {
            Ok(()) => Ok(invocation),
            Err(e) => {
                error!(error = %e, "emulator start failed");
                inner.dispatcher.publish(Notification::failure("start", &e));
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        generation: u64,
        invocation: &Invocation,
    ) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let program = find_qemu(invocation.program(), inner.options.qemu_dir.as_deref());

        let mut cmd = Command::new(&program);
        cmd.args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.transition(LifecycleEvent::StartFailed);
                return Err(ControllerError::Spawn {
                    program: program.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let pid = child.id();
        info!(
            pid,
            program = %program.display(),
            qmp_port = invocation.ports().qmp,
            "emulator spawned"
        );

        let mut watchers = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            watchers.push(tokio::spawn(log_stderr(stderr)));
        }
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        {
            let lifecycle = lock(&inner.lifecycle);
            if lifecycle.state() != VmState::Starting {
                // stop() ran before the process existed; kill_on_drop reaps it.
                drop(lifecycle);
                for watcher in watchers {
                    watcher.abort();
                }
                return Err(ControllerError::Handshake(
                    "start was interrupted".to_string(),
                ));
            }
            *lock(&inner.session) = Some(Session {
                generation,
                pid,
                qmp: None,
                console: None,
                kill_tx: Some(kill_tx),
                exit_rx: exit_rx.clone(),
                expected_exit: false,
                watchers,
            });
        }
        tokio::spawn(supervise(
            Arc::downgrade(inner),
            generation,
            child,
            kill_rx,
            exit_tx,
        ));

        inner
            .dispatcher
            .publish(Notification::status("Waiting for QMP handshake", Some(25)));
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, invocation.ports().qmp));
        let handshake_timeout = inner.options.handshake_timeout();
        let handshake = async {
            let qmp = QmpChannel::connect(
                addr,
                inner.dispatcher.clone(),
                handshake_timeout,
                inner.options.command_timeout(),
            )
            .await?;
            qmp.negotiate().await?;
            Ok::<_, QmpError>(qmp)
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(handshake_timeout, handshake) => match result {
                Ok(Ok(qmp)) => Ok(qmp),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("no QMP handshake within {handshake_timeout:?}")),
            },
            exit = wait_exit(exit_rx) => Err(match exit.code {
                Some(code) => format!("emulator exited during startup with code {code}"),
                None => "emulator terminated during startup".to_string(),
            }),
        };

        match outcome {
            Ok(qmp) => self.finish_start(generation, invocation, qmp).await,
            Err(reason) => {
                self.abort_start(generation).await;
                Err(ControllerError::Handshake(reason))
            }
        }
    }

    async fn finish_start(
        &self,
        generation: u64,
        invocation: &Invocation,
        qmp: QmpChannel,
    ) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let qmp = Arc::new(qmp);

        let accepted = {
            let mut lifecycle = lock(&inner.lifecycle);
            let mut session = lock(&inner.session);
            let accepted = lifecycle.state() == VmState::Starting
                && match session.as_mut() {
                    Some(s) if s.generation == generation => {
                        s.qmp = Some(Arc::clone(&qmp));
                        s.watchers.push(tokio::spawn(watch_qmp(
                            Arc::downgrade(inner),
                            generation,
                            qmp.closed(),
                        )));
                        true
                    }
                    _ => false,
                };
            drop(session);
            if accepted {
                inner.apply(&mut lifecycle, LifecycleEvent::HandshakeCompleted);
            }
            accepted
        };
        if !accepted {
            qmp.close().await;
            return Err(ControllerError::Handshake(
                "start was interrupted".to_string(),
            ));
        }

        if let Some(port) = invocation.ports().monitor {
            inner
                .dispatcher
                .publish(Notification::status("Connecting monitor console", Some(75)));
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            match MonitorConsole::connect(
                addr,
                inner.dispatcher.clone(),
                inner.options.command_timeout(),
            )
            .await
            {
                Ok(console) => {
                    let mut session = lock(&inner.session);
                    match session.as_mut() {
                        Some(s) if s.generation == generation && !s.expected_exit => {
                            s.console = Some(console);
                        }
                        _ => console.close(),
                    }
                }
                Err(e) => warn!(%addr, error = %e, "monitor console unavailable"),
            }
        }

        inner
            .dispatcher
            .publish(Notification::status("Emulator running", Some(100)));
        Ok(())
    }

    /// Kill a process whose start failed and land in `Stopped`. A no-op when
    /// a concurrent stop has already taken over.
    async fn abort_start(&self, generation: u64) {
        let inner = &self.inner;
        let exit_rx = {
            let lifecycle = lock(&inner.lifecycle);
            if lifecycle.state() != VmState::Starting {
                return;
            }
            let mut session = lock(&inner.session);
            match session.as_mut().filter(|s| s.generation == generation) {
                Some(s) => {
                    s.expected_exit = true;
                    if let Some(kill) = s.kill_tx.take() {
                        let _ = kill.send(());
                    }
                    s.exit_rx.clone()
                }
                None => return,
            }
        };

        let kill_timeout = inner.options.kill_timeout();
        if tokio::time::timeout(kill_timeout, wait_exit(exit_rx))
            .await
            .is_err()
        {
            warn!(?kill_timeout, "emulator did not exit after kill");
        }

        let mut lifecycle = lock(&inner.lifecycle);
        if lifecycle.state() == VmState::Starting {
            let session = lock(&inner.session).take_if(|s| s.generation == generation);
            drop(session);
            inner.apply(&mut lifecycle, LifecycleEvent::StartFailed);
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Ask the emulator to quit, killing it if it outlives `stop_grace`.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        self.shutdown(Operation::Stop).await
    }

    /// Press the guest's ACPI power button, killing the emulator if it
    /// outlives `power_off_grace`.
    pub async fn power_off(&self) -> Result<(), ControllerError> {
        self.shutdown(Operation::PowerOff).await
    }

    async fn shutdown(&self, op: Operation) -> Result<(), ControllerError> {
        let inner = &self.inner;
        let (command, grace) = match op {
            Operation::PowerOff => ("system_powerdown", inner.options.power_off_grace()),
            _ => ("quit", inner.options.stop_grace()),
        };

        let parts = {
            let mut lifecycle = lock(&inner.lifecycle);
            let state = lifecycle.state();
            if !state.permits(op) {
                return Err(invalid(op, state));
            }
            let mut session = lock(&inner.session);
            let parts = session.as_mut().map(|s| {
                s.expected_exit = true;
                (
                    s.qmp.take(),
                    s.console.take(),
                    s.kill_tx.take(),
                    s.exit_rx.clone(),
                )
            });
            drop(session);
            inner.apply(&mut lifecycle, LifecycleEvent::StopRequested);
            parts
        };
        inner
            .dispatcher
            .publish(Notification::status("Stopping emulator", None));

        if let Some((qmp, console, kill_tx, exit_rx)) = parts {
            if let Some(console) = &console {
                console.close();
            }

            let mut exited = None;
            if let Some(qmp) = &qmp {
                qmp.cancel_pending();
                match qmp.execute(command, None).await {
                    Ok(_) => info!(command, "shutdown requested"),
                    // `quit` may race the socket closing; the exit wait decides.
                    Err(e) => warn!(command, error = %e, "shutdown request failed"),
                }
                exited = tokio::time::timeout(grace, wait_exit(exit_rx.clone()))
                    .await
                    .ok();
                if exited.is_none() {
                    warn!(command, ?grace, "emulator ignored shutdown request, killing");
                }
            }

            if exited.is_none() {
                if let Some(kill) = kill_tx {
                    let _ = kill.send(());
                }
                let kill_timeout = inner.options.kill_timeout();
                if tokio::time::timeout(kill_timeout, wait_exit(exit_rx))
                    .await
                    .is_err()
                {
                    error!(?kill_timeout, "emulator did not exit after kill");
                }
            }

            if let Some(qmp) = qmp {
                qmp.close().await;
            }
        }

        let mut lifecycle = lock(&inner.lifecycle);
        let session = lock(&inner.session).take();
        drop(session);
        inner.apply(&mut lifecycle, LifecycleEvent::Exited);
        drop(lifecycle);
        inner
            .dispatcher
            .publish(Notification::status("Emulator stopped", None));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Guest commands
    // -----------------------------------------------------------------------

    fn channel_for(&self, op: Operation) -> Result<Arc<QmpChannel>, ControllerError> {
        let lifecycle = lock(&self.inner.lifecycle);
        let state = lifecycle.state();
        if !state.permits(op) {
            return Err(invalid(op, state));
        }
        lock(&self.inner.session)
            .as_ref()
            .and_then(|s| s.qmp.clone())
            .ok_or(ControllerError::Qmp(QmpError::ConnectionLost))
    }

    /// Publish runtime failures; rejected requests are only returned.
    fn report<T>(
        &self,
        operation: &str,
        result: Result<T, ControllerError>,
    ) -> Result<T, ControllerError> {
        if let Err(e) = &result {
            warn!(operation, error = %e, "VM operation failed");
            self.inner
                .dispatcher
                .publish(Notification::failure(operation, e));
        }
        result
    }

    async fn run_qmp(
        &self,
        op: Operation,
        command: &str,
    ) -> Result<serde_json::Value, ControllerError> {
        let qmp = self.channel_for(op)?;
        self.report(op.name(), qmp.execute(command, None).await.map_err(Into::into))
    }

    pub async fn pause(&self) -> Result<(), ControllerError> {
        let _serial = self.inner.commands.lock().await;
        self.run_qmp(Operation::Pause, "stop").await?;
        self.inner.transition(LifecycleEvent::Paused);
        Ok(())
    }

    /// Continue a paused guest.
    pub async fn resume(&self) -> Result<(), ControllerError> {
        let _serial = self.inner.commands.lock().await;
        self.run_qmp(Operation::Resume, "cont").await?;
        self.inner.transition(LifecycleEvent::Resumed);
        Ok(())
    }

    pub async fn reset(&self) -> Result<(), ControllerError> {
        self.run_qmp(Operation::Reset, "system_reset").await?;
        info!("guest reset");
        Ok(())
    }

    /// Run a human monitor command line and publish its output.
    pub async fn human_command(&self, command_line: &str) -> Result<String, ControllerError> {
        let _serial = self.inner.commands.lock().await;
        let qmp = self.channel_for(Operation::Command)?;
        let monitor = MonitorChannel::new(Arc::clone(&qmp));
        let text = self.report(
            "human command",
            monitor.execute(command_line).await.map_err(Into::into),
        )?;
        self.inner
            .dispatcher
            .publish(Notification::HumanResponse { text: text.clone() });
        // The command may have paused or resumed the guest.
        self.sync_run_state(&qmp).await;
        Ok(text)
    }

    /// Write the current display to `path` on the emulator's filesystem.
    pub async fn screendump(&self, path: &Path) -> Result<(), ControllerError> {
        let qmp = self.channel_for(Operation::Command)?;
        let args = json!({ "filename": path.display().to_string() });
        self.report(
            "screendump",
            qmp.execute("screendump", Some(args)).await.map_err(Into::into),
        )?;
        info!(path = %path.display(), "screendump written");
        Ok(())
    }

    /// Query the guest run state and reconcile the lifecycle with it.
    pub async fn query_status(&self) -> Result<GuestStatus, ControllerError> {
        let _serial = self.inner.commands.lock().await;
        let qmp = self.channel_for(Operation::Command)?;
        let status = self.report("query status", fetch_status(&qmp).await)?;
        self.reconcile(&status);
        Ok(status)
    }

    pub async fn save_snapshot(&self, name: &str) -> Result<(), ControllerError> {
        let _serial = self.inner.commands.lock().await;
        let qmp = self.channel_for(Operation::Snapshot)?;
        let snapshots = SnapshotManager::new(MonitorChannel::new(Arc::clone(&qmp)));
        let result = snapshots.save(name).await;
        self.sync_run_state(&qmp).await;
        self.report("save snapshot", result)
    }

    pub async fn load_snapshot(&self, name: &str) -> Result<(), ControllerError> {
        let _serial = self.inner.commands.lock().await;
        let qmp = self.channel_for(Operation::Snapshot)?;
        let snapshots = SnapshotManager::new(MonitorChannel::new(Arc::clone(&qmp)));
        let result = snapshots.load(name).await;
        self.sync_run_state(&qmp).await;
        self.report("load snapshot", result)
    }

    /// Callers hold the `commands` lock.
    async fn sync_run_state(&self, qmp: &QmpChannel) {
        match fetch_status(qmp).await {
            Ok(status) => self.reconcile(&status),
            Err(e) => debug!(error = %e, "could not refresh guest run state"),
        }
    }

    fn reconcile(&self, status: &GuestStatus) {
        let event = if status.running {
            LifecycleEvent::Resumed
        } else {
            LifecycleEvent::Paused
        };
        self.inner.transition(event);
    }
}

async fn fetch_status(qmp: &QmpChannel) -> Result<GuestStatus, ControllerError> {
    let value = qmp.execute("query-status", None).await?;
    serde_json::from_value(value)
        .map_err(|e| QmpError::Protocol(format!("bad query-status reply: {e}")).into())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Own the child until it exits, killing it on request or when the session
/// is dropped.
async fn supervise(
    inner: Weak<Inner>,
    generation: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            debug!(pid, "killing emulator");
            if let Err(e) = child.start_kill() {
                warn!(pid, error = %e, "failed to signal emulator");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => {
            info!(pid, code = ?status.code(), "emulator exited");
            ProcessExit {
                code: status.code(),
            }
        }
        Err(e) => {
            error!(pid, error = %e, "failed to wait for emulator");
            ProcessExit::default()
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.process_exited(generation, exit).await;
    }
    let _ = exit_tx.send(Some(exit));
}

/// Crash the session if its QMP link drops without being closed by us.
async fn watch_qmp(
    inner: Weak<Inner>,
    generation: u64,
    mut closed: watch::Receiver<Option<CloseReason>>,
) {
    let reason = match closed.wait_for(Option::is_some).await {
        Ok(reason) => *reason,
        Err(_) => return,
    };
    if reason == Some(CloseReason::Disconnected) {
        if let Some(inner) = inner.upgrade() {
            inner.crash(generation, "QMP connection lost").await;
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    while let Ok(n) = reader.read_until(b'\n', &mut raw).await {
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if !line.is_empty() {
            info!(target: logging::QEMU_TARGET, "{line}");
        }
        raw.clear();
    }
}

/// Resolves once the process has exited (or its supervisor is gone).
async fn wait_exit(mut exit_rx: watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(exit) => (*exit).unwrap_or_default(),
        Err(_) => ProcessExit::default(),
    }
}

/// Resolve the emulator binary: `qemu_dir` if configured, else `PATH`, else
/// the usual install locations. Falls back to the bare name so the spawn
/// error names the missing program.
fn find_qemu(program: &str, qemu_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = qemu_dir {
        return dir.join(program);
    }

    let path_dirs = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();

    path_dirs
        .into_iter()
        .chain(QEMU_FALLBACK_DIRS.iter().map(PathBuf::from))
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(program))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_qemu_prefers_configured_dir() {
        let dir = Path::new("/opt/qemu/bin");
        assert_eq!(
            find_qemu("qemu-system-x86_64", Some(dir)),
            PathBuf::from("/opt/qemu/bin/qemu-system-x86_64")
        );
    }

    #[test]
    fn find_qemu_falls_back_to_bare_name() {
        assert_eq!(
            find_qemu("qemu-system-definitely-not-installed", None),
            PathBuf::from("qemu-system-definitely-not-installed")
        );
    }

    #[test]
    fn guest_status_parses_query_status() {
        let reply = json!({ "running": false, "singlestep": false, "status": "paused" });
        let status: GuestStatus = serde_json::from_value(reply).unwrap();
        assert_eq!(
            status,
            GuestStatus {
                running: false,
                status: "paused".to_string()
            }
        );
    }

    #[tokio::test]
    async fn guest_commands_rejected_before_start() {
        let vm = VmController::default();
        let mut sub = vm.subscribe();

        assert_eq!(
            vm.pause().await,
            Err(ControllerError::InvalidState {
                operation: "pause",
                state: VmState::NotStarted
            })
        );
        assert!(matches!(
            vm.save_snapshot("s1").await,
            Err(ControllerError::InvalidState { .. })
        ));
        assert!(matches!(vm.stop().await, Err(ControllerError::InvalidState { .. })));
        assert_eq!(vm.state(), VmState::NotStarted);
        // Rejections are not published.
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn invalid_config_leaves_state_untouched() {
        let vm = VmController::default();
        let mut config = Configuration::default();
        config.set_processor_type("");

        assert!(matches!(
            vm.start(&config).await,
            Err(ControllerError::Validation(_))
        ));
        assert_eq!(vm.state(), VmState::NotStarted);
    }

    #[tokio::test]
    async fn missing_binary_fails_start_into_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let vm = VmController::new(ControllerOptions {
            qemu_dir: Some(dir.path().to_path_buf()),
            ..ControllerOptions::default()
        });
        let mut sub = vm.subscribe();

        let err = vm.start(&Configuration::default()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Spawn { .. }), "{err:?}");
        assert_eq!(vm.state(), VmState::Stopped);

        let mut saw_failure = false;
        while let Some(n) = sub.try_recv() {
            if let Notification::Failure { operation, .. } = n {
                assert_eq!(operation, "start");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }
}
