//! Supervisor: owns one worker at a time and turns calls into correlated messages.
//!
//! A single lifecycle task consumes worker events, resolves pending calls,
//! runs the heartbeat and drives restarts. Callers only touch the pending
//! table (under a `std::sync::Mutex`, never held across an await) and the
//! readiness gate (a `watch` channel carrying the `ProcessState`).

pub mod in_process;
pub mod launcher;
pub mod process;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::engine::EngineKind;
use crate::error::{Error, Result};
use crate::protocol::{
    ensure_frame_fits, invoke_len_bound, FailureKind, Outcome, SupervisorMessage, Value,
    WorkerMessage,
};

pub use in_process::InProcessLauncher;
pub use launcher::{WorkerControl, WorkerEvent, WorkerExit, WorkerLauncher, WorkerLink};
pub use process::{resolve_worker_path, ProcessLauncher};

/// Pseudo-method name used for ping round trips in the pending table.
const PING: &str = "ping";

/// Worker lifecycle state as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    Crashed,
    Restarting,
    /// Absorbing: nothing leaves this state.
    Terminated,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Crashed => write!(f, "crashed"),
            Self::Restarting => write!(f, "restarting"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Snapshot of the supervised worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub state: ProcessState,
    /// OS pid of the current worker, if it is a separate process.
    pub pid: Option<u32>,
    /// Restarts performed over the supervisor's lifetime.
    pub restart_count: u32,
    pub engine: Option<EngineKind>,
    /// Incremented on every launch attempt.
    pub generation: u64,
}

struct PendingCall {
    method: String,
    submitted_at: Instant,
    deadline: Instant,
    resolver: oneshot::Sender<Result<Value>>,
}

struct ActiveLink {
    commands: UnboundedSender<SupervisorMessage>,
    control: Arc<dyn WorkerControl>,
}

#[derive(Debug, Clone)]
enum TerminalReason {
    Shutdown,
    WorkerExited,
    Exhausted { attempts: u32 },
    StartupFailed(String),
}

impl TerminalReason {
    fn error(&self) -> Error {
        match self {
            Self::Shutdown | Self::WorkerExited => Error::SupervisorShuttingDown,
            Self::Exhausted { attempts } => Error::RestartExhausted {
                attempts: *attempts,
            },
            Self::StartupFailed(msg) => Error::StartupFailed(msg.clone()),
        }
    }
}

struct Shared {
    handle: ProcessHandle,
    pending: HashMap<u64, PendingCall>,
    link: Option<ActiveLink>,
    consecutive_failures: u32,
    ready_at: Option<Instant>,
    terminal: Option<TerminalReason>,
}

struct Inner {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ProcessState>,
    next_id: AtomicU64,
}

/// Process-isolated command proxy.
///
/// Dropping the supervisor shuts the worker down without waiting for it.
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Start a supervisor running the worker executable.
    pub async fn start(config: SupervisorConfig) -> Result<Self> {
        let launcher = ProcessLauncher::from_config(&config)?;
        Self::with_launcher(config, Arc::new(launcher)).await
    }

    /// Start a supervisor with a custom launcher.
    ///
    /// Resolves once the first worker completed its handshake, or fails with
    /// `Error::StartupFailed` (the supervisor is then terminated).
    pub async fn with_launcher(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self> {
        let (state_tx, _) = watch::channel(ProcessState::Starting);
        let inner = Arc::new(Inner {
            config,
            launcher,
            shared: Mutex::new(Shared {
                handle: ProcessHandle {
                    state: ProcessState::Starting,
                    pid: None,
                    restart_count: 0,
                    engine: None,
                    generation: 0,
                },
                pending: HashMap::new(),
                link: None,
                consecutive_failures: 0,
                ready_at: None,
                terminal: None,
            }),
            state_tx,
            next_id: AtomicU64::new(1),
        });

        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(run_lifecycle(Arc::clone(&inner), started_tx));

        match started_rx.await {
            Ok(Ok(())) => Ok(Self { inner }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::StartupFailed(
                "lifecycle task ended before startup completed".to_string(),
            )),
        }
    }

    /// Invoke `method` on the worker's engine.
    ///
    /// Waits for the worker to be ready first; the whole wait is bounded by
    /// the call timeout. Arguments that cannot fit in one frame fail with
    /// `Error::Protocol` before anything is sent.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let deadline = Instant::now() + self.inner.config.call_timeout;
        if let Err(e) = ensure_frame_fits(invoke_len_bound(method, &args)?) {
            log::warn!("Rejecting {}: {}", method, e);
            return Err(e.into());
        }
        self.inner
            .request(method, deadline, move |id| SupervisorMessage::Invoke {
                id,
                method: method.to_string(),
                args,
            })
            .await
    }

    /// Round-trip a ping through the worker.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let deadline = started + self.inner.config.call_timeout;
        self.inner
            .request(PING, deadline, |id| SupervisorMessage::Ping { id })
            .await?;
        Ok(started.elapsed())
    }

    /// Stop the worker and terminate the supervisor.
    ///
    /// Pending and later calls fail with `SupervisorShuttingDown`. Waits up to
    /// the configured grace period for the worker to exit before forcing it.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(control) = self.inner.begin_shutdown() else {
            return Ok(());
        };
        let grace = self.inner.config.shutdown_grace;
        tokio::task::spawn_blocking(move || control.terminate(grace))
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        log::info!("Supervisor shut down");
        Ok(())
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.inner.state_tx.subscribe()
    }

    pub fn handle(&self) -> ProcessHandle {
        self.inner.lock().handle.clone()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Pending calls whose deadline has passed.
    ///
    /// Non-zero only briefly for live callers; abandoned calls stay overdue
    /// until the next worker event sweeps them.
    pub fn overdue_calls(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .pending
            .values()
            .filter(|call| call.deadline <= now)
            .count()
    }

    pub fn engine_kind(&self) -> Option<EngineKind> {
        self.inner.lock().handle.engine
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(control) = self.inner.begin_shutdown() {
            let grace = self.inner.config.shutdown_grace;
            let _ = std::thread::Builder::new()
                .name("fxvisor-reaper".to_string())
                .spawn(move || control.terminate(grace));
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the lock held so the snapshot and the gate agree.
    fn set_state(&self, shared: &mut Shared, state: ProcessState) {
        if shared.handle.state == ProcessState::Terminated {
            return;
        }
        log::debug!("Worker state {} -> {}", shared.handle.state, state);
        shared.handle.state = state;
        self.state_tx.send_replace(state);
    }

    /// Enter `Terminated`. Returns the pending calls to reject.
    fn terminate_locked(
        &self,
        shared: &mut Shared,
        reason: TerminalReason,
    ) -> (Vec<PendingCall>, TerminalReason) {
        let reason = shared.terminal.get_or_insert(reason).clone();
        self.set_state(shared, ProcessState::Terminated);
        let calls = shared.pending.drain().map(|(_, call)| call).collect();
        (calls, reason)
    }

    fn terminate(&self, reason: TerminalReason) -> Option<ActiveLink> {
        let (calls, reason, link) = {
            let mut shared = self.lock();
            let (calls, reason) = self.terminate_locked(&mut shared, reason);
            (calls, reason, shared.link.take())
        };
        reject(calls, || reason.error());
        link
    }

    /// Mark the supervisor terminated and ask the worker to exit.
    ///
    /// Returns the worker's control when there was a live worker to stop.
    fn begin_shutdown(&self) -> Option<Arc<dyn WorkerControl>> {
        let ActiveLink { commands, control } = self.terminate(TerminalReason::Shutdown)?;
        log::info!("Shutting down worker");
        let _ = commands.send(SupervisorMessage::Shutdown);
        Some(control)
    }

    fn kill_active(&self, reason: &str) {
        let control = self.lock().link.as_ref().map(|l| Arc::clone(&l.control));
        if let Some(control) = control {
            log::warn!("Killing worker: {}", reason);
            control.kill();
        }
    }

    fn is_terminated(&self) -> bool {
        self.lock().terminal.is_some()
    }

    /// Register a pending entry if the worker is ready.
    ///
    /// `Ok(None)` means not ready yet. The returned sender is the live command
    /// channel the message must go to.
    fn register(&self, method: &str, deadline: Instant) -> Result<Option<Registration>> {
        let mut shared = self.lock();
        if let Some(reason) = &shared.terminal {
            return Err(reason.error());
        }
        if shared.handle.state != ProcessState::Ready {
            return Ok(None);
        }
        let commands = match &shared.link {
            Some(link) => link.commands.clone(),
            None => {
                return Err(Error::WorkerCrashed {
                    method: method.to_string(),
                })
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (resolver, rx) = oneshot::channel();
        shared.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                submitted_at: Instant::now(),
                deadline,
                resolver,
            },
        );
        Ok(Some(Registration { id, rx, commands }))
    }

    async fn request<F>(&self, method: &str, deadline: Instant, build: F) -> Result<Value>
    where
        F: FnOnce(u64) -> SupervisorMessage,
    {
        let timeout = self.config.call_timeout;
        let Registration {
            id,
            mut rx,
            commands,
        } = loop {
            if let Some(registration) = self.register(method, deadline)? {
                break registration;
            }
            // Queue behind the readiness gate, within the call's deadline
            let mut gate = self.state_tx.subscribe();
            let opened = tokio::time::timeout_at(deadline, async {
                gate.wait_for(|s| matches!(s, ProcessState::Ready | ProcessState::Terminated))
                    .await
                    .is_ok()
            })
            .await;
            match opened {
                Ok(true) => {}
                Ok(false) => return Err(Error::SupervisorShuttingDown),
                Err(_) => {
                    return Err(Error::CallTimeout {
                        method: method.to_string(),
                        timeout,
                    })
                }
            }
        };

        let sent = commands.send(build(id));
        drop(commands);
        if sent.is_err() {
            self.lock().pending.remove(&id);
            return Err(Error::WorkerCrashed {
                method: method.to_string(),
            });
        }
        log::debug!("Sent {} (id {})", method, id);

        let waited = tokio::time::timeout_at(deadline, &mut rx).await;
        match waited {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::WorkerCrashed {
                method: method.to_string(),
            }),
            Err(_) => {
                let expired = self.lock().pending.remove(&id).is_some();
                if !expired {
                    // A response won the race and is being delivered
                    return rx.await.unwrap_or_else(|_| {
                        Err(Error::WorkerCrashed {
                            method: method.to_string(),
                        })
                    });
                }
                log::warn!("Call {} ({}) timed out after {:?}", id, method, timeout);
                if self.config.restart_on_timeout {
                    self.kill_active("call timed out");
                }
                Err(Error::CallTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Launch a worker and complete the ready/create handshake.
    async fn bring_up(&self) -> Result<UnboundedReceiver<WorkerEvent>> {
        let generation = {
            let mut shared = self.lock();
            if let Some(reason) = &shared.terminal {
                return Err(reason.error());
            }
            shared.handle.generation += 1;
            shared.handle.generation
        };

        let WorkerLink {
            commands,
            mut events,
            control,
        } = self.launcher.launch()?;

        let startup_timeout = self.config.startup_timeout;
        let engine =
            match tokio::time::timeout(startup_timeout, handshake(&commands, &mut events)).await {
                Ok(Ok(engine)) => engine,
                Ok(Err(e)) => {
                    control.kill();
                    return Err(e);
                }
                Err(_) => {
                    control.kill();
                    return Err(Error::StartupFailed(format!(
                        "worker not ready within {:?}",
                        startup_timeout
                    )));
                }
            };

        let mut shared = self.lock();
        if let Some(reason) = &shared.terminal {
            let e = reason.error();
            drop(shared);
            control.kill();
            return Err(e);
        }
        shared.handle.pid = control.pid();
        shared.handle.engine = Some(engine);
        shared.ready_at = Some(Instant::now());
        shared.link = Some(ActiveLink { commands, control });
        self.set_state(&mut shared, ProcessState::Ready);
        log::info!(
            "Worker ready (generation {}, pid {:?}, {} engine)",
            generation,
            shared.handle.pid,
            engine
        );
        Ok(events)
    }

    /// Consume events from a ready worker until it exits.
    async fn supervise(&self, mut events: UnboundedReceiver<WorkerEvent>) -> WorkerExit {
        let mut heartbeat = self.config.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut outstanding = None;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(WorkerEvent::Message(msg)) => self.dispatch(msg),
                    Some(WorkerEvent::Exited(exit)) => return exit,
                    None => return WorkerExit::unknown(),
                },
                _ = next_tick(&mut heartbeat) => self.check_heartbeat(&mut outstanding),
            }
        }
    }

    /// Drop entries whose caller went away without waiting for an answer.
    fn sweep_abandoned(&self) {
        let mut shared = self.lock();
        let before = shared.pending.len();
        shared.pending.retain(|_, call| !call.resolver.is_closed());
        let swept = before - shared.pending.len();
        if swept > 0 {
            log::debug!("Swept {} abandoned calls", swept);
        }
    }

    /// Resolve the pending call a response belongs to. First event wins.
    fn dispatch(&self, msg: WorkerMessage) {
        self.sweep_abandoned();
        let (id, outcome) = match msg {
            WorkerMessage::Result { id, outcome } => (id, Some(outcome)),
            WorkerMessage::Pong { id } => (id, None),
            other => {
                log::debug!("Ignoring unexpected {:?} from worker", other);
                return;
            }
        };

        let Some(call) = self.lock().pending.remove(&id) else {
            log::debug!("Discarding response for unknown or expired call {}", id);
            return;
        };
        log::debug!(
            "Completed {} (id {}) in {:?}",
            call.method,
            id,
            call.submitted_at.elapsed()
        );

        let result = match outcome {
            None => Ok(Value::Null),
            Some(Outcome::Success { value }) => Ok(value),
            Some(Outcome::Failure {
                kind: FailureKind::UnknownMethod,
                ..
            }) => Err(Error::UnknownMethod(call.method)),
            Some(Outcome::Failure { kind, message }) => Err(Error::CallFailed {
                method: call.method,
                kind,
                message,
            }),
        };
        let _ = call.resolver.send(result);
    }

    /// Runs on every heartbeat tick: check the previous ping, send the next.
    fn check_heartbeat(&self, outstanding: &mut Option<(oneshot::Receiver<Result<Value>>, Instant)>) {
        self.sweep_abandoned();
        if let Some((rx, sent_at)) = outstanding {
            match rx.try_recv() {
                Err(TryRecvError::Empty) => {
                    let limit = self.config.heartbeat_timeout;
                    if sent_at.elapsed() < limit {
                        return;
                    }
                    self.kill_active(&format!("heartbeat unanswered for {:?}", limit));
                    *outstanding = None;
                    return;
                }
                Ok(_) | Err(TryRecvError::Closed) => *outstanding = None,
            }
        }

        let deadline = Instant::now() + self.config.heartbeat_timeout;
        if let Ok(Some(Registration { id, rx, commands })) = self.register(PING, deadline) {
            if commands.send(SupervisorMessage::Ping { id }).is_ok() {
                *outstanding = Some((rx, Instant::now()));
            } else {
                self.lock().pending.remove(&id);
            }
        }
    }

    /// Classify a worker exit. Returns true when a restart should follow.
    fn handle_exit(&self, exit: WorkerExit) -> bool {
        let mut shared = self.lock();
        if shared.terminal.is_some() {
            log::info!("Worker exited ({})", exit);
            return false;
        }

        if exit.is_clean() {
            log::warn!("Worker exited cleanly without being asked to; terminating supervisor");
            let (calls, reason) = self.terminate_locked(&mut shared, TerminalReason::WorkerExited);
            shared.link = None;
            drop(shared);
            reject(calls, || reason.error());
            return false;
        }

        log::warn!("Worker crashed ({})", exit);
        self.set_state(&mut shared, ProcessState::Crashed);
        if let Some(ready_at) = shared.ready_at.take() {
            if ready_at.elapsed() >= self.config.restart.stable_period {
                shared.consecutive_failures = 0;
            }
        }
        shared.handle.pid = None;
        let link = shared.link.take();
        let calls: Vec<PendingCall> = shared.pending.drain().map(|(_, call)| call).collect();
        drop(shared);

        if let Some(link) = link {
            link.control.kill();
        }
        for PendingCall {
            method, resolver, ..
        } in calls
        {
            let _ = resolver.send(Err(Error::WorkerCrashed { method }));
        }
        true
    }

    /// Count a failure and wait out the backoff. False when no restart may follow.
    async fn schedule_restart(&self) -> bool {
        let max = self.config.restart.max_restarts;
        let (attempt, delay) = {
            let mut shared = self.lock();
            if shared.terminal.is_some() {
                return false;
            }
            shared.consecutive_failures += 1;
            let attempt = shared.consecutive_failures;
            if attempt > max {
                log::error!("Worker restart limit reached after {} attempts", max);
                let (calls, reason) =
                    self.terminate_locked(&mut shared, TerminalReason::Exhausted { attempts: max });
                shared.link = None;
                drop(shared);
                reject(calls, || reason.error());
                return false;
            }
            self.set_state(&mut shared, ProcessState::Restarting);
            shared.handle.restart_count += 1;
            (attempt, self.config.restart.delay(attempt))
        };

        log::info!(
            "Restarting worker in {:?} (attempt {}/{})",
            delay,
            attempt,
            max
        );
        let mut gate = self.state_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = async { gate.wait_for(|s| *s == ProcessState::Terminated).await.is_ok() } => false,
        }
    }
}

struct Registration {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    commands: UnboundedSender<SupervisorMessage>,
}

/// Drives one supervisor's workers: startup, supervision, restart, in a loop.
async fn run_lifecycle(inner: Arc<Inner>, started: oneshot::Sender<Result<()>>) {
    let mut started = Some(started);
    loop {
        let events = match inner.bring_up().await {
            Ok(events) => {
                if let Some(tx) = started.take() {
                    let _ = tx.send(Ok(()));
                }
                events
            }
            Err(e) => {
                if let Some(tx) = started.take() {
                    let message = match e {
                        Error::StartupFailed(message) => message,
                        other => other.to_string(),
                    };
                    log::error!("Worker startup failed: {}", message);
                    drop(inner.terminate(TerminalReason::StartupFailed(message.clone())));
                    let _ = tx.send(Err(Error::StartupFailed(message)));
                    return;
                }
                if inner.is_terminated() {
                    return;
                }
                log::warn!("Worker restart failed: {}", e);
                if !inner.schedule_restart().await {
                    return;
                }
                continue;
            }
        };

        let exit = inner.supervise(events).await;
        if !inner.handle_exit(exit) || !inner.schedule_restart().await {
            return;
        }
    }
}

/// Ready/create handshake with a freshly launched worker.
async fn handshake(
    commands: &UnboundedSender<SupervisorMessage>,
    events: &mut UnboundedReceiver<WorkerEvent>,
) -> Result<EngineKind> {
    let pid = loop {
        match events.recv().await {
            Some(WorkerEvent::Message(WorkerMessage::Ready { engine, pid })) => {
                log::debug!("Worker {} announced the {} engine", pid, engine);
                break pid;
            }
            Some(WorkerEvent::Message(other)) => {
                log::debug!("Ignoring {:?} before ready", other)
            }
            Some(WorkerEvent::Exited(exit)) => {
                return Err(Error::StartupFailed(format!(
                    "worker exited before ready ({})",
                    exit
                )))
            }
            None => {
                return Err(Error::StartupFailed(
                    "worker channel closed before ready".to_string(),
                ))
            }
        }
    };

    commands
        .send(SupervisorMessage::Create)
        .map_err(|_| Error::StartupFailed("worker channel closed before create".to_string()))?;

    loop {
        match events.recv().await {
            Some(WorkerEvent::Message(WorkerMessage::Created {
                success,
                initialized,
                engine,
            })) => {
                if !success {
                    return Err(Error::StartupFailed(format!(
                        "worker {} failed to create its engine",
                        pid
                    )));
                }
                if !initialized {
                    log::warn!("Worker {} reports its engine is not initialized", pid);
                }
                return Ok(engine);
            }
            Some(WorkerEvent::Message(other)) => {
                log::debug!("Ignoring {:?} during create", other)
            }
            Some(WorkerEvent::Exited(exit)) => {
                return Err(Error::StartupFailed(format!(
                    "worker exited during create ({})",
                    exit
                )))
            }
            None => {
                return Err(Error::StartupFailed(
                    "worker channel closed during create".to_string(),
                ))
            }
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn reject<F: Fn() -> Error>(calls: Vec<PendingCall>, error: F) {
    for call in calls {
        let _ = call.resolver.send(Err(error()));
    }
}
