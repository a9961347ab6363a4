//! Worker run on a thread of the caller's process.
//!
//! Panics are contained, but a native fault in the engine takes the whole
//! process down. Use `ProcessLauncher` wherever the native engine may run.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};

use crate::engine::EnginePolicy;
use crate::error::Result;
use crate::protocol::{ProtocolError, SupervisorMessage, WorkerMessage};
use crate::worker::{self, WorkerChannel, EXIT_PANIC};

use super::launcher::{WorkerControl, WorkerEvent, WorkerExit, WorkerLauncher, WorkerLink};

/// Launches workers on dedicated threads.
#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher {
    engine: EnginePolicy,
    native_library: Option<PathBuf>,
}

impl InProcessLauncher {
    pub fn new(engine: EnginePolicy) -> Self {
        Self {
            engine,
            native_library: None,
        }
    }

    pub fn native_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.native_library = Some(path.into());
        self
    }
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self) -> Result<WorkerLink> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let killed = Arc::new(AtomicBool::new(false));
        let finished = Arc::new((Mutex::new(false), Condvar::new()));

        let control = Arc::new(ThreadControl {
            commands: command_tx.downgrade(),
            killed: Arc::clone(&killed),
            finished: Arc::clone(&finished),
        });

        let policy = self.engine;
        let library = self.native_library.clone();
        thread::Builder::new()
            .name("fxvisor-worker".to_string())
            .spawn(move || {
                let mut channel = ThreadChannel {
                    commands: command_rx,
                    events: event_tx.clone(),
                    killed: Arc::clone(&killed),
                };
                let code = panic::catch_unwind(AssertUnwindSafe(|| {
                    worker::run(policy, library.as_deref(), &mut channel)
                }))
                .unwrap_or_else(|_| {
                    log::error!("In-process worker panicked");
                    EXIT_PANIC
                });

                let exit = if killed.load(Ordering::SeqCst) {
                    WorkerExit::unknown()
                } else {
                    WorkerExit::code(code)
                };
                let _ = event_tx.send(WorkerEvent::Exited(exit));

                let (done, cvar) = &*finished;
                *done.lock().unwrap_or_else(PoisonError::into_inner) = true;
                cvar.notify_all();
            })?;

        Ok(WorkerLink {
            commands: command_tx,
            events: event_rx,
            control,
        })
    }
}

struct ThreadChannel {
    commands: UnboundedReceiver<SupervisorMessage>,
    events: UnboundedSender<WorkerEvent>,
    killed: Arc<AtomicBool>,
}

impl ThreadChannel {
    fn closed() -> ProtocolError {
        ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "worker was killed",
        ))
    }
}

impl WorkerChannel for ThreadChannel {
    fn recv(&mut self) -> std::result::Result<Option<SupervisorMessage>, ProtocolError> {
        let msg = self.commands.blocking_recv();
        if self.killed.load(Ordering::SeqCst) {
            return Err(Self::closed());
        }
        Ok(msg)
    }

    fn send(&mut self, msg: WorkerMessage) -> std::result::Result<(), ProtocolError> {
        // A killed worker must not answer anything
        if self.killed.load(Ordering::SeqCst) {
            return Err(Self::closed());
        }
        self.events
            .send(WorkerEvent::Message(msg))
            .map_err(|_| Self::closed())
    }
}

struct ThreadControl {
    commands: WeakUnboundedSender<SupervisorMessage>,
    killed: Arc<AtomicBool>,
    finished: Arc<(Mutex<bool>, Condvar)>,
}

impl WorkerControl for ThreadControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the worker if it is waiting for a command
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(SupervisorMessage::Shutdown);
        }
    }

    fn terminate(&self, grace: Duration) {
        let (done, cvar) = &*self.finished;
        let guard = done.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, grace, |finished| !*finished)
            .unwrap_or_else(PoisonError::into_inner);
        if !*guard {
            drop(guard);
            log::warn!("In-process worker did not stop within {:?}", grace);
            self.kill();
        }
    }
}
