//! Worker executable run as a child process, framed over its stdin/stdout.

use std::env;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::config::{SupervisorConfig, ENV_WORKER_PATH};
use crate::engine::EnginePolicy;
use crate::error::{Error, Result};
use crate::protocol::{encode_frame, read_frame, SupervisorMessage, WorkerMessage};

use super::launcher::{WorkerControl, WorkerEvent, WorkerExit, WorkerLauncher, WorkerLink};

/// File name of the worker executable, without platform suffix.
pub const WORKER_BINARY: &str = "fxvisor-worker";

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long to wait after SIGTERM before killing.
const TERM_GRACE: Duration = Duration::from_secs(2);
/// How long a worker may keep running after closing its stdout.
const REAP_GRACE: Duration = Duration::from_secs(2);

/// Launches `fxvisor-worker` processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    engine: EnginePolicy,
    native_library: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            engine: EnginePolicy::default(),
            native_library: None,
        }
    }

    /// Launcher for the worker executable named by `config`, or found nearby.
    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let program = resolve_worker_path(config.worker_path.as_deref())?;
        Ok(Self {
            program,
            engine: config.engine,
            native_library: config.native_library.clone(),
        })
    }

    pub fn engine(mut self, policy: EnginePolicy) -> Self {
        self.engine = policy;
        self
    }

    pub fn native_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.native_library = Some(path.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self) -> Result<WorkerLink> {
        let mut command = Command::new(&self.program);
        command.arg("--engine").arg(self.engine.as_str());
        if let Some(library) = &self.native_library {
            command.arg("--native-library").arg(library);
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::StartupFailed(format!(
                    "failed to spawn worker {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::StartupFailed(
                    "worker stdio was not captured".to_string(),
                ));
            }
        };
        log::info!("Spawned worker {} (pid {})", self.program.display(), pid);

        let child = Arc::new(Mutex::new(child));
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SupervisorMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name(format!("fxvisor-writer-{}", pid))
            .spawn(move || pump_commands(&mut command_rx, BufWriter::new(stdin), pid))?;

        let reader_child = Arc::clone(&child);
        thread::Builder::new()
            .name(format!("fxvisor-reader-{}", pid))
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    match read_frame::<_, WorkerMessage>(&mut reader) {
                        Ok(msg) => {
                            log::debug!("Worker {} -> {:?}", pid, msg);
                            if event_tx.send(WorkerEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.is_eof() => break,
                        Err(e) => {
                            log::warn!("Worker {} sent an unreadable frame: {}", pid, e);
                            kill_child(&reader_child);
                            break;
                        }
                    }
                }
                let exit = reap(&reader_child, pid);
                log::debug!("Worker {} exited: {}", pid, exit);
                let _ = event_tx.send(WorkerEvent::Exited(exit));
            })?;

        Ok(WorkerLink {
            commands: command_tx,
            events: event_rx,
            control: Arc::new(ProcessControl { pid, child }),
        })
    }
}

struct ProcessControl {
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl WorkerControl for ProcessControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&self) {
        kill_child(&self.child);
    }

    fn terminate(&self, grace: Duration) {
        if wait_for_exit(&self.child, grace).is_some() {
            return;
        }

        log::warn!(
            "Worker {} did not exit within {:?}, sending SIGTERM",
            self.pid,
            grace
        );
        send_sigterm(&self.child);
        if wait_for_exit(&self.child, TERM_GRACE).is_some() {
            return;
        }

        log::error!("Worker {} did not respond to SIGTERM, killing", self.pid);
        kill_child(&self.child);
        let _ = wait_for_exit(&self.child, TERM_GRACE);
    }
}

/// Frame commands onto the worker's stdin until the channel or the pipe closes.
///
/// A command that cannot be encoded is dropped; only a write failure stops the pump.
fn pump_commands<W: Write>(
    commands: &mut UnboundedReceiver<SupervisorMessage>,
    mut writer: W,
    pid: u32,
) {
    while let Some(msg) = commands.blocking_recv() {
        let frame = match encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Dropping command for worker {}: {}", pid, e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).and_then(|()| writer.flush()) {
            log::debug!("Writer for worker {} stopped: {}", pid, e);
            break;
        }
    }
}

fn exit_of(status: ExitStatus) -> WorkerExit {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        WorkerExit {
            code: status.code(),
            signal: status.signal(),
        }
    }

    #[cfg(not(unix))]
    {
        WorkerExit {
            code: status.code(),
            signal: None,
        }
    }
}

/// Poll until the child exits or `timeout` elapses.
fn wait_for_exit(child: &Mutex<Child>, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        match status {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                log::debug!("Failed to poll worker status: {}", e);
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_child(child: &Mutex<Child>) {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    // Never signal a pid that has already been reaped
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Mutex<Child>) {
    let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
    if let Ok(None) = child.try_wait() {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &Mutex<Child>) {
    kill_child(child);
}

/// Collect the exit status once the worker closed its stdout.
fn reap(child: &Mutex<Child>, pid: u32) -> WorkerExit {
    if let Some(status) = wait_for_exit(child, REAP_GRACE) {
        return exit_of(status);
    }
    log::warn!("Worker {} closed its output but kept running, killing", pid);
    kill_child(child);
    let status = child
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .wait();
    match status {
        Ok(status) => exit_of(status),
        Err(e) => {
            log::warn!("Failed to reap worker {}: {}", pid, e);
            WorkerExit::unknown()
        }
    }
}

/// Locate the worker executable.
///
/// Order: explicit path, `FXVISOR_WORKER_PATH`, next to the current executable,
/// then the current executable's parent directory.
pub fn resolve_worker_path(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = env::var_os(ENV_WORKER_PATH).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    let exe = env::current_exe()?;
    let name = format!("{}{}", WORKER_BINARY, env::consts::EXE_SUFFIX);
    let mut dirs = Vec::new();
    if let Some(dir) = exe.parent() {
        dirs.push(dir);
        if let Some(parent) = dir.parent() {
            dirs.push(parent);
        }
    }
    for dir in dirs {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            log::debug!("Found worker executable at {}", candidate.display());
            return Ok(candidate);
        }
    }

    Err(Error::StartupFailed(format!(
        "worker executable '{}' not found near {}; set {}",
        name,
        exe.display(),
        ENV_WORKER_PATH
    )))
}
