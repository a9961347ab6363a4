//! Shutdown, liveness pings and the heartbeat.

use std::sync::Arc;
use std::time::Duration;

use fxvisor::{
    EnginePolicy, Error, InProcessLauncher, ProcessState, Supervisor, SupervisorConfig,
    SupervisorMessage, Value, WorkerMessage,
};

use crate::fixture::{fast_config, next_worker, wait_until, worker_process, ScriptedLauncher, WAIT};

#[tokio::test]
async fn test_shutdown_rejects_pending_and_later_calls() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let supervisor = Supervisor::with_launcher(fast_config(), launcher.clone())
        .await
        .unwrap();
    let mut worker = next_worker(&mut workers).await;
    let mut states = supervisor.subscribe_state();

    let call = supervisor.call("processAudio", vec![Value::Buffer(vec![0.0; 64])]);
    let stop = async {
        worker.next_invoke().await;
        supervisor.shutdown().await.unwrap();
        worker.next_request().await
    };
    let (result, seen) = tokio::join!(call, stop);

    assert!(matches!(result, Err(Error::SupervisorShuttingDown)));
    assert_eq!(seen, SupervisorMessage::Shutdown);
    assert!(worker.has_exited());
    assert_eq!(supervisor.state(), ProcessState::Terminated);
    assert_eq!(*states.borrow_and_update(), ProcessState::Terminated);
    assert_eq!(supervisor.pending_calls(), 0);

    assert!(matches!(
        supervisor.call("isInitialized", vec![]).await,
        Err(Error::SupervisorShuttingDown)
    ));
    // A second shutdown is a no-op
    supervisor.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn test_drop_asks_the_worker_to_exit() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let supervisor = Supervisor::with_launcher(fast_config(), launcher)
        .await
        .unwrap();
    let mut worker = next_worker(&mut workers).await;

    drop(supervisor);
    assert_eq!(worker.next_request().await, SupervisorMessage::Shutdown);
}

#[tokio::test]
async fn test_ping_round_trip() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let supervisor = Supervisor::with_launcher(fast_config(), launcher)
        .await
        .unwrap();
    let mut worker = next_worker(&mut workers).await;

    let ping = supervisor.ping();
    let driver = async {
        match worker.next_request().await {
            SupervisorMessage::Ping { id } => worker.send(WorkerMessage::Pong { id }),
            other => panic!("Expected ping, got {:?}", other),
        }
    };
    let (rtt, ()) = tokio::join!(ping, driver);
    assert!(rtt.unwrap() < WAIT);
}

#[tokio::test]
async fn test_ping_in_process_worker() {
    let launcher = InProcessLauncher::new(EnginePolicy::Fallback);
    let supervisor = Supervisor::with_launcher(fast_config(), Arc::new(launcher))
        .await
        .unwrap();

    assert!(supervisor.ping().await.is_ok());
    assert_eq!(supervisor.handle().pid, None);
    supervisor.shutdown().await.unwrap();
    assert!(matches!(
        supervisor.ping().await,
        Err(Error::SupervisorShuttingDown)
    ));
}

#[tokio::test]
async fn test_heartbeat_kills_unresponsive_worker() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        heartbeat_interval: Some(Duration::from_millis(50)),
        heartbeat_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let supervisor = Supervisor::with_launcher(config, launcher).await.unwrap();
    // Kept alive so pings are delivered and go unanswered
    let mut first = next_worker(&mut workers).await;
    assert!(matches!(
        first.next_request().await,
        SupervisorMessage::Ping { .. }
    ));

    let handle = wait_until(&supervisor, |h| h.generation >= 2).await;
    assert!(handle.restart_count >= 1);
    assert!(first.has_exited());

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_answered_heartbeat_keeps_worker() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        heartbeat_interval: Some(Duration::from_millis(20)),
        heartbeat_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let supervisor = Supervisor::with_launcher(config, launcher).await.unwrap();
    let mut worker = next_worker(&mut workers).await;

    for _ in 0..10 {
        match worker.next_request().await {
            SupervisorMessage::Ping { id } => worker.send(WorkerMessage::Pong { id }),
            other => panic!("Expected ping, got {:?}", other),
        }
    }

    let handle = supervisor.handle();
    assert_eq!(handle.state, ProcessState::Ready);
    assert_eq!(handle.generation, 1);
    assert!(!worker.has_exited());
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_the_worker_process() {
    let supervisor = Supervisor::with_launcher(fast_config(), Arc::new(worker_process()))
        .await
        .unwrap();
    let pid = supervisor.handle().pid.expect("worker process has a pid");
    assert!(supervisor.ping().await.is_ok());

    supervisor.shutdown().await.unwrap();
    assert_eq!(supervisor.state(), ProcessState::Terminated);

    let alive = unsafe { libc::kill(pid as libc::pid_t, 0) };
    assert_ne!(alive, 0, "worker {} still running", pid);
}
