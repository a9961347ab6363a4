//! Worker crashes reject in-flight calls, then the supervisor restarts the worker.

use std::sync::Arc;
use std::time::Duration;

use fxvisor::{
    AudioProcessor, Error, ProcessState, RestartPolicy, Supervisor, SupervisorConfig, Value,
    WorkerExit,
};

use crate::fixture::{fast_config, next_worker, wait_until, worker_process, ScriptedLauncher};

#[tokio::test]
async fn test_crash_rejects_pending_and_restarts() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let supervisor = Supervisor::with_launcher(fast_config(), launcher.clone())
        .await
        .unwrap();
    let mut first = next_worker(&mut workers).await;

    let calls = async {
        tokio::join!(
            supervisor.call("processAudio", vec![Value::Buffer(vec![0.1; 32])]),
            supervisor.call("setVolume", vec![Value::Number(0.5)]),
            supervisor.call("getParameters", vec![]),
        )
    };
    let driver = async {
        for _ in 0..3 {
            first.next_invoke().await;
        }
        assert_eq!(supervisor.pending_calls(), 3);
        first.exit(WorkerExit::signal(11));
    };
    let ((a, b, c), ()) = tokio::join!(calls, driver);
    for (result, expected) in [(a, "processAudio"), (b, "setVolume"), (c, "getParameters")] {
        match result {
            Err(Error::WorkerCrashed { method }) => assert_eq!(method, expected),
            other => panic!("Expected crash error, got {:?}", other),
        }
    }
    assert_eq!(supervisor.pending_calls(), 0);

    let handle =
        wait_until(&supervisor, |h| h.state == ProcessState::Ready && h.generation == 2).await;
    assert_eq!(handle.restart_count, 1);
    assert_eq!(launcher.launches(), 2);

    let mut second = next_worker(&mut workers).await;
    let call = supervisor.call("setVolume", vec![Value::Number(0.25)]);
    let driver = async {
        let (id, method, args) = second.next_invoke().await;
        assert_eq!(method, "setVolume");
        assert_eq!(args, vec![Value::Number(0.25)]);
        second.respond(id, Value::Null);
    };
    let (result, ()) = tokio::join!(call, driver);
    assert_eq!(result.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_calls_queue_while_restarting() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        restart: RestartPolicy {
            initial_backoff: Duration::from_millis(300),
            ..fast_config().restart
        },
        ..fast_config()
    };
    let supervisor = Supervisor::with_launcher(config, launcher).await.unwrap();
    let first = next_worker(&mut workers).await;

    first.exit(WorkerExit::code(101));
    wait_until(&supervisor, |h| h.state == ProcessState::Restarting).await;

    let call = supervisor.call("isInitialized", vec![]);
    let driver = async {
        let mut second = next_worker(&mut workers).await;
        let (id, _, _) = second.next_invoke().await;
        second.respond(id, Value::Bool(true));
        second
    };
    let (result, _second) = tokio::join!(call, driver);
    assert_eq!(result.unwrap(), Value::Bool(true));
    assert_eq!(supervisor.handle().generation, 2);
}

#[tokio::test]
async fn test_unrequested_clean_exit_terminates() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let supervisor = Supervisor::with_launcher(fast_config(), launcher.clone())
        .await
        .unwrap();
    let mut worker = next_worker(&mut workers).await;

    let call = supervisor.call("setPitchBend", vec![Value::Number(3.0)]);
    let driver = async {
        worker.next_invoke().await;
        worker.exit(WorkerExit::code(0));
    };
    let (result, ()) = tokio::join!(call, driver);
    assert!(matches!(result, Err(Error::SupervisorShuttingDown)));

    wait_until(&supervisor, |h| h.state == ProcessState::Terminated).await;
    assert!(matches!(
        supervisor.call("isInitialized", vec![]).await,
        Err(Error::SupervisorShuttingDown)
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn test_stable_worker_resets_restart_budget() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        restart: RestartPolicy {
            max_restarts: 1,
            stable_period: Duration::from_millis(50),
            ..fast_config().restart
        },
        ..fast_config()
    };
    let supervisor = Supervisor::with_launcher(config, launcher).await.unwrap();

    // Each worker stays up past the stable period before crashing
    for generation in 1..=3u64 {
        let worker = next_worker(&mut workers).await;
        wait_until(&supervisor, |h| {
            h.state == ProcessState::Ready && h.generation == generation
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.exit(WorkerExit::signal(6));
    }

    let handle =
        wait_until(&supervisor, |h| h.state == ProcessState::Ready && h.generation == 4).await;
    assert_eq!(handle.restart_count, 3);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_worker_recovers_from_sigkill() {
    let processor = AudioProcessor::with_launcher(fast_config(), Arc::new(worker_process()))
        .await
        .unwrap();
    processor.set_volume(0.5).await.unwrap();
    let block = processor.process_audio(vec![0.2f32; 256]).await.unwrap();
    assert_eq!(block.len(), 256);

    let supervisor = processor.supervisor();
    let first_pid = supervisor.handle().pid.expect("worker process has a pid");
    let killed = unsafe { libc::kill(first_pid as libc::pid_t, libc::SIGKILL) };
    assert_eq!(killed, 0);

    let handle =
        wait_until(supervisor, |h| h.state == ProcessState::Ready && h.generation == 2).await;
    let second_pid = handle.pid.expect("restarted worker has a pid");
    assert_ne!(first_pid, second_pid);

    // The new worker starts from default parameters
    let params = processor.parameters().await.unwrap();
    assert_eq!(params.volume, 1.0);
    assert!(processor.is_initialized().await.unwrap());

    processor.shutdown().await.unwrap();
    assert_eq!(supervisor.state(), ProcessState::Terminated);
}
