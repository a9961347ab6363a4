//! A timed-out call fails alone; the worker and other calls carry on.

use std::time::Duration;

use fxvisor::{Error, ProcessState, Supervisor, SupervisorConfig, Value, WorkerMessage};

use crate::fixture::{fast_config, next_worker, wait_until, ScriptedLauncher, WAIT};

fn short_timeout() -> SupervisorConfig {
    SupervisorConfig {
        call_timeout: Duration::from_millis(200),
        ..fast_config()
    }
}

#[tokio::test]
async fn test_timeout_isolates_the_slow_call() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let supervisor = Supervisor::with_launcher(short_timeout(), launcher)
        .await
        .unwrap();
    let mut worker = next_worker(&mut workers).await;

    let calls = async {
        tokio::join!(
            supervisor.call("setVolume", vec![Value::Number(0.5)]),
            supervisor.call("setModDepth", vec![Value::Number(0.5)]),
        )
    };
    let driver = async move {
        let mut slow = None;
        for _ in 0..2 {
            let (id, method, _) = worker.next_invoke().await;
            if method == "setVolume" {
                slow = Some(id);
            } else {
                worker.respond(id, Value::Null);
            }
        }
        (worker, slow.unwrap())
    };

    let ((slow_result, fast_result), (mut worker, slow_id)) = tokio::join!(calls, driver);
    match slow_result {
        Err(Error::CallTimeout { method, timeout }) => {
            assert_eq!(method, "setVolume");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("Expected timeout, got {:?}", other),
    }
    assert_eq!(fast_result.unwrap(), Value::Null);
    assert_eq!(supervisor.pending_calls(), 0);

    // The late answer is dropped and the worker keeps serving
    worker.respond(slow_id, Value::Null);
    let next = supervisor.call("isInitialized", vec![]);
    let driver = async {
        let (id, _, _) = worker.next_invoke().await;
        worker.respond(id, Value::Bool(true));
    };
    let (result, ()) = tokio::join!(next, driver);
    assert_eq!(result.unwrap(), Value::Bool(true));

    let handle = supervisor.handle();
    assert_eq!(handle.state, ProcessState::Ready);
    assert_eq!(handle.generation, 1);
    assert_eq!(handle.restart_count, 0);
    assert!(!worker.has_exited());
}

#[tokio::test]
async fn test_restart_on_timeout_replaces_the_worker() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        restart_on_timeout: true,
        ..short_timeout()
    };
    let supervisor = Supervisor::with_launcher(config, launcher).await.unwrap();
    let mut first = next_worker(&mut workers).await;

    let call = supervisor.call("processAudio", vec![Value::Buffer(vec![0.0; 16])]);
    let driver = async {
        // Swallow the request without answering
        first.next_invoke().await;
    };
    let (result, ()) = tokio::join!(call, driver);
    assert!(matches!(result, Err(Error::CallTimeout { .. })));

    wait_until(&supervisor, |h| h.state == ProcessState::Ready && h.generation == 2).await;
    assert!(first.has_exited());

    let mut second = next_worker(&mut workers).await;
    let call = supervisor.call("isInitialized", vec![]);
    let driver = async {
        let (id, _, _) = second.next_invoke().await;
        second.respond(id, Value::Bool(true));
    };
    let (result, ()) = tokio::join!(call, driver);
    assert_eq!(result.unwrap(), Value::Bool(true));
}

#[tokio::test]
async fn test_call_deadline_covers_waiting_for_readiness() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        restart: fxvisor::RestartPolicy {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            ..fast_config().restart
        },
        ..short_timeout()
    };
    let supervisor = Supervisor::with_launcher(config, launcher).await.unwrap();
    let worker = next_worker(&mut workers).await;

    worker.exit(fxvisor::WorkerExit::signal(11));
    wait_until(&supervisor, |h| h.state == ProcessState::Restarting).await;

    // The restart is seconds away; the call gives up at its own deadline
    let started = tokio::time::Instant::now();
    let result = supervisor.call("isInitialized", vec![]).await;
    assert!(matches!(result, Err(Error::CallTimeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_abandoned_call_is_overdue_until_swept() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        call_timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let supervisor = Supervisor::with_launcher(config, launcher).await.unwrap();
    let mut worker = next_worker(&mut workers).await;

    // The caller gives up before the supervisor's own deadline
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        supervisor.call("processAudio", vec![Value::Buffer(vec![0.0; 16])]),
    );
    let (gave_up, _) = tokio::join!(abandoned, worker.next_invoke());
    assert!(gave_up.is_err());
    assert_eq!(supervisor.pending_calls(), 1);
    assert_eq!(supervisor.overdue_calls(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(supervisor.overdue_calls(), 1);

    // Any worker event sweeps it, even one for an unknown id
    worker.send(WorkerMessage::Pong { id: 9999 });
    tokio::time::timeout(WAIT, async {
        while supervisor.pending_calls() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("abandoned call was never swept");
    assert_eq!(supervisor.overdue_calls(), 0);
    assert_eq!(supervisor.state(), ProcessState::Ready);
}
