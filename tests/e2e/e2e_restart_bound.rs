//! Restarts are bounded; startup failures never loop forever.

use std::time::Duration;

use fxvisor::{Error, ProcessState, RestartPolicy, Supervisor, SupervisorConfig, WorkerExit};

use crate::fixture::{fast_config, next_worker, wait_until, LaunchPlan, ScriptedLauncher};

#[tokio::test]
async fn test_restart_budget_is_exhausted() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        restart: RestartPolicy {
            max_restarts: 2,
            ..fast_config().restart
        },
        ..fast_config()
    };
    let supervisor = Supervisor::with_launcher(config, launcher.clone())
        .await
        .unwrap();
    let first = next_worker(&mut workers).await;

    // Every replacement dies before it is ready
    launcher.otherwise(LaunchPlan::ExitBeforeReady);
    first.exit(WorkerExit::signal(11));

    wait_until(&supervisor, |h| h.state == ProcessState::Terminated).await;
    assert_eq!(launcher.launches(), 3);
    assert_eq!(supervisor.handle().restart_count, 2);

    match supervisor.call("isInitialized", vec![]).await {
        Err(Error::RestartExhausted { attempts }) => assert_eq!(attempts, 2),
        other => panic!("Expected exhausted restarts, got {:?}", other),
    }
    assert!(matches!(
        supervisor.ping().await,
        Err(Error::RestartExhausted { .. })
    ));
}

#[tokio::test]
async fn test_spawn_failures_count_against_the_budget() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let config = SupervisorConfig {
        restart: RestartPolicy {
            max_restarts: 1,
            ..fast_config().restart
        },
        ..fast_config()
    };
    let supervisor = Supervisor::with_launcher(config, launcher.clone())
        .await
        .unwrap();
    let first = next_worker(&mut workers).await;

    launcher.otherwise(LaunchPlan::FailToSpawn);
    first.exit(WorkerExit::code(1));

    wait_until(&supervisor, |h| h.state == ProcessState::Terminated).await;
    assert_eq!(launcher.launches(), 2);
    let err = supervisor.call("isInitialized", vec![]).await.unwrap_err();
    assert!(err.is_terminal());
}

#[tokio::test]
async fn test_initial_startup_failure_is_reported() {
    let (launcher, _workers) = ScriptedLauncher::new();
    launcher.then(LaunchPlan::ExitBeforeReady);

    match Supervisor::with_launcher(fast_config(), launcher.clone()).await {
        Err(Error::StartupFailed(msg)) => assert!(msg.contains("exit code 3"), "{}", msg),
        Err(other) => panic!("Expected startup failure, got {:?}", other),
        Ok(_) => panic!("Expected startup failure"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.launches(), 1, "startup failure must not retry");
}

#[tokio::test]
async fn test_startup_timeout() {
    let (launcher, _workers) = ScriptedLauncher::new();
    launcher.then(LaunchPlan::Silent);
    let config = SupervisorConfig {
        startup_timeout: Duration::from_millis(100),
        ..fast_config()
    };

    match Supervisor::with_launcher(config, launcher).await {
        Err(Error::StartupFailed(msg)) => assert!(msg.contains("not ready within"), "{}", msg),
        Err(other) => panic!("Expected startup failure, got {:?}", other),
        Ok(_) => panic!("Expected startup failure"),
    }
}
