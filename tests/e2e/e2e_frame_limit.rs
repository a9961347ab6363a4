//! Arguments too large for one frame fail that call alone.

use std::sync::Arc;

use fxvisor::protocol::MAX_FRAME_BYTES;
use fxvisor::{AudioProcessor, Error, ProcessState, ProtocolError, Supervisor, Value};

use crate::fixture::{fast_config, next_worker, worker_process, ScriptedLauncher};

fn oversized_block() -> Vec<f32> {
    vec![0.0f32; MAX_FRAME_BYTES / std::mem::size_of::<f32>() + 16]
}

#[tokio::test]
async fn test_oversized_call_never_reaches_the_worker() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let supervisor = Supervisor::with_launcher(fast_config(), launcher.clone())
        .await
        .unwrap();
    let mut worker = next_worker(&mut workers).await;

    match supervisor
        .call("processAudio", vec![Value::Buffer(oversized_block())])
        .await
    {
        Err(Error::Protocol(ProtocolError::FrameTooLarge(len))) => {
            assert!(len > MAX_FRAME_BYTES)
        }
        other => panic!("Expected frame too large, got {:?}", other),
    }
    assert_eq!(supervisor.pending_calls(), 0);

    // The next command the worker sees is the next call
    let call = supervisor.call("isInitialized", vec![]);
    let driver = async {
        let (id, method, _) = worker.next_invoke().await;
        assert_eq!(method, "isInitialized");
        worker.respond(id, Value::Bool(true));
    };
    let (result, ()) = tokio::join!(call, driver);
    assert_eq!(result.unwrap(), Value::Bool(true));
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_block_leaves_worker_process_running() {
    let processor = AudioProcessor::with_launcher(fast_config(), Arc::new(worker_process()))
        .await
        .unwrap();
    let pid = processor.supervisor().handle().pid;

    let result = processor.process_audio(oversized_block()).await;
    assert!(
        matches!(result, Err(Error::Protocol(ProtocolError::FrameTooLarge(_)))),
        "{:?}",
        result
    );

    assert!(processor.is_initialized().await.unwrap());
    let out = processor.process_audio(vec![0.25f32; 4096]).await.unwrap();
    assert_eq!(out.len(), 4096);

    let handle = processor.supervisor().handle();
    assert_eq!(handle.state, ProcessState::Ready);
    assert_eq!(handle.generation, 1);
    assert_eq!(handle.pid, pid);

    processor.shutdown().await.unwrap();
}
