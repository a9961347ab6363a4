//! A native engine that cannot be built yields a worker on the software engine.

use std::sync::Arc;

use fxvisor::{
    AudioProcessor, EngineKind, EnginePolicy, Error, InProcessLauncher, ProcessState, Supervisor,
};

use crate::fixture::{fast_config, worker_process};

#[tokio::test]
async fn test_missing_native_library_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = InProcessLauncher::new(EnginePolicy::Auto)
        .native_library(dir.path().join("libfxvisor_engine.so"));
    let processor = AudioProcessor::with_launcher(fast_config(), Arc::new(launcher))
        .await
        .unwrap();

    assert_eq!(processor.engine_kind(), Some(EngineKind::Fallback));
    assert_eq!(processor.supervisor().state(), ProcessState::Ready);

    // Every operation works on the fallback
    assert!(processor.is_initialized().await.unwrap());
    processor.set_volume(0.8).await.unwrap();
    processor.set_mod_enabled(true).await.unwrap();
    processor.set_mod_rate(0.4).await.unwrap();
    processor.set_mod_depth(0.6).await.unwrap();
    processor.set_filter_cutoff(2500.0).await.unwrap();
    processor.set_filter_resonance(1.5).await.unwrap();
    processor.set_pitch_bend(-3.0).await.unwrap();
    processor.set_control_position(0.25).await.unwrap();

    let out = processor.process_audio(vec![0.5f32; 512]).await.unwrap();
    assert_eq!(out.len(), 512);
    assert!(out.iter().all(|s| s.is_finite() && s.abs() <= 1.0));

    let params = processor.parameters().await.unwrap();
    assert_eq!(params.volume, 0.8);
    assert!(params.mod_enabled);
    assert_eq!(params.filter_cutoff, 2500.0);
    assert_eq!(params.pitch_bend, -3.0);

    processor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_values_clamp_idempotently() {
    let launcher = InProcessLauncher::new(EnginePolicy::Fallback);
    let processor = AudioProcessor::with_launcher(fast_config(), Arc::new(launcher))
        .await
        .unwrap();

    processor.set_volume(7.0).await.unwrap();
    processor.set_filter_cutoff(5.0).await.unwrap();
    processor.set_pitch_bend(100.0).await.unwrap();
    let once = processor.parameters().await.unwrap();
    assert_eq!(once.volume, 1.0);
    assert_eq!(once.filter_cutoff, 20.0);
    assert_eq!(once.pitch_bend, 24.0);

    processor.set_volume(7.0).await.unwrap();
    processor.set_filter_cutoff(5.0).await.unwrap();
    processor.set_pitch_bend(100.0).await.unwrap();
    assert_eq!(processor.parameters().await.unwrap(), once);

    processor.set_mod_depth(f32::NAN).await.unwrap();
    assert_eq!(processor.parameters().await.unwrap().mod_depth, 0.3);
}

#[tokio::test]
async fn test_native_only_policy_without_engine_fails_startup() {
    let launcher = InProcessLauncher::new(EnginePolicy::Native);

    match Supervisor::with_launcher(fast_config(), Arc::new(launcher)).await {
        Err(Error::StartupFailed(msg)) => assert!(msg.contains("exit code 2"), "{}", msg),
        Err(other) => panic!("Expected startup failure, got {:?}", other),
        Ok(_) => panic!("Expected startup failure"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_process_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let garbage = dir.path().join("libgarbage.so");
    std::fs::write(&garbage, b"not a shared library").unwrap();

    let launcher = worker_process()
        .engine(EnginePolicy::Auto)
        .native_library(&garbage);
    let processor = AudioProcessor::with_launcher(fast_config(), Arc::new(launcher))
        .await
        .unwrap();

    assert_eq!(processor.engine_kind(), Some(EngineKind::Fallback));
    let out = processor.process_audio(vec![0.1f32; 1024]).await.unwrap();
    assert_eq!(out.len(), 1024);
    assert!(processor.supervisor().handle().pid.is_some());

    processor.shutdown().await.unwrap();
}
