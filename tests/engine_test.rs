use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use face_reage_rs::mocks::{MockAgingModel, MockIdentityEncoder};
use face_reage_rs::{
    metrics::keys, AgeControls, Engine, EngineOptions, FrameContext, ModelConfig, ProcessingMode,
};

type MockEngine = Engine<MockAgingModel, MockIdentityEncoder>;

fn write_manifest(dir: &Path) {
    let entries = [
        ("feedforward", "generator.onnx", b"generator-weights".as_slice()),
        ("diffusion", "denoiser.onnx", b"denoiser-weights".as_slice()),
        ("identity", "encoder.onnx", b"encoder-weights".as_slice()),
    ];
    let mut models = Vec::new();
    for (kind, file, data) in entries {
        fs::write(dir.join(file), data).unwrap();
        models.push(format!(
            r#"{{"kind": "{kind}", "file": "{file}", "bytes": {}}}"#,
            data.len()
        ));
    }
    let manifest = format!(
        r#"{{"version": "test-1", "models": [{}]}}"#,
        models.join(", ")
    );
    fs::write(dir.join("manifest.json"), manifest).unwrap();
}

fn ready_engine(model_dir: &Path, options: EngineOptions) -> MockEngine {
    let engine = Engine::initialize(
        MockAgingModel,
        MockIdentityEncoder::new(4),
        ModelConfig::new(model_dir),
        options,
    )
    .unwrap();
    engine.load_models(model_dir).unwrap();
    engine
}

fn uniform_frame(width: u32, height: u32, value: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([value, value, value]))
}

#[test]
fn test_initialize_and_load_yields_ready_engine() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());

    let engine = Engine::initialize(
        MockAgingModel,
        MockIdentityEncoder::new(4),
        ModelConfig::new(temp_dir.path()),
        EngineOptions::default(),
    )
    .unwrap();
    assert!(!engine.is_ready());

    // ready になるまでフレーム処理は拒否される
    let context = FrameContext::new(0, uniform_frame(32, 32, 128), AgeControls::default());
    let result = engine.process_frame_standalone(context);
    assert!(!result.success);
    assert!(result.error_message.unwrap().contains("not loaded"));

    let manifest = engine.load_models(temp_dir.path()).unwrap();
    assert!(engine.is_ready());
    assert_eq!(manifest.models.len(), 3);
    assert!(engine.version_info().contains("test-1"));
}

#[test]
fn test_missing_model_file_leaves_engine_not_ready() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    fs::remove_file(temp_dir.path().join("denoiser.onnx")).unwrap();

    let engine = Engine::initialize(
        MockAgingModel,
        MockIdentityEncoder::new(4),
        ModelConfig::new(temp_dir.path()),
        EngineOptions::default(),
    )
    .unwrap();

    assert!(engine.load_models(temp_dir.path()).is_err());
    assert!(!engine.is_ready());
}

#[test]
fn test_invalid_config_fails_initialization() {
    let config = ModelConfig::new("models").with_batch_size(0);
    let result = Engine::initialize(
        MockAgingModel,
        MockIdentityEncoder::new(4),
        config,
        EngineOptions::default(),
    );
    assert!(result.is_err());
}

#[test]
fn test_output_dimensions_match_input() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    for (width, height) in [(32, 32), (48, 64), (100, 60)] {
        let context =
            FrameContext::new(0, uniform_frame(width, height, 100), AgeControls::new(65.0));
        let result = engine.process_frame_standalone(context);
        assert!(result.success, "{:?}", result.error_message);
        let output = result.output_frame.unwrap();
        assert_eq!(output.dimensions(), (width, height));
    }
}

#[test]
fn test_feedforward_is_idempotent_on_single_frame() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    let frame = uniform_frame(32, 32, 90);
    let controls = AgeControls::new(55.0);

    let first = engine.process_frame_standalone(
        FrameContext::new(0, frame.clone(), controls).with_mode(ProcessingMode::Feedforward),
    );
    let second = engine.process_frame_standalone(
        FrameContext::new(0, frame, controls).with_mode(ProcessingMode::Feedforward),
    );

    assert!(first.success && second.success);
    assert_eq!(first.output_frame.unwrap(), second.output_frame.unwrap());
}

#[test]
fn test_target_age_changes_output() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    let frame = uniform_frame(64, 64, 128);
    let young = engine.process_frame_standalone(
        FrameContext::new(0, frame.clone(), AgeControls::new(0.0))
            .with_mode(ProcessingMode::Feedforward),
    );
    let old = engine.process_frame_standalone(
        FrameContext::new(0, frame, AgeControls::new(80.0))
            .with_mode(ProcessingMode::Feedforward),
    );

    let young = young.output_frame.unwrap();
    let old = old.output_frame.unwrap();

    let total_diff: u64 = young
        .pixels()
        .zip(old.pixels())
        .flat_map(|(a, b)| a.0.iter().zip(b.0.iter()))
        .map(|(a, b)| u64::from(a.abs_diff(*b)))
        .sum();
    let mean_diff = total_diff as f64 / (64.0 * 64.0 * 3.0);
    assert!(
        mean_diff > 5.0,
        "expected measurably different outputs, mean diff {mean_diff}"
    );
}

#[test]
fn test_auto_mode_resolution_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    // 単発画像の Auto はハイブリッドに解決される
    let result = engine.process_frame_standalone(FrameContext::new(
        0,
        uniform_frame(32, 32, 128),
        AgeControls::default(),
    ));
    assert!(result.success);
    assert_eq!(
        result.metrics.get(keys::RESOLVED_MODE),
        Some(f64::from(ProcessingMode::Hybrid as u8))
    );

    // エンジン既定モードは Auto のコンテキストに適用される
    engine.set_processing_mode(ProcessingMode::Diffusion);
    assert_eq!(engine.processing_mode(), ProcessingMode::Diffusion);
    let result = engine.process_frame_standalone(FrameContext::new(
        0,
        uniform_frame(32, 32, 128),
        AgeControls::default(),
    ));
    assert_eq!(
        result.metrics.get(keys::RESOLVED_MODE),
        Some(f64::from(ProcessingMode::Diffusion as u8))
    );
}

#[test]
fn test_reload_rejected_while_sessions_active() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    let session = engine.create_session();
    assert!(engine.load_models(temp_dir.path()).is_err());

    engine.end_session(&session);
    assert!(engine.load_models(temp_dir.path()).is_ok());
}

#[test]
fn test_single_frame_failure_does_not_poison_session() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    let session = engine.create_session();
    let controls = AgeControls::default();

    let result = engine.process_frame(
        &session,
        FrameContext::new(5, uniform_frame(32, 32, 128), controls),
    );
    assert!(result.success);

    // フレーム番号の逆行はそのフレームだけの失敗になる
    let result = engine.process_frame(
        &session,
        FrameContext::new(3, uniform_frame(32, 32, 128), controls),
    );
    assert!(!result.success);
    assert!(result.error_message.unwrap().contains("frame_number"));

    // セッションは引き続き使える
    let result = engine.process_frame(
        &session,
        FrameContext::new(6, uniform_frame(32, 32, 128), controls),
    );
    assert!(result.success);

    let metrics = engine.performance_metrics();
    assert_eq!(metrics.get(keys::FRAMES_PROCESSED), Some(2.0));
    assert_eq!(metrics.get(keys::FRAMES_FAILED), Some(1.0));
}

#[test]
fn test_unknown_session_fails_cleanly() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    let session = engine.create_session();
    engine.end_session(&session);

    let result = engine.process_frame(
        &session,
        FrameContext::new(1, uniform_frame(32, 32, 128), AgeControls::default()),
    );
    assert!(!result.success);
    assert!(result.error_message.unwrap().contains("unknown session"));
}

#[test]
fn test_process_batch_preserves_order() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    let session = engine.create_session();
    let contexts: Vec<FrameContext> = (1..=4)
        .map(|n| FrameContext::new(n, uniform_frame(32, 32, 128), AgeControls::default()))
        .collect();

    let results = engine.process_batch(&session, contexts);
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success));

    let info = engine.session_info(&session).unwrap();
    assert_eq!(info.frames_seen, 4);
}

#[test]
fn test_empty_frame_is_rejected_per_frame() {
    let temp_dir = TempDir::new().unwrap();
    write_manifest(temp_dir.path());
    let engine = ready_engine(temp_dir.path(), EngineOptions::default());

    let result = engine.process_frame_standalone(FrameContext::new(
        0,
        RgbImage::new(0, 0),
        AgeControls::default(),
    ));
    assert!(!result.success);
    assert!(result.error_message.unwrap().contains("empty frame"));
}
