use std::path::Path;
use std::time::Instant;

use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{EngineOptions, ModelConfig};
use crate::controls::ProcessingMode;
use crate::errors::{FaceReageError, Result};
use crate::frame::{frame_to_tensor, tensor_to_frame, FrameContext, ProcessingResult};
use crate::metrics::{keys, Metrics};
use crate::model::{OrtAgingModel, OrtIdentityEncoder};
use crate::registry::{LoadedManifest, ModelRegistry};
use crate::session::{SessionId, SessionInfo, SessionManager};
use crate::stabilizer::{stabilize, StabilizerState};
use crate::strategy::StrategyEngine;
use crate::traits::{AgingModel, IdentityEncoder};

#[derive(Debug, Default)]
struct EngineCounters {
    frames_processed: u64,
    frames_failed: u64,
}

/// 処理パイプライン全体のファサード
///
/// レジストリ・ストラテジーエンジン・セッション表を所有する明示的な
/// インスタンスで、グローバル状態は持たない。フレーム単位の失敗は
/// success=false の結果として返し、エンジン自体は次のフレームに使える。
///
/// コンテキストのモードが Auto の場合はエンジン既定モードを参照し、
/// それも Auto ならストラテジーエンジンがフレーム毎に解決する。
pub struct Engine<M: AgingModel, I: IdentityEncoder> {
    registry: RwLock<ModelRegistry>,
    options: EngineOptions,
    model: M,
    encoder: I,
    strategies: StrategyEngine,
    sessions: SessionManager,
    default_mode: RwLock<ProcessingMode>,
    counters: Mutex<EngineCounters>,
}

impl Engine<OrtAgingModel, OrtIdentityEncoder> {
    /// ONNX 実装一式を組み立てる簡易コンストラクタ
    ///
    /// レジストリでマニフェストを検証してから ort セッションを構築する。
    pub fn with_onnx_models(config: ModelConfig, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let mut registry = ModelRegistry::initialize(config)?;
        let model_dir = registry.config().model_dir.clone();
        let manifest = registry.load_models(&model_dir)?;

        let device_id = registry.config().device_id;
        let model = OrtAgingModel::load(&manifest, registry.backend_plan(), device_id)?;
        let encoder = OrtIdentityEncoder::load(&manifest, registry.backend_plan(), device_id)?;
        info!(version = %registry.version_info(), "engine ready");
        Ok(Self::from_parts(registry, model, encoder, options))
    }
}

impl<M: AgingModel, I: IdentityEncoder> Engine<M, I> {
    /// 設定を検証しバックエンドを解決する
    ///
    /// モデルファイルの検証はまだ行わない。`load_models` が通るまで
    /// フレーム処理は拒否される。
    pub fn initialize(model: M, encoder: I, config: ModelConfig, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let registry = ModelRegistry::initialize(config)?;
        Ok(Self::from_parts(registry, model, encoder, options))
    }

    fn from_parts(registry: ModelRegistry, model: M, encoder: I, options: EngineOptions) -> Self {
        let idle_timeout = options.session_idle_timeout;
        Self {
            registry: RwLock::new(registry),
            options,
            model,
            encoder,
            strategies: StrategyEngine::new(),
            sessions: SessionManager::new(idle_timeout),
            default_mode: RwLock::new(ProcessingMode::Auto),
            counters: Mutex::new(EngineCounters::default()),
        }
    }

    /// マニフェストを検証して ready 状態にする
    ///
    /// アクティブなセッションがある間の再ロードは拒否する。
    pub fn load_models(&self, model_dir: &Path) -> Result<LoadedManifest> {
        let active = self.sessions.active_count();
        if active > 0 {
            return Err(FaceReageError::Init {
                reason: format!("cannot reload models while {active} session(s) are active"),
            });
        }
        self.registry.write().load_models(model_dir)
    }

    pub fn is_ready(&self) -> bool {
        self.registry.read().is_ready()
    }

    pub fn version_info(&self) -> String {
        self.registry.read().version_info()
    }

    pub fn set_processing_mode(&self, mode: ProcessingMode) {
        *self.default_mode.write() = mode;
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        *self.default_mode.read()
    }

    pub fn create_session(&self) -> SessionId {
        self.sessions.create()
    }

    pub fn end_session(&self, id: &SessionId) -> bool {
        self.sessions.end(id)
    }

    pub fn session_info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.info(id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }

    pub fn evict_idle_sessions(&self) -> usize {
        self.sessions.evict_idle()
    }

    /// セッションに属する 1 フレームを処理する
    ///
    /// ステージ失敗は success=false の結果に変換され、セッションは
    /// 以降のフレームにそのまま使える。
    pub fn process_frame(&self, session_id: &SessionId, context: FrameContext) -> ProcessingResult {
        let total_start = Instant::now();
        let mut metrics = Metrics::new();

        let Some(session) = self.sessions.get(session_id) else {
            let error = FaceReageError::SessionState {
                reason: format!("unknown session {session_id}"),
            };
            self.counters.lock().frames_failed += 1;
            return ProcessingResult::failed(&error, metrics);
        };

        // セッション状態への排他アクセス。同一セッションの同時処理は
        // ここで直列化される
        let mut session = session.lock();
        let result = self.run_pipeline(&mut session.state, &context, &mut metrics, true);
        drop(session);

        self.finish(result, metrics, total_start)
    }

    /// セッション履歴を持たない単発画像の処理
    pub fn process_frame_standalone(&self, context: FrameContext) -> ProcessingResult {
        let total_start = Instant::now();
        let mut metrics = Metrics::new();
        let mut state = StabilizerState::new();
        let result = self.run_pipeline(&mut state, &context, &mut metrics, false);
        self.finish(result, metrics, total_start)
    }

    /// セッション内の順序を保ったバッチ処理
    pub fn process_batch(
        &self,
        session_id: &SessionId,
        contexts: Vec<FrameContext>,
    ) -> Vec<ProcessingResult> {
        contexts
            .into_iter()
            .map(|context| self.process_frame(session_id, context))
            .collect()
    }

    /// エンジン全体の集計メトリクス
    pub fn performance_metrics(&self) -> Metrics {
        let counters = self.counters.lock();
        let mut metrics = Metrics::new();
        metrics.record(keys::FRAMES_PROCESSED, counters.frames_processed as f64);
        metrics.record(keys::FRAMES_FAILED, counters.frames_failed as f64);
        metrics
    }

    fn finish(
        &self,
        result: Result<RgbImage>,
        mut metrics: Metrics,
        total_start: Instant,
    ) -> ProcessingResult {
        metrics.record(keys::TOTAL_MS, total_start.elapsed().as_secs_f64() * 1000.0);
        match result {
            Ok(frame) => {
                let mut counters = self.counters.lock();
                counters.frames_processed += 1;
                ProcessingResult::ok(frame, metrics)
            }
            Err(error) => {
                warn!(error = %error, "frame processing failed");
                let mut counters = self.counters.lock();
                counters.frames_failed += 1;
                ProcessingResult::failed(&error, metrics)
            }
        }
    }

    fn run_pipeline(
        &self,
        state: &mut StabilizerState,
        context: &FrameContext,
        metrics: &mut Metrics,
        is_video: bool,
    ) -> Result<RgbImage> {
        let max_resolution = {
            let registry = self.registry.read();
            if !registry.is_ready() {
                return Err(FaceReageError::Init {
                    reason: "models not loaded".to_string(),
                });
            }
            metrics.record(keys::BACKEND, f64::from(registry.backend_plan().bound.ordinal()));
            registry.config().max_resolution
        };

        let (width, height) = context.dimensions();
        if width == 0 || height == 0 {
            return Err(FaceReageError::Validation {
                field: "input_frame".to_string(),
                reason: "empty frame buffer".to_string(),
            });
        }

        // フレーム番号はセッション内で厳密に増加する
        if is_video {
            if let Some(last) = state.last_frame_number {
                if context.frame_number <= last {
                    return Err(FaceReageError::Validation {
                        field: "frame_number".to_string(),
                        reason: format!(
                            "must increase within a session (last {last}, got {})",
                            context.frame_number
                        ),
                    });
                }
            }
        }

        let requested = match context.mode {
            ProcessingMode::Auto => self.processing_mode(),
            explicit => explicit,
        };
        let resolved = self.strategies.resolve(
            requested,
            width,
            height,
            is_video && context.frame_number > 0,
            max_resolution,
            &self.options,
        );
        metrics.record(keys::RESOLVED_MODE, f64::from(resolved.ordinal()));

        let input = frame_to_tensor(&context.input_frame);

        let inference_start = Instant::now();
        let output = self
            .strategies
            .strategy_for(resolved)
            .run(&input, &context.controls, &self.model, &self.options)?;
        metrics.record(
            keys::INFERENCE_MS,
            inference_start.elapsed().as_secs_f64() * 1000.0,
        );
        metrics.record(keys::DEGRADED, if output.degraded { 1.0 } else { 0.0 });
        metrics.record(keys::DIFFUSION_STEPS_RUN, f64::from(output.steps_run));

        let stabilize_start = Instant::now();
        let embedding = self.encoder.embed(output.tensor.view())?;
        let outcome = stabilize(output.tensor, &embedding, &context.controls, &self.options, state);
        state.last_frame_number = Some(context.frame_number);
        metrics.record(
            keys::STABILIZE_MS,
            stabilize_start.elapsed().as_secs_f64() * 1000.0,
        );
        metrics.record(keys::IDENTITY_DISTANCE, f64::from(outcome.identity_distance));
        metrics.record(keys::STABILIZER_RESETS, state.reset_count() as f64);

        tensor_to_frame(&outcome.tensor)
    }
}
