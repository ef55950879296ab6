use std::time::Instant;

use ndarray::prelude::*;
use tracing::debug;

use crate::config::EngineOptions;
use crate::controls::AgeControls;

/// セッション内で共有されるクロスフレーム状態
///
/// 同一性埋め込みの指数移動平均と、ピクセル単位の時間的アキュムレータを
/// 持つ。セッションの最初のフレームでシードされ、フレーム毎に更新される。
#[derive(Debug)]
pub struct StabilizerState {
    identity_ema: Option<Array1<f32>>,
    accumulator: Option<Array4<f32>>,
    pub(crate) last_frame_number: Option<u64>,
    reset_count: u64,
    frames_seen: u64,
    pub(crate) last_active: Instant,
}

impl StabilizerState {
    pub fn new() -> Self {
        Self {
            identity_ema: None,
            accumulator: None,
            last_frame_number: None,
            reset_count: 0,
            frames_seen: 0,
            last_active: Instant::now(),
        }
    }

    pub const fn reset_count(&self) -> u64 {
        self.reset_count
    }

    pub const fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub const fn is_seeded(&self) -> bool {
        self.identity_ema.is_some()
    }

    /// 蓄積状態を破棄する。次のフレームで再シードされる
    fn reset(&mut self) {
        self.identity_ema = None;
        self.accumulator = None;
        self.reset_count += 1;
    }

    fn seed(&mut self, embedding: &Array1<f32>, output: &Array4<f32>) {
        self.identity_ema = Some(embedding.clone());
        self.accumulator = Some(output.clone());
    }
}

impl Default for StabilizerState {
    fn default() -> Self {
        Self::new()
    }
}

/// 安定化の結果
pub struct StabilizeOutcome {
    pub tensor: Array4<f32>,
    pub reset: bool,
    pub identity_distance: f32,
}

/// 現フレームの生推論出力を履歴とブレンドし、セッション状態を更新する
///
/// temporal_stability が重みになる: 0 = 平滑化なし、1 = 履歴支配。
/// 埋め込みの余弦距離が閾値を超えた場合はシーンカット/別被写体とみなし、
/// 無関係な被写体間でブレンドせず状態をリセットして通過させる。
pub fn stabilize(
    current: Array4<f32>,
    embedding: &Array1<f32>,
    controls: &AgeControls,
    options: &EngineOptions,
    state: &mut StabilizerState,
) -> StabilizeOutcome {
    state.last_active = Instant::now();
    state.frames_seen += 1;

    if !state.is_seeded() {
        // 履歴の無い最初のフレーム: 平滑化は no-op で、状態をシードする
        state.seed(embedding, &current);
        return StabilizeOutcome {
            tensor: current,
            reset: false,
            identity_distance: 0.0,
        };
    }

    let distance = match state.identity_ema.as_ref() {
        Some(history) => cosine_distance(embedding, history),
        None => 1.0,
    };

    if distance > options.identity_reset_threshold {
        debug!(
            distance,
            threshold = options.identity_reset_threshold,
            "identity discontinuity, resetting stabilizer state"
        );
        state.reset();
        state.seed(embedding, &current);
        return StabilizeOutcome {
            tensor: current,
            reset: true,
            identity_distance: distance,
        };
    }

    let stability = controls.temporal_stability;
    let blended = match state.accumulator.as_ref() {
        Some(history) if history.shape() == current.shape() => {
            history * stability + &current * (1.0 - stability)
        }
        _ => {
            // 欠損・不整合な蓄積状態は自動リセットとして扱い、失敗にはしない
            state.reset();
            state.seed(embedding, &current);
            return StabilizeOutcome {
                tensor: current,
                reset: true,
                identity_distance: distance,
            };
        }
    };

    let alpha = options.identity_ema_alpha;
    let updated_ema = match state.identity_ema.as_ref() {
        Some(history) => l2_normalized(history * alpha + embedding * (1.0 - alpha)),
        None => embedding.clone(),
    };
    state.identity_ema = Some(updated_ema);
    state.accumulator = Some(blended.clone());

    StabilizeOutcome {
        tensor: blended,
        reset: false,
        identity_distance: distance,
    }
}

/// 余弦距離。両ベクトルとも L2 正規化済みを前提とする
pub(crate) fn cosine_distance(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    if a.len() != b.len() {
        // 次元の合わない埋め込みは不連続として扱う
        return 1.0;
    }
    1.0 - a.dot(b)
}

pub(crate) fn l2_normalized(mut vector: Array1<f32>) -> Array1<f32> {
    let norm = vector.dot(&vector).sqrt();
    if norm > 0.0 {
        vector.mapv_inplace(|v| v / norm);
    }
    vector
}
