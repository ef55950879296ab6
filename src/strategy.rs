use std::time::Instant;

use ndarray::prelude::*;
use rayon::prelude::*;
use tracing::debug;

use crate::config::EngineOptions;
use crate::controls::{AgeControls, ProcessingMode};
use crate::errors::{FaceReageError, InferenceCause, Result};
use crate::traits::AgingModel;

/// ストラテジー実行の結果
pub struct StrategyOutput {
    pub tensor: Array4<f32>,
    /// 実行予算の超過などで品質が落ちているか
    pub degraded: bool,
    pub steps_run: u32,
}

/// フレーム変換ストラテジーの共通能力
///
/// 各ストラテジーは (テンソル, 制御) → テンソル の純関数として振る舞い、
/// クロスフレーム状態は持たない。
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        input: &Array4<f32>,
        controls: &AgeControls,
        model: &dyn AgingModel,
        options: &EngineOptions,
    ) -> Result<StrategyOutput>;
}

/// 単一の決定的フォワードパス。リアルタイム/動画向け
pub struct FeedforwardStrategy;

impl Strategy for FeedforwardStrategy {
    fn name(&self) -> &'static str {
        "feedforward"
    }

    fn run(
        &self,
        input: &Array4<f32>,
        controls: &AgeControls,
        model: &dyn AgingModel,
        _options: &EngineOptions,
    ) -> Result<StrategyOutput> {
        let generated = model.generate(input.view(), controls.normalized_age())?;
        ensure_same_shape(input, &generated)?;

        let locked = apply_identity_lock(input, &generated, controls.identity_lock_strength);
        let tensor = apply_detail_controls(input, locked, controls);
        Ok(StrategyOutput {
            tensor,
            degraded: false,
            steps_run: 0,
        })
    }
}

/// 反復的デノイズ。実行予算内で打ち切り可能
pub struct DiffusionStrategy;

impl Strategy for DiffusionStrategy {
    fn name(&self) -> &'static str {
        "diffusion"
    }

    fn run(
        &self,
        input: &Array4<f32>,
        controls: &AgeControls,
        model: &dyn AgingModel,
        options: &EngineOptions,
    ) -> Result<StrategyOutput> {
        let deadline = Instant::now() + options.diffusion_budget;
        let total_steps = options.diffusion_steps.max(1);
        let age = controls.normalized_age();

        let mut latent = input.clone();
        let mut steps_run = 0;
        let mut degraded = false;

        for step in 0..total_steps {
            if Instant::now() >= deadline {
                // 予算超過: エラーにせず途中結果を返し、品質低下を記録する
                degraded = true;
                debug!(steps_run, total_steps, "diffusion budget exhausted");
                break;
            }

            let next = model.denoise_step(latent.view(), step, total_steps, age, options.guidance_scale)?;
            ensure_same_shape(input, &next)?;
            if !next.iter().all(|v| v.is_finite()) {
                return Err(FaceReageError::Inference {
                    operation: format!("diffusion step {step}"),
                    cause: InferenceCause::NumericDivergence,
                    source: None,
                });
            }

            latent = next;
            steps_run += 1;
        }

        let locked = apply_identity_lock(input, &latent, controls.identity_lock_strength);
        let tensor = apply_detail_controls(input, locked, controls);
        Ok(StrategyOutput {
            tensor,
            degraded,
            steps_run,
        })
    }
}

/// フィードフォワードの粗い推定を、同一性に敏感なタイルだけ拡散で精緻化する
///
/// 拡散コストをタイル数 × 少数ステップに抑えつつ、純フィードフォワードより
/// 忠実度を上げる。
pub struct HybridStrategy;

impl Strategy for HybridStrategy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn run(
        &self,
        input: &Array4<f32>,
        controls: &AgeControls,
        model: &dyn AgingModel,
        options: &EngineOptions,
    ) -> Result<StrategyOutput> {
        let age = controls.normalized_age();
        let coarse = model.generate(input.view(), age)?;
        ensure_same_shape(input, &coarse)?;

        let (height, width) = (input.shape()[2], input.shape()[3]);
        let mask = identity_region_mask(height, width);
        let tiles = refinement_tiles(&mask, 64);
        let refine_steps = if tiles.is_empty() {
            0
        } else {
            (options.diffusion_steps / 4).max(1)
        };

        let refined: Vec<Result<(Tile, Array4<f32>)>> = tiles
            .into_par_iter()
            .map(|tile| {
                let mut latent = coarse
                    .slice(s![.., .., tile.y0..tile.y1, tile.x0..tile.x1])
                    .to_owned();
                for step in 0..refine_steps {
                    latent = model.denoise_step(
                        latent.view(),
                        step,
                        refine_steps,
                        age,
                        options.guidance_scale,
                    )?;
                }
                Ok((tile, latent))
            })
            .collect();

        let lock = controls.identity_lock_strength;
        let mut output = coarse;
        for item in refined {
            let (tile, patch) = item?;
            let original = input
                .slice(s![.., .., tile.y0..tile.y1, tile.x0..tile.x1])
                .to_owned();
            if patch.shape() != original.shape() {
                return Err(FaceReageError::Inference {
                    operation: "hybrid tile refinement".to_string(),
                    cause: InferenceCause::MalformedFrame,
                    source: None,
                });
            }
            let blended = &original * lock + &patch * (1.0 - lock);
            output
                .slice_mut(s![.., .., tile.y0..tile.y1, tile.x0..tile.x1])
                .assign(&blended);
        }

        let tensor = apply_detail_controls(input, output, controls);
        Ok(StrategyOutput {
            tensor,
            degraded: false,
            steps_run: refine_steps,
        })
    }
}

/// モードを解決して対応するストラテジーに委譲する
pub struct StrategyEngine {
    feedforward: FeedforwardStrategy,
    diffusion: DiffusionStrategy,
    hybrid: HybridStrategy,
}

impl StrategyEngine {
    pub const fn new() -> Self {
        Self {
            feedforward: FeedforwardStrategy,
            diffusion: DiffusionStrategy,
            hybrid: HybridStrategy,
        }
    }

    /// AUTO の解決
    ///
    /// 解像度が上限を超えるか、動画ストリームのフレームレートが閾値以上なら
    /// フィードフォワード、それ以外はハイブリッド。
    pub fn resolve(
        &self,
        mode: ProcessingMode,
        width: u32,
        height: u32,
        is_video: bool,
        max_resolution: u32,
        options: &EngineOptions,
    ) -> ProcessingMode {
        match mode {
            ProcessingMode::Auto => {
                if width.max(height) > max_resolution
                    || (is_video && options.target_fps >= options.auto_fps_threshold)
                {
                    ProcessingMode::Feedforward
                } else {
                    ProcessingMode::Hybrid
                }
            }
            explicit => explicit,
        }
    }

    pub fn strategy_for(&self, mode: ProcessingMode) -> &dyn Strategy {
        match mode {
            ProcessingMode::Feedforward => &self.feedforward,
            ProcessingMode::Diffusion => &self.diffusion,
            ProcessingMode::Hybrid | ProcessingMode::Auto => &self.hybrid,
        }
    }
}

impl Default for StrategyEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_same_shape(input: &Array4<f32>, output: &Array4<f32>) -> Result<()> {
    if input.shape() != output.shape() {
        return Err(FaceReageError::Inference {
            operation: format!(
                "shape check (input {:?}, output {:?})",
                input.shape(),
                output.shape()
            ),
            cause: InferenceCause::MalformedFrame,
            source: None,
        });
    }
    Ok(())
}

/// 同一性維持ブレンド: 中心マスク内で out = lock*original + (1-lock)*generated
fn apply_identity_lock(
    original: &Array4<f32>,
    generated: &Array4<f32>,
    lock: f32,
) -> Array4<f32> {
    if lock <= 0.0 {
        return generated.clone();
    }

    let (height, width) = (original.shape()[2], original.shape()[3]);
    let mask = identity_region_mask(height, width);

    let mut output = generated.clone();
    for channel in 0..output.shape()[1] {
        let orig = original.slice(s![0, channel, .., ..]);
        let gen = generated.slice(s![0, channel, .., ..]);
        let delta = (&orig - &gen) * &mask * lock;
        output
            .slice_mut(s![0, channel, .., ..])
            .assign(&(&gen + &delta));
    }
    output
}

/// 顔中心の楕円ソフトマスク
///
/// フレームは切り出し済みの顔を前提とする（顔検出は外側のレイヤの責務）。
pub(crate) fn identity_region_mask(height: usize, width: usize) -> Array2<f32> {
    let center_y = (height as f32 - 1.0) / 2.0;
    let center_x = (width as f32 - 1.0) / 2.0;
    let radius_y = height as f32 * 0.38;
    let radius_x = width as f32 * 0.32;

    Array2::from_shape_fn((height, width), |(y, x)| {
        let dy = (y as f32 - center_y) / radius_y;
        let dx = (x as f32 - center_x) / radius_x;
        let distance = (dy * dy + dx * dx).sqrt();
        // 縁で滑らかに 0 へ落とす
        (1.0 - (distance - 0.8).max(0.0) / 0.4).clamp(0.0, 1.0)
    })
}

#[derive(Debug, Clone, Copy)]
struct Tile {
    y0: usize,
    y1: usize,
    x0: usize,
    x1: usize,
}

/// マスクの重みが高いタイルだけを精緻化の対象にする
fn refinement_tiles(mask: &Array2<f32>, tile_size: usize) -> Vec<Tile> {
    let (height, width) = mask.dim();
    let mut tiles = Vec::new();

    let mut y = 0;
    while y < height {
        let y1 = (y + tile_size).min(height);
        let mut x = 0;
        while x < width {
            let x1 = (x + tile_size).min(width);
            let window = mask.slice(s![y..y1, x..x1]);
            if window.mean().unwrap_or(0.0) > 0.3 {
                tiles.push(Tile { y0: y, y1, x0: x, x1 });
            }
            x = x1;
        }
        y = y1;
    }
    tiles
}

/// texture_keep / skin_clean / 白髪化の後段調整
fn apply_detail_controls(
    original: &Array4<f32>,
    mut aged: Array4<f32>,
    controls: &AgeControls,
) -> Array4<f32> {
    if controls.texture_keep > 0.0 {
        // 元フレームの高周波成分を戻す
        let blurred = box_blur(original);
        let detail = original - &blurred;
        aged = aged + detail * controls.texture_keep;
    }

    if controls.skin_clean > 0.0 {
        let smoothed = box_blur(&aged);
        aged = &aged * (1.0 - controls.skin_clean) + &smoothed * controls.skin_clean;
    }

    if controls.enable_hair_aging && controls.gray_density > 0.0 {
        apply_gray_density(&mut aged, controls.gray_density);
    }

    aged.mapv_inplace(|v| v.clamp(0.0, 1.0));
    aged
}

/// 3x3 ボックスブラー
fn box_blur(tensor: &Array4<f32>) -> Array4<f32> {
    let (channels, height, width) = (tensor.shape()[1], tensor.shape()[2], tensor.shape()[3]);
    let mut output = tensor.clone();

    for c in 0..channels {
        let source = tensor.slice(s![0, c, .., ..]);
        let mut target = output.slice_mut(s![0, c, .., ..]);
        for y in 0..height {
            for x in 0..width {
                let mut sum = 0.0;
                let mut count = 0.0;
                for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                        sum += source[[ny, nx]];
                        count += 1.0;
                    }
                }
                target[[y, x]] = sum / count;
            }
        }
    }
    output
}

/// 上部の髪領域を gray_density に応じて無彩色寄りにする
fn apply_gray_density(tensor: &mut Array4<f32>, density: f32) {
    let (height, width) = (tensor.shape()[2], tensor.shape()[3]);
    let hair_rows = (height as f32 * 0.25) as usize;

    for y in 0..hair_rows {
        for x in 0..width {
            let r = tensor[[0, 0, y, x]];
            let g = tensor[[0, 1, y, x]];
            let b = tensor[[0, 2, y, x]];
            let luma = 0.299 * r + 0.587 * g + 0.114 * b;
            // 白髪はやや明るいグレーに寄せる
            let gray = luma * (1.0 - density) + 0.75 * density;
            for c in 0..3 {
                let value = tensor[[0, c, y, x]];
                tensor[[0, c, y, x]] = value * (1.0 - density) + gray * density;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{create_mock_model, MockAgingModel};

    fn uniform_frame(value: f32) -> Array4<f32> {
        Array4::<f32>::from_elem((1, 3, 32, 32), value)
    }

    #[test]
    fn test_identity_region_mask_shape_and_range() {
        let mask = identity_region_mask(64, 48);
        assert_eq!(mask.dim(), (64, 48));
        assert!(mask.iter().all(|v| (0.0..=1.0).contains(v)));
        // 中心は完全に同一性領域、四隅は領域外
        assert_eq!(mask[[32, 24]], 1.0);
        assert_eq!(mask[[0, 0]], 0.0);
    }

    #[test]
    fn test_refinement_tiles_cover_center() {
        let mask = identity_region_mask(128, 128);
        let tiles = refinement_tiles(&mask, 64);
        assert!(!tiles.is_empty());
        // 中心を含むタイルが必ず選ばれる
        assert!(tiles
            .iter()
            .any(|t| t.y0 <= 64 && 64 <= t.y1 && t.x0 <= 64 && 64 <= t.x1));
    }

    #[test]
    fn test_feedforward_preserves_shape() {
        let strategy = FeedforwardStrategy;
        let input = uniform_frame(0.4);
        let controls = AgeControls::new(70.0);
        let output = strategy
            .run(&input, &controls, &create_mock_model(), &EngineOptions::default())
            .unwrap();
        assert_eq!(output.tensor.shape(), input.shape());
        assert!(!output.degraded);
    }

    #[test]
    fn test_feedforward_is_deterministic() {
        let strategy = FeedforwardStrategy;
        let input = uniform_frame(0.4);
        let controls = AgeControls::new(55.0);
        let options = EngineOptions::default();

        let first = strategy
            .run(&input, &controls, &MockAgingModel, &options)
            .unwrap();
        let second = strategy
            .run(&input, &controls, &MockAgingModel, &options)
            .unwrap();
        assert_eq!(first.tensor, second.tensor);
    }

    #[test]
    fn test_diffusion_with_zero_budget_degrades() {
        let strategy = DiffusionStrategy;
        let input = uniform_frame(0.4);
        let controls = AgeControls::new(70.0);
        let options = EngineOptions {
            diffusion_budget: std::time::Duration::ZERO,
            ..EngineOptions::default()
        };

        let output = strategy
            .run(&input, &controls, &MockAgingModel, &options)
            .unwrap();
        assert!(output.degraded);
        assert_eq!(output.steps_run, 0);
        assert_eq!(output.tensor.shape(), input.shape());
    }

    #[test]
    fn test_auto_resolution_rules() {
        let engine = StrategyEngine::new();
        let options = EngineOptions::default();

        // 静止画 (動画でない) はハイブリッド
        let mode = engine.resolve(ProcessingMode::Auto, 512, 512, false, 1024, &options);
        assert_eq!(mode, ProcessingMode::Hybrid);

        // 上限超過の解像度はフィードフォワード
        let mode = engine.resolve(ProcessingMode::Auto, 2048, 1024, false, 1024, &options);
        assert_eq!(mode, ProcessingMode::Feedforward);

        // 閾値以上のフレームレートの動画はフィードフォワード
        let mode = engine.resolve(ProcessingMode::Auto, 512, 512, true, 1024, &options);
        assert_eq!(mode, ProcessingMode::Feedforward);

        // 明示モードはそのまま
        let mode = engine.resolve(ProcessingMode::Diffusion, 512, 512, true, 1024, &options);
        assert_eq!(mode, ProcessingMode::Diffusion);
    }

    #[test]
    fn test_identity_lock_full_keeps_center_pixels() {
        let original = uniform_frame(0.2);
        let generated = uniform_frame(0.8);
        let locked = apply_identity_lock(&original, &generated, 1.0);

        // マスク中心は元の値、マスク外は生成値
        assert!((locked[[0, 0, 16, 16]] - 0.2).abs() < 1e-6);
        assert!((locked[[0, 0, 0, 0]] - 0.8).abs() < 1e-6);
    }
}
