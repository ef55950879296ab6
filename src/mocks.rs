use ndarray::prelude::*;

use crate::errors::Result;
use crate::stabilizer::l2_normalized;
use crate::traits::{AgingModel, IdentityEncoder};

/// テスト用の決定的な年齢変換モデル
///
/// 出力は入力と同一次元で、age に比例して明度と色味だけが変わる。
/// 同じ入力と同じ age に対して常にビット同一の結果を返す。
#[derive(Debug, Clone)]
pub struct MockAgingModel;

const WARM_TINT: [f32; 3] = [0.32, 0.24, 0.18];

impl AgingModel for MockAgingModel {
    fn generate(&self, input: ArrayView4<f32>, age: f32) -> Result<Array4<f32>> {
        let mut output = input.to_owned();
        for channel in 0..output.shape()[1].min(3) {
            let tint = WARM_TINT[channel];
            let mut plane = output.slice_mut(s![0, channel, .., ..]);
            plane.mapv_inplace(|v| v * (1.0 - 0.3 * age) + tint * age);
        }
        Ok(output)
    }

    fn denoise_step(
        &self,
        latent: ArrayView4<f32>,
        _step: u32,
        total_steps: u32,
        age: f32,
        _guidance_scale: f32,
    ) -> Result<Array4<f32>> {
        // 全ステップ完了時に generate と同程度の変化量になるよう 1 ステップ分だけ進める
        let fraction = age / total_steps.max(1) as f32;
        let mut output = latent.to_owned();
        for channel in 0..output.shape()[1].min(3) {
            let tint = WARM_TINT[channel];
            let mut plane = output.slice_mut(s![0, channel, .., ..]);
            plane.mapv_inplace(|v| v * (1.0 - 0.3 * fraction) + tint * fraction);
        }
        Ok(output)
    }
}

/// テスト用の埋め込みエンコーダ
///
/// 輝度の粗いグリッド平均を埋め込みとするため、同一フレームは同一の
/// ベクトルに、構図の大きく違うフレームは離れたベクトルになる。
#[derive(Debug, Clone)]
pub struct MockIdentityEncoder {
    grid: usize,
}

impl MockIdentityEncoder {
    pub const fn new(grid: usize) -> Self {
        Self { grid }
    }
}

impl IdentityEncoder for MockIdentityEncoder {
    fn embed(&self, input: ArrayView4<f32>) -> Result<Array1<f32>> {
        let (height, width) = (input.shape()[2], input.shape()[3]);
        let grid = self.grid.max(1);

        let mut values = Vec::with_capacity(grid * grid);
        for gy in 0..grid {
            for gx in 0..grid {
                let y0 = gy * height / grid;
                let y1 = ((gy + 1) * height / grid).max(y0 + 1).min(height);
                let x0 = gx * width / grid;
                let x1 = ((gx + 1) * width / grid).max(x0 + 1).min(width);
                let window = input.slice(s![0, .., y0..y1, x0..x1]);
                values.push(window.mean().unwrap_or(0.0));
            }
        }
        Ok(l2_normalized(Array1::from(values)))
    }

    fn embedding_dim(&self) -> usize {
        self.grid * self.grid
    }
}

/// テスト用のファクトリー関数
pub const fn create_mock_model() -> MockAgingModel {
    MockAgingModel
}

pub const fn create_mock_encoder() -> MockIdentityEncoder {
    MockIdentityEncoder::new(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_model_is_deterministic() -> Result<()> {
        let model = create_mock_model();
        let input = Array4::<f32>::from_elem((1, 3, 8, 8), 0.5);

        let first = model.generate(input.view(), 0.8)?;
        let second = model.generate(input.view(), 0.8)?;
        assert_eq!(first, second);
        assert_eq!(first.shape(), input.shape());
        Ok(())
    }

    #[test]
    fn test_mock_model_age_changes_output() -> Result<()> {
        let model = create_mock_model();
        let input = Array4::<f32>::from_elem((1, 3, 8, 8), 0.5);

        let young = model.generate(input.view(), 0.0)?;
        let old = model.generate(input.view(), 0.8)?;
        assert_eq!(young, input);
        assert_ne!(young, old);
        Ok(())
    }

    #[test]
    fn test_mock_encoder_separates_layouts() -> Result<()> {
        let encoder = create_mock_encoder();

        let mut left = Array4::<f32>::zeros((1, 3, 16, 16));
        left.slice_mut(s![0, .., .., 0..8]).fill(1.0);
        let mut right = Array4::<f32>::zeros((1, 3, 16, 16));
        right.slice_mut(s![0, .., .., 8..16]).fill(1.0);

        let left_embedding = encoder.embed(left.view())?;
        let right_embedding = encoder.embed(right.view())?;
        assert_eq!(left_embedding.len(), encoder.embedding_dim());

        // 直交する構図は余弦類似度がほぼ 0
        let similarity: f32 = left_embedding.dot(&right_embedding);
        assert!(similarity.abs() < 1e-6);
        Ok(())
    }
}
