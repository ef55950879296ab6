use crate::errors::Result;
use ndarray::prelude::*;

/// 年齢変換モデルの抽象化
///
/// 依存関係逆転原則（DIP）に従い、具象実装ではなく抽象に依存する
pub trait AgingModel: Send + Sync {
    /// 単一の条件付きフォワードパスを実行する
    ///
    /// age は [0, 1] に正規化済み。出力テンソルは入力と同一次元
    fn generate(&self, input: ArrayView4<f32>, age: f32) -> Result<Array4<f32>>;

    /// 拡散の 1 ステップ分のデノイズを実行する
    fn denoise_step(
        &self,
        latent: ArrayView4<f32>,
        step: u32,
        total_steps: u32,
        age: f32,
        guidance_scale: f32,
    ) -> Result<Array4<f32>>;
}

/// 顔アイデンティティ埋め込みの抽象化
pub trait IdentityEncoder: Send + Sync {
    /// L2 正規化済みの埋め込みベクトルを返す
    fn embed(&self, input: ArrayView4<f32>) -> Result<Array1<f32>>;

    /// 埋め込みの次元数
    fn embedding_dim(&self) -> usize;
}
