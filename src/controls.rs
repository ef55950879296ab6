/// 年齢変換の制御パラメータ
///
/// フレーム毎にコピーされる値オブジェクト。宣言範囲外の入力は
/// コンストラクタとビルダーで常にクランプされる（拒否はしない）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgeControls {
    /// 目標年齢 [0, 100]
    pub target_age: f32,
    /// 同一性維持の強さ [0, 1]。1 に近いほど元の顔を残す
    pub identity_lock_strength: f32,
    /// 時間的平滑化の強さ [0, 1]。0 = 平滑化なし、1 = 履歴支配
    pub temporal_stability: f32,
    /// 元フレームの高周波テクスチャの保持量 [0, 1]
    pub texture_keep: f32,
    /// 肌の平滑化量 [0, 1]
    pub skin_clean: f32,
    pub enable_hair_aging: bool,
    /// 白髪化の密度 [0, 1]
    pub gray_density: f32,
}

impl AgeControls {
    pub fn new(target_age: f32) -> Self {
        Self {
            target_age: target_age.clamp(0.0, 100.0),
            identity_lock_strength: 0.5,
            temporal_stability: 0.5,
            texture_keep: 0.5,
            skin_clean: 0.0,
            enable_hair_aging: true,
            gray_density: 0.0,
        }
    }

    pub fn with_identity_lock(mut self, strength: f32) -> Self {
        self.identity_lock_strength = strength.clamp(0.0, 1.0);
        self
    }

    pub fn with_temporal_stability(mut self, stability: f32) -> Self {
        self.temporal_stability = stability.clamp(0.0, 1.0);
        self
    }

    pub fn with_texture_keep(mut self, keep: f32) -> Self {
        self.texture_keep = keep.clamp(0.0, 1.0);
        self
    }

    pub fn with_skin_clean(mut self, clean: f32) -> Self {
        self.skin_clean = clean.clamp(0.0, 1.0);
        self
    }

    pub fn with_hair_aging(mut self, enable: bool, gray_density: f32) -> Self {
        self.enable_hair_aging = enable;
        self.gray_density = gray_density.clamp(0.0, 1.0);
        self
    }

    /// モデルの条件付け範囲 [0, 1] への線形写像
    pub fn normalized_age(&self) -> f32 {
        self.target_age / 100.0
    }
}

impl Default for AgeControls {
    fn default() -> Self {
        Self::new(30.0)
    }
}

/// フレーム変換の処理モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// 単一フォワードパス。最低レイテンシ、リアルタイム/動画向け
    Feedforward,
    /// 反復的デノイズ。最高品質、最高レイテンシ
    Diffusion,
    /// フィードフォワードの粗い推定を拡散で部分精緻化
    Hybrid,
    /// フレーム毎にストラテジーエンジンが具体モードを選択
    Auto,
}

impl ProcessingMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Feedforward => "feedforward",
            Self::Diffusion => "diffusion",
            Self::Hybrid => "hybrid",
            Self::Auto => "auto",
        }
    }

    pub(crate) const fn ordinal(self) -> u8 {
        match self {
            Self::Feedforward => 0,
            Self::Diffusion => 1,
            Self::Hybrid => 2,
            Self::Auto => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_inputs_are_clamped() {
        let controls = AgeControls::new(250.0)
            .with_identity_lock(-1.0)
            .with_temporal_stability(1.5)
            .with_hair_aging(true, 2.0);

        assert_eq!(controls.target_age, 100.0);
        assert_eq!(controls.identity_lock_strength, 0.0);
        assert_eq!(controls.temporal_stability, 1.0);
        assert_eq!(controls.gray_density, 1.0);
    }

    #[test]
    fn test_normalized_age_mapping() {
        assert_eq!(AgeControls::new(0.0).normalized_age(), 0.0);
        assert_eq!(AgeControls::new(50.0).normalized_age(), 0.5);
        assert_eq!(AgeControls::new(100.0).normalized_age(), 1.0);
    }

    #[test]
    fn test_mode_labels() {
        assert_eq!(ProcessingMode::Auto.as_str(), "auto");
        assert_eq!(ProcessingMode::Feedforward.ordinal(), 0);
    }
}
