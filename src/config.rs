use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{FaceReageError, Result};
use crate::registry::Backend;

/// Engine-level model configuration, validated once at `initialize` and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    pub backend: Backend,
    pub device_id: i32,
    pub batch_size: u32,
    pub use_half_precision: bool,
    pub max_resolution: u32,
}

impl ModelConfig {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            backend: Backend::Cuda,
            device_id: 0,
            batch_size: 1,
            use_half_precision: false,
            max_resolution: 1024,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub const fn with_device_id(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub const fn with_half_precision(mut self, enable: bool) -> Self {
        self.use_half_precision = enable;
        self
    }

    pub const fn with_max_resolution(mut self, max_resolution: u32) -> Self {
        self.max_resolution = max_resolution;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FaceReageError::Validation {
                field: "batch_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_resolution == 0 {
            return Err(FaceReageError::Validation {
                field: "max_resolution".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.device_id < 0 {
            return Err(FaceReageError::Validation {
                field: "device_id".to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

/// パイプラインの調整パラメータ
///
/// AUTO モードの閾値や拡散スケジュールはハードコードせず、
/// ここで設定として持つ。
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// ストリームの目標フレームレート（呼び出し側のヒント）
    pub target_fps: f32,
    /// これ以上のフレームレートでは AUTO がフィードフォワードを選ぶ
    pub auto_fps_threshold: f32,
    /// 拡散のデノイズステップ数
    pub diffusion_steps: u32,
    /// 目標年齢へ向けたガイダンスの強さ
    pub guidance_scale: f32,
    /// 拡散ループ全体の実行予算。超過時は途中結果を返す
    pub diffusion_budget: Duration,
    /// この余弦距離を超えた埋め込み変化は被写体の不連続とみなす
    pub identity_reset_threshold: f32,
    /// 同一性埋め込みの指数移動平均係数 (0, 1]
    pub identity_ema_alpha: f32,
    /// この時間アイドルなセッションは破棄対象になる
    pub session_idle_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            target_fps: 30.0,
            auto_fps_threshold: 24.0,
            diffusion_steps: 20,
            guidance_scale: 3.5,
            diffusion_budget: Duration::from_millis(250),
            identity_reset_threshold: 0.35,
            identity_ema_alpha: 0.9,
            session_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<()> {
        if self.diffusion_steps == 0 {
            return Err(FaceReageError::Validation {
                field: "diffusion_steps".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.identity_ema_alpha) || self.identity_ema_alpha == 0.0 {
            return Err(FaceReageError::Validation {
                field: "identity_ema_alpha".to_string(),
                reason: "must be in (0, 1]".to_string(),
            });
        }
        if self.identity_reset_threshold <= 0.0 {
            return Err(FaceReageError::Validation {
                field: "identity_reset_threshold".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// 1ステップあたりの実行予算
    pub fn diffusion_step_budget(&self) -> Duration {
        self.diffusion_budget / self.diffusion_steps.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_validation() {
        let config = ModelConfig::new("models");
        assert!(config.validate().is_ok());

        let config = ModelConfig::new("models").with_batch_size(0);
        assert!(config.validate().is_err());

        let config = ModelConfig::new("models").with_max_resolution(0);
        assert!(config.validate().is_err());

        let config = ModelConfig::new("models").with_device_id(-1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_options_validation() {
        assert!(EngineOptions::default().validate().is_ok());

        let options = EngineOptions {
            diffusion_steps: 0,
            ..EngineOptions::default()
        };
        assert!(options.validate().is_err());

        let options = EngineOptions {
            identity_ema_alpha: 0.0,
            ..EngineOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_diffusion_step_budget() {
        let options = EngineOptions {
            diffusion_steps: 10,
            diffusion_budget: Duration::from_millis(100),
            ..EngineOptions::default()
        };
        assert_eq!(options.diffusion_step_budget(), Duration::from_millis(10));
    }
}
