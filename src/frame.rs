use image::RgbImage;
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::controls::{AgeControls, ProcessingMode};
use crate::errors::{FaceReageError, InferenceCause, Result};
use crate::metrics::Metrics;

/// 1フレーム分の処理単位
///
/// デコード済み RGB バッファと制御パラメータを運ぶ。エンジンは呼び出しを
/// 超えてこの値を保持しない。
#[derive(Debug, Clone)]
pub struct FrameContext {
    /// セッション内で厳密に増加するフレーム番号。単発画像は 0
    pub frame_number: u64,
    pub input_frame: RgbImage,
    pub controls: AgeControls,
    pub mode: ProcessingMode,
}

impl FrameContext {
    pub fn new(frame_number: u64, input_frame: RgbImage, controls: AgeControls) -> Self {
        Self {
            frame_number,
            input_frame,
            controls,
            mode: ProcessingMode::Auto,
        }
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.input_frame.dimensions()
    }
}

/// フレーム処理の結果
///
/// success == true のときだけ output_frame を持ち、その次元は入力と一致する。
/// 失敗時は error_message に原因が入る。
#[derive(Debug)]
pub struct ProcessingResult {
    pub success: bool,
    pub output_frame: Option<RgbImage>,
    pub error_message: Option<String>,
    pub metrics: Metrics,
}

impl ProcessingResult {
    pub fn ok(output_frame: RgbImage, metrics: Metrics) -> Self {
        Self {
            success: true,
            output_frame: Some(output_frame),
            error_message: None,
            metrics,
        }
    }

    pub fn failed(error: &FaceReageError, metrics: Metrics) -> Self {
        Self {
            success: false,
            output_frame: None,
            error_message: Some(error.to_string()),
            metrics,
        }
    }
}

/// RGB 画像を NCHW f32 テンソル（[0, 1] 正規化）へ変換する
pub fn frame_to_tensor(frame: &RgbImage) -> Array4<f32> {
    let tensor = frame.as_ndarray3();
    tensor.mapv(|v| f32::from(v) / 255.0).insert_axis(Axis(0))
}

/// NCHW f32 テンソルを RGB 画像へ戻す
pub fn tensor_to_frame(tensor: &Array4<f32>) -> Result<RgbImage> {
    let shape = tensor.shape();
    if shape[0] != 1 || shape[1] != 3 {
        return Err(FaceReageError::Inference {
            operation: format!("tensor to frame conversion (shape {shape:?})"),
            cause: InferenceCause::MalformedFrame,
            source: None,
        });
    }

    let (height, width) = (shape[2], shape[3]);
    let mut frame = RgbImage::new(width as u32, height as u32);
    for (x, y, pixel) in frame.enumerate_pixels_mut() {
        for c in 0..3 {
            let value = tensor[[0, c, y as usize, x as usize]];
            pixel[c] = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_frame_tensor_roundtrip() -> Result<()> {
        let mut frame = RgbImage::new(8, 6);
        for (x, y, pixel) in frame.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 30) as u8, (y * 40) as u8, 128]);
        }

        let tensor = frame_to_tensor(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 6, 8]);

        let restored = tensor_to_frame(&tensor)?;
        assert_eq!(restored.dimensions(), frame.dimensions());
        assert_eq!(restored, frame);
        Ok(())
    }

    #[test]
    fn test_tensor_to_frame_rejects_bad_channel_count() {
        let tensor = Array4::<f32>::zeros((1, 1, 4, 4));
        assert!(tensor_to_frame(&tensor).is_err());
    }

    #[test]
    fn test_context_defaults_to_auto_mode() {
        let context = FrameContext::new(0, RgbImage::new(4, 4), AgeControls::default());
        assert_eq!(context.mode, ProcessingMode::Auto);
        assert_eq!(context.dimensions(), (4, 4));

        let context = context.with_mode(ProcessingMode::Diffusion);
        assert_eq!(context.mode, ProcessingMode::Diffusion);
    }
}
