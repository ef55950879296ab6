use std::path::Path;

use ndarray::prelude::*;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch, ROCmExecutionProvider,
    TensorRTExecutionProvider,
};
use ort::session::{builder::SessionBuilder, Session};
use ort::value::TensorRef;
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{FaceReageError, Result};
use crate::registry::{Backend, BackendPlan, LoadedManifest, ModelKind};
use crate::stabilizer::l2_normalized;
use crate::traits::{AgingModel, IdentityEncoder};

/// 解決済みのフォールバック連鎖を ort の実行プロバイダ列に写す
fn providers_for(plan: &BackendPlan, device_id: i32) -> Vec<ExecutionProviderDispatch> {
    plan.chain
        .iter()
        .map(|backend| match backend {
            Backend::TensorRt => TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            Backend::Cuda => CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            Backend::Rocm => ROCmExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            Backend::CoreMl => CoreMLExecutionProvider::default().build(),
            Backend::DirectMl => DirectMLExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            Backend::Cpu => CPUExecutionProvider::default().build(),
        })
        .collect()
}

fn build_session(model_path: &Path, plan: &BackendPlan, device_id: i32) -> Result<Session> {
    let session = SessionBuilder::new()
        .map_err(|e| load_error(model_path, "session builder init", e))?
        .with_execution_providers(providers_for(plan, device_id))
        .map_err(|e| load_error(model_path, "execution provider setup", e))?
        .with_memory_pattern(true)
        .map_err(|e| load_error(model_path, "memory pattern setup", e))?
        .commit_from_file(model_path)
        .map_err(|e| load_error(model_path, "model file load", e))?;

    debug!(path = %model_path.display(), "ort session ready");
    Ok(session)
}

fn load_error(path: &Path, operation: &str, err: ort::Error) -> FaceReageError {
    FaceReageError::Load {
        path: path.to_path_buf(),
        operation: operation.to_string(),
        source: Some(Box::new(err)),
    }
}

/// ONNX Runtime ベースの年齢変換モデル一式
///
/// フィードフォワード生成器とデノイザの 2 セッションを持つ。重みはロード後
/// 不変で、セッションへのアクセスだけ Mutex で直列化する。
pub struct OrtAgingModel {
    generator: Mutex<Session>,
    denoiser: Mutex<Session>,
}

impl OrtAgingModel {
    /// 検証済みマニフェストからセッションを構築する
    pub fn load(manifest: &LoadedManifest, plan: &BackendPlan, device_id: i32) -> Result<Self> {
        let mut generator = build_session(manifest.require(ModelKind::Feedforward)?, plan, device_id)?;
        let denoiser = build_session(manifest.require(ModelKind::Diffusion)?, plan, device_id)?;

        // ウォームアップ実行でグラフ最適化とメモリ確保を済ませる
        let data = Array4::<f32>::zeros((1, 3, 64, 64));
        let age = Array2::<f32>::from_elem((1, 1), 0.5);
        generator.run(ort::inputs![
            "input" => TensorRef::from_array_view(&data)?,
            "age" => TensorRef::from_array_view(&age)?,
        ])?;

        Ok(Self {
            generator: Mutex::new(generator),
            denoiser: Mutex::new(denoiser),
        })
    }
}

impl AgingModel for OrtAgingModel {
    fn generate(&self, input: ArrayView4<f32>, age: f32) -> Result<Array4<f32>> {
        let age_tensor = Array2::<f32>::from_elem((1, 1), age);
        let mut session = self.generator.lock();
        let outputs = session.run(ort::inputs![
            "input" => TensorRef::from_array_view(&input.as_standard_layout())?,
            "age" => TensorRef::from_array_view(&age_tensor)?,
        ])?;
        Ok(outputs["output"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }

    fn denoise_step(
        &self,
        latent: ArrayView4<f32>,
        step: u32,
        total_steps: u32,
        age: f32,
        guidance_scale: f32,
    ) -> Result<Array4<f32>> {
        let conditioning = Array2::<f32>::from_shape_vec(
            (1, 3),
            vec![step as f32 / total_steps as f32, age, guidance_scale],
        )?;
        let mut session = self.denoiser.lock();
        let outputs = session.run(ort::inputs![
            "latent" => TensorRef::from_array_view(&latent.as_standard_layout())?,
            "conditioning" => TensorRef::from_array_view(&conditioning)?,
        ])?;
        Ok(outputs["denoised"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

/// ONNX Runtime ベースの顔アイデンティティエンコーダ
pub struct OrtIdentityEncoder {
    session: Mutex<Session>,
    embedding_dim: usize,
}

impl OrtIdentityEncoder {
    pub fn load(manifest: &LoadedManifest, plan: &BackendPlan, device_id: i32) -> Result<Self> {
        let session = build_session(manifest.require(ModelKind::Identity)?, plan, device_id)?;

        // 出力形状から埋め込み次元を推定する。動的形状なら既定値
        let embedding_dim = session.outputs[0]
            .output_type
            .tensor_shape()
            .and_then(|shape| shape.last().copied())
            .filter(|dim| *dim > 0)
            .unwrap_or(512) as usize;

        Ok(Self {
            session: Mutex::new(session),
            embedding_dim,
        })
    }
}

impl IdentityEncoder for OrtIdentityEncoder {
    fn embed(&self, input: ArrayView4<f32>) -> Result<Array1<f32>> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            "input" => TensorRef::from_array_view(&input.as_standard_layout())?,
        ])?;
        let raw = outputs["embedding"].try_extract_array::<f32>()?;
        let vector: Vec<f32> = raw.iter().copied().collect();
        Ok(l2_normalized(Array1::from(vector)))
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}
