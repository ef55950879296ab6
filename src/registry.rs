use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ModelConfig;
use crate::errors::{FaceReageError, Result};

/// 推論の実行バックエンド
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Cuda,
    TensorRt,
    Rocm,
    CoreMl,
    DirectMl,
    Cpu,
}

impl Backend {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::TensorRt => "tensorrt",
            Self::Rocm => "rocm",
            Self::CoreMl => "coreml",
            Self::DirectMl => "directml",
            Self::Cpu => "cpu",
        }
    }

    pub(crate) const fn ordinal(self) -> u8 {
        match self {
            Self::Cuda => 0,
            Self::TensorRt => 1,
            Self::Rocm => 2,
            Self::CoreMl => 3,
            Self::DirectMl => 4,
            Self::Cpu => 5,
        }
    }

    /// このビルドで利用可能なバックエンド。機能フラグで決まり、CPU は常に使える
    pub fn available() -> Vec<Backend> {
        let mut backends = Vec::new();
        if cfg!(feature = "tensorrt") {
            backends.push(Self::TensorRt);
        }
        if cfg!(feature = "cuda") {
            backends.push(Self::Cuda);
        }
        if cfg!(feature = "rocm") {
            backends.push(Self::Rocm);
        }
        if cfg!(feature = "coreml") {
            backends.push(Self::CoreMl);
        }
        if cfg!(feature = "directml") {
            backends.push(Self::DirectMl);
        }
        backends.push(Self::Cpu);
        backends
    }
}

/// 初期化時に一度だけ解決されるバックエンドの優先度計画
///
/// 推論コードに実行時分岐を散らさないため、フォールバック連鎖は
/// ここで確定し、以後は不変。
#[derive(Debug, Clone)]
pub struct BackendPlan {
    pub requested: Backend,
    pub bound: Backend,
    pub chain: Vec<Backend>,
}

impl BackendPlan {
    /// 要求バックエンド → CUDA → CPU の順で、利用可能な最初のものに束縛する
    pub fn resolve(requested: Backend) -> Self {
        let available = Backend::available();

        let mut chain = vec![requested];
        if requested != Backend::Cuda {
            chain.push(Backend::Cuda);
        }
        if !chain.contains(&Backend::Cpu) {
            chain.push(Backend::Cpu);
        }

        let bound = chain
            .iter()
            .copied()
            .find(|backend| available.contains(backend))
            .unwrap_or(Backend::Cpu);

        if bound != requested {
            info!(
                requested = requested.as_str(),
                bound = bound.as_str(),
                "requested backend unavailable, fell back"
            );
        }

        Self {
            requested,
            bound,
            chain,
        }
    }
}

/// マニフェストが参照するモデル種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Feedforward,
    Diffusion,
    Identity,
}

impl ModelKind {
    pub const REQUIRED: [ModelKind; 3] = [Self::Feedforward, Self::Diffusion, Self::Identity];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Feedforward => "feedforward",
            Self::Diffusion => "diffusion",
            Self::Identity => "identity",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "feedforward" => Ok(Self::Feedforward),
            "diffusion" => Ok(Self::Diffusion),
            "identity" => Ok(Self::Identity),
            other => Err(FaceReageError::Validation {
                field: "manifest.models.kind".to_string(),
                reason: format!("unknown model kind `{other}`"),
            }),
        }
    }
}

/// manifest.json のエントリ
#[derive(Debug, Clone, Deserialize)]
struct ManifestEntry {
    kind: String,
    file: String,
    bytes: u64,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelManifest {
    version: String,
    models: Vec<ManifestEntry>,
}

/// 検証済みの単一モデル
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub kind: ModelKind,
    pub path: PathBuf,
    pub bytes: u64,
}

/// 全ファイルの検証を通過したマニフェスト
#[derive(Debug, Clone)]
pub struct LoadedManifest {
    pub version: String,
    pub models: Vec<LoadedModel>,
}

impl LoadedManifest {
    pub fn path_for(&self, kind: ModelKind) -> Option<&Path> {
        self.models
            .iter()
            .find(|model| model.kind == kind)
            .map(|model| model.path.as_path())
    }

    pub(crate) fn require(&self, kind: ModelKind) -> Result<&Path> {
        self.path_for(kind).ok_or_else(|| FaceReageError::Load {
            path: PathBuf::new(),
            operation: format!("model lookup ({})", kind.as_str()),
            source: None,
        })
    }

    pub fn kinds(&self) -> Vec<ModelKind> {
        self.models.iter().map(|model| model.kind).collect()
    }
}

/// モデルレジストリとバックエンドセレクタ
///
/// 設定検証とバックエンド束縛は `initialize`、モデルファイルの検証は
/// `load_models` が担う。検証を全て通過するまで ready にならない。
pub struct ModelRegistry {
    config: ModelConfig,
    plan: BackendPlan,
    manifest: Option<LoadedManifest>,
}

impl ModelRegistry {
    pub fn initialize(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let plan = BackendPlan::resolve(config.backend);
        debug!(
            requested = plan.requested.as_str(),
            bound = plan.bound.as_str(),
            "backend plan resolved"
        );
        Ok(Self {
            config,
            plan,
            manifest: None,
        })
    }

    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub const fn backend_plan(&self) -> &BackendPlan {
        &self.plan
    }

    pub const fn is_ready(&self) -> bool {
        self.manifest.is_some()
    }

    pub fn manifest(&self) -> Option<&LoadedManifest> {
        self.manifest.as_ref()
    }

    /// manifest.json を読み、参照される全モデルファイルを検証してから ready にする
    ///
    /// 1ファイルでも欠損・サイズ不一致・チェックサム不一致があれば呼び出し
    /// 全体が失敗し、レジストリは ready にならない（部分ロードで動かない）。
    pub fn load_models(&mut self, model_dir: &Path) -> Result<LoadedManifest> {
        let manifest_path = model_dir.join("manifest.json");
        if !manifest_path.exists() {
            return Err(FaceReageError::Load {
                path: manifest_path,
                operation: format!("manifest lookup ({})", describe_model_dir(model_dir)),
                source: None,
            });
        }

        let raw = fs::read_to_string(&manifest_path).map_err(|e| FaceReageError::Load {
            path: manifest_path.clone(),
            operation: "manifest read".to_string(),
            source: Some(Box::new(e)),
        })?;
        let manifest: ModelManifest =
            serde_json::from_str(&raw).map_err(|e| FaceReageError::Load {
                path: manifest_path.clone(),
                operation: "manifest parse".to_string(),
                source: Some(Box::new(e)),
            })?;

        let mut models = Vec::with_capacity(manifest.models.len());
        for entry in &manifest.models {
            let kind = ModelKind::parse(&entry.kind)?;
            let path = model_dir.join(&entry.file);
            models.push(Self::validate_model_file(kind, path, entry)?);
        }

        for required in ModelKind::REQUIRED {
            if !models.iter().any(|model: &LoadedModel| model.kind == required) {
                return Err(FaceReageError::Load {
                    path: manifest_path,
                    operation: format!(
                        "manifest completeness check (missing {})",
                        required.as_str()
                    ),
                    source: None,
                });
            }
        }

        let loaded = LoadedManifest {
            version: manifest.version,
            models,
        };
        info!(
            version = %loaded.version,
            models = loaded.models.len(),
            "model manifest validated"
        );
        self.manifest = Some(loaded.clone());
        Ok(loaded)
    }

    fn validate_model_file(
        kind: ModelKind,
        path: PathBuf,
        entry: &ManifestEntry,
    ) -> Result<LoadedModel> {
        let data = fs::read(&path).map_err(|e| FaceReageError::Load {
            path: path.clone(),
            operation: "model file read".to_string(),
            source: Some(Box::new(e)),
        })?;

        if data.len() as u64 != entry.bytes {
            return Err(FaceReageError::Load {
                path,
                operation: format!(
                    "size check (expected {} bytes, found {})",
                    entry.bytes,
                    data.len()
                ),
                source: None,
            });
        }

        if let Some(expected) = &entry.sha256 {
            let actual: String = Sha256::digest(&data)
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect();
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FaceReageError::Load {
                    path,
                    operation: "checksum verification".to_string(),
                    source: None,
                });
            }
        }

        Ok(LoadedModel {
            kind,
            path,
            bytes: entry.bytes,
        })
    }

    pub fn version_info(&self) -> String {
        format!(
            "face-reage-rs {} (backend: {}, manifest: {})",
            env!("CARGO_PKG_VERSION"),
            self.plan.bound.as_str(),
            self.manifest
                .as_ref()
                .map_or("not loaded", |manifest| manifest.version.as_str())
        )
    }
}

/// マニフェストが見つからないときの診断。ディレクトリ内の ONNX 候補を列挙する
fn describe_model_dir(model_dir: &Path) -> String {
    let found: Vec<String> = WalkDir::new(model_dir)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|extension| extension == "onnx")
        })
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();

    if found.is_empty() {
        "no onnx files found in directory".to_string()
    } else {
        format!("found unreferenced onnx files: {}", found.join(", "))
    }
}
