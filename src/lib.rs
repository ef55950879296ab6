//! フレーム単位の顔年齢変換と時間的一貫性パイプライン
//!
//! デコード済み RGB フレームを受け取り、選択されたストラテジーで年齢変換を
//! 実行し、セッション単位の安定化を通した結果を返す。ファイル I/O・色変換・
//! プレビュー描画は呼び出し側レイヤの責務。

pub mod config;
pub mod controls;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod frame;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod session;
pub mod stabilizer;
pub mod strategy;
pub mod traits;

pub mod mocks;

pub use config::{EngineOptions, ModelConfig};
pub use controls::{AgeControls, ProcessingMode};
pub use dispatch::{FrameDispatcher, SessionDispatcher};
pub use engine::Engine;
pub use errors::{FaceReageError, InferenceCause, Result};
pub use frame::{FrameContext, ProcessingResult};
pub use metrics::Metrics;
pub use registry::{Backend, LoadedManifest, ModelRegistry};
pub use session::{SessionId, SessionInfo};
pub use stabilizer::StabilizerState;
pub use traits::*;

#[cfg(test)]
pub use mocks::*;
