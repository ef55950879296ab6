use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the face re-aging engine.
///
/// Each variant captures context specific to its error domain (initialization,
/// model loading, inference, session state), so callers can react to the
/// category without parsing error strings.
#[derive(Error, Debug)]
pub enum FaceReageError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Initialization error: {reason}")]
    Init { reason: String },

    #[error("Model load error: {operation} failed for {path:?}")]
    Load {
        path: PathBuf,
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Inference error ({cause}): {operation} failed")]
    Inference {
        operation: String,
        cause: InferenceCause,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Session state error: {reason}")]
    SessionState { reason: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

/// Cause tag carried by every inference failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceCause {
    ModelError,
    OutOfMemory,
    MalformedFrame,
    NumericDivergence,
}

impl std::fmt::Display for InferenceCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::ModelError => "model error",
            Self::OutOfMemory => "out of memory",
            Self::MalformedFrame => "malformed frame",
            Self::NumericDivergence => "numeric divergence",
        };
        f.write_str(tag)
    }
}

pub type Result<T> = std::result::Result<T, FaceReageError>;

/// Convert anyhow errors to configuration errors.
///
/// Some dependencies return anyhow::Error which lacks structured error
/// information; the conversion happens at the boundary so the rest of the
/// codebase works with the domain error type.
impl From<anyhow::Error> for FaceReageError {
    fn from(err: anyhow::Error) -> Self {
        FaceReageError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert ONNX Runtime errors to inference errors.
impl From<ort::Error> for FaceReageError {
    fn from(err: ort::Error) -> Self {
        Self::Inference {
            operation: "ort operation".to_string(),
            cause: InferenceCause::ModelError,
            source: Some(Box::new(err)),
        }
    }
}

/// Convert ndarray shape errors to inference errors.
///
/// Shape errors occur during tensor operations which are part of model
/// inference, so they're tagged as malformed-frame inference failures.
impl From<ndarray::ShapeError> for FaceReageError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Inference {
            operation: "tensor shape conversion".to_string(),
            cause: InferenceCause::MalformedFrame,
            source: Some(Box::new(err)),
        }
    }
}
