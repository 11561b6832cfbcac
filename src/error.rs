// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误类型
//! Error types for the spatial detection core

use thiserror::Error;

/// 统一结果类型
pub type Result<T> = std::result::Result<T, SpatialError>;

/// 空间检测核心可能出现的错误
#[derive(Error, Debug)]
pub enum SpatialError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("Collaborator '{component}' failed: {message}")]
    Collaborator { component: String, message: String },

    #[error("Collaborator call timed out after {0} ms")]
    CollaboratorTimeout(u64),

    #[error("Inference worker is busy or gone")]
    WorkerUnavailable,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl SpatialError {
    pub fn collaborator<C: Into<String>>(component: C, err: anyhow::Error) -> Self {
        Self::Collaborator {
            component: component.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn calibration<S: Into<String>>(msg: S) -> Self {
        Self::InvalidCalibration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_error_keeps_context() {
        let err = SpatialError::collaborator(
            "depth",
            anyhow::anyhow!("tensor shape mismatch").context("estimate"),
        );
        let text = err.to_string();
        assert!(text.contains("depth"));
        assert!(text.contains("tensor shape mismatch"));
    }
}
