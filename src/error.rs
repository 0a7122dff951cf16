//! Engine-wide error type. Mirrors the shape of a typical `thiserror`
//! enum-per-subsystem: each recoverable failure mode named in the error
//! handling design gets its own variant, plus passthroughs for the external
//! collaborators (codec, GPU device, filesystem).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not load image '{0}'")]
    LoadFailure(String),

    #[error("alignment did not converge for image index {0}")]
    AlignFailure(usize),

    #[error("task '{0}' is pending with an unscheduled dependency")]
    TaskDependencyMissing(String),

    #[error("GPU unavailable, falling back to CPU")]
    GpuUnavailable,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("task '{task_name}' failed: {message}")]
    TaskException { task_name: String, message: String },

    #[error("image codec error")]
    Image(#[from] image::ImageError),

    #[error("GPU device request failed")]
    GpuDeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("filesystem error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_exception_message_includes_name_and_reason() {
        let err = EngineError::TaskException {
            task_name: "Align img_003.jpg".to_string(),
            message: "ECC did not converge".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Align img_003.jpg"));
        assert!(msg.contains("ECC did not converge"));
    }

    #[test]
    fn load_failure_carries_path() {
        let err = EngineError::LoadFailure("missing.jpg".to_string());
        assert!(err.to_string().contains("missing.jpg"));
    }
}
