use std::path::PathBuf;

use unionfs::DriverError;

/// Typed errors surfaced by the core. The core reports; it never prompts or
/// retries. `Other` lets ordinary `anyhow::Context` usage compose through
/// this enum, following the same shape as the teacher's
/// `FindBestPackageError`.
#[derive(Debug, thiserror::Error)]
pub enum LayerFsError {
    #[error("{0} is not a valid layer directory")]
    NotALayer(PathBuf),

    #[error("layer not found: {0}")]
    LayerNotFound(String),

    #[error("mount operation requires elevated privileges")]
    PermissionDenied,

    #[error("mount driver failed (exit code {exit_code:?}): {stderr}")]
    DriverError {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("invalid layer-spec {spec:?}: {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<DriverError> for LayerFsError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::PermissionDenied => LayerFsError::PermissionDenied,
            DriverError::Other { exit_code, stderr } => {
                LayerFsError::DriverError { exit_code, stderr }
            }
        }
    }
}
