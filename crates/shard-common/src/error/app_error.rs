//! Application error types
//!
//! Top-level error for process bootstrap (parent coordinator and worker entry points).

use shard_core::CoreError;

use crate::config::ConfigError;

/// Application-wide error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    // Layout errors
    #[error(transparent)]
    Layout(#[from] CoreError),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // Cluster / IPC errors
    #[error("Cluster error: {0}")]
    Cluster(String),

    // External service errors
    #[error("External service error: {0}")]
    ExternalService(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error")]
    Internal(#[source] anyhow::Error),
}

impl AppError {
    /// Get error code for logs
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Layout(e) => e.code(),
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::Cluster(_) => "CLUSTER_ERROR",
            Self::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Process exit code for this error
    ///
    /// Configuration problems exit with 78 (`EX_CONFIG`) so supervisors can tell them apart
    /// from runtime failures.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Layout(_) => 78,
            _ => 1,
        }
    }

    /// Check if retrying the same operation could succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Gateway(_) | Self::ExternalService(_) | Self::Io(_))
    }

    /// Create an internal error from any error
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(err.into())
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
