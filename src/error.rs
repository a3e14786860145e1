//! Error types for the tile cache.

use thiserror::Error;

/// Error types for tile cache operations.
///
/// Every fallible cache operation reduces to one of these; nothing panics or
/// unwinds across a worker/render-thread boundary.
#[derive(Error, Debug)]
pub enum TileError {
    #[error("cache is full: eviction impossible, all candidate tails pinned or cancelled")]
    CapacityExhausted,

    #[error("tile not ready")]
    NotReady,

    #[error("tile load was cancelled")]
    Cancelled,

    #[error("data source failed to produce tile: {0}")]
    SourceFailure(String),

    #[error("gpu upload failed: {0}")]
    GpuUploadFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for tile cache operations.
pub type TileResult<T> = Result<T, TileError>;
