//! Error types for scene construction.

use ember_resources::ResourceError;
use ember_rhi::RhiError;
use thiserror::Error;

/// Error type for scene operations.
#[derive(Error, Debug)]
pub enum SceneError {
    #[error(transparent)]
    Rhi(#[from] RhiError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The scene description could not be read.
    #[error(transparent)]
    Description(#[from] ember_core::Error),

    #[error("Scene description '{0}' lists no models")]
    Empty(String),

    #[error("Frame slot {slot} out of range ({count} slots)")]
    FrameSlot { slot: usize, count: usize },
}

/// Result type alias for scene operations.
pub type SceneResult<T> = Result<T, SceneError>;
