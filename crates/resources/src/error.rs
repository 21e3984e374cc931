//! Asset loading errors.

use std::path::PathBuf;

use thiserror::Error;

/// Why an asset could not be turned into CPU-side data.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Asset not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to import glTF '{path}'")]
    GltfLoad {
        path: PathBuf,
        #[source]
        source: gltf::Error,
    },

    /// The document imported but holds nothing drawable.
    #[error("glTF '{0}' has no triangle meshes")]
    NoMeshes(PathBuf),

    #[error("Primitive {primitive} of mesh '{mesh}' has no positions")]
    NoPositionData { mesh: String, primitive: usize },

    /// A `builtin:` source names no known primitive.
    #[error("Unknown built-in model '{0}'")]
    UnknownBuiltin(String),

    #[error("Texture '{name}': expected {expected} bytes of pixels, got {actual}")]
    PixelSize {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Cube map face {face} is {width}x{height}, expected {expected}x{expected}")]
    CubeFace {
        face: usize,
        width: u32,
        height: u32,
        expected: u32,
    },

    #[error("Image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

pub type ResourceResult<T> = Result<T, ResourceError>;
