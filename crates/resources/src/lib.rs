//! CPU-side assets for Ember.
//!
//! This crate turns external files into plain data the renderer uploads:
//! - glTF model import
//! - Image decoding for 2D textures and cube maps
//! - Built-in primitives for scenes without asset files
//! - Material parameters

mod error;
pub mod material;
pub mod model;
pub mod primitives;
pub mod texture;

pub use error::{ResourceError, ResourceResult};
pub use material::Material;
pub use model::{Mesh, Model, ModelSource};
pub use texture::TextureData;
