//! Scene graph for Ember.
//!
//! This crate holds what the render passes draw:
//! - GPU-resident models built from loaded assets
//! - Camera and fly-through controller
//! - Per-frame and per-object constant buffers
//! - The JSON scene description

mod error;
pub mod camera;
pub mod constants;
pub mod light;
pub mod model;
pub mod scene;
pub mod transform;

pub use camera::{Camera, FlyController, Movement, Projection};
pub use constants::{FrameConstants, ObjectConstants};
pub use error::{SceneError, SceneResult};
pub use light::DirectionalLight;
pub use model::{GpuMesh, RenderModel, UploadOptions};
pub use scene::{Scene, SceneDescription, SceneEntry};
pub use transform::Transform;
