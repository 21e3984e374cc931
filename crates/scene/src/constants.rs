//! Constant buffer layouts shared with the shaders.
//!
//! These structures must match the shader-side cbuffer layouts exactly.
//! All structures use `#[repr(C)]` and only 16-byte members, so the Rust
//! layout and the HLSL packing rules agree without manual padding.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::camera::Camera;
use crate::light::DirectionalLight;
use crate::transform::Transform;

/// Per-frame data, one buffer per frame slot.
///
/// # Memory Layout
///
/// - Offset 0: view matrix
/// - Offset 64: projection matrix
/// - Offset 128: view-projection matrix
/// - Offset 192: camera position, `w` = elapsed seconds
/// - Offset 208: light direction, `w` = ambient term
/// - Offset 224: light radiance, `w` = frame number
/// - Total size: 240 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameConstants {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub camera_position: Vec4,
    pub light_direction: Vec4,
    pub light_radiance: Vec4,
}

impl FrameConstants {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(camera: &Camera, light: &DirectionalLight, time: f32, frame: u64) -> Self {
        let view = camera.view_matrix();
        let projection = camera.projection_matrix();
        Self {
            view,
            projection,
            view_projection: projection * view,
            camera_position: camera.position.extend(time),
            light_direction: light.direction.extend(light.ambient),
            light_radiance: light.radiance().extend(frame as f32),
        }
    }
}

/// Per-draw data for one mesh.
///
/// # Memory Layout
///
/// - Offset 0: model matrix
/// - Offset 64: normal matrix
/// - Offset 128: base color
/// - Offset 144: metallic, roughness, unused, unused
/// - Total size: 160 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ObjectConstants {
    pub model: Mat4,
    pub normal_matrix: Mat4,
    pub base_color: Vec4,
    pub material: Vec4,
}

impl Default for ObjectConstants {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            normal_matrix: Mat4::IDENTITY,
            base_color: Vec4::ONE,
            material: Vec4::new(0.0, 0.5, 0.0, 0.0),
        }
    }
}

impl ObjectConstants {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(transform: &Transform, base_color: Vec4, metallic: f32, roughness: f32) -> Self {
        Self {
            model: transform.matrix(),
            normal_matrix: transform.normal_matrix(),
            base_color,
            material: Vec3::new(metallic, roughness, 0.0).extend(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constants_size() {
        // 3 Mat4 (3 * 64) + 3 Vec4 (3 * 16)
        assert_eq!(FrameConstants::SIZE, 240);
    }

    #[test]
    fn test_object_constants_size() {
        assert_eq!(ObjectConstants::SIZE, 160);
    }

    #[test]
    fn test_view_projection_is_product() {
        let camera = Camera::new();
        let constants = FrameConstants::new(&camera, &DirectionalLight::default(), 1.5, 7);
        assert_eq!(constants.view_projection, constants.projection * constants.view);
        assert_eq!(constants.camera_position.w, 1.5);
        assert_eq!(constants.light_radiance.w, 7.0);
    }

    #[test]
    fn test_object_constants_carry_material() {
        let constants = ObjectConstants::new(&Transform::default(), Vec4::ONE, 1.0, 0.25);
        assert_eq!(constants.material.x, 1.0);
        assert_eq!(constants.material.y, 0.25);
    }
}
