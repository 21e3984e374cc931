//! Vertex formats and their input layouts.
//!
//! Layouts are described without reference to a backend; each backend turns
//! a [`VertexLayout`] into its own input-assembler state.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

use crate::types::Format;

/// One attribute inside a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Shader input location.
    pub location: u32,
    pub format: Format,
    /// Byte offset from the start of the vertex.
    pub offset: u32,
}

/// Input layout for a single interleaved vertex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// Standard mesh vertex.
///
/// Layout (48 bytes):
/// - location 0: `position` at offset 0
/// - location 1: `normal` at offset 12
/// - location 2: `tex_coord` at offset 24
/// - location 3: `tangent` at offset 32, handedness in `w`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub tex_coord: Vec2,
    pub tangent: Vec4,
}

impl Vertex {
    #[inline]
    pub const fn new(position: Vec3, normal: Vec3, tex_coord: Vec2, tangent: Vec4) -> Self {
        Self {
            position,
            normal,
            tex_coord,
            tangent,
        }
    }

    /// Input layout matching this struct.
    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Self>() as u32,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: Format::Rgb32Float,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: Format::Rgb32Float,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: Format::Rg32Float,
                    offset: 24,
                },
                VertexAttribute {
                    location: 3,
                    format: Format::Rgba32Float,
                    offset: 32,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_size() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
    }

    #[test]
    fn test_layout_offsets_match_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.stride, 48);
        assert_eq!(
            layout.attributes[1].offset as usize,
            std::mem::offset_of!(Vertex, normal)
        );
        assert_eq!(
            layout.attributes[2].offset as usize,
            std::mem::offset_of!(Vertex, tex_coord)
        );
        assert_eq!(
            layout.attributes[3].offset as usize,
            std::mem::offset_of!(Vertex, tangent)
        );
    }

    #[test]
    fn test_attributes_fit_in_stride() {
        let layout = Vertex::layout();
        for attr in &layout.attributes {
            assert!(attr.offset + attr.format.bytes_per_element() <= layout.stride);
        }
    }
}
