//! Built-in geometry for scenes that reference `builtin:` models.

use ember_rhi::vertex::Vertex;
use glam::{Vec2, Vec3, Vec4};

use crate::model::{Mesh, Model};

/// Unit cube centred on the origin, 24 vertices with per-face normals.
pub fn cube() -> Model {
    // (normal, tangent) per face
    let faces = [
        (Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_X, Vec3::Z),
        (Vec3::Y, Vec3::X),
        (Vec3::NEG_Y, Vec3::X),
        (Vec3::Z, Vec3::X),
        (Vec3::NEG_Z, Vec3::NEG_X),
    ];
    let corners = [
        Vec2::new(-1.0, -1.0),
        Vec2::new(1.0, -1.0),
        Vec2::new(1.0, 1.0),
        Vec2::new(-1.0, 1.0),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, tangent) in faces {
        let bitangent = normal.cross(tangent);
        let base = vertices.len() as u32;
        for corner in corners {
            let position = (normal + tangent * corner.x + bitangent * corner.y) * 0.5;
            let uv = Vec2::new(corner.x + 1.0, 1.0 - corner.y) * 0.5;
            vertices.push(Vertex::new(position, normal, uv, tangent.extend(1.0)));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    Model::from_meshes(
        "cube",
        vec![Mesh {
            name: "cube".to_string(),
            vertices,
            indices,
            material: None,
        }],
    )
}

/// Single triangle in the XY plane facing +Z.
pub fn triangle() -> Model {
    let tangent = Vec4::new(1.0, 0.0, 0.0, 1.0);
    let vertices = vec![
        Vertex::new(Vec3::new(0.0, 0.5, 0.0), Vec3::Z, Vec2::new(0.5, 0.0), tangent),
        Vertex::new(Vec3::new(-0.5, -0.5, 0.0), Vec3::Z, Vec2::new(0.0, 1.0), tangent),
        Vertex::new(Vec3::new(0.5, -0.5, 0.0), Vec3::Z, Vec2::new(1.0, 1.0), tangent),
    ];
    Model::from_meshes(
        "triangle",
        vec![Mesh {
            name: "triangle".to_string(),
            vertices,
            indices: vec![0, 1, 2],
            material: None,
        }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_counts() {
        let cube = cube();
        assert_eq!(cube.total_vertex_count(), 24);
        assert_eq!(cube.total_triangle_count(), 12);
        assert_eq!(cube.aabb_min, Vec3::splat(-0.5));
        assert_eq!(cube.aabb_max, Vec3::splat(0.5));
    }

    #[test]
    fn test_cube_winding_matches_normals() {
        let cube = cube();
        let mesh = &cube.meshes[0];
        for tri in mesh.indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|i| mesh.vertices[tri[i] as usize]);
            let face = (b.position - a.position).cross(c.position - a.position);
            assert!(face.dot(a.normal) > 0.0);
        }
    }

    #[test]
    fn test_triangle() {
        let tri = triangle();
        assert_eq!(tri.total_triangle_count(), 1);
        assert!(tri.meshes[0].indices.iter().all(|&i| i < 3));
    }
}
