//! Model and mesh loading from glTF files.

use std::fmt;
use std::path::{Path, PathBuf};

use ember_rhi::vertex::Vertex;
use glam::{Vec2, Vec3, Vec4};
use tracing::{debug, info, warn};

use crate::error::{ResourceError, ResourceResult};
use crate::material::Material;
use crate::primitives;
use crate::texture::TextureData;

/// Prefix that selects a built-in primitive instead of a file.
pub const BUILTIN_PREFIX: &str = "builtin:";

const DEFAULT_TANGENT: Vec4 = Vec4::new(1.0, 0.0, 0.0, 1.0);

/// Indexed triangle list ready for upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Index into the owning model's materials.
    pub material: Option<usize>,
}

impl Mesh {
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Bounds of all vertex positions, or `None` for an empty mesh.
    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        let first = self.vertices.first()?.position;
        Some(self.vertices.iter().fold((first, first), |(min, max), v| {
            (min.min(v.position), max.max(v.position))
        }))
    }
}

/// Where a scene entry's geometry comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Cube,
    Triangle,
    File(PathBuf),
}

impl ModelSource {
    /// Parses a scene path. `builtin:cube` and `builtin:triangle` name the
    /// built-in primitives; anything else is a file path.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::UnknownBuiltin`] for any other `builtin:` name.
    pub fn parse(path: &str) -> ResourceResult<Self> {
        match path.strip_prefix(BUILTIN_PREFIX) {
            Some("cube") => Ok(Self::Cube),
            Some("triangle") => Ok(Self::Triangle),
            Some(other) => Err(ResourceError::UnknownBuiltin(other.to_string())),
            None => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cube => write!(f, "{BUILTIN_PREFIX}cube"),
            Self::Triangle => write!(f, "{BUILTIN_PREFIX}triangle"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A model containing one or more meshes.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub name: String,
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Material>,
    /// Decoded images, indexed by [`Material::base_color_texture`].
    pub textures: Vec<TextureData>,
    /// Axis-aligned bounding box minimum
    pub aabb_min: Vec3,
    /// Axis-aligned bounding box maximum
    pub aabb_max: Vec3,
}

impl Model {
    /// Builds a model around already assembled meshes.
    pub fn from_meshes(name: impl Into<String>, meshes: Vec<Mesh>) -> Self {
        let mut model = Self {
            name: name.into(),
            meshes,
            ..Default::default()
        };
        model.compute_bounds();
        model
    }

    /// Loads a built-in primitive or a glTF file.
    pub fn from_source(source: &ModelSource) -> ResourceResult<Self> {
        match source {
            ModelSource::Cube => Ok(primitives::cube()),
            ModelSource::Triangle => Ok(primitives::triangle()),
            ModelSource::File(path) => Self::load(path),
        }
    }

    /// Load a model from a glTF file.
    ///
    /// Only triangle-list primitives are imported. Missing normals are
    /// generated from face geometry; missing texture coordinates default to
    /// zero and missing tangents to +X.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or holds
    /// no triangle geometry.
    pub fn load(path: impl AsRef<Path>) -> ResourceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ResourceError::FileNotFound(path.to_path_buf()));
        }

        let (document, buffers, images) =
            gltf::import(path).map_err(|source| ResourceError::GltfLoad {
                path: path.to_path_buf(),
                source,
            })?;

        let mut meshes = Vec::new();
        for mesh in document.meshes() {
            for (index, primitive) in mesh.primitives().enumerate() {
                if primitive.mode() != gltf::mesh::Mode::Triangles {
                    warn!(
                        "Skipping {:?} primitive {} of mesh '{}'",
                        primitive.mode(),
                        index,
                        mesh.name().unwrap_or("unnamed")
                    );
                    continue;
                }
                let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
                let positions: Vec<Vec3> = reader
                    .read_positions()
                    .ok_or_else(|| ResourceError::NoPositionData {
                        mesh: mesh.name().unwrap_or("unnamed").to_string(),
                        primitive: index,
                    })?
                    .map(Vec3::from_array)
                    .collect();
                let indices: Vec<u32> = match reader.read_indices() {
                    Some(indices) => indices.into_u32().collect(),
                    None => (0..positions.len() as u32).collect(),
                };
                let normals: Vec<Vec3> = match reader.read_normals() {
                    Some(normals) => normals.map(Vec3::from_array).collect(),
                    None => generate_normals(&positions, &indices),
                };
                let tex_coords: Vec<Vec2> = reader
                    .read_tex_coords(0)
                    .map(|t| t.into_f32().map(Vec2::from_array).collect())
                    .unwrap_or_default();
                let tangents: Vec<Vec4> = reader
                    .read_tangents()
                    .map(|t| t.map(Vec4::from_array).collect())
                    .unwrap_or_default();

                let vertices = positions
                    .iter()
                    .enumerate()
                    .map(|(i, &position)| {
                        Vertex::new(
                            position,
                            normals.get(i).copied().unwrap_or(Vec3::Y),
                            tex_coords.get(i).copied().unwrap_or(Vec2::ZERO),
                            tangents.get(i).copied().unwrap_or(DEFAULT_TANGENT),
                        )
                    })
                    .collect();

                meshes.push(Mesh {
                    name: mesh.name().unwrap_or("unnamed").to_string(),
                    vertices,
                    indices,
                    material: primitive.material().index(),
                });
            }
        }

        if meshes.is_empty() {
            return Err(ResourceError::NoMeshes(path.to_path_buf()));
        }

        let materials = document.materials().map(|m| Material::from_gltf(&m)).collect();
        let textures = images
            .iter()
            .map(TextureData::try_from)
            .collect::<ResourceResult<Vec<_>>>()?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut model = Self {
            name,
            meshes,
            materials,
            textures,
            ..Default::default()
        };
        model.compute_bounds();

        info!(
            "Loaded {}: {} meshes, {} vertices, {} triangles",
            path.display(),
            model.meshes.len(),
            model.total_vertex_count(),
            model.total_triangle_count()
        );
        debug!("Bounds {:?} to {:?}", model.aabb_min, model.aabb_max);
        Ok(model)
    }

    pub fn total_vertex_count(&self) -> usize {
        self.meshes.iter().map(|m| m.vertices.len()).sum()
    }

    pub fn total_triangle_count(&self) -> usize {
        self.meshes.iter().map(Mesh::triangle_count).sum()
    }

    /// Material used by `mesh`, falling back to the default material.
    pub fn material_for(&self, mesh: &Mesh) -> Material {
        mesh.material
            .and_then(|i| self.materials.get(i))
            .cloned()
            .unwrap_or_default()
    }

    fn compute_bounds(&mut self) {
        let bounds = self
            .meshes
            .iter()
            .filter_map(Mesh::bounds)
            .reduce(|(amin, amax), (bmin, bmax)| (amin.min(bmin), amax.max(bmax)));
        (self.aabb_min, self.aabb_max) = bounds.unwrap_or((Vec3::ZERO, Vec3::ZERO));
    }
}

/// Area-weighted vertex normals for an indexed triangle list.
fn generate_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut normals = vec![Vec3::ZERO; positions.len()];
    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        if a >= positions.len() || b >= positions.len() || c >= positions.len() {
            continue;
        }
        let face = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
        normals[a] += face;
        normals[b] += face;
        normals[c] += face;
    }
    normals
        .into_iter()
        .map(|n| n.try_normalize().unwrap_or(Vec3::Y))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_builtin_sources() {
        assert_eq!(ModelSource::parse("builtin:cube").unwrap(), ModelSource::Cube);
        assert_eq!(ModelSource::parse("builtin:triangle").unwrap(), ModelSource::Triangle);
        assert_eq!(
            ModelSource::parse("assets/helmet.gltf").unwrap(),
            ModelSource::File(PathBuf::from("assets/helmet.gltf"))
        );
    }

    #[test]
    fn test_unknown_builtin_rejected() {
        let err = ModelSource::parse("builtin:teapot").unwrap_err();
        assert!(matches!(err, ResourceError::UnknownBuiltin(name) if name == "teapot"));
    }

    #[test]
    fn test_source_display_round_trips() {
        let source = ModelSource::parse("builtin:cube").unwrap();
        assert_eq!(source.to_string(), "builtin:cube");
    }

    #[test]
    fn test_generated_normals_face_up() {
        let positions = [Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0), Vec3::X];
        let normals = generate_normals(&positions, &[0, 1, 2]);
        for n in normals {
            assert!((n - Vec3::Y).length() < 1e-6);
        }
    }

    #[test]
    fn test_bounds_span_all_meshes() {
        let a = Mesh {
            vertices: vec![Vertex { position: Vec3::splat(-1.0), ..Default::default() }],
            ..Default::default()
        };
        let b = Mesh {
            vertices: vec![Vertex { position: Vec3::new(2.0, 3.0, 4.0), ..Default::default() }],
            ..Default::default()
        };
        let model = Model::from_meshes("pair", vec![a, b]);
        assert_eq!(model.aabb_min, Vec3::splat(-1.0));
        assert_eq!(model.aabb_max, Vec3::new(2.0, 3.0, 4.0));
    }

    #[test]
    fn test_missing_model_file() {
        let err = Model::load("no/such/model.gltf").unwrap_err();
        assert!(matches!(err, ResourceError::FileNotFound(_)));
    }

    #[test]
    fn test_material_fallback() {
        let model = Model::from_meshes("m", vec![Mesh { material: Some(7), ..Default::default() }]);
        assert_eq!(model.material_for(&model.meshes[0]), Material::default());
    }
}
