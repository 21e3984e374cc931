//! GPU-resident models.
//!
//! [`RenderModel::upload`] turns a CPU [`Model`] into default-heap vertex
//! and index buffers plus sampled textures. The copies are recorded into a
//! caller-supplied command list; staging buffers are dropped as soon as
//! the copies are recorded, which retires them at the fence value the
//! list will be signaled with.

use ember_resources::{Material, Model};
use ember_rhi::command::{CommandList, IndexBufferView, IndexFormat, VertexBufferView};
use ember_rhi::pipeline::PipelineBinding;
use ember_rhi::resource::{ResourceDescriptor, ResourceManager, TextureDescriptor};
use ember_rhi::types::{BufferUsage, Format, HeapKind, ResourceState, TextureDesc, TextureUsage};
use ember_rhi::vertex::Vertex;
use glam::Vec3;
use tracing::{debug, info};

use crate::constants::ObjectConstants;
use crate::error::{SceneError, SceneResult};
use crate::transform::Transform;

/// Upload settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Compute pipeline that downsamples mips. Without one, textures get a
    /// single mip.
    pub mip_pipeline: Option<PipelineBinding>,
}

/// One mesh of a [`RenderModel`].
pub struct GpuMesh {
    name: String,
    vertex_buffer: ResourceDescriptor,
    index_buffer: ResourceDescriptor,
    vertex_count: u32,
    index_count: u32,
    material: Material,
    /// Index into the owning model's textures.
    texture: Option<usize>,
    /// Object constants, one buffer per frame slot.
    constants: Vec<ResourceDescriptor>,
}

impl GpuMesh {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertex_view(&self) -> VertexBufferView {
        VertexBufferView {
            resource: self.vertex_buffer.id(),
            offset: 0,
            size: self.vertex_buffer.size(),
            stride: std::mem::size_of::<Vertex>() as u32,
        }
    }

    pub fn index_view(&self) -> IndexBufferView {
        IndexBufferView {
            resource: self.index_buffer.id(),
            offset: 0,
            size: self.index_buffer.size(),
            format: IndexFormat::U32,
        }
    }

    #[inline]
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    #[inline]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn material(&self) -> &Material {
        &self.material
    }

    /// Constant buffer view index of this mesh's constants for a frame slot.
    pub fn constants_index(&self, slot: usize) -> Option<u32> {
        self.constants.get(slot)?.descriptor_index()
    }
}

/// A model whose geometry and textures live on the GPU.
pub struct RenderModel {
    name: String,
    meshes: Vec<GpuMesh>,
    textures: Vec<TextureDescriptor>,
    pub transform: Transform,
    aabb_min: Vec3,
    aabb_max: Vec3,
}

impl RenderModel {
    /// Creates GPU buffers and textures for `model` and records their
    /// uploads into `list`.
    ///
    /// `frame_count` object constant buffers are created per mesh so each
    /// frame slot can be written while the others are in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if a buffer, texture or view cannot be created, or
    /// if recording fails because `list` is not recording.
    pub fn upload(
        resources: &ResourceManager,
        list: &mut CommandList,
        model: &Model,
        frame_count: usize,
        options: &UploadOptions,
    ) -> SceneResult<Self> {
        let mut textures = Vec::with_capacity(model.textures.len());
        for (i, data) in model.textures.iter().enumerate() {
            let desc = TextureDesc::new_2d(
                format!("{} texture {i}", model.name),
                data.width,
                data.height,
                data.format,
                TextureUsage::SAMPLED,
            );
            let srgb = matches!(data.format, Format::Rgba8Srgb | Format::Bgra8Srgb);
            let mips = options.mip_pipeline.filter(|_| !srgb);
            let mut texture = resources.create_texture(desc, data.is_cube_map(), mips.is_some())?;
            for (layer, pixels) in data.layers.iter().enumerate() {
                texture.write_layer(resources, layer as u32, pixels)?;
            }
            texture.record_upload(list)?;
            if let Some(pipeline) = mips {
                texture.record_mip_generation(list, &pipeline)?;
            }
            textures.push(texture);
        }

        let mut meshes = Vec::with_capacity(model.meshes.len());
        for (i, mesh) in model.meshes.iter().enumerate() {
            if mesh.vertices.is_empty() || mesh.indices.is_empty() {
                debug!("Skipping empty mesh '{}' of '{}'", mesh.name, model.name);
                continue;
            }
            let label = format!("{} mesh {i}", model.name);
            let vertex_buffer = upload_buffer(
                resources,
                list,
                &format!("{label} vertices"),
                bytemuck::cast_slice(&mesh.vertices),
                BufferUsage::VERTEX,
            )?;
            let index_buffer = upload_buffer(
                resources,
                list,
                &format!("{label} indices"),
                bytemuck::cast_slice(&mesh.indices),
                BufferUsage::INDEX,
            )?;
            let constants = (0..frame_count)
                .map(|slot| {
                    resources.create_constant_buffer(
                        &format!("{label} constants {slot}"),
                        ObjectConstants::SIZE as u64,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;

            let material = model.material_for(mesh);
            meshes.push(GpuMesh {
                name: mesh.name.clone(),
                vertex_buffer,
                index_buffer,
                vertex_count: mesh.vertices.len() as u32,
                index_count: mesh.indices.len() as u32,
                texture: material.base_color_texture.filter(|&t| t < textures.len()),
                material,
                constants,
            });
        }

        info!(
            "Uploaded '{}': {} meshes, {} textures",
            model.name,
            meshes.len(),
            textures.len()
        );

        Ok(Self {
            name: model.name.clone(),
            meshes,
            textures,
            transform: Transform::default(),
            aabb_min: model.aabb_min,
            aabb_max: model.aabb_max,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meshes(&self) -> &[GpuMesh] {
        &self.meshes
    }

    pub fn textures(&self) -> &[TextureDescriptor] {
        &self.textures
    }

    /// Shader resource view of a mesh's base color texture.
    pub fn texture_index(&self, mesh: &GpuMesh) -> Option<u32> {
        mesh.texture
            .and_then(|t| self.textures.get(t))
            .map(TextureDescriptor::srv_index)
    }

    /// World-space bounds under the current transform.
    pub fn world_bounds(&self) -> (Vec3, Vec3) {
        let matrix = self.transform.matrix();
        let corners = [
            Vec3::new(self.aabb_min.x, self.aabb_min.y, self.aabb_min.z),
            Vec3::new(self.aabb_max.x, self.aabb_min.y, self.aabb_min.z),
            Vec3::new(self.aabb_min.x, self.aabb_max.y, self.aabb_min.z),
            Vec3::new(self.aabb_min.x, self.aabb_min.y, self.aabb_max.z),
            Vec3::new(self.aabb_max.x, self.aabb_max.y, self.aabb_min.z),
            Vec3::new(self.aabb_max.x, self.aabb_min.y, self.aabb_max.z),
            Vec3::new(self.aabb_min.x, self.aabb_max.y, self.aabb_max.z),
            Vec3::new(self.aabb_max.x, self.aabb_max.y, self.aabb_max.z),
        ]
        .map(|c| matrix.transform_point3(c));
        corners[1..].iter().fold((corners[0], corners[0]), |(min, max), &c| {
            (min.min(c), max.max(c))
        })
    }

    /// Writes this frame slot's object constants for every mesh.
    pub fn write_constants(&self, resources: &ResourceManager, slot: usize) -> SceneResult<()> {
        for mesh in &self.meshes {
            let Some(buffer) = mesh.constants.get(slot) else {
                return Err(SceneError::FrameSlot {
                    slot,
                    count: mesh.constants.len(),
                });
            };
            let constants = ObjectConstants::new(
                &self.transform,
                mesh.material.base_color,
                mesh.material.metallic,
                mesh.material.roughness,
            );
            resources.write_buffer(buffer, 0, bytemuck::bytes_of(&constants))?;
        }
        Ok(())
    }
}

/// Creates a default-heap buffer and records a staging copy into it. The
/// buffer ends in `GenericRead`, readable as vertices or indices.
fn upload_buffer(
    resources: &ResourceManager,
    list: &mut CommandList,
    name: &str,
    bytes: &[u8],
    usage: BufferUsage,
) -> SceneResult<ResourceDescriptor> {
    let size = bytes.len() as u64;
    let buffer = resources.create_buffer(name, size, HeapKind::Default, usage | BufferUsage::COPY_DST)?;
    let staging = resources.create_buffer(
        &format!("{name} staging"),
        size,
        HeapKind::Upload,
        BufferUsage::COPY_SRC,
    )?;
    resources.write_buffer(&staging, 0, bytes)?;

    list.transition(buffer.id(), ResourceState::Common, ResourceState::CopyDest)?;
    list.copy_buffer_region(buffer.id(), 0, staging.id(), 0, size)?;
    list.transition(buffer.id(), ResourceState::CopyDest, ResourceState::GenericRead)?;
    Ok(buffer)
}
