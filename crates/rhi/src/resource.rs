//! Descriptor and resource management.
//!
//! [`ResourceManager`] owns the four descriptor heaps, one
//! [`RegionAllocator`] per descriptor category, and the [`RetireQueue`]
//! every release goes through. It creates committed resources and their
//! views and returns owning wrappers:
//!
//! - [`ResourceDescriptor`] - a resource plus an optional view slot
//! - [`TextureDescriptor`] - a texture, its staging buffer and mip views,
//!   with hooks that record the upload and mip generation
//! - [`RenderTarget`] / [`RenderTargetDescriptor`] - offscreen targets, the
//!   latter as an active/last ping-pong pair
//! - [`DepthBuffer`] - a depth texture plus its DSV
//!
//! Dropping a wrapper never destroys anything on the spot. The resource is
//! retired first, then its view slot, both tagged with the fence value of
//! the frame being recorded; [`ResourceManager::release_completed`] frees
//! them once the GPU has passed that value.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::descriptor::HeapLayout;
//! use ember_rhi::device::GpuDevice;
//! use ember_rhi::resource::ResourceManager;
//!
//! # fn example(device: Arc<dyn GpuDevice>) -> ember_rhi::RhiResult<()> {
//! let resources = ResourceManager::new(device, HeapLayout::default())?;
//!
//! let constants = resources.create_constant_buffer("camera", 208)?;
//! resources.write_buffer(&constants, 0, &[0u8; 208])?;
//! let index = constants.descriptor_index();
//! # let _ = index;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::command::{Barrier, BindPoint, CommandList};
use crate::descriptor::{
    DescriptorCategory, DescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, HeapLayout,
    RegionAllocator, ViewDesc, ViewDimension,
};
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::PipelineBinding;
use crate::retire::{RetireQueue, Retired};
use crate::types::{
    BufferDesc, BufferUsage, Format, HeapId, HeapKind, ResourceId, ResourceState, SamplerDesc,
    TextureDesc, TextureDimension, TextureUsage,
};

/// Constant buffer views must start and end on this boundary.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Thread-group edge used by the mip generation shader.
pub const MIP_GROUP_SIZE: u32 = 8;

/// Rounds a constant buffer size up to [`CONSTANT_BUFFER_ALIGNMENT`].
pub fn align_constant_size(size: u64) -> u64 {
    size.div_ceil(CONSTANT_BUFFER_ALIGNMENT) * CONSTANT_BUFFER_ALIGNMENT
}

/// Slot usage of one descriptor category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryUsage {
    pub category: DescriptorCategory,
    pub used: u32,
    pub capacity: u32,
}

/// A committed resource with an optional view slot.
pub struct ResourceDescriptor {
    resource: ResourceId,
    view: Option<DescriptorHandle>,
    size: u64,
    retire: Arc<RetireQueue>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl ResourceDescriptor {
    fn new(resource: ResourceId, size: u64, retire: Arc<RetireQueue>) -> Self {
        Self {
            resource,
            view: None,
            size,
            retire,
            on_release: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.resource
    }

    pub fn view(&self) -> Option<&DescriptorHandle> {
        self.view.as_ref()
    }

    /// Heap index of the view, if the resource has one.
    pub fn descriptor_index(&self) -> Option<u32> {
        self.view.as_ref().map(DescriptorHandle::index)
    }

    /// Size in bytes for buffers, zero for textures.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Runs `callback` once the resource has actually been released.
    pub fn with_release_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(callback));
        self
    }
}

impl Drop for ResourceDescriptor {
    fn drop(&mut self) {
        self.retire.retire(Retired::Resource(self.resource));
        if let Some(callback) = self.on_release.take() {
            self.retire.retire(Retired::Callback(callback));
        }
        // `view` drops after this body, so the slot is retired after the resource.
    }
}

/// A sampled texture with its pending upload.
pub struct TextureDescriptor {
    texture: ResourceDescriptor,
    desc: TextureDesc,
    staging: Option<ResourceDescriptor>,
    mip_views: Option<DescriptorHandle>,
    state: ResourceState,
    mips_pending: bool,
}

impl TextureDescriptor {
    #[inline]
    pub fn id(&self) -> ResourceId {
        self.texture.id()
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    /// Heap index of the shader resource view.
    pub fn srv_index(&self) -> u32 {
        self.texture.descriptor_index().unwrap_or(0)
    }

    /// Contiguous per-mip storage views, if mips are generated.
    pub fn mip_views(&self) -> Option<&DescriptorHandle> {
        self.mip_views.as_ref()
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn is_cube_map(&self) -> bool {
        self.desc.dimension == TextureDimension::Cube
    }

    /// True until [`TextureDescriptor::record_upload`] has run.
    pub fn needs_upload(&self) -> bool {
        self.staging.is_some()
    }

    /// True until [`TextureDescriptor::record_mip_generation`] has run.
    pub fn needs_mips(&self) -> bool {
        self.mips_pending
    }

    /// Byte offset of a layer's top mip inside the staging buffer.
    pub fn layer_offset(&self, layer: u32) -> u64 {
        u64::from(layer) * self.desc.mip_size_bytes(0)
    }

    /// Copies tightly packed texels for the top mip of `layer` into the
    /// staging buffer.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] once the upload was recorded, or
    /// [`RhiError::Validation`] if `pixels` has the wrong size.
    pub fn write_layer(&self, resources: &ResourceManager, layer: u32, pixels: &[u8]) -> RhiResult<()> {
        let Some(staging) = &self.staging else {
            return Err(RhiError::InvalidState(format!(
                "texture '{}' already uploaded",
                self.desc.name
            )));
        };
        if layer >= self.desc.array_layers {
            return Err(RhiError::Validation(format!(
                "layer {layer} outside '{}'",
                self.desc.name
            )));
        }
        let expected = self.desc.mip_size_bytes(0);
        if pixels.len() as u64 != expected {
            return Err(RhiError::Validation(format!(
                "'{}' layer needs {expected} bytes, got {}",
                self.desc.name,
                pixels.len()
            )));
        }
        resources.write_buffer(staging, self.layer_offset(layer), pixels)
    }

    /// Records the staging copy into the top mip of every layer. The
    /// staging buffer is retired right away and freed once this frame's
    /// fence value completes.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the upload was already recorded.
    pub fn record_upload(&mut self, list: &mut CommandList) -> RhiResult<()> {
        let Some(staging) = self.staging.take() else {
            return Err(RhiError::InvalidState(format!(
                "texture '{}' uploaded twice",
                self.desc.name
            )));
        };

        list.transition(self.id(), self.state, ResourceState::CopyDest)?;
        self.state = ResourceState::CopyDest;

        for layer in 0..self.desc.array_layers {
            list.copy_buffer_to_texture(staging.id(), self.layer_offset(layer), self.id(), 0, layer)?;
        }

        if !self.mips_pending {
            list.transition(self.id(), ResourceState::CopyDest, ResourceState::PixelShaderResource)?;
            self.state = ResourceState::PixelShaderResource;
        }

        debug!("Recorded upload of '{}'", self.desc.name);
        Ok(())
    }

    /// Records a compute downsample of every mip from the one above it.
    ///
    /// The pipeline receives four root constants: source mip view index,
    /// destination mip view index, destination width and height. Layers
    /// are dispatched along z.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the texture has no mip views,
    /// was not uploaded first, or `pipeline` is not a compute pipeline.
    pub fn record_mip_generation(
        &mut self,
        list: &mut CommandList,
        pipeline: &PipelineBinding,
    ) -> RhiResult<()> {
        let Some(views) = self.mip_views.clone() else {
            return Err(RhiError::InvalidState(format!(
                "texture '{}' has no mip views",
                self.desc.name
            )));
        };
        if self.staging.is_some() || !self.mips_pending {
            return Err(RhiError::InvalidState(format!(
                "mips of '{}' generated out of order",
                self.desc.name
            )));
        }
        if pipeline.kind != crate::pipeline::PipelineKind::Compute {
            return Err(RhiError::InvalidState(
                "mip generation needs a compute pipeline".to_string(),
            ));
        }

        let id = self.id();
        list.transition(id, self.state, ResourceState::UnorderedAccess)?;
        list.set_pipeline_state(pipeline.pipeline)?;
        list.set_root_signature(BindPoint::Compute, pipeline.root_signature)?;

        for mip in 1..self.desc.mip_levels {
            let (width, height) = self.desc.mip_extent(mip);
            let (Some(src), Some(dst)) = (views.at(mip - 1), views.at(mip)) else {
                return Err(RhiError::InvalidState(format!(
                    "mip view {mip} missing on '{}'",
                    self.desc.name
                )));
            };
            list.set_root_constants(BindPoint::Compute, 0, 0, &[src, dst, width, height])?;
            list.dispatch(
                width.div_ceil(MIP_GROUP_SIZE),
                height.div_ceil(MIP_GROUP_SIZE),
                self.desc.array_layers,
            )?;
            // Storage writes of this mip must land before the next reads them.
            list.resource_barrier(&[Barrier::transition(
                id,
                ResourceState::UnorderedAccess,
                ResourceState::UnorderedAccess,
            )])?;
        }

        list.transition(id, ResourceState::UnorderedAccess, ResourceState::PixelShaderResource)?;
        self.state = ResourceState::PixelShaderResource;
        self.mips_pending = false;
        debug!(
            "Recorded {} mip level(s) for '{}'",
            self.desc.mip_levels - 1,
            self.desc.name
        );
        Ok(())
    }
}

/// An offscreen color target with render-target and shader-resource views.
pub struct RenderTarget {
    texture: ResourceDescriptor,
    rtv: DescriptorHandle,
    state: ResourceState,
    width: u32,
    height: u32,
    format: Format,
}

impl RenderTarget {
    #[inline]
    pub fn id(&self) -> ResourceId {
        self.texture.id()
    }

    pub fn rtv_index(&self) -> u32 {
        self.rtv.index()
    }

    pub fn srv_index(&self) -> u32 {
        self.texture.descriptor_index().unwrap_or(0)
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Records a barrier into `after` unless the target is already there.
    pub fn transition(&mut self, list: &mut CommandList, after: ResourceState) -> RhiResult<()> {
        if self.state != after {
            list.transition(self.id(), self.state, after)?;
            self.state = after;
        }
        Ok(())
    }
}

/// Two offscreen targets used as a ping-pong pair.
///
/// Exactly one target is active (written this frame); the other is last
/// (holds the previous frame, read as a texture). Roles are plain indices
/// into the pair and swap once per frame.
pub struct RenderTargetDescriptor {
    targets: [RenderTarget; 2],
    active: usize,
}

impl RenderTargetDescriptor {
    pub fn active(&self) -> &RenderTarget {
        &self.targets[self.active]
    }

    pub fn last(&self) -> &RenderTarget {
        &self.targets[1 - self.active]
    }

    pub fn active_mut(&mut self) -> &mut RenderTarget {
        &mut self.targets[self.active]
    }

    pub fn last_mut(&mut self) -> &mut RenderTarget {
        &mut self.targets[1 - self.active]
    }

    /// Both targets, active first.
    pub fn pair_mut(&mut self) -> (&mut RenderTarget, &mut RenderTarget) {
        let [a, b] = &mut self.targets;
        if self.active == 0 { (a, b) } else { (b, a) }
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Exchanges the active and last roles.
    pub fn swap_active(&mut self) {
        self.active = 1 - self.active;
    }
}

/// Depth texture plus its depth-stencil view.
pub struct DepthBuffer {
    texture: ResourceDescriptor,
    dsv: DescriptorHandle,
    width: u32,
    height: u32,
    format: Format,
}

impl DepthBuffer {
    /// Format used for every depth buffer the manager creates.
    pub const FORMAT: Format = Format::D32Float;

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.texture.id()
    }

    pub fn dsv_index(&self) -> u32 {
        self.dsv.index()
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> Format {
        self.format
    }
}

/// Owner of descriptor heaps and the resources viewed through them.
pub struct ResourceManager {
    device: Arc<dyn GpuDevice>,
    layout: HeapLayout,
    shader_heap: HeapId,
    rtv_heap: HeapId,
    dsv_heap: HeapId,
    sampler_heap: HeapId,
    regions: Vec<RegionAllocator>,
    retire: Arc<RetireQueue>,
}

impl ResourceManager {
    /// Creates the four heaps partitioned by `layout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot create a heap.
    pub fn new(device: Arc<dyn GpuDevice>, layout: HeapLayout) -> RhiResult<Arc<Self>> {
        let heap = |heap_type| device.create_descriptor_heap(&DescriptorHeapDesc { heap_type, layout });
        let shader_heap = heap(DescriptorHeapType::CbvSrvUav)?;
        let rtv_heap = heap(DescriptorHeapType::Rtv)?;
        let dsv_heap = heap(DescriptorHeapType::Dsv)?;
        let sampler_heap = heap(DescriptorHeapType::Sampler)?;

        let regions = DescriptorCategory::ALL
            .iter()
            .map(|&category| RegionAllocator::new(category, layout.range(category)))
            .collect();

        info!(
            "Descriptor heaps: {} constant buffer, {} texture, {} mip, {} RTV, {} DSV, {} sampler slots",
            layout.constant_buffers,
            layout.textures,
            layout.mips,
            layout.render_targets,
            layout.depth_stencils,
            layout.samplers
        );

        Ok(Arc::new(Self {
            device,
            layout,
            shader_heap,
            rtv_heap,
            dsv_heap,
            sampler_heap,
            regions,
            retire: Arc::new(RetireQueue::new()),
        }))
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn heap(&self, heap_type: DescriptorHeapType) -> HeapId {
        match heap_type {
            DescriptorHeapType::CbvSrvUav => self.shader_heap,
            DescriptorHeapType::Rtv => self.rtv_heap,
            DescriptorHeapType::Dsv => self.dsv_heap,
            DescriptorHeapType::Sampler => self.sampler_heap,
        }
    }

    /// Heaps bound for shader access.
    pub fn shader_visible_heaps(&self) -> [HeapId; 2] {
        [self.shader_heap, self.sampler_heap]
    }

    pub fn retire_queue(&self) -> &Arc<RetireQueue> {
        &self.retire
    }

    /// Fence value that work recorded from now on will be signaled with.
    /// Everything dropped afterwards is held until that value completes.
    pub fn set_frame_fence_value(&self, value: u64) {
        self.retire.set_cursor(value);
    }

    fn region(&self, category: DescriptorCategory) -> &RegionAllocator {
        let index = DescriptorCategory::ALL
            .iter()
            .position(|&c| c == category)
            .unwrap_or_default();
        &self.regions[index]
    }

    /// Allocates `count` adjacent slots and fills them with `views`.
    fn allocate_views(
        &self,
        category: DescriptorCategory,
        views: &[ViewDesc],
    ) -> RhiResult<DescriptorHandle> {
        let region = self.region(category);
        let count = views.len() as u32;
        let first = if count == 1 {
            region.allocate()?
        } else {
            region.allocate_contiguous(count)?
        };

        let heap = self.heap(category.heap_type());
        for (i, view) in views.iter().enumerate() {
            if let Err(e) = self.device.write_descriptor(heap, first + i as u32, view) {
                // Never visible to the GPU, so the slots can go back at once.
                region.release(first, count)?;
                return Err(e);
            }
        }

        Ok(DescriptorHandle::new(category, first, count, self.retire.clone()))
    }

    /// Creates a committed buffer without a view.
    ///
    /// # Errors
    ///
    /// Returns the device's allocation error.
    pub fn create_buffer(
        &self,
        name: &str,
        size: u64,
        heap: HeapKind,
        usage: BufferUsage,
    ) -> RhiResult<ResourceDescriptor> {
        let id = self.device.create_buffer(&BufferDesc {
            name: name.to_string(),
            size,
            heap,
            usage,
        })?;
        debug!("Created buffer '{}' ({} bytes, {:?})", name, size, heap);
        Ok(ResourceDescriptor::new(id, size, self.retire.clone()))
    }

    /// Creates an upload-heap buffer with a constant buffer view over all
    /// of it. The size is rounded up to [`CONSTANT_BUFFER_ALIGNMENT`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::HeapExhausted`] when the constant buffer range is
    /// full, or the device's allocation error.
    pub fn create_constant_buffer(&self, name: &str, size: u64) -> RhiResult<ResourceDescriptor> {
        let size = align_constant_size(size);
        let mut buffer = self.create_buffer(name, size, HeapKind::Upload, BufferUsage::CONSTANT)?;
        buffer.view = Some(self.create_constant_buffer_view(buffer.id(), 0, size)?);
        Ok(buffer)
    }

    /// Copies bytes into a CPU-visible buffer.
    pub fn write_buffer(&self, buffer: &ResourceDescriptor, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.device.write_buffer(buffer.id(), offset, data)
    }

    /// Creates a default-heap texture, its staging buffer and its views.
    ///
    /// With `generate_mips` the full mip chain is allocated and a
    /// contiguous range of storage views, one per mip, is reserved in the
    /// mip category. With `is_cube_map` the texture gets six layers and a
    /// cube view.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::HeapExhausted`] if a view range is full, or the
    /// device's allocation error.
    pub fn create_texture(
        &self,
        mut desc: TextureDesc,
        is_cube_map: bool,
        generate_mips: bool,
    ) -> RhiResult<TextureDescriptor> {
        if is_cube_map {
            desc.dimension = TextureDimension::Cube;
            desc.array_layers = 6;
        }
        desc.mip_levels = if generate_mips {
            TextureDesc::full_mip_count(desc.width, desc.height)
        } else {
            1
        };
        desc.usage |= TextureUsage::SAMPLED | TextureUsage::COPY_DST;
        if generate_mips {
            desc.usage |= TextureUsage::STORAGE;
        }
        desc.initial_state = ResourceState::Common;

        let id = self.device.create_texture(&desc)?;
        let mut texture = ResourceDescriptor::new(id, 0, self.retire.clone());
        let dimension = if is_cube_map {
            ViewDimension::TextureCube
        } else {
            ViewDimension::Texture2D
        };
        texture.view = Some(self.create_shader_resource_view(id, dimension, desc.mip_levels)?);

        let mip_views = if generate_mips && desc.mip_levels > 1 {
            Some(self.create_unordered_access_views(id, desc.mip_levels)?)
        } else {
            None
        };

        let staging_size = desc.mip_size_bytes(0) * u64::from(desc.array_layers);
        let staging = self.create_buffer(
            &format!("{} staging", desc.name),
            staging_size,
            HeapKind::Upload,
            BufferUsage::COPY_SRC,
        )?;

        debug!(
            "Created texture '{}' {}x{} ({} mips, {} layers)",
            desc.name, desc.width, desc.height, desc.mip_levels, desc.array_layers
        );

        Ok(TextureDescriptor {
            texture,
            mips_pending: mip_views.is_some(),
            desc,
            staging: Some(staging),
            mip_views,
            state: ResourceState::Common,
        })
    }

    /// Creates a color target that starts in the `RenderTarget` state.
    pub fn create_render_target(
        &self,
        name: &str,
        width: u32,
        height: u32,
        format: Format,
    ) -> RhiResult<RenderTarget> {
        let mut desc = TextureDesc::new_2d(
            name,
            width,
            height,
            format,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        );
        desc.initial_state = ResourceState::RenderTarget;

        let id = self.device.create_texture(&desc)?;
        let mut texture = ResourceDescriptor::new(id, 0, self.retire.clone());
        texture.view = Some(self.create_shader_resource_view(id, ViewDimension::Texture2D, 1)?);
        let rtv = self.create_render_target_view(id)?;

        Ok(RenderTarget {
            texture,
            rtv,
            state: ResourceState::RenderTarget,
            width,
            height,
            format,
        })
    }

    /// Creates the ping-pong pair. Target 0 starts active.
    pub fn create_render_target_pair(
        &self,
        name: &str,
        width: u32,
        height: u32,
        format: Format,
    ) -> RhiResult<RenderTargetDescriptor> {
        let a = self.create_render_target(&format!("{name} A"), width, height, format)?;
        let b = self.create_render_target(&format!("{name} B"), width, height, format)?;
        Ok(RenderTargetDescriptor {
            targets: [a, b],
            active: 0,
        })
    }

    /// Creates a depth buffer in the `DepthWrite` state.
    pub fn create_depth_buffer(&self, width: u32, height: u32) -> RhiResult<DepthBuffer> {
        let mut desc = TextureDesc::new_2d(
            "depth buffer",
            width,
            height,
            DepthBuffer::FORMAT,
            TextureUsage::DEPTH_STENCIL,
        );
        desc.initial_state = ResourceState::DepthWrite;

        let id = self.device.create_texture(&desc)?;
        let texture = ResourceDescriptor::new(id, 0, self.retire.clone());
        let dsv = self.create_depth_stencil_view(id)?;
        debug!("Created depth buffer {}x{}", width, height);

        Ok(DepthBuffer {
            texture,
            dsv,
            width,
            height,
            format: DepthBuffer::FORMAT,
        })
    }

    pub fn create_constant_buffer_view(
        &self,
        resource: ResourceId,
        offset: u64,
        size: u64,
    ) -> RhiResult<DescriptorHandle> {
        self.allocate_views(
            DescriptorCategory::ConstantBuffer,
            &[ViewDesc::ConstantBuffer {
                resource,
                offset,
                size,
            }],
        )
    }

    pub fn create_shader_resource_view(
        &self,
        resource: ResourceId,
        dimension: ViewDimension,
        mip_levels: u32,
    ) -> RhiResult<DescriptorHandle> {
        self.allocate_views(
            DescriptorCategory::Texture,
            &[ViewDesc::ShaderResource {
                resource,
                dimension,
                mip_levels,
            }],
        )
    }

    /// One storage view per mip, in adjacent slots of the mip range.
    pub fn create_unordered_access_views(
        &self,
        resource: ResourceId,
        mip_levels: u32,
    ) -> RhiResult<DescriptorHandle> {
        let views: Vec<ViewDesc> = (0..mip_levels)
            .map(|mip| ViewDesc::UnorderedAccess { resource, mip })
            .collect();
        self.allocate_views(DescriptorCategory::Mip, &views)
    }

    pub fn create_render_target_view(&self, resource: ResourceId) -> RhiResult<DescriptorHandle> {
        self.allocate_views(
            DescriptorCategory::RenderTarget,
            &[ViewDesc::RenderTarget { resource, mip: 0 }],
        )
    }

    pub fn create_depth_stencil_view(&self, resource: ResourceId) -> RhiResult<DescriptorHandle> {
        self.allocate_views(
            DescriptorCategory::DepthStencil,
            &[ViewDesc::DepthStencil { resource }],
        )
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<DescriptorHandle> {
        self.allocate_views(DescriptorCategory::Sampler, &[ViewDesc::Sampler(*desc)])
    }

    fn release(&self, items: Vec<Retired>) -> usize {
        let count = items.len();
        for item in items {
            match item {
                Retired::Descriptor {
                    category,
                    first,
                    count,
                } => {
                    if let Err(e) = self.region(category).release(first, count) {
                        warn!("Descriptor release failed: {e}");
                    }
                }
                Retired::Resource(id) => self.device.destroy_resource(id),
                Retired::Callback(callback) => callback(),
            }
        }
        count
    }

    /// Frees everything retired at or below `completed`. Returns how many
    /// items were released.
    pub fn release_completed(&self, completed: u64) -> usize {
        let released = self.release(self.retire.drain_completed(completed));
        if released > 0 {
            debug!("Released {} retired object(s) up to fence {}", released, completed);
        }
        released
    }

    /// Frees everything retired so far. Call only with the GPU idle.
    pub fn drain_retired(&self) -> usize {
        self.release(self.retire.drain_all())
    }

    /// Slot usage of every category.
    pub fn usage(&self) -> Vec<CategoryUsage> {
        self.regions
            .iter()
            .map(|r| CategoryUsage {
                category: r.category(),
                used: r.used(),
                capacity: r.capacity(),
            })
            .collect()
    }

    pub fn used(&self, category: DescriptorCategory) -> u32 {
        self.region(category).used()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let released = self.drain_retired();
        for heap in [self.shader_heap, self.rtv_heap, self.dsv_heap, self.sampler_heap] {
            self.device.destroy_descriptor_heap(heap);
        }
        info!("Resource manager destroyed ({} late release(s))", released);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::backend::soft::SoftDevice;

    fn manager(layout: HeapLayout) -> (Arc<SoftDevice>, Arc<ResourceManager>) {
        let device = Arc::new(SoftDevice::new());
        let resources = ResourceManager::new(device.clone(), layout).unwrap();
        (device, resources)
    }

    fn small_layout() -> HeapLayout {
        HeapLayout {
            constant_buffers: 2,
            textures: 4,
            mips: 8,
            render_targets: 4,
            depth_stencils: 1,
            samplers: 2,
        }
    }

    #[test]
    fn test_constant_buffer_is_aligned_and_viewed() {
        let (device, resources) = manager(small_layout());
        let cb = resources.create_constant_buffer("camera", 208).unwrap();
        assert_eq!(cb.size(), 256);
        let index = cb.descriptor_index().unwrap();
        assert!(index < 2);
        assert!(matches!(
            device.descriptor(resources.heap(DescriptorHeapType::CbvSrvUav), index),
            Some(ViewDesc::ConstantBuffer { size: 256, .. })
        ));
    }

    #[test]
    fn test_exhaustion_does_not_spill_into_next_category() {
        let (_device, resources) = manager(small_layout());
        let _a = resources.create_constant_buffer("a", 16).unwrap();
        let _b = resources.create_constant_buffer("b", 16).unwrap();
        let Err(err) = resources.create_constant_buffer("c", 16) else {
            panic!("third constant buffer fit in a two-slot range");
        };
        assert!(matches!(
            err,
            RhiError::HeapExhausted {
                category: DescriptorCategory::ConstantBuffer,
                ..
            }
        ));
        assert_eq!(resources.used(DescriptorCategory::Texture), 0);
    }

    #[test]
    fn test_release_waits_for_fence() {
        let (device, resources) = manager(small_layout());
        resources.set_frame_fence_value(3);
        let cb = resources.create_constant_buffer("a", 16).unwrap();
        let id = cb.id();
        drop(cb);

        assert_eq!(resources.used(DescriptorCategory::ConstantBuffer), 1);
        assert!(device.is_live(id));
        assert_eq!(resources.release_completed(2), 0);
        assert_eq!(resources.release_completed(3), 2);
        assert_eq!(resources.used(DescriptorCategory::ConstantBuffer), 0);
        assert!(!device.is_live(id));
    }

    #[test]
    fn test_release_callback_runs_after_resource() {
        let (_device, resources) = manager(small_layout());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let buffer = resources
            .create_buffer("scratch", 64, HeapKind::Upload, BufferUsage::COPY_SRC)
            .unwrap()
            .with_release_callback(move || flag.store(true, Ordering::SeqCst));

        drop(buffer);
        assert!(!fired.load(Ordering::SeqCst));
        resources.drain_retired();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mip_views_are_contiguous() {
        let (_device, resources) = manager(small_layout());
        let desc = TextureDesc::new_2d("albedo", 64, 64, Format::Rgba8Unorm, TextureUsage::SAMPLED);
        let texture = resources.create_texture(desc, false, true).unwrap();

        assert_eq!(texture.desc().mip_levels, 7);
        let views = texture.mip_views().unwrap();
        assert_eq!(views.count(), 7);
        let range = resources.layout().range(DescriptorCategory::Mip);
        assert!(range.contains(&views.index()));
        assert!(range.contains(&(views.index() + 6)));
        assert!(texture.needs_upload());
        assert!(texture.needs_mips());
    }

    #[test]
    fn test_cube_map_has_six_layers() {
        let (device, resources) = manager(small_layout());
        let desc = TextureDesc::new_2d("sky", 16, 16, Format::Rgba8Unorm, TextureUsage::SAMPLED);
        let texture = resources.create_texture(desc, true, false).unwrap();
        assert!(texture.is_cube_map());
        assert_eq!(device.texture_desc(texture.id()).unwrap().array_layers, 6);
        assert!(texture.mip_views().is_none());
    }

    #[test]
    fn test_write_layer_checks_size() {
        let (_device, resources) = manager(small_layout());
        let desc = TextureDesc::new_2d("t", 2, 2, Format::Rgba8Unorm, TextureUsage::SAMPLED);
        let texture = resources.create_texture(desc, false, false).unwrap();
        assert!(texture.write_layer(&resources, 0, &[0; 16]).is_ok());
        assert!(texture.write_layer(&resources, 0, &[0; 15]).is_err());
        assert!(texture.write_layer(&resources, 1, &[0; 16]).is_err());
    }

    #[test]
    fn test_ping_pong_toggles() {
        let (_device, resources) = manager(small_layout());
        let mut pair = resources
            .create_render_target_pair("history", 32, 32, Format::Rgba16Float)
            .unwrap();
        let first_active = pair.active().id();
        let first_last = pair.last().id();
        assert_ne!(first_active, first_last);

        pair.swap_active();
        assert_eq!(pair.active().id(), first_last);
        assert_eq!(pair.last().id(), first_active);

        pair.swap_active();
        assert_eq!(pair.active().id(), first_active);
        assert_eq!(pair.active_index(), 0);
    }

    #[test]
    fn test_failed_view_write_returns_slot() {
        let (_device, resources) = manager(small_layout());
        let buffer = resources
            .create_buffer("vb", 64, HeapKind::Default, BufferUsage::VERTEX)
            .unwrap();
        // A vertex buffer cannot back a constant buffer view.
        assert!(resources.create_constant_buffer_view(buffer.id(), 0, 64).is_err());
        assert_eq!(resources.used(DescriptorCategory::ConstantBuffer), 0);
    }
}
