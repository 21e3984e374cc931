//! Vulkan 1.3 backend.
//!
//! Maps the explicit device interface onto Vulkan:
//! - fences are timeline semaphores, signalled by empty queue submissions
//! - command allocators are command pools handing out reusable buffers
//! - the shader-visible heap is one bindless, update-after-bind descriptor set
//! - render-target and depth-stencil heaps are host tables of image views
//! - root signatures are pipeline layouts with one push-constant block
//!
//! Every queue operation happens under the state lock. Memory comes from
//! `gpu-allocator`, whose own lock is only ever taken after the state lock.

pub mod adapter;
pub mod convert;
pub mod descriptors;
pub mod instance;
pub mod pipeline;
mod recorder;
pub mod swapchain;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use slotmap::SlotMap;
use tracing::{debug, error, info, warn};

use self::adapter::Adapter;
use self::descriptors::{AttachmentView, Heap};
use self::instance::Instance;
use self::pipeline::{Pipeline, RootSignature};
use self::recorder::{PendingLayout, Recorder};
use self::swapchain::{SurfaceContext, WindowChain};
use crate::command::Command;
use crate::descriptor::{DescriptorCategory, DescriptorHeapDesc, DescriptorHeapType, ViewDesc};
use crate::device::{DeviceDesc, GpuDevice, SwapChainDesc};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{PipelineStateDesc, RootSignatureDesc};
use crate::types::{
    AdapterInfo, AllocatorId, Backend, BufferDesc, BufferUsage, FenceId, HeapId, PipelineId,
    ResourceId, ResourceState, RootSignatureId, TextureDesc, TextureDimension, TextureUsage,
};

/// A committed image. Swap chain images are borrowed from the surface and
/// carry no allocation.
pub(crate) struct Image {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub desc: TextureDesc,
    owned: bool,
}

impl Image {
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: convert::aspect(self.desc.format),
            base_mip_level: 0,
            level_count: self.desc.mip_levels,
            base_array_layer: 0,
            layer_count: self.desc.array_layers,
        }
    }
}

pub(crate) enum Resource {
    Buffer {
        buffer: vk::Buffer,
        allocation: Option<Allocation>,
        desc: BufferDesc,
    },
    Texture(Image),
}

/// Objects commands refer to.
#[derive(Default)]
pub(crate) struct Objects {
    resources: SlotMap<ResourceId, Resource>,
    heaps: SlotMap<HeapId, Heap>,
    root_signatures: SlotMap<RootSignatureId, RootSignature>,
    pipelines: SlotMap<PipelineId, Pipeline>,
}

impl Objects {
    pub fn resource(&self, id: ResourceId) -> RhiResult<&Resource> {
        self.resources
            .get(id)
            .ok_or_else(|| RhiError::InvalidHandle(format!("resource {id:?}")))
    }

    pub fn buffer(&self, id: ResourceId) -> RhiResult<vk::Buffer> {
        match self.resource(id)? {
            Resource::Buffer { buffer, .. } => Ok(*buffer),
            Resource::Texture(_) => Err(RhiError::Validation(format!(
                "resource {id:?} is a texture, a buffer was expected"
            ))),
        }
    }

    pub fn heap(&self, id: HeapId) -> RhiResult<&Heap> {
        self.heaps
            .get(id)
            .ok_or_else(|| RhiError::InvalidHandle(format!("heap {id:?}")))
    }

    fn heap_of_type(&self, heap_type: DescriptorHeapType) -> Option<&Heap> {
        self.heaps.values().find(|h| h.heap_type() == heap_type)
    }

    pub fn attachment(&self, heap_type: DescriptorHeapType, index: u32) -> RhiResult<AttachmentView> {
        self.heap_of_type(heap_type)
            .and_then(|h| h.attachment(index))
            .ok_or_else(|| RhiError::InvalidHandle(format!("{heap_type:?} slot {index} is empty")))
    }

    pub fn root_signature(&self, id: RootSignatureId) -> RhiResult<&RootSignature> {
        self.root_signatures
            .get(id)
            .ok_or_else(|| RhiError::InvalidHandle(format!("root signature {id:?}")))
    }

    pub fn pipeline(&self, id: PipelineId) -> RhiResult<&Pipeline> {
        self.pipelines
            .get(id)
            .ok_or_else(|| RhiError::InvalidHandle(format!("pipeline {id:?}")))
    }
}

struct CommandPool {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next: usize,
    /// Submission serial of the last buffer executed from this pool.
    last_serial: u64,
}

enum Presenter {
    Window {
        chain: WindowChain,
        buffers: Vec<ResourceId>,
    },
    /// Offscreen back buffers rotated on present.
    Headless {
        desc: SwapChainDesc,
        buffers: Vec<ResourceId>,
        current: u32,
    },
}

impl Presenter {
    fn buffers(&self) -> &[ResourceId] {
        match self {
            Self::Window { buffers, .. } | Self::Headless { buffers, .. } => buffers,
        }
    }
}

#[derive(Default)]
struct State {
    objects: Objects,
    fences: SlotMap<FenceId, vk::Semaphore>,
    allocators: SlotMap<AllocatorId, CommandPool>,
    presenter: Option<Presenter>,
    pending_layouts: Vec<PendingLayout>,
    submission_serial: u64,
}

pub struct VulkanDevice {
    state: Mutex<State>,
    allocator: Mutex<Option<Allocator>>,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    /// Timeline advanced by every `execute`, used to check pool resets.
    submissions: vk::Semaphore,
    surface: Option<SurfaceContext>,
    adapter: Adapter,
    shader_dir: PathBuf,
    /// Only held so the instance outlives everything created from it; it is
    /// the last field and drops last.
    _instance: Instance,
}

impl VulkanDevice {
    /// Creates the instance, picks an adapter and opens a logical device on
    /// its graphics queue.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::NoSuitableGpu`] if no adapter supports Vulkan 1.3
    /// with timeline semaphores, bindless descriptors and dynamic rendering.
    pub fn new(desc: &DeviceDesc) -> RhiResult<Arc<Self>> {
        let instance = Instance::new(desc.enable_validation, desc.window.map(|w| w.display))?;
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let surface = desc
            .window
            .as_ref()
            .map(|w| instance.create_surface(w))
            .transpose()?;

        let adapter = adapter::select_adapter(
            instance.handle(),
            surface.map(|s| (&surface_loader, s)),
            desc.use_software_adapter,
        )?;

        let has_swapchain = Self::supports_swapchain(instance.handle(), adapter.device)?;
        if surface.is_some() && !has_swapchain {
            return Err(RhiError::NoSuitableGpu);
        }
        let extensions: Vec<*const std::ffi::c_char> = if has_swapchain {
            vec![ash::khr::swapchain::NAME.as_ptr()]
        } else {
            warn!("Adapter has no swap chain support, back buffers stay offscreen");
            Vec::new()
        };

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(adapter.queue_family)
            .queue_priorities(&priorities)];

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_uniform_buffer_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true);
        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features_1_2)
            .push_next(&mut features_1_3);
        let device = unsafe {
            instance
                .handle()
                .create_device(adapter.device, &create_info, None)?
        };
        let queue = unsafe { device.get_device_queue(adapter.queue_family, 0) };
        info!(
            "Logical device created on queue family {} ({} extension(s))",
            adapter.queue_family,
            extensions.len()
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: adapter.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        debug!("GPU memory allocator initialized");

        let submissions = create_timeline(&device, 0)?;

        let surface = match surface {
            Some(surface) => Some(SurfaceContext {
                surface_loader,
                surface,
                swapchain_loader: ash::khr::swapchain::Device::new(instance.handle(), &device),
                physical_device: adapter.device,
            }),
            None => None,
        };

        Ok(Arc::new(Self {
            state: Mutex::new(State::default()),
            allocator: Mutex::new(Some(allocator)),
            device,
            queue,
            queue_family: adapter.queue_family,
            submissions,
            surface,
            adapter,
            shader_dir: desc.shader_dir.clone(),
            _instance: instance,
        }))
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> RhiResult<bool> {
        let available = unsafe { instance.enumerate_device_extension_properties(device)? };
        Ok(available.iter().any(|ext| {
            ext.extension_name_as_c_str()
                .is_ok_and(|name| name == ash::khr::swapchain::NAME)
        }))
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> RhiResult<Allocation> {
        let mut guard = self.allocator.lock();
        let allocator = guard
            .as_mut()
            .ok_or_else(|| RhiError::InvalidState("memory allocator already shut down".to_string()))?;
        Ok(allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut()
            && let Err(e) = allocator.free(allocation)
        {
            error!("Failed to free allocation: {:?}", e);
        }
    }

    /// Creates and binds an image; its layout is initialized by the next
    /// submission.
    fn create_image(&self, desc: &TextureDesc) -> RhiResult<(Image, PendingLayout)> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(RhiError::Validation(format!(
                "texture '{}' has an empty extent",
                desc.name
            )));
        }

        let flags = match desc.dimension {
            TextureDimension::Cube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            TextureDimension::D2 => vk::ImageCreateFlags::empty(),
        };
        let info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::texture_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocate(&desc.name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        let image = Image {
            image,
            allocation: Some(allocation),
            desc: desc.clone(),
            owned: true,
        };
        let pending = PendingLayout {
            image: image.image,
            range: image.full_range(),
            layout: convert::state_sync(desc.initial_state).layout,
        };
        Ok((image, pending))
    }

    /// Removes a resource and every view of it. Returns its allocation for
    /// the caller to free once the state lock is released.
    fn remove_resource(&self, state: &mut State, id: ResourceId) -> Option<Allocation> {
        let resource = state.objects.resources.remove(id)?;
        for heap in state.objects.heaps.values_mut() {
            heap.forget_resource(&self.device, id);
        }
        match resource {
            Resource::Buffer {
                buffer, allocation, ..
            } => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                allocation
            }
            Resource::Texture(image) => {
                state.pending_layouts.retain(|p| p.image != image.image);
                if image.owned {
                    unsafe { self.device.destroy_image(image.image, None) };
                }
                image.allocation
            }
        }
    }

    fn back_buffer_desc(index: usize, width: u32, height: u32, format: crate::types::Format) -> TextureDesc {
        TextureDesc {
            initial_state: ResourceState::Present,
            ..TextureDesc::new_2d(
                format!("back buffer {index}"),
                width,
                height,
                format,
                TextureUsage::RENDER_TARGET | TextureUsage::COPY_DST,
            )
        }
    }

    /// Registers the swap chain's images as texture resources.
    fn adopt_window_images(state: &mut State, chain: &WindowChain) -> Vec<ResourceId> {
        chain
            .images
            .iter()
            .enumerate()
            .map(|(i, &image)| {
                let desc = Self::back_buffer_desc(i, chain.extent.width, chain.extent.height, chain.format);
                let image = Image {
                    image,
                    allocation: None,
                    desc,
                    owned: false,
                };
                state.pending_layouts.push(PendingLayout {
                    image: image.image,
                    range: image.full_range(),
                    layout: vk::ImageLayout::PRESENT_SRC_KHR,
                });
                state.objects.resources.insert(Resource::Texture(image))
            })
            .collect()
    }

    fn create_offscreen_buffers(&self, state: &mut State, desc: &SwapChainDesc) -> RhiResult<Vec<ResourceId>> {
        let mut buffers = Vec::with_capacity(desc.buffer_count as usize);
        for i in 0..desc.buffer_count as usize {
            let texture = Self::back_buffer_desc(i, desc.width, desc.height, desc.format);
            let (image, pending) = self.create_image(&texture)?;
            state.pending_layouts.push(pending);
            buffers.push(state.objects.resources.insert(Resource::Texture(image)));
        }
        Ok(buffers)
    }

    fn completed_submissions(&self) -> RhiResult<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(self.submissions)? })
    }

    fn surface(&self) -> RhiResult<&SurfaceContext> {
        self.surface
            .as_ref()
            .ok_or_else(|| RhiError::Swapchain("device has no surface".to_string()))
    }
}

fn create_timeline(device: &ash::Device, initial_value: u64) -> RhiResult<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    Ok(unsafe { device.create_semaphore(&info, None)? })
}

impl GpuDevice for VulkanDevice {
    fn backend(&self) -> Backend {
        Backend::Vulkan
    }

    fn adapter(&self) -> &AdapterInfo {
        &self.adapter.info
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<ResourceId> {
        if desc.size == 0 {
            return Err(RhiError::Validation(format!("buffer '{}' has size 0", desc.name)));
        }

        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(convert::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(&desc.name, requirements, convert::memory_location(desc.heap), true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        debug!("Created buffer '{}': {} bytes in {:?}", desc.name, desc.size, desc.heap);
        Ok(self.state.lock().objects.resources.insert(Resource::Buffer {
            buffer,
            allocation: Some(allocation),
            desc: desc.clone(),
        }))
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<ResourceId> {
        let (image, pending) = self.create_image(desc)?;
        debug!(
            "Created texture '{}': {}x{}, {} mip(s), {} layer(s)",
            desc.name, desc.width, desc.height, desc.mip_levels, desc.array_layers
        );

        let mut state = self.state.lock();
        state.pending_layouts.push(pending);
        Ok(state.objects.resources.insert(Resource::Texture(image)))
    }

    fn write_buffer(&self, buffer: ResourceId, offset: u64, data: &[u8]) -> RhiResult<()> {
        let state = self.state.lock();
        let Resource::Buffer {
            allocation, desc, ..
        } = state.objects.resource(buffer)?
        else {
            return Err(RhiError::Validation(format!("resource {buffer:?} is not a buffer")));
        };

        let end = offset + data.len() as u64;
        if end > desc.size {
            return Err(RhiError::Validation(format!(
                "write of {} bytes at {} overruns buffer '{}' ({} bytes)",
                data.len(),
                offset,
                desc.name,
                desc.size
            )));
        }
        let mapped = allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| RhiError::Validation(format!("buffer '{}' is not CPU visible", desc.name)))?;

        unsafe {
            let dst = mapped.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    fn destroy_resource(&self, resource: ResourceId) {
        let allocation = {
            let mut state = self.state.lock();
            self.remove_resource(&mut state, resource)
        };
        if let Some(allocation) = allocation {
            self.free(allocation);
        }
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> RhiResult<HeapId> {
        let heap = Heap::new(&self.device, desc.heap_type, desc.layout)?;
        debug!(
            "Created {:?} heap with {} slot(s)",
            desc.heap_type,
            desc.layout.heap_capacity(desc.heap_type)
        );
        Ok(self.state.lock().objects.heaps.insert(heap))
    }

    fn write_descriptor(&self, heap: HeapId, index: u32, view: &ViewDesc) -> RhiResult<()> {
        let mut state = self.state.lock();
        let Objects {
            resources, heaps, ..
        } = &mut state.objects;
        let target = heaps
            .get_mut(heap)
            .ok_or_else(|| RhiError::InvalidHandle(format!("heap {heap:?}")))?;

        let heap_type = target.heap_type();
        if !DescriptorCategory::ALL
            .iter()
            .any(|&c| c.heap_type() == heap_type && view.fits(c))
        {
            return Err(RhiError::Validation(format!(
                "{view:?} cannot be written into a {heap_type:?} heap"
            )));
        }

        let resource = match view.resource() {
            Some(id) => Some((
                id,
                resources
                    .get(id)
                    .ok_or_else(|| RhiError::InvalidHandle(format!("resource {id:?}")))?,
            )),
            None => None,
        };

        match (view, resource) {
            (ViewDesc::Sampler(desc), _) => target.write_sampler(&self.device, index, desc),
            (
                ViewDesc::ConstantBuffer { offset, size, .. },
                Some((id, Resource::Buffer { buffer, desc, .. })),
            ) => {
                if !desc.usage.contains(BufferUsage::CONSTANT) || offset + size > desc.size {
                    return Err(RhiError::Validation(format!(
                        "buffer '{}' cannot back a {size}-byte constant view at {offset}",
                        desc.name
                    )));
                }
                target.write_constant_buffer(&self.device, index, id, *buffer, *offset, *size)
            }
            (
                ViewDesc::ShaderResource { .. } | ViewDesc::UnorderedAccess { .. },
                Some((id, Resource::Texture(image))),
            ) => target.write_image(&self.device, index, id, image.image, &image.desc, view),
            (ViewDesc::RenderTarget { mip, .. }, Some((id, Resource::Texture(image)))) => {
                target.write_attachment(&self.device, index, id, image.image, &image.desc, *mip)
            }
            (ViewDesc::DepthStencil { .. }, Some((id, Resource::Texture(image)))) => {
                if !image.desc.format.is_depth() {
                    return Err(RhiError::Validation(format!(
                        "texture '{}' has no depth format",
                        image.desc.name
                    )));
                }
                target.write_attachment(&self.device, index, id, image.image, &image.desc, 0)
            }
            _ => Err(RhiError::Validation(format!(
                "{view:?} does not match the kind of its resource"
            ))),
        }
    }

    fn destroy_descriptor_heap(&self, heap: HeapId) {
        if let Some(heap) = self.state.lock().objects.heaps.remove(heap) {
            heap.destroy(&self.device);
        }
    }

    /// Root signatures are laid out over the shader-visible heaps, so those
    /// heaps must exist first.
    fn create_root_signature(&self, desc: &RootSignatureDesc) -> RhiResult<RootSignatureId> {
        let mut state = self.state.lock();
        let set_layouts: Vec<vk::DescriptorSetLayout> =
            [DescriptorHeapType::CbvSrvUav, DescriptorHeapType::Sampler]
                .into_iter()
                .filter_map(|t| state.objects.heap_of_type(t).and_then(|h| h.set_layout()))
                .collect();
        if set_layouts.len() != 2 {
            return Err(RhiError::InvalidState(format!(
                "root signature '{}' created before the shader-visible heaps",
                desc.name
            )));
        }

        let root = pipeline::create_root_signature(&self.device, desc, &set_layouts)?;
        Ok(state.objects.root_signatures.insert(root))
    }

    fn create_pipeline_state(
        &self,
        desc: &PipelineStateDesc,
        root_signature: RootSignatureId,
    ) -> RhiResult<PipelineId> {
        let mut state = self.state.lock();
        let layout = state.objects.root_signature(root_signature)?.layout;
        let pipeline = pipeline::create_pipeline(&self.device, &self.shader_dir, desc, layout)?;
        Ok(state.objects.pipelines.insert(pipeline))
    }

    fn destroy_pipeline_state(&self, pipeline: PipelineId) {
        if let Some(p) = self.state.lock().objects.pipelines.remove(pipeline) {
            unsafe { self.device.destroy_pipeline(p.pipeline, None) };
        }
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        if let Some(r) = self.state.lock().objects.root_signatures.remove(root_signature) {
            unsafe { self.device.destroy_pipeline_layout(r.layout, None) };
        }
    }

    fn create_command_allocator(&self) -> RhiResult<AllocatorId> {
        let info = vk::CommandPoolCreateInfo::default().queue_family_index(self.queue_family);
        let pool = unsafe { self.device.create_command_pool(&info, None)? };
        Ok(self.state.lock().allocators.insert(CommandPool {
            pool,
            buffers: Vec::new(),
            next: 0,
            last_serial: 0,
        }))
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> RhiResult<()> {
        let completed = self.completed_submissions()?;
        let mut state = self.state.lock();
        let pool = state
            .allocators
            .get_mut(allocator)
            .ok_or_else(|| RhiError::InvalidHandle(format!("allocator {allocator:?}")))?;
        if pool.last_serial > completed {
            return Err(RhiError::Validation(format!(
                "allocator {allocator:?} reset while submission {} is executing (completed {completed})",
                pool.last_serial
            )));
        }

        unsafe {
            self.device
                .reset_command_pool(pool.pool, vk::CommandPoolResetFlags::empty())?;
        }
        pool.next = 0;
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        if let Some(pool) = self.state.lock().allocators.remove(allocator) {
            unsafe { self.device.destroy_command_pool(pool.pool, None) };
        }
    }

    fn execute(&self, allocator: AllocatorId, commands: &[Command]) -> RhiResult<()> {
        let mut state = self.state.lock();
        let State {
            objects,
            allocators,
            presenter,
            pending_layouts,
            submission_serial,
            ..
        } = &mut *state;

        let pool = allocators
            .get_mut(allocator)
            .ok_or_else(|| RhiError::InvalidHandle(format!("allocator {allocator:?}")))?;
        if pool.next == pool.buffers.len() {
            let info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
            pool.buffers.extend(buffers);
        }
        let cb = pool.buffers[pool.next];
        pool.next += 1;

        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cb, &begin)? };
        recorder::initialize_layouts(&self.device, cb, pending_layouts);
        let recorded = Recorder::new(&self.device, objects, cb).record(commands);
        unsafe { self.device.end_command_buffer(cb)? };
        recorded?;

        let wait = match presenter {
            Some(Presenter::Window { chain, .. }) => chain.take_wait(),
            _ => None,
        };
        let waits: Vec<vk::SemaphoreSubmitInfo> = wait
            .map(|s| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(s)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .into_iter()
            .collect();
        let serial = *submission_serial + 1;
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.submissions)
            .value(serial)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cb)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&buffers)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], vk::Fence::null())?;
        }

        pending_layouts.clear();
        *submission_serial = serial;
        pool.last_serial = serial;
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<FenceId> {
        let semaphore = create_timeline(&self.device, initial_value)?;
        Ok(self.state.lock().fences.insert(semaphore))
    }

    fn signal(&self, fence: FenceId, value: u64) -> RhiResult<()> {
        let state = self.state.lock();
        let semaphore = *state
            .fences
            .get(fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {fence:?}")))?;

        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(&signals);
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], vk::Fence::null())?;
        }
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> RhiResult<u64> {
        let semaphore = *self
            .state
            .lock()
            .fences
            .get(fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {fence:?}")))?;
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn wait_for_value(&self, fence: FenceId, value: u64, timeout: Duration) -> RhiResult<bool> {
        let semaphore = *self
            .state
            .lock()
            .fences
            .get(fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {fence:?}")))?;

        let semaphores = [semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_semaphores(&info, nanos) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RhiError::DeviceLost(format!(
                "device lost while waiting for fence value {value}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn destroy_fence(&self, fence: FenceId) {
        if let Some(semaphore) = self.state.lock().fences.remove(fence) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_swap_chain(&self, desc: &SwapChainDesc) -> RhiResult<Vec<ResourceId>> {
        let mut state = self.state.lock();
        if state.presenter.is_some() {
            return Err(RhiError::Swapchain("swap chain already exists".to_string()));
        }

        let presenter = match self.surface.as_ref() {
            Some(ctx) => {
                let chain = WindowChain::new(&self.device, ctx, desc, vk::SwapchainKHR::null())?;
                let buffers = Self::adopt_window_images(&mut state, &chain);
                Presenter::Window { chain, buffers }
            }
            None => {
                let buffers = self.create_offscreen_buffers(&mut state, desc)?;
                info!(
                    "Offscreen swap chain {}x{} with {} buffers",
                    desc.width, desc.height, desc.buffer_count
                );
                Presenter::Headless {
                    desc: *desc,
                    buffers,
                    current: 0,
                }
            }
        };

        let buffers = presenter.buffers().to_vec();
        state.presenter = Some(presenter);
        Ok(buffers)
    }

    fn resize_swap_chain(&self, width: u32, height: u32) -> RhiResult<Vec<ResourceId>> {
        let completed = self.completed_submissions()?;
        let mut state = self.state.lock();
        if completed < state.submission_serial {
            return Err(RhiError::Validation(format!(
                "swap chain resized while submission {} is executing",
                state.submission_serial
            )));
        }
        let Some(old) = state.presenter.take() else {
            return Err(RhiError::Swapchain("no swap chain to resize".to_string()));
        };

        let mut freed = Vec::new();
        for &id in old.buffers() {
            freed.extend(self.remove_resource(&mut state, id));
        }

        let result = match old {
            Presenter::Window { chain, .. } => {
                let ctx = self.surface()?;
                let desc = SwapChainDesc {
                    width,
                    height,
                    buffer_count: chain.images.len() as u32,
                    format: chain.format,
                };
                let created = WindowChain::new(&self.device, ctx, &desc, chain.handle());
                chain.destroy(&self.device, ctx, true);
                created.map(|chain| {
                    let buffers = Self::adopt_window_images(&mut state, &chain);
                    Presenter::Window { chain, buffers }
                })
            }
            Presenter::Headless { desc, .. } => {
                let desc = SwapChainDesc {
                    width,
                    height,
                    ..desc
                };
                self.create_offscreen_buffers(&mut state, &desc)
                    .map(|buffers| Presenter::Headless {
                        desc,
                        buffers,
                        current: 0,
                    })
            }
        };

        let buffers = result.map(|presenter| {
            let buffers = presenter.buffers().to_vec();
            state.presenter = Some(presenter);
            buffers
        });
        drop(state);
        for allocation in freed {
            self.free(allocation);
        }
        debug!("Swap chain resized to {}x{}", width, height);
        buffers
    }

    fn current_back_buffer_index(&self) -> RhiResult<u32> {
        let mut state = self.state.lock();
        match state.presenter.as_mut() {
            Some(Presenter::Window { chain, .. }) => chain.current_index(self.surface()?),
            Some(Presenter::Headless { current, .. }) => Ok(*current),
            None => Err(RhiError::Swapchain("no swap chain".to_string())),
        }
    }

    fn present(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        match state.presenter.as_mut() {
            Some(Presenter::Window { chain, .. }) => {
                chain.present(&self.device, self.surface()?, self.queue)?;
                Ok(())
            }
            Some(Presenter::Headless {
                buffers, current, ..
            }) => {
                *current = (*current + 1) % buffers.len() as u32;
                Ok(())
            }
            None => Err(RhiError::Swapchain("present without a swap chain".to_string())),
        }
    }

    fn destroy_swap_chain(&self) {
        let mut state = self.state.lock();
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            warn!("Wait before swap chain destruction failed: {:?}", e);
        }
        let Some(presenter) = state.presenter.take() else {
            return;
        };

        let mut freed = Vec::new();
        for &id in presenter.buffers() {
            freed.extend(self.remove_resource(&mut state, id));
        }
        if let (Presenter::Window { chain, .. }, Some(ctx)) = (presenter, self.surface.as_ref()) {
            chain.destroy(&self.device, ctx, true);
        }
        drop(state);
        for allocation in freed {
            self.free(allocation);
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let _state = self.state.lock();
        unsafe { self.device.queue_wait_idle(self.queue)? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Device wait before teardown failed: {:?}", e);
            }
        }

        let state = std::mem::take(&mut *self.state.lock());
        let mut freed = Vec::new();

        if let Some(Presenter::Window { chain, .. }) = state.presenter
            && let Some(ctx) = self.surface.as_ref()
        {
            chain.destroy(&self.device, ctx, true);
        }

        unsafe {
            for (_, resource) in state.objects.resources {
                match resource {
                    Resource::Buffer {
                        buffer, allocation, ..
                    } => {
                        self.device.destroy_buffer(buffer, None);
                        freed.extend(allocation);
                    }
                    Resource::Texture(image) => {
                        if image.owned {
                            self.device.destroy_image(image.image, None);
                        }
                        freed.extend(image.allocation);
                    }
                }
            }
            for (_, heap) in state.objects.heaps {
                heap.destroy(&self.device);
            }
            for (_, pipeline) in state.objects.pipelines {
                self.device.destroy_pipeline(pipeline.pipeline, None);
            }
            for (_, root) in state.objects.root_signatures {
                self.device.destroy_pipeline_layout(root.layout, None);
            }
            for (_, pool) in state.allocators {
                self.device.destroy_command_pool(pool.pool, None);
            }
            for (_, semaphore) in state.fences {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.device.destroy_semaphore(self.submissions, None);
        }

        for allocation in freed {
            self.free(allocation);
        }
        // The allocator releases its memory blocks through the device.
        drop(self.allocator.lock().take());

        unsafe {
            self.device.destroy_device(None);
            if let Some(ctx) = self.surface.as_ref() {
                ctx.surface_loader.destroy_surface(ctx.surface, None);
            }
        }
        info!("Vulkan device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_device_creation() {
        // Skip on machines without a Vulkan 1.3 driver.
        let Ok(device) = VulkanDevice::new(&DeviceDesc::default()) else {
            return;
        };
        assert_eq!(device.backend(), Backend::Vulkan);
        assert!(!device.adapter().name.is_empty());
    }

    #[test]
    fn test_headless_fence_round_trip() {
        let Ok(device) = VulkanDevice::new(&DeviceDesc::default()) else {
            return;
        };
        let fence = device.create_fence(0).unwrap();
        device.signal(fence, 3).unwrap();
        assert!(device.wait_for_value(fence, 3, Duration::from_secs(5)).unwrap());
        assert_eq!(device.completed_value(fence).unwrap(), 3);
        device.destroy_fence(fence);
    }
}
