//! Device and adapter provider.
//!
//! [`GpuDevice`] is the hardware interface the rest of the engine is written
//! against. It is object safe and shared as `Arc<dyn GpuDevice>`; every
//! higher-level wrapper in this crate (fences, queues, the resource
//! manager, the swap surface) holds one and forwards to it.
//!
//! # Example
//!
//! ```no_run
//! use ember_rhi::device::{create_device, DeviceDesc};
//! use ember_rhi::types::Backend;
//!
//! let device = create_device(&DeviceDesc {
//!     backend: Backend::Vulkan,
//!     use_software_adapter: true,
//!     ..Default::default()
//! })
//! .expect("no device");
//! println!("running on {}", device.adapter().name);
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::info;

use crate::backend::soft::SoftDevice;
use crate::backend::vulkan::VulkanDevice;
use crate::command::Command;
use crate::descriptor::{DescriptorHeapDesc, ViewDesc};
use crate::error::RhiResult;
use crate::pipeline::{PipelineStateDesc, RootSignatureDesc};
use crate::types::{
    AdapterInfo, AllocatorId, Backend, BufferDesc, FenceId, Format, HeapId, PipelineId,
    ResourceId, RootSignatureId, TextureDesc,
};

/// Native handles of the window a device presents to.
#[derive(Debug, Clone, Copy)]
pub struct WindowHandles {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// Device creation parameters.
#[derive(Debug, Clone, Default)]
pub struct DeviceDesc {
    pub backend: Backend,
    /// Prefer a CPU rasterizer over hardware adapters.
    pub use_software_adapter: bool,
    pub enable_validation: bool,
    /// Where compiled shaders are looked up.
    pub shader_dir: PathBuf,
    /// Presentation target; `None` creates an offscreen swap chain.
    pub window: Option<WindowHandles>,
}

/// Swap chain creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub format: Format,
}

/// The explicit GPU interface.
///
/// Objects are named by keys from [`crate::types`]. Destroy calls on keys
/// that are already gone are ignored; every other call on a dead key fails
/// with `InvalidHandle`.
pub trait GpuDevice: Send + Sync {
    fn backend(&self) -> Backend;

    fn adapter(&self) -> &AdapterInfo;

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<ResourceId>;

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<ResourceId>;

    /// Copies `data` into a CPU-visible buffer.
    fn write_buffer(&self, buffer: ResourceId, offset: u64, data: &[u8]) -> RhiResult<()>;

    fn destroy_resource(&self, resource: ResourceId);

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> RhiResult<HeapId>;

    fn write_descriptor(&self, heap: HeapId, index: u32, view: &ViewDesc) -> RhiResult<()>;

    fn destroy_descriptor_heap(&self, heap: HeapId);

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> RhiResult<RootSignatureId>;

    fn create_pipeline_state(
        &self,
        desc: &PipelineStateDesc,
        root_signature: RootSignatureId,
    ) -> RhiResult<PipelineId>;

    fn destroy_pipeline_state(&self, pipeline: PipelineId);

    fn destroy_root_signature(&self, root_signature: RootSignatureId);

    fn create_command_allocator(&self) -> RhiResult<AllocatorId>;

    /// Recycles an allocator's memory. Fails if work recorded from it may
    /// still be executing.
    fn reset_command_allocator(&self, allocator: AllocatorId) -> RhiResult<()>;

    fn destroy_command_allocator(&self, allocator: AllocatorId);

    /// Submits a closed command list recorded from `allocator`.
    fn execute(&self, allocator: AllocatorId, commands: &[Command]) -> RhiResult<()>;

    fn create_fence(&self, initial_value: u64) -> RhiResult<FenceId>;

    /// Queues a GPU-side write of `value` after all previously submitted work.
    fn signal(&self, fence: FenceId, value: u64) -> RhiResult<()>;

    fn completed_value(&self, fence: FenceId) -> RhiResult<u64>;

    /// Blocks until the fence reaches `value`. Returns `false` on timeout.
    fn wait_for_value(&self, fence: FenceId, value: u64, timeout: Duration) -> RhiResult<bool>;

    fn destroy_fence(&self, fence: FenceId);

    /// Creates the swap chain and returns its back buffers in index order.
    fn create_swap_chain(&self, desc: &SwapChainDesc) -> RhiResult<Vec<ResourceId>>;

    /// Recreates the back buffers at a new size. The old ids become invalid.
    fn resize_swap_chain(&self, width: u32, height: u32) -> RhiResult<Vec<ResourceId>>;

    fn current_back_buffer_index(&self) -> RhiResult<u32>;

    /// Queues the current back buffer for display without waiting for vsync.
    fn present(&self) -> RhiResult<()>;

    fn destroy_swap_chain(&self);

    /// Blocks until every submitted command has finished.
    fn wait_idle(&self) -> RhiResult<()>;
}

/// Selects an adapter and creates a device on the requested backend.
///
/// # Errors
///
/// Returns [`crate::RhiError::NoSuitableGpu`] if no adapter qualifies, or the
/// backend's own error if initialization fails. All of these are fatal.
pub fn create_device(desc: &DeviceDesc) -> RhiResult<Arc<dyn GpuDevice>> {
    let device: Arc<dyn GpuDevice> = match desc.backend {
        Backend::Soft => Arc::new(SoftDevice::new()),
        Backend::Vulkan => VulkanDevice::new(desc)?,
    };

    let adapter = device.adapter();
    info!(
        "Device ready on {:?} backend: {} ({:?}, {})",
        device.backend(),
        adapter.name,
        adapter.kind,
        adapter.api_version
    );

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_device_is_object_safe() {
        fn takes(_: &dyn GpuDevice) {}
        let device = SoftDevice::new();
        takes(&device);
    }

    #[test]
    fn test_create_soft_device() {
        let device = create_device(&DeviceDesc {
            backend: Backend::Soft,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(device.backend(), Backend::Soft);
        assert!(device.adapter().is_software());
    }
}
