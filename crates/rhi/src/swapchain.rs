//! Swap presentation surface.
//!
//! [`SwapSurface`] owns the device's back buffers together with one render
//! target view each. The device creates and destroys the buffers; the
//! surface keeps their views in step with them across resizes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::device::SwapChainDesc;
//! use ember_rhi::resource::ResourceManager;
//! use ember_rhi::swapchain::SwapSurface;
//! use ember_rhi::types::Format;
//!
//! # fn example(resources: Arc<ResourceManager>) -> ember_rhi::RhiResult<()> {
//! let mut surface = SwapSurface::new(
//!     resources,
//!     SwapChainDesc { width: 1280, height: 720, buffer_count: 2, format: Format::Bgra8Unorm },
//! )?;
//! let index = surface.current_back_buffer_index()?;
//! let rtv = surface.back_buffer(index).map(|b| b.rtv_index());
//! // ... record and submit ...
//! surface.present()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::descriptor::DescriptorHandle;
use crate::device::SwapChainDesc;
use crate::error::{RhiError, RhiResult};
use crate::resource::ResourceManager;
use crate::types::{Format, ResourceId};

/// One presentable image and its render target view.
pub struct BackBuffer {
    resource: ResourceId,
    rtv: DescriptorHandle,
}

impl BackBuffer {
    #[inline]
    pub fn id(&self) -> ResourceId {
        self.resource
    }

    #[inline]
    pub fn rtv_index(&self) -> u32 {
        self.rtv.index()
    }
}

/// Presentable back buffers.
pub struct SwapSurface {
    resources: Arc<ResourceManager>,
    desc: SwapChainDesc,
    buffers: Vec<BackBuffer>,
    presents: u64,
}

impl SwapSurface {
    /// Creates the device swap chain and a render target view per buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the swap chain cannot be created or the
    /// render-target heap is full.
    pub fn new(resources: Arc<ResourceManager>, desc: SwapChainDesc) -> RhiResult<Self> {
        if desc.buffer_count == 0 {
            return Err(RhiError::Swapchain("swap chain needs at least one buffer".to_string()));
        }
        let ids = resources.device().create_swap_chain(&desc)?;
        let buffers = Self::create_views(&resources, &ids)?;
        info!(
            "Swap surface {}x{} with {} back buffers",
            desc.width,
            desc.height,
            buffers.len()
        );

        Ok(Self {
            resources,
            desc,
            buffers,
            presents: 0,
        })
    }

    fn create_views(resources: &ResourceManager, ids: &[ResourceId]) -> RhiResult<Vec<BackBuffer>> {
        ids.iter()
            .map(|&resource| {
                Ok(BackBuffer {
                    resource,
                    rtv: resources.create_render_target_view(resource)?,
                })
            })
            .collect()
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.desc.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.desc.height
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.desc.format
    }

    /// Number of back buffers the device actually created.
    #[inline]
    pub fn buffer_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    pub fn back_buffer(&self, index: u32) -> Option<&BackBuffer> {
        self.buffers.get(index as usize)
    }

    pub fn back_buffers(&self) -> &[BackBuffer] {
        &self.buffers
    }

    /// Index of the buffer the next frame renders into.
    pub fn current_back_buffer_index(&self) -> RhiResult<u32> {
        self.resources.device().current_back_buffer_index()
    }

    /// Buffer the next frame renders into.
    pub fn current(&self) -> RhiResult<&BackBuffer> {
        let index = self.current_back_buffer_index()?;
        self.back_buffer(index)
            .ok_or_else(|| RhiError::Swapchain(format!("back buffer {index} out of range")))
    }

    /// Queues the current back buffer for display. Never waits for vsync.
    pub fn present(&mut self) -> RhiResult<()> {
        self.resources.device().present()?;
        self.presents += 1;
        Ok(())
    }

    /// Number of successful presents.
    pub fn present_count(&self) -> u64 {
        self.presents
    }

    /// Recreates the back buffers and their views at a new size.
    ///
    /// The GPU must be idle: old views are released straight away instead of
    /// waiting on a fence.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot resize or the views cannot be
    /// recreated.
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if width == 0 || height == 0 {
            return Err(RhiError::Swapchain(format!(
                "cannot resize swap surface to {width}x{height}"
            )));
        }

        self.buffers.clear();
        self.resources.drain_retired();

        let ids = self.resources.device().resize_swap_chain(width, height)?;
        self.buffers = Self::create_views(&self.resources, &ids)?;
        self.desc.width = width;
        self.desc.height = height;
        debug!("Swap surface resized to {}x{}", width, height);
        Ok(())
    }
}

impl Drop for SwapSurface {
    fn drop(&mut self) {
        self.buffers.clear();
        self.resources.drain_retired();
        self.resources.device().destroy_swap_chain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDevice;
    use crate::descriptor::{DescriptorCategory, HeapLayout};
    use crate::device::GpuDevice;

    fn setup() -> (Arc<SoftDevice>, Arc<ResourceManager>) {
        let device = Arc::new(SoftDevice::new());
        let resources = ResourceManager::new(device.clone(), HeapLayout::default()).unwrap();
        (device, resources)
    }

    fn desc(width: u32, height: u32) -> SwapChainDesc {
        SwapChainDesc {
            width,
            height,
            buffer_count: 2,
            format: Format::Bgra8Unorm,
        }
    }

    #[test]
    fn test_one_rtv_per_back_buffer() {
        let (_device, resources) = setup();
        let surface = SwapSurface::new(resources.clone(), desc(320, 240)).unwrap();
        assert_eq!(surface.buffer_count(), 2);
        assert_eq!(resources.used(DescriptorCategory::RenderTarget), 2);
        assert_ne!(
            surface.back_buffer(0).unwrap().rtv_index(),
            surface.back_buffer(1).unwrap().rtv_index()
        );
    }

    #[test]
    fn test_present_rotates_index() {
        let (_device, resources) = setup();
        let mut surface = SwapSurface::new(resources, desc(320, 240)).unwrap();
        assert_eq!(surface.current_back_buffer_index().unwrap(), 0);
        surface.present().unwrap();
        assert_eq!(surface.current_back_buffer_index().unwrap(), 1);
        surface.present().unwrap();
        assert_eq!(surface.current_back_buffer_index().unwrap(), 0);
        assert_eq!(surface.present_count(), 2);
    }

    #[test]
    fn test_resize_recreates_buffers_and_views() {
        let (device, resources) = setup();
        let mut surface = SwapSurface::new(resources.clone(), desc(1280, 720)).unwrap();
        let old = surface.back_buffer(0).unwrap().id();

        surface.resize(640, 480).unwrap();
        assert_eq!((surface.width(), surface.height()), (640, 480));
        assert!(!device.is_live(old));
        let new = surface.back_buffer(0).unwrap().id();
        assert_eq!(device.texture_desc(new).unwrap().width, 640);
        assert_eq!(resources.used(DescriptorCategory::RenderTarget), 2);
    }

    #[test]
    fn test_zero_size_resize_rejected() {
        let (_device, resources) = setup();
        let mut surface = SwapSurface::new(resources, desc(64, 64)).unwrap();
        assert!(surface.resize(0, 64).is_err());
    }

    #[test]
    fn test_drop_destroys_swap_chain() {
        let (device, resources) = setup();
        let surface = SwapSurface::new(resources.clone(), desc(64, 64)).unwrap();
        let id = surface.back_buffer(0).unwrap().id();
        drop(surface);
        assert!(!device.is_live(id));
        assert!(device.current_back_buffer_index().is_err());
        assert_eq!(resources.used(DescriptorCategory::RenderTarget), 0);
    }
}
