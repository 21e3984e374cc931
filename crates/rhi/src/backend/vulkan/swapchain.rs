//! Window swap chain.
//!
//! Back buffers are acquired lazily: the first query of the current index
//! after a present acquires the next image and leaves its semaphore for the
//! next submission to wait on. Presenting signals a per-image semaphore
//! behind all submitted work and queues the image.

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::SwapChainDesc;
use crate::error::{RhiError, RhiResult};
use crate::types::Format;

/// Surface plus the loaders needed to build swap chains on it.
pub struct SurfaceContext {
    pub surface_loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub physical_device: vk::PhysicalDevice,
}

pub struct WindowChain {
    swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: Format,
    pub extent: vk::Extent2D,
    acquire_semaphores: Vec<vk::Semaphore>,
    next_semaphore: usize,
    render_finished: Vec<vk::Semaphore>,
    acquired: Option<u32>,
    pending_wait: Option<vk::Semaphore>,
}

impl WindowChain {
    /// Builds a swap chain, replacing `old` if it is not null.
    pub fn new(
        device: &ash::Device,
        ctx: &SurfaceContext,
        desc: &SwapChainDesc,
        old: vk::SwapchainKHR,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)?
        };
        let formats = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)?
        };
        let present_modes = unsafe {
            ctx.surface_loader
                .get_physical_device_surface_present_modes(ctx.physical_device, ctx.surface)?
        };
        if formats.is_empty() || present_modes.is_empty() {
            return Err(RhiError::Swapchain(
                "surface reports no formats or present modes".to_string(),
            ));
        }

        let (surface_format, format) = choose_surface_format(&formats, desc.format)?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&capabilities, desc.width, desc.height);
        let image_count = choose_image_count(&capabilities, desc.buffer_count);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe { ctx.swapchain_loader.create_swapchain(&create_info, None)? };
        let images = unsafe { ctx.swapchain_loader.get_swapchain_images(swapchain)? };
        if images.len() as u32 != desc.buffer_count {
            info!(
                "Requested {} back buffers, surface gave {}",
                desc.buffer_count,
                images.len()
            );
        }

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let mut acquire_semaphores = Vec::with_capacity(images.len() + 1);
        let mut render_finished = Vec::with_capacity(images.len());
        for _ in 0..=images.len() {
            acquire_semaphores.push(unsafe { device.create_semaphore(&semaphore_info, None)? });
        }
        for _ in 0..images.len() {
            render_finished.push(unsafe { device.create_semaphore(&semaphore_info, None)? });
        }

        info!(
            "Swap chain {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            format,
            present_mode,
            images.len()
        );

        Ok(Self {
            swapchain,
            images,
            format,
            extent,
            acquire_semaphores,
            next_semaphore: 0,
            render_finished,
            acquired: None,
            pending_wait: None,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Index of the image being rendered, acquiring one if needed.
    pub fn current_index(&mut self, ctx: &SurfaceContext) -> RhiResult<u32> {
        if let Some(index) = self.acquired {
            return Ok(index);
        }

        let semaphore = self.acquire_semaphores[self.next_semaphore];
        let (index, suboptimal) = unsafe {
            ctx.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        }
        .map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DATE_KHR => {
                RhiError::Swapchain("swap chain out of date".to_string())
            }
            other => RhiError::Vulkan(other),
        })?;
        if suboptimal {
            debug!("Swap chain is suboptimal for the surface");
        }

        self.next_semaphore = (self.next_semaphore + 1) % self.acquire_semaphores.len();
        self.acquired = Some(index);
        self.pending_wait = Some(semaphore);
        Ok(index)
    }

    /// Semaphore the next submission must wait on, once.
    pub fn take_wait(&mut self) -> Option<vk::Semaphore> {
        self.pending_wait.take()
    }

    /// Signals the image's render-finished semaphore behind all submitted
    /// work and queues the image for display.
    pub fn present(&mut self, device: &ash::Device, ctx: &SurfaceContext, queue: vk::Queue) -> RhiResult<u32> {
        let index = self.current_index(ctx)?;
        let finished = self.render_finished[index as usize];

        let waits: Vec<vk::SemaphoreSubmitInfo> = self
            .take_wait()
            .map(|s| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(s)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .into_iter()
            .collect();
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(finished)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);
        unsafe { device.queue_submit2(queue, &[submit], vk::Fence::null())? };

        let swapchains = [self.swapchain];
        let indices = [index];
        let wait = [finished];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        self.acquired = None;

        match unsafe { ctx.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(_) => Ok(index),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Present found the swap chain out of date");
                Ok(index)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Destroys semaphores and, unless it was handed to a successor, the
    /// swap chain itself.
    pub fn destroy(self, device: &ash::Device, ctx: &SurfaceContext, destroy_swapchain: bool) {
        unsafe {
            for semaphore in self.acquire_semaphores.into_iter().chain(self.render_finished) {
                device.destroy_semaphore(semaphore, None);
            }
            if destroy_swapchain {
                ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
        }
    }
}

/// Reverse of the surface formats the engine can name.
fn engine_format(format: vk::Format) -> Option<Format> {
    match format {
        vk::Format::B8G8R8A8_UNORM => Some(Format::Bgra8Unorm),
        vk::Format::B8G8R8A8_SRGB => Some(Format::Bgra8Srgb),
        vk::Format::R8G8B8A8_UNORM => Some(Format::Rgba8Unorm),
        vk::Format::R8G8B8A8_SRGB => Some(Format::Rgba8Srgb),
        _ => None,
    }
}

/// Picks the requested format if offered, otherwise the first one the
/// engine can name.
fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    requested: Format,
) -> RhiResult<(vk::SurfaceFormatKHR, Format)> {
    let wanted = super::convert::format(requested);
    if let Some(&f) = formats
        .iter()
        .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
    {
        return Ok((f, requested));
    }

    formats
        .iter()
        .find_map(|&f| engine_format(f.format).map(|format| (f, format)))
        .inspect(|(_, format)| warn!("Surface lacks {:?}, using {:?}", requested, format))
        .ok_or_else(|| RhiError::Unsupported("no usable surface format".to_string()))
}

/// Presentation never waits for vertical sync when the surface allows it.
fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_requested_format_preferred() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::B8G8R8A8_UNORM),
        ];
        let (_, format) = choose_surface_format(&formats, Format::Bgra8Unorm).unwrap();
        assert_eq!(format, Format::Bgra8Unorm);
    }

    #[test]
    fn test_format_fallback() {
        let formats = [
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
            surface_format(vk::Format::R8G8B8A8_UNORM),
        ];
        let (_, format) = choose_surface_format(&formats, Format::Bgra8Unorm).unwrap();
        assert_eq!(format, Format::Rgba8Unorm);

        let unusable = [surface_format(vk::Format::A2B10G10R10_UNORM_PACK32)];
        assert!(choose_surface_format(&unusable, Format::Bgra8Unorm).is_err());
    }

    #[test]
    fn test_present_mode_avoids_vsync() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_image_count_clamped() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps, 2), 3);

        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 1,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps, 2), 2);
    }

    #[test]
    fn test_extent_follows_surface() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            ..Default::default()
        };
        assert_eq!(choose_extent(&caps, 1280, 720).width, 640);
    }
}
