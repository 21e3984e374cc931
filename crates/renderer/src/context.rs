//! GPU context: the per-frame state machine.
//!
//! [`GpuContext`] owns the queue, the fence, the frame slots, the command
//! list and every size-dependent target (back buffers, depth buffer and
//! the ping-pong pair). A frame walks through a fixed cycle:
//!
//! ```text
//! Idle -> begin_frame -> Recording -> end_frame -> Ended
//!      -> execute -> Submitted -> present -> Presented
//!      -> move_to_next_frame -> Idle
//! ```
//!
//! Calling an operation out of turn fails with
//! [`RhiError::InvalidState`] and leaves the context untouched.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_renderer::{ContextDesc, GpuContext};
//! use ember_rhi::resource::ResourceManager;
//!
//! # fn example(resources: Arc<ResourceManager>) -> ember_renderer::RenderResult<()> {
//! let mut context = GpuContext::new(resources, &ContextDesc::new(1280, 720))?;
//! loop {
//!     context.begin_frame()?;
//!     // ... record passes ...
//!     context.end_frame()?;
//!     context.execute()?;
//!     context.present()?;
//!     context.move_to_next_frame()?;
//! }
//! # }
//! ```

use std::sync::Arc;

use ember_rhi::command::{BindPoint, CommandList, CommandQueue};
use ember_rhi::device::SwapChainDesc;
use ember_rhi::pipeline::{PipelineBinding, PipelineKind, PrimitiveTopology};
use ember_rhi::resource::{DepthBuffer, RenderTargetDescriptor, ResourceManager};
use ember_rhi::swapchain::SwapSurface;
use ember_rhi::sync::{Fence, FenceStats, WaitOutcome};
use ember_rhi::types::{Format, ResourceId, ResourceState, ScissorRect, Viewport};
use ember_rhi::RhiError;
use ember_scene::{RenderModel, Scene, SceneError};
use tracing::{debug, error, info};

use crate::constants::DrawConstants;
use crate::error::RenderResult;
use crate::frame::{FRAME_COUNT, FrameSlots};

/// Where the context is in the frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Between frames; uploads and resizes are allowed.
    Idle,
    Recording,
    /// Recording finished, back buffer returned to `Present`.
    Ended,
    Submitted,
    Presented,
}

/// Output size and clear values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub clear_color: [f32; 4],
}

impl ContextDesc {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: Format::Bgra8Unorm,
            clear_color: [0.0, 0.2, 0.4, 1.0],
        }
    }
}

/// Frame orchestrator over one device.
///
/// # Thread Safety
///
/// The context is driven from a single thread. The GPU runs asynchronously
/// and is only synchronized with through the fence.
pub struct GpuContext {
    queue: CommandQueue,
    list: CommandList,
    slots: FrameSlots,
    // Targets retire their views before the surface drains the queue.
    depth: DepthBuffer,
    history: RenderTargetDescriptor,
    surface: SwapSurface,
    fence: Fence,
    resources: Arc<ResourceManager>,
    viewport: Viewport,
    scissor: ScissorRect,
    back_buffer: u32,
    phase: FramePhase,
    clear_color: [f32; 4],
    frames: u64,
}

impl GpuContext {
    /// Creates the queue, fence, frame slots, swap surface and the
    /// size-dependent targets.
    ///
    /// # Errors
    ///
    /// Returns an error if any device object cannot be created or a
    /// descriptor category is full.
    pub fn new(resources: Arc<ResourceManager>, desc: &ContextDesc) -> RenderResult<Self> {
        let device = resources.device().clone();
        let queue = CommandQueue::new(device.clone());
        let fence = Fence::new(device.clone(), 0)?;

        let surface = SwapSurface::new(
            resources.clone(),
            SwapChainDesc {
                width: desc.width,
                height: desc.height,
                buffer_count: FRAME_COUNT as u32,
                format: desc.format,
            },
        )?;
        let back_buffer = surface.current_back_buffer_index()?;
        let slots = FrameSlots::new(&device)?;
        let depth = resources.create_depth_buffer(desc.width, desc.height)?;
        let history =
            resources.create_render_target_pair("history", desc.width, desc.height, desc.format)?;

        info!(
            "GPU context ready: {}x{}, {} frame slots",
            desc.width, desc.height, FRAME_COUNT
        );

        Ok(Self {
            queue,
            list: CommandList::new("frame"),
            slots,
            depth,
            history,
            surface,
            fence,
            resources,
            viewport: Viewport::from_size(desc.width, desc.height),
            scissor: ScissorRect::from_size(desc.width, desc.height),
            back_buffer,
            phase: FramePhase::Idle,
            clear_color: desc.clear_color,
            frames: 0,
        })
    }

    fn expect_phase(&self, expected: FramePhase, operation: &str) -> RenderResult<()> {
        if self.phase != expected {
            return Err(RhiError::InvalidState(format!(
                "{operation} called in phase {:?}, expected {:?}",
                self.phase, expected
            ))
            .into());
        }
        Ok(())
    }

    /// Opens the current slot for recording and prepares the back buffer:
    /// swaps the ping-pong roles, transitions `Present -> RenderTarget`,
    /// binds viewport, scissor, color and depth targets and clears them.
    ///
    /// # Errors
    ///
    /// Fails with [`RhiError::InvalidState`] outside [`FramePhase::Idle`],
    /// or [`RhiError::AllocatorInUse`] if the slot's previous frame is
    /// still executing.
    pub fn begin_frame(&mut self) -> RenderResult<()> {
        self.expect_phase(FramePhase::Idle, "begin_frame")?;

        let slot = self.slots.current_mut();
        slot.allocator_mut().reset(&self.fence)?;
        self.list.reset(self.slots.current().allocator())?;
        self.resources
            .set_frame_fence_value(self.slots.current().fence_value());
        self.history.swap_active();

        let (back_buffer, rtv) = self.back_buffer_target()?;
        let dsv = self.depth.dsv_index();
        self.list
            .transition(back_buffer, ResourceState::Present, ResourceState::RenderTarget)?;
        self.list.set_viewport(self.viewport)?;
        self.list.set_scissor(self.scissor)?;
        self.list.set_render_targets(&[rtv], Some(dsv))?;
        self.list.clear_render_target(rtv, self.clear_color)?;
        self.list.clear_depth_stencil(dsv, 1.0)?;

        self.phase = FramePhase::Recording;
        Ok(())
    }

    /// Draws every mesh of `model` with `binding`.
    ///
    /// Binds the pipeline, its root signature and the shader-visible heaps,
    /// then per mesh sets the root constants, vertex and index buffers and
    /// issues one indexed draw. Only the command list is touched.
    ///
    /// # Errors
    ///
    /// Fails outside [`FramePhase::Recording`], for a compute pipeline, or
    /// if the scene has no constants for the current slot.
    pub fn draw(
        &mut self,
        scene: &Scene,
        model: &RenderModel,
        binding: &PipelineBinding,
    ) -> RenderResult<()> {
        self.expect_phase(FramePhase::Recording, "draw")?;
        self.bind_pipeline(binding)?;

        let slot = self.slots.index();
        let frame = frame_constants(scene, slot)?;
        for mesh in model.meshes() {
            let object = mesh.constants_index(slot).ok_or(SceneError::FrameSlot {
                slot,
                count: scene.frame_count(),
            })?;
            let constants = DrawConstants {
                frame,
                object,
                texture: scene.texture_index(model, mesh),
                sampler: scene.sampler_index(),
                history: self.history.last().srv_index(),
            };
            self.list
                .set_root_constants(BindPoint::Graphics, 0, 0, constants.as_dwords())?;
            self.list.set_vertex_buffers(0, &[mesh.vertex_view()])?;
            self.list.set_index_buffer(mesh.index_view())?;
            self.list
                .draw_indexed_instanced(mesh.index_count(), 1, 0, 0, 0)?;
        }
        Ok(())
    }

    /// Draws a full-screen triangle that samples the ping-pong pair: the
    /// active target as `texture`, the last one as `history`.
    ///
    /// # Errors
    ///
    /// Fails outside [`FramePhase::Recording`] or for a compute pipeline.
    pub fn draw_fullscreen(&mut self, scene: &Scene, binding: &PipelineBinding) -> RenderResult<()> {
        self.expect_phase(FramePhase::Recording, "draw_fullscreen")?;
        self.bind_pipeline(binding)?;

        let constants = DrawConstants {
            frame: frame_constants(scene, self.slots.index())?,
            object: 0,
            texture: self.history.active().srv_index(),
            sampler: scene.sampler_index(),
            history: self.history.last().srv_index(),
        };
        self.list
            .set_root_constants(BindPoint::Graphics, 0, 0, constants.as_dwords())?;
        self.list.draw_instanced(3, 1, 0, 0)?;
        Ok(())
    }

    fn bind_pipeline(&mut self, binding: &PipelineBinding) -> RenderResult<()> {
        if binding.kind != PipelineKind::Graphics {
            return Err(RhiError::InvalidState(format!(
                "pipeline {:?} is not a graphics pipeline",
                binding.pipeline
            ))
            .into());
        }
        self.list.set_pipeline_state(binding.pipeline)?;
        self.list
            .set_root_signature(BindPoint::Graphics, binding.root_signature)?;
        self.list
            .set_descriptor_heaps(&self.resources.shader_visible_heaps())?;
        self.list
            .set_primitive_topology(PrimitiveTopology::TriangleList)?;
        Ok(())
    }

    /// Binds the back buffer as the only color target, with or without the
    /// depth buffer.
    pub fn bind_back_buffer(&mut self, with_depth: bool) -> RenderResult<()> {
        self.expect_phase(FramePhase::Recording, "bind_back_buffer")?;
        let (_, rtv) = self.back_buffer_target()?;
        let dsv = with_depth.then(|| self.depth.dsv_index());
        self.list.set_render_targets(&[rtv], dsv)?;
        Ok(())
    }

    /// Makes the active ping-pong target writable and the last one
    /// readable, binds the active one with the depth buffer and clears
    /// both.
    pub fn begin_history_pass(&mut self) -> RenderResult<()> {
        self.expect_phase(FramePhase::Recording, "begin_history_pass")?;
        let (active, last) = self.history.pair_mut();
        active.transition(&mut self.list, ResourceState::RenderTarget)?;
        last.transition(&mut self.list, ResourceState::PixelShaderResource)?;

        let rtv = self.history.active().rtv_index();
        let dsv = self.depth.dsv_index();
        self.list.set_render_targets(&[rtv], Some(dsv))?;
        self.list.clear_render_target(rtv, self.clear_color)?;
        self.list.clear_depth_stencil(dsv, 1.0)?;
        Ok(())
    }

    /// Makes both ping-pong targets readable by later passes. The last one
    /// is still a render target when no pass wrote history this frame.
    pub fn resolve_history(&mut self) -> RenderResult<()> {
        self.expect_phase(FramePhase::Recording, "resolve_history")?;
        let (active, last) = self.history.pair_mut();
        active.transition(&mut self.list, ResourceState::PixelShaderResource)?;
        last.transition(&mut self.list, ResourceState::PixelShaderResource)?;
        Ok(())
    }

    /// Returns the back buffer to `Present`.
    pub fn end_frame(&mut self) -> RenderResult<()> {
        self.expect_phase(FramePhase::Recording, "end_frame")?;
        let (back_buffer, _) = self.back_buffer_target()?;
        self.list
            .transition(back_buffer, ResourceState::RenderTarget, ResourceState::Present)?;
        self.phase = FramePhase::Ended;
        Ok(())
    }

    /// Closes the command list and submits it. The list stays untouched
    /// until the next [`GpuContext::begin_frame`].
    pub fn execute(&mut self) -> RenderResult<()> {
        self.expect_phase(FramePhase::Ended, "execute")?;
        self.list.close()?;
        self.queue
            .execute(&mut self.list, self.slots.current_mut().allocator_mut())?;
        self.phase = FramePhase::Submitted;
        Ok(())
    }

    /// Queues the back buffer for display. Never waits for vsync.
    pub fn present(&mut self) -> RenderResult<()> {
        self.expect_phase(FramePhase::Submitted, "present")?;
        self.surface.present()?;
        self.phase = FramePhase::Presented;
        Ok(())
    }

    /// Signals the fence for this frame, moves to the next frame slot and
    /// waits for it if the GPU has fallen a full slot cycle behind. The
    /// next back buffer is queried separately; a swap chain may hold more
    /// images than there are slots.
    ///
    /// # Errors
    ///
    /// Fails outside [`FramePhase::Presented`], or with
    /// [`RhiError::DeviceHung`] if the wait times out.
    pub fn move_to_next_frame(&mut self) -> RenderResult<()> {
        self.expect_phase(FramePhase::Presented, "move_to_next_frame")?;

        let outcome = self.slots.advance(&self.fence, &self.queue)?;
        let next = self.surface.current_back_buffer_index()?;
        if let WaitOutcome::Blocked(waited) = outcome {
            debug!("Frame {} waited {:?} for the GPU", self.frames, waited);
        }
        self.back_buffer = next;
        self.resources.release_completed(self.fence.completed_value()?);

        self.frames += 1;
        self.phase = FramePhase::Idle;
        Ok(())
    }

    /// Signals the fence and waits until the GPU has finished everything
    /// submitted so far.
    pub fn flush(&mut self) -> RenderResult<()> {
        self.slots.flush(&self.fence, &self.queue)?;
        self.resources.release_completed(self.fence.completed_value()?);
        Ok(())
    }

    /// Records one-off work (uploads) into the current slot, submits it
    /// and waits for it to complete.
    ///
    /// # Errors
    ///
    /// Fails outside [`FramePhase::Idle`], or returns the error of
    /// `record` after discarding what it recorded.
    pub fn upload<T>(
        &mut self,
        record: impl FnOnce(&mut CommandList) -> RenderResult<T>,
    ) -> RenderResult<T> {
        self.expect_phase(FramePhase::Idle, "upload")?;

        self.slots.current_mut().allocator_mut().reset(&self.fence)?;
        self.list.reset(self.slots.current().allocator())?;
        self.resources
            .set_frame_fence_value(self.slots.current().fence_value());

        let value = match record(&mut self.list) {
            Ok(value) => value,
            Err(e) => {
                self.list.close()?;
                return Err(e);
            }
        };
        self.list.close()?;
        self.queue
            .execute(&mut self.list, self.slots.current_mut().allocator_mut())?;
        self.flush()?;
        Ok(value)
    }

    /// Resizes every size-dependent target after draining the GPU.
    ///
    /// Starts over with a fresh fence: the current slot gets value 1, the
    /// others 0.
    ///
    /// # Errors
    ///
    /// Fails outside [`FramePhase::Idle`], for a zero size, or if any
    /// target cannot be recreated.
    pub fn resize(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.expect_phase(FramePhase::Idle, "resize")?;
        if width == 0 || height == 0 {
            return Err(RhiError::Swapchain(format!("cannot resize to {width}x{height}")).into());
        }

        self.flush()?;
        self.slots.reset_allocators(&self.fence)?;
        self.resources.drain_retired();

        let format = self.surface.format();
        self.surface.resize(width, height)?;
        self.depth = self.resources.create_depth_buffer(width, height)?;
        self.history = self
            .resources
            .create_render_target_pair("history", width, height, format)?;
        self.fence = Fence::new(self.resources.device().clone(), 0)?;
        self.resources.drain_retired();

        self.back_buffer = self.surface.current_back_buffer_index()?;
        self.slots.reset_values();
        self.resources
            .set_frame_fence_value(self.slots.current().fence_value());
        self.viewport = Viewport::from_size(width, height);
        self.scissor = ScissorRect::from_size(width, height);

        info!("GPU context resized to {}x{}", width, height);
        Ok(())
    }

    fn back_buffer_target(&self) -> RenderResult<(ResourceId, u32)> {
        let buffer = self.surface.back_buffer(self.back_buffer).ok_or_else(|| {
            RhiError::Swapchain(format!("back buffer {} out of range", self.back_buffer))
        })?;
        Ok((buffer.id(), buffer.rtv_index()))
    }

    /// The list being recorded; passes record through this.
    pub fn command_list(&mut self) -> &mut CommandList {
        &mut self.list
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Index of the frame slot being recorded.
    #[inline]
    pub fn frame_index(&self) -> usize {
        self.slots.index()
    }

    /// Back buffer the current frame renders into.
    #[inline]
    pub fn back_buffer_index(&self) -> u32 {
        self.back_buffer
    }

    /// Fence value of every slot, in slot order.
    pub fn fence_values(&self) -> Vec<u64> {
        self.slots.fence_values()
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn fence_stats(&self) -> FenceStats {
        self.fence.stats()
    }

    pub fn surface(&self) -> &SwapSurface {
        &self.surface
    }

    pub fn depth_buffer(&self) -> &DepthBuffer {
        &self.depth
    }

    pub fn history(&self) -> &RenderTargetDescriptor {
        &self.history
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn scissor(&self) -> ScissorRect {
        self.scissor
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
    }

    /// Frames completed through [`GpuContext::move_to_next_frame`].
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn submission_count(&self) -> u64 {
        self.queue.submission_count()
    }
}

fn frame_constants(scene: &Scene, slot: usize) -> RenderResult<u32> {
    scene.frame_constants_index(slot).ok_or_else(|| {
        SceneError::FrameSlot {
            slot,
            count: scene.frame_count(),
        }
        .into()
    })
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("GPU flush during teardown failed: {}", e);
            return;
        }
        if let Err(e) = self.slots.reset_allocators(&self.fence) {
            error!("Command allocator reset during teardown failed: {}", e);
        }
        self.resources.drain_retired();
        debug!("GPU context destroyed after {} frames", self.frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::backend::soft::SoftDevice;
    use ember_rhi::descriptor::HeapLayout;

    fn context() -> GpuContext {
        let device = Arc::new(SoftDevice::new());
        let resources = ResourceManager::new(device, HeapLayout::default()).unwrap();
        GpuContext::new(resources, &ContextDesc::new(320, 240)).unwrap()
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let mut ctx = context();
        assert!(ctx.end_frame().is_err());
        assert!(ctx.execute().is_err());
        assert!(ctx.present().is_err());
        assert!(ctx.move_to_next_frame().is_err());
        assert_eq!(ctx.phase(), FramePhase::Idle);

        ctx.begin_frame().unwrap();
        assert!(ctx.begin_frame().is_err());
        assert!(ctx.resize(64, 64).is_err());
        assert!(ctx.upload(|_| Ok(())).is_err());
        assert_eq!(ctx.phase(), FramePhase::Recording);
    }

    #[test]
    fn test_full_cycle_returns_to_idle() {
        let mut ctx = context();
        ctx.begin_frame().unwrap();
        ctx.end_frame().unwrap();
        ctx.execute().unwrap();
        ctx.present().unwrap();
        ctx.move_to_next_frame().unwrap();
        assert_eq!(ctx.phase(), FramePhase::Idle);
        assert_eq!(ctx.frame_count(), 1);
        assert_eq!(ctx.submission_count(), 1);
    }

    #[test]
    fn test_failed_upload_leaves_context_usable() {
        let mut ctx = context();
        let result: RenderResult<()> = ctx.upload(|_| Err(RhiError::Validation("boom".into()).into()));
        assert!(result.is_err());
        ctx.begin_frame().unwrap();
    }

    #[test]
    fn test_zero_size_resize_rejected() {
        let mut ctx = context();
        assert!(ctx.resize(0, 480).is_err());
        assert_eq!(ctx.viewport(), Viewport::from_size(320, 240));
    }
}
