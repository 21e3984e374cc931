//! Command recording and submission.
//!
//! This module provides the three objects that move work to the GPU:
//! - [`CommandAllocator`] - memory backing recorded commands, one per frame slot
//! - [`CommandList`] - a re-recordable command sequence
//! - [`CommandQueue`] - submits closed lists in order
//!
//! # Lifecycle
//!
//! A list is always in exactly one [`CommandListState`]:
//!
//! ```text
//! reset(allocator)        close()          queue.execute()
//! ───────────────▶ Recording ──────▶ Closed ──────────────▶ Executing
//!        ▲                                                     │
//!        └─────────────────────────────────────────────────────┘
//! ```
//!
//! A reset needs an allocator in the [`AllocatorState::Open`] state, which
//! in turn needs the fence value of its last submission to have completed.
//! Together these make "reset an allocator the GPU still reads" impossible
//! to express without an error.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::command::{CommandAllocator, CommandList, CommandQueue};
//! use ember_rhi::device::GpuDevice;
//! use ember_rhi::sync::Fence;
//!
//! # fn example(device: Arc<dyn GpuDevice>) -> ember_rhi::RhiResult<()> {
//! let queue = CommandQueue::new(device.clone());
//! let fence = Fence::new(device.clone(), 0)?;
//! let mut allocator = CommandAllocator::new(device.clone())?;
//! let mut list = CommandList::new("upload");
//!
//! list.reset(&allocator)?;
//! list.dispatch(8, 8, 1)?;
//! list.close()?;
//! queue.execute(&mut list, &mut allocator)?;
//!
//! fence.signal(&queue, 1)?;
//! allocator.mark_fenced(1);
//! fence.wait(1)?;
//! allocator.reset(&fence)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::PrimitiveTopology;
use crate::sync::Fence;
use crate::types::{
    AllocatorId, HeapId, PipelineId, ResourceId, ResourceState, RootSignatureId, ScissorRect,
    Viewport,
};

/// A single state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl Barrier {
    pub fn transition(resource: ResourceId, before: ResourceState, after: ResourceState) -> Self {
        Self {
            resource,
            before,
            after,
        }
    }
}

/// Which pipeline kind a root binding applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

/// Width of the indices in an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn bytes(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// A region of a buffer read as vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub resource: ResourceId,
    pub offset: u64,
    pub size: u64,
    pub stride: u32,
}

/// A region of a buffer read as indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub resource: ResourceId,
    pub offset: u64,
    pub size: u64,
    pub format: IndexFormat,
}

impl IndexBufferView {
    pub fn index_count(&self) -> u64 {
        self.size / self.format.bytes()
    }
}

/// One recorded command.
///
/// Render targets and depth buffers are named by their slot index in the
/// render-target and depth-stencil heaps, the same way the hardware
/// interface addresses them.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ResourceBarrier(Vec<Barrier>),
    ClearRenderTarget {
        rtv: u32,
        color: [f32; 4],
    },
    ClearDepthStencil {
        dsv: u32,
        depth: f32,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetRenderTargets {
        color: Vec<u32>,
        depth: Option<u32>,
    },
    SetPipelineState(PipelineId),
    SetRootSignature {
        bind_point: BindPoint,
        root_signature: RootSignatureId,
    },
    SetDescriptorHeaps(Vec<HeapId>),
    SetRootDescriptorTable {
        bind_point: BindPoint,
        parameter: u32,
        base_index: u32,
    },
    SetRoot32BitConstants {
        bind_point: BindPoint,
        parameter: u32,
        offset: u32,
        values: Vec<u32>,
    },
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffers {
        start_slot: u32,
        views: Vec<VertexBufferView>,
    },
    SetIndexBuffer(IndexBufferView),
    DrawInstanced {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexedInstanced {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    },
    /// Copies a tightly packed image from a buffer into one mip of one layer.
    CopyBufferToTexture {
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        mip: u32,
        layer: u32,
    },
}

/// Where a command allocator stands relative to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorState {
    /// Free to record into.
    Open,
    /// Holds submitted work with no fence value behind it yet.
    Submitted,
    /// Holds work that completes once the fence reaches this value.
    Fenced(u64),
}

/// Backing memory for command lists.
pub struct CommandAllocator {
    device: Arc<dyn GpuDevice>,
    id: AllocatorId,
    state: AllocatorState,
}

impl CommandAllocator {
    /// # Errors
    ///
    /// Returns an error if the device cannot create the allocator.
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let id = device.create_command_allocator()?;
        debug!("Created command allocator {:?}", id);
        Ok(Self {
            device,
            id,
            state: AllocatorState::Open,
        })
    }

    #[inline]
    pub fn id(&self) -> AllocatorId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> AllocatorState {
        self.state
    }

    /// Records that work from this allocator was followed by a fence signal.
    pub fn mark_fenced(&mut self, value: u64) {
        self.state = match self.state {
            AllocatorState::Fenced(old) => AllocatorState::Fenced(old.max(value)),
            AllocatorState::Submitted => AllocatorState::Fenced(value),
            AllocatorState::Open => AllocatorState::Open,
        };
    }

    /// Recycles the allocator's memory.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidState`] if submitted work has no fence value
    /// - [`RhiError::AllocatorInUse`] if the fence has not reached that value
    pub fn reset(&mut self, fence: &Fence) -> RhiResult<()> {
        match self.state {
            AllocatorState::Open => {}
            AllocatorState::Submitted => {
                return Err(RhiError::InvalidState(
                    "command allocator reset before its submission was fenced".to_string(),
                ));
            }
            AllocatorState::Fenced(required) => {
                let completed = fence.completed_value()?;
                if completed < required {
                    return Err(RhiError::AllocatorInUse {
                        required,
                        completed,
                    });
                }
            }
        }

        self.device.reset_command_allocator(self.id)?;
        self.state = AllocatorState::Open;
        Ok(())
    }

    fn mark_submitted(&mut self) {
        self.state = AllocatorState::Submitted;
    }
}

impl Drop for CommandAllocator {
    fn drop(&mut self) {
        if self.state != AllocatorState::Open {
            warn!(
                "Command allocator {:?} dropped in state {:?}",
                self.id, self.state
            );
        }
        self.device.destroy_command_allocator(self.id);
    }
}

/// Recording state of a [`CommandList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    Recording,
    Closed,
    Executing,
}

/// A re-recordable sequence of commands.
///
/// New lists start `Closed` and bound to no allocator; call
/// [`CommandList::reset`] before recording.
pub struct CommandList {
    name: String,
    allocator: Option<AllocatorId>,
    state: CommandListState,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allocator: None,
            state: CommandListState::Closed,
            commands: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> CommandListState {
        self.state
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Clears the list and starts recording into `allocator`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the list is already recording
    /// or the allocator still holds unfinished work.
    pub fn reset(&mut self, allocator: &CommandAllocator) -> RhiResult<()> {
        if self.state == CommandListState::Recording {
            return Err(RhiError::InvalidState(format!(
                "command list '{}' reset while recording",
                self.name
            )));
        }
        if allocator.state() != AllocatorState::Open {
            return Err(RhiError::InvalidState(format!(
                "command list '{}' reset on allocator in state {:?}",
                self.name,
                allocator.state()
            )));
        }

        self.commands.clear();
        self.allocator = Some(allocator.id());
        self.state = CommandListState::Recording;
        Ok(())
    }

    /// Ends recording.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] unless the list is recording.
    pub fn close(&mut self) -> RhiResult<()> {
        if self.state != CommandListState::Recording {
            return Err(RhiError::InvalidState(format!(
                "command list '{}' closed in state {:?}",
                self.name, self.state
            )));
        }
        self.state = CommandListState::Closed;
        Ok(())
    }

    /// Appends a command.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] unless the list is recording.
    pub fn record(&mut self, command: Command) -> RhiResult<()> {
        if self.state != CommandListState::Recording {
            return Err(RhiError::InvalidState(format!(
                "command recorded into '{}' while {:?}",
                self.name, self.state
            )));
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn resource_barrier(&mut self, barriers: &[Barrier]) -> RhiResult<()> {
        self.record(Command::ResourceBarrier(barriers.to_vec()))
    }

    pub fn transition(
        &mut self,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) -> RhiResult<()> {
        self.resource_barrier(&[Barrier::transition(resource, before, after)])
    }

    pub fn clear_render_target(&mut self, rtv: u32, color: [f32; 4]) -> RhiResult<()> {
        self.record(Command::ClearRenderTarget { rtv, color })
    }

    pub fn clear_depth_stencil(&mut self, dsv: u32, depth: f32) -> RhiResult<()> {
        self.record(Command::ClearDepthStencil { dsv, depth })
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> RhiResult<()> {
        self.record(Command::SetViewport(viewport))
    }

    pub fn set_scissor(&mut self, scissor: ScissorRect) -> RhiResult<()> {
        self.record(Command::SetScissor(scissor))
    }

    pub fn set_render_targets(&mut self, color: &[u32], depth: Option<u32>) -> RhiResult<()> {
        self.record(Command::SetRenderTargets {
            color: color.to_vec(),
            depth,
        })
    }

    pub fn set_pipeline_state(&mut self, pipeline: PipelineId) -> RhiResult<()> {
        self.record(Command::SetPipelineState(pipeline))
    }

    pub fn set_root_signature(
        &mut self,
        bind_point: BindPoint,
        root_signature: RootSignatureId,
    ) -> RhiResult<()> {
        self.record(Command::SetRootSignature {
            bind_point,
            root_signature,
        })
    }

    pub fn set_descriptor_heaps(&mut self, heaps: &[HeapId]) -> RhiResult<()> {
        self.record(Command::SetDescriptorHeaps(heaps.to_vec()))
    }

    pub fn set_root_descriptor_table(
        &mut self,
        bind_point: BindPoint,
        parameter: u32,
        base_index: u32,
    ) -> RhiResult<()> {
        self.record(Command::SetRootDescriptorTable {
            bind_point,
            parameter,
            base_index,
        })
    }

    pub fn set_root_constants(
        &mut self,
        bind_point: BindPoint,
        parameter: u32,
        offset: u32,
        values: &[u32],
    ) -> RhiResult<()> {
        self.record(Command::SetRoot32BitConstants {
            bind_point,
            parameter,
            offset,
            values: values.to_vec(),
        })
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) -> RhiResult<()> {
        self.record(Command::SetPrimitiveTopology(topology))
    }

    pub fn set_vertex_buffers(&mut self, start_slot: u32, views: &[VertexBufferView]) -> RhiResult<()> {
        self.record(Command::SetVertexBuffers {
            start_slot,
            views: views.to_vec(),
        })
    }

    pub fn set_index_buffer(&mut self, view: IndexBufferView) -> RhiResult<()> {
        self.record(Command::SetIndexBuffer(view))
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> RhiResult<()> {
        self.record(Command::DrawInstanced {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        })
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> RhiResult<()> {
        self.record(Command::DrawIndexedInstanced {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        })
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.record(Command::Dispatch { x, y, z })
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        self.record(Command::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        })
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        src: ResourceId,
        src_offset: u64,
        dst: ResourceId,
        mip: u32,
        layer: u32,
    ) -> RhiResult<()> {
        self.record(Command::CopyBufferToTexture {
            src,
            src_offset,
            dst,
            mip,
            layer,
        })
    }
}

/// In-order submission queue.
pub struct CommandQueue {
    device: Arc<dyn GpuDevice>,
    submissions: AtomicU64,
}

impl CommandQueue {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            submissions: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Submits a closed list. The list must not be touched until it is
    /// reset against an idle allocator.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the list is not closed or was
    /// recorded from a different allocator, or the device's submission
    /// error.
    pub fn execute(
        &self,
        list: &mut CommandList,
        allocator: &mut CommandAllocator,
    ) -> RhiResult<()> {
        if list.state != CommandListState::Closed {
            return Err(RhiError::InvalidState(format!(
                "command list '{}' executed in state {:?}",
                list.name, list.state
            )));
        }
        if list.allocator != Some(allocator.id()) {
            return Err(RhiError::InvalidState(format!(
                "command list '{}' executed with a foreign allocator",
                list.name
            )));
        }

        self.device.execute(allocator.id(), &list.commands)?;
        list.state = CommandListState::Executing;
        allocator.mark_submitted();
        self.submissions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of lists submitted so far.
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::soft::SoftDevice;

    fn setup() -> (Arc<dyn GpuDevice>, CommandQueue, Fence) {
        let device: Arc<dyn GpuDevice> = Arc::new(SoftDevice::new());
        let queue = CommandQueue::new(device.clone());
        let fence = Fence::new(device.clone(), 0).unwrap();
        (device, queue, fence)
    }

    #[test]
    fn test_new_list_is_closed() {
        let list = CommandList::new("main");
        assert_eq!(list.state(), CommandListState::Closed);
    }

    #[test]
    fn test_record_requires_recording_state() {
        let mut list = CommandList::new("main");
        assert!(list.dispatch(1, 1, 1).is_err());
    }

    #[test]
    fn test_full_cycle() {
        let (device, queue, fence) = setup();
        let mut allocator = CommandAllocator::new(device).unwrap();
        let mut list = CommandList::new("main");

        list.reset(&allocator).unwrap();
        assert_eq!(list.state(), CommandListState::Recording);
        list.close().unwrap();
        queue.execute(&mut list, &mut allocator).unwrap();
        assert_eq!(list.state(), CommandListState::Executing);
        assert_eq!(allocator.state(), AllocatorState::Submitted);

        fence.signal(&queue, 1).unwrap();
        allocator.mark_fenced(1);
        fence.wait(1).unwrap();
        allocator.reset(&fence).unwrap();
        assert_eq!(allocator.state(), AllocatorState::Open);
        list.reset(&allocator).unwrap();
        assert_eq!(queue.submission_count(), 1);
    }

    #[test]
    fn test_execute_requires_closed() {
        let (device, queue, _fence) = setup();
        let mut allocator = CommandAllocator::new(device).unwrap();
        let mut list = CommandList::new("main");
        list.reset(&allocator).unwrap();
        assert!(queue.execute(&mut list, &mut allocator).is_err());
    }

    #[test]
    fn test_unfenced_allocator_cannot_reset() {
        let (device, queue, fence) = setup();
        let mut allocator = CommandAllocator::new(device).unwrap();
        let mut list = CommandList::new("main");
        list.reset(&allocator).unwrap();
        list.close().unwrap();
        queue.execute(&mut list, &mut allocator).unwrap();

        assert!(matches!(
            allocator.reset(&fence),
            Err(RhiError::InvalidState(_))
        ));
        assert!(list.reset(&allocator).is_err());
    }

    #[test]
    fn test_index_count() {
        let view = IndexBufferView {
            resource: ResourceId::default(),
            offset: 0,
            size: 36 * 4,
            format: IndexFormat::U32,
        };
        assert_eq!(view.index_count(), 36);
    }
}
