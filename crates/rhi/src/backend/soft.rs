//! Simulated device.
//!
//! `SoftDevice` implements [`GpuDevice`] without a GPU. Resources live in
//! host memory, command lists are validated against the tracked state of
//! every resource and logged, and fences complete according to a
//! [`CompletionPolicy`]:
//!
//! - `Immediate` - a signal completes as soon as it is queued
//! - `Manual` - nothing completes until [`SoftDevice::complete_through`]
//!   or a sibling is called, and waits block on a condition variable
//! - `Lagged(n)` - the newest `n` signals stay pending, a blocking wait
//!   lets the GPU catch up
//!
//! Breaking a rule (wrong `before` state in a barrier, drawing without a
//! render target, resetting an allocator the GPU is still reading) returns
//! [`RhiError::Validation`]. Destroying a resource that in-flight work still
//! references cannot fail, so it is recorded in [`SoftDevice::hazards`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slotmap::SlotMap;
use tracing::{debug, info};

use crate::command::{BindPoint, Command, IndexBufferView};
use crate::descriptor::{DescriptorCategory, DescriptorHeapDesc, DescriptorHeapType, ViewDesc};
use crate::device::{GpuDevice, SwapChainDesc};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{PipelineKind, PipelineStateDesc, RootSignatureDesc};
use crate::types::{
    AdapterInfo, AdapterKind, AllocatorId, Backend, BufferDesc, BufferUsage, FenceId, HeapId,
    HeapKind, PipelineId, ResourceId, ResourceState, RootSignatureId, TextureDesc,
    TextureDimension, TextureUsage,
};

/// When queued fence signals complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    Immediate,
    Manual,
    Lagged(u64),
}

/// Something the simulated GPU did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuEvent {
    Execute {
        allocator: AllocatorId,
        serial: u64,
    },
    Signal {
        fence: FenceId,
        value: u64,
    },
    Complete {
        fence: FenceId,
        value: u64,
    },
    AllocatorReset {
        allocator: AllocatorId,
    },
    Wait {
        fence: FenceId,
        value: u64,
    },
    Present {
        index: u32,
    },
    SwapChainResized {
        width: u32,
        height: u32,
    },
}

/// One submitted command list.
#[derive(Debug, Clone)]
pub struct ExecutedList {
    pub serial: u64,
    pub allocator: AllocatorId,
    pub commands: Vec<Command>,
}

enum SoftKind {
    Buffer { desc: BufferDesc, data: Vec<u8> },
    Texture { desc: TextureDesc },
}

struct SoftResource {
    kind: SoftKind,
    state: ResourceState,
    last_used: u64,
}

impl SoftResource {
    fn name(&self) -> &str {
        match &self.kind {
            SoftKind::Buffer { desc, .. } => &desc.name,
            SoftKind::Texture { desc } => &desc.name,
        }
    }

    fn buffer_size(&self) -> Option<u64> {
        match &self.kind {
            SoftKind::Buffer { desc, .. } => Some(desc.size),
            SoftKind::Texture { .. } => None,
        }
    }

    fn texture(&self) -> Option<&TextureDesc> {
        match &self.kind {
            SoftKind::Texture { desc } => Some(desc),
            SoftKind::Buffer { .. } => None,
        }
    }
}

struct SoftHeap {
    desc: DescriptorHeapDesc,
    slots: Vec<Option<ViewDesc>>,
}

impl SoftHeap {
    fn category_at(&self, index: u32) -> Option<DescriptorCategory> {
        DescriptorCategory::ALL
            .into_iter()
            .filter(|c| c.heap_type() == self.desc.heap_type)
            .find(|&c| self.desc.layout.range(c).contains(&index))
    }
}

#[derive(Default)]
struct SoftFence {
    completed: u64,
    /// Queued signals with the submission serial they follow.
    pending: VecDeque<(u64, u64)>,
}

struct SoftAllocator {
    last_serial: u64,
}

struct SoftSwapChain {
    desc: SwapChainDesc,
    buffers: Vec<ResourceId>,
    current: u32,
}

struct State {
    policy: CompletionPolicy,
    /// Floor on the back buffers a swap chain gets, like a driver that
    /// hands out more images than requested.
    min_image_count: u32,
    resources: SlotMap<ResourceId, SoftResource>,
    heaps: SlotMap<HeapId, SoftHeap>,
    root_signatures: SlotMap<RootSignatureId, RootSignatureDesc>,
    pipelines: SlotMap<PipelineId, (PipelineStateDesc, RootSignatureId)>,
    allocators: SlotMap<AllocatorId, SoftAllocator>,
    fences: SlotMap<FenceId, SoftFence>,
    swap_chain: Option<SoftSwapChain>,
    serial: u64,
    completed_serial: u64,
    events: Vec<GpuEvent>,
    executed: Vec<ExecutedList>,
    hazards: Vec<String>,
}

impl State {
    fn resource(&self, id: ResourceId) -> RhiResult<&SoftResource> {
        self.resources
            .get(id)
            .ok_or_else(|| RhiError::InvalidHandle(format!("resource {id:?}")))
    }

    fn complete_front(&mut self, fence: FenceId) -> bool {
        let Some(f) = self.fences.get_mut(fence) else {
            return false;
        };
        let Some((value, serial)) = f.pending.pop_front() else {
            return false;
        };
        f.completed = f.completed.max(value);
        self.completed_serial = self.completed_serial.max(serial);
        self.events.push(GpuEvent::Complete { fence, value });
        true
    }

    fn complete_through(&mut self, fence: FenceId, value: u64) {
        while self
            .fences
            .get(fence)
            .and_then(|f| f.pending.front())
            .is_some_and(|&(v, _)| v <= value)
        {
            self.complete_front(fence);
        }
    }

    fn apply_policy(&mut self, fence: FenceId) {
        let keep = match self.policy {
            CompletionPolicy::Immediate => 0,
            CompletionPolicy::Lagged(n) => n as usize,
            CompletionPolicy::Manual => return,
        };
        while self.fences.get(fence).is_some_and(|f| f.pending.len() > keep) {
            self.complete_front(fence);
        }
    }

    /// The view in slot `index` of the first live heap of `heap_type`.
    fn view(&self, heap_type: DescriptorHeapType, index: u32) -> RhiResult<ViewDesc> {
        self.heaps
            .values()
            .filter(|h| h.desc.heap_type == heap_type)
            .find_map(|h| h.slots.get(index as usize).copied().flatten())
            .ok_or_else(|| {
                RhiError::Validation(format!("{heap_type:?} slot {index} holds no view"))
            })
    }
}

/// Host-memory implementation of [`GpuDevice`].
pub struct SoftDevice {
    adapter: AdapterInfo,
    state: Mutex<State>,
    completed: Condvar,
}

impl SoftDevice {
    /// A device whose fences complete immediately.
    pub fn new() -> Self {
        Self::with_policy(CompletionPolicy::Immediate)
    }

    pub fn with_policy(policy: CompletionPolicy) -> Self {
        info!("Creating soft device ({:?} completion)", policy);
        Self {
            adapter: AdapterInfo {
                name: "Ember Soft Device".to_string(),
                kind: AdapterKind::Cpu,
                vendor_id: 0,
                device_id: 0,
                api_version: "soft 1.0".to_string(),
            },
            state: Mutex::new(State {
                policy,
                min_image_count: 0,
                resources: SlotMap::with_key(),
                heaps: SlotMap::with_key(),
                root_signatures: SlotMap::with_key(),
                pipelines: SlotMap::with_key(),
                allocators: SlotMap::with_key(),
                fences: SlotMap::with_key(),
                swap_chain: None,
                serial: 0,
                completed_serial: 0,
                events: Vec::new(),
                executed: Vec::new(),
                hazards: Vec::new(),
            }),
            completed: Condvar::new(),
        }
    }

    pub fn set_policy(&self, policy: CompletionPolicy) {
        self.state.lock().policy = policy;
    }

    /// Swap chains created or resized afterwards hold at least `count`
    /// back buffers, whatever their description asks for.
    pub fn with_min_image_count(self, count: u32) -> Self {
        self.set_min_image_count(count);
        self
    }

    pub fn set_min_image_count(&self, count: u32) {
        self.state.lock().min_image_count = count;
    }

    /// Completes every queued signal on `fence` up to and including `value`.
    pub fn complete_through(&self, fence: FenceId, value: u64) {
        self.state.lock().complete_through(fence, value);
        self.completed.notify_all();
    }

    /// Completes the oldest queued signal on `fence`, if any.
    pub fn complete_next(&self, fence: FenceId) -> bool {
        let done = self.state.lock().complete_front(fence);
        self.completed.notify_all();
        done
    }

    /// Completes every queued signal on every fence.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        let fences: Vec<FenceId> = state.fences.keys().collect();
        for fence in fences {
            state.complete_through(fence, u64::MAX);
        }
        drop(state);
        self.completed.notify_all();
    }

    /// Signals queued but not yet completed on `fence`.
    pub fn pending_signals(&self, fence: FenceId) -> Vec<u64> {
        self.state
            .lock()
            .fences
            .get(fence)
            .map(|f| f.pending.iter().map(|&(v, _)| v).collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<GpuEvent> {
        self.state.lock().events.clone()
    }

    pub fn executed(&self) -> Vec<ExecutedList> {
        self.state.lock().executed.clone()
    }

    /// Resources destroyed while submitted work could still read them.
    pub fn hazards(&self) -> Vec<String> {
        self.state.lock().hazards.clone()
    }

    pub fn resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.state.lock().resources.get(resource).map(|r| r.state)
    }

    pub fn buffer_contents(&self, resource: ResourceId) -> Option<Vec<u8>> {
        match &self.state.lock().resources.get(resource)?.kind {
            SoftKind::Buffer { data, .. } => Some(data.clone()),
            SoftKind::Texture { .. } => None,
        }
    }

    pub fn texture_desc(&self, resource: ResourceId) -> Option<TextureDesc> {
        self.state.lock().resources.get(resource)?.texture().cloned()
    }

    pub fn is_live(&self, resource: ResourceId) -> bool {
        self.state.lock().resources.contains_key(resource)
    }

    pub fn live_resource_count(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// The view written into a heap slot.
    pub fn descriptor(&self, heap: HeapId, index: u32) -> Option<ViewDesc> {
        self.state
            .lock()
            .heaps
            .get(heap)?
            .slots
            .get(index as usize)
            .copied()
            .flatten()
    }

    fn validate_view(
        state: &State,
        category: DescriptorCategory,
        view: &ViewDesc,
    ) -> RhiResult<()> {
        if !view.fits(category) {
            return Err(RhiError::Validation(format!(
                "{view:?} written into a {category:?} slot"
            )));
        }
        let Some(id) = view.resource() else {
            return Ok(());
        };
        let resource = state.resource(id)?;

        match (*view, &resource.kind) {
            (ViewDesc::ConstantBuffer { offset, size, .. }, SoftKind::Buffer { desc, .. }) => {
                if !desc.usage.contains(BufferUsage::CONSTANT) || offset + size > desc.size {
                    return Err(RhiError::Validation(format!(
                        "constant buffer view outside '{}'",
                        desc.name
                    )));
                }
            }
            (ViewDesc::ShaderResource { dimension, .. }, SoftKind::Texture { desc }) => {
                let cube = matches!(dimension, crate::descriptor::ViewDimension::TextureCube);
                if cube != (desc.dimension == TextureDimension::Cube) {
                    return Err(RhiError::Validation(format!(
                        "view dimension {dimension:?} on '{}'",
                        desc.name
                    )));
                }
            }
            (ViewDesc::UnorderedAccess { mip, .. }, SoftKind::Texture { desc }) => {
                if mip >= desc.mip_levels || !desc.usage.contains(TextureUsage::STORAGE) {
                    return Err(RhiError::Validation(format!(
                        "storage view of mip {mip} on '{}'",
                        desc.name
                    )));
                }
            }
            (ViewDesc::RenderTarget { .. }, SoftKind::Texture { desc }) => {
                if !desc.usage.contains(TextureUsage::RENDER_TARGET) {
                    return Err(RhiError::Validation(format!(
                        "'{}' is not a render target",
                        desc.name
                    )));
                }
            }
            (ViewDesc::DepthStencil { .. }, SoftKind::Texture { desc }) => {
                if !desc.format.is_depth() {
                    return Err(RhiError::Validation(format!(
                        "'{}' has no depth format",
                        desc.name
                    )));
                }
            }
            _ => {
                return Err(RhiError::Validation(format!(
                    "{view:?} does not match resource '{}'",
                    resource.name()
                )));
            }
        }
        Ok(())
    }

    fn validate_commands(state: &mut State, serial: u64, commands: &[Command]) -> RhiResult<()> {
        let mut pipeline: Option<PipelineId> = None;
        let mut graphics_root: Option<RootSignatureId> = None;
        let mut compute_root: Option<RootSignatureId> = None;
        let mut targets: Vec<ResourceId> = Vec::new();
        let mut depth: Option<ResourceId> = None;
        let mut index_buffer: Option<IndexBufferView> = None;
        let mut has_vertex_buffers = false;
        let mut has_viewport = false;
        let mut has_scissor = false;

        let fail = |i: usize, msg: String| RhiError::Validation(format!("command {i}: {msg}"));

        for (i, command) in commands.iter().enumerate() {
            match command {
                Command::ResourceBarrier(barriers) => {
                    for b in barriers {
                        let Some(r) = state.resources.get_mut(b.resource) else {
                            return Err(fail(i, format!("barrier on dead resource {:?}", b.resource)));
                        };
                        if r.state != b.before {
                            return Err(fail(
                                i,
                                format!(
                                    "'{}' is {:?}, barrier expects {:?}",
                                    r.name(),
                                    r.state,
                                    b.before
                                ),
                            ));
                        }
                        r.state = b.after;
                        r.last_used = serial;
                    }
                }
                Command::ClearRenderTarget { rtv, .. } => {
                    let id = Self::target_of(state, DescriptorHeapType::Rtv, *rtv)
                        .map_err(|e| fail(i, e.to_string()))?;
                    Self::expect_state(state, id, ResourceState::RenderTarget, serial)
                        .map_err(|e| fail(i, e))?;
                }
                Command::ClearDepthStencil { dsv, .. } => {
                    let id = Self::target_of(state, DescriptorHeapType::Dsv, *dsv)
                        .map_err(|e| fail(i, e.to_string()))?;
                    Self::expect_state(state, id, ResourceState::DepthWrite, serial)
                        .map_err(|e| fail(i, e))?;
                }
                Command::SetViewport(_) => has_viewport = true,
                Command::SetScissor(_) => has_scissor = true,
                Command::SetRenderTargets { color, depth: dsv } => {
                    targets.clear();
                    for &rtv in color {
                        let id = Self::target_of(state, DescriptorHeapType::Rtv, rtv)
                            .map_err(|e| fail(i, e.to_string()))?;
                        targets.push(id);
                    }
                    depth = match dsv {
                        Some(dsv) => Some(
                            Self::target_of(state, DescriptorHeapType::Dsv, *dsv)
                                .map_err(|e| fail(i, e.to_string()))?,
                        ),
                        None => None,
                    };
                }
                Command::SetPipelineState(id) => {
                    if !state.pipelines.contains_key(*id) {
                        return Err(fail(i, format!("unknown pipeline {id:?}")));
                    }
                    pipeline = Some(*id);
                }
                Command::SetRootSignature {
                    bind_point,
                    root_signature,
                } => {
                    if !state.root_signatures.contains_key(*root_signature) {
                        return Err(fail(i, format!("unknown root signature {root_signature:?}")));
                    }
                    match bind_point {
                        BindPoint::Graphics => graphics_root = Some(*root_signature),
                        BindPoint::Compute => compute_root = Some(*root_signature),
                    }
                }
                Command::SetDescriptorHeaps(heaps) => {
                    let mut seen = Vec::new();
                    for heap in heaps {
                        let Some(h) = state.heaps.get(*heap) else {
                            return Err(fail(i, format!("unknown heap {heap:?}")));
                        };
                        if seen.contains(&h.desc.heap_type) {
                            return Err(fail(i, format!("two {:?} heaps bound", h.desc.heap_type)));
                        }
                        seen.push(h.desc.heap_type);
                    }
                }
                Command::SetRootDescriptorTable {
                    bind_point,
                    parameter,
                    ..
                } => {
                    let root = match bind_point {
                        BindPoint::Graphics => graphics_root,
                        BindPoint::Compute => compute_root,
                    };
                    let Some(desc) = root.and_then(|r| state.root_signatures.get(r)) else {
                        return Err(fail(i, "descriptor table set without a root signature".into()));
                    };
                    if desc.parameter_dwords(*parameter).is_none() {
                        return Err(fail(i, format!("root parameter {parameter} does not exist")));
                    }
                }
                Command::SetRoot32BitConstants {
                    bind_point,
                    parameter,
                    offset,
                    values,
                } => {
                    let root = match bind_point {
                        BindPoint::Graphics => graphics_root,
                        BindPoint::Compute => compute_root,
                    };
                    let Some(desc) = root.and_then(|r| state.root_signatures.get(r)) else {
                        return Err(fail(i, "root constants set without a root signature".into()));
                    };
                    let room = desc.parameter_dwords(*parameter).unwrap_or(0);
                    if offset + values.len() as u32 > room {
                        return Err(fail(
                            i,
                            format!(
                                "{} constants at offset {offset} overflow parameter {parameter} ({room})",
                                values.len()
                            ),
                        ));
                    }
                }
                Command::SetPrimitiveTopology(_) => {}
                Command::SetVertexBuffers { views, .. } => {
                    for view in views {
                        Self::check_buffer_range(state, view.resource, view.offset, view.size, serial)
                            .map_err(|e| fail(i, e))?;
                    }
                    has_vertex_buffers = true;
                }
                Command::SetIndexBuffer(view) => {
                    Self::check_buffer_range(state, view.resource, view.offset, view.size, serial)
                        .map_err(|e| fail(i, e))?;
                    index_buffer = Some(*view);
                }
                Command::DrawInstanced { .. } | Command::DrawIndexedInstanced { .. } => {
                    let Some((desc, root)) = pipeline
                        .and_then(|p| state.pipelines.get(p))
                        .map(|(d, r)| (d.clone(), *r))
                    else {
                        return Err(fail(i, "draw without a pipeline".into()));
                    };
                    if desc.kind != PipelineKind::Graphics {
                        return Err(fail(i, format!("draw with compute pipeline '{}'", desc.name)));
                    }
                    if graphics_root != Some(root) {
                        return Err(fail(
                            i,
                            format!("pipeline '{}' bound with a different root signature", desc.name),
                        ));
                    }
                    if targets.is_empty() {
                        return Err(fail(i, "draw without a render target".into()));
                    }
                    if !has_viewport || !has_scissor {
                        return Err(fail(i, "draw without viewport and scissor".into()));
                    }
                    if desc.vertex_layout.is_some() && !has_vertex_buffers {
                        return Err(fail(i, format!("'{}' needs vertex buffers", desc.name)));
                    }
                    let needs_depth = desc.depth == crate::pipeline::DepthTesting::Less;
                    for &t in &targets {
                        Self::expect_state(state, t, ResourceState::RenderTarget, serial)
                            .map_err(|e| fail(i, e))?;
                    }
                    match (needs_depth, depth) {
                        (true, None) => {
                            return Err(fail(i, "depth-tested draw without a depth buffer".into()));
                        }
                        (true, Some(d)) => Self::expect_state(state, d, ResourceState::DepthWrite, serial)
                            .map_err(|e| fail(i, e))?,
                        _ => {}
                    }

                    if let Command::DrawIndexedInstanced {
                        index_count,
                        start_index,
                        ..
                    } = command
                    {
                        let Some(ib) = index_buffer else {
                            return Err(fail(i, "indexed draw without an index buffer".into()));
                        };
                        let needed = u64::from(*start_index) + u64::from(*index_count);
                        if needed > ib.index_count() {
                            return Err(fail(
                                i,
                                format!("draw reads {needed} indices, buffer holds {}", ib.index_count()),
                            ));
                        }
                    }
                }
                Command::Dispatch { .. } => {
                    let Some((desc, root)) = pipeline.and_then(|p| state.pipelines.get(p)) else {
                        return Err(fail(i, "dispatch without a pipeline".into()));
                    };
                    if desc.kind != PipelineKind::Compute {
                        return Err(fail(i, format!("dispatch with graphics pipeline '{}'", desc.name)));
                    }
                    if compute_root != Some(*root) {
                        return Err(fail(i, "dispatch without its compute root signature".into()));
                    }
                }
                Command::CopyBufferRegion {
                    dst,
                    dst_offset,
                    src,
                    src_offset,
                    size,
                } => {
                    Self::check_buffer_range(state, *src, *src_offset, *size, serial)
                        .map_err(|e| fail(i, e))?;
                    Self::check_buffer_range(state, *dst, *dst_offset, *size, serial)
                        .map_err(|e| fail(i, e))?;
                    Self::expect_copy_source(state, *src).map_err(|e| fail(i, e))?;
                    Self::expect_state(state, *dst, ResourceState::CopyDest, serial)
                        .map_err(|e| fail(i, e))?;

                    let bytes = match &state.resources[*src].kind {
                        SoftKind::Buffer { data, .. } => {
                            data[*src_offset as usize..(*src_offset + *size) as usize].to_vec()
                        }
                        SoftKind::Texture { .. } => Vec::new(),
                    };
                    if let SoftKind::Buffer { data, .. } = &mut state.resources[*dst].kind {
                        data[*dst_offset as usize..(*dst_offset + *size) as usize]
                            .copy_from_slice(&bytes);
                    }
                }
                Command::CopyBufferToTexture {
                    src,
                    src_offset,
                    dst,
                    mip,
                    layer,
                } => {
                    let texture = state
                        .resource(*dst)
                        .map_err(|e| fail(i, e.to_string()))?
                        .texture()
                        .cloned()
                        .ok_or_else(|| fail(i, "copy destination is not a texture".into()))?;
                    if *mip >= texture.mip_levels || *layer >= texture.array_layers {
                        return Err(fail(
                            i,
                            format!("subresource {mip}/{layer} outside '{}'", texture.name),
                        ));
                    }
                    let size = texture.mip_size_bytes(*mip);
                    Self::check_buffer_range(state, *src, *src_offset, size, serial)
                        .map_err(|e| fail(i, e))?;
                    Self::expect_copy_source(state, *src).map_err(|e| fail(i, e))?;
                    Self::expect_state(state, *dst, ResourceState::CopyDest, serial)
                        .map_err(|e| fail(i, e))?;
                }
            }
        }
        Ok(())
    }

    fn target_of(state: &State, heap_type: DescriptorHeapType, index: u32) -> RhiResult<ResourceId> {
        state
            .view(heap_type, index)?
            .resource()
            .ok_or_else(|| RhiError::Validation(format!("{heap_type:?} slot {index} has no resource")))
    }

    fn expect_state(
        state: &mut State,
        id: ResourceId,
        expected: ResourceState,
        serial: u64,
    ) -> Result<(), String> {
        let Some(r) = state.resources.get_mut(id) else {
            return Err(format!("resource {id:?} is dead"));
        };
        if r.state != expected {
            return Err(format!("'{}' is {:?}, needs {:?}", r.name(), r.state, expected));
        }
        r.last_used = serial;
        Ok(())
    }

    fn expect_copy_source(state: &State, id: ResourceId) -> Result<(), String> {
        let r = state.resource(id).map_err(|e| e.to_string())?;
        match r.state {
            ResourceState::GenericRead | ResourceState::CopySource => Ok(()),
            other => Err(format!("copy source '{}' is {:?}", r.name(), other)),
        }
    }

    fn check_buffer_range(
        state: &mut State,
        id: ResourceId,
        offset: u64,
        size: u64,
        serial: u64,
    ) -> Result<(), String> {
        let Some(r) = state.resources.get_mut(id) else {
            return Err(format!("buffer {id:?} is dead"));
        };
        let Some(total) = r.buffer_size() else {
            return Err(format!("'{}' is not a buffer", r.name()));
        };
        if offset + size > total {
            return Err(format!(
                "range {offset}+{size} outside '{}' ({total} bytes)",
                r.name()
            ));
        }
        r.last_used = serial;
        Ok(())
    }

    fn create_back_buffers(state: &mut State, desc: &SwapChainDesc) -> Vec<ResourceId> {
        (0..desc.buffer_count.max(state.min_image_count))
            .map(|i| {
                let mut texture = TextureDesc::new_2d(
                    format!("back buffer {i}"),
                    desc.width,
                    desc.height,
                    desc.format,
                    TextureUsage::RENDER_TARGET,
                );
                texture.initial_state = ResourceState::Present;
                state.resources.insert(SoftResource {
                    kind: SoftKind::Texture { desc: texture },
                    state: ResourceState::Present,
                    last_used: 0,
                })
            })
            .collect()
    }

    fn destroy_locked(state: &mut State, resource: ResourceId) {
        if let Some(r) = state.resources.remove(resource)
            && r.last_used > state.completed_serial
        {
            state.hazards.push(format!(
                "'{}' destroyed while submission {} may still use it (completed {})",
                r.name(),
                r.last_used,
                state.completed_serial
            ));
        }
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for SoftDevice {
    fn backend(&self) -> Backend {
        Backend::Soft
    }

    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<ResourceId> {
        if desc.size == 0 {
            return Err(RhiError::Validation(format!("buffer '{}' has zero size", desc.name)));
        }
        let mut state = self.state.lock();
        let id = state.resources.insert(SoftResource {
            kind: SoftKind::Buffer {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
            state: desc.initial_state(),
            last_used: 0,
        });
        debug!("Soft buffer '{}' ({} bytes)", desc.name, desc.size);
        Ok(id)
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<ResourceId> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(RhiError::Validation(format!("texture '{}' is empty", desc.name)));
        }
        if desc.dimension == TextureDimension::Cube && desc.array_layers != 6 {
            return Err(RhiError::Validation(format!(
                "cube texture '{}' needs 6 layers",
                desc.name
            )));
        }
        let mut state = self.state.lock();
        let id = state.resources.insert(SoftResource {
            kind: SoftKind::Texture { desc: desc.clone() },
            state: desc.initial_state,
            last_used: 0,
        });
        debug!("Soft texture '{}' {}x{}", desc.name, desc.width, desc.height);
        Ok(id)
    }

    fn write_buffer(&self, buffer: ResourceId, offset: u64, bytes: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        let Some(r) = state.resources.get_mut(buffer) else {
            return Err(RhiError::InvalidHandle(format!("buffer {buffer:?}")));
        };
        let SoftKind::Buffer { desc, data } = &mut r.kind else {
            return Err(RhiError::Validation("write_buffer on a texture".to_string()));
        };
        if desc.heap == HeapKind::Default {
            return Err(RhiError::Validation(format!(
                "'{}' lives in the default heap and is not CPU-visible",
                desc.name
            )));
        }
        let end = offset as usize + bytes.len();
        if end > data.len() {
            return Err(RhiError::Validation(format!(
                "write of {} bytes at {offset} overflows '{}'",
                bytes.len(),
                desc.name
            )));
        }
        data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn destroy_resource(&self, resource: ResourceId) {
        Self::destroy_locked(&mut self.state.lock(), resource);
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> RhiResult<HeapId> {
        let capacity = desc.layout.heap_capacity(desc.heap_type);
        let mut state = self.state.lock();
        Ok(state.heaps.insert(SoftHeap {
            desc: *desc,
            slots: vec![None; capacity as usize],
        }))
    }

    fn write_descriptor(&self, heap: HeapId, index: u32, view: &ViewDesc) -> RhiResult<()> {
        let mut state = self.state.lock();
        let Some(h) = state.heaps.get(heap) else {
            return Err(RhiError::InvalidHandle(format!("heap {heap:?}")));
        };
        let Some(category) = h.category_at(index) else {
            return Err(RhiError::Validation(format!(
                "slot {index} outside {:?} heap",
                h.desc.heap_type
            )));
        };
        Self::validate_view(&state, category, view)?;
        if let Some(h) = state.heaps.get_mut(heap) {
            h.slots[index as usize] = Some(*view);
        }
        Ok(())
    }

    fn destroy_descriptor_heap(&self, heap: HeapId) {
        self.state.lock().heaps.remove(heap);
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> RhiResult<RootSignatureId> {
        desc.validate()?;
        Ok(self.state.lock().root_signatures.insert(desc.clone()))
    }

    fn create_pipeline_state(
        &self,
        desc: &PipelineStateDesc,
        root_signature: RootSignatureId,
    ) -> RhiResult<PipelineId> {
        desc.validate()?;
        let mut state = self.state.lock();
        if !state.root_signatures.contains_key(root_signature) {
            return Err(RhiError::InvalidHandle(format!(
                "root signature {root_signature:?}"
            )));
        }
        Ok(state.pipelines.insert((desc.clone(), root_signature)))
    }

    fn destroy_pipeline_state(&self, pipeline: PipelineId) {
        self.state.lock().pipelines.remove(pipeline);
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        self.state.lock().root_signatures.remove(root_signature);
    }

    fn create_command_allocator(&self) -> RhiResult<AllocatorId> {
        Ok(self
            .state
            .lock()
            .allocators
            .insert(SoftAllocator { last_serial: 0 }))
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> RhiResult<()> {
        let mut state = self.state.lock();
        let completed = state.completed_serial;
        let Some(a) = state.allocators.get(allocator) else {
            return Err(RhiError::InvalidHandle(format!("allocator {allocator:?}")));
        };
        if a.last_serial > completed {
            return Err(RhiError::Validation(format!(
                "allocator {allocator:?} reset while submission {} is executing (completed {completed})",
                a.last_serial
            )));
        }
        state.events.push(GpuEvent::AllocatorReset { allocator });
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        self.state.lock().allocators.remove(allocator);
    }

    fn execute(&self, allocator: AllocatorId, commands: &[Command]) -> RhiResult<()> {
        let mut state = self.state.lock();
        if !state.allocators.contains_key(allocator) {
            return Err(RhiError::InvalidHandle(format!("allocator {allocator:?}")));
        }

        let serial = state.serial + 1;
        Self::validate_commands(&mut state, serial, commands)?;

        state.serial = serial;
        if let Some(a) = state.allocators.get_mut(allocator) {
            a.last_serial = serial;
        }
        state.events.push(GpuEvent::Execute { allocator, serial });
        state.executed.push(ExecutedList {
            serial,
            allocator,
            commands: commands.to_vec(),
        });
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> RhiResult<FenceId> {
        Ok(self.state.lock().fences.insert(SoftFence {
            completed: initial_value,
            pending: VecDeque::new(),
        }))
    }

    fn signal(&self, fence: FenceId, value: u64) -> RhiResult<()> {
        let mut state = self.state.lock();
        let serial = state.serial;
        let Some(f) = state.fences.get_mut(fence) else {
            return Err(RhiError::InvalidHandle(format!("fence {fence:?}")));
        };
        f.pending.push_back((value, serial));
        state.events.push(GpuEvent::Signal { fence, value });
        state.apply_policy(fence);
        drop(state);
        self.completed.notify_all();
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> RhiResult<u64> {
        self.state
            .lock()
            .fences
            .get(fence)
            .map(|f| f.completed)
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {fence:?}")))
    }

    fn wait_for_value(&self, fence: FenceId, value: u64, timeout: Duration) -> RhiResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.events.push(GpuEvent::Wait { fence, value });

        loop {
            let Some(f) = state.fences.get(fence) else {
                return Err(RhiError::InvalidHandle(format!("fence {fence:?}")));
            };
            if f.completed >= value {
                return Ok(true);
            }
            match state.policy {
                CompletionPolicy::Immediate | CompletionPolicy::Lagged(_) => {
                    state.complete_through(fence, value);
                    let reached = state.fences.get(fence).is_some_and(|f| f.completed >= value);
                    return Ok(reached);
                }
                CompletionPolicy::Manual => {
                    if self.completed.wait_until(&mut state, deadline).timed_out() {
                        let reached = state.fences.get(fence).is_some_and(|f| f.completed >= value);
                        return Ok(reached);
                    }
                }
            }
        }
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(fence);
    }

    fn create_swap_chain(&self, desc: &SwapChainDesc) -> RhiResult<Vec<ResourceId>> {
        let mut state = self.state.lock();
        if state.swap_chain.is_some() {
            return Err(RhiError::Swapchain("swap chain already exists".to_string()));
        }
        let buffers = Self::create_back_buffers(&mut state, desc);
        state.swap_chain = Some(SoftSwapChain {
            desc: *desc,
            buffers: buffers.clone(),
            current: 0,
        });
        info!(
            "Soft swap chain {}x{} with {} buffers ({} requested)",
            desc.width,
            desc.height,
            buffers.len(),
            desc.buffer_count
        );
        Ok(buffers)
    }

    fn resize_swap_chain(&self, width: u32, height: u32) -> RhiResult<Vec<ResourceId>> {
        let mut state = self.state.lock();
        if state.completed_serial < state.serial {
            return Err(RhiError::Validation(format!(
                "swap chain resized while submission {} is executing",
                state.serial
            )));
        }
        let Some(old) = state.swap_chain.take() else {
            return Err(RhiError::Swapchain("no swap chain to resize".to_string()));
        };
        for id in &old.buffers {
            Self::destroy_locked(&mut state, *id);
        }

        let desc = SwapChainDesc {
            width,
            height,
            ..old.desc
        };
        let buffers = Self::create_back_buffers(&mut state, &desc);
        state.swap_chain = Some(SoftSwapChain {
            desc,
            buffers: buffers.clone(),
            current: 0,
        });
        state.events.push(GpuEvent::SwapChainResized { width, height });
        Ok(buffers)
    }

    fn current_back_buffer_index(&self) -> RhiResult<u32> {
        self.state
            .lock()
            .swap_chain
            .as_ref()
            .map(|s| s.current)
            .ok_or_else(|| RhiError::Swapchain("no swap chain".to_string()))
    }

    fn present(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        let Some(chain) = state.swap_chain.as_ref() else {
            return Err(RhiError::Swapchain("present without a swap chain".to_string()));
        };
        let index = chain.current;
        let count = chain.buffers.len() as u32;
        let buffer = chain.buffers[index as usize];

        let current = state.resource(buffer)?.state;
        if current != ResourceState::Present {
            return Err(RhiError::Validation(format!(
                "presented back buffer {index} in state {current:?}"
            )));
        }

        if let Some(chain) = state.swap_chain.as_mut() {
            chain.current = (index + 1) % count;
        }
        state.events.push(GpuEvent::Present { index });
        Ok(())
    }

    fn destroy_swap_chain(&self) {
        let mut state = self.state.lock();
        if let Some(chain) = state.swap_chain.take() {
            for id in chain.buffers {
                Self::destroy_locked(&mut state, id);
            }
        }
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        let fences: Vec<FenceId> = state.fences.keys().collect();
        for fence in fences {
            state.complete_through(fence, u64::MAX);
        }
        state.completed_serial = state.serial;
        drop(state);
        self.completed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HeapLayout;

    fn upload_buffer(device: &SoftDevice, size: u64) -> ResourceId {
        device
            .create_buffer(&BufferDesc {
                name: "upload".into(),
                size,
                heap: HeapKind::Upload,
                usage: BufferUsage::CONSTANT | BufferUsage::COPY_SRC,
            })
            .unwrap()
    }

    #[test]
    fn test_write_buffer_roundtrip() {
        let device = SoftDevice::new();
        let buffer = upload_buffer(&device, 16);
        device.write_buffer(buffer, 4, &[1, 2, 3]).unwrap();
        assert_eq!(&device.buffer_contents(buffer).unwrap()[3..8], &[0, 1, 2, 3, 0]);
        assert!(device.write_buffer(buffer, 15, &[1, 2]).is_err());
    }

    #[test]
    fn test_default_heap_not_writable() {
        let device = SoftDevice::new();
        let buffer = device
            .create_buffer(&BufferDesc {
                name: "vb".into(),
                size: 64,
                heap: HeapKind::Default,
                usage: BufferUsage::VERTEX,
            })
            .unwrap();
        assert!(device.write_buffer(buffer, 0, &[0; 4]).is_err());
    }

    #[test]
    fn test_barrier_before_state_checked() {
        let device = SoftDevice::new();
        let allocator = device.create_command_allocator().unwrap();
        let texture = device
            .create_texture(&TextureDesc::new_2d(
                "t",
                4,
                4,
                crate::types::Format::Rgba8Unorm,
                TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            ))
            .unwrap();

        let wrong = [Command::ResourceBarrier(vec![crate::command::Barrier::transition(
            texture,
            ResourceState::CopyDest,
            ResourceState::PixelShaderResource,
        )])];
        assert!(matches!(
            device.execute(allocator, &wrong),
            Err(RhiError::Validation(_))
        ));

        let right = [Command::ResourceBarrier(vec![crate::command::Barrier::transition(
            texture,
            ResourceState::Common,
            ResourceState::CopyDest,
        )])];
        device.execute(allocator, &right).unwrap();
        assert_eq!(device.resource_state(texture), Some(ResourceState::CopyDest));
    }

    #[test]
    fn test_allocator_reset_waits_for_completion() {
        let device = SoftDevice::with_policy(CompletionPolicy::Manual);
        let allocator = device.create_command_allocator().unwrap();
        let fence = device.create_fence(0).unwrap();

        device.execute(allocator, &[]).unwrap();
        device.signal(fence, 1).unwrap();
        assert!(device.reset_command_allocator(allocator).is_err());

        device.complete_through(fence, 1);
        device.reset_command_allocator(allocator).unwrap();
    }

    #[test]
    fn test_lagged_policy_keeps_newest_pending() {
        let device = SoftDevice::with_policy(CompletionPolicy::Lagged(1));
        let fence = device.create_fence(0).unwrap();
        device.signal(fence, 1).unwrap();
        assert_eq!(device.completed_value(fence).unwrap(), 0);
        device.signal(fence, 2).unwrap();
        assert_eq!(device.completed_value(fence).unwrap(), 1);
        assert!(device.wait_for_value(fence, 2, Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn test_manual_wait_times_out() {
        let device = SoftDevice::with_policy(CompletionPolicy::Manual);
        let fence = device.create_fence(0).unwrap();
        device.signal(fence, 1).unwrap();
        assert!(!device.wait_for_value(fence, 1, Duration::from_millis(5)).unwrap());
        assert_eq!(device.pending_signals(fence), vec![1]);
    }

    #[test]
    fn test_destroying_busy_resource_is_a_hazard() {
        let device = SoftDevice::with_policy(CompletionPolicy::Manual);
        let allocator = device.create_command_allocator().unwrap();
        let src = upload_buffer(&device, 16);
        let dst = device
            .create_buffer(&BufferDesc {
                name: "dst".into(),
                size: 16,
                heap: HeapKind::Readback,
                usage: BufferUsage::COPY_DST,
            })
            .unwrap();

        device
            .execute(
                allocator,
                &[Command::CopyBufferRegion {
                    dst,
                    dst_offset: 0,
                    src,
                    src_offset: 0,
                    size: 16,
                }],
            )
            .unwrap();
        device.destroy_resource(src);
        assert_eq!(device.hazards().len(), 1);

        device.wait_idle().unwrap();
        device.destroy_resource(dst);
        assert_eq!(device.hazards().len(), 1);
    }

    #[test]
    fn test_descriptor_category_enforced() {
        let device = SoftDevice::new();
        let heap = device
            .create_descriptor_heap(&DescriptorHeapDesc {
                heap_type: DescriptorHeapType::CbvSrvUav,
                layout: HeapLayout {
                    constant_buffers: 2,
                    textures: 2,
                    mips: 2,
                    ..Default::default()
                },
            })
            .unwrap();
        let buffer = upload_buffer(&device, 256);
        let cbv = ViewDesc::ConstantBuffer {
            resource: buffer,
            offset: 0,
            size: 256,
        };

        device.write_descriptor(heap, 1, &cbv).unwrap();
        assert!(device.write_descriptor(heap, 2, &cbv).is_err());
        assert!(device.write_descriptor(heap, 6, &cbv).is_err());
        assert_eq!(device.descriptor(heap, 1), Some(cbv));
    }

    #[test]
    fn test_present_rotates_back_buffers() {
        let device = SoftDevice::new();
        device
            .create_swap_chain(&SwapChainDesc {
                width: 8,
                height: 8,
                buffer_count: 2,
                format: crate::types::Format::Bgra8Unorm,
            })
            .unwrap();
        assert_eq!(device.current_back_buffer_index().unwrap(), 0);
        device.present().unwrap();
        assert_eq!(device.current_back_buffer_index().unwrap(), 1);
        device.present().unwrap();
        assert_eq!(device.current_back_buffer_index().unwrap(), 0);
    }

    #[test]
    fn test_min_image_count_over_provisions() {
        let device = SoftDevice::new().with_min_image_count(3);
        let desc = SwapChainDesc {
            width: 8,
            height: 8,
            buffer_count: 2,
            format: crate::types::Format::Bgra8Unorm,
        };
        assert_eq!(device.create_swap_chain(&desc).unwrap().len(), 3);
        for expected in [1, 2, 0] {
            device.present().unwrap();
            assert_eq!(device.current_back_buffer_index().unwrap(), expected);
        }
        assert_eq!(device.resize_swap_chain(16, 16).unwrap().len(), 3);
    }
}
