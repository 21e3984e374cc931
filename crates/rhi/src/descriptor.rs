//! Descriptor heaps, their category partitions and slot allocation.
//!
//! Four heaps exist per device: one shader-visible heap for constant
//! buffers, textures and mip views, plus render-target, depth-stencil and
//! sampler heaps. The shader-visible heap is split into fixed ranges:
//!
//! ```text
//! [0, K)          constant buffer views
//! [K, K+M)        texture shader resource views
//! [K+M, K+M+L)    per-mip unordered access views
//! ```
//!
//! Each range has its own [`RegionAllocator`] with its own lock, so
//! allocating a texture view never waits on a constant buffer allocation.
//! Slots are handed out wrapped in a reference-counted [`DescriptorHandle`];
//! dropping the last clone does not free the slot immediately but retires it
//! to the fence-keyed [`RetireQueue`](crate::retire::RetireQueue).

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RhiError, RhiResult};
use crate::retire::{RetireQueue, Retired};
use crate::types::{ResourceId, SamplerDesc};

/// Descriptor heap kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// Shader-visible constant buffer, shader resource and unordered access views.
    CbvSrvUav,
    Rtv,
    Dsv,
    Sampler,
}

/// Partition of a heap that a view lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorCategory {
    ConstantBuffer,
    Texture,
    Mip,
    RenderTarget,
    DepthStencil,
    Sampler,
}

impl DescriptorCategory {
    pub const ALL: [Self; 6] = [
        Self::ConstantBuffer,
        Self::Texture,
        Self::Mip,
        Self::RenderTarget,
        Self::DepthStencil,
        Self::Sampler,
    ];

    pub fn heap_type(self) -> DescriptorHeapType {
        match self {
            Self::ConstantBuffer | Self::Texture | Self::Mip => DescriptorHeapType::CbvSrvUav,
            Self::RenderTarget => DescriptorHeapType::Rtv,
            Self::DepthStencil => DescriptorHeapType::Dsv,
            Self::Sampler => DescriptorHeapType::Sampler,
        }
    }
}

/// Slot counts for every category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    pub constant_buffers: u32,
    pub textures: u32,
    pub mips: u32,
    pub render_targets: u32,
    pub depth_stencils: u32,
    pub samplers: u32,
}

impl Default for HeapLayout {
    fn default() -> Self {
        Self {
            constant_buffers: 256,
            textures: 1024,
            mips: 256,
            render_targets: 16,
            depth_stencils: 4,
            samplers: 16,
        }
    }
}

impl HeapLayout {
    pub fn capacity(&self, category: DescriptorCategory) -> u32 {
        match category {
            DescriptorCategory::ConstantBuffer => self.constant_buffers,
            DescriptorCategory::Texture => self.textures,
            DescriptorCategory::Mip => self.mips,
            DescriptorCategory::RenderTarget => self.render_targets,
            DescriptorCategory::DepthStencil => self.depth_stencils,
            DescriptorCategory::Sampler => self.samplers,
        }
    }

    /// Index range a category occupies inside its heap.
    pub fn range(&self, category: DescriptorCategory) -> Range<u32> {
        let start = match category {
            DescriptorCategory::Texture => self.constant_buffers,
            DescriptorCategory::Mip => self.constant_buffers + self.textures,
            _ => 0,
        };
        start..start + self.capacity(category)
    }

    /// Total slots in a heap.
    pub fn heap_capacity(&self, heap_type: DescriptorHeapType) -> u32 {
        DescriptorCategory::ALL
            .iter()
            .filter(|c| c.heap_type() == heap_type)
            .map(|&c| self.capacity(c))
            .sum()
    }
}

/// Creation parameters for a device-side heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub heap_type: DescriptorHeapType,
    pub layout: HeapLayout,
}

/// How a shader resource view interprets its texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDimension {
    Texture2D,
    TextureCube,
}

/// A view to write into a heap slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewDesc {
    ConstantBuffer {
        resource: ResourceId,
        offset: u64,
        size: u64,
    },
    ShaderResource {
        resource: ResourceId,
        dimension: ViewDimension,
        mip_levels: u32,
    },
    UnorderedAccess {
        resource: ResourceId,
        mip: u32,
    },
    RenderTarget {
        resource: ResourceId,
        mip: u32,
    },
    DepthStencil {
        resource: ResourceId,
    },
    Sampler(SamplerDesc),
}

impl ViewDesc {
    /// The resource the view points at, if any.
    pub fn resource(&self) -> Option<ResourceId> {
        match *self {
            Self::ConstantBuffer { resource, .. }
            | Self::ShaderResource { resource, .. }
            | Self::UnorderedAccess { resource, .. }
            | Self::RenderTarget { resource, .. }
            | Self::DepthStencil { resource } => Some(resource),
            Self::Sampler(_) => None,
        }
    }

    /// Whether this view may be written into a slot of `category`.
    pub fn fits(&self, category: DescriptorCategory) -> bool {
        matches!(
            (self, category),
            (Self::ConstantBuffer { .. }, DescriptorCategory::ConstantBuffer)
                | (Self::ShaderResource { .. }, DescriptorCategory::Texture)
                | (Self::UnorderedAccess { .. }, DescriptorCategory::Mip)
                | (Self::RenderTarget { .. }, DescriptorCategory::RenderTarget)
                | (Self::DepthStencil { .. }, DescriptorCategory::DepthStencil)
                | (Self::Sampler(_), DescriptorCategory::Sampler)
        )
    }
}

struct RegionState {
    /// Free relative indices; popped from the back.
    free: Vec<u32>,
    in_use: Vec<bool>,
}

/// Free-list allocator over one category's index range.
///
/// Single allocations pop the free stack in O(1). Contiguous allocations
/// scan for a run of free slots and are meant for rare, creation-time use.
pub struct RegionAllocator {
    category: DescriptorCategory,
    base: u32,
    capacity: u32,
    state: Mutex<RegionState>,
}

impl RegionAllocator {
    pub fn new(category: DescriptorCategory, range: Range<u32>) -> Self {
        let capacity = range.end - range.start;
        Self {
            category,
            base: range.start,
            capacity,
            state: Mutex::new(RegionState {
                free: (0..capacity).rev().collect(),
                in_use: vec![false; capacity as usize],
            }),
        }
    }

    /// Takes one free slot and returns its absolute heap index.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::HeapExhausted`] when no slot is free.
    pub fn allocate(&self) -> RhiResult<u32> {
        let mut state = self.state.lock();
        let Some(relative) = state.free.pop() else {
            return Err(self.exhausted(1));
        };
        state.in_use[relative as usize] = true;
        Ok(self.base + relative)
    }

    /// Takes `count` adjacent slots and returns the first absolute index.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::HeapExhausted`] when no run of `count` free slots
    /// exists, even if enough scattered slots are free.
    pub fn allocate_contiguous(&self, count: u32) -> RhiResult<u32> {
        if count == 0 {
            return Err(RhiError::InvalidState(
                "contiguous descriptor allocation of zero slots".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let mut run = 0u32;
        let mut start = None;
        for (i, used) in state.in_use.iter().enumerate() {
            if *used {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                start = Some(i as u32 + 1 - count);
                break;
            }
        }

        let Some(start) = start else {
            return Err(self.exhausted(count));
        };
        let taken = start..start + count;
        for i in taken.clone() {
            state.in_use[i as usize] = true;
        }
        state.free.retain(|i| !taken.contains(i));
        Ok(self.base + start)
    }

    /// Returns `count` slots starting at absolute index `first`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidHandle`] for indices outside the region or
    /// slots that are already free.
    pub fn release(&self, first: u32, count: u32) -> RhiResult<()> {
        let end = first.checked_add(count).unwrap_or(u32::MAX);
        if first < self.base || end > self.base + self.capacity {
            return Err(RhiError::InvalidHandle(format!(
                "{:?} slots {first}..{end} outside region {}..{}",
                self.category,
                self.base,
                self.base + self.capacity
            )));
        }

        let mut state = self.state.lock();
        let relative = (first - self.base)..(end - self.base);
        // The whole run is checked before any slot is freed.
        if let Some(free) = relative.clone().find(|&i| !state.in_use[i as usize]) {
            return Err(RhiError::InvalidHandle(format!(
                "{:?} slot {} released twice",
                self.category,
                self.base + free
            )));
        }
        for i in relative {
            state.in_use[i as usize] = false;
            state.free.push(i);
        }
        Ok(())
    }

    pub fn category(&self) -> DescriptorCategory {
        self.category
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Absolute index range this allocator hands out.
    pub fn range(&self) -> Range<u32> {
        self.base..self.base + self.capacity
    }

    pub fn used(&self) -> u32 {
        self.capacity - self.state.lock().free.len() as u32
    }

    fn exhausted(&self, requested: u32) -> RhiError {
        RhiError::HeapExhausted {
            category: self.category,
            capacity: self.capacity,
            requested,
        }
    }
}

struct DescriptorSlot {
    category: DescriptorCategory,
    index: u32,
    count: u32,
    retire: Arc<RetireQueue>,
}

impl Drop for DescriptorSlot {
    fn drop(&mut self) {
        debug!(
            "Retiring {:?} descriptor {} (+{})",
            self.category, self.index, self.count
        );
        self.retire.retire(Retired::Descriptor {
            category: self.category,
            first: self.index,
            count: self.count,
        });
    }
}

/// Reference-counted ownership of one or more adjacent heap slots.
///
/// Cloning shares the slots. When the last clone drops, the slots are
/// retired at the current frame's fence value and return to the free list
/// once the GPU has passed it.
#[derive(Clone)]
pub struct DescriptorHandle(Arc<DescriptorSlot>);

impl DescriptorHandle {
    pub(crate) fn new(
        category: DescriptorCategory,
        index: u32,
        count: u32,
        retire: Arc<RetireQueue>,
    ) -> Self {
        Self(Arc::new(DescriptorSlot {
            category,
            index,
            count,
            retire,
        }))
    }

    /// Absolute heap index of the first slot.
    #[inline]
    pub fn index(&self) -> u32 {
        self.0.index
    }

    /// Number of adjacent slots owned.
    #[inline]
    pub fn count(&self) -> u32 {
        self.0.count
    }

    #[inline]
    pub fn category(&self) -> DescriptorCategory {
        self.0.category
    }

    /// Absolute index of the `offset`-th owned slot.
    pub fn at(&self, offset: u32) -> Option<u32> {
        (offset < self.0.count).then(|| self.0.index + offset)
    }

    /// Number of live clones, including this one.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for DescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHandle")
            .field("category", &self.0.category)
            .field("index", &self.0.index)
            .field("count", &self.0.count)
            .finish()
    }
}

impl PartialEq for DescriptorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.category == other.0.category && self.0.index == other.0.index
    }
}

impl Eq for DescriptorHandle {}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_layout_partitions_do_not_overlap() {
        let layout = HeapLayout {
            constant_buffers: 4,
            textures: 8,
            mips: 2,
            ..Default::default()
        };
        assert_eq!(layout.range(DescriptorCategory::ConstantBuffer), 0..4);
        assert_eq!(layout.range(DescriptorCategory::Texture), 4..12);
        assert_eq!(layout.range(DescriptorCategory::Mip), 12..14);
        assert_eq!(layout.heap_capacity(DescriptorHeapType::CbvSrvUav), 14);
        assert_eq!(layout.range(DescriptorCategory::Sampler), 0..16);
    }

    #[test]
    fn test_allocate_lowest_first() {
        let region = RegionAllocator::new(DescriptorCategory::Texture, 10..14);
        assert_eq!(region.allocate().unwrap(), 10);
        assert_eq!(region.allocate().unwrap(), 11);
        assert_eq!(region.used(), 2);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let region = RegionAllocator::new(DescriptorCategory::ConstantBuffer, 0..2);
        region.allocate().unwrap();
        region.allocate().unwrap();
        let err = region.allocate().unwrap_err();
        assert!(matches!(
            err,
            RhiError::HeapExhausted {
                category: DescriptorCategory::ConstantBuffer,
                capacity: 2,
                requested: 1
            }
        ));
    }

    #[test]
    fn test_release_makes_slot_reusable() {
        let region = RegionAllocator::new(DescriptorCategory::Texture, 0..1);
        let index = region.allocate().unwrap();
        region.release(index, 1).unwrap();
        assert_eq!(region.allocate().unwrap(), index);
    }

    #[test]
    fn test_double_release_rejected() {
        let region = RegionAllocator::new(DescriptorCategory::Texture, 0..4);
        let index = region.allocate().unwrap();
        region.release(index, 1).unwrap();
        assert!(region.release(index, 1).is_err());
        assert!(region.release(99, 1).is_err());
    }

    #[test]
    fn test_release_of_partly_free_run_changes_nothing() {
        let region = RegionAllocator::new(DescriptorCategory::Mip, 20..28);
        let first = region.allocate_contiguous(4).unwrap();
        region.release(first + 2, 1).unwrap();
        assert_eq!(region.used(), 3);

        let err = region.release(first, 4).unwrap_err();
        assert!(matches!(err, RhiError::InvalidHandle(_)));
        assert_eq!(region.used(), 3);

        // The untouched slots are still owned and release cleanly.
        region.release(first, 2).unwrap();
        region.release(first + 3, 1).unwrap();
        assert_eq!(region.used(), 0);
    }

    #[test]
    fn test_contiguous_skips_fragmented_slots() {
        let region = RegionAllocator::new(DescriptorCategory::Mip, 100..108);
        let a = region.allocate().unwrap();
        let b = region.allocate().unwrap();
        let _c = region.allocate().unwrap();
        region.release(b, 1).unwrap();
        assert_eq!(a, 100);

        // Slot 101 is free but alone; the run must start after 102.
        let first = region.allocate_contiguous(3).unwrap();
        assert_eq!(first, 103);
        assert_eq!(region.allocate().unwrap(), 101);
        assert!(region.allocate_contiguous(3).is_err());
    }

    #[test]
    fn test_handle_release_goes_through_retire_queue() {
        let queue = Arc::new(RetireQueue::new());
        queue.set_cursor(7);
        let handle = DescriptorHandle::new(DescriptorCategory::Texture, 3, 1, queue.clone());
        let clone = handle.clone();
        drop(handle);
        assert_eq!(queue.len(), 0);
        drop(clone);
        assert_eq!(queue.len(), 1);
        assert!(queue.drain_completed(6).is_empty());
        assert_eq!(queue.drain_completed(7).len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc,
        AllocRange(u32),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Alloc),
            1 => (1u32..4).prop_map(Op::AllocRange),
            3 => any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn prop_live_indices_never_overlap(ops in prop::collection::vec(op(), 1..200)) {
            let region = RegionAllocator::new(DescriptorCategory::Texture, 16..48);
            let mut live: Vec<(u32, u32)> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc => {
                        if let Ok(i) = region.allocate() {
                            live.push((i, 1));
                        }
                    }
                    Op::AllocRange(n) => {
                        if let Ok(i) = region.allocate_contiguous(n) {
                            live.push((i, n));
                        }
                    }
                    Op::Free(pick) => {
                        if !live.is_empty() {
                            let (first, count) = live.swap_remove(pick % live.len());
                            region.release(first, count).unwrap();
                        }
                    }
                }

                let mut seen = HashSet::new();
                for &(first, count) in &live {
                    for i in first..first + count {
                        prop_assert!((16..48).contains(&i));
                        prop_assert!(seen.insert(i), "index {} handed out twice", i);
                    }
                }
                prop_assert_eq!(region.used() as usize, seen.len());
            }
        }
    }
}
