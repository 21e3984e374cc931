//! Frame slots and fence pacing.
//!
//! The CPU records frame N+1 while the GPU executes frame N. Each of the
//! [`FRAME_COUNT`] slots owns a command allocator and the fence value its
//! last submission was signaled with. A slot's allocator is only reset
//! after the fence has passed that value.
//!
//! # Pacing
//!
//! At the end of a frame [`FrameSlots::advance`]:
//! 1. signals the fence with the current slot's value
//! 2. switches to the next slot in round-robin order
//! 3. waits only if that slot's value has not completed yet
//! 4. gives the new slot the signaled value plus one
//!
//! Step 3 is the only place a steady-state frame can stall. Slots cycle
//! independently of the swap chain, which may hold more images than there
//! are slots; the back buffer index only selects the render target.

use std::sync::Arc;

use ember_rhi::command::{AllocatorState, CommandAllocator, CommandQueue};
use ember_rhi::device::GpuDevice;
use ember_rhi::sync::{Fence, WaitOutcome};
use ember_rhi::RhiResult;
use tracing::{debug, trace};

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAME_COUNT: usize = 2;

/// Per-slot submission state.
pub struct FrameSlot {
    allocator: CommandAllocator,
    /// Fence value this slot signals next; once reached, the slot's
    /// previous work has finished.
    fence_value: u64,
}

impl FrameSlot {
    pub fn allocator(&self) -> &CommandAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut CommandAllocator {
        &mut self.allocator
    }

    #[inline]
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }
}

/// The ring of frame slots and the index of the one being recorded.
pub struct FrameSlots {
    slots: Vec<FrameSlot>,
    index: usize,
}

impl FrameSlots {
    /// Creates one allocator per slot, starting at slot 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot create an allocator.
    pub fn new(device: &Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let slots = (0..FRAME_COUNT)
            .map(|_| {
                Ok(FrameSlot {
                    allocator: CommandAllocator::new(device.clone())?,
                    fence_value: 0,
                })
            })
            .collect::<RhiResult<Vec<_>>>()?;

        let mut frames = Self { slots, index: 0 };
        frames.reset_values();
        debug!("Created {} frame slots", FRAME_COUNT);
        Ok(frames)
    }

    /// Index of the slot being recorded.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.index]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.index]
    }

    /// Fence value of every slot, in slot order.
    pub fn fence_values(&self) -> Vec<u64> {
        self.slots.iter().map(|s| s.fence_value).collect()
    }

    /// Starts over against a fresh fence: slot 0 becomes current with
    /// value 1, every other slot gets 0.
    pub fn reset_values(&mut self) {
        self.index = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.fence_value = u64::from(i == self.index);
        }
    }

    /// Ends the current slot's frame and moves to the next slot, waiting
    /// for it if the GPU is a full slot cycle behind.
    ///
    /// # Errors
    ///
    /// Returns the fence's error if the signal fails or the wait times out.
    pub fn advance(&mut self, fence: &Fence, queue: &CommandQueue) -> RhiResult<WaitOutcome> {
        let signaled = self.slots[self.index].fence_value;
        fence.signal(queue, signaled)?;
        self.slots[self.index].allocator.mark_fenced(signaled);

        self.index = (self.index + 1) % FRAME_COUNT;
        let required = self.slots[self.index].fence_value;
        let outcome = if fence.completed_value()? < required {
            fence.wait(required)?
        } else {
            WaitOutcome::Ready
        };

        self.slots[self.index].fence_value = signaled + 1;
        trace!(
            "Advanced to slot {} (signaled {}, waited for {})",
            self.index, signaled, required
        );
        Ok(outcome)
    }

    /// Signals the current slot's value and waits for it, leaving the GPU
    /// idle.
    ///
    /// # Errors
    ///
    /// Returns the fence's error if the signal fails or the wait times out.
    pub fn flush(&mut self, fence: &Fence, queue: &CommandQueue) -> RhiResult<WaitOutcome> {
        let slot = &mut self.slots[self.index];
        let value = slot.fence_value;
        fence.signal(queue, value)?;
        slot.allocator.mark_fenced(value);
        let outcome = fence.wait(value)?;
        slot.fence_value = value + 1;
        Ok(outcome)
    }

    /// Resets every allocator whose work has completed.
    ///
    /// # Errors
    ///
    /// Returns [`ember_rhi::RhiError::AllocatorInUse`] if a slot's work is
    /// still running.
    pub fn reset_allocators(&mut self, fence: &Fence) -> RhiResult<()> {
        for slot in &mut self.slots {
            if slot.allocator.state() != AllocatorState::Open {
                slot.allocator.reset(fence)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::backend::soft::{CompletionPolicy, SoftDevice};

    fn setup(policy: CompletionPolicy) -> (Arc<SoftDevice>, CommandQueue, Fence, FrameSlots) {
        let device = Arc::new(SoftDevice::with_policy(policy));
        let queue = CommandQueue::new(device.clone());
        let fence = Fence::new(device.clone(), 0).unwrap();
        let dyn_device: Arc<dyn GpuDevice> = device.clone();
        let slots = FrameSlots::new(&dyn_device).unwrap();
        (device, queue, fence, slots)
    }

    #[test]
    fn test_initial_values() {
        let (_device, _queue, _fence, slots) = setup(CompletionPolicy::Immediate);
        assert_eq!(slots.index(), 0);
        assert_eq!(slots.fence_values(), vec![1, 0]);
    }

    #[test]
    fn test_reset_values_restarts_at_first_slot() {
        let (_device, queue, fence, mut slots) = setup(CompletionPolicy::Immediate);
        slots.advance(&fence, &queue).unwrap();
        assert_eq!(slots.index(), 1);
        slots.reset_values();
        assert_eq!(slots.index(), 0);
        assert_eq!(slots.fence_values(), vec![1, 0]);
    }

    #[test]
    fn test_advance_hands_out_increasing_values() {
        let (_device, queue, fence, mut slots) = setup(CompletionPolicy::Immediate);
        assert_eq!(slots.advance(&fence, &queue).unwrap(), WaitOutcome::Ready);
        assert_eq!(slots.fence_values(), vec![1, 2]);
        slots.advance(&fence, &queue).unwrap();
        assert_eq!(slots.fence_values(), vec![3, 2]);
        assert_eq!(fence.last_signaled(), 2);
    }

    #[test]
    fn test_flush_leaves_gpu_idle() {
        let (_device, queue, fence, mut slots) = setup(CompletionPolicy::Lagged(4));
        slots.advance(&fence, &queue).unwrap();
        slots.flush(&fence, &queue).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 2);
        assert_eq!(slots.current().fence_value(), 3);
    }

    #[test]
    fn test_one_frame_of_lag_never_blocks() {
        let (_device, queue, fence, mut slots) = setup(CompletionPolicy::Lagged(1));
        let mut visited = Vec::new();
        for _ in 0..9 {
            let outcome = slots.advance(&fence, &queue).unwrap();
            assert_eq!(outcome, WaitOutcome::Ready);
            visited.push(slots.index());
        }
        assert_eq!(visited, vec![1, 0, 1, 0, 1, 0, 1, 0, 1]);
        assert_eq!(fence.stats().blocking_waits, 0);
    }
}
