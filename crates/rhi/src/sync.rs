//! CPU/GPU synchronization.
//!
//! A [`Fence`] is a monotonic 64-bit counter shared between the CPU and the
//! GPU. The CPU asks the queue to write a value once all earlier work is
//! done ([`Fence::signal`]) and later blocks until the counter has reached a
//! value ([`Fence::wait`]). Comparing the completed value against the value
//! signaled after a resource's last use is the only way the engine decides
//! that memory is safe to reuse.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ember_rhi::command::CommandQueue;
//! use ember_rhi::device::GpuDevice;
//! use ember_rhi::sync::Fence;
//!
//! # fn example(device: Arc<dyn GpuDevice>) -> Result<(), ember_rhi::RhiError> {
//! let queue = CommandQueue::new(device.clone());
//! let fence = Fence::new(device, 0)?;
//!
//! // ... submit work ...
//! fence.signal(&queue, 1)?;
//!
//! // Block until the GPU has passed the signal.
//! fence.wait(1)?;
//! assert!(fence.completed_value()? >= 1);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::command::CommandQueue;
use crate::device::GpuDevice;
use crate::error::{RhiError, RhiResult};
use crate::types::FenceId;

/// How long a wait may block before the device is declared hung.
pub const DEFAULT_HANG_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a successful [`Fence::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The value had already completed.
    Ready,
    /// The CPU blocked for this long.
    Blocked(Duration),
}

impl WaitOutcome {
    pub fn blocked(self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// Counters for observing stalls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceStats {
    pub signals: u64,
    pub waits: u64,
    pub blocking_waits: u64,
}

/// Monotonic GPU timeline.
///
/// # Thread Safety
///
/// All methods take `&self`. Signal ordering across threads is the caller's
/// business; the fence only rejects values that would go backwards.
pub struct Fence {
    device: Arc<dyn GpuDevice>,
    id: FenceId,
    last_signaled: AtomicU64,
    last_completed: AtomicU64,
    timeout: Duration,
    signals: AtomicU64,
    waits: AtomicU64,
    blocking_waits: AtomicU64,
}

impl Fence {
    /// Creates a fence whose completed value starts at `initial_value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot create the fence.
    pub fn new(device: Arc<dyn GpuDevice>, initial_value: u64) -> RhiResult<Self> {
        let id = device.create_fence(initial_value)?;
        debug!("Created fence {:?} at {}", id, initial_value);
        Ok(Self {
            device,
            id,
            last_signaled: AtomicU64::new(initial_value),
            last_completed: AtomicU64::new(initial_value),
            timeout: DEFAULT_HANG_TIMEOUT,
            signals: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            blocking_waits: AtomicU64::new(0),
        })
    }

    /// Replaces the hang timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[inline]
    pub fn id(&self) -> FenceId {
        self.id
    }

    /// Highest value handed to [`Fence::signal`].
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    /// Queues a GPU write of `value` behind all work already on `queue`.
    /// Does not block.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if `value` is not greater than the
    /// previous signal.
    pub fn signal(&self, queue: &CommandQueue, value: u64) -> RhiResult<()> {
        let previous = self.last_signaled();
        if value <= previous {
            return Err(RhiError::InvalidState(format!(
                "fence {:?} signaled with {value} after {previous}",
                self.id
            )));
        }

        queue.device().signal(self.id, value)?;
        self.last_signaled.store(value, Ordering::Release);
        self.signals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Value the GPU has reached.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DeviceLost`] if the device reports a value lower
    /// than one already observed.
    pub fn completed_value(&self) -> RhiResult<u64> {
        let value = self.device.completed_value(self.id)?;
        let seen = self.last_completed.fetch_max(value, Ordering::AcqRel);
        if value < seen {
            return Err(RhiError::DeviceLost(format!(
                "fence {:?} went backwards from {seen} to {value}",
                self.id
            )));
        }
        Ok(value)
    }

    pub fn is_complete(&self, value: u64) -> RhiResult<bool> {
        Ok(self.completed_value()? >= value)
    }

    /// Returns once the fence has reached `value`, blocking if needed.
    ///
    /// # Errors
    ///
    /// - [`RhiError::InvalidState`] if `value` was never signaled
    /// - [`RhiError::DeviceHung`] if the hang timeout expires
    pub fn wait(&self, value: u64) -> RhiResult<WaitOutcome> {
        self.waits.fetch_add(1, Ordering::Relaxed);
        if self.completed_value()? >= value {
            return Ok(WaitOutcome::Ready);
        }

        let signaled = self.last_signaled();
        if value > signaled {
            return Err(RhiError::InvalidState(format!(
                "waiting for fence value {value} but only {signaled} was signaled"
            )));
        }

        self.blocking_waits.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let reached = self.device.wait_for_value(self.id, value, self.timeout)?;
        let waited = start.elapsed();

        if !reached {
            let completed = self.completed_value()?;
            warn!(
                "Fence {:?} stuck at {} waiting for {} ({:?})",
                self.id, completed, value, waited
            );
            return Err(RhiError::DeviceHung {
                target: value,
                completed,
                waited,
            });
        }

        self.completed_value()?;
        debug!("Blocked {:?} on fence value {}", waited, value);
        Ok(WaitOutcome::Blocked(waited))
    }

    pub fn stats(&self) -> FenceStats {
        FenceStats {
            signals: self.signals.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            blocking_waits: self.blocking_waits.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use proptest::prelude::*;

    use super::*;
    use crate::backend::soft::{CompletionPolicy, SoftDevice};

    fn soft(policy: CompletionPolicy) -> (Arc<SoftDevice>, CommandQueue) {
        let device = Arc::new(SoftDevice::with_policy(policy));
        let queue = CommandQueue::new(device.clone());
        (device, queue)
    }

    #[test]
    fn test_wait_on_completed_value_does_not_block() {
        let (device, queue) = soft(CompletionPolicy::Immediate);
        let fence = Fence::new(device, 0).unwrap();
        fence.signal(&queue, 1).unwrap();
        assert_eq!(fence.wait(1).unwrap(), WaitOutcome::Ready);
        assert_eq!(fence.stats().blocking_waits, 0);
    }

    #[test]
    fn test_signal_must_increase() {
        let (device, queue) = soft(CompletionPolicy::Immediate);
        let fence = Fence::new(device, 0).unwrap();
        fence.signal(&queue, 2).unwrap();
        assert!(fence.signal(&queue, 2).is_err());
        assert!(fence.signal(&queue, 1).is_err());
        fence.signal(&queue, 3).unwrap();
    }

    #[test]
    fn test_wait_for_unsignaled_value_rejected() {
        let (device, _queue) = soft(CompletionPolicy::Immediate);
        let fence = Fence::new(device, 0).unwrap();
        assert!(matches!(fence.wait(5), Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_wait_blocks_until_gpu_completes() {
        let (device, queue) = soft(CompletionPolicy::Manual);
        let fence = Fence::new(device.clone(), 0).unwrap();
        fence.signal(&queue, 1).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 0);

        let gpu = device.clone();
        let id = fence.id();
        let helper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gpu.complete_through(id, 1);
        });

        let outcome = fence.wait(1).unwrap();
        helper.join().unwrap();
        assert!(outcome.blocked());
        assert!(fence.completed_value().unwrap() >= 1);
        assert_eq!(fence.stats().blocking_waits, 1);
    }

    #[test]
    fn test_hang_times_out() {
        let (device, queue) = soft(CompletionPolicy::Manual);
        let fence = Fence::new(device, 0)
            .unwrap()
            .with_timeout(Duration::from_millis(10));
        fence.signal(&queue, 1).unwrap();
        let err = fence.wait(1).unwrap_err();
        assert!(err.is_device_failure());
    }

    proptest! {
        #[test]
        fn prop_completed_value_never_decreases(
            steps in prop::collection::vec((any::<bool>(), 0u64..3), 1..60)
        ) {
            let (device, queue) = soft(CompletionPolicy::Manual);
            let fence = Fence::new(device.clone(), 0).unwrap();
            let mut next = 1u64;
            let mut last = 0u64;

            for (signal, complete) in steps {
                if signal {
                    fence.signal(&queue, next).unwrap();
                    next += 1;
                }
                for _ in 0..complete {
                    device.complete_next(fence.id());
                }

                let now = fence.completed_value().unwrap();
                prop_assert!(now >= last);
                prop_assert!(now <= fence.last_signaled());
                last = now;

                // A wait on anything completed must return without blocking.
                if now > 0 {
                    prop_assert_eq!(fence.wait(now).unwrap(), WaitOutcome::Ready);
                }
            }
        }
    }
}
