//! RHI error types.

use std::time::Duration;

use thiserror::Error;

use crate::descriptor::DescriptorCategory;

/// Broad classification of an [`RhiError`].
///
/// The frame loop treats `Device` and `Capacity` as fatal. `Usage` errors are
/// programming defects caught by state checks; they are fatal too, but point
/// at the caller rather than the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Device,
    Capacity,
    Usage,
}

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    /// No adapter meets the engine's requirements
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The device stopped responding or was removed
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// A fence wait exceeded the hang timeout
    #[error("Device hung: fence value {target} not reached after {waited:?} (completed {completed})")]
    DeviceHung {
        target: u64,
        completed: u64,
        waited: Duration,
    },

    /// A descriptor category ran out of slots
    #[error("Descriptor heap exhausted: {category:?} holds {capacity} slot(s), {requested} more requested")]
    HeapExhausted {
        category: DescriptorCategory,
        capacity: u32,
        requested: u32,
    },

    /// A command allocator was reset while the GPU may still read it
    #[error("Command allocator reset while in use: needs fence value {required}, completed {completed}")]
    AllocatorInUse { required: u64, completed: u64 },

    /// An operation was called in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A handle does not refer to a live object
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Recorded commands break a resource-state or binding rule
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Shader loading error
    #[error("Shader error: {0}")]
    Shader(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    Surface(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    Swapchain(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Feature the backend does not implement
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl RhiError {
    /// Classifies the error for the frame loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::HeapExhausted { .. } => ErrorClass::Capacity,
            Self::AllocatorInUse { .. }
            | Self::InvalidState(_)
            | Self::InvalidHandle(_)
            | Self::Validation(_) => ErrorClass::Usage,
            _ => ErrorClass::Device,
        }
    }

    /// Returns true if the error means the GPU itself is gone or stuck.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost(_)
                | Self::DeviceHung { .. }
                | Self::Vulkan(ash::vk::Result::ERROR_DEVICE_LOST)
        )
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let exhausted = RhiError::HeapExhausted {
            category: DescriptorCategory::Texture,
            capacity: 4,
            requested: 1,
        };
        assert_eq!(exhausted.class(), ErrorClass::Capacity);
        assert_eq!(
            RhiError::InvalidState("x".into()).class(),
            ErrorClass::Usage
        );
        assert_eq!(RhiError::NoSuitableGpu.class(), ErrorClass::Device);
    }

    #[test]
    fn test_hang_is_device_failure() {
        let hung = RhiError::DeviceHung {
            target: 3,
            completed: 2,
            waited: Duration::from_secs(10),
        };
        assert!(hung.is_device_failure());
        assert!(!RhiError::NoSuitableGpu.is_device_failure());
    }
}
