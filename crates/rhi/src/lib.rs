//! Explicit-API render hardware interface for Ember.
//!
//! This crate is the engine core below the renderer. It provides:
//! - Device and adapter selection behind the [`device::GpuDevice`] trait
//! - Fences, command allocators, command lists and the submission queue
//! - Descriptor heaps with per-category slot allocation
//! - The resource manager and fence-keyed deferred release
//! - The swap presentation surface
//! - A Vulkan backend and a simulated `soft` backend for tests

mod error;

pub mod backend;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod resource;
pub mod retire;
pub mod swapchain;
pub mod sync;
pub mod types;
pub mod vertex;

pub use error::{ErrorClass, RhiError, RhiResult};
