//! Device backends.
//!
//! - [`vulkan`] drives a real (or software-rasterized) GPU through `ash`
//! - [`soft`] simulates a device in host memory and validates every command

pub mod soft;
pub mod vulkan;
