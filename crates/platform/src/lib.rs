//! Platform layer for Ember.
//!
//! This crate provides:
//! - Window management via winit
//! - Keyboard and mouse state
//! - The application lifecycle ([`AppHooks`]) and its windowed and
//!   headless drivers

mod app;
mod input;
mod window;

pub use app::{AppHooks, RunError, run, run_headless};
pub use input::{InputState, KeyCode, KeyTransition, MouseButton};
pub use window::{NativeHandles, SurfaceTarget, Window};
