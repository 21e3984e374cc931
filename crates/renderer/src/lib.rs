//! Frame orchestration for Ember.
//!
//! This crate drives the engine core one frame at a time:
//! - [`GpuContext`]: the begin/record/end/execute/present/advance cycle
//! - Frame slots and fence pacing
//! - The JSON pipeline registry
//! - The render graph and its built-in passes
//! - [`Renderer`], which ties them to a scene

mod error;
pub mod constants;
pub mod context;
pub mod frame;
pub mod graph;
pub mod passes;
pub mod pipelines;
pub mod renderer;

pub use constants::DrawConstants;
pub use context::{ContextDesc, FramePhase, GpuContext};
pub use error::{RenderError, RenderResult};
pub use frame::{FRAME_COUNT, FrameSlot, FrameSlots};
pub use graph::{PassDecl, PassFactory, PassRegistry, RenderGraph, RenderPass};
pub use passes::{AccumulatePass, CompositePass, ForwardPass};
pub use pipelines::{MIP_PIPELINE, PipelineDecl, PipelineRegistry, VertexInput};
pub use renderer::{Renderer, RendererDesc};
