//! Built-in render passes.
//!
//! - [`ForwardPass`] draws every model straight into the back buffer.
//! - [`AccumulatePass`] draws every model into the active ping-pong target
//!   while the last one is readable as history.
//! - [`CompositePass`] resolves the ping-pong pair onto the back buffer with
//!   a full-screen triangle.

use ember_rhi::pipeline::{PipelineBinding, PipelineKind};
use ember_scene::Scene;

use crate::context::GpuContext;
use crate::error::{RenderError, RenderResult};
use crate::graph::{PassDecl, RenderPass};

fn require_graphics(decl: &PassDecl, binding: PipelineBinding) -> RenderResult<PipelineBinding> {
    if binding.kind != PipelineKind::Graphics {
        return Err(RenderError::PipelineKind {
            pass: decl.name.clone(),
            expected: "graphics",
        });
    }
    Ok(binding)
}

/// Draws the scene into the back buffer with depth testing.
pub struct ForwardPass {
    binding: PipelineBinding,
}

impl ForwardPass {
    pub fn new(binding: PipelineBinding) -> Self {
        Self { binding }
    }

    pub fn create(decl: &PassDecl, binding: PipelineBinding) -> RenderResult<Box<dyn RenderPass>> {
        Ok(Box::new(Self::new(require_graphics(decl, binding)?)))
    }
}

impl RenderPass for ForwardPass {
    fn name(&self) -> &str {
        "forward"
    }

    fn record(&mut self, context: &mut GpuContext, scene: &Scene) -> RenderResult<()> {
        context.bind_back_buffer(true)?;
        for model in scene.models() {
            context.draw(scene, model, &self.binding)?;
        }
        Ok(())
    }
}

/// Draws the scene into the active ping-pong target. Shaders can blend
/// against the previous frame through the history index.
pub struct AccumulatePass {
    binding: PipelineBinding,
}

impl AccumulatePass {
    pub fn new(binding: PipelineBinding) -> Self {
        Self { binding }
    }

    pub fn create(decl: &PassDecl, binding: PipelineBinding) -> RenderResult<Box<dyn RenderPass>> {
        Ok(Box::new(Self::new(require_graphics(decl, binding)?)))
    }
}

impl RenderPass for AccumulatePass {
    fn name(&self) -> &str {
        "accumulate"
    }

    fn record(&mut self, context: &mut GpuContext, scene: &Scene) -> RenderResult<()> {
        context.begin_history_pass()?;
        for model in scene.models() {
            context.draw(scene, model, &self.binding)?;
        }
        context.resolve_history()
    }
}

/// Copies the ping-pong pair onto the back buffer.
pub struct CompositePass {
    binding: PipelineBinding,
}

impl CompositePass {
    pub fn new(binding: PipelineBinding) -> Self {
        Self { binding }
    }

    pub fn create(decl: &PassDecl, binding: PipelineBinding) -> RenderResult<Box<dyn RenderPass>> {
        Ok(Box::new(Self::new(require_graphics(decl, binding)?)))
    }
}

impl RenderPass for CompositePass {
    fn name(&self) -> &str {
        "composite"
    }

    fn record(&mut self, context: &mut GpuContext, scene: &Scene) -> RenderResult<()> {
        context.resolve_history()?;
        context.bind_back_buffer(false)?;
        context.draw_fullscreen(scene, &self.binding)
    }
}
