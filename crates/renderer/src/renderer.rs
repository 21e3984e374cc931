//! Top-level renderer.
//!
//! [`Renderer`] ties the pieces together: the resource manager, the GPU
//! context, the pipeline registry, the render graph and the scene. The
//! driver calls [`Renderer::render_frame`] once per tick and forwards size
//! changes through [`Renderer::resize`].
//!
//! # Example
//!
//! ```no_run
//! use ember_core::EngineConfig;
//! use ember_renderer::Renderer;
//! use ember_rhi::device::{DeviceDesc, create_device};
//! use ember_rhi::types::Backend;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load("ember.json")?;
//! let device = create_device(&DeviceDesc {
//!     backend: Backend::Soft,
//!     use_software_adapter: false,
//!     enable_validation: false,
//!     shader_dir: config.shader_dir.clone(),
//!     window: None,
//! })?;
//! let mut renderer = Renderer::new(device, &config)?;
//! for _ in 0..3 {
//!     renderer.render_frame()?;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ember_core::{DescriptorBudget, EngineConfig, Timer};
use ember_rhi::descriptor::HeapLayout;
use ember_rhi::device::GpuDevice;
use ember_rhi::resource::ResourceManager;
use ember_rhi::types::Format;
use ember_scene::{Scene, SceneDescription, UploadOptions};
use tracing::{debug, info};

use crate::context::{ContextDesc, GpuContext};
use crate::error::RenderResult;
use crate::frame::FRAME_COUNT;
use crate::graph::{PassDecl, PassRegistry, RenderGraph};
use crate::pipelines::{PipelineDecl, PipelineRegistry};

/// Sizes and budgets the renderer is built with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RendererDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub clear_color: [f32; 4],
    pub layout: HeapLayout,
}

impl RendererDesc {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: Format::Bgra8Unorm,
            clear_color: ContextDesc::new(width, height).clear_color,
            layout: HeapLayout::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            width: config.window.width,
            height: config.window.height,
            format: Format::Bgra8Unorm,
            clear_color: config.clear_color,
            layout: heap_layout(&config.descriptors),
        }
    }
}

fn heap_layout(budget: &DescriptorBudget) -> HeapLayout {
    HeapLayout {
        constant_buffers: budget.constant_buffers,
        textures: budget.textures,
        mips: budget.mips,
        render_targets: budget.render_targets,
        depth_stencils: budget.depth_stencils,
        samplers: budget.samplers,
    }
}

/// Renders a scene through a declared pass list.
///
/// # Destruction Order
///
/// Fields drop top to bottom. The context goes first: its drop waits for
/// the GPU, so the scene, passes and pipelines dropped after it are no
/// longer in use. The resource manager releases whatever they retired
/// once its last owner is gone.
pub struct Renderer {
    context: GpuContext,
    graph: RenderGraph,
    scene: Scene,
    pipelines: PipelineRegistry,
    resources: Arc<ResourceManager>,
    timer: Timer,
    /// Size requested since the last frame, applied before the next one.
    pending_size: Option<(u32, u32)>,
}

impl Renderer {
    /// Builds a renderer from the declaration files an engine config
    /// points at. Every file is parsed before any GPU object is created.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unreadable or invalid
    /// declarations, or the device error that stopped initialization.
    pub fn new(device: Arc<dyn GpuDevice>, config: &EngineConfig) -> RenderResult<Self> {
        let pipelines = PipelineDecl::load(&config.pipelines)?;
        let passes = PassDecl::load(&config.passes)?;
        let scene = SceneDescription::load(&config.scene)?;
        Self::from_parts(
            device,
            &RendererDesc::from_config(config),
            &pipelines,
            &passes,
            &scene,
        )
    }

    /// Builds a renderer from already parsed declarations.
    ///
    /// Scene uploads are recorded and waited for before this returns.
    pub fn from_parts(
        device: Arc<dyn GpuDevice>,
        desc: &RendererDesc,
        pipelines: &[PipelineDecl],
        passes: &[PassDecl],
        scene: &SceneDescription,
    ) -> RenderResult<Self> {
        let resources = ResourceManager::new(device.clone(), desc.layout)?;
        let mut context = GpuContext::new(
            resources.clone(),
            &ContextDesc {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                clear_color: desc.clear_color,
            },
        )?;

        let pipelines = PipelineRegistry::new(device, pipelines, context.surface().format())?;
        let graph = RenderGraph::new(passes, &PassRegistry::default(), &pipelines)?;

        let options = UploadOptions {
            mip_pipeline: pipelines.mip_pipeline(),
        };
        let mut scene = context.upload(|list| {
            Ok(Scene::from_description(
                resources.clone(),
                list,
                scene,
                FRAME_COUNT,
                options,
            )?)
        })?;
        scene.resize(desc.width, desc.height);

        info!(
            "Renderer ready: {} passes, {} models",
            graph.len(),
            scene.models().len()
        );

        Ok(Self {
            context,
            graph,
            scene,
            pipelines,
            resources,
            timer: Timer::new(),
            pending_size: None,
        })
    }

    /// Requests a new output size. The swap surface and targets are
    /// recreated before the next frame; zero sizes (minimized windows)
    /// are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!("Ignoring resize to zero dimensions");
            return;
        }
        let current = (self.context.surface().width(), self.context.surface().height());
        self.pending_size = (current != (width, height)).then_some((width, height));
    }

    fn apply_resize(&mut self) -> RenderResult<()> {
        if let Some((width, height)) = self.pending_size.take() {
            self.context.resize(width, height)?;
            self.scene.resize(width, height);
        }
        Ok(())
    }

    /// Renders one frame: writes the slot's constants, records every pass,
    /// submits, presents and advances to the next slot.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the frame loop; device failures are reported
    /// by [`crate::RenderError::is_device_failure`].
    pub fn render_frame(&mut self) -> RenderResult<()> {
        self.apply_resize()?;
        self.timer.tick();

        let time = self.timer.elapsed().as_secs_f32();
        self.scene
            .update(self.context.frame_index(), time, self.context.frame_count())?;

        self.context.begin_frame()?;
        self.graph.record(&mut self.context, &self.scene)?;
        self.context.end_frame()?;
        self.context.execute()?;
        self.context.present()?;
        self.context.move_to_next_frame()?;
        Ok(())
    }

    /// Waits until the GPU has finished all submitted frames.
    pub fn wait_idle(&mut self) -> RenderResult<()> {
        self.context.flush()
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Output size in pixels.
    pub fn extent(&self) -> (u32, u32) {
        (self.context.surface().width(), self.context.surface().height())
    }

    /// Average frames per second since creation.
    pub fn average_fps(&self) -> f64 {
        self.timer.average_fps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_layout_from_budget() {
        let budget = DescriptorBudget {
            textures: 8,
            ..DescriptorBudget::default()
        };
        let layout = heap_layout(&budget);
        assert_eq!(layout.textures, 8);
        assert_eq!(layout.samplers, budget.samplers);
    }

    #[test]
    fn test_desc_from_config() {
        let config = EngineConfig::default();
        let desc = RendererDesc::from_config(&config);
        assert_eq!((desc.width, desc.height), (1280, 720));
        assert_eq!(desc.clear_color, config.clear_color);
    }
}
