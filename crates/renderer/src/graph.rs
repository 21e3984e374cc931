//! Render graph: an ordered list of passes.
//!
//! The pass list is declared in JSON, one entry per pass, naming the pass
//! type and the pipeline it draws with:
//!
//! ```json
//! [
//!     { "Name": "Accumulate", "PSO": "Forward" },
//!     { "Name": "Composite", "PSO": "Composite" }
//! ]
//! ```
//!
//! Passes run in declaration order; there is no dependency resolution.
//! Every name and pipeline is resolved while building the graph, so a bad
//! declaration fails at startup rather than mid-frame.

use std::collections::HashMap;
use std::path::Path;

use ember_rhi::pipeline::PipelineBinding;
use ember_scene::Scene;
use serde::Deserialize;
use tracing::{debug, info};

use crate::context::GpuContext;
use crate::error::{RenderError, RenderResult};
use crate::passes::{AccumulatePass, CompositePass, ForwardPass};
use crate::pipelines::PipelineRegistry;

/// One entry of a pass declaration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassDecl {
    /// Pass type, matched case-insensitively against the registry.
    pub name: String,
    #[serde(rename = "PSO")]
    pub pso: String,
}

impl PassDecl {
    /// Reads a declaration file.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Config`] if the file is unreadable or
    /// malformed, and [`RenderError::EmptyDeclaration`] if it lists nothing.
    pub fn load(path: impl AsRef<Path>) -> RenderResult<Vec<Self>> {
        let path = path.as_ref();
        let decls: Vec<Self> = ember_core::read_json(path)?;
        if decls.is_empty() {
            return Err(RenderError::EmptyDeclaration(path.display().to_string()));
        }
        Ok(decls)
    }
}

/// A unit of recorded GPU work.
pub trait RenderPass {
    fn name(&self) -> &str;

    /// Records this pass into the context's command list.
    fn record(&mut self, context: &mut GpuContext, scene: &Scene) -> RenderResult<()>;
}

/// Builds a pass from the pipeline its declaration names.
pub type PassFactory = fn(&PassDecl, PipelineBinding) -> RenderResult<Box<dyn RenderPass>>;

/// Pass types by name.
pub struct PassRegistry {
    factories: HashMap<String, PassFactory>,
}

impl PassRegistry {
    /// A registry with no pass types.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a pass type, replacing any with the same name.
    pub fn register(&mut self, name: &str, factory: PassFactory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Creates the pass a declaration describes.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::UnknownPass`] or
    /// [`RenderError::UnknownPipeline`] for names that resolve to nothing,
    /// or the factory's own error.
    pub fn create(
        &self,
        decl: &PassDecl,
        pipelines: &PipelineRegistry,
    ) -> RenderResult<Box<dyn RenderPass>> {
        let factory = self
            .factories
            .get(&decl.name.to_ascii_lowercase())
            .ok_or_else(|| RenderError::UnknownPass(decl.name.clone()))?;
        let binding = pipelines
            .get(&decl.pso)
            .ok_or_else(|| RenderError::UnknownPipeline {
                pass: decl.name.clone(),
                pipeline: decl.pso.clone(),
            })?;
        factory(decl, binding)
    }
}

impl Default for PassRegistry {
    /// The built-in `forward`, `accumulate` and `composite` passes.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("forward", ForwardPass::create);
        registry.register("accumulate", AccumulatePass::create);
        registry.register("composite", CompositePass::create);
        registry
    }
}

/// Passes in recording order.
pub struct RenderGraph {
    passes: Vec<Box<dyn RenderPass>>,
}

impl RenderGraph {
    /// Resolves every declaration into a pass.
    ///
    /// # Errors
    ///
    /// Returns the first declaration error, or
    /// [`RenderError::EmptyDeclaration`] for an empty list.
    pub fn new(
        decls: &[PassDecl],
        registry: &PassRegistry,
        pipelines: &PipelineRegistry,
    ) -> RenderResult<Self> {
        if decls.is_empty() {
            return Err(RenderError::EmptyDeclaration("pass list".to_string()));
        }
        let passes = decls
            .iter()
            .map(|decl| {
                let pass = registry.create(decl, pipelines)?;
                debug!("Added pass '{}' using '{}'", pass.name(), decl.pso);
                Ok(pass)
            })
            .collect::<RenderResult<Vec<_>>>()?;

        info!("Render graph ready with {} passes", passes.len());
        Ok(Self { passes })
    }

    /// Records every pass in declaration order.
    pub fn record(&mut self, context: &mut GpuContext, scene: &Scene) -> RenderResult<()> {
        for pass in &mut self.passes {
            pass.record(context, scene)?;
        }
        Ok(())
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ember_rhi::backend::soft::SoftDevice;
    use ember_rhi::device::GpuDevice;
    use ember_rhi::types::Format;

    use super::*;
    use crate::pipelines::PipelineDecl;

    fn pipelines() -> PipelineRegistry {
        let decls: Vec<PipelineDecl> = serde_json::from_str(
            r#"[
                { "Name": "Forward", "Type": "Graphics", "Shader": "forward" },
                { "Name": "Mips", "Type": "Compute", "Shader": "mips" }
            ]"#,
        )
        .unwrap();
        let device: Arc<dyn GpuDevice> = Arc::new(SoftDevice::new());
        PipelineRegistry::new(device, &decls, Format::Bgra8Unorm).unwrap()
    }

    fn decl(name: &str, pso: &str) -> PassDecl {
        PassDecl {
            name: name.to_string(),
            pso: pso.to_string(),
        }
    }

    #[test]
    fn test_parse_pass_list() {
        let decls: Vec<PassDecl> =
            serde_json::from_str(r#"[{ "Name": "Forward", "PSO": "Forward" }]"#).unwrap();
        assert_eq!(decls, vec![decl("Forward", "Forward")]);
    }

    #[test]
    fn test_graph_keeps_declaration_order() {
        let graph = RenderGraph::new(
            &[decl("Accumulate", "Forward"), decl("forward", "Forward")],
            &PassRegistry::default(),
            &pipelines(),
        )
        .unwrap();
        assert_eq!(graph.pass_names(), vec!["accumulate", "forward"]);
    }

    #[test]
    fn test_unknown_pass_rejected() {
        let err = RenderGraph::new(&[decl("Bloom", "Forward")], &PassRegistry::default(), &pipelines())
            .err()
            .unwrap();
        assert!(matches!(err, RenderError::UnknownPass(ref name) if name == "Bloom"));
        assert!(err.is_config());
    }

    #[test]
    fn test_unknown_pipeline_rejected() {
        let err = RenderGraph::new(&[decl("Forward", "Missing")], &PassRegistry::default(), &pipelines())
            .err()
            .unwrap();
        assert!(matches!(err, RenderError::UnknownPipeline { .. }));
    }

    #[test]
    fn test_compute_pipeline_rejected_for_draw_pass() {
        let err = RenderGraph::new(&[decl("Forward", "Mips")], &PassRegistry::default(), &pipelines())
            .err()
            .unwrap();
        assert!(matches!(err, RenderError::PipelineKind { .. }));
    }

    #[test]
    fn test_empty_graph_rejected() {
        assert!(RenderGraph::new(&[], &PassRegistry::default(), &pipelines()).is_err());
    }
}
