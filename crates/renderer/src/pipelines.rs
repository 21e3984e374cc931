//! Pipeline state registry.
//!
//! Pipelines are declared in JSON and built once at startup against a
//! single bindless root signature:
//!
//! ```json
//! [
//!     { "Name": "Forward", "Type": "Graphics", "Shader": "forward" },
//!     { "Name": "Composite", "Type": "Graphics", "Shader": "composite",
//!       "CullMode": "None", "DepthTesting": "None", "VertexInput": "None" },
//!     { "Name": "GenerateMips", "Type": "Compute", "Shader": "mips" }
//! ]
//! ```
//!
//! Passes look pipelines up by name and hold the returned
//! [`PipelineBinding`] by value; the registry owns the device objects and
//! destroys them on drop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use ember_rhi::device::GpuDevice;
use ember_rhi::pipeline::{
    CullMode, DepthTesting, PipelineBinding, PipelineKind, PipelineStateDesc, RootSignatureDesc,
};
use ember_rhi::resource::DepthBuffer;
use ember_rhi::types::{Format, RootSignatureId};
use ember_rhi::vertex::Vertex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{RenderError, RenderResult};

/// Name of the compute pipeline used to generate texture mips, if declared.
pub const MIP_PIPELINE: &str = "GenerateMips";

/// Vertex stream a graphics pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum VertexInput {
    /// Interleaved mesh vertices.
    #[default]
    Mesh,
    /// No vertex buffers; positions come from the vertex index.
    None,
}

/// One entry of a pipeline declaration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PipelineDecl {
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: PipelineKind,
    pub shader: String,
    #[serde(default)]
    pub cull_mode: CullMode,
    #[serde(default)]
    pub depth_testing: DepthTesting,
    #[serde(default)]
    pub vertex_input: VertexInput,
}

impl PipelineDecl {
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

    fn to_desc(&self, color_format: Format) -> PipelineStateDesc {
        match self.kind {
            PipelineKind::Compute => PipelineStateDesc::compute(&self.name, &self.shader),
            PipelineKind::Graphics => {
                let mut desc =
                    PipelineStateDesc::graphics(&self.name, &self.shader, vec![color_format]);
                desc.cull_mode = self.cull_mode;
                desc.depth = self.depth_testing;
                desc.depth_format = match self.depth_testing {
                    DepthTesting::Less => Some(DepthBuffer::FORMAT),
                    DepthTesting::None => None,
                };
                desc.vertex_layout = match self.vertex_input {
                    VertexInput::Mesh => Some(Vertex::layout()),
                    VertexInput::None => None,
                };
                desc
            }
        }
    }
}

/// Every pipeline the renderer can bind, by name.
pub struct PipelineRegistry {
    device: Arc<dyn GpuDevice>,
    root_signature: RootSignatureId,
    pipelines: HashMap<String, PipelineBinding>,
    order: Vec<String>,
}

impl PipelineRegistry {
    /// Builds the bindless root signature and one pipeline per
    /// declaration. Graphics pipelines render into `color_format`.
    ///
    /// The root signature must be created after the resource manager's
    /// shader-visible heaps exist.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::DuplicatePipeline`] for a repeated name, or
    /// the device's error if a pipeline fails to build. Objects created
    /// before the failure are destroyed.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        decls: &[PipelineDecl],
        color_format: Format,
    ) -> RenderResult<Self> {
        let root_signature = device.create_root_signature(&RootSignatureDesc::bindless("bindless"))?;
        let mut registry = Self {
            device,
            root_signature,
            pipelines: HashMap::with_capacity(decls.len()),
            order: Vec::with_capacity(decls.len()),
        };

        for decl in decls {
            if registry.pipelines.contains_key(&decl.name) {
                return Err(RenderError::DuplicatePipeline(decl.name.clone()));
            }
            let pipeline = registry
                .device
                .create_pipeline_state(&decl.to_desc(color_format), root_signature)?;
            debug!("Created {:?} pipeline '{}'", decl.kind, decl.name);
            registry.pipelines.insert(
                decl.name.clone(),
                PipelineBinding {
                    pipeline,
                    root_signature,
                    kind: decl.kind,
                },
            );
            registry.order.push(decl.name.clone());
        }

        info!("Pipeline registry ready with {} pipelines", registry.order.len());
        Ok(registry)
    }

    /// Builds the registry from a declaration file.
    pub fn load(
        device: Arc<dyn GpuDevice>,
        path: impl AsRef<Path>,
        color_format: Format,
    ) -> RenderResult<Self> {
        let decls = PipelineDecl::load(path)?;
        Self::new(device, &decls, color_format)
    }

    pub fn get(&self, name: &str) -> Option<PipelineBinding> {
        self.pipelines.get(name).copied()
    }

    /// Pipeline names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn root_signature(&self) -> RootSignatureId {
        self.root_signature
    }

    /// The mip generation pipeline, when one is declared as compute.
    pub fn mip_pipeline(&self) -> Option<PipelineBinding> {
        self.get(MIP_PIPELINE)
            .filter(|binding| binding.kind == PipelineKind::Compute)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Drop for PipelineRegistry {
    fn drop(&mut self) {
        for binding in self.pipelines.values() {
            self.device.destroy_pipeline_state(binding.pipeline);
        }
        self.device.destroy_root_signature(self.root_signature);
        debug!("Destroyed {} pipelines", self.pipelines.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::backend::soft::SoftDevice;

    fn decls(json: &str) -> Vec<PipelineDecl> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_defaults() {
        let parsed = decls(r#"[{ "Name": "Forward", "Type": "Graphics", "Shader": "forward" }]"#);
        assert_eq!(parsed[0].cull_mode, CullMode::Back);
        assert_eq!(parsed[0].depth_testing, DepthTesting::Less);
        assert_eq!(parsed[0].vertex_input, VertexInput::Mesh);

        let desc = parsed[0].to_desc(Format::Bgra8Unorm);
        assert_eq!(desc.depth_format, Some(Format::D32Float));
        assert!(desc.vertex_layout.is_some());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<Vec<PipelineDecl>, _> =
            serde_json::from_str(r#"[{ "Name": "X", "Type": "Mesh", "Shader": "x" }]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_builds_all() {
        let device: Arc<dyn GpuDevice> = Arc::new(SoftDevice::new());
        let registry = PipelineRegistry::new(
            device,
            &decls(
                r#"[
                    { "Name": "Forward", "Type": "Graphics", "Shader": "forward" },
                    { "Name": "Composite", "Type": "Graphics", "Shader": "composite",
                      "DepthTesting": "None", "VertexInput": "None", "CullMode": "None" },
                    { "Name": "GenerateMips", "Type": "Compute", "Shader": "mips" }
                ]"#,
            ),
            Format::Bgra8Unorm,
        )
        .unwrap();

        assert_eq!(registry.names(), &["Forward", "Composite", "GenerateMips"]);
        let forward = registry.get("Forward").unwrap();
        assert_eq!(forward.root_signature, registry.root_signature());
        assert!(registry.mip_pipeline().is_some());
        assert!(registry.get("Bloom").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let device: Arc<dyn GpuDevice> = Arc::new(SoftDevice::new());
        let result = PipelineRegistry::new(
            device,
            &decls(
                r#"[
                    { "Name": "Forward", "Type": "Graphics", "Shader": "a" },
                    { "Name": "Forward", "Type": "Graphics", "Shader": "b" }
                ]"#,
            ),
            Format::Bgra8Unorm,
        );
        assert!(matches!(result, Err(RenderError::DuplicatePipeline(name)) if name == "Forward"));
    }
}
