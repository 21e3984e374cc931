//! Pipeline state and root signature descriptions.
//!
//! A root signature lists the values a pipeline reads outside its vertex
//! stream. Every parameter occupies 32-bit slots in one small constant
//! block; descriptor tables are a single slot holding the base index into
//! the shader-visible heap.

use serde::Deserialize;

use crate::descriptor::DescriptorCategory;
use crate::error::{RhiError, RhiResult};
use crate::types::{Format, PipelineId, RootSignatureId};
use crate::vertex::VertexLayout;

/// Graphics or compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

/// Triangle face culling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum CullMode {
    #[default]
    Back,
    Front,
    None,
}

/// Depth test configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum DepthTesting {
    /// Test and write with `LESS`.
    #[default]
    Less,
    None,
}

/// How vertices are assembled into primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

/// One entry of a root signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootParameter {
    /// Base index of a descriptor range in the given category.
    DescriptorTable { category: DescriptorCategory },
    /// Inline 32-bit values.
    Constants { count: u32 },
}

impl RootParameter {
    fn dwords(self) -> u32 {
        match self {
            Self::DescriptorTable { .. } => 1,
            Self::Constants { count } => count,
        }
    }
}

/// Binding layout shared by a family of pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSignatureDesc {
    pub name: String,
    pub parameters: Vec<RootParameter>,
}

impl RootSignatureDesc {
    /// Upper bound on the constant block, in 32-bit values.
    pub const MAX_DWORDS: u32 = 32;

    /// Root signature used by the built-in passes: one 16-value constant
    /// block carrying descriptor indices and per-draw data.
    pub fn bindless(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: vec![RootParameter::Constants { count: 16 }],
        }
    }

    /// Offset, in 32-bit values, of a parameter inside the constant block.
    pub fn dword_offset(&self, parameter: u32) -> Option<u32> {
        let index = parameter as usize;
        if index >= self.parameters.len() {
            return None;
        }
        Some(self.parameters[..index].iter().map(|p| p.dwords()).sum())
    }

    /// Number of 32-bit values a parameter holds.
    pub fn parameter_dwords(&self, parameter: u32) -> Option<u32> {
        self.parameters.get(parameter as usize).map(|p| p.dwords())
    }

    pub fn total_dwords(&self) -> u32 {
        self.parameters.iter().map(|p| p.dwords()).sum()
    }

    /// # Errors
    ///
    /// Returns [`RhiError::Pipeline`] if the constant block exceeds
    /// [`Self::MAX_DWORDS`].
    pub fn validate(&self) -> RhiResult<()> {
        let total = self.total_dwords();
        if total > Self::MAX_DWORDS {
            return Err(RhiError::Pipeline(format!(
                "root signature '{}' needs {} values, limit is {}",
                self.name,
                total,
                Self::MAX_DWORDS
            )));
        }
        Ok(())
    }
}

/// Everything needed to build one pipeline.
///
/// `shader` names a shader family; backends resolve it to their own
/// binaries (for Vulkan, `<shader>.vert.spv`/`<shader>.frag.spv` or
/// `<shader>.comp.spv` in the shader directory).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStateDesc {
    pub name: String,
    pub kind: PipelineKind,
    pub shader: String,
    pub cull_mode: CullMode,
    pub depth: DepthTesting,
    pub topology: PrimitiveTopology,
    pub vertex_layout: Option<VertexLayout>,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
}

impl PipelineStateDesc {
    /// Graphics pipeline with default rasterizer state, no vertex input and
    /// no depth buffer.
    pub fn graphics(name: impl Into<String>, shader: impl Into<String>, color_formats: Vec<Format>) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Graphics,
            shader: shader.into(),
            cull_mode: CullMode::Back,
            depth: DepthTesting::None,
            topology: PrimitiveTopology::TriangleList,
            vertex_layout: None,
            color_formats,
            depth_format: None,
        }
    }

    pub fn compute(name: impl Into<String>, shader: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PipelineKind::Compute,
            shader: shader.into(),
            cull_mode: CullMode::None,
            depth: DepthTesting::None,
            topology: PrimitiveTopology::TriangleList,
            vertex_layout: None,
            color_formats: Vec::new(),
            depth_format: None,
        }
    }

    /// # Errors
    ///
    /// Returns [`RhiError::Pipeline`] for graphics pipelines without color
    /// targets, or depth testing without a depth format.
    pub fn validate(&self) -> RhiResult<()> {
        if self.kind == PipelineKind::Graphics {
            if self.color_formats.is_empty() {
                return Err(RhiError::Pipeline(format!(
                    "graphics pipeline '{}' has no color targets",
                    self.name
                )));
            }
            if self.depth == DepthTesting::Less && self.depth_format.is_none() {
                return Err(RhiError::Pipeline(format!(
                    "pipeline '{}' tests depth but has no depth format",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Opaque token naming a pipeline and the root signature it was built
/// against. Passes hold these by value; the registry owns the objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineBinding {
    pub pipeline: PipelineId,
    pub root_signature: RootSignatureId,
    pub kind: PipelineKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dword_offsets() {
        let desc = RootSignatureDesc {
            name: "test".into(),
            parameters: vec![
                RootParameter::Constants { count: 4 },
                RootParameter::DescriptorTable {
                    category: DescriptorCategory::Texture,
                },
                RootParameter::Constants { count: 2 },
            ],
        };
        assert_eq!(desc.dword_offset(0), Some(0));
        assert_eq!(desc.dword_offset(1), Some(4));
        assert_eq!(desc.dword_offset(2), Some(5));
        assert_eq!(desc.dword_offset(3), None);
        assert_eq!(desc.total_dwords(), 7);
    }

    #[test]
    fn test_oversized_root_signature_rejected() {
        let desc = RootSignatureDesc {
            name: "big".into(),
            parameters: vec![RootParameter::Constants { count: 33 }],
        };
        assert!(desc.validate().is_err());
        assert!(RootSignatureDesc::bindless("ok").validate().is_ok());
    }

    #[test]
    fn test_depth_without_format_rejected() {
        let desc = PipelineStateDesc {
            name: "forward".into(),
            kind: PipelineKind::Graphics,
            shader: "forward".into(),
            cull_mode: CullMode::Back,
            depth: DepthTesting::Less,
            topology: PrimitiveTopology::TriangleList,
            vertex_layout: None,
            color_formats: vec![Format::Bgra8Unorm],
            depth_format: None,
        };
        assert!(desc.validate().is_err());
    }
}
