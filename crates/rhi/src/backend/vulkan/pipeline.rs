//! Root signatures and pipeline state objects on Vulkan.
//!
//! A root signature becomes a pipeline layout over the bindless sets plus
//! one push-constant block covering every root parameter. Pipelines use
//! dynamic rendering, so attachment formats come straight from the
//! description instead of a render pass.

use std::path::{Path, PathBuf};

use ash::vk;
use tracing::{debug, info};

use super::convert;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{DepthTesting, PipelineKind, PipelineStateDesc, RootSignatureDesc};

const ENTRY_POINT: &std::ffi::CStr = c"main";

pub struct RootSignature {
    pub layout: vk::PipelineLayout,
    pub desc: RootSignatureDesc,
}

pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
}

/// Creates the pipeline layout for a root signature.
pub fn create_root_signature(
    device: &ash::Device,
    desc: &RootSignatureDesc,
    set_layouts: &[vk::DescriptorSetLayout],
) -> RhiResult<RootSignature> {
    desc.validate()?;

    let size = desc.total_dwords() * 4;
    let ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::ALL,
        offset: 0,
        size,
    }];
    let ranges: &[vk::PushConstantRange] = if size > 0 { &ranges } else { &[] };

    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(ranges);
    let layout = unsafe { device.create_pipeline_layout(&info, None)? };

    debug!(
        "Root signature '{}': {} set(s), {} bytes of constants",
        desc.name,
        set_layouts.len(),
        size
    );
    Ok(RootSignature {
        layout,
        desc: desc.clone(),
    })
}

/// Paths of the SPIR-V binaries a pipeline needs.
pub fn shader_paths(shader_dir: &Path, desc: &PipelineStateDesc) -> Vec<PathBuf> {
    let stages: &[&str] = match desc.kind {
        PipelineKind::Graphics => &["vert", "frag"],
        PipelineKind::Compute => &["comp"],
    };
    stages
        .iter()
        .map(|stage| shader_dir.join(format!("{}.{}.spv", desc.shader, stage)))
        .collect()
}

/// Reads a SPIR-V file into a shader module.
fn load_shader(device: &ash::Device, path: &Path) -> RhiResult<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .map_err(|e| RhiError::Shader(format!("failed to read {}: {e}", path.display())))?;

    if !bytes.len().is_multiple_of(4) {
        return Err(RhiError::Shader(format!(
            "{} is not SPIR-V ({} bytes)",
            path.display(),
            bytes.len()
        )));
    }
    let code: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    let info = vk::ShaderModuleCreateInfo::default().code(&code);
    let module = unsafe { device.create_shader_module(&info, None)? };
    debug!("Loaded shader {}", path.display());
    Ok(module)
}

/// Builds a graphics or compute pipeline.
///
/// # Errors
///
/// Returns [`RhiError::Shader`] if a binary is missing or malformed and
/// [`RhiError::Pipeline`] if the driver rejects the pipeline.
pub fn create_pipeline(
    device: &ash::Device,
    shader_dir: &Path,
    desc: &PipelineStateDesc,
    layout: vk::PipelineLayout,
) -> RhiResult<Pipeline> {
    desc.validate()?;

    let mut modules = Vec::new();
    for path in shader_paths(shader_dir, desc) {
        match load_shader(device, &path) {
            Ok(module) => modules.push(module),
            Err(e) => {
                destroy_modules(device, &modules);
                return Err(e);
            }
        }
    }

    let result = match desc.kind {
        PipelineKind::Graphics => build_graphics(device, desc, layout, modules[0], modules[1]),
        PipelineKind::Compute => build_compute(device, layout, modules[0]),
    };
    destroy_modules(device, &modules);

    let pipeline = result.map_err(|e| RhiError::Pipeline(format!("'{}': {e}", desc.name)))?;
    info!("Created {:?} pipeline '{}'", desc.kind, desc.name);
    Ok(Pipeline {
        pipeline,
        bind_point: match desc.kind {
            PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        },
    })
}

fn destroy_modules(device: &ash::Device, modules: &[vk::ShaderModule]) {
    for &module in modules {
        unsafe { device.destroy_shader_module(module, None) };
    }
}

fn build_compute(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    module: vk::ShaderModule,
) -> Result<vk::Pipeline, vk::Result> {
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(ENTRY_POINT);
    let info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

    let pipelines = unsafe {
        device
            .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
            .map_err(|(_, e)| e)?
    };
    Ok(pipelines[0])
}

fn build_graphics(
    device: &ash::Device,
    desc: &PipelineStateDesc,
    layout: vk::PipelineLayout,
    vertex: vk::ShaderModule,
    fragment: vk::ShaderModule,
) -> Result<vk::Pipeline, vk::Result> {
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex)
            .name(ENTRY_POINT),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment)
            .name(ENTRY_POINT),
    ];

    let (bindings, attributes) = match &desc.vertex_layout {
        Some(layout) => (
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: layout.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            layout
                .attributes
                .iter()
                .map(|a| vk::VertexInputAttributeDescription {
                    location: a.location,
                    binding: 0,
                    format: convert::format(a.format),
                    offset: a.offset,
                })
                .collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert::topology(desc.topology));

    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    // Viewports are flipped to match a y-down clip space, which also flips
    // the winding seen by the rasterizer.
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(convert::cull_mode(desc.cull_mode))
        .front_face(vk::FrontFace::CLOCKWISE);

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_enabled = desc.depth == DepthTesting::Less && desc.depth_format.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth_enabled)
        .depth_write_enable(depth_enabled)
        .depth_compare_op(vk::CompareOp::LESS);

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        })
        .collect();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::PRIMITIVE_TOPOLOGY,
    ];
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc.color_formats.iter().map(|&f| convert::format(f)).collect();
    let mut rendering = vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
    if let Some(depth) = desc.depth_format {
        rendering = rendering.depth_attachment_format(convert::format(depth));
    }

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(layout)
        .push_next(&mut rendering);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
            .map_err(|(_, e)| e)?
    };
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Format;

    #[test]
    fn test_graphics_shader_paths() {
        let desc = PipelineStateDesc::graphics("forward", "mesh", vec![Format::Bgra8Unorm]);
        let paths = shader_paths(Path::new("shaders"), &desc);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("shaders/mesh.vert.spv"),
                PathBuf::from("shaders/mesh.frag.spv")
            ]
        );
    }

    #[test]
    fn test_compute_shader_paths() {
        let desc = PipelineStateDesc::compute("mips", "downsample");
        let paths = shader_paths(Path::new("shaders"), &desc);
        assert_eq!(paths, vec![PathBuf::from("shaders/downsample.comp.spv")]);
    }
}
