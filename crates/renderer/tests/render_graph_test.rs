//! End-to-end frames through the render graph on the simulated device.

use std::sync::Arc;

use ember_renderer::{PassDecl, PipelineDecl, RenderError, Renderer, RendererDesc};
use ember_rhi::backend::soft::SoftDevice;
use ember_rhi::command::Command;
use ember_rhi::device::GpuDevice;
use ember_rhi::types::ResourceState;
use ember_scene::{SceneDescription, SceneEntry};

const PIPELINES: &str = r#"[
    { "Name": "Forward", "Type": "Graphics", "Shader": "forward" },
    { "Name": "Composite", "Type": "Graphics", "Shader": "composite",
      "CullMode": "None", "DepthTesting": "None", "VertexInput": "None" }
]"#;

fn scene() -> SceneDescription {
    SceneDescription {
        entries: vec![SceneEntry::new("builtin:cube"), SceneEntry::new("builtin:triangle")],
    }
}

fn build(passes: &str) -> (Arc<SoftDevice>, Result<Renderer, RenderError>) {
    let device = Arc::new(SoftDevice::new());
    let pipelines: Vec<PipelineDecl> = serde_json::from_str(PIPELINES).unwrap();
    let passes: Vec<PassDecl> = serde_json::from_str(passes).unwrap();
    let dyn_device: Arc<dyn GpuDevice> = device.clone();
    let renderer = Renderer::from_parts(
        dyn_device,
        &RendererDesc::new(320, 240),
        &pipelines,
        &passes,
        &scene(),
    );
    (device, renderer)
}

fn count(commands: &[Command], pred: impl Fn(&Command) -> bool) -> usize {
    commands.iter().filter(|c| pred(c)).count()
}

#[test]
fn test_forward_frames() {
    let (device, renderer) = build(r#"[{ "Name": "Forward", "PSO": "Forward" }]"#);
    let mut renderer = renderer.unwrap();

    for _ in 0..3 {
        renderer.render_frame().unwrap();
    }

    assert!(device.hazards().is_empty(), "{:?}", device.hazards());
    let frame = device.executed().pop().unwrap();
    assert_eq!(
        count(&frame.commands, |c| matches!(c, Command::DrawIndexedInstanced { .. })),
        2
    );
    assert_eq!(renderer.context().frame_count(), 3);
    assert_eq!(renderer.scene().models().len(), 2);
}

#[test]
fn test_accumulate_then_composite() {
    let (device, renderer) = build(
        r#"[
            { "Name": "Accumulate", "PSO": "Forward" },
            { "Name": "Composite", "PSO": "Composite" }
        ]"#,
    );
    let mut renderer = renderer.unwrap();
    assert_eq!(renderer.graph().pass_names(), vec!["accumulate", "composite"]);

    for _ in 0..4 {
        renderer.render_frame().unwrap();
    }

    assert!(device.hazards().is_empty(), "{:?}", device.hazards());
    let frame = device.executed().pop().unwrap();
    assert_eq!(
        count(&frame.commands, |c| matches!(c, Command::DrawIndexedInstanced { .. })),
        2
    );
    assert_eq!(
        count(&frame.commands, |c| matches!(
            c,
            Command::DrawInstanced { vertex_count: 3, .. }
        )),
        1
    );
}

#[test]
fn test_composite_alone_reads_both_history_targets() {
    let (device, renderer) = build(r#"[{ "Name": "Composite", "PSO": "Composite" }]"#);
    let mut renderer = renderer.unwrap();
    let history = renderer.context().history();
    let targets = [history.active().id(), history.last().id()];

    renderer.render_frame().unwrap();

    let frame = device.executed().pop().unwrap();
    let to_shader_read: Vec<_> = frame
        .commands
        .iter()
        .filter_map(|c| match c {
            Command::ResourceBarrier(b) => Some(b.clone()),
            _ => None,
        })
        .flatten()
        .filter(|b| b.after == ResourceState::PixelShaderResource)
        .map(|b| b.resource)
        .collect();
    for target in targets {
        assert!(to_shader_read.contains(&target));
    }

    let history = renderer.context().history();
    assert_eq!(history.active().state(), ResourceState::PixelShaderResource);
    assert_eq!(history.last().state(), ResourceState::PixelShaderResource);

    renderer.render_frame().unwrap();
    assert!(device.hazards().is_empty(), "{:?}", device.hazards());
}

#[test]
fn test_draws_carry_descriptor_indices() {
    let (device, renderer) = build(r#"[{ "Name": "Forward", "PSO": "Forward" }]"#);
    let mut renderer = renderer.unwrap();
    let slot = renderer.context().frame_index();
    renderer.render_frame().unwrap();

    let frame = device.executed().pop().unwrap();
    let values = frame
        .commands
        .iter()
        .find_map(|c| match c {
            Command::SetRoot32BitConstants { values, .. } => Some(values.clone()),
            _ => None,
        })
        .unwrap();

    let scene = renderer.scene();
    let model = &scene.models()[0];
    let mesh = &model.meshes()[0];
    assert_eq!(values[0], scene.frame_constants_index(slot).unwrap());
    assert_eq!(values[1], mesh.constants_index(slot).unwrap());
    assert_eq!(values[2], scene.texture_index(model, mesh));
    assert_eq!(values[3], scene.sampler_index());
}

#[test]
fn test_resize_between_frames() {
    let (device, renderer) = build(r#"[{ "Name": "Forward", "PSO": "Forward" }]"#);
    let mut renderer = renderer.unwrap();
    renderer.render_frame().unwrap();

    renderer.resize(160, 120);
    assert_eq!(renderer.extent(), (320, 240));
    renderer.render_frame().unwrap();
    assert_eq!(renderer.extent(), (160, 120));
    assert!((renderer.scene().camera.aspect() - 160.0 / 120.0).abs() < 1e-5);

    // Minimized windows report zero and are ignored.
    renderer.resize(0, 0);
    renderer.render_frame().unwrap();
    assert_eq!(renderer.extent(), (160, 120));
    assert!(device.hazards().is_empty());
}

#[test]
fn test_unknown_pass_fails_before_any_frame() {
    let (device, renderer) = build(r#"[{ "Name": "Bloom", "PSO": "Forward" }]"#);
    let err = renderer.err().unwrap();
    assert!(err.is_config());
    assert!(device.executed().is_empty());
}

#[test]
fn test_teardown_releases_everything() {
    let (device, renderer) = build(r#"[{ "Name": "Forward", "PSO": "Forward" }]"#);
    let mut renderer = renderer.unwrap();
    renderer.render_frame().unwrap();
    renderer.render_frame().unwrap();
    drop(renderer);
    assert_eq!(device.live_resource_count(), 0);
}
