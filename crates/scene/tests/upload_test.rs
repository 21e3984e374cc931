//! Scene uploads against the simulated device.

use std::sync::Arc;

use ember_resources::primitives;
use ember_rhi::backend::soft::SoftDevice;
use ember_rhi::command::{CommandAllocator, CommandList, CommandQueue};
use ember_rhi::descriptor::{DescriptorCategory, HeapLayout};
use ember_rhi::resource::ResourceManager;
use ember_rhi::sync::Fence;
use ember_rhi::types::ResourceState;
use ember_scene::{FrameConstants, Scene, SceneDescription, SceneEntry, Transform, UploadOptions};

struct Harness {
    device: Arc<SoftDevice>,
    resources: Arc<ResourceManager>,
    queue: CommandQueue,
    fence: Fence,
    allocator: CommandAllocator,
    list: CommandList,
}

impl Harness {
    fn new() -> Self {
        let device = Arc::new(SoftDevice::new());
        let resources = ResourceManager::new(device.clone(), HeapLayout::default()).unwrap();
        let queue = CommandQueue::new(device.clone());
        let fence = Fence::new(device.clone(), 0).unwrap();
        let allocator = CommandAllocator::new(device.clone()).unwrap();
        let mut list = CommandList::new("upload");
        list.reset(&allocator).unwrap();
        resources.set_frame_fence_value(1);
        Self {
            device,
            resources,
            queue,
            fence,
            allocator,
            list,
        }
    }

    fn submit(&mut self) {
        self.list.close().unwrap();
        self.queue.execute(&mut self.list, &mut self.allocator).unwrap();
        self.fence.signal(&self.queue, 1).unwrap();
        self.allocator.mark_fenced(1);
        self.fence.wait(1).unwrap();
        self.resources.release_completed(1);
    }
}

#[test]
fn test_upload_cube_and_triangle() {
    let mut h = Harness::new();
    let description = SceneDescription {
        entries: vec![SceneEntry::new("builtin:cube"), SceneEntry::new("builtin:triangle")],
    };
    let scene = Scene::from_description(
        h.resources.clone(),
        &mut h.list,
        &description,
        2,
        UploadOptions::default(),
    )
    .unwrap();
    h.submit();

    assert!(h.device.hazards().is_empty());
    assert_eq!(scene.models().len(), 2);
    let cube = &scene.models()[0].meshes()[0];
    assert_eq!(cube.index_count(), 36);
    assert_eq!(
        h.device.resource_state(cube.vertex_view().resource),
        Some(ResourceState::GenericRead)
    );

    // Index data made it through the staging copy.
    let indices = h.device.buffer_contents(cube.index_view().resource).unwrap();
    let indices: &[u32] = bytemuck::cast_slice(&indices);
    assert_eq!(&indices[..6], &[0, 1, 2, 0, 2, 3]);
}

#[test]
fn test_staging_buffers_released_after_fence() {
    let mut h = Harness::new();
    let mut scene = Scene::new(h.resources.clone(), &mut h.list, 2, UploadOptions::default()).unwrap();
    scene
        .add_model(&mut h.list, &primitives::triangle(), Transform::default())
        .unwrap();
    let before = h.device.live_resource_count();
    h.submit();
    // Vertex + index staging plus the fallback texture's staging buffer.
    assert_eq!(h.device.live_resource_count(), before - 3);
}

#[test]
fn test_update_writes_slot_constants() {
    let mut h = Harness::new();
    let mut scene = Scene::new(h.resources.clone(), &mut h.list, 2, UploadOptions::default()).unwrap();
    scene
        .add_model(&mut h.list, &primitives::cube(), Transform::default())
        .unwrap();
    h.submit();

    scene.update(1, 2.0, 9).unwrap();
    assert!(scene.update(2, 0.0, 0).is_err());

    // Two frame buffers plus one object buffer per slot.
    assert_eq!(h.resources.used(DescriptorCategory::ConstantBuffer), 4);
    assert_ne!(scene.frame_constants_index(0), scene.frame_constants_index(1));
    let mesh = &scene.models()[0].meshes()[0];
    assert_ne!(mesh.constants_index(0), mesh.constants_index(1));
    assert!(mesh.constants_index(2).is_none());

    let texture = scene.texture_index(&scene.models()[0], mesh);
    assert!(h.resources.layout().range(DescriptorCategory::Texture).contains(&texture));
    assert_eq!(FrameConstants::SIZE, 240);
}
