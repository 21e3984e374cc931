//! Frame pacing against the simulated device.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ember_renderer::{ContextDesc, FRAME_COUNT, FramePhase, GpuContext};
use ember_rhi::backend::soft::{CompletionPolicy, GpuEvent, SoftDevice};
use ember_rhi::command::Command;
use ember_rhi::descriptor::{DescriptorCategory, HeapLayout};
use ember_rhi::resource::ResourceManager;
use ember_rhi::types::{ResourceState, ScissorRect, Viewport};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

fn setup(width: u32, height: u32) -> (Arc<SoftDevice>, GpuContext) {
    let device = Arc::new(SoftDevice::new());
    let resources = ResourceManager::new(device.clone(), HeapLayout::default()).unwrap();
    let context = GpuContext::new(resources, &ContextDesc::new(width, height)).unwrap();
    (device, context)
}

fn run_frame(ctx: &mut GpuContext) {
    ctx.begin_frame().unwrap();
    ctx.end_frame().unwrap();
    ctx.execute().unwrap();
    ctx.present().unwrap();
    ctx.move_to_next_frame().unwrap();
}

#[test]
fn test_steady_state_never_blocks() {
    let (device, mut ctx) = setup(320, 240);

    let mut indices = Vec::new();
    for _ in 0..5 {
        indices.push(ctx.back_buffer_index());
        run_frame(&mut ctx);
    }

    assert_eq!(indices, vec![0, 1, 0, 1, 0]);
    assert_eq!(ctx.fence_stats().blocking_waits, 0);
    assert!(device.hazards().is_empty());
    assert_eq!(ctx.frame_count(), 5);
    assert_eq!(FRAME_COUNT, 2);
}

#[test]
fn test_frame_slots_cycle_round_robin() {
    let (_device, mut ctx) = setup(320, 240);
    let mut slots = Vec::new();
    for _ in 0..4 {
        slots.push(ctx.frame_index());
        run_frame(&mut ctx);
    }
    assert_eq!(slots, vec![0, 1, 0, 1]);
    // Each advance hands the next slot the value just signaled plus one.
    let values = ctx.fence_values();
    assert_eq!(ctx.fence().last_signaled() + 1, values[ctx.frame_index()]);
}

#[test]
fn test_extra_swap_images_never_block_with_one_frame_of_lag() {
    let device = Arc::new(
        SoftDevice::with_policy(CompletionPolicy::Lagged(1)).with_min_image_count(3),
    );
    let resources = ResourceManager::new(device.clone(), HeapLayout::default()).unwrap();
    let mut ctx = GpuContext::new(resources, &ContextDesc::new(320, 240)).unwrap();
    assert_eq!(ctx.surface().buffer_count(), 3);

    let mut back_buffers = Vec::new();
    let mut slots = Vec::new();
    for _ in 0..9 {
        back_buffers.push(ctx.back_buffer_index());
        slots.push(ctx.frame_index());
        run_frame(&mut ctx);
    }

    assert_eq!(back_buffers, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    assert_eq!(slots, vec![0, 1, 0, 1, 0, 1, 0, 1, 0]);
    assert_eq!(ctx.fence_stats().blocking_waits, 0);
    assert!(device.hazards().is_empty());
}

#[test]
fn test_gpu_lag_blocks_third_advance() {
    let (device, mut ctx) = setup(320, 240);
    device.set_policy(CompletionPolicy::Manual);
    let fence = ctx.fence().id();

    // Frame 1 signals 1; the GPU finishes it later.
    run_frame(&mut ctx);
    device.complete_through(fence, 1);

    // Frame 2 signals 2 and returns to slot 0, whose value 1 is done.
    run_frame(&mut ctx);
    assert_eq!(ctx.fence_stats().blocking_waits, 0);

    // Frame 3 returns to slot 1, which needs value 2: the GPU is behind.
    ctx.begin_frame().unwrap();
    ctx.end_frame().unwrap();
    ctx.execute().unwrap();
    ctx.present().unwrap();

    let gpu = device.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        gpu.complete_through(fence, 2);
    });
    ctx.move_to_next_frame().unwrap();
    worker.join().unwrap();

    assert_eq!(ctx.fence_stats().blocking_waits, 1);
    assert_eq!(ctx.fence().completed_value().unwrap(), 2);

    // The slot's allocator was only recycled after the completion.
    ctx.begin_frame().unwrap();
    let events = device.events();
    let completed = events
        .iter()
        .position(|e| *e == GpuEvent::Complete { fence, value: 2 })
        .unwrap();
    let last_reset = events
        .iter()
        .rposition(|e| matches!(e, GpuEvent::AllocatorReset { .. }))
        .unwrap();
    assert!(completed < last_reset);
    assert!(device.hazards().is_empty());

    device.set_policy(CompletionPolicy::Immediate);
}

#[test]
fn test_barriers_bracket_every_frame() {
    let (device, mut ctx) = setup(320, 240);
    for _ in 0..3 {
        let back_buffer = ctx.surface().back_buffer(ctx.back_buffer_index()).unwrap().id();
        run_frame(&mut ctx);

        let list = device.executed().pop().unwrap();
        let barriers: Vec<_> = list
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::ResourceBarrier(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .filter(|b| b.resource == back_buffer)
            .collect();

        assert_eq!(barriers.len(), 2);
        assert_eq!(
            (barriers[0].before, barriers[0].after),
            (ResourceState::Present, ResourceState::RenderTarget)
        );
        assert_eq!(
            (barriers[1].before, barriers[1].after),
            (ResourceState::RenderTarget, ResourceState::Present)
        );
        assert!(matches!(list.commands.first(), Some(Command::ResourceBarrier(_))));
        assert!(matches!(list.commands.last(), Some(Command::ResourceBarrier(_))));
    }
}

#[test]
fn test_ping_pong_toggles_each_frame() {
    let (_device, mut ctx) = setup(320, 240);
    let first = ctx.history().active_index();
    run_frame(&mut ctx);
    assert_ne!(ctx.history().active_index(), first);
    run_frame(&mut ctx);
    assert_eq!(ctx.history().active_index(), first);
}

#[test]
fn test_resize_recreates_targets() {
    let (device, mut ctx) = setup(1280, 720);
    run_frame(&mut ctx);
    run_frame(&mut ctx);
    run_frame(&mut ctx);

    let old_back_buffer = ctx.surface().back_buffer(0).unwrap().id();
    let old_depth = ctx.depth_buffer().id();
    let old_history = ctx.history().active().id();

    ctx.resize(640, 480).unwrap();

    assert_eq!((ctx.surface().width(), ctx.surface().height()), (640, 480));
    assert_eq!(ctx.viewport(), Viewport::from_size(640, 480));
    assert_eq!(ctx.scissor(), ScissorRect::from_size(640, 480));
    assert_eq!(ctx.fence_values(), vec![1, 0]);
    assert_eq!(ctx.fence().last_signaled(), 0);
    assert_eq!(ctx.phase(), FramePhase::Idle);

    assert!(!device.is_live(old_back_buffer));
    assert!(!device.is_live(old_depth));
    assert!(!device.is_live(old_history));
    assert_eq!(ctx.depth_buffer().extent(), (640, 480));
    assert_eq!(ctx.history().active().extent(), (640, 480));
    let back_buffer = ctx.surface().back_buffer(0).unwrap().id();
    assert_eq!(device.texture_desc(back_buffer).unwrap().width, 640);

    // Two back buffers and two ping-pong targets; nothing leaked.
    let resources = ctx.resources().clone();
    assert_eq!(resources.used(DescriptorCategory::RenderTarget), 4);
    assert_eq!(resources.used(DescriptorCategory::DepthStencil), 1);

    run_frame(&mut ctx);
    assert!(device.hazards().is_empty());
    assert!(device
        .events()
        .contains(&GpuEvent::SwapChainResized { width: 640, height: 480 }));
}

#[test]
fn test_teardown_leaves_allocators_idle() {
    let (device, mut ctx) = setup(320, 240);
    run_frame(&mut ctx);
    ctx.begin_frame().unwrap();
    drop(ctx);
    assert_eq!(device.live_resource_count(), 0);
}

/// Replays the device's event log and checks that no allocator was reset
/// while a submission recorded from it could still be executing.
fn assert_resets_follow_completion(events: &[GpuEvent]) -> Result<(), TestCaseError> {
    let mut last_serial = 0;
    let mut signal_serials = HashMap::new();
    let mut completed_serial = 0;
    let mut allocator_serials = HashMap::new();

    for event in events {
        match *event {
            GpuEvent::Execute { allocator, serial } => {
                last_serial = serial;
                allocator_serials.insert(allocator, serial);
            }
            GpuEvent::Signal { value, .. } => {
                signal_serials.insert(value, last_serial);
            }
            GpuEvent::Complete { value, .. } => {
                if let Some(&serial) = signal_serials.get(&value) {
                    completed_serial = completed_serial.max(serial);
                }
            }
            GpuEvent::AllocatorReset { allocator } => {
                let pending = allocator_serials.get(&allocator).copied().unwrap_or(0);
                prop_assert!(
                    pending <= completed_serial,
                    "allocator reset with submission {} outstanding (completed {})",
                    pending,
                    completed_serial
                );
            }
            _ => {}
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_allocators_reset_only_after_completion(lag in 0u64..4, frames in 1usize..12) {
        let device = Arc::new(SoftDevice::with_policy(CompletionPolicy::Lagged(lag)));
        let resources = ResourceManager::new(device.clone(), HeapLayout::default()).unwrap();
        let mut ctx = GpuContext::new(resources, &ContextDesc::new(64, 64)).unwrap();

        for _ in 0..frames {
            run_frame(&mut ctx);
            let current = ctx.fence_values()[ctx.frame_index()];
            prop_assert_eq!(current, ctx.fence().last_signaled() + 1);
        }
        ctx.begin_frame().unwrap();

        assert_resets_follow_completion(&device.events())?;
        prop_assert!(device.hazards().is_empty());
        if lag <= 1 {
            prop_assert_eq!(ctx.fence_stats().blocking_waits, 0);
        } else if frames >= 2 {
            prop_assert!(ctx.fence_stats().blocking_waits >= 1);
        }
    }
}

#[test]
fn test_lagging_gpu_blocks_second_return_to_slot() {
    let device = Arc::new(SoftDevice::with_policy(CompletionPolicy::Lagged(2)));
    let resources = ResourceManager::new(device.clone(), HeapLayout::default()).unwrap();
    let mut ctx = GpuContext::new(resources, &ContextDesc::new(64, 64)).unwrap();
    run_frame(&mut ctx);
    run_frame(&mut ctx);
    // Slot 0 came back while value 1 was still queued.
    assert_eq!(ctx.fence_stats().blocking_waits, 1);
    assert!(ctx.fence().completed_value().unwrap() >= 1);
}
