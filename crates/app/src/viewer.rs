//! The interactive scene viewer: a fly camera over the configured scene.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use ember_core::{BackendKind, EngineConfig};
use ember_platform::{AppHooks, InputState, KeyCode, SurfaceTarget};
use ember_renderer::Renderer;
use ember_rhi::device::{DeviceDesc, WindowHandles, create_device};
use ember_rhi::types::Backend;
use ember_scene::{FlyController, Movement};

/// Key bindings for camera movement.
fn movement_for(key: KeyCode) -> Option<Movement> {
    match key {
        KeyCode::KeyW | KeyCode::ArrowUp => Some(Movement::Forward),
        KeyCode::KeyS | KeyCode::ArrowDown => Some(Movement::Backward),
        KeyCode::KeyA | KeyCode::ArrowLeft => Some(Movement::Left),
        KeyCode::KeyD | KeyCode::ArrowRight => Some(Movement::Right),
        KeyCode::KeyE | KeyCode::Space => Some(Movement::Up),
        KeyCode::KeyQ | KeyCode::ShiftLeft => Some(Movement::Down),
        _ => None,
    }
}

pub struct Viewer {
    config: EngineConfig,
    renderer: Option<Renderer>,
    controller: FlyController,
    exit_requested: bool,
}

impl Viewer {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            renderer: None,
            controller: FlyController::default(),
            exit_requested: false,
        }
    }

    fn device_desc(&self, target: &SurfaceTarget) -> DeviceDesc {
        DeviceDesc {
            backend: match self.config.backend {
                BackendKind::Vulkan => Backend::Vulkan,
                BackendKind::Soft => Backend::Soft,
            },
            use_software_adapter: self.config.use_software_adapter,
            enable_validation: self.config.enable_validation,
            shader_dir: self.config.shader_dir.clone(),
            window: target.handles.map(|h| WindowHandles {
                display: h.display,
                window: h.window,
            }),
        }
    }
}

impl AppHooks for Viewer {
    type Error = anyhow::Error;

    fn on_init(&mut self, target: &SurfaceTarget) -> Result<()> {
        let device = create_device(&self.device_desc(target)).context("creating device")?;

        // The window may have been created at a different size.
        self.config.window.width = target.width;
        self.config.window.height = target.height;
        let renderer = Renderer::new(device, &self.config).context("creating renderer")?;

        self.controller = FlyController::from_camera(&renderer.scene().camera);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn on_update(&mut self, _input: &InputState, delta: Duration) {
        if let Some(renderer) = self.renderer.as_mut() {
            self.controller
                .update(&mut renderer.scene_mut().camera, delta.as_secs_f32());
        }
    }

    fn on_render(&mut self) -> Result<()> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };
        if let Err(e) = renderer.render_frame() {
            if e.is_device_failure() {
                error!("Device lost: {}", e);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn on_destroy(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(e) = renderer.wait_idle() {
                warn!("Failed to drain the GPU before shutdown: {}", e);
            }
            info!(
                "Rendered {} frames, {:.1} fps average",
                renderer.context().frame_count(),
                renderer.average_fps()
            );
        }
    }

    fn on_resize(&mut self, width: u32, height: u32) {
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.resize(width, height);
        }
    }

    fn on_key_down(&mut self, key: KeyCode) {
        if key == KeyCode::Escape {
            self.exit_requested = true;
        } else if let Some(movement) = movement_for(key) {
            self.controller.set_movement(movement, true);
        }
    }

    fn on_key_up(&mut self, key: KeyCode) {
        if let Some(movement) = movement_for(key) {
            self.controller.set_movement(movement, false);
        }
    }

    fn on_mouse_move(&mut self, dx: f32, dy: f32) {
        self.controller.on_mouse_move(dx, dy);
    }

    fn should_exit(&self) -> bool {
        self.exit_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soft_config() -> EngineConfig {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../assets/ember.json");
        let mut config = EngineConfig::load(path).unwrap();
        config.backend = BackendKind::Soft;
        config
    }

    #[test]
    fn test_headless_run_over_bundled_assets() {
        let mut viewer = Viewer::new(soft_config());
        ember_platform::run_headless(&mut viewer, 320, 240, 4).unwrap();
        assert!(viewer.renderer.is_none());
    }

    #[test]
    fn test_keys_drive_the_camera() {
        let mut viewer = Viewer::new(soft_config());
        viewer.on_init(&SurfaceTarget::headless(320, 240)).unwrap();
        let start = viewer.renderer.as_ref().unwrap().scene().camera.position;

        viewer.on_key_down(KeyCode::KeyW);
        assert!(viewer.controller.is_moving(Movement::Forward));
        viewer.on_update(&InputState::new(), Duration::from_millis(500));
        let moved = viewer.renderer.as_ref().unwrap().scene().camera.position;
        assert!((moved - start).length() > 0.1);

        viewer.on_key_up(KeyCode::KeyW);
        assert!(!viewer.controller.is_moving(Movement::Forward));
        viewer.on_destroy();
    }

    #[test]
    fn test_escape_requests_exit() {
        let mut viewer = Viewer::new(EngineConfig::default());
        assert!(!viewer.should_exit());
        viewer.on_key_down(KeyCode::Escape);
        assert!(viewer.should_exit());
    }

    #[test]
    fn test_movement_bindings() {
        assert_eq!(movement_for(KeyCode::KeyA), Some(Movement::Left));
        assert_eq!(movement_for(KeyCode::Space), Some(Movement::Up));
        assert_eq!(movement_for(KeyCode::KeyZ), None);
    }
}
