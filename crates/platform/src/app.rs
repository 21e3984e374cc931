//! Application lifecycle.
//!
//! An application implements [`AppHooks`]; [`run`] drives it from a winit
//! event loop and [`run_headless`] drives it for a fixed number of frames
//! without a window.
//!
//! Hook order is always `on_init`, then any number of ticks
//! (`on_update` followed by `on_render`) interleaved with input and resize
//! callbacks, then `on_destroy` exactly once if `on_init` succeeded.

use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::{DeviceEvent, DeviceId, ElementState, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use ember_core::{Timer, WindowConfig};

use crate::input::{InputState, KeyCode, KeyTransition};
use crate::window::{SurfaceTarget, Window};

/// Callbacks an application receives over its lifetime.
pub trait AppHooks {
    type Error;

    /// Called once with the presentation target before the first tick.
    /// Anything holding raw window handles must be released by
    /// [`AppHooks::on_destroy`].
    fn on_init(&mut self, target: &SurfaceTarget) -> Result<(), Self::Error>;

    fn on_update(&mut self, input: &InputState, delta: Duration);

    fn on_render(&mut self) -> Result<(), Self::Error>;

    fn on_destroy(&mut self);

    /// The drawable area changed. Zero sizes mean the window is minimized.
    fn on_resize(&mut self, _width: u32, _height: u32) {}

    fn on_key_down(&mut self, _key: KeyCode) {}

    fn on_key_up(&mut self, _key: KeyCode) {}

    /// Raw relative mouse motion.
    fn on_mouse_move(&mut self, _dx: f32, _dy: f32) {}

    /// Polled after every tick; returning true ends the loop.
    fn should_exit(&self) -> bool {
        false
    }
}

/// Why a driver stopped with an error.
#[derive(Debug, Error)]
pub enum RunError<E> {
    #[error(transparent)]
    Platform(#[from] ember_core::Error),

    #[error("application error: {0}")]
    App(E),
}

/// Runs `hooks` for `frames` ticks against an offscreen target, with a
/// fixed 60 Hz delta.
///
/// # Errors
///
/// Returns the first hook error. `on_destroy` still runs if `on_init`
/// succeeded.
pub fn run_headless<H: AppHooks>(
    hooks: &mut H,
    width: u32,
    height: u32,
    frames: u64,
) -> Result<(), RunError<H::Error>> {
    hooks
        .on_init(&SurfaceTarget::headless(width, height))
        .map_err(RunError::App)?;

    let input = InputState::new();
    let delta = Duration::from_secs_f64(1.0 / 60.0);
    let mut result = Ok(());
    for _ in 0..frames {
        hooks.on_update(&input, delta);
        if let Err(e) = hooks.on_render() {
            result = Err(RunError::App(e));
            break;
        }
        if hooks.should_exit() {
            break;
        }
    }

    hooks.on_destroy();
    result
}

/// Opens a window and runs `hooks` until it is closed or a hook fails.
///
/// # Errors
///
/// Returns [`RunError::Platform`] if the event loop or window cannot be
/// created, or the first hook error.
pub fn run<H: AppHooks>(hooks: &mut H, config: &WindowConfig) -> Result<(), RunError<H::Error>> {
    let event_loop =
        EventLoop::new().map_err(|e| ember_core::Error::Window(e.to_string()))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut driver = Driver {
        hooks,
        config: config.clone(),
        window: None,
        input: InputState::new(),
        timer: Timer::new(),
        failure: None,
        initialized: false,
    };
    event_loop
        .run_app(&mut driver)
        .map_err(|e| ember_core::Error::Window(e.to_string()))?;

    driver.shutdown();
    match driver.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct Driver<'a, H: AppHooks> {
    hooks: &'a mut H,
    config: WindowConfig,
    window: Option<Window>,
    input: InputState,
    timer: Timer,
    failure: Option<RunError<H::Error>>,
    initialized: bool,
}

impl<H: AppHooks> Driver<'_, H> {
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: RunError<H::Error>) {
        error!("Stopping event loop after failure");
        self.failure.get_or_insert(err);
        event_loop.exit();
    }

    fn key(&mut self, transition: KeyTransition) {
        if !self.input.apply_key(transition) {
            return;
        }
        match transition {
            KeyTransition::Down(key) => self.hooks.on_key_down(key),
            KeyTransition::Up(key) => self.hooks.on_key_up(key),
        }
    }

    fn tick(&mut self, event_loop: &ActiveEventLoop) {
        if !self.initialized || self.window.as_ref().is_some_and(Window::is_minimized) {
            return;
        }
        let delta = self.timer.tick();
        self.hooks.on_update(&self.input, delta);
        self.input.end_frame();
        if let Err(e) = self.hooks.on_render() {
            self.fail(event_loop, RunError::App(e));
        } else if self.hooks.should_exit() {
            event_loop.exit();
        }
    }

    /// Runs `on_destroy` once, while the window is still alive.
    fn shutdown(&mut self) {
        if self.initialized {
            self.initialized = false;
            self.hooks.on_destroy();
            if self.timer.frame_count() > 0 {
                info!("Average FPS: {:.1}", self.timer.average_fps());
            }
        }
    }
}

impl<H: AppHooks> ApplicationHandler for Driver<'_, H> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let window = match Window::new(event_loop, &self.config) {
            Ok(window) => window,
            Err(e) => return self.fail(event_loop, e.into()),
        };
        let target = match window.surface_target() {
            Ok(target) => target,
            Err(e) => return self.fail(event_loop, e.into()),
        };
        self.window = Some(window);

        match self.hooks.on_init(&target) {
            Ok(()) => {
                self.initialized = true;
                self.timer.reset();
                info!("Initialization complete, entering main loop");
            }
            Err(e) => self.fail(event_loop, RunError::App(e)),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = self.window.as_mut() {
                    window.resize(size.width, size.height);
                }
                if self.initialized {
                    self.hooks.on_resize(size.width, size.height);
                }
            }
            WindowEvent::Focused(false) => {
                for key in self.input.release_all() {
                    self.hooks.on_key_up(key);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if let Some(transition) = KeyTransition::from_event(&event) {
                    self.key(transition);
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                self.input
                    .on_button(button.into(), state == ElementState::Pressed);
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.input.on_cursor_moved(position.x as f32, position.y as f32);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(p) => (p.y / 20.0) as f32,
                };
                self.input.on_scroll(lines);
            }
            WindowEvent::RedrawRequested => self.tick(event_loop),
            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _id: DeviceId, event: DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            let (dx, dy) = (dx as f32, dy as f32);
            self.input.on_motion(dx, dy);
            if self.initialized {
                self.hooks.on_mouse_move(dx, dy);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_render_at: Option<usize>,
        exit_after: Option<usize>,
        renders: usize,
    }

    impl AppHooks for Recorder {
        type Error = String;

        fn on_init(&mut self, target: &SurfaceTarget) -> Result<(), String> {
            assert!(target.handles.is_none());
            self.calls.push(format!("init {}x{}", target.width, target.height));
            Ok(())
        }

        fn on_update(&mut self, input: &InputState, delta: Duration) {
            assert_eq!(input.motion(), (0.0, 0.0));
            assert!(delta > Duration::ZERO);
            self.calls.push("update".into());
        }

        fn on_render(&mut self) -> Result<(), String> {
            self.renders += 1;
            self.calls.push("render".into());
            if self.fail_render_at == Some(self.renders) {
                return Err("device lost".into());
            }
            Ok(())
        }

        fn on_destroy(&mut self) {
            self.calls.push("destroy".into());
        }

        fn should_exit(&self) -> bool {
            self.exit_after.is_some_and(|n| self.renders >= n)
        }
    }

    #[test]
    fn test_headless_hook_order() {
        let mut hooks = Recorder::default();
        run_headless(&mut hooks, 64, 32, 2).unwrap();
        assert_eq!(
            hooks.calls,
            vec!["init 64x32", "update", "render", "update", "render", "destroy"]
        );
    }

    #[test]
    fn test_headless_render_failure_still_destroys() {
        let mut hooks = Recorder {
            fail_render_at: Some(2),
            ..Default::default()
        };
        let err = run_headless(&mut hooks, 8, 8, 10).unwrap_err();
        assert!(matches!(err, RunError::App(ref msg) if msg == "device lost"));
        assert_eq!(hooks.renders, 2);
        assert_eq!(hooks.calls.last().map(String::as_str), Some("destroy"));
    }

    #[test]
    fn test_headless_exit_request() {
        let mut hooks = Recorder {
            exit_after: Some(3),
            ..Default::default()
        };
        run_headless(&mut hooks, 8, 8, 100).unwrap();
        assert_eq!(hooks.renders, 3);
    }

    #[test]
    fn test_zero_frames_only_inits_and_destroys() {
        let mut hooks = Recorder::default();
        run_headless(&mut hooks, 8, 8, 0).unwrap();
        assert_eq!(hooks.calls, vec!["init 8x8", "destroy"]);
    }
}
