//! Window management using winit.

use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window as WinitWindow, WindowAttributes};

use ember_core::{Error, Result, WindowConfig};

/// Raw handles a GPU device presents through.
///
/// The handles are only valid while the [`Window`] they came from is
/// alive; devices created from them must be dropped first.
#[derive(Debug, Clone, Copy)]
pub struct NativeHandles {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// What a device should present to: a window, or nothing for offscreen
/// rendering.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceTarget {
    pub handles: Option<NativeHandles>,
    pub width: u32,
    pub height: u32,
}

impl SurfaceTarget {
    pub fn headless(width: u32, height: u32) -> Self {
        Self {
            handles: None,
            width,
            height,
        }
    }
}

/// A resizable winit window.
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
}

impl Window {
    /// Creates a window from the configured size and title.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Window`] if the platform refuses the window.
    pub fn new(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let attrs = WindowAttributes::default()
            .with_title(config.title.as_str())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(true);

        let window = event_loop
            .create_window(attrs)
            .map_err(|e| Error::Window(e.to_string()))?;

        // The platform may not honor the requested size exactly.
        let size = window.inner_size();
        tracing::info!("Window created: {}x{}", size.width, size.height);

        Ok(Self {
            window: Arc::new(window),
            width: size.width,
            height: size.height,
        })
    }

    pub fn inner(&self) -> &WinitWindow {
        &self.window
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Records a new size (call this when handling resize events).
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        tracing::debug!("Window resized: {}x{}", width, height);
    }

    /// True while the window has no drawable area.
    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    /// Raw display and window handles for surface creation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Window`] if the platform does not expose them.
    pub fn native_handles(&self) -> Result<NativeHandles> {
        let display = self
            .window
            .display_handle()
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))?;
        let window = self
            .window
            .window_handle()
            .map_err(|e| Error::Window(format!("Failed to get window handle: {}", e)))?;

        Ok(NativeHandles {
            display: display.as_raw(),
            window: window.as_raw(),
        })
    }

    /// The window as a presentation target at its current size.
    pub fn surface_target(&self) -> Result<SurfaceTarget> {
        Ok(SurfaceTarget {
            handles: Some(self.native_handles()?),
            width: self.width,
            height: self.height,
        })
    }
}
