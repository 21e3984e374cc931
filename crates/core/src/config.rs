//! Engine configuration loaded from JSON.
//!
//! Every field has a default, so a config file only needs the values it
//! wants to change:
//!
//! ```json
//! {
//!     "window": { "width": 1920, "height": 1080 },
//!     "backend": "vulkan",
//!     "scene": "assets/sponza.json"
//! }
//! ```
//!
//! Relative paths inside the file are resolved against the file's directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Reads and parses one JSON declaration file.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read and [`Error::Json`]
/// (carrying the path) if it does not match `T`.
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| Error::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Which GPU backend drives the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hardware (or software rasterizer) Vulkan device.
    #[default]
    Vulkan,
    /// Simulated device with no GPU behind it.
    Soft,
}

/// Window creation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "Ember".to_string(),
        }
    }
}

/// Capacity of each descriptor category.
///
/// The shader-visible heap is partitioned in this order: constant buffers,
/// textures, mip views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorBudget {
    pub constant_buffers: u32,
    pub textures: u32,
    pub mips: u32,
    pub render_targets: u32,
    pub depth_stencils: u32,
    pub samplers: u32,
}

impl Default for DescriptorBudget {
    fn default() -> Self {
        Self {
            constant_buffers: 256,
            textures: 1024,
            mips: 256,
            render_targets: 16,
            depth_stencils: 4,
            samplers: 16,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub backend: BackendKind,
    /// Pick a software (CPU) adapter instead of a hardware GPU.
    pub use_software_adapter: bool,
    pub enable_validation: bool,
    /// Ordered render pass declarations.
    pub passes: PathBuf,
    /// Pipeline state declarations.
    pub pipelines: PathBuf,
    /// Scene description.
    pub scene: PathBuf,
    /// Directory holding compiled SPIR-V shaders.
    pub shader_dir: PathBuf,
    pub descriptors: DescriptorBudget,
    pub clear_color: [f32; 4],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            backend: BackendKind::default(),
            use_software_adapter: false,
            enable_validation: cfg!(debug_assertions),
            passes: PathBuf::from("assets/passes.json"),
            pipelines: PathBuf::from("assets/pipelines.json"),
            scene: PathBuf::from("assets/scene.json"),
            shader_dir: PathBuf::from("assets/shaders"),
            descriptors: DescriptorBudget::default(),
            clear_color: [0.0, 0.2, 0.4, 1.0],
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file and resolves its relative paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`EngineConfig::validate`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ember_core::EngineConfig;
    ///
    /// let config = EngineConfig::load("ember.json").expect("bad config");
    /// println!("{}x{}", config.window.width, config.window.height);
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&text).map_err(|e| match e {
            Error::Json { source, .. } => Error::Json {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }

        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Parses and validates a configuration from a JSON string.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|source| Error::Json {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that deserialize fine but cannot run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero-sized windows or empty descriptor
    /// categories.
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }

        let d = &self.descriptors;
        let categories = [
            ("constant_buffers", d.constant_buffers),
            ("textures", d.textures),
            ("mips", d.mips),
            ("render_targets", d.render_targets),
            ("depth_stencils", d.depth_stencils),
            ("samplers", d.samplers),
        ];
        if let Some((name, _)) = categories.iter().find(|(_, n)| *n == 0) {
            return Err(Error::Config(format!(
                "descriptor category '{name}' needs at least one slot"
            )));
        }

        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.passes,
            &mut self.pipelines,
            &mut self.scene,
            &mut self.shader_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        debug!("Resolved config paths against {}", base.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.backend, BackendKind::Vulkan);
        assert_eq!(config.descriptors, DescriptorBudget::default());
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_json_str(
            r#"{ "backend": "soft", "window": { "width": 640 }, "use_software_adapter": true }"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Soft);
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 720);
        assert!(config.use_software_adapter);
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "window": { "height": 0 } }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_descriptor_category_rejected() {
        let err =
            EngineConfig::from_json_str(r#"{ "descriptors": { "mips": 0 } }"#).unwrap_err();
        assert!(err.to_string().contains("mips"));
    }

    #[test]
    fn test_malformed_json_is_json_error() {
        let err = EngineConfig::from_json_str("{ backend: ").unwrap_err();
        assert!(matches!(err, Error::Json { .. }));
    }

    #[test]
    fn test_read_json_reports_path() {
        let path = std::env::temp_dir().join(format!("ember-config-{}.json", std::process::id()));
        fs::write(&path, "[1, 2,").unwrap();
        let err = read_json::<Vec<u32>>(&path).unwrap_err();
        assert!(matches!(&err, Error::Json { path: p, .. } if p.ends_with(".json")));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_relative_paths_resolved() {
        let mut config = EngineConfig::default();
        config.resolve_paths(Path::new("/opt/game"));
        assert_eq!(config.scene, PathBuf::from("/opt/game/assets/scene.json"));
    }
}
