//! Ember - Main Entry Point
//!
//! Loads an engine configuration, opens a window (or runs offscreen) and
//! renders the configured scene through the declared pass list.

mod viewer;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use ember_core::{BackendKind, EngineConfig};

use crate::viewer::Viewer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Vulkan,
    Soft,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Vulkan => BackendKind::Vulkan,
            BackendArg::Soft => BackendKind::Soft,
        }
    }
}

/// Explicit-API rendering engine.
#[derive(Debug, Parser)]
#[command(name = "ember", version, about)]
struct Cli {
    /// Engine configuration file.
    #[arg(short, long, default_value = "assets/ember.json")]
    config: PathBuf,

    /// Device backend, overriding the configuration.
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Use a software (CPU) adapter.
    #[arg(long)]
    software: bool,

    /// Enable API validation layers.
    #[arg(long)]
    validation: bool,

    /// Render this many frames offscreen and exit.
    #[arg(long, value_name = "N")]
    headless_frames: Option<u64>,
}

impl Cli {
    fn load_config(&self) -> Result<EngineConfig> {
        let mut config = if self.config.exists() {
            EngineConfig::load(&self.config)
                .with_context(|| format!("loading {}", self.config.display()))?
        } else {
            info!("{} not found, using defaults", self.config.display());
            EngineConfig::default()
        };

        if let Some(backend) = self.backend {
            config.backend = backend.into();
        }
        config.use_software_adapter |= self.software;
        config.enable_validation |= self.validation;
        Ok(config)
    }
}

fn main() -> Result<()> {
    ember_core::init_logging();
    let cli = Cli::parse();
    info!("Starting Ember");

    let config = cli.load_config()?;
    let window = config.window.clone();
    let mut viewer = Viewer::new(config);

    match cli.headless_frames {
        Some(frames) => {
            ember_platform::run_headless(&mut viewer, window.width, window.height, frames)
        }
        None => ember_platform::run(&mut viewer, &window),
    }
    .map_err(|e| match e {
        ember_platform::RunError::Platform(e) => e.into(),
        ember_platform::RunError::App(e) => e,
    })?;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "ember",
            "--config",
            "does/not/exist.json",
            "--backend",
            "soft",
            "--software",
            "--headless-frames",
            "3",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.backend, BackendKind::Soft);
        assert!(config.use_software_adapter);
        assert_eq!(cli.headless_frames, Some(3));
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["ember"]);
        assert_eq!(cli.config, PathBuf::from("assets/ember.json"));
        assert!(cli.backend.is_none());
        assert!(cli.headless_frames.is_none());
    }
}
