//! Error types for the renderer.

use ember_resources::ResourceError;
use ember_rhi::{ErrorClass, RhiError};
use ember_scene::SceneError;
use thiserror::Error;

/// Error type for renderer operations.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Rhi(#[from] RhiError),

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A pass or pipeline declaration file could not be read.
    #[error(transparent)]
    Config(#[from] ember_core::Error),

    #[error("Unknown render pass '{0}'")]
    UnknownPass(String),

    #[error("Pass '{pass}' references unknown pipeline '{pipeline}'")]
    UnknownPipeline { pass: String, pipeline: String },

    #[error("Pipeline '{0}' declared twice")]
    DuplicatePipeline(String),

    #[error("Pass '{pass}' needs a {expected} pipeline")]
    PipelineKind { pass: String, expected: &'static str },

    #[error("Declaration file '{0}' is empty")]
    EmptyDeclaration(String),
}

impl RenderError {
    /// Returns true for errors raised while reading declarations, before
    /// any frame is rendered.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnknownPass(_)
                | Self::UnknownPipeline { .. }
                | Self::DuplicatePipeline(_)
                | Self::PipelineKind { .. }
                | Self::EmptyDeclaration(_)
                | Self::Scene(SceneError::Description(_) | SceneError::Empty(_))
        )
    }

    /// Returns true if the GPU is gone or stuck and the loop must end.
    pub fn is_device_failure(&self) -> bool {
        match self {
            Self::Rhi(e) | Self::Scene(SceneError::Rhi(e)) => e.is_device_failure(),
            _ => false,
        }
    }

    /// Class of the underlying RHI error, if there is one.
    pub fn rhi_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Rhi(e) | Self::Scene(SceneError::Rhi(e)) => Some(e.class()),
            _ => None,
        }
    }
}

/// Result type alias for renderer operations.
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_classified() {
        assert!(RenderError::UnknownPass("bloom".into()).is_config());
        assert!(!RenderError::Rhi(RhiError::InvalidState("x".into())).is_config());
    }

    #[test]
    fn test_device_failure_passes_through_scene() {
        let err = RenderError::Scene(SceneError::Rhi(RhiError::DeviceLost("removed".into())));
        assert!(err.is_device_failure());
        assert_eq!(err.rhi_class(), Some(ErrorClass::Device));
    }
}
