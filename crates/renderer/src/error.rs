//! Errors surfaced by the submission engine.

use thiserror::Error;

use framekit_rhi::RhiError;

use crate::ring::RingError;

/// Error type of every fallible engine call.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Handle never created, or already destroyed
    #[error("invalid {kind} handle {handle}")]
    InvalidHandle { kind: &'static str, handle: String },

    /// A fixed capacity from `RendererConfig` was reached
    #[error("{resource} capacity exceeded (limit {limit})")]
    CapacityExceeded { resource: &'static str, limit: usize },

    /// Transient ring allocation failed
    #[error("transient allocation failed: {0}")]
    Ring(#[from] RingError),

    /// Direct write to a device-local resource
    #[error("resource is not host visible")]
    NotHostVisible,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend failed; see [`RhiError`]
    #[error(transparent)]
    Backend(#[from] RhiError),

    /// Window, surface or configuration error
    #[error(transparent)]
    Platform(#[from] framekit_core::Error),
}

impl RenderError {
    pub(crate) fn capacity(resource: &'static str, limit: usize) -> Self {
        RenderError::CapacityExceeded { resource, limit }
    }

    /// Errors that drop a single draw instead of aborting the frame.
    pub(crate) fn skips_draw(&self) -> bool {
        match self {
            RenderError::InvalidHandle { .. }
            | RenderError::CapacityExceeded { .. }
            | RenderError::InvalidArgument(_) => true,
            RenderError::Backend(e) => matches!(
                e,
                RhiError::PipelineError(_)
                    | RhiError::DescriptorError(_)
                    | RhiError::ShaderError(_)
                    | RhiError::InvalidArgument(_)
            ),
            _ => false,
        }
    }
}

/// Result alias used throughout the engine.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
