//! Core utilities shared by every framekit crate.
//!
//! - Error types and result aliases
//! - Logging initialization
//! - Runtime configuration
//! - Frame timing

mod config;
mod error;
mod logging;
mod timer;

pub use config::RendererConfig;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::FrameTimer;
