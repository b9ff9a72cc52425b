//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! Thin, owning wrappers over `ash`:
//! - Instance, physical device selection and logical device
//! - Swapchain and frame synchronization
//! - Command recording with dynamic rendering and synchronization2 barriers
//! - Buffers, images and samplers backed by gpu-allocator
//! - Shader modules, descriptor layouts/pools and graphics pipelines

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod rendering;
pub mod sampler;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use error::{RhiError, RhiResult};

pub use ash::vk;
