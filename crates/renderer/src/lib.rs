//! Frame submission engine.
//!
//! This crate turns handle-based resource creation and per-draw state into
//! recorded GPU frames:
//! - Generation-checked handle registries per resource kind
//! - Transient ring allocators released at frame fences
//! - Deferred upload copies flushed at the start of each frame
//! - Draw sorting by view and program, with lazily built pipelines
//! - Descriptor-set deduplication
//! - Double-buffered frame pacing with swapchain rebuilds
//!
//! [`RenderContext`] owns all of it and drives a [`Backend`]: the Vulkan
//! backend for real output or the headless backend for tests and tooling.

pub mod backend;
mod batch;
pub mod context;
pub mod descriptor_cache;
pub mod draw;
pub mod error;
pub mod frame;
pub mod handle;
pub mod pipeline_cache;
pub mod resources;
pub mod ring;
pub mod stats;
pub mod transform;
pub mod upload;

pub use backend::{Backend, HeadlessBackend, ImageDesc, VulkanBackend};
pub use context::{FrameStatus, RenderContext};
pub use draw::{TransientIndexBuffer, TransientVertexBuffer, ViewId};
pub use error::{RenderError, RenderResult};
pub use handle::{
    DescriptorHandle, FramebufferHandle, Handle, ImageHandle, IndexBufferHandle, ProgramHandle,
    ShaderHandle, StorageBufferHandle, TextureHandle, UniformBufferHandle, VertexBufferHandle,
};
pub use resources::{DescriptorSource, FramebufferDesc, ProgramDesc, TextureDesc};
pub use ring::{RingError, TransientPool, TransientUsage};
pub use stats::FrameStats;
pub use transform::DrawTransforms;

/// Maximum number of frames that can be in flight simultaneously.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
