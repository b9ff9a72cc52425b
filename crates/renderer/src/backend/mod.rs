//! The seam between the submission engine and a native graphics API.
//!
//! The engine owns every native object it creates through [`Backend`] and
//! hands it back by value to the matching `destroy_*` call once no frame in
//! flight can still reference it. Command recording calls receive the frame
//! being recorded; a backend may assume they only arrive between
//! [`Backend::begin_commands`] and [`Backend::end_commands`].

use std::fmt;
use std::hash::Hash;

use framekit_rhi::RhiResult;
use framekit_rhi::buffer::{BufferUsage, IndexType};
use framekit_rhi::descriptor::DescriptorBindingLayout;
use framekit_rhi::image::{Format, ImageLayout, ImageUsage};
use framekit_rhi::pipeline::PipelineState;
use framekit_rhi::sampler::SamplerDesc;
use framekit_rhi::shader::ShaderStage;
use framekit_rhi::vertex::VertexLayout;

pub mod headless;
pub mod vulkan;

pub use headless::HeadlessBackend;
pub use vulkan::VulkanBackend;

/// Size, usage and memory placement of a native buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    /// Persistently mapped and writable with [`Backend::write_buffer`]
    pub host_visible: bool,
}

/// Extent, format and usage of a native 2D image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub usage: ImageUsage,
}

/// Everything a backend needs to build one graphics pipeline.
pub struct PipelineDesc<'a, B: Backend + ?Sized> {
    pub vertex_shader: &'a B::Shader,
    pub fragment_shader: &'a B::Shader,
    pub layout: &'a B::ProgramLayout,
    pub vertex_layout: Option<&'a VertexLayout>,
    pub state: PipelineState,
    pub color_formats: &'a [Format],
    pub depth_format: Option<Format>,
}

/// Resource written into one binding of a descriptor set.
pub enum DescriptorResource<'a, B: Backend + ?Sized> {
    UniformBuffer(&'a B::Buffer),
    StorageBuffer(&'a B::Buffer),
    Texture {
        image: &'a B::Image,
        sampler: &'a B::Sampler,
    },
}

/// One binding of a descriptor set and the resource it points at.
pub struct DescriptorWrite<'a, B: Backend + ?Sized> {
    pub binding: u32,
    pub resource: DescriptorResource<'a, B>,
}

/// Destination of a rendering pass.
pub enum RenderTarget<'a, B: Backend + ?Sized> {
    /// The swapchain image acquired for this frame, with the backend's depth buffer
    Backbuffer,
    /// Images of a framebuffer, all sized `extent`
    Offscreen {
        colors: &'a [&'a B::Image],
        depth: Option<&'a B::Image>,
        extent: (u32, u32),
    },
}

/// Byte range copied between two buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Which side of a transfer a buffer barrier guards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferBarrier {
    /// Earlier reads by `usage` consumers finish before the copy writes
    BeforeWrite,
    /// The copy's writes become visible to `usage` consumers
    AfterWrite,
}

/// Result of [`Backend::acquire_image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// Index of the acquired swapchain image
    Image(u32),
    OutOfDate,
}

/// Result of [`Backend::present`]. Anything but `Optimal` makes the
/// engine rebuild the swapchain before the next frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

/// A native graphics API as seen by the engine.
///
/// Every method runs on the thread that owns the render context. Object
/// creation reports driver failures; command recording cannot fail except
/// where noted, errors surface when the frame is closed or submitted.
pub trait Backend {
    type Buffer;
    type Image;
    type Sampler;
    type Shader;
    /// Pipeline layout plus the descriptor-set layouts of every user slot
    type ProgramLayout;
    type Pipeline;
    type DescriptorSet: Copy + Eq + Hash + fmt::Debug;
    /// Per-frame command recording context and synchronization
    type Frame;

    // --- resources -------------------------------------------------------

    fn create_buffer(&mut self, desc: &BufferDesc) -> RhiResult<Self::Buffer>;
    /// Writes into a host-visible buffer.
    fn write_buffer(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;
    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    fn create_image(&mut self, desc: &ImageDesc) -> RhiResult<Self::Image>;
    fn destroy_image(&mut self, image: Self::Image);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RhiResult<Self::Sampler>;
    fn destroy_sampler(&mut self, sampler: Self::Sampler);

    fn create_shader(&mut self, stage: ShaderStage, spirv: &[u8]) -> RhiResult<Self::Shader>;
    fn destroy_shader(&mut self, shader: Self::Shader);

    /// Builds a layout whose set 0 is the built-in transform set, followed
    /// by one set per entry of `slots`.
    fn create_program_layout(
        &mut self,
        slots: &[Vec<DescriptorBindingLayout>],
    ) -> RhiResult<Self::ProgramLayout>;
    fn destroy_program_layout(&mut self, layout: Self::ProgramLayout);

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_, Self>) -> RhiResult<Self::Pipeline>;
    fn destroy_pipeline(&mut self, pipeline: Self::Pipeline);

    /// Allocates a set for user slot `slot` of `layout`.
    fn allocate_descriptor_set(
        &mut self,
        layout: &Self::ProgramLayout,
        slot: usize,
    ) -> RhiResult<Self::DescriptorSet>;
    fn write_descriptor_set(
        &mut self,
        set: Self::DescriptorSet,
        writes: &[DescriptorWrite<'_, Self>],
    ) -> RhiResult<()>;
    /// Allocates the built-in set 0 pointing at a transform storage buffer.
    fn create_transform_set(&mut self, buffer: &Self::Buffer) -> RhiResult<Self::DescriptorSet>;
    fn free_descriptor_set(&mut self, set: Self::DescriptorSet);

    // --- frames ----------------------------------------------------------

    fn create_frame(&mut self) -> RhiResult<Self::Frame>;
    fn destroy_frame(&mut self, frame: Self::Frame);
    /// Blocks until the last submission of `frame` has completed. Returns
    /// immediately for a frame that was never submitted.
    fn wait_for_frame(&mut self, frame: &Self::Frame) -> RhiResult<()>;
    /// Acquires the next backbuffer image for `frame`.
    ///
    /// Once an image was acquired the engine always calls [`Backend::submit`]
    /// and then [`Backend::present`] for it, even when recording failed.
    fn acquire_image(&mut self, frame: &Self::Frame) -> RhiResult<Acquire>;
    /// Prepares the command buffer of `frame` for re-recording. Only called
    /// once an image was acquired; the frame's fence is left untouched.
    fn reset_frame(&mut self, frame: &Self::Frame) -> RhiResult<()>;
    fn begin_commands(&mut self, frame: &Self::Frame) -> RhiResult<()>;
    /// Closes the command buffer. Only a frame whose `end_commands`
    /// succeeded since the last `begin_commands` is executable.
    fn end_commands(&mut self, frame: &Self::Frame) -> RhiResult<()>;
    /// Submits `frame` and arms its fence.
    ///
    /// A frame that is not executable (recording failed or was never
    /// closed) is still submitted: its recorded commands are discarded and
    /// replaced by whatever the backbuffer needs to be presentable, so the
    /// acquired image can be handed back and the fence signals again.
    fn submit(&mut self, frame: &Self::Frame) -> RhiResult<()>;
    /// Presents the image acquired for `frame`.
    fn present(&mut self, frame: &Self::Frame) -> RhiResult<PresentStatus>;

    /// Recreates the swapchain. The engine waits for idle first.
    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()>;
    fn wait_idle(&mut self) -> RhiResult<()>;
    fn backbuffer_format(&self) -> Format;
    fn backbuffer_depth_format(&self) -> Option<Format>;
    fn backbuffer_extent(&self) -> (u32, u32);

    // --- commands --------------------------------------------------------

    /// Opens a rendering pass on `target`, clearing its color attachments
    /// to `clear` when set, and sets a full-extent viewport and scissor.
    ///
    /// # Errors
    ///
    /// Returns an error when the target cannot be rendered to. Nothing was
    /// recorded then, and the pass must not be ended.
    fn cmd_begin_rendering(
        &mut self,
        frame: &Self::Frame,
        target: RenderTarget<'_, Self>,
        clear: Option<[f32; 4]>,
    ) -> RhiResult<()>;
    fn cmd_end_rendering(&mut self, frame: &Self::Frame);
    fn cmd_bind_pipeline(&mut self, frame: &Self::Frame, pipeline: &Self::Pipeline);
    fn cmd_bind_vertex_buffer(&mut self, frame: &Self::Frame, buffer: &Self::Buffer, offset: u64);
    fn cmd_bind_index_buffer(
        &mut self,
        frame: &Self::Frame,
        buffer: &Self::Buffer,
        offset: u64,
        index_type: IndexType,
    );
    fn cmd_bind_descriptor_set(
        &mut self,
        frame: &Self::Frame,
        layout: &Self::ProgramLayout,
        set_index: u32,
        set: Self::DescriptorSet,
    );
    fn cmd_draw(
        &mut self,
        frame: &Self::Frame,
        vertex_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &mut self,
        frame: &Self::Frame,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_copy_buffer(
        &mut self,
        frame: &Self::Frame,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        region: BufferCopyRegion,
    );
    /// Copies tightly packed texels into the whole of `dst`, which is in
    /// the transfer-destination layout.
    fn cmd_copy_buffer_to_image(
        &mut self,
        frame: &Self::Frame,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Image,
    );
    fn cmd_buffer_barrier(
        &mut self,
        frame: &Self::Frame,
        buffer: &Self::Buffer,
        region: (u64, u64),
        usage: BufferUsage,
        barrier: TransferBarrier,
    );
    fn cmd_image_barrier(
        &mut self,
        frame: &Self::Frame,
        image: &Self::Image,
        old: ImageLayout,
        new: ImageLayout,
    );
    /// Moves the acquired backbuffer to the presentation layout.
    fn cmd_prepare_present(&mut self, frame: &Self::Frame);
}
