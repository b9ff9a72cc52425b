//! Command pool and command buffer management.
//!
//! Thin wrappers over `VkCommandPool` and `VkCommandBuffer`. The submission
//! engine records one primary command buffer per frame in flight and resets
//! it every time the frame slot comes around again.
//!
//! # Overview
//!
//! - [`CommandPool`] owns a `VkCommandPool` whose buffers can be reset individually
//! - [`CommandBuffer`] records the commands the submission engine issues
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framekit_rhi::device::Device;
//! use framekit_rhi::command::{CommandBuffer, CommandPool};
//!
//! # fn example(device: Arc<Device>) -> framekit_rhi::RhiResult<()> {
//! let family = device.queue_families().graphics_family.unwrap();
//! let pool = CommandPool::new(device.clone(), family)?;
//! let cmd = CommandBuffer::new(device, &pool)?;
//!
//! cmd.begin()?;
//! // ... barriers, copies, rendering passes ...
//! cmd.end()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Vulkan command pool.
///
/// Every command buffer allocated from the pool can only be submitted to
/// queues of the pool's queue family.
///
/// # Thread Safety
///
/// A pool and the buffers allocated from it must only be used from one
/// thread at a time. The engine records from the thread that owns the
/// render context.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    /// Queue family the pool's buffers are submitted to
    queue_family_index: u32,
}

impl CommandPool {
    /// Creates a pool for `queue_family_index`.
    ///
    /// The pool has `RESET_COMMAND_BUFFER` set, so each frame can reset
    /// its own buffer without touching the others.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `queue_family_index` - Queue family the buffers are submitted to
    ///
    /// # Errors
    ///
    /// Returns an error if `vkCreateCommandPool` fails.
    pub fn new(device: Arc<Device>, queue_family_index: u32) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };

        debug!(
            "Command pool created for queue family {}",
            queue_family_index
        );

        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocates one primary command buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkAllocateCommandBuffers` fails, typically when
    /// the host or device is out of memory.
    pub fn allocate_command_buffer(&self) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        buffers.into_iter().next().ok_or_else(|| {
            RhiError::InvalidArgument("driver returned no command buffer".to_string())
        })
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Frees every buffer allocated from the pool as well.
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!(
            "Command pool destroyed for queue family {}",
            self.queue_family_index
        );
    }
}

/// Primary command buffer allocated from a [`CommandPool`].
///
/// The buffer is freed together with its pool, so the pool must outlive it.
///
/// # Lifecycle
///
/// ```text
/// reset() -> begin() -> record commands -> end() -> submit
/// ```
///
/// Recording methods assume the buffer is between [`begin`](Self::begin)
/// and [`end`](Self::end); Vulkan reports misuse through the validation
/// layers, not through return values.
pub struct CommandBuffer {
    device: Arc<Device>,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    /// Allocates a primary command buffer from `pool`.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation fails.
    pub fn new(device: Arc<Device>, pool: &CommandPool) -> RhiResult<Self> {
        let buffer = pool.allocate_command_buffer()?;
        Ok(Self { device, buffer })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Starts recording. The buffer is submitted once and then reset.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkBeginCommandBuffer` fails.
    pub fn begin(&self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    /// Finishes recording; the buffer becomes executable.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkEndCommandBuffer` fails. The recorded commands
    /// cannot be submitted then.
    pub fn end(&self) -> RhiResult<()> {
        unsafe {
            self.device.handle().end_command_buffer(self.buffer)?;
        }
        Ok(())
    }

    /// Returns the buffer to the initial state, discarding what was recorded.
    ///
    /// The buffer must not be pending execution.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkResetCommandBuffer` fails.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    // =========================================================================
    // Dynamic Rendering
    // =========================================================================

    /// Opens a dynamic rendering pass.
    ///
    /// Attachments must already be in their attachment layouts; see
    /// [`crate::rendering::PassAttachments`] for building `rendering_info`.
    pub fn begin_rendering(&self, rendering_info: &vk::RenderingInfo) {
        unsafe {
            self.device
                .handle()
                .cmd_begin_rendering(self.buffer, rendering_info);
        }
    }

    /// Closes the pass opened by [`begin_rendering`](Self::begin_rendering).
    pub fn end_rendering(&self) {
        unsafe {
            self.device.handle().cmd_end_rendering(self.buffer);
        }
    }

    // =========================================================================
    // Binding
    // =========================================================================

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(self.buffer, bind_point, pipeline);
        }
    }

    /// Binds `buffer` at vertex input binding 0, starting `offset` bytes in.
    pub fn bind_vertex_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_vertex_buffers(self.buffer, 0, &[buffer], &[offset]);
        }
    }

    pub fn bind_index_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_index_buffer(self.buffer, buffer, offset, index_type);
        }
    }

    /// Binds one descriptor set at `set_index` of a graphics pipeline layout.
    ///
    /// Sets bound at other indices stay bound as long as the layouts are
    /// compatible up to that index.
    pub fn bind_descriptor_set(
        &self,
        layout: vk::PipelineLayout,
        set_index: u32,
        descriptor_set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                self.buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_index,
                &[descriptor_set],
                &[],
            );
        }
    }

    // =========================================================================
    // Dynamic State
    // =========================================================================

    /// Sets a full-extent viewport with a `[0, 1]` depth range and a
    /// matching scissor.
    pub fn set_viewport_and_scissor(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport::default()
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        let scissor = vk::Rect2D::default().extent(extent);

        unsafe {
            self.device
                .handle()
                .cmd_set_viewport(self.buffer, 0, &[viewport]);
            self.device.handle().cmd_set_scissor(self.buffer, 0, &[scissor]);
        }
    }

    // =========================================================================
    // Drawing
    // =========================================================================

    /// Records a non-indexed draw of a single instance.
    ///
    /// `first_instance` doubles as the draw's index into the transform
    /// storage buffer (`gl_InstanceIndex` in the vertex shader).
    pub fn draw(&self, vertex_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.handle().cmd_draw(
                self.buffer,
                vertex_count,
                1,
                first_vertex,
                first_instance,
            );
        }
    }

    /// Records an indexed draw of a single instance.
    pub fn draw_indexed(
        &self,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.handle().cmd_draw_indexed(
                self.buffer,
                index_count,
                1,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Records a `vkCmdPipelineBarrier2` with the given buffer and image
    /// barriers. Build them with [`crate::buffer::transfer_barrier`] and
    /// [`crate::image::image_barrier`].
    pub fn pipeline_barrier(
        &self,
        buffer_barriers: &[vk::BufferMemoryBarrier2],
        image_barriers: &[vk::ImageMemoryBarrier2],
    ) {
        let dependency = vk::DependencyInfo::default()
            .buffer_memory_barriers(buffer_barriers)
            .image_memory_barriers(image_barriers);

        unsafe {
            self.device
                .handle()
                .cmd_pipeline_barrier2(self.buffer, &dependency);
        }
    }

    // =========================================================================
    // Copy Commands
    // =========================================================================

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(self.buffer, src, dst, regions);
        }
    }

    /// Copies buffer regions into `dst`, which must be in the
    /// transfer-destination layout.
    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.handle().cmd_copy_buffer_to_image(
                self.buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_objects_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer>();
        assert_send::<CommandPool>();
    }
}
