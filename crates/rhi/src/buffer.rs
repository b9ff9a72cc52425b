//! GPU buffer management.
//!
//! - [`BufferUsage`] says how a buffer is consumed (vertex, index, uniform, ...)
//! - [`Buffer`] wraps a `VkBuffer` with gpu-allocator managed memory
//!
//! Whether a buffer lives in host-visible or device-local memory is chosen
//! at creation time. Host-visible buffers are persistently mapped and can be
//! written with [`Buffer::write_data`]; device-local buffers must be filled
//! through a staging copy.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framekit_rhi::buffer::{Buffer, BufferUsage, transfer_barrier};
//! use framekit_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>, vertices: &[u8]) -> framekit_rhi::RhiResult<()> {
//! let size = vertices.len() as u64;
//! let staging = Buffer::new(device.clone(), BufferUsage::Staging, size, true)?;
//! staging.write_data(0, vertices)?;
//!
//! let vertex = Buffer::new(device, BufferUsage::Vertex, size, false)?;
//! // record copy_buffer(staging -> vertex), then this barrier
//! let barrier = transfer_barrier(vertex.handle(), 0, size, BufferUsage::Vertex);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Buffer usage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex attribute data
    Vertex,
    /// Index data
    Index,
    /// Shader uniform data
    Uniform,
    /// General-purpose shader storage
    Storage,
    /// Source of transfer operations
    Staging,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Memory location for a buffer of this usage.
    pub fn memory_location(self, host_visible: bool) -> MemoryLocation {
        match (self, host_visible) {
            // Staging memory is always written by the CPU
            (BufferUsage::Staging, _) => MemoryLocation::CpuToGpu,
            (_, true) => MemoryLocation::CpuToGpu,
            (_, false) => MemoryLocation::GpuOnly,
        }
    }

    /// Stages and accesses that consume a buffer of this usage.
    pub fn read_scope(self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        match self {
            BufferUsage::Vertex => (
                vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
            ),
            BufferUsage::Index => (
                vk::PipelineStageFlags2::INDEX_INPUT,
                vk::AccessFlags2::INDEX_READ,
            ),
            BufferUsage::Uniform => (
                vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::UNIFORM_READ,
            ),
            BufferUsage::Storage => (
                vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_READ,
            ),
            BufferUsage::Staging => (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
        }
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Staging => "staging",
        }
    }
}

/// Width of the indices in an index buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn to_vk(self) -> vk::IndexType {
        match self {
            IndexType::U16 => vk::IndexType::UINT16,
            IndexType::U32 => vk::IndexType::UINT32,
        }
    }

    /// Size of one index in bytes.
    pub fn size(self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// Makes a transfer write to `[offset, offset + size)` visible to the consumers of `usage`.
pub fn transfer_barrier(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    usage: BufferUsage,
) -> vk::BufferMemoryBarrier2<'static> {
    let (dst_stage, dst_access) = usage.read_scope();
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(offset)
        .size(size)
}

/// Orders earlier reads of `[offset, offset + size)` before a transfer overwrites it.
pub fn pre_transfer_barrier(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    usage: BufferUsage,
) -> vk::BufferMemoryBarrier2<'static> {
    let (src_stage, src_access) = usage.read_scope();
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
        .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(offset)
        .size(size)
}

/// GPU buffer wrapper with managed memory.
///
/// The allocation is returned to gpu-allocator on drop. Dropping a buffer
/// the GPU may still read is the caller's problem; the renderer defers
/// destruction until the frames using it have retired.
pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: BufferUsage,
    host_visible: bool,
}

impl Buffer {
    /// Creates a new buffer of `size` bytes.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `usage` - How the buffer is consumed
    /// * `size` - Size in bytes
    /// * `host_visible` - Allocate persistently mapped, CPU-writable memory;
    ///   staging buffers are host-visible regardless
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or buffer/memory allocation fails.
    pub fn new(
        device: Arc<Device>,
        usage: BufferUsage,
        size: vk::DeviceSize,
        host_visible: bool,
    ) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidArgument(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let location = usage.memory_location(host_visible);
        let allocation = {
            let mut allocator = device.lock_allocator()?;
            allocator.allocate(&AllocationCreateDesc {
                name: usage.name(),
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        debug!(
            "Created {} buffer: {} bytes ({:?})",
            usage.name(),
            size,
            location
        );

        Ok(Self {
            device,
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            host_visible: location != MemoryLocation::GpuOnly,
        })
    }

    /// Writes data to a host-visible buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the memory is not mapped or the write would
    /// exceed the buffer size.
    pub fn write_data(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = offset + data.len() as vk::DeviceSize;
        if end > self.size {
            return Err(RhiError::InvalidArgument(format!(
                "Write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }

        let mapped_ptr = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| RhiError::InvalidArgument("Buffer memory is not mapped".to_string()))?;

        unsafe {
            let dst = mapped_ptr.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
        }

        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// The memory is mapped and [`write_data`](Self::write_data) works.
    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            match self.device.lock_allocator() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        tracing::error!("Failed to free buffer allocation: {:?}", e);
                    }
                }
                Err(e) => tracing::error!("Leaking buffer allocation: {}", e),
            }
        }

        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }

        debug!("Destroyed {} buffer", self.usage.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_to_vk_usage() {
        assert!(
            BufferUsage::Vertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::VERTEX_BUFFER)
        );
        assert!(
            BufferUsage::Index
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::INDEX_BUFFER)
        );
        assert!(
            BufferUsage::Storage
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_DST)
        );
        assert_eq!(
            BufferUsage::Staging.to_vk_usage(),
            vk::BufferUsageFlags::TRANSFER_SRC
        );
    }

    #[test]
    fn test_memory_location() {
        assert_eq!(
            BufferUsage::Vertex.memory_location(false),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            BufferUsage::Vertex.memory_location(true),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            BufferUsage::Staging.memory_location(false),
            MemoryLocation::CpuToGpu
        );
    }

    #[test]
    fn test_transfer_barrier_targets_consumer() {
        let barrier = transfer_barrier(vk::Buffer::null(), 16, 64, BufferUsage::Index);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::INDEX_INPUT);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::INDEX_READ);
        assert_eq!(barrier.offset, 16);
        assert_eq!(barrier.size, 64);
    }

    #[test]
    fn test_index_type() {
        assert_eq!(IndexType::U16.size(), 2);
        assert_eq!(IndexType::U32.size(), 4);
        assert_eq!(IndexType::U32.to_vk(), vk::IndexType::UINT32);
    }
}
