//! Descriptor set layouts, pools and writes.
//!
//! - [`DescriptorType`] and [`DescriptorBindingLayout`] describe one binding
//!   without Vulkan types, so layouts can be declared by callers that never
//!   touch `ash`
//! - [`DescriptorSetLayout`] wraps `VkDescriptorSetLayout`
//! - [`DescriptorPool`] is a fixed-capacity pool whose sets can be freed individually
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framekit_rhi::device::Device;
//! use framekit_rhi::descriptor::{
//!     DescriptorBindingLayout, DescriptorPool, DescriptorSetLayout, DescriptorType,
//!     ShaderVisibility, buffer_info, update_descriptor_sets,
//! };
//! use ash::vk;
//!
//! # fn example(device: Arc<Device>, uniforms: vk::Buffer) -> framekit_rhi::RhiResult<()> {
//! let layout = DescriptorSetLayout::new(
//!     device.clone(),
//!     &[DescriptorBindingLayout::new(0, DescriptorType::UniformBuffer, ShaderVisibility::All)],
//! )?;
//! let pool = DescriptorPool::new(device.clone(), 64, 8)?;
//! let set = pool.allocate(layout.handle())?;
//!
//! let info = buffer_info(uniforms, 0, vk::WHOLE_SIZE);
//! let write = vk::WriteDescriptorSet::default()
//!     .dst_set(set)
//!     .dst_binding(0)
//!     .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
//!     .buffer_info(std::slice::from_ref(&info));
//! update_descriptor_sets(&device, &[write]);
//!
//! pool.free(set)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Kind of resource a binding refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
}

impl DescriptorType {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }

    /// Whether writes use `VkDescriptorImageInfo` instead of a buffer info.
    pub fn is_image(self) -> bool {
        matches!(self, DescriptorType::CombinedImageSampler)
    }
}

/// Shader stages that can see a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderVisibility {
    Vertex,
    Fragment,
    All,
}

impl ShaderVisibility {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderVisibility::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderVisibility::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderVisibility::All => vk::ShaderStageFlags::ALL_GRAPHICS,
        }
    }
}

/// One binding of a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBindingLayout {
    /// Binding number in the shader (`layout(binding = N)`)
    pub binding: u32,
    pub ty: DescriptorType,
    pub visibility: ShaderVisibility,
}

impl DescriptorBindingLayout {
    pub fn new(binding: u32, ty: DescriptorType, visibility: ShaderVisibility) -> Self {
        Self {
            binding,
            ty,
            visibility,
        }
    }

    /// A single-descriptor Vulkan binding; arrays are not supported.
    pub fn to_vk(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.ty.to_vk())
            .descriptor_count(1)
            .stage_flags(self.visibility.to_vk())
    }
}

/// Vulkan descriptor set layout, destroyed on drop.
///
/// Pipeline layouts built from it must be destroyed first.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Creates a layout with one descriptor per binding.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkCreateDescriptorSetLayout` fails, e.g. for
    /// duplicate binding numbers under validation.
    pub fn new(device: Arc<Device>, bindings: &[DescriptorBindingLayout]) -> RhiResult<Self> {
        let vk_bindings: Vec<_> = bindings.iter().map(DescriptorBindingLayout::to_vk).collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );

        Ok(Self { device, layout })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Fixed-capacity descriptor pool.
///
/// Created with `FREE_DESCRIPTOR_SET`, so sets are returned one at a time
/// when the engine evicts them from its cache. Allocation fails with
/// [`RhiError::DescriptorError`] once the pool is exhausted, which callers
/// treat as a per-draw failure rather than a device error.
///
/// # Thread Safety
///
/// Allocation and free must be externally synchronized.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Creates a pool of `max_sets` sets with room for `bindings_per_set`
    /// descriptors of every supported type in each set.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkCreateDescriptorPool` fails.
    pub fn new(device: Arc<Device>, max_sets: u32, bindings_per_set: u32) -> RhiResult<Self> {
        let per_type = max_sets.saturating_mul(bindings_per_set);
        let pool_sizes = [
            DescriptorType::UniformBuffer,
            DescriptorType::StorageBuffer,
            DescriptorType::CombinedImageSampler,
        ]
        .map(|ty| {
            vk::DescriptorPoolSize::default()
                .ty(ty.to_vk())
                .descriptor_count(per_type)
        });

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!(
            "Created descriptor pool: max_sets={}, {} descriptor(s) per type",
            max_sets, per_type
        );

        Ok(Self {
            device,
            pool,
            max_sets,
        })
    }

    /// Allocates one set with `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DescriptorError`] when the pool is out of sets or
    /// descriptors, and [`RhiError::VulkanError`] for anything else.
    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> RhiResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    RhiError::DescriptorError(format!(
                        "descriptor pool exhausted ({} sets)",
                        self.max_sets
                    ))
                }
                other => RhiError::VulkanError(other),
            })?;

        sets.into_iter()
            .next()
            .ok_or_else(|| RhiError::DescriptorError("driver returned no set".to_string()))
    }

    /// Returns `set` to the pool. No pending submission may use it.
    ///
    /// # Errors
    ///
    /// Returns an error if `vkFreeDescriptorSets` fails.
    pub fn free(&self, set: vk::DescriptorSet) -> RhiResult<()> {
        unsafe {
            self.device.handle().free_descriptor_sets(self.pool, &[set])?;
        }
        Ok(())
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
        debug!("Destroyed descriptor pool");
    }
}

/// Applies `writes` immediately; an empty slice is a no-op.
///
/// The sets written must not be in use by a pending submission.
pub fn update_descriptor_sets(device: &Device, writes: &[vk::WriteDescriptorSet]) {
    if writes.is_empty() {
        return;
    }

    unsafe {
        device.handle().update_descriptor_sets(writes, &[]);
    }
}

/// Buffer range for a uniform or storage buffer write.
#[inline]
pub fn buffer_info(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range)
}

/// Sampler, view and layout for a combined image sampler write.
#[inline]
pub fn image_info(
    sampler: vk::Sampler,
    image_view: vk::ImageView,
    image_layout: vk::ImageLayout,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(image_view)
        .image_layout(image_layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_layout_to_vk() {
        let binding = DescriptorBindingLayout::new(
            2,
            DescriptorType::CombinedImageSampler,
            ShaderVisibility::Fragment,
        )
        .to_vk();
        assert_eq!(binding.binding, 2);
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn test_descriptor_type_is_image() {
        assert!(DescriptorType::CombinedImageSampler.is_image());
        assert!(!DescriptorType::UniformBuffer.is_image());
        assert!(!DescriptorType::StorageBuffer.is_image());
    }

    #[test]
    fn test_visibility_all_covers_both_stages() {
        let flags = ShaderVisibility::All.to_vk();
        assert!(flags.contains(vk::ShaderStageFlags::VERTEX));
        assert!(flags.contains(vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn test_buffer_info_helper() {
        let info = buffer_info(vk::Buffer::null(), 64, 128);
        assert_eq!(info.offset, 64);
        assert_eq!(info.range, 128);
    }
}
