//! Registry entries and creation parameters for every resource kind.

use framekit_rhi::buffer::{BufferUsage, IndexType};
use framekit_rhi::descriptor::DescriptorBindingLayout;
use framekit_rhi::image::{Format, ImageLayout};
use framekit_rhi::pipeline::PipelineState;
use framekit_rhi::sampler::SamplerDesc;
use framekit_rhi::shader::ShaderStage;
use framekit_rhi::vertex::VertexLayout;

use crate::backend::{Backend, ImageDesc};
use crate::error::RenderResult;
use crate::handle::{
    DescriptorHandle, FramebufferHandle, Handle, ImageHandle, IndexBuffer, IndexBufferHandle,
    Kind, Registry, ShaderHandle, StorageBuffer, StorageBufferHandle, TextureHandle,
    UniformBuffer, UniformBufferHandle, VertexBuffer, VertexBufferHandle,
};
use crate::pipeline_cache::LayoutId;

/// A native buffer and what the engine needs to know about it.
pub struct BufferEntry<B: Backend> {
    pub buffer: B::Buffer,
    pub size: u64,
    pub usage: BufferUsage,
    pub host_visible: bool,
}

/// Registry entry of a vertex buffer.
pub struct VertexBufferEntry<B: Backend> {
    pub buffer: BufferEntry<B>,
    /// Interned vertex layout, part of the pipeline cache key
    pub layout: LayoutId,
    pub stride: u32,
}

impl<B: Backend> VertexBufferEntry<B> {
    /// Whole vertices in the buffer.
    pub fn vertex_count(&self) -> u32 {
        if self.stride == 0 {
            0
        } else {
            (self.buffer.size / self.stride as u64) as u32
        }
    }
}

/// Registry entry of an index buffer.
pub struct IndexBufferEntry<B: Backend> {
    pub buffer: BufferEntry<B>,
    pub index_type: IndexType,
}

impl<B: Backend> IndexBufferEntry<B> {
    /// Indices in the buffer.
    pub fn index_count(&self) -> u32 {
        (self.buffer.size / self.index_type.size()) as u32
    }
}

/// Registry entry of an image. `layout` is tracked across frames so the
/// engine knows which transition each use needs.
pub struct ImageEntry<B: Backend> {
    pub image: B::Image,
    pub desc: ImageDesc,
    /// Layout the image is left in by the last recorded command
    pub layout: ImageLayout,
}

/// Registry entry of a texture: an image plus its own sampler.
pub struct TextureEntry<B: Backend> {
    pub image: ImageHandle,
    pub sampler: B::Sampler,
    pub sampler_desc: SamplerDesc,
}

/// Registry entry of a shader module.
pub struct ShaderEntry<B: Backend> {
    pub shader: B::Shader,
    pub stage: ShaderStage,
}

/// Registry entry of a program. Its pipelines live in the pipeline cache.
pub struct ProgramEntry<B: Backend> {
    pub vertex: ShaderHandle,
    pub fragment: ShaderHandle,
    pub layout: B::ProgramLayout,
    pub slots: Vec<Vec<DescriptorBindingLayout>>,
    pub state: PipelineState,
}

/// What a descriptor points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorSource {
    UniformBuffer(UniformBufferHandle),
    StorageBuffer(StorageBufferHandle),
    Texture(TextureHandle),
}

/// Registry entry of a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorEntry {
    /// Binding number inside the descriptor set
    pub binding: u32,
    pub source: DescriptorSource,
}

/// Registry entry of a framebuffer, with the formats its pipelines need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramebufferEntry {
    pub colors: Vec<ImageHandle>,
    pub depth: Option<ImageHandle>,
    pub extent: (u32, u32),
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
}

/// Parameters of [`RenderContext::create_program`](crate::RenderContext::create_program).
#[derive(Clone, Debug)]
pub struct ProgramDesc {
    pub vertex: ShaderHandle,
    pub fragment: ShaderHandle,
    /// Bindings of each user descriptor slot, bound as sets `1..`
    pub slots: Vec<Vec<DescriptorBindingLayout>>,
    pub state: PipelineState,
}

impl ProgramDesc {
    /// A program without descriptor slots and with default pipeline state.
    pub fn new(vertex: ShaderHandle, fragment: ShaderHandle) -> Self {
        Self {
            vertex,
            fragment,
            slots: Vec::new(),
            state: PipelineState::default(),
        }
    }

    /// Declares the next user slot.
    pub fn with_slot(mut self, bindings: Vec<DescriptorBindingLayout>) -> Self {
        self.slots.push(bindings);
        self
    }

    pub fn with_state(mut self, state: PipelineState) -> Self {
        self.state = state;
        self
    }
}

/// Parameters of [`RenderContext::create_texture`](crate::RenderContext::create_texture).
#[derive(Clone, Copy, Debug)]
pub struct TextureDesc<'a> {
    pub image: ImageHandle,
    pub sampler: SamplerDesc,
    /// Tightly packed texels uploaded into the whole image
    pub data: Option<&'a [u8]>,
}

/// Parameters of [`RenderContext::create_framebuffer`](crate::RenderContext::create_framebuffer).
///
/// Color images must be color attachments and `depth` a depth attachment,
/// all of the same extent.
#[derive(Clone, Debug, Default)]
pub struct FramebufferDesc {
    pub colors: Vec<ImageHandle>,
    pub depth: Option<ImageHandle>,
}

/// Destination of a queued buffer copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferRef {
    Vertex(VertexBufferHandle),
    Index(IndexBufferHandle),
    Uniform(UniformBufferHandle),
    Storage(StorageBufferHandle),
}

/// Buffer handle kinds accepted by [`RenderContext::update_buffer`](crate::RenderContext::update_buffer).
pub trait BufferKind: Kind + Sized {
    /// Looks up the buffer behind `handle`.
    fn entry<B: Backend>(resources: &Resources<B>, handle: Handle<Self>) -> RenderResult<&BufferEntry<B>>;

    /// Copy destination naming `handle`.
    fn to_ref(handle: Handle<Self>) -> BufferRef;
}

impl BufferKind for VertexBuffer {
    fn entry<B: Backend>(resources: &Resources<B>, handle: Handle<Self>) -> RenderResult<&BufferEntry<B>> {
        Ok(&resources.vertex_buffers.get(handle)?.buffer)
    }

    fn to_ref(handle: Handle<Self>) -> BufferRef {
        BufferRef::Vertex(handle)
    }
}

impl BufferKind for IndexBuffer {
    fn entry<B: Backend>(resources: &Resources<B>, handle: Handle<Self>) -> RenderResult<&BufferEntry<B>> {
        Ok(&resources.index_buffers.get(handle)?.buffer)
    }

    fn to_ref(handle: Handle<Self>) -> BufferRef {
        BufferRef::Index(handle)
    }
}

impl BufferKind for UniformBuffer {
    fn entry<B: Backend>(resources: &Resources<B>, handle: Handle<Self>) -> RenderResult<&BufferEntry<B>> {
        resources.uniform_buffers.get(handle)
    }

    fn to_ref(handle: Handle<Self>) -> BufferRef {
        BufferRef::Uniform(handle)
    }
}

impl BufferKind for StorageBuffer {
    fn entry<B: Backend>(resources: &Resources<B>, handle: Handle<Self>) -> RenderResult<&BufferEntry<B>> {
        resources.storage_buffers.get(handle)
    }

    fn to_ref(handle: Handle<Self>) -> BufferRef {
        BufferRef::Storage(handle)
    }
}

/// Every registry of a render context.
pub struct Resources<B: Backend> {
    pub vertex_buffers: Registry<VertexBuffer, VertexBufferEntry<B>>,
    pub index_buffers: Registry<IndexBuffer, IndexBufferEntry<B>>,
    pub uniform_buffers: Registry<UniformBuffer, BufferEntry<B>>,
    pub storage_buffers: Registry<StorageBuffer, BufferEntry<B>>,
    pub images: Registry<crate::handle::Image, ImageEntry<B>>,
    pub textures: Registry<crate::handle::Texture, TextureEntry<B>>,
    pub shaders: Registry<crate::handle::Shader, ShaderEntry<B>>,
    pub programs: Registry<crate::handle::Program, ProgramEntry<B>>,
    pub descriptors: Registry<crate::handle::Descriptor, DescriptorEntry>,
    pub framebuffers: Registry<crate::handle::Framebuffer, FramebufferEntry>,
}

impl<B: Backend> Default for Resources<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Resources<B> {
    /// Empty registries.
    pub fn new() -> Self {
        Self {
            vertex_buffers: Registry::new(),
            index_buffers: Registry::new(),
            uniform_buffers: Registry::new(),
            storage_buffers: Registry::new(),
            images: Registry::new(),
            textures: Registry::new(),
            shaders: Registry::new(),
            programs: Registry::new(),
            descriptors: Registry::new(),
            framebuffers: Registry::new(),
        }
    }

    /// Resolves a copy destination, `None` once it was destroyed.
    pub fn buffer(&self, target: BufferRef) -> Option<&BufferEntry<B>> {
        match target {
            BufferRef::Vertex(h) => self.vertex_buffers.find(h).map(|e| &e.buffer),
            BufferRef::Index(h) => self.index_buffers.find(h).map(|e| &e.buffer),
            BufferRef::Uniform(h) => self.uniform_buffers.find(h),
            BufferRef::Storage(h) => self.storage_buffers.find(h),
        }
    }

    /// Descriptors whose source satisfies `predicate`.
    pub fn descriptors_where(
        &self,
        mut predicate: impl FnMut(&DescriptorSource) -> bool,
    ) -> Vec<DescriptorHandle> {
        self.descriptors
            .iter()
            .filter(|(_, entry)| predicate(&entry.source))
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Image sampled through `descriptor`, if it is a live texture descriptor.
    pub fn sampled_image(&self, descriptor: DescriptorHandle) -> Option<ImageHandle> {
        match self.descriptors.find(descriptor)?.source {
            DescriptorSource::Texture(texture) => self.textures.find(texture).map(|t| t.image),
            _ => None,
        }
    }

    /// Framebuffers with `image` among their attachments.
    pub fn framebuffers_using(&self, image: ImageHandle) -> Vec<FramebufferHandle> {
        self.framebuffers
            .iter()
            .filter(|(_, fb)| fb.colors.contains(&image) || fb.depth == Some(image))
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Number of live resources across all kinds.
    pub fn len(&self) -> usize {
        self.vertex_buffers.len()
            + self.index_buffers.len()
            + self.uniform_buffers.len()
            + self.storage_buffers.len()
            + self.images.len()
            + self.textures.len()
            + self.shaders.len()
            + self.programs.len()
            + self.descriptors.len()
            + self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::backend::headless::HeadlessSampler;
    use crate::backend::BufferDesc;
    use framekit_rhi::image::ImageUsage;

    fn sampler(backend: &mut HeadlessBackend) -> HeadlessSampler {
        backend.create_sampler(&SamplerDesc::default()).unwrap()
    }

    #[test]
    fn test_buffer_ref_resolves_until_removed() {
        let mut backend = HeadlessBackend::new(8, 8);
        let mut resources: Resources<HeadlessBackend> = Resources::new();
        let buffer = backend
            .create_buffer(&BufferDesc {
                size: 64,
                usage: BufferUsage::Uniform,
                host_visible: true,
            })
            .unwrap();
        let handle = resources.uniform_buffers.insert(BufferEntry {
            buffer,
            size: 64,
            usage: BufferUsage::Uniform,
            host_visible: true,
        });

        assert_eq!(resources.buffer(BufferRef::Uniform(handle)).map(|e| e.size), Some(64));
        assert_eq!(
            UniformBuffer::entry(&resources, handle).map(|e| e.usage).ok(),
            Some(BufferUsage::Uniform)
        );
        resources.uniform_buffers.remove(handle).ok();
        assert!(resources.buffer(BufferRef::Uniform(handle)).is_none());
        assert!(UniformBuffer::entry(&resources, handle).is_err());
    }

    #[test]
    fn test_sampled_image_follows_texture() {
        let mut backend = HeadlessBackend::new(8, 8);
        let mut resources: Resources<HeadlessBackend> = Resources::new();
        let desc = ImageDesc {
            width: 4,
            height: 4,
            format: Format::Rgba8Unorm,
            usage: ImageUsage::Sampled,
        };
        let image = resources.images.insert(ImageEntry {
            image: backend.create_image(&desc).unwrap(),
            desc,
            layout: ImageLayout::Undefined,
        });
        let texture = resources.textures.insert(TextureEntry {
            image,
            sampler: sampler(&mut backend),
            sampler_desc: SamplerDesc::default(),
        });
        let descriptor = resources.descriptors.insert(DescriptorEntry {
            binding: 1,
            source: DescriptorSource::Texture(texture),
        });

        assert_eq!(resources.sampled_image(descriptor), Some(image));
        assert_eq!(
            resources.descriptors_where(|s| *s == DescriptorSource::Texture(texture)),
            vec![descriptor]
        );
        assert_eq!(resources.len(), 3);
    }

    #[test]
    fn test_counts() {
        let layout_stride = 20;
        let mut backend = HeadlessBackend::new(8, 8);
        let mut buffer = |size| BufferEntry::<HeadlessBackend> {
            buffer: backend
                .create_buffer(&BufferDesc {
                    size,
                    usage: BufferUsage::Vertex,
                    host_visible: false,
                })
                .unwrap(),
            size,
            usage: BufferUsage::Vertex,
            host_visible: false,
        };
        let mut layouts = crate::pipeline_cache::PipelineCache::<()>::new();
        let layout = layouts.intern_layout(&VertexLayout::new().with_stride(layout_stride));

        let vertices = VertexBufferEntry {
            buffer: buffer(200),
            layout,
            stride: layout_stride,
        };
        let indices = IndexBufferEntry {
            buffer: buffer(96),
            index_type: IndexType::U16,
        };
        assert_eq!(vertices.vertex_count(), 10);
        assert_eq!(indices.index_count(), 48);
    }
}
