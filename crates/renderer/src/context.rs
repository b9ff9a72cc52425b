//! The render context: every registry, pool and cache of one renderer.
//!
//! # Frame sequence
//!
//! [`RenderContext::frame`] runs one cycle of the frame pacer:
//!
//! 1. apply a pending swapchain rebuild;
//! 2. wait for the current slot's fence and release what it retired;
//! 3. write the per-draw transforms into the slot's storage buffer;
//! 4. acquire a backbuffer image, or give up on the frame when the
//!    swapchain is out of date;
//! 5. reset and open the command buffer and flush the upload queue;
//! 6. sort and execute the draw list;
//! 7. submit and present, then move to the next slot. A frame whose
//!    recording failed is still submitted and presented without its
//!    commands; its uploads stay queued.
//!
//! # Resource lifetime
//!
//! Destroying a resource removes its handle immediately. The native object
//! is retired until the next submission has completed, because the frame
//! being recorded and the frame still on the GPU may both reference it.

use glam::Mat4;
use tracing::{debug, info, warn};

use framekit_core::RendererConfig;
use framekit_rhi::buffer::{BufferUsage, IndexType};
use framekit_rhi::image::{Format, ImageLayout};
use framekit_rhi::shader::ShaderStage;
use framekit_rhi::vertex::VertexLayout;

use crate::backend::{Acquire, Backend, BufferDesc, ImageDesc, PresentStatus};
use crate::batch::BatchContext;
use crate::descriptor_cache::DescriptorCache;
use crate::draw::{DrawList, TransientIndexBuffer, TransientVertexBuffer, ViewId, Views};
use crate::error::{RenderError, RenderResult};
use crate::frame::{FramePacer, Retired};
use crate::handle::{
    DescriptorHandle, FramebufferHandle, Handle, ImageHandle, IndexBufferHandle, ProgramHandle,
    ShaderHandle, StorageBufferHandle, TextureHandle, UniformBufferHandle, VertexBufferHandle,
};
use crate::pipeline_cache::PipelineCache;
use crate::resources::{
    BufferEntry, BufferKind, BufferRef, DescriptorEntry, DescriptorSource, FramebufferDesc,
    FramebufferEntry, ImageEntry, IndexBufferEntry, ProgramDesc, ProgramEntry, Resources,
    ShaderEntry, TextureDesc, TextureEntry, VertexBufferEntry,
};
use crate::ring::{TransientAllocation, TransientPool, TransientPools, TransientUsage};
use crate::stats::FrameStats;
use crate::upload::{BufferCopy, ImageCopy, UploadQueue};

/// How far recording of a frame got.
struct Recorded {
    /// The command buffer was closed and carries the flushed uploads
    executable: bool,
    /// First error that aborted recording
    error: Option<RenderError>,
}

impl Recorded {
    fn failed(error: RenderError) -> Self {
        Self {
            executable: false,
            error: Some(error),
        }
    }
}

/// Outcome of [`RenderContext::frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was submitted and presented.
    Success,
    /// The swapchain is out of date, suboptimal or zero-sized. It is rebuilt
    /// at the start of the next frame; if the frame was dropped, its draws
    /// were discarded.
    SwapchainResizeWarning,
}

/// The submission engine: owns every resource, the pending draws and the
/// frames in flight of one backend.
///
/// Resources are addressed by typed handles. Destroying one removes it from
/// the registry at once but hands the native object to the frame pacer,
/// which releases it after every frame that could reference it has retired.
///
/// # Thread Safety
///
/// A context is driven from one thread; all methods take `&mut self` or
/// `&self` and none of them block except [`frame`](Self::frame) and
/// [`shutdown`](Self::shutdown).
pub struct RenderContext<B: Backend> {
    resources: Resources<B>,
    pipelines: PipelineCache<B::Pipeline>,
    descriptor_sets: DescriptorCache<B::DescriptorSet>,
    uploads: UploadQueue,
    draws: DrawList,
    views: Views,
    pacer: FramePacer<B>,
    pools: TransientPools<B>,
    stats: FrameStats,
    /// Attachment formats cached pipelines were built with for the backbuffer
    backbuffer_formats: (Format, Option<Format>),
    config: RendererConfig,
    backend: B,
}

impl<B: Backend> RenderContext<B> {
    /// Creates the transient pools and frame slots on `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation or a backend object
    /// cannot be created.
    pub fn init(mut backend: B, config: RendererConfig) -> RenderResult<Self> {
        config.validate()?;

        let pools = TransientPools::new(
            &mut backend,
            config.transient_vertex_size,
            config.transient_index_size,
            config.staging_size,
            config.transient_alignment,
        )?;
        let pacer = match FramePacer::new(&mut backend, config.max_draws) {
            Ok(pacer) => pacer,
            Err(e) => {
                pools.destroy(&mut backend);
                return Err(e);
            }
        };

        let (width, height) = backend.backbuffer_extent();
        info!(
            "Render context initialized ({}x{}, {:?}, {} draws per frame)",
            width,
            height,
            backend.backbuffer_format(),
            config.max_draws
        );

        Ok(Self {
            resources: Resources::new(),
            pipelines: PipelineCache::new(),
            descriptor_sets: DescriptorCache::new(config.max_descriptor_sets),
            uploads: UploadQueue::new(config.max_buffer_copies, config.max_image_copies),
            draws: DrawList::new(
                config.max_draws,
                config.max_descriptor_slots,
                config.max_bindings_per_set,
            ),
            views: Views::new(),
            pacer,
            pools,
            stats: FrameStats::default(),
            backbuffer_formats: (backend.backbuffer_format(), backend.backbuffer_depth_format()),
            config,
            backend,
        })
    }

    /// Records, submits and presents every draw submitted since the last call.
    ///
    /// Once a backbuffer image was acquired it is always submitted and
    /// presented, even when recording fails part way, so the swapchain and
    /// the frame slot stay usable. Queued uploads that did not reach the GPU
    /// are kept for the next frame.
    ///
    /// # Errors
    ///
    /// Backend failures other than an out-of-date swapchain. The frame's
    /// draws are discarded.
    pub fn frame(&mut self) -> RenderResult<FrameStatus> {
        if let Some((width, height)) = self.pacer.pending_resize() {
            if width == 0 || height == 0 {
                debug!("Backbuffer is {}x{}, skipping frame", width, height);
                self.draws.clear();
                return Ok(FrameStatus::SwapchainResizeWarning);
            }
            self.recreate_swapchain(width, height)?;
        }

        let mut stats = FrameStats {
            released: self.pacer.wait_current(&mut self.backend, &mut self.pools)?,
            ..Default::default()
        };

        let transforms = self.draws.transforms();
        if !transforms.is_empty() {
            self.backend.write_buffer(
                &self.pacer.current_slot().transforms,
                0,
                bytemuck::cast_slice(&transforms),
            )?;
        }

        if self.backend.acquire_image(&self.pacer.current_slot().frame)? == Acquire::OutOfDate {
            warn!(
                "Swapchain out of date, dropping frame with {} draws",
                self.draws.len()
            );
            self.pacer.request_rebuild(self.backend.backbuffer_extent());
            self.draws.clear();
            return Ok(FrameStatus::SwapchainResizeWarning);
        }

        let recorded = self.record(&mut stats);
        self.draws.clear();
        if let Some(e) = &recorded.error {
            warn!("Frame recording failed: {}", e);
        }

        // The acquired image goes back to the swapchain whatever was recorded.
        if let Err(e) = self.backend.submit(&self.pacer.current_slot().frame) {
            self.uploads.rollback(&mut self.resources);
            return Err(e.into());
        }
        let serial = if recorded.executable {
            self.uploads.commit();
            self.pacer.mark_submitted()
        } else {
            // Staged data stays tagged for the submission that will carry it.
            self.uploads.rollback(&mut self.resources);
            self.pacer.submitted_serial()
        };
        let presented = self.backend.present(&self.pacer.current_slot().frame);
        self.pacer.advance();

        stats.frame = serial;
        stats.transient_bytes = self.pools.usage().total();
        debug!("{}", stats);
        self.stats = stats;

        let status = match presented {
            Ok(PresentStatus::Optimal) => FrameStatus::Success,
            Ok(status) => {
                warn!("Present reported {:?}, rebuilding swapchain", status);
                self.pacer.request_rebuild(self.backend.backbuffer_extent());
                FrameStatus::SwapchainResizeWarning
            }
            Err(e) => return Err(recorded.error.unwrap_or(e.into())),
        };
        match recorded.error {
            Some(e) => Err(e),
            None => Ok(status),
        }
    }

    /// Everything between resetting the command buffer and closing it.
    fn record(&mut self, stats: &mut FrameStats) -> Recorded {
        let slot = self.pacer.current_slot();
        let frame = &slot.frame;
        let opened = self
            .backend
            .reset_frame(frame)
            .and_then(|()| self.backend.begin_commands(frame));
        if let Err(e) = opened {
            return Recorded::failed(e.into());
        }

        let flushed = self.uploads.flush(
            &mut self.backend,
            frame,
            self.pools.buffer(TransientPool::Staging),
            &mut self.resources,
        );
        stats.buffer_copies = flushed.buffer_copies;
        stats.image_copies = flushed.image_copies;

        self.draws.sort();
        let mut batch = BatchContext {
            backend: &mut self.backend,
            frame,
            transform_set: slot.transform_set,
            resources: &mut self.resources,
            views: &self.views,
            pipelines: &mut self.pipelines,
            descriptors: &mut self.descriptor_sets,
            transients: &self.pools,
            stats,
        };
        let executed = batch.execute(self.draws.commands());

        self.backend.cmd_prepare_present(frame);
        match self.backend.end_commands(frame) {
            Ok(()) => Recorded {
                executable: true,
                error: executed.err(),
            },
            Err(e) => Recorded::failed(executed.err().unwrap_or(e.into())),
        }
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.backend.wait_idle()?;
        self.backend.resize(width, height)?;
        self.pacer.clear_resize();

        // The device is idle, nothing can reference them anymore.
        let (color, depth) = self.backbuffer_formats;
        let stale = self.pipelines.evict_where(|key| key.uses_formats(&[color], depth));
        let dropped = stale.len();
        for pipeline in stale {
            self.backend.destroy_pipeline(pipeline);
        }
        self.backbuffer_formats = (
            self.backend.backbuffer_format(),
            self.backend.backbuffer_depth_format(),
        );

        info!(
            "Swapchain recreated at {}x{} ({:?}), dropped {} pipelines",
            width, height, self.backbuffer_formats.0, dropped
        );
        Ok(())
    }

    /// Rebuilds the swapchain at `width`x`height` before the next frame.
    /// A zero dimension (minimized window) pauses rendering until a
    /// non-zero size is set.
    pub fn reset(&mut self, width: u32, height: u32) {
        debug!("Resize requested: {}x{}", width, height);
        self.pacer.request_resize(width, height);
    }

    /// Waits for the device and releases every object the context owns.
    /// The backend is handed back.
    pub fn shutdown(mut self) -> RenderResult<B> {
        self.backend.wait_idle()?;

        if !self.draws.is_empty() || !self.uploads.is_empty() {
            warn!(
                "Shutting down with {} draws and {} uploads pending",
                self.draws.len(),
                self.uploads.len()
            );
        }
        self.draws.clear();
        self.uploads.clear();

        let backend = &mut self.backend;
        for pipeline in self.pipelines.drain() {
            backend.destroy_pipeline(pipeline);
        }
        for set in self.descriptor_sets.drain() {
            backend.free_descriptor_set(set);
        }

        let resources = &mut self.resources;
        for entry in resources.vertex_buffers.drain() {
            backend.destroy_buffer(entry.buffer.buffer);
        }
        for entry in resources.index_buffers.drain() {
            backend.destroy_buffer(entry.buffer.buffer);
        }
        for entry in resources.uniform_buffers.drain() {
            backend.destroy_buffer(entry.buffer);
        }
        for entry in resources.storage_buffers.drain() {
            backend.destroy_buffer(entry.buffer);
        }
        for entry in resources.textures.drain() {
            backend.destroy_sampler(entry.sampler);
        }
        for entry in resources.images.drain() {
            backend.destroy_image(entry.image);
        }
        for entry in resources.programs.drain() {
            backend.destroy_program_layout(entry.layout);
        }
        for entry in resources.shaders.drain() {
            backend.destroy_shader(entry.shader);
        }
        resources.descriptors.drain();
        resources.framebuffers.drain();

        let released = self.pacer.destroy(&mut self.backend, &mut self.pools);
        self.pools.destroy(&mut self.backend);

        info!("Render context shut down ({} retired objects released)", released);
        Ok(self.backend)
    }

    // --- buffers -----------------------------------------------------------

    fn create_buffer_entry(
        &mut self,
        size: u64,
        usage: BufferUsage,
        host_visible: bool,
    ) -> RenderResult<BufferEntry<B>> {
        if size == 0 {
            return Err(RenderError::InvalidArgument(format!(
                "{:?} buffer size must be greater than 0",
                usage
            )));
        }
        let buffer = self.backend.create_buffer(&BufferDesc {
            size,
            usage,
            host_visible,
        })?;
        Ok(BufferEntry {
            buffer,
            size,
            usage,
            host_visible,
        })
    }

    /// Copies `data` into the staging ring. The span is released once the
    /// next submission, which carries the copy, has completed.
    fn stage(&mut self, data: &[u8]) -> RenderResult<TransientAllocation> {
        let allocation = self
            .pools
            .allocate_with(&mut self.backend, TransientPool::Staging, data)?;
        self.pacer.retire(Retired::Transient(allocation));
        Ok(allocation)
    }

    fn upload_buffer(&mut self, dst: BufferRef, dst_offset: u64, data: &[u8]) -> RenderResult<()> {
        self.uploads.reserve_buffer_copy()?;
        let src = self.stage(data)?;
        self.uploads.enqueue_buffer_copy(BufferCopy {
            src,
            dst,
            dst_offset,
        })
    }

    fn upload_image(&mut self, dst: ImageHandle, data: &[u8]) -> RenderResult<()> {
        let entry = self.resources.images.get(dst)?;
        let expected = entry.desc.width as u64
            * entry.desc.height as u64
            * entry.desc.format.texel_size() as u64;
        if data.len() as u64 != expected {
            return Err(RenderError::InvalidArgument(format!(
                "image data is {} bytes, expected {}",
                data.len(),
                expected
            )));
        }
        self.uploads.reserve_image_copy()?;
        let src = self.stage(data)?;
        self.uploads.enqueue_image_copy(ImageCopy { src, dst })
    }

    /// Creates a device-local vertex buffer filled with `data`.
    pub fn create_vertex_buffer(
        &mut self,
        data: &[u8],
        layout: &VertexLayout,
    ) -> RenderResult<VertexBufferHandle> {
        let stride = layout.stride();
        if stride == 0 || data.len() % stride as usize != 0 {
            return Err(RenderError::InvalidArgument(format!(
                "{} bytes of vertex data do not match stride {}",
                data.len(),
                stride
            )));
        }
        let buffer = self.create_buffer_entry(data.len() as u64, BufferUsage::Vertex, false)?;
        let layout = self.pipelines.intern_layout(layout);
        let handle = self.resources.vertex_buffers.insert(VertexBufferEntry {
            buffer,
            layout,
            stride,
        });
        if let Err(e) = self.upload_buffer(BufferRef::Vertex(handle), 0, data) {
            self.destroy_vertex_buffer(handle)?;
            return Err(e);
        }
        debug!("Created vertex buffer {:?} ({} bytes)", handle, data.len());
        Ok(handle)
    }

    /// Creates a device-local index buffer filled with `data`.
    pub fn create_index_buffer(
        &mut self,
        data: &[u8],
        index_type: IndexType,
    ) -> RenderResult<IndexBufferHandle> {
        if data.len() as u64 % index_type.size() != 0 {
            return Err(RenderError::InvalidArgument(format!(
                "{} bytes of index data are not a whole number of {:?} indices",
                data.len(),
                index_type
            )));
        }
        let buffer = self.create_buffer_entry(data.len() as u64, BufferUsage::Index, false)?;
        let handle = self
            .resources
            .index_buffers
            .insert(IndexBufferEntry { buffer, index_type });
        if let Err(e) = self.upload_buffer(BufferRef::Index(handle), 0, data) {
            self.destroy_index_buffer(handle)?;
            return Err(e);
        }
        debug!("Created index buffer {:?} ({} bytes)", handle, data.len());
        Ok(handle)
    }

    /// Creates a host-visible uniform buffer of `size` bytes.
    pub fn create_uniform_buffer(&mut self, size: u64) -> RenderResult<UniformBufferHandle> {
        let entry = self.create_buffer_entry(size, BufferUsage::Uniform, true)?;
        let handle = self.resources.uniform_buffers.insert(entry);
        debug!("Created uniform buffer {:?} ({} bytes)", handle, size);
        Ok(handle)
    }

    /// Creates a storage buffer of `size` bytes with undefined contents.
    ///
    /// Device-local storage buffers (`host_visible == false`) are written
    /// with [`update_buffer`](Self::update_buffer) through the staging ring.
    pub fn create_storage_buffer(
        &mut self,
        size: u64,
        host_visible: bool,
    ) -> RenderResult<StorageBufferHandle> {
        let entry = self.create_buffer_entry(size, BufferUsage::Storage, host_visible)?;
        let handle = self.resources.storage_buffers.insert(entry);
        debug!(
            "Created storage buffer {:?} ({} bytes, host visible: {})",
            handle, size, host_visible
        );
        Ok(handle)
    }

    /// Writes `data` at `offset`. Host-visible buffers are written
    /// immediately; device-local ones through the staging ring and a copy
    /// recorded at the start of the next frame.
    pub fn update_buffer<K: BufferKind>(
        &mut self,
        handle: Handle<K>,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        let entry = K::entry(&self.resources, handle)?;
        check_range(entry.size, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        if entry.host_visible {
            self.backend.write_buffer(&entry.buffer, offset, data)?;
            return Ok(());
        }
        self.upload_buffer(K::to_ref(handle), offset, data)
    }

    /// Writes `data` straight into a host-visible buffer.
    ///
    /// # Errors
    ///
    /// [`RenderError::NotHostVisible`] for device-local buffers.
    pub fn write_buffer<K: BufferKind>(
        &mut self,
        handle: Handle<K>,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        let entry = K::entry(&self.resources, handle)?;
        if !entry.host_visible {
            return Err(RenderError::NotHostVisible);
        }
        check_range(entry.size, offset, data.len())?;
        self.backend.write_buffer(&entry.buffer, offset, data)?;
        Ok(())
    }

    /// Destroys a vertex buffer. Draws already submitted this frame still
    /// see it; the native buffer is released once they have retired.
    pub fn destroy_vertex_buffer(&mut self, handle: VertexBufferHandle) -> RenderResult<()> {
        let entry = self.resources.vertex_buffers.remove(handle)?;
        self.pacer.retire(Retired::Buffer(entry.buffer.buffer));
        debug!("Destroyed vertex buffer {:?}", handle);
        Ok(())
    }

    /// Destroys an index buffer, deferring the release like
    /// [`destroy_vertex_buffer`](Self::destroy_vertex_buffer).
    pub fn destroy_index_buffer(&mut self, handle: IndexBufferHandle) -> RenderResult<()> {
        let entry = self.resources.index_buffers.remove(handle)?;
        self.pacer.retire(Retired::Buffer(entry.buffer.buffer));
        debug!("Destroyed index buffer {:?}", handle);
        Ok(())
    }

    /// Destroys a uniform buffer and evicts the cached descriptor sets
    /// written from it.
    pub fn destroy_uniform_buffer(&mut self, handle: UniformBufferHandle) -> RenderResult<()> {
        let entry = self.resources.uniform_buffers.remove(handle)?;
        self.evict_sets_using(|source| *source == DescriptorSource::UniformBuffer(handle));
        self.pacer.retire(Retired::Buffer(entry.buffer));
        debug!("Destroyed uniform buffer {:?}", handle);
        Ok(())
    }

    /// Destroys a storage buffer and evicts the cached descriptor sets
    /// written from it.
    pub fn destroy_storage_buffer(&mut self, handle: StorageBufferHandle) -> RenderResult<()> {
        let entry = self.resources.storage_buffers.remove(handle)?;
        self.evict_sets_using(|source| *source == DescriptorSource::StorageBuffer(handle));
        self.pacer.retire(Retired::Buffer(entry.buffer));
        debug!("Destroyed storage buffer {:?}", handle);
        Ok(())
    }

    // --- transient buffers -------------------------------------------------

    /// Writes `data` into the transient vertex ring. The buffer is valid for
    /// draws submitted before the next [`frame`](Self::frame).
    pub fn create_transient_vertex_buffer(
        &mut self,
        data: &[u8],
        layout: &VertexLayout,
    ) -> RenderResult<TransientVertexBuffer> {
        let stride = layout.stride();
        if stride == 0 || data.is_empty() || data.len() % stride as usize != 0 {
            return Err(RenderError::InvalidArgument(format!(
                "{} bytes of vertex data do not match stride {}",
                data.len(),
                stride
            )));
        }
        let allocation = self
            .pools
            .allocate_with(&mut self.backend, TransientPool::Vertex, data)?;
        self.pacer.retire(Retired::Transient(allocation));
        Ok(TransientVertexBuffer {
            allocation,
            layout: self.pipelines.intern_layout(layout),
            vertex_count: (data.len() / stride as usize) as u32,
        })
    }

    /// Writes `data` into the transient index ring. The buffer is valid for
    /// draws submitted before the next [`frame`](Self::frame).
    pub fn create_transient_index_buffer(
        &mut self,
        data: &[u8],
        index_type: IndexType,
    ) -> RenderResult<TransientIndexBuffer> {
        if data.is_empty() || data.len() as u64 % index_type.size() != 0 {
            return Err(RenderError::InvalidArgument(format!(
                "{} bytes of index data are not a whole number of {:?} indices",
                data.len(),
                index_type
            )));
        }
        let allocation = self
            .pools
            .allocate_with(&mut self.backend, TransientPool::Index, data)?;
        self.pacer.retire(Retired::Transient(allocation));
        Ok(TransientIndexBuffer {
            allocation,
            index_type,
            index_count: (data.len() as u64 / index_type.size()) as u32,
        })
    }

    // --- images and textures -----------------------------------------------

    /// Creates a device-local image in the undefined layout. Sampled images
    /// get their texels through [`create_texture`](Self::create_texture) or
    /// [`update_texture`](Self::update_texture).
    ///
    /// # Errors
    ///
    /// Returns the backend error if the image cannot be created, including
    /// a zero width or height.
    pub fn create_image(&mut self, desc: ImageDesc) -> RenderResult<ImageHandle> {
        let image = self.backend.create_image(&desc)?;
        let handle = self.resources.images.insert(ImageEntry {
            image,
            desc,
            layout: ImageLayout::Undefined,
        });
        debug!(
            "Created image {:?} ({}x{} {:?})",
            handle, desc.width, desc.height, desc.format
        );
        Ok(handle)
    }

    /// Destroys an image. Framebuffers using it stop rendering and textures
    /// sampling it skip their draws until they are destroyed too.
    pub fn destroy_image(&mut self, handle: ImageHandle) -> RenderResult<()> {
        let entry = self.resources.images.remove(handle)?;
        let textures: Vec<TextureHandle> = self
            .resources
            .textures
            .iter()
            .filter(|(_, texture)| texture.image == handle)
            .map(|(texture, _)| texture)
            .collect();
        self.evict_sets_using(|source| {
            matches!(source, DescriptorSource::Texture(t) if textures.contains(t))
        });
        self.pacer.retire(Retired::Image(entry.image));
        debug!("Destroyed image {:?}", handle);
        Ok(())
    }

    /// Creates a sampled view of an image, optionally filling the image.
    pub fn create_texture(&mut self, desc: TextureDesc<'_>) -> RenderResult<TextureHandle> {
        let image = self.resources.images.get(desc.image)?;
        if !image.desc.usage.is_sampled() {
            return Err(RenderError::InvalidArgument(format!(
                "image {:?} is not sampled",
                desc.image
            )));
        }
        let sampler = self.backend.create_sampler(&desc.sampler)?;
        let handle = self.resources.textures.insert(TextureEntry {
            image: desc.image,
            sampler,
            sampler_desc: desc.sampler,
        });
        if let Some(data) = desc.data
            && let Err(e) = self.upload_image(desc.image, data)
        {
            self.destroy_texture(handle)?;
            return Err(e);
        }
        debug!("Created texture {:?} on image {:?}", handle, desc.image);
        Ok(handle)
    }

    /// Replaces the texels of the texture's image.
    pub fn update_texture(&mut self, handle: TextureHandle, data: &[u8]) -> RenderResult<()> {
        let image = self.resources.textures.get(handle)?.image;
        self.upload_image(image, data)
    }

    /// Destroys a texture and its sampler. The image it samples is left alone.
    pub fn destroy_texture(&mut self, handle: TextureHandle) -> RenderResult<()> {
        let entry = self.resources.textures.remove(handle)?;
        self.evict_sets_using(|source| *source == DescriptorSource::Texture(handle));
        self.pacer.retire(Retired::Sampler(entry.sampler));
        debug!("Destroyed texture {:?}", handle);
        Ok(())
    }

    // --- shaders and programs ----------------------------------------------

    /// Creates a shader from SPIR-V bytes.
    pub fn create_shader(&mut self, stage: ShaderStage, spirv: &[u8]) -> RenderResult<ShaderHandle> {
        let shader = self.backend.create_shader(stage, spirv)?;
        let handle = self.resources.shaders.insert(ShaderEntry { shader, stage });
        debug!("Created {} shader {:?}", stage.name(), handle);
        Ok(handle)
    }

    /// Destroys a shader. Draws of programs built from it are skipped from
    /// then on, so destroy those programs first.
    pub fn destroy_shader(&mut self, handle: ShaderHandle) -> RenderResult<()> {
        let entry = self.resources.shaders.remove(handle)?;
        self.pacer.retire(Retired::Shader(entry.shader));
        debug!("Destroyed shader {:?}", handle);
        Ok(())
    }

    /// Creates a program. Its pipelines are built on first use.
    pub fn create_program(&mut self, desc: ProgramDesc) -> RenderResult<ProgramHandle> {
        if desc.slots.len() > self.config.max_descriptor_slots {
            return Err(RenderError::capacity(
                "descriptor slots",
                self.config.max_descriptor_slots,
            ));
        }
        if desc
            .slots
            .iter()
            .any(|bindings| bindings.len() > self.config.max_bindings_per_set)
        {
            return Err(RenderError::capacity(
                "descriptor bindings per set",
                self.config.max_bindings_per_set,
            ));
        }
        for (handle, expected) in [
            (desc.vertex, ShaderStage::Vertex),
            (desc.fragment, ShaderStage::Fragment),
        ] {
            let stage = self.resources.shaders.get(handle)?.stage;
            if stage != expected {
                return Err(RenderError::InvalidArgument(format!(
                    "shader {:?} is a {} shader, expected {}",
                    handle,
                    stage.name(),
                    expected.name()
                )));
            }
        }

        let layout = self.backend.create_program_layout(&desc.slots)?;
        let handle = self.resources.programs.insert(ProgramEntry {
            vertex: desc.vertex,
            fragment: desc.fragment,
            layout,
            slots: desc.slots,
            state: desc.state,
        });
        debug!("Created program {:?}", handle);
        Ok(handle)
    }

    /// Destroys a program with its cached pipelines and descriptor sets.
    pub fn destroy_program(&mut self, handle: ProgramHandle) -> RenderResult<()> {
        let entry = self.resources.programs.remove(handle)?;
        let pipelines = self.pipelines.evict_program(handle);
        let sets = self.descriptor_sets.evict_program(handle);
        debug!(
            "Destroyed program {:?} ({} pipelines, {} descriptor sets)",
            handle,
            pipelines.len(),
            sets.len()
        );
        self.pacer
            .retire_all(pipelines.into_iter().map(Retired::Pipeline));
        self.pacer
            .retire_all(sets.into_iter().map(Retired::DescriptorSet));
        self.pacer.retire(Retired::ProgramLayout(entry.layout));
        Ok(())
    }

    // --- descriptors -------------------------------------------------------

    /// Creates a descriptor binding `source` at `binding`.
    pub fn create_descriptor(
        &mut self,
        binding: u32,
        source: DescriptorSource,
    ) -> RenderResult<DescriptorHandle> {
        match source {
            DescriptorSource::UniformBuffer(h) => {
                self.resources.uniform_buffers.get(h)?;
            }
            DescriptorSource::StorageBuffer(h) => {
                self.resources.storage_buffers.get(h)?;
            }
            DescriptorSource::Texture(h) => {
                self.resources.textures.get(h)?;
            }
        }
        let handle = self
            .resources
            .descriptors
            .insert(DescriptorEntry { binding, source });
        debug!("Created descriptor {:?} ({:?} at binding {})", handle, source, binding);
        Ok(handle)
    }

    /// Destroys a descriptor and the cached sets that contain it.
    pub fn destroy_descriptor(&mut self, handle: DescriptorHandle) -> RenderResult<()> {
        self.resources.descriptors.remove(handle)?;
        let sets = self.descriptor_sets.evict_descriptors(&[handle]);
        self.pacer
            .retire_all(sets.into_iter().map(Retired::DescriptorSet));
        debug!("Destroyed descriptor {:?}", handle);
        Ok(())
    }

    /// Drops every cached descriptor set written from a descriptor whose
    /// source matches `predicate`.
    fn evict_sets_using(&mut self, predicate: impl FnMut(&DescriptorSource) -> bool) {
        let descriptors = self.resources.descriptors_where(predicate);
        let sets = self.descriptor_sets.evict_descriptors(&descriptors);
        self.pacer
            .retire_all(sets.into_iter().map(Retired::DescriptorSet));
    }

    // --- framebuffers and views --------------------------------------------

    /// Groups attachment images into a render target. Its extent is that of
    /// the first attachment; every attachment must match it.
    pub fn create_framebuffer(&mut self, desc: FramebufferDesc) -> RenderResult<FramebufferHandle> {
        let mut extent = None;
        let mut check = |image: ImageHandle, depth: bool| -> RenderResult<Format> {
            let entry = self.resources.images.get(image)?;
            if !entry.desc.usage.is_attachment() || entry.desc.format.is_depth() != depth {
                return Err(RenderError::InvalidArgument(format!(
                    "image {:?} ({:?}, {:?}) cannot be a {} attachment",
                    image,
                    entry.desc.format,
                    entry.desc.usage,
                    if depth { "depth" } else { "color" }
                )));
            }
            let size = (entry.desc.width, entry.desc.height);
            if *extent.get_or_insert(size) != size {
                return Err(RenderError::InvalidArgument(format!(
                    "attachment {:?} is {}x{}, framebuffer is {:?}",
                    image, size.0, size.1, extent
                )));
            }
            Ok(entry.desc.format)
        };

        let color_formats = desc
            .colors
            .iter()
            .map(|&image| check(image, false))
            .collect::<RenderResult<Vec<_>>>()?;
        let depth_format = desc.depth.map(|image| check(image, true)).transpose()?;
        let Some(extent) = extent else {
            return Err(RenderError::InvalidArgument(
                "framebuffer needs at least one attachment".into(),
            ));
        };

        let handle = self.resources.framebuffers.insert(FramebufferEntry {
            colors: desc.colors,
            depth: desc.depth,
            extent,
            color_formats,
            depth_format,
        });
        debug!("Created framebuffer {:?} ({}x{})", handle, extent.0, extent.1);
        Ok(handle)
    }

    /// Destroys a framebuffer. Views rendering into it fall back to the
    /// backbuffer.
    pub fn destroy_framebuffer(&mut self, handle: FramebufferHandle) -> RenderResult<()> {
        self.resources.framebuffers.remove(handle)?;
        self.views.detach_framebuffer(handle);
        debug!("Destroyed framebuffer {:?}", handle);
        Ok(())
    }

    /// Points `view` at `framebuffer`, or at the backbuffer with `None`.
    pub fn set_view_target(
        &mut self,
        view: ViewId,
        framebuffer: Option<FramebufferHandle>,
    ) -> RenderResult<()> {
        if let Some(framebuffer) = framebuffer {
            self.resources.framebuffers.get(framebuffer)?;
        }
        self.views.set_target(view, framebuffer);
        Ok(())
    }

    /// Sets the clear policy of `view`: clear its color attachments to
    /// `rgba` when its pass begins, or load the previous contents with
    /// `None`. Views clear to opaque black until set.
    pub fn set_view_clear(&mut self, view: ViewId, rgba: Option<[f32; 4]>) {
        self.views.set_clear(view, rgba);
    }

    /// Uses `handle` as the vertex stream of the draw being built.
    pub fn bind_vertex_buffer(&mut self, handle: VertexBufferHandle) -> RenderResult<()> {
        self.resources.vertex_buffers.get(handle)?;
        self.draws.bind_vertex_buffer(handle);
        Ok(())
    }

    /// Uses a transient vertex buffer for the draw being built; it must
    /// come from this frame's ring allocations.
    pub fn bind_transient_vertex_buffer(&mut self, buffer: TransientVertexBuffer) {
        self.draws.bind_transient_vertex_buffer(buffer);
    }

    /// Makes the draw being built indexed.
    pub fn bind_index_buffer(&mut self, handle: IndexBufferHandle) -> RenderResult<()> {
        self.resources.index_buffers.get(handle)?;
        self.draws.bind_index_buffer(handle);
        Ok(())
    }

    pub fn bind_transient_index_buffer(&mut self, buffer: TransientIndexBuffer) {
        self.draws.bind_transient_index_buffer(buffer);
    }

    /// Appends `descriptor` to user slot `slot` (descriptor set `slot + 1`).
    pub fn bind_descriptor(&mut self, slot: usize, descriptor: DescriptorHandle) -> RenderResult<()> {
        self.resources.descriptors.get(descriptor)?;
        self.draws.bind_descriptor(slot, descriptor)
    }

    /// Draws `count` vertices (or indices) instead of the whole bound buffer.
    pub fn set_vertex_count(&mut self, count: u32) {
        self.draws.set_vertex_count(count);
    }

    /// Model matrix of the draw being built. Like the view and projection
    /// matrices it resets to identity after every [`submit`](Self::submit).
    pub fn set_transform(&mut self, model: Mat4) {
        self.draws.set_transform(model);
    }

    pub fn set_view(&mut self, view: Mat4) {
        self.draws.set_view(view);
    }

    pub fn set_proj(&mut self, proj: Mat4) {
        self.draws.set_proj(proj);
    }

    /// Queues the current draw state for `view` with `program`.
    ///
    /// # Errors
    ///
    /// [`RenderError::CapacityExceeded`] when `max_draws` draws are already
    /// queued for this frame.
    pub fn submit(&mut self, view: ViewId, program: ProgramHandle) -> RenderResult<()> {
        self.resources.programs.get(program)?;
        self.draws.submit(view, program)
    }

    // --- inspection --------------------------------------------------------

    /// Statistics of the last submitted frame.
    pub fn last_frame_stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Draws submitted since the last frame.
    pub fn pending_draws(&self) -> usize {
        self.draws.len()
    }

    /// Buffer and image copies waiting for the next frame.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Retired objects and ring spans waiting for a fence.
    pub fn pending_releases(&self) -> usize {
        self.pacer.pending_releases()
    }

    pub fn transient_usage(&self) -> TransientUsage {
        self.pools.usage()
    }

    /// Pipelines currently cached, across all programs and targets.
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn descriptor_set_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    pub fn resources(&self) -> &Resources<B> {
        &self.resources
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable backend access, for tests that script backend behaviour.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Native buffer behind `handle`.
    pub fn native_buffer<K: BufferKind>(&self, handle: Handle<K>) -> RenderResult<&B::Buffer> {
        Ok(&K::entry(&self.resources, handle)?.buffer)
    }

    /// Native image behind `handle`.
    pub fn native_image(&self, handle: ImageHandle) -> RenderResult<&B::Image> {
        Ok(&self.resources.images.get(handle)?.image)
    }
}

fn check_range(size: u64, offset: u64, len: usize) -> RenderResult<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RenderError::InvalidArgument(format!(
            "write of {} bytes at offset {} exceeds buffer size {}",
            len, offset, size
        ))),
    }
}
