//! A backend that records instead of rendering.
//!
//! Buffers and images are byte vectors and copies execute when they are
//! recorded, so uploaded data can be read back right after `frame()`.
//! Every command of the last submitted frame is kept for inspection, and
//! swapchain acquire/present results can be scripted to exercise the
//! out-of-date paths without a window. Individual calls can be made to
//! fail once with [`HeadlessBackend::fail_next`].

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use framekit_rhi::buffer::{BufferUsage, IndexType};
use framekit_rhi::descriptor::DescriptorBindingLayout;
use framekit_rhi::image::{Format, ImageLayout, ImageUsage};
use framekit_rhi::sampler::SamplerDesc;
use framekit_rhi::shader::{ShaderStage, spirv_words};
use framekit_rhi::{RhiError, RhiResult};

use super::{
    Acquire, Backend, BufferCopyRegion, BufferDesc, DescriptorResource, DescriptorWrite,
    ImageDesc, PipelineDesc, PresentStatus, RenderTarget, TransferBarrier,
};

/// Buffer whose bytes live in the backend; read them with
/// [`HeadlessBackend::buffer_data`].
#[derive(Debug)]
pub struct HeadlessBuffer {
    id: u32,
    size: u64,
    usage: BufferUsage,
    host_visible: bool,
}

impl HeadlessBuffer {
    /// Id the buffer appears under in recorded [`Command`]s.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }
}

/// Image whose texels live in the backend; read them with
/// [`HeadlessBackend::image_data`].
#[derive(Debug)]
pub struct HeadlessImage {
    id: u32,
    desc: ImageDesc,
}

impl HeadlessImage {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }
}

/// Sampler remembering the description it was created from.
#[derive(Debug)]
pub struct HeadlessSampler {
    id: u32,
    desc: SamplerDesc,
}

impl HeadlessSampler {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

#[derive(Debug)]
pub struct HeadlessShader {
    id: u32,
    stage: ShaderStage,
}

#[derive(Debug)]
pub struct HeadlessProgramLayout {
    id: u32,
    slots: Vec<Vec<DescriptorBindingLayout>>,
}

/// Pipeline; its id shows up in [`Command::BindPipeline`].
#[derive(Debug)]
pub struct HeadlessPipeline {
    id: u32,
}

impl HeadlessPipeline {
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Descriptor set id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeadlessSet(pub u32);

#[derive(Debug)]
pub struct HeadlessFrame {
    id: u32,
}

/// Attachments a pass was begun with.
#[derive(Clone, Debug, PartialEq)]
pub enum TargetRecord {
    Backbuffer,
    Offscreen { colors: Vec<u32>, depth: Option<u32> },
}

/// One recorded command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginRendering {
        target: TargetRecord,
        clear: Option<[f32; 4]>,
    },
    EndRendering,
    BindPipeline {
        pipeline: u32,
    },
    BindVertexBuffer {
        buffer: u32,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: u32,
        offset: u64,
        index_type: IndexType,
    },
    BindDescriptorSet {
        set_index: u32,
        set: HeadlessSet,
    },
    Draw {
        vertex_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    CopyBuffer {
        src: u32,
        dst: u32,
        region: BufferCopyRegion,
    },
    CopyBufferToImage {
        src: u32,
        src_offset: u64,
        dst: u32,
    },
    BufferBarrier {
        buffer: u32,
        usage: BufferUsage,
        barrier: TransferBarrier,
    },
    ImageBarrier {
        image: u32,
        old: ImageLayout,
        new: ImageLayout,
    },
    PreparePresent,
}

/// Backend calls that [`HeadlessBackend::fail_next`] can make fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ResetFrame,
    BeginCommands,
    EndCommands,
    /// Fails before anything is queued; the frame is not presented
    Submit,
    /// Fails after the render-complete semaphore was consumed
    Present,
    /// Nothing is recorded, like a missing backbuffer
    BeginRendering,
}

/// Running totals since the backend was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessCounters {
    pub pipelines_created: u32,
    pub descriptor_sets_allocated: u32,
    pub descriptor_writes: u32,
    pub submits: u32,
    pub presents: u32,
    pub acquires: u32,
    pub resizes: u32,
    pub idle_waits: u32,
}

/// Native objects created and not yet destroyed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub buffers: usize,
    pub images: usize,
    pub samplers: usize,
    pub shaders: usize,
    pub program_layouts: usize,
    pub pipelines: usize,
    pub descriptor_sets: usize,
    pub frames: usize,
}

impl LiveObjects {
    /// All live objects; zero after a clean shutdown.
    pub fn total(&self) -> usize {
        self.buffers
            + self.images
            + self.samplers
            + self.shaders
            + self.program_layouts
            + self.pipelines
            + self.descriptor_sets
            + self.frames
    }
}

/// [`Backend`] without a GPU, for tests and tools.
///
/// The fake swapchain has three images handed out round-robin. Each image
/// has a render-complete flag that a submit sets and the present of that
/// image clears; submitting to an image whose flag is still set, or
/// presenting an image nothing was submitted for, is an error.
pub struct HeadlessBackend {
    next_id: u32,
    buffers: HashMap<u32, Vec<u8>>,
    images: HashMap<u32, Vec<u8>>,
    live: LiveObjects,
    counters: HeadlessCounters,
    recording: Vec<Command>,
    last_submitted: Vec<Command>,
    extent: (u32, u32),
    format: Format,
    image_count: u32,
    next_image: u32,
    current_image: u32,
    /// Render-complete semaphore of each swapchain image, signaled by a
    /// submit and consumed by the present of that image
    render_finished: Vec<bool>,
    out_of_date_acquires: u32,
    present_script: VecDeque<PresentStatus>,
    failures: Vec<FailPoint>,
    /// `end_commands` succeeded since the last `begin_commands`
    executable: bool,
}

impl HeadlessBackend {
    /// Creates a backend whose backbuffer is `width` x `height` `Bgra8Srgb`.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            next_id: 1,
            buffers: HashMap::new(),
            images: HashMap::new(),
            live: LiveObjects::default(),
            counters: HeadlessCounters::default(),
            recording: Vec::new(),
            last_submitted: Vec::new(),
            extent: (width, height),
            format: Format::Bgra8Srgb,
            image_count: 3,
            next_image: 0,
            current_image: 0,
            render_finished: vec![false; 3],
            out_of_date_acquires: 0,
            present_script: VecDeque::new(),
            failures: Vec::new(),
            executable: false,
        }
    }

    /// The next call at `point` fails with a device error. Calls stack.
    pub fn fail_next(&mut self, point: FailPoint) {
        self.failures.push(point);
    }

    fn check(&mut self, point: FailPoint) -> RhiResult<()> {
        match self.failures.iter().position(|&p| p == point) {
            Some(i) => {
                self.failures.remove(i);
                trace!(?point, "scripted failure");
                Err(RhiError::VulkanError(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
            }
            None => Ok(()),
        }
    }

    /// The next `count` acquires report an out-of-date swapchain.
    pub fn fail_next_acquires(&mut self, count: u32) {
        self.out_of_date_acquires += count;
    }

    /// Queues the result of an upcoming present.
    pub fn script_present(&mut self, status: PresentStatus) {
        self.present_script.push_back(status);
    }

    /// Changes the format reported for the swapchain.
    pub fn set_backbuffer_format(&mut self, format: Format) {
        self.format = format;
    }

    /// Commands of the most recently submitted frame. Empty when that frame
    /// was submitted without being executable.
    pub fn submitted_commands(&self) -> &[Command] {
        &self.last_submitted
    }

    /// Submitted commands of the last frame matching `predicate`.
    pub fn count_submitted(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.last_submitted.iter().filter(|c| predicate(c)).count()
    }

    /// Current contents of `buffer`.
    pub fn buffer_data(&self, buffer: &HeadlessBuffer) -> &[u8] {
        self.buffers
            .get(&buffer.id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Current texels of `image`, tightly packed.
    pub fn image_data(&self, image: &HeadlessImage) -> &[u8] {
        self.images
            .get(&image.id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Running totals since creation.
    pub fn counters(&self) -> HeadlessCounters {
        self.counters
    }

    /// Native objects currently alive, for leak checks.
    pub fn live_objects(&self) -> LiveObjects {
        self.live
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, command: Command) {
        trace!(?command, "record");
        self.recording.push(command);
    }
}

impl Backend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Image = HeadlessImage;
    type Sampler = HeadlessSampler;
    type Shader = HeadlessShader;
    type ProgramLayout = HeadlessProgramLayout;
    type Pipeline = HeadlessPipeline;
    type DescriptorSet = HeadlessSet;
    type Frame = HeadlessFrame;

    fn create_buffer(&mut self, desc: &BufferDesc) -> RhiResult<HeadlessBuffer> {
        if desc.size == 0 {
            return Err(RhiError::InvalidArgument(
                "Buffer size must be greater than 0".to_string(),
            ));
        }
        let id = self.next_id();
        self.buffers.insert(id, vec![0; desc.size as usize]);
        self.live.buffers += 1;
        Ok(HeadlessBuffer {
            id,
            size: desc.size,
            usage: desc.usage,
            host_visible: desc.host_visible || desc.usage == BufferUsage::Staging,
        })
    }

    fn write_buffer(&mut self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        if !buffer.host_visible {
            return Err(RhiError::InvalidArgument(
                "Buffer memory is not mapped".to_string(),
            ));
        }
        let bytes = self
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| RhiError::InvalidArgument("destroyed buffer".to_string()))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(RhiError::InvalidArgument(format!(
                "Write exceeds buffer size: {} > {}",
                end,
                bytes.len()
            )));
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: HeadlessBuffer) {
        self.buffers.remove(&buffer.id);
        self.live.buffers -= 1;
    }

    fn create_image(&mut self, desc: &ImageDesc) -> RhiResult<HeadlessImage> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::InvalidArgument(format!(
                "Image dimensions must be greater than 0, got {}x{}",
                desc.width, desc.height
            )));
        }
        let id = self.next_id();
        let size = desc.width as usize * desc.height as usize * desc.format.texel_size() as usize;
        self.images.insert(id, vec![0; size]);
        self.live.images += 1;
        Ok(HeadlessImage { id, desc: *desc })
    }

    fn destroy_image(&mut self, image: HeadlessImage) {
        self.images.remove(&image.id);
        self.live.images -= 1;
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RhiResult<HeadlessSampler> {
        self.live.samplers += 1;
        Ok(HeadlessSampler {
            id: self.next_id(),
            desc: *desc,
        })
    }

    fn destroy_sampler(&mut self, _sampler: HeadlessSampler) {
        self.live.samplers -= 1;
    }

    fn create_shader(&mut self, stage: ShaderStage, spirv: &[u8]) -> RhiResult<HeadlessShader> {
        spirv_words(spirv)?;
        self.live.shaders += 1;
        Ok(HeadlessShader {
            id: self.next_id(),
            stage,
        })
    }

    fn destroy_shader(&mut self, _shader: HeadlessShader) {
        self.live.shaders -= 1;
    }

    fn create_program_layout(
        &mut self,
        slots: &[Vec<DescriptorBindingLayout>],
    ) -> RhiResult<HeadlessProgramLayout> {
        self.live.program_layouts += 1;
        Ok(HeadlessProgramLayout {
            id: self.next_id(),
            slots: slots.to_vec(),
        })
    }

    fn destroy_program_layout(&mut self, _layout: HeadlessProgramLayout) {
        self.live.program_layouts -= 1;
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_, Self>) -> RhiResult<HeadlessPipeline> {
        if desc.vertex_shader.stage != ShaderStage::Vertex
            || desc.fragment_shader.stage != ShaderStage::Fragment
        {
            return Err(RhiError::PipelineError("shader stage mismatch".to_string()));
        }
        if desc.color_formats.is_empty() && desc.depth_format.is_none() {
            return Err(RhiError::PipelineError(
                "Pipeline needs at least one attachment format".to_string(),
            ));
        }
        trace!(
            layout = desc.layout.id,
            vs = desc.vertex_shader.id,
            fs = desc.fragment_shader.id,
            "create pipeline"
        );
        self.counters.pipelines_created += 1;
        self.live.pipelines += 1;
        Ok(HeadlessPipeline { id: self.next_id() })
    }

    fn destroy_pipeline(&mut self, _pipeline: HeadlessPipeline) {
        self.live.pipelines -= 1;
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: &HeadlessProgramLayout,
        slot: usize,
    ) -> RhiResult<HeadlessSet> {
        if slot >= layout.slots.len() {
            return Err(RhiError::DescriptorError(format!(
                "layout has no descriptor slot {}",
                slot
            )));
        }
        self.counters.descriptor_sets_allocated += 1;
        self.live.descriptor_sets += 1;
        Ok(HeadlessSet(self.next_id()))
    }

    fn write_descriptor_set(
        &mut self,
        _set: HeadlessSet,
        writes: &[DescriptorWrite<'_, Self>],
    ) -> RhiResult<()> {
        for write in writes {
            if let DescriptorResource::UniformBuffer(buffer)
            | DescriptorResource::StorageBuffer(buffer) = write.resource
                && !self.buffers.contains_key(&buffer.id)
            {
                return Err(RhiError::DescriptorError(format!(
                    "binding {} refers to a destroyed buffer",
                    write.binding
                )));
            }
        }
        self.counters.descriptor_writes += writes.len() as u32;
        Ok(())
    }

    fn create_transform_set(&mut self, buffer: &HeadlessBuffer) -> RhiResult<HeadlessSet> {
        if buffer.usage != BufferUsage::Storage {
            return Err(RhiError::DescriptorError(
                "transform set needs a storage buffer".to_string(),
            ));
        }
        self.live.descriptor_sets += 1;
        Ok(HeadlessSet(self.next_id()))
    }

    fn free_descriptor_set(&mut self, _set: HeadlessSet) {
        self.live.descriptor_sets -= 1;
    }

    fn create_frame(&mut self) -> RhiResult<HeadlessFrame> {
        self.live.frames += 1;
        Ok(HeadlessFrame { id: self.next_id() })
    }

    fn destroy_frame(&mut self, _frame: HeadlessFrame) {
        self.live.frames -= 1;
    }

    fn wait_for_frame(&mut self, _frame: &HeadlessFrame) -> RhiResult<()> {
        Ok(())
    }

    fn acquire_image(&mut self, _frame: &HeadlessFrame) -> RhiResult<Acquire> {
        self.counters.acquires += 1;
        if self.out_of_date_acquires > 0 {
            self.out_of_date_acquires -= 1;
            return Ok(Acquire::OutOfDate);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        self.current_image = index;
        Ok(Acquire::Image(index))
    }

    fn reset_frame(&mut self, _frame: &HeadlessFrame) -> RhiResult<()> {
        self.executable = false;
        self.check(FailPoint::ResetFrame)
    }

    fn begin_commands(&mut self, frame: &HeadlessFrame) -> RhiResult<()> {
        trace!(frame = frame.id, "begin commands");
        self.executable = false;
        self.recording.clear();
        self.check(FailPoint::BeginCommands)
    }

    fn end_commands(&mut self, _frame: &HeadlessFrame) -> RhiResult<()> {
        self.check(FailPoint::EndCommands)?;
        self.executable = true;
        Ok(())
    }

    fn submit(&mut self, _frame: &HeadlessFrame) -> RhiResult<()> {
        self.check(FailPoint::Submit)?;
        let image = self.current_image as usize;
        if self.render_finished[image] {
            return Err(RhiError::SwapchainError(format!(
                "render-complete semaphore of image {} is still awaited",
                image
            )));
        }
        self.render_finished[image] = true;
        self.counters.submits += 1;
        let recorded = std::mem::take(&mut self.recording);
        self.last_submitted = if self.executable { recorded } else { Vec::new() };
        self.executable = false;
        Ok(())
    }

    fn present(&mut self, _frame: &HeadlessFrame) -> RhiResult<PresentStatus> {
        let image = self.current_image as usize;
        let signaled = std::mem::replace(&mut self.render_finished[image], false);
        self.check(FailPoint::Present)?;
        if !signaled {
            return Err(RhiError::SwapchainError(format!(
                "present of image {} waits on an unsignaled semaphore",
                image
            )));
        }
        self.counters.presents += 1;
        Ok(self
            .present_script
            .pop_front()
            .unwrap_or(PresentStatus::Optimal))
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.counters.resizes += 1;
        self.extent = (width, height);
        self.next_image = 0;
        self.render_finished = vec![false; self.image_count as usize];
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        self.counters.idle_waits += 1;
        Ok(())
    }

    fn backbuffer_format(&self) -> Format {
        self.format
    }

    fn backbuffer_depth_format(&self) -> Option<Format> {
        Some(Format::Depth32Float)
    }

    fn backbuffer_extent(&self) -> (u32, u32) {
        self.extent
    }

    fn cmd_begin_rendering(
        &mut self,
        _frame: &HeadlessFrame,
        target: RenderTarget<'_, Self>,
        clear: Option<[f32; 4]>,
    ) -> RhiResult<()> {
        self.check(FailPoint::BeginRendering)?;
        let target = match target {
            RenderTarget::Backbuffer => TargetRecord::Backbuffer,
            RenderTarget::Offscreen { colors, depth, .. } => TargetRecord::Offscreen {
                colors: colors.iter().map(|image| image.id).collect(),
                depth: depth.map(|image| image.id),
            },
        };
        self.record(Command::BeginRendering { target, clear });
        Ok(())
    }

    fn cmd_end_rendering(&mut self, _frame: &HeadlessFrame) {
        self.record(Command::EndRendering);
    }

    fn cmd_bind_pipeline(&mut self, _frame: &HeadlessFrame, pipeline: &HeadlessPipeline) {
        self.record(Command::BindPipeline {
            pipeline: pipeline.id,
        });
    }

    fn cmd_bind_vertex_buffer(&mut self, _frame: &HeadlessFrame, buffer: &HeadlessBuffer, offset: u64) {
        self.record(Command::BindVertexBuffer {
            buffer: buffer.id,
            offset,
        });
    }

    fn cmd_bind_index_buffer(
        &mut self,
        _frame: &HeadlessFrame,
        buffer: &HeadlessBuffer,
        offset: u64,
        index_type: IndexType,
    ) {
        self.record(Command::BindIndexBuffer {
            buffer: buffer.id,
            offset,
            index_type,
        });
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        _frame: &HeadlessFrame,
        _layout: &HeadlessProgramLayout,
        set_index: u32,
        set: HeadlessSet,
    ) {
        self.record(Command::BindDescriptorSet { set_index, set });
    }

    fn cmd_draw(
        &mut self,
        _frame: &HeadlessFrame,
        vertex_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.record(Command::Draw {
            vertex_count,
            first_vertex,
            first_instance,
        });
    }

    fn cmd_draw_indexed(
        &mut self,
        _frame: &HeadlessFrame,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record(Command::DrawIndexed {
            index_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    fn cmd_copy_buffer(
        &mut self,
        _frame: &HeadlessFrame,
        src: &HeadlessBuffer,
        dst: &HeadlessBuffer,
        region: BufferCopyRegion,
    ) {
        let src_start = region.src_offset as usize;
        let dst_start = region.dst_offset as usize;
        let len = region.size as usize;
        let data = self
            .buffers
            .get(&src.id)
            .and_then(|bytes| bytes.get(src_start..src_start + len))
            .map(<[u8]>::to_vec);
        if let (Some(data), Some(bytes)) = (data, self.buffers.get_mut(&dst.id))
            && let Some(target) = bytes.get_mut(dst_start..dst_start + len)
        {
            target.copy_from_slice(&data);
        }
        self.record(Command::CopyBuffer {
            src: src.id,
            dst: dst.id,
            region,
        });
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        _frame: &HeadlessFrame,
        src: &HeadlessBuffer,
        src_offset: u64,
        dst: &HeadlessImage,
    ) {
        let start = src_offset as usize;
        let len = dst.desc.width as usize
            * dst.desc.height as usize
            * dst.desc.format.texel_size() as usize;
        let data = self
            .buffers
            .get(&src.id)
            .and_then(|bytes| bytes.get(start..start + len))
            .map(<[u8]>::to_vec);
        if let (Some(data), Some(texels)) = (data, self.images.get_mut(&dst.id)) {
            texels.copy_from_slice(&data);
        }
        self.record(Command::CopyBufferToImage {
            src: src.id,
            src_offset,
            dst: dst.id,
        });
    }

    fn cmd_buffer_barrier(
        &mut self,
        _frame: &HeadlessFrame,
        buffer: &HeadlessBuffer,
        _region: (u64, u64),
        usage: BufferUsage,
        barrier: TransferBarrier,
    ) {
        self.record(Command::BufferBarrier {
            buffer: buffer.id,
            usage,
            barrier,
        });
    }

    fn cmd_image_barrier(
        &mut self,
        _frame: &HeadlessFrame,
        image: &HeadlessImage,
        old: ImageLayout,
        new: ImageLayout,
    ) {
        self.record(Command::ImageBarrier {
            image: image.id,
            old,
            new,
        });
    }

    fn cmd_prepare_present(&mut self, _frame: &HeadlessFrame) {
        self.record(Command::PreparePresent);
    }
}
