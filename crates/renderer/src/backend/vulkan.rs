//! Vulkan implementation of [`Backend`] on top of `framekit-rhi`.
//!
//! Owns the instance, surface, device, swapchain and the backbuffer depth
//! image. Passes use dynamic rendering; the backbuffer and its depth image
//! have their layouts tracked here, every other image is transitioned by
//! the engine through [`Backend::cmd_image_barrier`].

use std::cell::Cell;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use framekit_core::RendererConfig;
use framekit_platform::{Surface, Window};
use framekit_rhi::buffer::{Buffer, BufferUsage, IndexType, pre_transfer_barrier, transfer_barrier};
use framekit_rhi::command::{CommandBuffer, CommandPool};
use framekit_rhi::descriptor::{
    DescriptorBindingLayout, DescriptorPool, DescriptorSetLayout, DescriptorType,
    ShaderVisibility, buffer_info, image_info, update_descriptor_sets,
};
use framekit_rhi::device::Device;
use framekit_rhi::image::{DEFAULT_DEPTH_FORMAT, Format, Image, ImageLayout, ImageUsage, image_barrier};
use framekit_rhi::instance::Instance;
use framekit_rhi::physical_device::select_physical_device;
use framekit_rhi::pipeline::{GraphicsPipelineBuilder, Pipeline, PipelineLayout};
use framekit_rhi::rendering::PassAttachments;
use framekit_rhi::sampler::{Sampler, SamplerDesc};
use framekit_rhi::shader::{Shader, ShaderStage};
use framekit_rhi::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use framekit_rhi::sync::{FrameSync, PresentSemaphores};
use framekit_rhi::{RhiError, RhiResult};

use super::{
    Acquire, Backend, BufferCopyRegion, BufferDesc, DescriptorResource, DescriptorWrite,
    ImageDesc, PipelineDesc, PresentStatus, RenderTarget, TransferBarrier,
};
use crate::MAX_FRAMES_IN_FLIGHT;
use crate::error::RenderResult;

const SHADER_ENTRY_POINT: &str = "main";

/// Pipeline layout of a program and the set layouts of its user slots.
pub struct VulkanProgramLayout {
    layout: PipelineLayout,
    slot_layouts: Vec<DescriptorSetLayout>,
}

/// Command buffer and synchronization of one frame in flight.
pub struct VulkanFrame {
    command_buffer: CommandBuffer,
    sync: FrameSync,
    /// Recording was closed by `end_commands`
    executable: Cell<bool>,
    /// The fence was armed by a submission nobody has waited for yet
    pending: Cell<bool>,
}

/// [`Backend`] on Vulkan 1.3 with dynamic rendering and synchronization2.
///
/// Renders into a swapchain on the window's surface plus a depth image
/// matching its extent. All submissions go to the graphics queue.
///
/// Fields are declared in destruction order: everything created from the
/// device goes first, then the swapchain, device, surface and instance.
pub struct VulkanBackend {
    command_pool: CommandPool,
    descriptor_pool: DescriptorPool,
    transform_layout: DescriptorSetLayout,
    depth: Image,
    /// Render-complete semaphore of every swapchain image
    render_finished: PresentSemaphores,
    swapchain: Swapchain,
    device: Arc<Device>,
    surface: Surface,
    instance: Instance,

    backbuffer_format: Format,
    current_image: u32,
    backbuffer_layout: ImageLayout,
    depth_layout: ImageLayout,
}

impl VulkanBackend {
    /// Brings up instance, surface, device and swapchain for `window`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Platform`](crate::RenderError::Platform) if the
    /// window cannot provide a surface, and
    /// [`RenderError::Backend`](crate::RenderError::Backend) when no GPU can
    /// present to it or any Vulkan object fails to create.
    pub fn new(window: &Window, config: &RendererConfig) -> RenderResult<Self> {
        let (width, height) = (window.width(), window.height());
        info!("Initializing Vulkan backend ({}x{})", width, height);

        let extensions = window.required_extensions()?;
        let instance = Instance::new(config.enable_validation, &extensions)?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;

        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let physical_device =
            select_physical_device(instance.handle(), surface.handle(), &surface_loader)?;
        let device = Device::new(&instance, &physical_device)?;

        let swapchain = Swapchain::new(
            &instance,
            device.clone(),
            surface.handle(),
            width,
            height,
            config.vsync,
        )?;
        let backbuffer_format = surface_format(&swapchain)?;
        let depth = create_depth(&device, &swapchain)?;
        let render_finished =
            PresentSemaphores::new(device.clone(), swapchain.image_count() as usize)?;

        let graphics_family = device
            .queue_families()
            .graphics_family
            .ok_or(RhiError::NoSuitableGpu)?;
        let command_pool = CommandPool::new(device.clone(), graphics_family)?;

        let max_sets = (config.max_descriptor_sets + MAX_FRAMES_IN_FLIGHT) as u32;
        let descriptor_pool =
            DescriptorPool::new(device.clone(), max_sets, config.max_bindings_per_set as u32)?;
        let transform_layout = DescriptorSetLayout::new(
            device.clone(),
            &[DescriptorBindingLayout::new(
                0,
                DescriptorType::StorageBuffer,
                ShaderVisibility::Vertex,
            )],
        )?;

        info!(
            "Vulkan backend ready: {} swapchain images, {:?}, {} descriptor sets",
            swapchain.image_count(),
            backbuffer_format,
            max_sets
        );

        Ok(Self {
            command_pool,
            descriptor_pool,
            transform_layout,
            depth,
            render_finished,
            swapchain,
            device,
            surface,
            instance,
            backbuffer_format,
            current_image: 0,
            backbuffer_layout: ImageLayout::Undefined,
            depth_layout: ImageLayout::Undefined,
        })
    }

    /// The logical device, for callers that need raw Vulkan access.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn backbuffer(&self) -> RhiResult<(vk::Image, vk::ImageView)> {
        let image = self.swapchain.image(self.current_image);
        let view = self.swapchain.image_view(self.current_image);
        image.zip(view).ok_or_else(|| {
            RhiError::SwapchainError(format!("no swapchain image {}", self.current_image))
        })
    }

    fn transition_to_present(&mut self, cmd: &CommandBuffer) -> RhiResult<()> {
        let (image, _) = self.backbuffer()?;
        cmd.pipeline_barrier(
            &[],
            &[image_barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                self.backbuffer_layout,
                ImageLayout::Present,
            )],
        );
        self.backbuffer_layout = ImageLayout::Present;
        Ok(())
    }

    /// Re-records `frame` with nothing but the move of the acquired image
    /// to the presentation layout.
    fn record_present_only(&mut self, frame: &VulkanFrame) -> RhiResult<()> {
        let cmd = &frame.command_buffer;
        cmd.reset()?;
        cmd.begin()?;
        self.backbuffer_layout = ImageLayout::Undefined;
        self.transition_to_present(cmd)?;
        cmd.end()?;
        frame.executable.set(true);
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle: {}", e);
        }
        debug!("Vulkan backend destroyed");
    }
}

fn surface_format(swapchain: &Swapchain) -> RhiResult<Format> {
    Format::from_vk(swapchain.format()).ok_or_else(|| {
        RhiError::SwapchainError(format!(
            "unsupported surface format {:?}",
            swapchain.format()
        ))
    })
}

fn create_depth(device: &Arc<Device>, swapchain: &Swapchain) -> RhiResult<Image> {
    let extent = swapchain.extent();
    Image::new(
        device.clone(),
        extent.width,
        extent.height,
        DEFAULT_DEPTH_FORMAT,
        ImageUsage::Attachment,
    )
}

fn to_present_status(outcome: PresentOutcome) -> PresentStatus {
    match outcome {
        PresentOutcome::Optimal => PresentStatus::Optimal,
        PresentOutcome::Suboptimal => PresentStatus::Suboptimal,
        PresentOutcome::OutOfDate => PresentStatus::OutOfDate,
    }
}

impl Backend for VulkanBackend {
    type Buffer = Buffer;
    type Image = Image;
    type Sampler = Sampler;
    type Shader = Shader;
    type ProgramLayout = VulkanProgramLayout;
    type Pipeline = Pipeline;
    type DescriptorSet = vk::DescriptorSet;
    type Frame = VulkanFrame;

    fn create_buffer(&mut self, desc: &BufferDesc) -> RhiResult<Buffer> {
        Buffer::new(self.device.clone(), desc.usage, desc.size, desc.host_visible)
    }

    fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        buffer.write_data(offset, data)
    }

    fn destroy_buffer(&mut self, buffer: Buffer) {
        drop(buffer);
    }

    fn create_image(&mut self, desc: &ImageDesc) -> RhiResult<Image> {
        Image::new(
            self.device.clone(),
            desc.width,
            desc.height,
            desc.format,
            desc.usage,
        )
    }

    fn destroy_image(&mut self, image: Image) {
        drop(image);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> RhiResult<Sampler> {
        Sampler::new(self.device.clone(), desc)
    }

    fn destroy_sampler(&mut self, sampler: Sampler) {
        drop(sampler);
    }

    fn create_shader(&mut self, stage: ShaderStage, spirv: &[u8]) -> RhiResult<Shader> {
        Shader::from_spirv_bytes(self.device.clone(), spirv, stage, SHADER_ENTRY_POINT)
    }

    fn destroy_shader(&mut self, shader: Shader) {
        drop(shader);
    }

    fn create_program_layout(
        &mut self,
        slots: &[Vec<DescriptorBindingLayout>],
    ) -> RhiResult<VulkanProgramLayout> {
        let slot_layouts = slots
            .iter()
            .map(|bindings| DescriptorSetLayout::new(self.device.clone(), bindings))
            .collect::<RhiResult<Vec<_>>>()?;

        let set_layouts: Vec<_> = std::iter::once(self.transform_layout.handle())
            .chain(slot_layouts.iter().map(DescriptorSetLayout::handle))
            .collect();
        let layout = PipelineLayout::new(self.device.clone(), &set_layouts)?;

        Ok(VulkanProgramLayout {
            layout,
            slot_layouts,
        })
    }

    fn destroy_program_layout(&mut self, layout: VulkanProgramLayout) {
        drop(layout);
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_, Self>) -> RhiResult<Pipeline> {
        let color_formats: Vec<_> = desc.color_formats.iter().map(|f| f.to_vk()).collect();
        let mut builder = GraphicsPipelineBuilder::new()
            .vertex_shader(desc.vertex_shader)
            .fragment_shader(desc.fragment_shader)
            .state(desc.state)
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(desc.depth_format.map(Format::to_vk));
        if let Some(vertex_layout) = desc.vertex_layout {
            builder = builder.vertex_layout(vertex_layout);
        }
        builder.build(self.device.clone(), &desc.layout.layout)
    }

    fn destroy_pipeline(&mut self, pipeline: Pipeline) {
        drop(pipeline);
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: &VulkanProgramLayout,
        slot: usize,
    ) -> RhiResult<vk::DescriptorSet> {
        let set_layout = layout.slot_layouts.get(slot).ok_or_else(|| {
            RhiError::DescriptorError(format!("layout has no descriptor slot {}", slot))
        })?;
        self.descriptor_pool.allocate(set_layout.handle())
    }

    fn write_descriptor_set(
        &mut self,
        set: vk::DescriptorSet,
        writes: &[DescriptorWrite<'_, Self>],
    ) -> RhiResult<()> {
        enum Info {
            Buffer(vk::DescriptorBufferInfo, vk::DescriptorType),
            Image(vk::DescriptorImageInfo),
        }

        let infos: Vec<Info> = writes
            .iter()
            .map(|write| match write.resource {
                DescriptorResource::UniformBuffer(buffer) => Info::Buffer(
                    buffer_info(buffer.handle(), 0, vk::WHOLE_SIZE),
                    vk::DescriptorType::UNIFORM_BUFFER,
                ),
                DescriptorResource::StorageBuffer(buffer) => Info::Buffer(
                    buffer_info(buffer.handle(), 0, vk::WHOLE_SIZE),
                    vk::DescriptorType::STORAGE_BUFFER,
                ),
                DescriptorResource::Texture { image, sampler } => Info::Image(image_info(
                    sampler.handle(),
                    image.view(),
                    ImageLayout::ShaderRead.to_vk(),
                )),
            })
            .collect();

        let vk_writes: Vec<_> = writes
            .iter()
            .zip(&infos)
            .map(|(write, info)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding);
                match info {
                    Info::Buffer(info, ty) => base
                        .descriptor_type(*ty)
                        .buffer_info(std::slice::from_ref(info)),
                    Info::Image(info) => base
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(info)),
                }
            })
            .collect();

        update_descriptor_sets(&self.device, &vk_writes);
        Ok(())
    }

    fn create_transform_set(&mut self, buffer: &Buffer) -> RhiResult<vk::DescriptorSet> {
        let set = self
            .descriptor_pool
            .allocate(self.transform_layout.handle())?;
        let info = buffer_info(buffer.handle(), 0, vk::WHOLE_SIZE);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&info));
        update_descriptor_sets(&self.device, &[write]);
        Ok(set)
    }

    fn free_descriptor_set(&mut self, set: vk::DescriptorSet) {
        if let Err(e) = self.descriptor_pool.free(set) {
            tracing::error!("Failed to free descriptor set: {}", e);
        }
    }

    fn create_frame(&mut self) -> RhiResult<VulkanFrame> {
        Ok(VulkanFrame {
            command_buffer: CommandBuffer::new(self.device.clone(), &self.command_pool)?,
            sync: FrameSync::new(self.device.clone())?,
            executable: Cell::new(false),
            pending: Cell::new(false),
        })
    }

    fn destroy_frame(&mut self, frame: VulkanFrame) {
        drop(frame);
    }

    fn wait_for_frame(&mut self, frame: &VulkanFrame) -> RhiResult<()> {
        if frame.pending.get() {
            frame.sync.in_flight().wait(u64::MAX)?;
            frame.pending.set(false);
        }
        Ok(())
    }

    fn acquire_image(&mut self, frame: &VulkanFrame) -> RhiResult<Acquire> {
        match self
            .swapchain
            .acquire_next_image(frame.sync.image_available().handle())?
        {
            AcquireOutcome::Image { index, suboptimal } => {
                if suboptimal {
                    debug!("Acquired suboptimal swapchain image {}", index);
                }
                self.current_image = index;
                Ok(Acquire::Image(index))
            }
            AcquireOutcome::OutOfDate => Ok(Acquire::OutOfDate),
        }
    }

    fn reset_frame(&mut self, frame: &VulkanFrame) -> RhiResult<()> {
        frame.executable.set(false);
        frame.command_buffer.reset()
    }

    fn begin_commands(&mut self, frame: &VulkanFrame) -> RhiResult<()> {
        frame.executable.set(false);
        self.backbuffer_layout = ImageLayout::Undefined;
        self.depth_layout = ImageLayout::Undefined;
        frame.command_buffer.begin()
    }

    fn end_commands(&mut self, frame: &VulkanFrame) -> RhiResult<()> {
        frame.command_buffer.end()?;
        frame.executable.set(true);
        Ok(())
    }

    fn submit(&mut self, frame: &VulkanFrame) -> RhiResult<()> {
        if !frame.executable.get()
            && let Err(e) = self.record_present_only(frame)
        {
            warn!("Submitting frame without commands: {}", e);
        }

        let wait = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.sync.image_available().handle())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
        let signal = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.render_finished.get(self.current_image)?.handle())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let command_buffers =
            [vk::CommandBufferSubmitInfo::default().command_buffer(frame.command_buffer.handle())];
        let command_buffers: &[_] = if frame.executable.get() {
            &command_buffers
        } else {
            &[]
        };
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait)
            .command_buffer_infos(command_buffers)
            .signal_semaphore_infos(&signal);

        // Reset only now: every earlier exit leaves the fence signaled.
        frame.sync.in_flight().reset()?;
        // SAFETY: the command buffer, if any, finished recording and the
        // semaphores and fence are not in use by another pending submission.
        unsafe {
            self.device
                .submit_graphics(&[submit], frame.sync.in_flight().handle())?
        };
        frame.executable.set(false);
        frame.pending.set(true);
        Ok(())
    }

    fn present(&mut self, _frame: &VulkanFrame) -> RhiResult<PresentStatus> {
        let outcome = self.swapchain.present(
            self.device.present_queue(),
            self.current_image,
            self.render_finished.get(self.current_image)?.handle(),
        )?;
        Ok(to_present_status(outcome))
    }

    fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.swapchain
            .recreate(&self.instance, self.surface.handle(), width, height)?;
        self.backbuffer_format = surface_format(&self.swapchain)?;
        self.depth = create_depth(&self.device, &self.swapchain)?;
        self.render_finished =
            PresentSemaphores::new(self.device.clone(), self.swapchain.image_count() as usize)?;
        Ok(())
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        self.device.wait_idle()
    }

    fn backbuffer_format(&self) -> Format {
        self.backbuffer_format
    }

    fn backbuffer_depth_format(&self) -> Option<Format> {
        Some(self.depth.format())
    }

    fn backbuffer_extent(&self) -> (u32, u32) {
        let extent = self.swapchain.extent();
        (extent.width, extent.height)
    }

    fn cmd_begin_rendering(
        &mut self,
        frame: &VulkanFrame,
        target: RenderTarget<'_, Self>,
        clear: Option<[f32; 4]>,
    ) -> RhiResult<()> {
        let cmd = &frame.command_buffer;
        let attachments = match target {
            RenderTarget::Backbuffer => {
                let (image, view) = self.backbuffer()?;
                cmd.pipeline_barrier(
                    &[],
                    &[
                        image_barrier(
                            image,
                            vk::ImageAspectFlags::COLOR,
                            self.backbuffer_layout,
                            ImageLayout::ColorAttachment,
                        ),
                        image_barrier(
                            self.depth.handle(),
                            self.depth.format().aspect(),
                            self.depth_layout,
                            ImageLayout::DepthAttachment,
                        ),
                    ],
                );
                self.backbuffer_layout = ImageLayout::ColorAttachment;
                self.depth_layout = ImageLayout::DepthAttachment;

                PassAttachments::new(self.swapchain.extent())
                    .with_color(view)
                    .with_depth(self.depth.view())
            }
            RenderTarget::Offscreen {
                colors,
                depth,
                extent: (width, height),
            } => {
                let attachments = PassAttachments::new(vk::Extent2D { width, height })
                    .with_colors(colors.iter().map(|image| image.view()));
                match depth {
                    Some(depth) => attachments.with_depth(depth.view()),
                    None => attachments,
                }
            }
        };

        let extent = attachments.extent();
        let bundle = attachments.with_optional_clear(clear).build();
        cmd.begin_rendering(&bundle.info());
        cmd.set_viewport_and_scissor(extent);
        Ok(())
    }

    fn cmd_end_rendering(&mut self, frame: &VulkanFrame) {
        frame.command_buffer.end_rendering();
    }

    fn cmd_bind_pipeline(&mut self, frame: &VulkanFrame, pipeline: &Pipeline) {
        frame
            .command_buffer
            .bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
    }

    fn cmd_bind_vertex_buffer(&mut self, frame: &VulkanFrame, buffer: &Buffer, offset: u64) {
        frame
            .command_buffer
            .bind_vertex_buffer(buffer.handle(), offset);
    }

    fn cmd_bind_index_buffer(
        &mut self,
        frame: &VulkanFrame,
        buffer: &Buffer,
        offset: u64,
        index_type: IndexType,
    ) {
        frame
            .command_buffer
            .bind_index_buffer(buffer.handle(), offset, index_type.to_vk());
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        frame: &VulkanFrame,
        layout: &VulkanProgramLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        frame
            .command_buffer
            .bind_descriptor_set(layout.layout.handle(), set_index, set);
    }

    fn cmd_draw(
        &mut self,
        frame: &VulkanFrame,
        vertex_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        frame
            .command_buffer
            .draw(vertex_count, first_vertex, first_instance);
    }

    fn cmd_draw_indexed(
        &mut self,
        frame: &VulkanFrame,
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        frame
            .command_buffer
            .draw_indexed(index_count, first_index, vertex_offset, first_instance);
    }

    fn cmd_copy_buffer(
        &mut self,
        frame: &VulkanFrame,
        src: &Buffer,
        dst: &Buffer,
        region: BufferCopyRegion,
    ) {
        let copy = vk::BufferCopy::default()
            .src_offset(region.src_offset)
            .dst_offset(region.dst_offset)
            .size(region.size);
        frame
            .command_buffer
            .copy_buffer(src.handle(), dst.handle(), &[copy]);
    }

    fn cmd_copy_buffer_to_image(
        &mut self,
        frame: &VulkanFrame,
        src: &Buffer,
        src_offset: u64,
        dst: &Image,
    ) {
        let extent = dst.extent();
        let copy = vk::BufferImageCopy::default()
            .buffer_offset(src_offset)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(dst.format().aspect())
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        frame
            .command_buffer
            .copy_buffer_to_image(src.handle(), dst.handle(), &[copy]);
    }

    fn cmd_buffer_barrier(
        &mut self,
        frame: &VulkanFrame,
        buffer: &Buffer,
        (offset, size): (u64, u64),
        usage: BufferUsage,
        barrier: TransferBarrier,
    ) {
        let barrier = match barrier {
            TransferBarrier::BeforeWrite => pre_transfer_barrier(buffer.handle(), offset, size, usage),
            TransferBarrier::AfterWrite => transfer_barrier(buffer.handle(), offset, size, usage),
        };
        frame.command_buffer.pipeline_barrier(&[barrier], &[]);
    }

    fn cmd_image_barrier(
        &mut self,
        frame: &VulkanFrame,
        image: &Image,
        old: ImageLayout,
        new: ImageLayout,
    ) {
        frame.command_buffer.pipeline_barrier(
            &[],
            &[image_barrier(image.handle(), image.format().aspect(), old, new)],
        );
    }

    fn cmd_prepare_present(&mut self, frame: &VulkanFrame) {
        if let Err(e) = self.transition_to_present(&frame.command_buffer) {
            tracing::error!("Cannot prepare backbuffer for present: {}", e);
        }
    }
}
