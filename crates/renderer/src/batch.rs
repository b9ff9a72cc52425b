//! Execution of the sorted draw list.
//!
//! Draws arrive sorted, so every view is one contiguous run. Each run is
//! recorded as a single rendering pass:
//!
//! 1. images the run samples are moved to the shader-read layout and the
//!    target's attachments to their attachment layouts;
//! 2. the pass is opened on the view's target with its clear policy;
//! 3. draws are recorded, re-binding the pipeline only when the program or
//!    vertex layout changes and vertex/index buffers and descriptor sets
//!    only when they differ from the previous draw.
//!
//! A draw that references a destroyed resource, or whose pipeline or
//! descriptor set cannot be built, is skipped with a warning. A view whose
//! pass cannot be opened has all of its draws skipped and no pass recorded.
//! The rest of the frame is still recorded.

use tracing::{debug, trace, warn};

use framekit_rhi::image::{Format, ImageLayout};

use crate::backend::{Backend, DescriptorResource, DescriptorWrite, PipelineDesc, RenderTarget};
use crate::descriptor_cache::{DescriptorCache, DescriptorSetKey};
use crate::draw::{DrawCommand, IndexSource, VertexSource, ViewId, ViewTarget, Views};
use crate::error::{RenderError, RenderResult};
use crate::handle::{DescriptorHandle, FramebufferHandle, ImageHandle, ProgramHandle};
use crate::pipeline_cache::{LayoutId, PipelineCache, PipelineKey};
use crate::resources::{DescriptorSource, Resources};
use crate::ring::{TransientPool, TransientPools};
use crate::stats::FrameStats;

/// Attachment formats of the pass being recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PassFormats {
    colors: Vec<Format>,
    depth: Option<Format>,
}

/// State last issued to the command buffer inside the current pass.
struct Bound<B: Backend> {
    pipeline: Option<(ProgramHandle, Option<LayoutId>)>,
    sets: Vec<Option<B::DescriptorSet>>,
    vertex: Option<VertexSource>,
    index: Option<IndexSource>,
}

impl<B: Backend> Bound<B> {
    fn new() -> Self {
        Self {
            pipeline: None,
            sets: Vec::new(),
            vertex: None,
            index: None,
        }
    }
}

/// Everything the executor borrows from the render context for one frame.
pub(crate) struct BatchContext<'a, B: Backend> {
    pub backend: &'a mut B,
    pub frame: &'a B::Frame,
    pub transform_set: B::DescriptorSet,
    pub resources: &'a mut Resources<B>,
    pub views: &'a Views,
    pub pipelines: &'a mut PipelineCache<B::Pipeline>,
    pub descriptors: &'a mut DescriptorCache<B::DescriptorSet>,
    pub transients: &'a TransientPools<B>,
    pub stats: &'a mut FrameStats,
}

impl<B: Backend> BatchContext<'_, B> {
    /// Records `draws`, which must be sorted by key.
    pub fn execute(&mut self, draws: &[DrawCommand]) -> RenderResult<()> {
        let mut start = 0;
        while start < draws.len() {
            let view = draws[start].view;
            let len = draws[start..]
                .iter()
                .position(|draw| draw.view != view)
                .unwrap_or(draws.len() - start);
            self.execute_view(view, &draws[start..start + len])?;
            start += len;
        }
        Ok(())
    }

    fn execute_view(&mut self, view: ViewId, run: &[DrawCommand]) -> RenderResult<()> {
        let target = *self.views.get(view);
        let formats = match self.pass_formats(&target) {
            Ok(formats) => formats,
            Err(e) => {
                warn!("Skipping {} draws of view {}: {}", run.len(), view, e);
                self.stats.draws_skipped += run.len() as u32;
                return Ok(());
            }
        };

        self.prepare_images(run, target.framebuffer);
        if let Err(e) = self.begin_pass(&target) {
            warn!("Cannot open pass of view {}, skipping {} draws: {}", view, run.len(), e);
            self.stats.draws_skipped += run.len() as u32;
            return Ok(());
        }
        trace!(view, draws = run.len(), "begin pass");

        let mut bound = Bound::new();
        let mut result = Ok(());
        for draw in run {
            match self.execute_draw(draw, &formats, &mut bound) {
                Ok(()) => self.stats.draws_executed += 1,
                Err(e) if e.skips_draw() => {
                    warn!("Skipping draw {} of view {}: {}", draw.sequence, view, e);
                    self.stats.draws_skipped += 1;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.backend.cmd_end_rendering(self.frame);
        self.stats.render_passes += 1;
        result
    }

    fn pass_formats(&self, target: &ViewTarget) -> RenderResult<PassFormats> {
        let Some(framebuffer) = target.framebuffer else {
            return Ok(PassFormats {
                colors: vec![self.backend.backbuffer_format()],
                depth: self.backend.backbuffer_depth_format(),
            });
        };
        let entry = self.resources.framebuffers.get(framebuffer)?;
        for &image in entry.colors.iter().chain(entry.depth.iter()) {
            self.resources.images.get(image)?;
        }
        Ok(PassFormats {
            colors: entry.color_formats.clone(),
            depth: entry.depth_format,
        })
    }

    /// Barrier pre-pass for one run of draws.
    fn prepare_images(&mut self, run: &[DrawCommand], framebuffer: Option<FramebufferHandle>) {
        let mut sampled: Vec<ImageHandle> = Vec::new();
        for descriptor in run.iter().flat_map(DrawCommand::descriptors) {
            if let Some(image) = self.resources.sampled_image(descriptor)
                && !sampled.contains(&image)
            {
                sampled.push(image);
            }
        }
        for image in sampled {
            self.transition(image, ImageLayout::ShaderRead);
        }

        let Some(entry) = framebuffer.and_then(|fb| self.resources.framebuffers.find(fb)) else {
            return;
        };
        let colors = entry.colors.clone();
        let depth = entry.depth;
        for image in colors {
            self.transition(image, ImageLayout::ColorAttachment);
        }
        if let Some(image) = depth {
            self.transition(image, ImageLayout::DepthAttachment);
        }
    }

    fn transition(&mut self, image: ImageHandle, layout: ImageLayout) {
        let Some(entry) = self.resources.images.find_mut(image) else {
            return;
        };
        if entry.layout != layout {
            self.backend
                .cmd_image_barrier(self.frame, &entry.image, entry.layout, layout);
            entry.layout = layout;
        }
    }

    fn begin_pass(&mut self, target: &ViewTarget) -> RenderResult<()> {
        let clear = target.clear();
        let Some(framebuffer) = target.framebuffer else {
            self.backend
                .cmd_begin_rendering(self.frame, RenderTarget::Backbuffer, clear)?;
            return Ok(());
        };

        let resources = &*self.resources;
        let entry = resources.framebuffers.get(framebuffer)?;
        let colors = entry
            .colors
            .iter()
            .map(|&image| resources.images.get(image).map(|e| &e.image))
            .collect::<RenderResult<Vec<_>>>()?;
        let depth = match entry.depth {
            Some(image) => Some(&resources.images.get(image)?.image),
            None => None,
        };
        self.backend.cmd_begin_rendering(
            self.frame,
            RenderTarget::Offscreen {
                colors: &colors,
                depth,
                extent: entry.extent,
            },
            clear,
        )?;
        Ok(())
    }

    fn execute_draw(
        &mut self,
        draw: &DrawCommand,
        formats: &PassFormats,
        bound: &mut Bound<B>,
    ) -> RenderResult<()> {
        let resources = &*self.resources;
        let backend = &mut *self.backend;
        let frame = self.frame;

        let program = draw
            .program
            .ok_or_else(|| RenderError::InvalidArgument("draw has no program".into()))?;
        let entry = resources.programs.get(program)?;

        // Resolve everything the draw reads before recording anything.
        let (vertex_layout, vertex_count) = match draw.vertex {
            VertexSource::None => (None, None),
            VertexSource::Buffer(handle) => {
                let vb = resources.vertex_buffers.get(handle)?;
                (Some(vb.layout), Some(vb.vertex_count()))
            }
            VertexSource::Transient(tvb) => (Some(tvb.layout), Some(tvb.vertex_count)),
        };
        let index_count = match draw.index {
            IndexSource::None => None,
            IndexSource::Buffer(handle) => Some(resources.index_buffers.get(handle)?.index_count()),
            IndexSource::Transient(tib) => Some(tib.index_count),
        };
        let count = draw
            .vertex_count
            .or(index_count)
            .or(vertex_count)
            .ok_or_else(|| {
                RenderError::InvalidArgument("draw has no vertex source or vertex count".into())
            })?;
        for (slot, _) in draw.bound_slots() {
            if slot >= entry.slots.len() {
                return Err(RenderError::InvalidArgument(format!(
                    "descriptor slot {} not declared by program {:?}",
                    slot, program
                )));
            }
        }

        if bound.pipeline != Some((program, vertex_layout)) {
            let vertex_shader = &resources.shaders.get(entry.vertex)?.shader;
            let fragment_shader = &resources.shaders.get(entry.fragment)?.shader;
            let key = PipelineKey {
                program,
                vertex_layout,
                color_formats: formats.colors.clone(),
                depth_format: formats.depth,
            };
            let (pipeline, created) = self.pipelines.get_or_try_insert_with(key, |layout| {
                backend.create_pipeline(&PipelineDesc {
                    vertex_shader,
                    fragment_shader,
                    layout: &entry.layout,
                    vertex_layout: layout,
                    state: entry.state,
                    color_formats: &formats.colors,
                    depth_format: formats.depth,
                })
            })?;
            if created {
                debug!("Built pipeline for program {:?} ({:?})", program, formats.colors);
                self.stats.pipelines_created += 1;
            }
            backend.cmd_bind_pipeline(frame, pipeline);
            backend.cmd_bind_descriptor_set(frame, &entry.layout, 0, self.transform_set);
            self.stats.pipeline_binds += 1;
            bound.pipeline = Some((program, vertex_layout));
            bound.sets.clear();
        }

        for (slot, handles) in draw.bound_slots() {
            let key = DescriptorSetKey {
                program,
                slot,
                descriptors: handles.to_vec(),
            };
            let (set, hit) = self.descriptors.get_or_try_insert_with(key, || {
                allocate_set(backend, resources, &entry.layout, slot, handles)
            })?;
            if hit {
                self.stats.descriptor_cache_hits += 1;
            } else {
                self.stats.descriptor_cache_misses += 1;
            }

            if bound.sets.len() <= slot {
                bound.sets.resize(slot + 1, None);
            }
            if bound.sets[slot] != Some(set) {
                backend.cmd_bind_descriptor_set(frame, &entry.layout, slot as u32 + 1, set);
                bound.sets[slot] = Some(set);
                self.stats.descriptor_binds += 1;
            }
        }

        if bound.vertex != Some(draw.vertex) {
            match draw.vertex {
                VertexSource::None => {}
                VertexSource::Buffer(handle) => {
                    let vb = resources.vertex_buffers.get(handle)?;
                    backend.cmd_bind_vertex_buffer(frame, &vb.buffer.buffer, 0);
                    self.stats.vertex_binds += 1;
                }
                VertexSource::Transient(tvb) => {
                    let buffer = self.transients.buffer(TransientPool::Vertex);
                    backend.cmd_bind_vertex_buffer(frame, buffer, tvb.allocation.offset);
                    self.stats.vertex_binds += 1;
                }
            }
            bound.vertex = Some(draw.vertex);
        }

        if bound.index != Some(draw.index) {
            match draw.index {
                IndexSource::None => {}
                IndexSource::Buffer(handle) => {
                    let ib = resources.index_buffers.get(handle)?;
                    backend.cmd_bind_index_buffer(frame, &ib.buffer.buffer, 0, ib.index_type);
                    self.stats.index_binds += 1;
                }
                IndexSource::Transient(tib) => {
                    let buffer = self.transients.buffer(TransientPool::Index);
                    backend.cmd_bind_index_buffer(
                        frame,
                        buffer,
                        tib.allocation.offset,
                        tib.index_type,
                    );
                    self.stats.index_binds += 1;
                }
            }
            bound.index = Some(draw.index);
        }

        if matches!(draw.index, IndexSource::None) {
            backend.cmd_draw(frame, count, 0, draw.sequence);
        } else {
            backend.cmd_draw_indexed(frame, count, 0, 0, draw.sequence);
        }
        Ok(())
    }
}

/// Allocates and writes a set for `handles` in `slot` of `layout`.
fn allocate_set<B: Backend>(
    backend: &mut B,
    resources: &Resources<B>,
    layout: &B::ProgramLayout,
    slot: usize,
    handles: &[DescriptorHandle],
) -> RenderResult<B::DescriptorSet> {
    let mut writes = Vec::with_capacity(handles.len());
    for &handle in handles {
        let descriptor = resources.descriptors.get(handle)?;
        let resource = match descriptor.source {
            DescriptorSource::UniformBuffer(h) => {
                DescriptorResource::UniformBuffer(&resources.uniform_buffers.get(h)?.buffer)
            }
            DescriptorSource::StorageBuffer(h) => {
                DescriptorResource::StorageBuffer(&resources.storage_buffers.get(h)?.buffer)
            }
            DescriptorSource::Texture(h) => {
                let texture = resources.textures.get(h)?;
                DescriptorResource::Texture {
                    image: &resources.images.get(texture.image)?.image,
                    sampler: &texture.sampler,
                }
            }
        };
        writes.push(DescriptorWrite {
            binding: descriptor.binding,
            resource,
        });
    }

    let set = backend.allocate_descriptor_set(layout, slot)?;
    if let Err(e) = backend.write_descriptor_set(set, &writes) {
        backend.free_descriptor_set(set);
        return Err(e.into());
    }
    Ok(set)
}
