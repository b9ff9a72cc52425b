//! Resource lifetime, uploads and capacity limits against the headless backend.

mod common;

use framekit_renderer::backend::ImageDesc;
use framekit_renderer::backend::headless::Command;
use framekit_renderer::{
    DescriptorSource, FrameStatus, ProgramDesc, RenderError, RingError, TextureDesc,
};
use framekit_rhi::buffer::IndexType;
use framekit_rhi::descriptor::{DescriptorBindingLayout, DescriptorType, ShaderVisibility};
use framekit_rhi::image::{Format, ImageUsage};
use framekit_rhi::sampler::SamplerDesc;

#[test]
fn test_create_find_destroy() {
    let mut ctx = common::context();
    let buffer = ctx
        .create_uniform_buffer(64)
        .expect("Failed to create uniform buffer");
    assert!(ctx.resources().uniform_buffers.find(buffer).is_some());

    ctx.destroy_uniform_buffer(buffer).unwrap();
    assert!(ctx.resources().uniform_buffers.find(buffer).is_none());
    assert!(matches!(
        ctx.destroy_uniform_buffer(buffer),
        Err(RenderError::InvalidHandle { .. })
    ));

    // The slot is reused with a new generation; the stale handle stays dead.
    let reused = ctx.create_uniform_buffer(64).unwrap();
    assert_eq!(reused.index(), buffer.index());
    assert_ne!(reused, buffer);
    assert!(ctx.resources().uniform_buffers.find(buffer).is_none());
    assert!(ctx.write_buffer(buffer, 0, &[0; 4]).is_err());
}

#[test]
fn test_binding_stale_handles_fails() {
    let mut ctx = common::context();
    let vb = ctx
        .create_vertex_buffer(&[0u8; 32], &common::vec4_layout())
        .unwrap();
    let program = common::program(&mut ctx);
    ctx.destroy_vertex_buffer(vb).unwrap();
    ctx.destroy_program(program).unwrap();

    assert!(matches!(
        ctx.bind_vertex_buffer(vb),
        Err(RenderError::InvalidHandle { kind: "vertex buffer", .. })
    ));
    assert!(matches!(
        ctx.submit(0, program),
        Err(RenderError::InvalidHandle { kind: "program", .. })
    ));
}

#[test]
fn test_device_local_update_goes_through_staging() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(1024, false).unwrap();
    let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();

    ctx.update_buffer(buffer, 0, &data)
        .expect("Failed to queue buffer update");
    assert_eq!(ctx.pending_uploads(), 1, "a copy must be queued");
    assert_eq!(ctx.transient_usage().staging, 1024, "data must be staged");

    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);
    assert_eq!(ctx.pending_uploads(), 0);
    assert_eq!(ctx.last_frame_stats().buffer_copies, 1);
    let native = ctx.native_buffer(buffer).unwrap();
    assert_eq!(ctx.backend().buffer_data(native), data.as_slice());
}

#[test]
fn test_staging_released_after_fence() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(256, false).unwrap();
    ctx.update_buffer(buffer, 0, &[7; 256]).unwrap();

    // Frame 1 carries the copy; its slot is waited on again by frame 3.
    ctx.frame().unwrap();
    assert_eq!(ctx.transient_usage().staging, 256, "copy may still be in flight");
    ctx.frame().unwrap();
    assert_eq!(ctx.transient_usage().staging, 256);
    ctx.frame().unwrap();
    assert_eq!(ctx.transient_usage().staging, 0);
    assert_eq!(ctx.last_frame_stats().released, 1);
}

#[test]
fn test_destroyed_objects_released_after_fence() {
    let mut ctx = common::context();
    let buffer = ctx.create_uniform_buffer(64).unwrap();
    let live = ctx.backend().live_objects().buffers;

    ctx.destroy_uniform_buffer(buffer).unwrap();
    assert_eq!(ctx.backend().live_objects().buffers, live, "release waits for the GPU");
    assert_eq!(ctx.pending_releases(), 1);

    ctx.frame().unwrap();
    ctx.frame().unwrap();
    assert_eq!(ctx.backend().live_objects().buffers, live);
    ctx.frame().unwrap();
    assert_eq!(ctx.backend().live_objects().buffers, live - 1);
    assert_eq!(ctx.pending_releases(), 0);
}

#[test]
fn test_host_visible_writes() {
    let mut ctx = common::context();
    let uniform = ctx.create_uniform_buffer(16).unwrap();
    let device_local = ctx.create_storage_buffer(16, false).unwrap();

    ctx.write_buffer(uniform, 4, &[1, 2, 3, 4]).unwrap();
    let native = ctx.native_buffer(uniform).unwrap();
    assert_eq!(&ctx.backend().buffer_data(native)[4..8], &[1, 2, 3, 4]);

    ctx.update_buffer(uniform, 0, &[9; 4]).unwrap();
    assert_eq!(ctx.pending_uploads(), 0, "host-visible updates are immediate");

    assert!(matches!(
        ctx.write_buffer(device_local, 0, &[0; 4]),
        Err(RenderError::NotHostVisible)
    ));
    assert!(matches!(
        ctx.update_buffer(uniform, 12, &[0; 8]),
        Err(RenderError::InvalidArgument(_))
    ));
}

#[test]
fn test_texture_upload() {
    let mut ctx = common::context();
    let image = ctx
        .create_image(ImageDesc {
            width: 4,
            height: 4,
            format: Format::Rgba8Unorm,
            usage: ImageUsage::Sampled,
        })
        .unwrap();
    let pixels = [200u8; 64];
    let texture = ctx
        .create_texture(TextureDesc {
            image,
            sampler: SamplerDesc::default(),
            data: Some(&pixels),
        })
        .expect("Failed to create texture");
    assert_eq!(ctx.pending_uploads(), 1);

    ctx.frame().unwrap();
    assert_eq!(ctx.last_frame_stats().image_copies, 1);
    let native = ctx.native_image(image).unwrap();
    assert_eq!(ctx.backend().image_data(native), &pixels);

    assert!(matches!(
        ctx.update_texture(texture, &[0; 10]),
        Err(RenderError::InvalidArgument(_))
    ));
}

#[test]
fn test_sampled_image_transitioned_before_pass() {
    let mut ctx = common::context();
    let image = ctx
        .create_image(ImageDesc {
            width: 2,
            height: 2,
            format: Format::Rgba8Unorm,
            usage: ImageUsage::Sampled,
        })
        .unwrap();
    let texture = ctx
        .create_texture(TextureDesc {
            image,
            sampler: SamplerDesc::default(),
            data: None,
        })
        .unwrap();
    let descriptor = ctx
        .create_descriptor(0, DescriptorSource::Texture(texture))
        .unwrap();
    let program = common::program_from(&mut ctx, |desc| {
        desc.with_slot(vec![DescriptorBindingLayout::new(
            0,
            DescriptorType::CombinedImageSampler,
            ShaderVisibility::Fragment,
        )])
    });

    ctx.bind_descriptor(0, descriptor).unwrap();
    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();

    let commands = ctx.backend().submitted_commands();
    let barrier = commands
        .iter()
        .position(|c| {
            matches!(
                c,
                Command::ImageBarrier {
                    new: framekit_rhi::image::ImageLayout::ShaderRead,
                    ..
                }
            )
        })
        .expect("sampled image was not transitioned");
    let pass = commands
        .iter()
        .position(|c| matches!(c, Command::BeginRendering { .. }))
        .unwrap();
    assert!(barrier < pass);
    assert_eq!(ctx.last_frame_stats().draws_executed, 1);
}

#[test]
fn test_descriptor_sets_are_deduplicated() {
    let mut ctx = common::context();
    let program = common::program_with_uniform_slot(&mut ctx);
    let ub = ctx.create_uniform_buffer(64).unwrap();
    let descriptor = ctx
        .create_descriptor(0, DescriptorSource::UniformBuffer(ub))
        .unwrap();

    for _ in 0..2 {
        ctx.bind_descriptor(0, descriptor).unwrap();
        ctx.set_vertex_count(3);
        ctx.submit(0, program).unwrap();
    }
    ctx.frame().unwrap();

    let stats = *ctx.last_frame_stats();
    assert_eq!(stats.descriptor_cache_misses, 1);
    assert_eq!(stats.descriptor_cache_hits, 1);
    assert_eq!(stats.descriptor_binds, 1, "identical set is not rebound");
    assert_eq!(ctx.backend().counters().descriptor_sets_allocated, 1);

    // Same handles next frame: served from the cache.
    ctx.bind_descriptor(0, descriptor).unwrap();
    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();
    assert_eq!(ctx.last_frame_stats().descriptor_cache_hits, 1);
    assert_eq!(ctx.last_frame_stats().descriptor_cache_misses, 0);

    // Different handles never alias.
    let other_ub = ctx.create_uniform_buffer(64).unwrap();
    let other = ctx
        .create_descriptor(0, DescriptorSource::UniformBuffer(other_ub))
        .unwrap();
    ctx.bind_descriptor(0, other).unwrap();
    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();
    assert_eq!(ctx.last_frame_stats().descriptor_cache_misses, 1);
    assert_eq!(ctx.descriptor_set_count(), 2);

    ctx.destroy_descriptor(descriptor).unwrap();
    assert_eq!(ctx.descriptor_set_count(), 1);
    ctx.destroy_uniform_buffer(other_ub).unwrap();
    assert_eq!(ctx.descriptor_set_count(), 0, "sets writing a destroyed buffer are evicted");
}

#[test]
fn test_destroying_program_evicts_its_objects() {
    let mut ctx = common::context();
    let program = common::program_with_uniform_slot(&mut ctx);
    let ub = ctx.create_uniform_buffer(64).unwrap();
    let descriptor = ctx
        .create_descriptor(0, DescriptorSource::UniformBuffer(ub))
        .unwrap();
    ctx.bind_descriptor(0, descriptor).unwrap();
    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();
    assert_eq!(ctx.pipeline_count(), 1);
    assert_eq!(ctx.descriptor_set_count(), 1);

    ctx.destroy_program(program).unwrap();
    assert_eq!(ctx.pipeline_count(), 0);
    assert_eq!(ctx.descriptor_set_count(), 0);
    assert_eq!(ctx.backend().live_objects().pipelines, 1, "retired until the fence");
}

#[test]
fn test_draw_capacity() {
    let mut ctx = common::context_with(common::config().with_max_draws(2));
    let program = common::program(&mut ctx);
    ctx.submit(0, program).unwrap();
    ctx.submit(0, program).unwrap();

    assert!(matches!(
        ctx.submit(0, program),
        Err(RenderError::CapacityExceeded { resource: "draws", limit: 2 })
    ));
}

#[test]
fn test_descriptor_slot_limits() {
    let mut ctx = common::context();
    let ub = ctx.create_uniform_buffer(16).unwrap();
    let descriptor = ctx
        .create_descriptor(0, DescriptorSource::UniformBuffer(ub))
        .unwrap();
    let slots = ctx.config().max_descriptor_slots;

    assert!(matches!(
        ctx.bind_descriptor(slots, descriptor),
        Err(RenderError::CapacityExceeded { resource: "descriptor slots", .. })
    ));

    let spirv = common::spirv_stub();
    let vs = ctx
        .create_shader(framekit_rhi::shader::ShaderStage::Vertex, &spirv)
        .unwrap();
    let fs = ctx
        .create_shader(framekit_rhi::shader::ShaderStage::Fragment, &spirv)
        .unwrap();
    let mut desc = ProgramDesc::new(vs, fs);
    for _ in 0..=slots {
        desc = desc.with_slot(Vec::new());
    }
    assert!(matches!(
        ctx.create_program(desc),
        Err(RenderError::CapacityExceeded { .. })
    ));
    assert!(matches!(
        ctx.create_program(ProgramDesc::new(fs, vs)),
        Err(RenderError::InvalidArgument(_))
    ));
}

#[test]
fn test_upload_capacity() {
    let mut ctx = common::context_with(common::config().with_copy_limits(1, 1));
    let buffer = ctx.create_storage_buffer(64, false).unwrap();
    ctx.update_buffer(buffer, 0, &[1; 16]).unwrap();

    assert!(matches!(
        ctx.update_buffer(buffer, 16, &[2; 16]),
        Err(RenderError::CapacityExceeded { resource: "buffer copies", limit: 1 })
    ));
    ctx.frame().unwrap();
    assert!(ctx.update_buffer(buffer, 16, &[2; 16]).is_ok());
}

#[test]
fn test_descriptor_set_capacity_skips_draw() {
    let mut ctx = common::context_with(common::config().with_max_descriptor_sets(1));
    let program = common::program_with_uniform_slot(&mut ctx);
    for _ in 0..2 {
        let ub = ctx.create_uniform_buffer(16).unwrap();
        let descriptor = ctx
            .create_descriptor(0, DescriptorSource::UniformBuffer(ub))
            .unwrap();
        ctx.bind_descriptor(0, descriptor).unwrap();
        ctx.set_vertex_count(3);
        ctx.submit(0, program).unwrap();
    }

    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);
    assert_eq!(ctx.last_frame_stats().draws_executed, 1);
    assert_eq!(ctx.last_frame_stats().draws_skipped, 1);
}

#[test]
fn test_transient_buffers_draw_from_the_rings() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx);
    let vertices = ctx
        .create_transient_vertex_buffer(&[0u8; 48], &common::vec4_layout())
        .unwrap();
    let indices = ctx
        .create_transient_index_buffer(&[0u8; 12], IndexType::U32)
        .unwrap();
    assert_eq!(vertices.vertex_count(), 3);
    assert_eq!(indices.index_count(), 3);

    ctx.bind_transient_vertex_buffer(vertices);
    ctx.bind_transient_index_buffer(indices);
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();

    let commands = ctx.backend().submitted_commands();
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::BindVertexBuffer { offset, .. } if *offset == vertices.allocation().offset
    )));
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::BindIndexBuffer { index_type: IndexType::U32, .. }
    )));
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::DrawIndexed { index_count: 3, .. }
    )));
    assert_eq!(ctx.last_frame_stats().transient_bytes, 48 + 16);
}

#[test]
fn test_transient_ring_wraps_without_overlap() {
    let mut ctx = common::context();
    let layout = common::vec4_layout();

    let first = ctx.create_transient_vertex_buffer(&[0u8; 400], &layout).unwrap();
    assert_eq!(first.allocation().offset, 0);
    ctx.frame().unwrap();
    let second = ctx.create_transient_vertex_buffer(&[0u8; 400], &layout).unwrap();
    assert_eq!(second.allocation().offset, 400);

    // First span is still live: restarting at zero would overwrite it.
    assert!(matches!(
        ctx.create_transient_vertex_buffer(&[0u8; 400], &layout),
        Err(RenderError::Ring(RingError::Overflow { .. }))
    ));

    ctx.frame().unwrap();
    ctx.frame().unwrap();
    let third = ctx.create_transient_vertex_buffer(&[0u8; 400], &layout).unwrap();
    assert_eq!(third.allocation().offset, 0, "allocation restarts at the front");
    assert_eq!(third.allocation().padding, 224);
    assert_eq!(third.allocation().actual_size, 624);

    assert!(matches!(
        ctx.create_transient_vertex_buffer(&[0u8; 2048], &layout),
        Err(RenderError::Ring(RingError::TooLarge { .. }))
    ));
}

#[test]
fn test_framebuffer_validation() {
    let mut ctx = common::context();
    let sampled = common::attachment(&mut ctx, Format::Rgba8Unorm, ImageUsage::Sampled);
    let color = common::attachment(&mut ctx, Format::Rgba8Unorm, ImageUsage::Attachment);
    let small = ctx
        .create_image(ImageDesc {
            width: 16,
            height: 16,
            format: Format::Depth32Float,
            usage: ImageUsage::Attachment,
        })
        .unwrap();

    let invalid = |colors, depth| framekit_renderer::FramebufferDesc { colors, depth };
    assert!(ctx.create_framebuffer(invalid(vec![sampled], None)).is_err());
    assert!(ctx.create_framebuffer(invalid(vec![], Some(color))).is_err());
    assert!(ctx.create_framebuffer(invalid(vec![color], Some(small))).is_err());
    assert!(ctx.create_framebuffer(invalid(vec![], None)).is_err());
    assert!(ctx.create_framebuffer(invalid(vec![color], None)).is_ok());
}

#[test]
fn test_shutdown_releases_everything() {
    let mut ctx = common::context();
    let program = common::program_with_uniform_slot(&mut ctx);
    let ub = ctx.create_uniform_buffer(64).unwrap();
    let descriptor = ctx
        .create_descriptor(0, DescriptorSource::UniformBuffer(ub))
        .unwrap();
    let vb = ctx
        .create_vertex_buffer(&[0u8; 48], &common::vec4_layout())
        .unwrap();
    let image = common::attachment(&mut ctx, Format::Rgba8Unorm, ImageUsage::SampledAttachment);
    ctx.create_texture(TextureDesc {
        image,
        sampler: SamplerDesc::default(),
        data: None,
    })
    .unwrap();

    ctx.bind_vertex_buffer(vb).unwrap();
    ctx.bind_descriptor(0, descriptor).unwrap();
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();
    ctx.destroy_vertex_buffer(vb).unwrap();
    ctx.create_transient_vertex_buffer(&[0u8; 32], &common::vec4_layout())
        .unwrap();

    let backend = ctx.shutdown().expect("Failed to shut down");
    assert_eq!(backend.live_objects().total(), 0, "{:?}", backend.live_objects());
}
