//! Frame execution against the headless backend.

mod common;

use framekit_renderer::backend::PresentStatus;
use framekit_renderer::backend::headless::{Command, FailPoint, TargetRecord};
use framekit_renderer::{Backend, FrameStatus, FramebufferDesc, ProgramDesc, RenderError};
use framekit_rhi::buffer::IndexType;
use framekit_rhi::shader::ShaderStage;
use framekit_rhi::image::{Format, ImageUsage};

fn draw_instances(commands: &[Command]) -> Vec<u32> {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::Draw { first_instance, .. } | Command::DrawIndexed { first_instance, .. } => {
                Some(*first_instance)
            }
            _ => None,
        })
        .collect()
}

#[test]
fn test_single_indexed_draw() {
    let mut ctx = common::context();
    let vb = ctx
        .create_vertex_buffer(&[0u8; 256], &common::vec4_layout())
        .expect("Failed to create vertex buffer");
    let ib = ctx
        .create_index_buffer(&[0u8; 96], IndexType::U16)
        .expect("Failed to create index buffer");
    let program = common::program(&mut ctx);

    ctx.bind_vertex_buffer(vb).unwrap();
    ctx.bind_index_buffer(ib).unwrap();
    ctx.submit(0, program).unwrap();

    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);

    let stats = *ctx.last_frame_stats();
    assert_eq!(stats.frame, 1);
    assert_eq!(stats.render_passes, 1, "one view, one pass");
    assert_eq!(stats.pipelines_created, 1);
    assert_eq!(stats.draws_executed, 1);
    assert_eq!(stats.buffer_copies, 2, "both buffers were staged");
    assert_eq!(ctx.pending_draws(), 0, "draw list must be empty after the frame");

    let commands = ctx.backend().submitted_commands();
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, Command::BeginRendering { .. }))
            .count(),
        1
    );
    assert!(commands.contains(&Command::DrawIndexed {
        index_count: 48,
        first_index: 0,
        vertex_offset: 0,
        first_instance: 0,
    }));
    assert_eq!(commands.last(), Some(&Command::PreparePresent));
    assert_eq!(ctx.backend().counters().presents, 1);
}

#[test]
fn test_copies_precede_draws() {
    let mut ctx = common::context();
    let vb = ctx
        .create_vertex_buffer(&[1u8; 64], &common::vec4_layout())
        .unwrap();
    let program = common::program(&mut ctx);
    ctx.bind_vertex_buffer(vb).unwrap();
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();

    let commands = ctx.backend().submitted_commands();
    let copy = commands
        .iter()
        .position(|c| matches!(c, Command::CopyBuffer { .. }))
        .expect("copy was not recorded");
    let pass = commands
        .iter()
        .position(|c| matches!(c, Command::BeginRendering { .. }))
        .expect("pass was not recorded");
    assert!(copy < pass);
    assert!(commands.contains(&Command::Draw {
        vertex_count: 4,
        first_vertex: 0,
        first_instance: 0,
    }));
}

#[test]
fn test_program_shared_across_targets_with_same_formats() {
    let mut ctx = common::context();
    let color = common::attachment(&mut ctx, Format::Bgra8Srgb, ImageUsage::Attachment);
    let depth = common::attachment(&mut ctx, Format::Depth32Float, ImageUsage::Attachment);
    let fb = ctx
        .create_framebuffer(FramebufferDesc {
            colors: vec![color],
            depth: Some(depth),
        })
        .expect("Failed to create framebuffer");
    ctx.set_view_target(1, Some(fb)).unwrap();
    let p1 = common::program(&mut ctx);
    let p2 = common::program(&mut ctx);

    for (view, program) in [(0, p1), (0, p2), (1, p1)] {
        ctx.set_vertex_count(3);
        ctx.submit(view, program).unwrap();
    }
    ctx.frame().unwrap();

    let stats = ctx.last_frame_stats();
    assert_eq!(stats.render_passes, 2);
    assert_eq!(stats.pipelines_created, 2, "P1 is reused by the offscreen view");
    assert_eq!(stats.draws_executed, 3);
}

#[test]
fn test_program_gets_a_pipeline_per_target_format() {
    let mut ctx = common::context();
    let color = common::attachment(&mut ctx, Format::Rgba16Float, ImageUsage::SampledAttachment);
    let fb = ctx
        .create_framebuffer(FramebufferDesc {
            colors: vec![color],
            depth: None,
        })
        .unwrap();
    ctx.set_view_target(1, Some(fb)).unwrap();
    let p1 = common::program(&mut ctx);
    let p2 = common::program(&mut ctx);

    for (view, program) in [(0, p1), (0, p2), (1, p1)] {
        ctx.set_vertex_count(3);
        ctx.submit(view, program).unwrap();
    }
    ctx.frame().unwrap();

    let stats = ctx.last_frame_stats();
    assert_eq!(stats.render_passes, 2);
    assert_eq!(stats.pipelines_created, 3);
    assert_eq!(ctx.pipeline_count(), 3);

    let commands = ctx.backend().submitted_commands();
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::BeginRendering {
            target: TargetRecord::Offscreen { depth: None, .. },
            ..
        }
    )));
    assert!(
        commands.contains(&Command::ImageBarrier {
            image: ctx.native_image(color).unwrap().id(),
            old: framekit_rhi::image::ImageLayout::Undefined,
            new: framekit_rhi::image::ImageLayout::ColorAttachment,
        }),
        "attachment must be transitioned before the pass"
    );

    // Second frame reuses everything.
    for (view, program) in [(0, p1), (1, p1)] {
        ctx.set_vertex_count(3);
        ctx.submit(view, program).unwrap();
    }
    ctx.frame().unwrap();
    assert_eq!(ctx.last_frame_stats().pipelines_created, 0);
}

#[test]
fn test_sorted_draws_are_grouped_with_minimal_binds() {
    let mut ctx = common::context();
    let color = common::attachment(&mut ctx, Format::Bgra8Srgb, ImageUsage::Attachment);
    let fb = ctx
        .create_framebuffer(FramebufferDesc {
            colors: vec![color],
            depth: None,
        })
        .unwrap();
    ctx.set_view_target(1, Some(fb)).unwrap();
    let vb = ctx
        .create_vertex_buffer(&[0u8; 48], &common::vec4_layout())
        .unwrap();
    let p1 = common::program(&mut ctx);
    let p2 = common::program(&mut ctx);

    let submissions = [(1, p2), (0, p1), (1, p1), (0, p2), (0, p1), (1, p2)];
    for (view, program) in submissions {
        ctx.bind_vertex_buffer(vb).unwrap();
        ctx.submit(view, program).unwrap();
    }
    ctx.frame().unwrap();

    let stats = *ctx.last_frame_stats();
    assert_eq!(stats.draws_executed, 6);
    assert_eq!(stats.render_passes, 2, "views must be contiguous");
    assert_eq!(stats.pipeline_binds, 4, "one bind per program per view");
    assert_eq!(stats.vertex_binds, 2, "same buffer is bound once per pass");

    let commands = ctx.backend().submitted_commands();
    assert_eq!(draw_instances(commands), vec![1, 4, 3, 2, 0, 5]);
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, Command::BindPipeline { .. }))
            .count(),
        4
    );
}

#[test]
fn test_transforms_are_indexed_by_submission() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx);
    for i in 0..3 {
        ctx.set_transform(glam::Mat4::from_translation(glam::Vec3::X * i as f32));
        ctx.set_vertex_count(3);
        ctx.submit(0, program).unwrap();
    }
    ctx.frame().unwrap();

    assert_eq!(draw_instances(ctx.backend().submitted_commands()), vec![0, 1, 2]);
    assert!(
        ctx.backend()
            .submitted_commands()
            .iter()
            .any(|c| matches!(c, Command::BindDescriptorSet { set_index: 0, .. })),
        "transform set must be bound as set 0"
    );
}

#[test]
fn test_out_of_date_acquire_drops_frame() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx);
    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();

    ctx.backend_mut().fail_next_acquires(1);
    assert_eq!(ctx.frame().unwrap(), FrameStatus::SwapchainResizeWarning);
    assert_eq!(ctx.pending_draws(), 0, "draws of a dropped frame are discarded");
    assert_eq!(ctx.backend().counters().submits, 0);
    assert_eq!(ctx.backend().counters().presents, 0);

    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);
    assert_eq!(ctx.backend().counters().resizes, 1, "swapchain rebuilt on the next frame");
    assert_eq!(ctx.backend().backbuffer_extent(), (common::WIDTH, common::HEIGHT));
}

#[test]
fn test_suboptimal_present_requests_rebuild() {
    let mut ctx = common::context();
    ctx.backend_mut().script_present(PresentStatus::Suboptimal);

    assert_eq!(ctx.frame().unwrap(), FrameStatus::SwapchainResizeWarning);
    assert_eq!(ctx.backend().counters().submits, 1, "the frame itself was submitted");
    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);
    assert_eq!(ctx.backend().counters().resizes, 1);
}

#[test]
fn test_zero_sized_resize_pauses_rendering() {
    let mut ctx = common::context();
    ctx.reset(0, 0);
    assert_eq!(ctx.frame().unwrap(), FrameStatus::SwapchainResizeWarning);
    assert_eq!(ctx.backend().counters().acquires, 0);

    ctx.reset(640, 480);
    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);
    assert_eq!(ctx.backend().backbuffer_extent(), (640, 480));
}

#[test]
fn test_backbuffer_pipelines_dropped_on_resize() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx);
    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();
    assert_eq!(ctx.pipeline_count(), 1);

    ctx.backend_mut().set_backbuffer_format(Format::Rgba8Srgb);
    ctx.reset(1024, 768);
    ctx.frame().unwrap();
    assert_eq!(ctx.pipeline_count(), 0);
    assert_eq!(ctx.backend().live_objects().pipelines, 0);

    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();
    ctx.frame().unwrap();
    assert_eq!(ctx.last_frame_stats().pipelines_created, 1);
}

#[test]
fn test_draw_with_destroyed_buffer_is_skipped() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx);
    let vb = ctx
        .create_vertex_buffer(&[0u8; 48], &common::vec4_layout())
        .unwrap();
    ctx.bind_vertex_buffer(vb).unwrap();
    ctx.submit(0, program).unwrap();
    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();
    ctx.destroy_vertex_buffer(vb).unwrap();

    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);
    let stats = ctx.last_frame_stats();
    assert_eq!(stats.draws_skipped, 1);
    assert_eq!(stats.draws_executed, 1);
    assert_eq!(ctx.pending_uploads(), 0);
}

#[test]
fn test_draw_without_vertices_is_skipped() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx);
    ctx.submit(0, program).unwrap();

    ctx.frame().unwrap();
    assert_eq!(ctx.last_frame_stats().draws_skipped, 1);
    assert_eq!(ctx.last_frame_stats().render_passes, 1);
}

#[test]
fn test_view_clear_policy() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx);
    ctx.set_view_clear(0, Some([0.2, 0.3, 0.4, 1.0]));
    ctx.set_view_clear(1, None);
    for view in [0, 1] {
        ctx.set_vertex_count(3);
        ctx.submit(view, program).unwrap();
    }
    ctx.frame().unwrap();

    let clears: Vec<_> = ctx
        .backend()
        .submitted_commands()
        .iter()
        .filter_map(|c| match c {
            Command::BeginRendering { clear, .. } => Some(*clear),
            _ => None,
        })
        .collect();
    assert_eq!(clears, vec![Some([0.2, 0.3, 0.4, 1.0]), None]);
}

#[test]
fn test_destroyed_framebuffer_falls_back_to_backbuffer() {
    let mut ctx = common::context();
    let color = common::attachment(&mut ctx, Format::Rgba8Unorm, ImageUsage::Attachment);
    let fb = ctx
        .create_framebuffer(FramebufferDesc {
            colors: vec![color],
            depth: None,
        })
        .unwrap();
    ctx.set_view_target(2, Some(fb)).unwrap();
    ctx.destroy_framebuffer(fb).unwrap();

    assert!(matches!(
        ctx.set_view_target(2, Some(fb)),
        Err(RenderError::InvalidHandle { .. })
    ));
    let program = common::program(&mut ctx);
    ctx.set_vertex_count(3);
    ctx.submit(2, program).unwrap();
    ctx.frame().unwrap();
    assert!(ctx.backend().submitted_commands().contains(&Command::BeginRendering {
        target: TargetRecord::Backbuffer,
        clear: Some([0.0, 0.0, 0.0, 1.0]),
    }));
}

#[test]
fn test_failed_recording_still_presents() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(64, false).unwrap();
    ctx.update_buffer(buffer, 0, &[3; 64]).unwrap();
    let program = common::program(&mut ctx);
    ctx.set_vertex_count(3);
    ctx.submit(0, program).unwrap();

    ctx.backend_mut().fail_next(FailPoint::BeginCommands);
    assert!(matches!(ctx.frame(), Err(RenderError::Backend(_))));

    let counters = ctx.backend().counters();
    assert_eq!(counters.submits, 1, "the acquired image is still submitted");
    assert_eq!(counters.presents, 1, "and handed back to the swapchain");
    assert!(ctx.backend().submitted_commands().is_empty());
    assert_eq!(ctx.pending_draws(), 0, "draws of a failed frame are discarded");
    assert_eq!(ctx.pending_uploads(), 1, "the copy waits for the next frame");
    assert_eq!(ctx.transient_usage().staging, 64);

    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);
    assert_eq!(ctx.last_frame_stats().frame, 1, "the failed frame took no serial");
    assert_eq!(ctx.last_frame_stats().buffer_copies, 1);
    assert_eq!(ctx.pending_uploads(), 0);
    let native = ctx.native_buffer(buffer).unwrap();
    assert_eq!(ctx.backend().buffer_data(native), &[3u8; 64]);
}

#[test]
fn test_unclosed_frame_keeps_staging_until_the_copy_completes() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(64, false).unwrap();
    ctx.update_buffer(buffer, 0, &[9; 64]).unwrap();

    ctx.backend_mut().fail_next(FailPoint::EndCommands);
    assert!(ctx.frame().is_err());
    assert_eq!(ctx.backend().counters().presents, 1);
    assert_eq!(ctx.pending_uploads(), 1);

    // The copy goes out with serial 1 in slot 1, waited on two frames later.
    ctx.frame().unwrap();
    assert_eq!(ctx.pending_uploads(), 0);
    assert_eq!(ctx.last_frame_stats().buffer_copies, 1);
    ctx.frame().unwrap();
    assert_eq!(ctx.transient_usage().staging, 64, "copy may still be in flight");
    ctx.frame().unwrap();
    assert_eq!(ctx.transient_usage().staging, 0);
}

#[test]
fn test_failed_submit_is_reported_without_present() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(16, false).unwrap();
    ctx.update_buffer(buffer, 0, &[1; 16]).unwrap();

    ctx.backend_mut().fail_next(FailPoint::Submit);
    assert!(matches!(ctx.frame(), Err(RenderError::Backend(_))));
    assert_eq!(ctx.backend().counters().presents, 0);
    assert_eq!(ctx.pending_uploads(), 1);
}

#[test]
fn test_pass_that_cannot_begin_is_not_ended() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx);
    for view in [0, 1] {
        ctx.set_vertex_count(3);
        ctx.submit(view, program).unwrap();
    }

    ctx.backend_mut().fail_next(FailPoint::BeginRendering);
    assert_eq!(ctx.frame().unwrap(), FrameStatus::Success);

    let backend = ctx.backend();
    assert_eq!(
        backend.count_submitted(|c| matches!(c, Command::BeginRendering { .. })),
        1
    );
    assert_eq!(backend.count_submitted(|c| *c == Command::EndRendering), 1);
    let stats = ctx.last_frame_stats();
    assert_eq!(stats.render_passes, 1);
    assert_eq!(stats.draws_skipped, 1, "view 0 lost its pass");
    assert_eq!(stats.draws_executed, 1);
}

#[test]
fn test_programs_far_apart_in_the_registry_stay_grouped() {
    let mut ctx = common::context();
    let spirv = common::spirv_stub();
    let vs = ctx.create_shader(ShaderStage::Vertex, &spirv).unwrap();
    let fs = ctx.create_shader(ShaderStage::Fragment, &spirv).unwrap();
    let first = ctx.create_program(ProgramDesc::new(vs, fs)).unwrap();
    let mut last = first;
    for _ in 0..0x1_0000 {
        last = ctx.create_program(ProgramDesc::new(vs, fs)).unwrap();
    }
    assert_eq!(last.index(), 0x1_0000);

    for program in [first, last, first, last] {
        ctx.set_vertex_count(3);
        ctx.submit(0, program).unwrap();
    }
    ctx.frame().unwrap();

    let stats = ctx.last_frame_stats();
    assert_eq!(stats.pipeline_binds, 2);
    assert_eq!(stats.pipelines_created, 2);
    assert_eq!(stats.draws_executed, 4);
}
