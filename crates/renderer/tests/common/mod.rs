//! Fixtures shared by the headless integration tests.

#![allow(dead_code)]

use framekit_core::RendererConfig;
use framekit_renderer::backend::ImageDesc;
use framekit_renderer::{HeadlessBackend, ImageHandle, ProgramDesc, ProgramHandle, RenderContext};
use framekit_rhi::descriptor::{DescriptorBindingLayout, DescriptorType, ShaderVisibility};
use framekit_rhi::image::{Format, ImageUsage};
use framekit_rhi::shader::ShaderStage;
use framekit_rhi::vertex::{VertexFormat, VertexLayout};

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;

/// Smallest byte string the backends accept as SPIR-V: magic, version,
/// generator, bound and schema words.
pub fn spirv_stub() -> Vec<u8> {
    [0x0723_0203u32, 0x0001_0000, 0, 1, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

/// Small pools so ring behavior is observable.
pub fn config() -> RendererConfig {
    RendererConfig::default()
        .with_extent(WIDTH, HEIGHT)
        .with_max_draws(64)
        .with_max_descriptor_sets(16)
        .with_copy_limits(8, 4)
        .with_transient_sizes(1024, 1024, 4096)
        .with_alignment(16)
}

pub fn context() -> RenderContext<HeadlessBackend> {
    context_with(config())
}

pub fn context_with(config: RendererConfig) -> RenderContext<HeadlessBackend> {
    let backend = HeadlessBackend::new(config.width, config.height);
    RenderContext::init(backend, config).expect("Failed to initialize render context")
}

/// One `vec4` attribute, 16 bytes per vertex.
pub fn vec4_layout() -> VertexLayout {
    VertexLayout::new().push(VertexFormat::Float4)
}

pub fn program(ctx: &mut RenderContext<HeadlessBackend>) -> ProgramHandle {
    program_from(ctx, |desc| desc)
}

/// A program whose slot 0 holds a uniform buffer at binding 0.
pub fn program_with_uniform_slot(ctx: &mut RenderContext<HeadlessBackend>) -> ProgramHandle {
    program_from(ctx, |desc| {
        desc.with_slot(vec![DescriptorBindingLayout::new(
            0,
            DescriptorType::UniformBuffer,
            ShaderVisibility::All,
        )])
    })
}

pub fn program_from(
    ctx: &mut RenderContext<HeadlessBackend>,
    configure: impl FnOnce(ProgramDesc) -> ProgramDesc,
) -> ProgramHandle {
    let spirv = spirv_stub();
    let vs = ctx
        .create_shader(ShaderStage::Vertex, &spirv)
        .expect("Failed to create vertex shader");
    let fs = ctx
        .create_shader(ShaderStage::Fragment, &spirv)
        .expect("Failed to create fragment shader");
    ctx.create_program(configure(ProgramDesc::new(vs, fs)))
        .expect("Failed to create program")
}

pub fn attachment(
    ctx: &mut RenderContext<HeadlessBackend>,
    format: Format,
    usage: ImageUsage,
) -> ImageHandle {
    ctx.create_image(ImageDesc {
        width: 256,
        height: 256,
        format,
        usage,
    })
    .expect("Failed to create attachment image")
}
