//! framekit demo: a spinning triangle streamed through the transient vertex
//! ring every frame.
//!
//! Usage: `framekit [vertex.spv fragment.spv]`. The vertex shader takes a
//! `vec3` position and a `vec3` color and reads its transforms from the
//! storage buffer in set 0, indexed by `gl_InstanceIndex`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glam::Mat4;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use framekit_core::{FrameTimer, RendererConfig};
use framekit_platform::Window;
use framekit_renderer::{
    FrameStatus, ProgramDesc, ProgramHandle, RenderContext, VulkanBackend, ViewId,
};
use framekit_rhi::shader::ShaderStage;
use framekit_rhi::vertex::{VertexFormat, VertexLayout};

const MAIN_VIEW: ViewId = 0;
const CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.05, 1.0];
const STATS_INTERVAL: u64 = 600;

#[rustfmt::skip]
const TRIANGLE: [f32; 18] = [
    // position          color
     0.0, -0.6, 0.0,     1.0, 0.2, 0.2,
     0.6,  0.5, 0.0,     0.2, 1.0, 0.2,
    -0.6,  0.5, 0.0,     0.2, 0.2, 1.0,
];

struct ShaderPaths {
    vertex: PathBuf,
    fragment: PathBuf,
}

impl ShaderPaths {
    fn from_args() -> Self {
        let mut args = std::env::args().skip(1);
        Self {
            vertex: args
                .next()
                .map_or_else(|| PathBuf::from("shaders/triangle.vert.spv"), PathBuf::from),
            fragment: args
                .next()
                .map_or_else(|| PathBuf::from("shaders/triangle.frag.spv"), PathBuf::from),
        }
    }
}

fn read_spirv(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read shader {}", path.display()))
}

struct Demo {
    context: RenderContext<VulkanBackend>,
    program: ProgramHandle,
    layout: VertexLayout,
}

impl Demo {
    fn new(window: &Window, config: RendererConfig, shaders: &ShaderPaths) -> Result<Self> {
        let backend =
            VulkanBackend::new(window, &config).context("Failed to create Vulkan backend")?;
        let mut context = RenderContext::init(backend, config)?;

        let vertex = context.create_shader(ShaderStage::Vertex, &read_spirv(&shaders.vertex)?)?;
        let fragment =
            context.create_shader(ShaderStage::Fragment, &read_spirv(&shaders.fragment)?)?;
        let program = context.create_program(ProgramDesc::new(vertex, fragment))?;
        context.set_view_clear(MAIN_VIEW, Some(CLEAR_COLOR));

        Ok(Self {
            context,
            program,
            layout: VertexLayout::new()
                .push(VertexFormat::Float3)
                .push(VertexFormat::Float3),
        })
    }

    fn draw(&mut self, elapsed: f32, aspect: f32) -> Result<FrameStatus> {
        let vertices = self
            .context
            .create_transient_vertex_buffer(bytemuck::cast_slice(&TRIANGLE), &self.layout)?;
        self.context.bind_transient_vertex_buffer(vertices);
        self.context.set_transform(Mat4::from_rotation_z(elapsed));
        self.context
            .set_proj(Mat4::orthographic_rh(-aspect, aspect, -1.0, 1.0, -1.0, 1.0));
        self.context.submit(MAIN_VIEW, self.program)?;
        Ok(self.context.frame()?)
    }

    fn shutdown(self) {
        match self.context.shutdown() {
            Ok(backend) => drop(backend),
            Err(e) => error!("Shutdown failed: {}", e),
        }
    }
}

struct App {
    // Dropped before the window it presents to.
    demo: Option<Demo>,
    window: Option<Window>,
    config: RendererConfig,
    shaders: ShaderPaths,
    timer: FrameTimer,
}

impl App {
    fn new(config: RendererConfig, shaders: ShaderPaths) -> Self {
        Self {
            demo: None,
            window: None,
            config,
            shaders,
            timer: FrameTimer::new(),
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(demo), Some(window)) = (self.demo.as_mut(), self.window.as_ref()) else {
            return;
        };
        if window.is_minimized() {
            return;
        }

        let elapsed = self.timer.elapsed().as_secs_f32();
        match demo.draw(elapsed, window.aspect_ratio()) {
            Ok(FrameStatus::Success) => {}
            Ok(FrameStatus::SwapchainResizeWarning) => warn!("Frame dropped, swapchain rebuilt"),
            Err(e) => {
                error!("Render error: {:#}", e);
                event_loop.exit();
                return;
            }
        }

        self.timer.tick();
        if self.timer.frame_count() % STATS_INTERVAL == 0 {
            info!(
                "{:.1} fps | {}",
                self.timer.fps(),
                demo.context.last_frame_stats()
            );
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let window = match Window::new(
            event_loop,
            self.config.width,
            self.config.height,
            "framekit",
        ) {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };
        match Demo::new(&window, self.config.clone(), &self.shaders) {
            Ok(demo) => {
                info!("Initialization complete, entering main loop");
                self.demo = Some(demo);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to initialize: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = self.window.as_mut() {
                    window.resize(size.width, size.height);
                }
                if let Some(demo) = self.demo.as_mut() {
                    demo.context.reset(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(demo) = self.demo.take() {
            demo.shutdown();
        }
        self.window = None;
    }
}

fn main() -> Result<()> {
    framekit_core::init_logging();
    info!("Starting framekit");

    let config = RendererConfig::from_env()?.with_extent(1280, 720);
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config, ShaderPaths::from_args());
    event_loop.run_app(&mut app)?;
    Ok(())
}
