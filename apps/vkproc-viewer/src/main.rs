//! vkproc viewer
//!
//! Opens a window and drives the Vulkan command processor with a small
//! scene: a cleared background, a streamed triangle and a spinning textured
//! quad. Every frame is one command batch ending in a swap.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vkproc-viewer -- [OPTIONS]
//! ```
//!
//! Run with `--help` for the full option list. Press `V` to toggle vsync.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `VKPROC_SHADER_DIR`: Directory of the compiled shaders

mod capture;
mod options;
mod scene;
mod shaders;

use std::sync::Arc;
use std::time::Instant;

use glam::IVec2;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vkproc_backend::{save_presented_image, RunCommandResult, VulkanBackend};
use vkproc_core::command::UpdateViewport;
use vkproc_core::Command;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use crate::options::{print_help, ViewerOptions};
use crate::scene::Scene;
use crate::shaders::ShaderDirectory;

fn main() -> anyhow::Result<()> {
    let options = ViewerOptions::from_args();
    if options.help {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = ViewerRunner { options, state: None };
    event_loop.run_app(&mut runner)?;
    Ok(())
}

struct ViewerRunner {
    options: ViewerOptions,
    state: Option<ViewerState>,
}

/// Dropped backend first: the surface must not outlive the window.
struct ViewerState {
    backend: VulkanBackend,
    window: Arc<Window>,
    scene: Scene,
    started: Instant,
    frame: u64,
    vsync: bool,
    toggle_vsync: bool,
    resized: Option<PhysicalSize<u32>>,
}

impl ApplicationHandler for ViewerRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("viewer ready");
            }
            Err(e) => {
                error!("Failed to initialize the viewer: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested after {} frames", state.frame);
                self.state = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => state.resized = Some(size),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::KeyV),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => state.toggle_vsync = true,
            WindowEvent::RedrawRequested => match state.run_frame(&self.options) {
                Ok(true) => state.window.request_redraw(),
                Ok(false) => {
                    self.state = None;
                    event_loop.exit();
                }
                Err(e) => {
                    error!("Frame failed: {e:#}");
                    self.state = None;
                    event_loop.exit();
                }
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl ViewerRunner {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<ViewerState> {
        let config = self.options.backend.clone();
        let attributes = Window::default_attributes()
            .with_title(&config.app_name)
            .with_inner_size(PhysicalSize::new(config.canvas_width, config.canvas_height));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let vsync = config.vsync;
        let shaders = Box::new(ShaderDirectory::new(&self.options.shader_dir));
        let backend = VulkanBackend::for_window(window.as_ref(), config, shaders)?;
        for warning in backend.error_state().warnings() {
            warn!("{warning}");
        }
        info!(
            "{} usable adapters, using {} (auto would pick {})",
            backend.adapters().usable.len(),
            backend.adapter_name(),
            backend.adapters().auto.name
        );

        Ok(ViewerState {
            backend,
            window,
            scene: Scene::new(),
            started: Instant::now(),
            frame: 0,
            vsync,
            toggle_vsync: false,
            resized: None,
        })
    }
}

impl ViewerState {
    /// Submit one frame. Returns `false` once the viewer should exit.
    fn run_frame(&mut self, options: &ViewerOptions) -> anyhow::Result<bool> {
        let mut commands = Vec::new();
        if let Some(size) = self.resized.take() {
            commands.push(Command::UpdateViewport(UpdateViewport {
                position: IVec2::ZERO,
                width: size.width,
                height: size.height,
                by_resize: true,
            }));
        }
        let (vsync_reply, vsync_result) = crossbeam::channel::bounded(1);
        if std::mem::take(&mut self.toggle_vsync) {
            commands.push(Command::VSync {
                vsync: !self.vsync,
                reply: Some(vsync_reply),
            });
        }

        let size = self.window.inner_size();
        let time = self.started.elapsed().as_secs_f32();
        commands.extend(self.scene.frame_commands(time, size.width.max(1), size.height.max(1))?);

        let capture = options.capture.should_capture(self.frame);
        let (screenshot_reply, screenshot) = crossbeam::channel::bounded(1);
        if capture {
            commands.push(Command::TrySwapAndScreenshot {
                reply: screenshot_reply,
            });
        }
        commands.push(Command::Swap);

        self.backend.start_commands(commands.len());
        for command in &commands {
            if self.backend.run_command(command) == RunCommandResult::Error {
                self.backend.end_commands();
                anyhow::bail!("{:?} failed: {}", command.kind(), self.backend.error_state().error_string());
            }
        }
        self.backend.end_commands();

        if let Ok(applied) = vsync_result.try_recv() {
            if applied {
                self.vsync = !self.vsync;
                info!("vsync {}", if self.vsync { "on" } else { "off" });
            }
        }
        if capture {
            match screenshot.try_recv() {
                Ok(image) => {
                    if let Err(e) = save_presented_image(&image, options.capture.output_path(self.frame)) {
                        error!("Failed to save frame {}: {e}", self.frame);
                    }
                }
                Err(_) => warn!("no screenshot was produced for frame {}", self.frame),
            }
        }

        self.frame += 1;
        let done = options.capture.exit_after_capture && options.capture.all_captured(self.frame);
        Ok(!done)
    }
}
