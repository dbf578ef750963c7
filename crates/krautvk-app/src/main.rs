// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{Context, Result};
use clap::Parser;
use krautvk_core::init_tracing;
use krautvk_platform::{render_size, WindowConfig};
use krautvk_render::{RenderConfig, RenderSize, Renderer};
use krautvk_render_vk::VkRenderer;
use tracing::{error, info, warn};

use krautvk_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "krautvk.toml")]
    config: PathBuf,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    fullscreen: bool,
    /// Directory with shadervert.spv / shaderfrag.spv
    #[arg(long)]
    shader_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
struct AppCfg {
    #[serde(default)]
    window: WindowConfig,
    #[serde(default)]
    render: RenderConfig,
}

impl AppCfg {
    fn apply(&mut self, args: &Args) {
        if let Some(w) = args.width {
            self.window.width = w;
        }
        if let Some(h) = args.height {
            self.window.height = h;
        }
        if let Some(t) = &args.title {
            self.window.title = t.clone();
        }
        self.window.fullscreen |= args.fullscreen;
        if let Some(dir) = &args.shader_dir {
            self.render.shader_dir = Some(dir.clone());
        }
    }
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => toml::from_str::<AppCfg>(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => AppCfg::default(),
    }
}

struct App {
    cfg: AppCfg,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,
    init_error: Option<anyhow::Error>,
    exiting: bool,
    frames: u32,
    last_fps_instant: std::time::Instant,
}

impl App {
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop
            .create_window(self.cfg.window.attributes())
            .context("create_window")?;
        self.render_size = render_size(window.inner_size());

        let renderer = VkRenderer::new(&window, &window, self.render_size, &self.cfg.render)?;
        info!("resumed → {}x{}", self.render_size.width, self.render_size.height);

        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            error!("init failed: {e:#}");
            self.init_error = Some(e);
            self.exiting = true;
            event_loop.exit();
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exiting = true;
                // Renderer before the window it draws into.
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = render_size(new_size);
                info!(
                    "Resized → {}x{}",
                    self.render_size.width, self.render_size.height
                );
                if let Some(r) = &mut self.renderer {
                    let _ = r.resize(self.render_size);
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting {
                    return;
                }
                if let Some(r) = &mut self.renderer {
                    match r.render() {
                        Ok(()) => self.frames = self.frames.saturating_add(1),
                        Err(e) => error!("render error: {e}"),
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.render_size.is_zero_area() {
            // minimized: sleep until the next event
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = std::time::Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config);
    cfg.apply(&args);

    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App {
        cfg,
        window: None,
        renderer: None,
        render_size: RenderSize {
            width: 1,
            height: 1,
        },
        init_error: None,
        exiting: false,
        frames: 0,
        last_fps_instant: std::time::Instant::now(),
    };

    event_loop.run_app(&mut app)?;
    match app.init_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
