// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use krautvk_render::RenderSize;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    error::{EventLoopError, OsError},
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

/// Window callbacks, queued until the owner drains them between frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceEvent {
    Resized(RenderSize),
    CloseRequested,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            title: "KrautVK".to_owned(),
            fullscreen: false,
        }
    }
}

impl WindowConfig {
    pub fn attributes(&self) -> WindowAttributes {
        let attrs = Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(PhysicalSize::new(self.width, self.height));
        if self.fullscreen {
            attrs.with_fullscreen(Some(Fullscreen::Borderless(None)))
        } else {
            attrs
        }
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("window system unavailable: {0}")]
    EventLoop(#[from] EventLoopError),
    #[error("window creation failed: {0}")]
    Window(#[from] OsError),
    #[error("event loop never resumed; no window was created")]
    NotResumed,
}

pub fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize {
        width: size.width,
        height: size.height,
    }
}

#[derive(Default)]
struct PumpState {
    attributes: Option<WindowAttributes>,
    window: Option<Window>,
    create_error: Option<OsError>,
    events: VecDeque<SurfaceEvent>,
    close_requested: bool,
}

impl PumpState {
    fn push(&mut self, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
                self.events.push_back(SurfaceEvent::CloseRequested);
            }
            WindowEvent::Resized(size) => {
                debug!("Resized → {}x{}", size.width, size.height);
                self.events.push_back(SurfaceEvent::Resized(render_size(size)));
            }
            _ => {}
        }
    }
}

impl ApplicationHandler for PumpState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let Some(attributes) = self.attributes.take() else {
            return;
        };
        match event_loop.create_window(attributes) {
            Ok(window) => self.window = Some(window),
            Err(e) => self.create_error = Some(e),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        self.push(event);
    }
}

// Resumed is delivered on the first pump on desktop platforms; the extra
// rounds cover backends that need a roundtrip first.
const OPEN_PUMPS: usize = 8;

/// A window driven by explicit `pump` calls instead of a blocking `run_app`.
pub struct PolledWindow {
    // STRICT FIELD ORDER: window before the event loop that owns its connection.
    window: Window,
    state: PumpState,
    event_loop: EventLoop<()>,
}

impl PolledWindow {
    pub fn open(config: &WindowConfig) -> Result<Self, PlatformError> {
        let mut event_loop = EventLoop::new()?;
        let mut state = PumpState {
            attributes: Some(config.attributes()),
            ..Default::default()
        };

        for _ in 0..OPEN_PUMPS {
            event_loop.pump_app_events(Some(Duration::ZERO), &mut state);
            if let Some(e) = state.create_error.take() {
                return Err(PlatformError::Window(e));
            }
            if let Some(window) = state.window.take() {
                info!(
                    "window open: {} ({}x{}, fullscreen={})",
                    config.title, config.width, config.height, config.fullscreen
                );
                return Ok(Self {
                    window,
                    state,
                    event_loop,
                });
            }
        }
        Err(PlatformError::NotResumed)
    }

    /// Processes pending window-system events without blocking.
    pub fn pump(&mut self) {
        if let PumpStatus::Exit(code) = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state)
        {
            debug!(code, "event loop exited");
            self.state.close_requested = true;
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SurfaceEvent> + '_ {
        self.state.events.drain(..)
    }

    pub fn should_close(&self) -> bool {
        self.state.close_requested
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn inner_size(&self) -> RenderSize {
        render_size(self.window.inner_size())
    }
}
