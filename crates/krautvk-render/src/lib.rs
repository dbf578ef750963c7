// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Frames the CPU may run ahead of the GPU.
pub const MIN_FRAMES_IN_FLIGHT: usize = 2;
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub fence_timeout_ms: u64,
    /// Directory holding `shadervert.spv` / `shaderfrag.spv`; the embedded
    /// build-time shaders are used when unset.
    pub shader_dir: Option<PathBuf>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.4, 0.6, 1.0, 0.0],
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            fence_timeout_ms: 1000,
            shader_dir: None,
        }
    }
}

impl RenderConfig {
    pub fn slot_count(&self) -> usize {
        let n = self
            .frames_in_flight
            .clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT);
        if n != self.frames_in_flight {
            warn!(
                requested = self.frames_in_flight,
                using = n,
                "frames_in_flight out of range"
            );
        }
        n
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms.saturating_mul(1_000_000)
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: &RenderConfig,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Records the new size; the swapchain is rebuilt before the next frame.
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}
