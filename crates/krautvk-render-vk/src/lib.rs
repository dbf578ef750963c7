// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod device;
mod driver;
mod error;
mod frame;
mod gpu;
#[cfg(test)]
mod mock;
mod negotiate;
mod record;
mod setup;
mod swapchain;

pub use device::{select_adapter, AdapterCandidate, QueueFamilyInfo, SelectedAdapter};
pub use driver::AshGpu;
pub use error::{InitError, InitStage, RenderError};
pub use frame::{FrameCursor, FrameStatus, FrameSynchronizer, RenderingResourceSlot};
pub use gpu::{Gpu, GpuObject, ImageBarrier, QueueRef, Scoped};
pub use negotiate::{negotiate, Negotiated, SwapchainConfig};
pub use record::{CommandRecorder, QueueFamilies, Vertex, VertexBuffer, QUAD};
pub use swapchain::{Recreation, RenderTarget, SwapchainImage, SwapchainManager};

use anyhow::Result;
use krautvk_render::{RenderConfig, RenderSize, Renderer};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::rc::Rc;
use tracing::{debug, info};

pub struct VkRenderer {
    // STRICT FIELD ORDER: frame slots, then the recorder's pipeline and
    // buffers, then the swapchain and its render pass; the device goes last
    // with the final Rc.
    frames: FrameSynchronizer<AshGpu>,
    recorder: CommandRecorder<AshGpu>,
    swapchain: SwapchainManager<AshGpu>,
    gpu: Rc<AshGpu>,
    pending_resize: Option<RenderSize>,
    paused: bool,
}

impl VkRenderer {
    /// Full setup. The error carries the stage that failed.
    pub fn create(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: &RenderConfig,
    ) -> Result<Self, InitError> {
        let raw_display = display
            .display_handle()
            .map_err(|e| InitError::new(InitStage::VulkanUnsupported, e))?
            .as_raw();
        let instance = setup::create_instance(raw_display)?;
        let surface = setup::create_surface(&instance, window, display)?;
        let adapter = setup::select_device(&instance, &surface)?;
        let shaders = setup::load_shaders(config.shader_dir.as_deref())?;
        let (gpu, graphics, present) = setup::create_device(instance, surface, &adapter, shaders)?;

        let vertices = setup::upload_vertices(&gpu, graphics, &QUAD)?;

        let mut swapchain = SwapchainManager::new(Rc::clone(&gpu), size);
        swapchain.recreate()?;

        let mut recorder = CommandRecorder::new(
            Rc::clone(&gpu),
            vertices,
            QueueFamilies {
                graphics: graphics.family,
                present: present.family,
            },
            config.clear_color,
        )?;
        // Starting minimized leaves no render pass yet; the first frame builds it.
        if let Some((render_pass, epoch)) = swapchain.render_pass() {
            recorder.ensure_pipeline(render_pass, epoch)?;
        }

        let frames = FrameSynchronizer::new(
            Rc::clone(&gpu),
            graphics,
            present,
            config.slot_count(),
            config.fence_timeout_ns(),
        )?;

        info!(
            "Vulkan renderer ready on {} ({} frames in flight)",
            adapter.name,
            frames.slots().len()
        );
        Ok(Self {
            frames,
            recorder,
            swapchain,
            gpu,
            pending_resize: None,
            paused: size.is_zero_area(),
        })
    }

    pub fn frame_cursor(&self) -> FrameCursor {
        self.frames.cursor()
    }

    /// Applies a queued resize between frames. Zero area pauses rendering.
    fn apply_pending_resize(&mut self) -> Result<(), RenderError> {
        let Some(size) = self.pending_resize.take() else {
            return Ok(());
        };
        if size.is_zero_area() {
            debug!("surface minimized, rendering paused");
            self.paused = true;
            return Ok(());
        }
        self.paused = false;
        self.swapchain.set_requested_size(size);
        if let Recreation::Skipped = self.swapchain.recreate()? {
            self.paused = true;
        }
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        config: &RenderConfig,
    ) -> Result<Self> {
        Ok(Self::create(window, display, size, config)?)
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.pending_resize = Some(size);
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        self.apply_pending_resize()?;
        if self.paused {
            return Ok(());
        }
        match self
            .frames
            .draw_frame(&mut self.swapchain, &mut self.recorder)
        {
            Ok(FrameStatus::Presented) | Ok(FrameStatus::Recreated) => Ok(()),
            Ok(FrameStatus::Skipped) => {
                self.paused = true;
                Ok(())
            }
            // Already logged; the slot is retried next time round the ring.
            Err(RenderError::FenceTimeout { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.recorder.set_clear_color(rgba);
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        self.gpu.wait_idle().ok();
    }
}
