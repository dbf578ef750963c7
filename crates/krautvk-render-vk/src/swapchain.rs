// SPDX-License-Identifier: CEPL-1.0
use crate::error::{vk_call, RenderError};
use crate::gpu::{Gpu, Scoped};
use crate::negotiate::{self, Negotiated, SwapchainConfig, DEFAULT_EXTENT};
use ash::vk;
use krautvk_render::RenderSize;
use std::rc::Rc;
use tracing::{debug, info};

/// One presentable image plus the resources built on top of it.
/// Field order is drop order: framebuffer before view.
pub struct SwapchainImage<G: Gpu> {
    pub image: vk::Image,
    framebuffer: Scoped<vk::Framebuffer, G>,
    view: Scoped<vk::ImageView, G>,
}

impl<G: Gpu> SwapchainImage<G> {
    pub fn view(&self) -> vk::ImageView {
        self.view.handle()
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer.handle()
    }
}

struct LiveSwapchain<G: Gpu> {
    images: Vec<SwapchainImage<G>>,
    handle: Scoped<vk::SwapchainKHR, G>,
    config: SwapchainConfig,
}

struct FormatRenderPass<G: Gpu> {
    render_pass: Scoped<vk::RenderPass, G>,
    format: vk::Format,
    epoch: u64,
}

/// Everything the recorder needs for one acquired image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    /// Bumped whenever the render pass is rebuilt; pipelines key off it.
    pub render_pass_epoch: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recreation {
    Rebuilt(SwapchainConfig),
    /// Zero-area surface; the previous swapchain (if any) is untouched.
    Skipped,
}

/// Sole owner of the swapchain, its views and framebuffers, and the render
/// pass matching the swapchain format.
pub struct SwapchainManager<G: Gpu> {
    // STRICT FIELD ORDER: per-image resources drop before the render pass.
    current: Option<LiveSwapchain<G>>,
    render_pass: Option<FormatRenderPass<G>>,
    requested: vk::Extent2D,
    next_epoch: u64,
    gpu: Rc<G>,
}

impl<G: Gpu> SwapchainManager<G> {
    pub fn new(gpu: Rc<G>, size: RenderSize) -> Self {
        let mut manager = Self {
            current: None,
            render_pass: None,
            requested: DEFAULT_EXTENT,
            next_epoch: 0,
            gpu,
        };
        manager.set_requested_size(size);
        manager
    }

    /// Size to use when the surface leaves the extent to us. Zero-area sizes
    /// keep the last usable request.
    pub fn set_requested_size(&mut self, size: RenderSize) {
        if !size.is_zero_area() {
            self.requested = vk::Extent2D {
                width: size.width,
                height: size.height,
            };
        }
    }

    pub fn handle(&self) -> Option<vk::SwapchainKHR> {
        self.current.as_ref().map(|s| s.handle.handle())
    }

    pub fn config(&self) -> Option<&SwapchainConfig> {
        self.current.as_ref().map(|s| &s.config)
    }

    pub fn image_count(&self) -> usize {
        self.current.as_ref().map_or(0, |s| s.images.len())
    }

    pub fn images(&self) -> &[SwapchainImage<G>] {
        self.current.as_ref().map_or(&[], |s| s.images.as_slice())
    }

    pub fn render_pass(&self) -> Option<(vk::RenderPass, u64)> {
        self.render_pass
            .as_ref()
            .map(|rp| (rp.render_pass.handle(), rp.epoch))
    }

    pub fn target(&self, image_index: u32) -> Option<RenderTarget> {
        let live = self.current.as_ref()?;
        let rp = self.render_pass.as_ref()?;
        let img = live.images.get(image_index as usize)?;
        Some(RenderTarget {
            image: img.image,
            framebuffer: img.framebuffer(),
            extent: live.config.extent,
            render_pass: rp.render_pass.handle(),
            render_pass_epoch: rp.epoch,
        })
    }

    // STRICT ORDER (recreate):
    // 1) device idle: nothing in flight may reference the old images
    // 2) query caps/formats/modes fresh (monitor moves change them)
    // 3) negotiate; zero extent returns here with nothing touched
    // 4) create the new swapchain with the old one as oldSwapchain
    // 5) drop old framebuffers + views, then the old swapchain (also on failure:
    //    the driver retires oldSwapchain either way)
    // 6) rebuild the render pass only if the color format changed
    // 7) views + framebuffers for every new image, all or nothing
    pub fn recreate(&mut self) -> Result<Recreation, RenderError> {
        self.gpu.wait_idle().map_err(vk_call("vkDeviceWaitIdle"))?;

        let caps = self
            .gpu
            .surface_capabilities()
            .map_err(vk_call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;
        let formats = self
            .gpu
            .surface_formats()
            .map_err(vk_call("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
        let modes = self
            .gpu
            .present_modes()
            .map_err(vk_call("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

        let config = match negotiate::negotiate(&caps, &formats, &modes, self.requested)? {
            Negotiated::Ready(config) => config,
            Negotiated::ZeroExtent => {
                debug!("surface extent is 0x0, swapchain left as is");
                return Ok(Recreation::Skipped);
            }
        };

        let old = self.current.take();
        let old_handle = old
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |s| s.handle.handle());
        let created = self.gpu.create_swapchain(&config, old_handle);
        drop(old);
        let handle = Scoped::new(
            &self.gpu,
            created.map_err(vk_call("vkCreateSwapchainKHR"))?,
        );

        let (render_pass, _) = self.ensure_render_pass(config.surface_format.format)?;

        let raw_images = self
            .gpu
            .swapchain_images(handle.handle())
            .map_err(vk_call("vkGetSwapchainImagesKHR"))?;
        let mut images = Vec::with_capacity(raw_images.len());
        for image in raw_images {
            let view = Scoped::new(
                &self.gpu,
                self.gpu
                    .create_image_view(image, config.surface_format.format)
                    .map_err(vk_call("vkCreateImageView"))?,
            );
            let framebuffer = Scoped::new(
                &self.gpu,
                self.gpu
                    .create_framebuffer(render_pass, view.handle(), config.extent)
                    .map_err(vk_call("vkCreateFramebuffer"))?,
            );
            images.push(SwapchainImage {
                image,
                framebuffer,
                view,
            });
        }

        info!(
            "swapchain: format {:?} / {:?}, present_mode {:?}, extent {}x{}, images {}",
            config.surface_format.format,
            config.surface_format.color_space,
            config.present_mode,
            config.extent.width,
            config.extent.height,
            images.len()
        );

        self.current = Some(LiveSwapchain {
            images,
            handle,
            config,
        });
        Ok(Recreation::Rebuilt(config))
    }

    fn ensure_render_pass(
        &mut self,
        format: vk::Format,
    ) -> Result<(vk::RenderPass, u64), RenderError> {
        if let Some(rp) = &self.render_pass {
            if rp.format == format {
                return Ok((rp.render_pass.handle(), rp.epoch));
            }
        }
        // Never reused, even when a rebuild fails halfway.
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        // Old pass goes first; nothing references it once the device is idle.
        self.render_pass = None;
        let render_pass = Scoped::new(
            &self.gpu,
            self.gpu
                .create_render_pass(format)
                .map_err(vk_call("vkCreateRenderPass"))?,
        );
        debug!(?format, epoch, "render pass rebuilt");
        let handle = render_pass.handle();
        self.render_pass = Some(FormatRenderPass {
            render_pass,
            format,
            epoch,
        });
        Ok((handle, epoch))
    }
}
