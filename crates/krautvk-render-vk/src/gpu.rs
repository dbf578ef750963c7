// SPDX-License-Identifier: CEPL-1.0
//! Narrow driver interface the swapchain/frame core is written against.
//!
//! Everything above this trait is plain Rust over `vk` handle types; the
//! function tables live in the implementor (`AshGpu` for real devices).

use crate::negotiate::SwapchainConfig;
use ash::prelude::VkResult;
use ash::vk;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueRef {
    pub handle: vk::Queue,
    pub family: u32,
}

/// Single-image layout transition, optionally moving queue-family ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_family: u32,
    pub dst_family: u32,
}

pub trait Gpu {
    fn wait_idle(&self) -> VkResult<()>;

    // surface queries
    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    fn present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>>;

    // swapchain and per-image resources
    fn create_swapchain(
        &self,
        config: &SwapchainConfig,
        old: vk::SwapchainKHR,
    ) -> VkResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_render_pass(&self, format: vk::Format) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // pipeline
    fn create_pipeline_layout(&self) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // buffers
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn free_memory(&self, memory: vk::DeviceMemory);

    // commands and sync
    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// `Err(vk::Result::TIMEOUT)` when the fence is still unsignaled after `timeout_ns`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    // presentation
    /// `Ok((index, suboptimal))`; out-of-date is an `Err`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    fn submit(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()>;
    /// Command-free batch that only consumes `wait` and signals `fence`.
    fn submit_wait_only(
        &self,
        queue: vk::Queue,
        wait: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()>;
    /// `Ok(true)` when the presentation engine reports the swapchain as suboptimal.
    fn present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;

    // recording primitives
    /// Resets and begins `cmd` for one-time submission.
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier);
    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear: [f32; 4],
    );
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer);
    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32);
}

/// A handle type `Scoped` knows how to release.
pub trait GpuObject: Copy {
    fn destroy<G: Gpu + ?Sized>(self, gpu: &G);
}

macro_rules! gpu_object {
    ($($ty:ty => $destroy:ident),* $(,)?) => {
        $(
            impl GpuObject for $ty {
                fn destroy<G: Gpu + ?Sized>(self, gpu: &G) {
                    gpu.$destroy(self);
                }
            }
        )*
    };
}

gpu_object! {
    vk::SwapchainKHR => destroy_swapchain,
    vk::ImageView => destroy_image_view,
    vk::RenderPass => destroy_render_pass,
    vk::Framebuffer => destroy_framebuffer,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::Pipeline => destroy_pipeline,
    vk::Buffer => destroy_buffer,
    vk::DeviceMemory => free_memory,
    vk::CommandPool => destroy_command_pool,
    vk::Semaphore => destroy_semaphore,
    vk::Fence => destroy_fence,
}

/// Owns one driver handle and releases it on drop. Holding the `Rc` keeps the
/// device alive until every scoped handle is gone.
pub struct Scoped<H: GpuObject, G: Gpu> {
    handle: H,
    gpu: Rc<G>,
}

impl<H: GpuObject, G: Gpu> Scoped<H, G> {
    pub fn new(gpu: &Rc<G>, handle: H) -> Self {
        Self {
            handle,
            gpu: Rc::clone(gpu),
        }
    }

    #[inline]
    pub fn handle(&self) -> H {
        self.handle
    }
}

impl<H: GpuObject, G: Gpu> Drop for Scoped<H, G> {
    fn drop(&mut self) {
        self.handle.destroy(&*self.gpu);
    }
}

impl<H: GpuObject + std::fmt::Debug, G: Gpu> std::fmt::Debug for Scoped<H, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Scoped").field(&self.handle).finish()
    }
}
