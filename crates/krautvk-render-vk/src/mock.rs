// SPDX-License-Identifier: CEPL-1.0
//! In-memory `Gpu` used by the unit tests. Records every call, hands out
//! fresh handles, scripts acquire/present results and models fence signalling
//! with an explicit queue of unfinished submissions.

use crate::gpu::{Gpu, ImageBarrier};
use crate::negotiate::SwapchainConfig;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    WaitIdle,
    CreateSwapchain { old: vk::SwapchainKHR },
    DestroySwapchain(vk::SwapchainKHR),
    CreateImageView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    CreateRenderPass(vk::RenderPass),
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer(vk::Framebuffer),
    DestroyFramebuffer(vk::Framebuffer),
    CreatePipelineLayout(vk::PipelineLayout),
    DestroyPipelineLayout(vk::PipelineLayout),
    CreatePipeline {
        render_pass: vk::RenderPass,
        pipeline: vk::Pipeline,
    },
    DestroyPipeline(vk::Pipeline),
    DestroyBuffer(vk::Buffer),
    FreeMemory(vk::DeviceMemory),
    CreateCommandPool { family: u32 },
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffers(u32),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateFence { fence: vk::Fence, signaled: bool },
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    /// The simulated GPU finished the submission tied to this fence.
    GpuComplete(vk::Fence),
    Acquire(vk::SwapchainKHR),
    Submit {
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    },
    SubmitWaitOnly { queue: vk::Queue, fence: vk::Fence },
    Present { queue: vk::Queue, image_index: u32 },
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    Barrier(ImageBarrier),
    BeginRenderPass {
        framebuffer: vk::Framebuffer,
        clear: [f32; 4],
    },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    SetViewportScissor(vk::Extent2D),
    BindVertexBuffer(vk::Buffer),
    Draw { vertices: u32, instances: u32 },
}

pub(crate) struct MockState {
    next_raw: u64,
    pub calls: Vec<Call>,
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub modes: Vec<vk::PresentModeKHR>,
    /// One-shot failure for the next `create_swapchain`.
    pub fail_swapchain_create: Option<vk::Result>,
    pub fail_end_commands: bool,
    pub acquire_script: VecDeque<VkResult<(u32, bool)>>,
    pub present_script: VecDeque<VkResult<bool>>,
    /// Submissions finish the moment they are queued.
    pub auto_complete: bool,
    /// Waiting on an unsignaled fence lets the GPU finish queued work in
    /// order until it signals; otherwise the wait times out.
    pub complete_on_wait: bool,
    pub max_in_flight: usize,
    swapchain_images: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: u32,
    fences: HashMap<vk::Fence, bool>,
    pending: VecDeque<vk::Fence>,
}

impl MockState {
    fn alloc<H: Handle>(&mut self) -> H {
        self.next_raw += 1;
        H::from_raw(self.next_raw)
    }

    fn complete_front(&mut self) -> Option<vk::Fence> {
        let fence = self.pending.pop_front()?;
        self.fences.insert(fence, true);
        self.calls.push(Call::GpuComplete(fence));
        Some(fence)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

pub(crate) struct MockGpu {
    state: RefCell<MockState>,
}

impl MockGpu {
    pub fn new() -> Self {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        };
        Self {
            state: RefCell::new(MockState {
                next_raw: 0x1000,
                calls: Vec::new(),
                caps,
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::R8G8B8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                fail_swapchain_create: None,
                fail_end_commands: false,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                auto_complete: true,
                complete_on_wait: true,
                max_in_flight: 0,
                swapchain_images: HashMap::new(),
                next_image: 0,
                fences: HashMap::new(),
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> Ref<'_, MockState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, MockState> {
        self.state.borrow_mut()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.borrow().fences.get(&fence).copied().unwrap_or(false)
    }

    /// Lets the GPU finish its oldest outstanding submission.
    pub fn complete_oldest(&self) -> Option<vk::Fence> {
        self.state.borrow_mut().complete_front()
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    fn create<H: Handle + Copy>(&self, call: impl FnOnce(H) -> Call) -> H {
        let mut st = self.state.borrow_mut();
        let h: H = st.alloc();
        st.calls.push(call(h));
        h
    }
}

impl Gpu for MockGpu {
    fn wait_idle(&self) -> VkResult<()> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::WaitIdle);
        while st.complete_front().is_some() {}
        Ok(())
    }

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.borrow().caps)
    }

    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.borrow().formats.clone())
    }

    fn present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.state.borrow().modes.clone())
    }

    fn create_swapchain(
        &self,
        config: &SwapchainConfig,
        old: vk::SwapchainKHR,
    ) -> VkResult<vk::SwapchainKHR> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::CreateSwapchain { old });
        if let Some(err) = st.fail_swapchain_create.take() {
            return Err(err);
        }
        let sc: vk::SwapchainKHR = st.alloc();
        let images: Vec<vk::Image> = (0..config.image_count).map(|_| st.alloc()).collect();
        st.swapchain_images.insert(sc, images);
        st.next_image = 0;
        Ok(sc)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut st = self.state.borrow_mut();
        st.swapchain_images.remove(&swapchain);
        st.calls.push(Call::DestroySwapchain(swapchain));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state
            .borrow()
            .swapchain_images
            .get(&swapchain)
            .cloned()
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> VkResult<vk::ImageView> {
        Ok(self.create(Call::CreateImageView))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.record(Call::DestroyImageView(view));
    }

    fn create_render_pass(&self, _format: vk::Format) -> VkResult<vk::RenderPass> {
        Ok(self.create(Call::CreateRenderPass))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.record(Call::DestroyRenderPass(render_pass));
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _view: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        Ok(self.create(Call::CreateFramebuffer))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.record(Call::DestroyFramebuffer(framebuffer));
    }

    fn create_pipeline_layout(&self) -> VkResult<vk::PipelineLayout> {
        Ok(self.create(Call::CreatePipelineLayout))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.record(Call::DestroyPipelineLayout(layout));
    }

    fn create_graphics_pipeline(
        &self,
        _layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
    ) -> VkResult<vk::Pipeline> {
        Ok(self.create(|pipeline| Call::CreatePipeline {
            render_pass,
            pipeline,
        }))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.record(Call::DestroyPipeline(pipeline));
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.record(Call::DestroyBuffer(buffer));
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.record(Call::FreeMemory(memory));
    }

    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool> {
        Ok(self.create(|_| Call::CreateCommandPool { family }))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.record(Call::DestroyCommandPool(pool));
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::AllocateCommandBuffers(count));
        Ok((0..count).map(|_| st.alloc()).collect())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(self.create(Call::CreateSemaphore))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.record(Call::DestroySemaphore(semaphore));
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut st = self.state.borrow_mut();
        let fence: vk::Fence = st.alloc();
        st.fences.insert(fence, signaled);
        st.calls.push(Call::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut st = self.state.borrow_mut();
        st.fences.remove(&fence);
        st.calls.push(Call::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::WaitFence(fence));
        loop {
            if st.fences.get(&fence).copied().unwrap_or(false) {
                return Ok(());
            }
            if !st.complete_on_wait || st.complete_front().is_none() {
                return Err(vk::Result::TIMEOUT);
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut st = self.state.borrow_mut();
        st.fences.insert(fence, false);
        st.calls.push(Call::ResetFence(fence));
        Ok(())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::Acquire(swapchain));
        if let Some(scripted) = st.acquire_script.pop_front() {
            return scripted;
        }
        let count = st
            .swapchain_images
            .get(&swapchain)
            .map_or(0, |imgs| imgs.len() as u32);
        if count == 0 {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let index = st.next_image % count;
        st.next_image += 1;
        Ok((index, false))
    }

    fn submit(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        _wait: vk::Semaphore,
        _signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::Submit { queue, cmd, fence });
        st.pending.push_back(fence);
        st.max_in_flight = st.max_in_flight.max(st.pending.len());
        if st.auto_complete {
            st.complete_front();
        }
        Ok(())
    }

    fn submit_wait_only(
        &self,
        queue: vk::Queue,
        _wait: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::SubmitWaitOnly { queue, fence });
        st.pending.push_back(fence);
        st.max_in_flight = st.max_in_flight.max(st.pending.len());
        if st.auto_complete {
            st.complete_front();
        }
        Ok(())
    }

    fn present(
        &self,
        queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::Present { queue, image_index });
        st.present_script.pop_front().unwrap_or(Ok(false))
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::Begin(cmd));
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::End(cmd));
        if self.state.borrow().fail_end_commands {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        Ok(())
    }

    fn cmd_image_barrier(&self, _cmd: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.record(Call::Barrier(*barrier));
    }

    fn cmd_begin_render_pass(
        &self,
        _cmd: vk::CommandBuffer,
        _render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        _extent: vk::Extent2D,
        clear: [f32; 4],
    ) {
        self.record(Call::BeginRenderPass { framebuffer, clear });
    }

    fn cmd_end_render_pass(&self, _cmd: vk::CommandBuffer) {
        self.record(Call::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(Call::BindPipeline(pipeline));
    }

    fn cmd_set_viewport_scissor(&self, _cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.record(Call::SetViewportScissor(extent));
    }

    fn cmd_bind_vertex_buffer(&self, _cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        self.record(Call::BindVertexBuffer(buffer));
    }

    fn cmd_draw(&self, _cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        self.record(Call::Draw {
            vertices: vertex_count,
            instances: instance_count,
        });
    }
}
