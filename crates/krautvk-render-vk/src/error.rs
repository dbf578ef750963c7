// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no physical device meets the minimum requirements")]
    NoSuitableDevice,
    #[error("surface cannot back TRANSFER_DST swapchain images (supported: {0:?})")]
    UnsupportedSwapchainUsage(vk::ImageUsageFlags),
    #[error("surface lists neither MAILBOX nor FIFO")]
    UnsupportedPresentMode,
    #[error("surface reports no formats")]
    NoSurfaceFormats,
    #[error("fence of frame slot {slot} did not signal in time")]
    FenceTimeout { slot: usize },
    #[error("acquired image index {0} is outside the live swapchain")]
    ImageIndexOutOfRange(u32),
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}

/// `map_err` adapter that tags a raw result with the call that produced it.
pub(crate) fn vk_call(call: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
    move |result| RenderError::Vulkan { call, result }
}

/// Setup stage that failed; each maps to one status code of the C ABI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStage {
    WindowSystem,
    Window,
    VulkanUnsupported,
    Instance,
    Device,
    Surface,
    Semaphore,
    RenderPass,
    Framebuffers,
    Pipelines,
    Fence,
    CommandBuffer,
    VertexBuffer,
    Swapchain,
}

impl InitStage {
    pub fn status_code(self) -> i32 {
        match self {
            InitStage::WindowSystem => -1,
            InitStage::Window => -2,
            InitStage::VulkanUnsupported => -3,
            InitStage::Instance => -4,
            InitStage::Device => -5,
            InitStage::Surface => -6,
            InitStage::Semaphore => -7,
            InitStage::RenderPass => -8,
            InitStage::Framebuffers => -9,
            InitStage::Pipelines => -10,
            InitStage::Fence => -11,
            InitStage::CommandBuffer => -12,
            InitStage::VertexBuffer => -13,
            InitStage::Swapchain => -14,
        }
    }

    /// Stage a core error belongs to when it surfaces during setup.
    pub(crate) fn of(err: &RenderError) -> InitStage {
        match err {
            // No usable adapter is reported like a missing driver.
            RenderError::NoSuitableDevice => InitStage::VulkanUnsupported,
            RenderError::FenceTimeout { .. } => InitStage::Fence,
            RenderError::Vulkan { call, .. } => match *call {
                "vkCreateRenderPass" => InitStage::RenderPass,
                "vkCreateFramebuffer" => InitStage::Framebuffers,
                "vkCreateSemaphore" => InitStage::Semaphore,
                "vkCreateFence" => InitStage::Fence,
                "vkCreateCommandPool" | "vkAllocateCommandBuffers" => InitStage::CommandBuffer,
                "vkCreatePipelineLayout" | "vkCreateGraphicsPipelines" => InitStage::Pipelines,
                _ => InitStage::Swapchain,
            },
            _ => InitStage::Swapchain,
        }
    }
}

#[derive(Debug, Error)]
#[error("{stage:?} setup failed: {source}")]
pub struct InitError {
    stage: InitStage,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl InitError {
    pub fn new(stage: InitStage, source: impl Into<anyhow::Error>) -> Self {
        let source: anyhow::Error = source.into();
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn stage(&self) -> InitStage {
        self.stage
    }

    pub fn status_code(&self) -> i32 {
        self.stage.status_code()
    }
}

impl From<RenderError> for InitError {
    fn from(err: RenderError) -> Self {
        InitError::new(InitStage::of(&err), err)
    }
}

pub(crate) trait StageExt<T> {
    fn stage(self, stage: InitStage) -> Result<T, InitError>;
}

impl<T, E: Into<anyhow::Error>> StageExt<T> for Result<T, E> {
    fn stage(self, stage: InitStage) -> Result<T, InitError> {
        self.map_err(|e| InitError::new(stage, e))
    }
}
