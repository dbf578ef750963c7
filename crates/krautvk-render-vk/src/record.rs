// SPDX-License-Identifier: CEPL-1.0
use crate::error::{vk_call, RenderError};
use crate::gpu::{Gpu, ImageBarrier, Scoped};
use crate::swapchain::RenderTarget;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::rc::Rc;
use tracing::debug;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 4],
    pub color: [f32; 4],
}

/// Triangle-strip quad.
pub const QUAD: [Vertex; 4] = [
    Vertex {
        pos: [-0.7, -0.7, 0.0, 1.0],
        color: [1.0, 0.0, 1.0, 0.0],
    },
    Vertex {
        pos: [-0.7, 0.7, 0.0, 1.0],
        color: [1.0, 1.0, 0.0, 0.0],
    },
    Vertex {
        pos: [0.7, -0.7, 0.0, 1.0],
        color: [0.0, 1.0, 1.0, 0.0],
    },
    Vertex {
        pos: [0.7, 0.7, 0.0, 1.0],
        color: [0.0, 1.0, 0.0, 0.0],
    },
];
pub const VERTEX_COUNT: u32 = QUAD.len() as u32;
pub const INSTANCE_COUNT: u32 = 1;

/// Device-local vertex data. Buffer is released before its memory.
pub struct VertexBuffer<G: Gpu> {
    pub buffer: Scoped<vk::Buffer, G>,
    pub memory: Scoped<vk::DeviceMemory, G>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn shared(&self) -> bool {
        self.graphics == self.present
    }
}

struct BuiltPipeline<G: Gpu> {
    pipeline: Scoped<vk::Pipeline, G>,
    render_pass_epoch: u64,
}

pub struct CommandRecorder<G: Gpu> {
    pipeline: Option<BuiltPipeline<G>>,
    layout: Scoped<vk::PipelineLayout, G>,
    vertices: VertexBuffer<G>,
    families: QueueFamilies,
    clear_color: [f32; 4],
    gpu: Rc<G>,
}

impl<G: Gpu> CommandRecorder<G> {
    pub fn new(
        gpu: Rc<G>,
        vertices: VertexBuffer<G>,
        families: QueueFamilies,
        clear_color: [f32; 4],
    ) -> Result<Self, RenderError> {
        let layout = Scoped::new(
            &gpu,
            gpu.create_pipeline_layout()
                .map_err(vk_call("vkCreatePipelineLayout"))?,
        );
        Ok(Self {
            pipeline: None,
            layout,
            vertices,
            families,
            clear_color,
            gpu,
        })
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    /// The pipeline is tied to the render pass; rebuild it when the swapchain
    /// produced a new one.
    pub fn ensure_pipeline(
        &mut self,
        render_pass: vk::RenderPass,
        render_pass_epoch: u64,
    ) -> Result<vk::Pipeline, RenderError> {
        if let Some(built) = &self.pipeline {
            if built.render_pass_epoch == render_pass_epoch {
                return Ok(built.pipeline.handle());
            }
        }
        self.pipeline = None;
        let pipeline = Scoped::new(
            &self.gpu,
            self.gpu
                .create_graphics_pipeline(self.layout.handle(), render_pass)
                .map_err(vk_call("vkCreateGraphicsPipelines"))?,
        );
        debug!(render_pass_epoch, "graphics pipeline built");
        let handle = pipeline.handle();
        self.pipeline = Some(BuiltPipeline {
            pipeline,
            render_pass_epoch,
        });
        Ok(handle)
    }

    // STRICT ORDER:
    // begin -> [acquire barrier] -> render pass { pipeline, viewport/scissor,
    // vertex buffer, draw } -> [release barrier] -> end
    // Ownership barriers only exist when graphics and present families differ.
    pub fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        target: &RenderTarget,
    ) -> Result<(), RenderError> {
        let pipeline = self.ensure_pipeline(target.render_pass, target.render_pass_epoch)?;
        let gpu = &*self.gpu;

        gpu.begin_commands(cmd)
            .map_err(vk_call("vkBeginCommandBuffer"))?;

        if !self.families.shared() {
            gpu.cmd_image_barrier(cmd, &self.acquire_barrier(target.image));
        }

        gpu.cmd_begin_render_pass(
            cmd,
            target.render_pass,
            target.framebuffer,
            target.extent,
            self.clear_color,
        );
        gpu.cmd_bind_pipeline(cmd, pipeline);
        gpu.cmd_set_viewport_scissor(cmd, target.extent);
        gpu.cmd_bind_vertex_buffer(cmd, self.vertices.buffer.handle());
        gpu.cmd_draw(cmd, VERTEX_COUNT, INSTANCE_COUNT);
        gpu.cmd_end_render_pass(cmd);

        if !self.families.shared() {
            gpu.cmd_image_barrier(cmd, &self.release_barrier(target.image));
        }

        gpu.end_commands(cmd).map_err(vk_call("vkEndCommandBuffer"))
    }

    /// present family -> graphics family, before the render pass writes.
    fn acquire_barrier(&self, image: vk::Image) -> ImageBarrier {
        ImageBarrier {
            image,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags::MEMORY_READ,
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_family: self.families.present,
            dst_family: self.families.graphics,
        }
    }

    /// graphics family -> present family, after the render pass.
    fn release_barrier(&self, image: vk::Image) -> ImageBarrier {
        ImageBarrier {
            image,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: vk::AccessFlags::MEMORY_READ,
            old_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_family: self.families.graphics,
            dst_family: self.families.present,
        }
    }
}
