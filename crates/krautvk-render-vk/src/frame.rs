// SPDX-License-Identifier: CEPL-1.0
use crate::error::{vk_call, RenderError};
use crate::gpu::{Gpu, QueueRef, Scoped};
use crate::record::CommandRecorder;
use crate::swapchain::{Recreation, SwapchainManager};
use ash::vk;
use std::rc::Rc;
use tracing::{debug, error};

/// Monotonic frame counter; the active slot is `frame mod slots`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCursor {
    frame: u64,
    slots: usize,
}

impl FrameCursor {
    pub fn new(slots: usize) -> Self {
        Self {
            frame: 0,
            slots: slots.max(1),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn slot(&self) -> usize {
        (self.frame % self.slots as u64) as usize
    }

    pub fn advance(&mut self) {
        self.frame += 1;
    }
}

/// Per-frame resources, reused every `slots`-th frame.
pub struct RenderingResourceSlot<G: Gpu> {
    pub command_buffer: vk::CommandBuffer,
    image_available: Scoped<vk::Semaphore, G>,
    render_finished: Scoped<vk::Semaphore, G>,
    fence: Scoped<vk::Fence, G>,
}

impl<G: Gpu> RenderingResourceSlot<G> {
    pub fn fence(&self) -> vk::Fence {
        self.fence.handle()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Swapchain was stale and got rebuilt; nothing was presented.
    Recreated,
    /// Zero-area surface; try again on the next poll.
    Skipped,
}

pub struct FrameSynchronizer<G: Gpu> {
    // Slots go before the pool that owns their command buffers.
    slots: Vec<RenderingResourceSlot<G>>,
    pool: Scoped<vk::CommandPool, G>,
    cursor: FrameCursor,
    graphics: QueueRef,
    present: QueueRef,
    fence_timeout_ns: u64,
    gpu: Rc<G>,
}

impl<G: Gpu> FrameSynchronizer<G> {
    /// Command buffers belong to the graphics family. Fences start signaled so
    /// the first pass over the ring does not wait.
    pub fn new(
        gpu: Rc<G>,
        graphics: QueueRef,
        present: QueueRef,
        slot_count: usize,
        fence_timeout_ns: u64,
    ) -> Result<Self, RenderError> {
        let pool = Scoped::new(
            &gpu,
            gpu.create_command_pool(graphics.family)
                .map_err(vk_call("vkCreateCommandPool"))?,
        );
        let buffers = gpu
            .allocate_command_buffers(pool.handle(), slot_count as u32)
            .map_err(vk_call("vkAllocateCommandBuffers"))?;

        let mut slots = Vec::with_capacity(slot_count);
        for command_buffer in buffers {
            let image_available = Scoped::new(
                &gpu,
                gpu.create_semaphore()
                    .map_err(vk_call("vkCreateSemaphore"))?,
            );
            let render_finished = Scoped::new(
                &gpu,
                gpu.create_semaphore()
                    .map_err(vk_call("vkCreateSemaphore"))?,
            );
            let fence = Scoped::new(
                &gpu,
                gpu.create_fence(true).map_err(vk_call("vkCreateFence"))?,
            );
            slots.push(RenderingResourceSlot {
                command_buffer,
                image_available,
                render_finished,
                fence,
            });
        }

        Ok(Self {
            slots,
            pool,
            cursor: FrameCursor::new(slot_count),
            graphics,
            present,
            fence_timeout_ns,
            gpu,
        })
    }

    pub fn cursor(&self) -> FrameCursor {
        self.cursor
    }

    pub fn slots(&self) -> &[RenderingResourceSlot<G>] {
        &self.slots
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.pool.handle()
    }

    // STRICT PER-FRAME ORDER:
    // 1) wait slot fence (bounded)   -> timeout drops the frame
    // 2) acquire with image_available -> out-of-date recreates, frame skipped
    // 3) record into the slot's command buffer
    // 4) reset slot fence             -> only once a submit is certain to follow
    // 5) submit: wait image_available, signal render_finished + fence
    // 6) present waiting render_finished -> out-of-date/suboptimal recreates
    // The cursor moves once per call no matter how the frame ends.
    pub fn draw_frame(
        &mut self,
        swapchain: &mut SwapchainManager<G>,
        recorder: &mut CommandRecorder<G>,
    ) -> Result<FrameStatus, RenderError> {
        let slot_index = self.cursor.slot();
        self.cursor.advance();
        let slot = &self.slots[slot_index];
        let gpu = &*self.gpu;

        match gpu.wait_for_fence(slot.fence.handle(), self.fence_timeout_ns) {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                error!(slot = slot_index, "Fence time out, frame dropped");
                return Err(RenderError::FenceTimeout { slot: slot_index });
            }
            Err(e) => return Err(vk_call("vkWaitForFences")(e)),
        }

        let Some(swapchain_handle) = swapchain.handle() else {
            return rebuild(swapchain);
        };

        let image_index = match gpu
            .acquire_next_image(swapchain_handle, slot.image_available.handle())
        {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("acquire: swapchain out of date");
                return rebuild(swapchain);
            }
            Err(e) => return Err(vk_call("vkAcquireNextImageKHR")(e)),
        };

        let recorded = swapchain
            .target(image_index)
            .ok_or(RenderError::ImageIndexOutOfRange(image_index))
            .and_then(|target| recorder.record(slot.command_buffer, &target));
        if let Err(e) = recorded {
            error!(slot = slot_index, image = image_index, "frame abandoned after acquire: {e}");
            // The acquire semaphore is signaled and the image is held; consume
            // the former and release the latter through a rebuild.
            let drained = gpu
                .reset_fence(slot.fence.handle())
                .map_err(vk_call("vkResetFences"))
                .and_then(|()| {
                    gpu.submit_wait_only(
                        self.graphics.handle,
                        slot.image_available.handle(),
                        slot.fence.handle(),
                    )
                    .map_err(vk_call("vkQueueSubmit"))
                });
            if let Err(d) = drained {
                error!(slot = slot_index, "acquire semaphore not drained: {d}");
            }
            if let Err(r) = swapchain.recreate() {
                error!("swapchain rebuild after abandoned frame failed: {r}");
            }
            return Err(e);
        }

        gpu.reset_fence(slot.fence.handle())
            .map_err(vk_call("vkResetFences"))?;
        gpu.submit(
            self.graphics.handle,
            slot.command_buffer,
            slot.image_available.handle(),
            slot.render_finished.handle(),
            slot.fence.handle(),
        )
        .map_err(vk_call("vkQueueSubmit"))?;

        match gpu.present(
            self.present.handle,
            swapchain_handle,
            image_index,
            slot.render_finished.handle(),
        ) {
            Ok(false) => Ok(FrameStatus::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("present: swapchain stale");
                rebuild(swapchain)
            }
            Err(e) => Err(vk_call("vkQueuePresentKHR")(e)),
        }
    }
}

fn rebuild<G: Gpu>(swapchain: &mut SwapchainManager<G>) -> Result<FrameStatus, RenderError> {
    Ok(match swapchain.recreate()? {
        Recreation::Rebuilt(_) => FrameStatus::Recreated,
        Recreation::Skipped => FrameStatus::Skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockGpu};
    use crate::record::tests::mock_vertices;
    use crate::record::QueueFamilies;
    use ash::vk::Handle;
    use krautvk_render::RenderSize;

    struct Harness {
        frames: FrameSynchronizer<MockGpu>,
        recorder: CommandRecorder<MockGpu>,
        swapchain: SwapchainManager<MockGpu>,
        gpu: Rc<MockGpu>,
    }

    fn graphics() -> QueueRef {
        QueueRef {
            handle: vk::Queue::from_raw(0x51),
            family: 0,
        }
    }

    fn harness(slots: usize) -> Harness {
        let gpu = Rc::new(MockGpu::new());
        let mut swapchain = SwapchainManager::new(
            Rc::clone(&gpu),
            RenderSize {
                width: 640,
                height: 480,
            },
        );
        swapchain.recreate().unwrap();
        let recorder = CommandRecorder::new(
            Rc::clone(&gpu),
            mock_vertices(&gpu),
            QueueFamilies {
                graphics: 0,
                present: 0,
            },
            [0.4, 0.6, 1.0, 0.0],
        )
        .unwrap();
        let frames =
            FrameSynchronizer::new(Rc::clone(&gpu), graphics(), graphics(), slots, 1_000_000_000)
                .unwrap();
        gpu.clear_calls();
        Harness {
            frames,
            recorder,
            swapchain,
            gpu,
        }
    }

    impl Harness {
        fn draw(&mut self) -> Result<FrameStatus, RenderError> {
            self.frames
                .draw_frame(&mut self.swapchain, &mut self.recorder)
        }
    }

    #[test]
    fn test_cursor_wraps_over_slots() {
        let mut c = FrameCursor::new(3);
        let seen: Vec<usize> = (0..7)
            .map(|_| {
                let s = c.slot();
                c.advance();
                s
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(c.frame(), 7);
    }

    #[test]
    fn test_slots_created_with_signaled_fences() {
        let gpu = Rc::new(MockGpu::new());
        let frames = FrameSynchronizer::new(Rc::clone(&gpu), graphics(), graphics(), 2, 1).unwrap();
        assert_eq!(frames.slots().len(), 2);
        assert!(frames.slots().iter().all(|s| gpu.fence_signaled(s.fence())));
        assert_eq!(
            gpu.count(|c| matches!(c, Call::CreateSemaphore(_))),
            4
        );
        assert_eq!(
            gpu.count(|c| matches!(c, Call::CreateCommandPool { family: 0 })),
            1
        );
    }

    #[test]
    fn test_frame_order_wait_acquire_record_reset_submit_present() {
        let mut h = harness(3);
        assert_eq!(h.draw().unwrap(), FrameStatus::Presented);

        let calls = h.gpu.calls();
        let at = |pred: &dyn Fn(&Call) -> bool| calls.iter().position(|c| pred(c)).unwrap();
        let wait = at(&|c| matches!(c, Call::WaitFence(_)));
        let acquire = at(&|c| matches!(c, Call::Acquire(_)));
        let end = at(&|c| matches!(c, Call::End(_)));
        let reset = at(&|c| matches!(c, Call::ResetFence(_)));
        let submit = at(&|c| matches!(c, Call::Submit { .. }));
        let present = at(&|c| matches!(c, Call::Present { .. }));
        assert!(wait < acquire && acquire < end && end < reset);
        assert!(reset < submit && submit < present);

        let slot0 = h.frames.slots()[0].fence();
        assert!(calls.contains(&Call::WaitFence(slot0)));
        assert!(calls.iter().any(|c| matches!(c, Call::Submit { fence, .. } if *fence == slot0)));
    }

    #[test]
    fn test_frame_ring_bounds_frames_in_flight() {
        const N: usize = 3;
        let mut h = harness(N);
        h.gpu.state_mut().auto_complete = false;
        let first_fence = h.frames.slots()[0].fence();

        for _ in 0..N {
            assert_eq!(h.draw().unwrap(), FrameStatus::Presented);
        }
        // Nothing has completed yet: N frames are in flight, none forced.
        assert_eq!(h.gpu.state().in_flight(), N);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::GpuComplete(_))), 0);

        h.gpu.clear_calls();
        assert_eq!(h.draw().unwrap(), FrameStatus::Presented);

        // Frame N+1 reused slot 0 and could only submit after frame 1 finished.
        let calls = h.gpu.calls();
        let completed = calls
            .iter()
            .position(|c| *c == Call::GpuComplete(first_fence))
            .unwrap();
        let submit = calls
            .iter()
            .position(|c| matches!(c, Call::Submit { fence, .. } if *fence == first_fence))
            .unwrap();
        assert!(completed < submit);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::GpuComplete(_))), 1);

        for _ in 0..10 {
            h.draw().unwrap();
        }
        assert_eq!(h.gpu.state().max_in_flight, N);
    }

    #[test]
    fn test_fence_timeout_drops_frame() {
        let mut h = harness(2);
        {
            let mut st = h.gpu.state_mut();
            st.auto_complete = false;
            st.complete_on_wait = false;
        }
        h.draw().unwrap();
        h.draw().unwrap();
        h.gpu.clear_calls();

        match h.draw() {
            Err(RenderError::FenceTimeout { slot }) => assert_eq!(slot, 0),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.gpu.count(|c| matches!(c, Call::Acquire(_))), 0);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::Submit { .. })), 0);
        // The cursor still moved on.
        assert_eq!(h.frames.cursor().frame(), 3);
        assert_eq!(h.frames.cursor().slot(), 1);

        // GPU catches up; the ring resumes.
        h.gpu.complete_oldest();
        h.gpu.complete_oldest();
        assert_eq!(h.draw().unwrap(), FrameStatus::Presented);
    }

    #[test]
    fn test_acquire_out_of_date_recreates_and_keeps_fence_signaled() {
        let mut h = harness(2);
        let old = h.swapchain.handle().unwrap();
        h.gpu
            .state_mut()
            .acquire_script
            .push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

        assert_eq!(h.draw().unwrap(), FrameStatus::Recreated);
        assert_ne!(h.swapchain.handle().unwrap(), old);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::Submit { .. })), 0);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::ResetFence(_))), 0);
        assert!(h.gpu.fence_signaled(h.frames.slots()[0].fence()));
        assert_eq!(h.frames.cursor().frame(), 1);

        // Slot 0 comes round again without blocking.
        h.draw().unwrap();
        assert_eq!(h.draw().unwrap(), FrameStatus::Presented);
    }

    #[test]
    fn test_acquire_suboptimal_still_presents() {
        let mut h = harness(2);
        h.gpu.state_mut().acquire_script.push_back(Ok((0, true)));
        assert_eq!(h.draw().unwrap(), FrameStatus::Presented);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::CreateSwapchain { .. })), 0);
    }

    #[test]
    fn test_present_suboptimal_or_out_of_date_recreates() {
        let mut h = harness(2);
        {
            let mut st = h.gpu.state_mut();
            st.present_script.push_back(Ok(true));
            st.present_script
                .push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        assert_eq!(h.draw().unwrap(), FrameStatus::Recreated);
        assert_eq!(h.draw().unwrap(), FrameStatus::Recreated);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::CreateSwapchain { .. })), 2);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::Present { .. })), 2);
        assert_eq!(h.draw().unwrap(), FrameStatus::Presented);
    }

    #[test]
    fn test_other_acquire_errors_are_hard_failures() {
        let mut h = harness(2);
        h.gpu
            .state_mut()
            .acquire_script
            .push_back(Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(
            h.draw(),
            Err(RenderError::Vulkan {
                call: "vkAcquireNextImageKHR",
                result: vk::Result::ERROR_DEVICE_LOST
            })
        ));
    }

    #[test]
    fn test_minimized_surface_skips_frames() {
        let mut h = harness(2);
        h.gpu.state_mut().caps.current_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        h.gpu
            .state_mut()
            .acquire_script
            .push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert_eq!(h.draw().unwrap(), FrameStatus::Skipped);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::DestroySwapchain(_))), 0);
    }

    #[test]
    fn test_out_of_range_image_index() {
        let mut h = harness(2);
        h.gpu.state_mut().acquire_script.push_back(Ok((42, false)));
        assert!(matches!(
            h.draw(),
            Err(RenderError::ImageIndexOutOfRange(42))
        ));
        // The acquire was drained through the slot fence, which the GPU signals.
        let fence = h.frames.slots()[0].fence();
        assert_eq!(h.gpu.count(|c| matches!(c, Call::SubmitWaitOnly { .. })), 1);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::Submit { .. })), 0);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::Present { .. })), 0);
        assert!(h.gpu.fence_signaled(fence));
        // The held image went back with the old swapchain.
        assert_eq!(h.gpu.count(|c| matches!(c, Call::CreateSwapchain { .. })), 1);
        assert!(h.swapchain.handle().is_some());
    }

    #[test]
    fn test_record_failure_releases_acquired_image() {
        let mut h = harness(2);
        let old = h.swapchain.handle().unwrap();
        h.gpu.state_mut().fail_end_commands = true;
        assert!(matches!(
            h.draw(),
            Err(RenderError::Vulkan {
                call: "vkEndCommandBuffer",
                ..
            })
        ));
        let calls = h.gpu.calls();
        let acquire = calls
            .iter()
            .position(|c| matches!(c, Call::Acquire(_)))
            .unwrap();
        let drain = calls
            .iter()
            .position(|c| matches!(c, Call::SubmitWaitOnly { .. }))
            .unwrap();
        let rebuilt = calls
            .iter()
            .position(|c| matches!(c, Call::CreateSwapchain { old: o } if *o == old))
            .unwrap();
        assert!(acquire < drain && drain < rebuilt);
        assert_eq!(h.gpu.count(|c| matches!(c, Call::Present { .. })), 0);

        // Both slots keep working once recording recovers.
        h.gpu.state_mut().fail_end_commands = false;
        h.gpu.clear_calls();
        assert!(matches!(h.draw(), Ok(FrameStatus::Presented)));
        assert!(matches!(h.draw(), Ok(FrameStatus::Presented)));
        assert_eq!(h.gpu.count(|c| matches!(c, Call::Present { .. })), 2);
    }

    #[test]
    fn test_command_buffers_come_from_graphics_pool() {
        let h = harness(3);
        assert_ne!(h.frames.command_pool(), vk::CommandPool::null());
        let raw: Vec<u64> = h
            .frames
            .slots()
            .iter()
            .map(|s| s.command_buffer.as_raw())
            .collect();
        assert_eq!(raw.len(), 3);
    }
}
