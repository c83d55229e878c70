//! Frames-in-flight management.
//!
//! The [`FrameManager`] owns per-slot synchronization (fence, image-available
//! semaphore, command buffer) and per-swapchain-image render-finished
//! semaphores. It drives every slot through
//! `Idle -> Acquired -> Recording -> Recorded -> Submitted -> Idle`.
//!
//! All device interaction goes through [`FrameBackend`] so the state machine
//! can be exercised without a GPU.

use crate::command::{begin_command_buffer, end_command_buffer};
use crate::deletion::DeletionQueue;
use crate::error::{GpuError, Result};
use crate::swapchain::{AcquireOutcome, Swapchain};
use crate::sync;
use ash::vk;
use lumen_core::constants::DEFAULT_FRAMES_IN_FLIGHT;

/// Device operations the frame manager needs.
pub trait FrameBackend {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);

    /// Block until `fence` is signaled. A timeout is fatal.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout_ns: u64)
        -> Result<AcquireOutcome>;

    /// Reset and begin a command buffer for one-time submission.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn submit(
        &self,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal_semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Present `image_index`. Returns `true` when the swapchain needs recreation.
    fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool>;
}

/// [`FrameBackend`] over a real device, queue and swapchain.
pub struct VulkanFrameBackend<'a> {
    device: &'a ash::Device,
    swapchain_loader: &'a ash::khr::swapchain::Device,
    swapchain: &'a Swapchain,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl<'a> VulkanFrameBackend<'a> {
    pub fn new(
        device: &'a ash::Device,
        swapchain_loader: &'a ash::khr::swapchain::Device,
        swapchain: &'a Swapchain,
        queue: vk::Queue,
        command_pool: vk::CommandPool,
    ) -> Self {
        Self {
            device,
            swapchain_loader,
            swapchain,
            queue,
            command_pool,
        }
    }
}

impl FrameBackend for VulkanFrameBackend<'_> {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        unsafe { sync::create_fence(self.device, signaled) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe { sync::create_semaphore(self.device) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&alloc_info)? })
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, command_buffers);
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { sync::wait_for_fence(self.device, fence, timeout_ns, "frame fence wait") }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { sync::reset_fence(self.device, fence) }
    }

    fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        unsafe {
            self.swapchain
                .acquire_next_image(self.swapchain_loader, semaphore, timeout_ns)
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            begin_command_buffer(
                self.device,
                command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { end_command_buffer(self.device, command_buffer) }
    }

    fn submit(
        &self,
        command_buffer: vk::CommandBuffer,
        wait_semaphore: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal_semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let command_buffers = [command_buffer];
        let wait_semaphores = [wait_semaphore];
        let wait_stages = [wait_stage];
        let signal_semaphores = [signal_semaphore];

        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(|e| GpuError::from_wait("frame submit", e))
        }
    }

    fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool> {
        unsafe {
            self.swapchain
                .present(self.swapchain_loader, self.queue, image_index, wait_semaphore)
        }
    }
}

/// Frame manager configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameManagerConfig {
    pub frames_in_flight: usize,
    /// Timeout for fence waits and image acquisition.
    pub fence_timeout_ns: u64,
}

impl Default for FrameManagerConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout_ns: u64::MAX,
        }
    }
}

impl FrameManagerConfig {
    pub fn frames_in_flight(mut self, n: usize) -> Self {
        self.frames_in_flight = n;
        self
    }

    pub fn fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }
}

/// Lifecycle state of a frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquired,
    Recording,
    Recorded,
    Submitted,
}

struct FrameSlot {
    fence: vk::Fence,
    image_available: vk::Semaphore,
    command_buffer: vk::CommandBuffer,
    state: SlotState,
    image_index: u32,
    suboptimal: bool,
}

/// The frame currently being produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveFrame {
    /// Slot index in `[0, frames_in_flight)`.
    pub frame_index: usize,
    /// Acquired swapchain image.
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
    /// The swapchain still works but no longer matches the surface exactly.
    pub suboptimal: bool,
}

/// Outcome of [`FrameManager::begin_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStart {
    Ready(ActiveFrame),
    /// No image was acquired. Recreate the swapchain and try again.
    SwapchainOutOfDate,
}

/// Coordinates CPU recording against GPU execution for N frames in flight.
pub struct FrameManager {
    slots: Vec<FrameSlot>,
    render_finished: Vec<vk::Semaphore>,
    current: usize,
    frame_number: u64,
    config: FrameManagerConfig,
}

impl FrameManager {
    /// Create slots for `config.frames_in_flight` frames and one
    /// render-finished semaphore per swapchain image.
    pub fn new<B: FrameBackend>(
        backend: &B,
        config: FrameManagerConfig,
        image_count: usize,
    ) -> Result<Self> {
        if config.frames_in_flight == 0 {
            return Err(GpuError::invalid_spec(
                "frame manager",
                "at least one frame in flight",
                "0",
            ));
        }

        let command_buffers = backend.allocate_command_buffers(config.frames_in_flight as u32)?;
        let mut slots = Vec::with_capacity(config.frames_in_flight);
        for command_buffer in command_buffers {
            slots.push(FrameSlot {
                // Signaled so the first wait on every slot returns immediately.
                fence: backend.create_fence(true)?,
                image_available: backend.create_semaphore()?,
                command_buffer,
                state: SlotState::Idle,
                image_index: 0,
                suboptimal: false,
            });
        }

        let render_finished = (0..image_count)
            .map(|_| backend.create_semaphore())
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            frames_in_flight = config.frames_in_flight,
            image_count,
            "created frame manager"
        );

        Ok(Self {
            slots,
            render_finished,
            current: 0,
            frame_number: 0,
            config,
        })
    }

    fn slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    fn slot_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }

    fn expect_state(&self, expected: SlotState, operation: &str) -> Result<()> {
        let state = self.slot().state;
        if state != expected {
            return Err(GpuError::InvalidState(format!(
                "{operation} requires frame slot {} to be {expected:?}, it is {state:?}",
                self.current
            )));
        }
        Ok(())
    }

    fn active_frame(&self) -> ActiveFrame {
        let slot = self.slot();
        ActiveFrame {
            frame_index: self.current,
            image_index: slot.image_index,
            command_buffer: slot.command_buffer,
            suboptimal: slot.suboptimal,
        }
    }

    /// Wait for the current slot to be free and acquire a swapchain image.
    ///
    /// The fence is only reset after an image was acquired, so an out-of-date
    /// swapchain leaves the slot ready to retry. Calling this again before the
    /// frame is submitted returns the same frame without waiting.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame<B: FrameBackend>(&mut self, backend: &B) -> Result<FrameStart> {
        match self.slot().state {
            SlotState::Idle => {}
            SlotState::Acquired | SlotState::Recording | SlotState::Recorded => {
                return Ok(FrameStart::Ready(self.active_frame()));
            }
            SlotState::Submitted => {
                return Err(GpuError::InvalidState(
                    "begin_frame called before end_frame for the submitted frame".to_string(),
                ));
            }
        }

        let timeout = self.config.fence_timeout_ns;
        let (fence, image_available) = {
            let slot = self.slot();
            (slot.fence, slot.image_available)
        };

        backend.wait_for_fence(fence, timeout)?;

        let (image_index, suboptimal) = match backend.acquire_next_image(image_available, timeout)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                tracing::debug!("swapchain out of date on acquire");
                return Ok(FrameStart::SwapchainOutOfDate);
            }
        };

        if image_index as usize >= self.render_finished.len() {
            return Err(GpuError::InvalidState(format!(
                "acquired image {image_index} but only {} render semaphores exist",
                self.render_finished.len()
            )));
        }

        backend.reset_fence(fence)?;

        let slot = self.slot_mut();
        slot.state = SlotState::Acquired;
        slot.image_index = image_index;
        slot.suboptimal = suboptimal;

        Ok(FrameStart::Ready(self.active_frame()))
    }

    /// Begin recording the current slot's command buffer.
    pub fn begin_command_recording<B: FrameBackend>(
        &mut self,
        backend: &B,
    ) -> Result<vk::CommandBuffer> {
        self.expect_state(SlotState::Acquired, "begin_command_recording")?;
        let cmd = self.slot().command_buffer;
        backend.begin_command_buffer(cmd)?;
        self.slot_mut().state = SlotState::Recording;
        Ok(cmd)
    }

    /// Finish recording the current slot's command buffer.
    pub fn end_command_recording<B: FrameBackend>(&mut self, backend: &B) -> Result<()> {
        self.expect_state(SlotState::Recording, "end_command_recording")?;
        backend.end_command_buffer(self.slot().command_buffer)?;
        self.slot_mut().state = SlotState::Recorded;
        Ok(())
    }

    /// Submit the recorded command buffer.
    ///
    /// Waits on image-available at color attachment output, signals the
    /// acquired image's render-finished semaphore and the slot fence.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit<B: FrameBackend>(&mut self, backend: &B) -> Result<()> {
        self.expect_state(SlotState::Recorded, "submit")?;
        let slot = self.slot();
        let render_finished = self.render_finished[slot.image_index as usize];
        backend.submit(
            slot.command_buffer,
            slot.image_available,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            render_finished,
            slot.fence,
        )?;
        self.slot_mut().state = SlotState::Submitted;
        Ok(())
    }

    /// Present the submitted frame, advance to the next slot and tick the
    /// deletion queue.
    ///
    /// Returns `true` when the swapchain must be recreated before the next frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_frame<B: FrameBackend>(
        &mut self,
        backend: &B,
        deletion_queue: &mut DeletionQueue,
    ) -> Result<bool> {
        self.expect_state(SlotState::Submitted, "end_frame")?;
        let slot = self.slot();
        let image_index = slot.image_index;
        let suboptimal = slot.suboptimal;

        let present_result =
            backend.present(image_index, self.render_finished[image_index as usize]);

        self.slot_mut().state = SlotState::Idle;
        self.current = (self.current + 1) % self.slots.len();
        self.frame_number += 1;
        deletion_queue.execute(false);

        Ok(present_result? || suboptimal)
    }

    /// Replace the render-finished semaphores after the swapchain was recreated.
    ///
    /// The device must be idle.
    pub fn recreate_image_semaphores<B: FrameBackend>(
        &mut self,
        backend: &B,
        image_count: usize,
    ) -> Result<()> {
        for semaphore in self.render_finished.drain(..) {
            backend.destroy_semaphore(semaphore);
        }
        for _ in 0..image_count {
            self.render_finished.push(backend.create_semaphore()?);
        }
        Ok(())
    }

    /// Destroy all synchronization objects and command buffers.
    ///
    /// The device must be idle.
    pub fn destroy<B: FrameBackend>(&mut self, backend: &B) {
        let command_buffers: Vec<_> = self.slots.iter().map(|s| s.command_buffer).collect();
        backend.free_command_buffers(&command_buffers);
        for slot in self.slots.drain(..) {
            backend.destroy_fence(slot.fence);
            backend.destroy_semaphore(slot.image_available);
        }
        for semaphore in self.render_finished.drain(..) {
            backend.destroy_semaphore(semaphore);
        }
    }

    /// Command buffer of the current slot.
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.slot().command_buffer
    }

    /// Swapchain image acquired for the current slot, if any.
    pub fn current_image_index(&self) -> Option<u32> {
        match self.slot().state {
            SlotState::Idle => None,
            _ => Some(self.slot().image_index),
        }
    }

    /// Current slot index.
    pub fn frame_index(&self) -> usize {
        self.current
    }

    /// Number of frames ended so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// State of the current slot.
    pub fn state(&self) -> SlotState {
        self.slot().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;

    /// Backend whose GPU finishes work instantly.
    #[derive(Default)]
    struct MockBackend {
        next_handle: Cell<u64>,
        fences: RefCell<HashMap<u64, bool>>,
        waits: Cell<usize>,
        resets: Cell<usize>,
        acquires: RefCell<Vec<AcquireOutcome>>,
        next_image: Cell<u32>,
        image_count: u32,
        submitted_signals: RefCell<Vec<vk::Semaphore>>,
        present_out_of_date: Cell<bool>,
        destroyed: Cell<usize>,
    }

    impl MockBackend {
        fn new(image_count: u32) -> Self {
            Self {
                next_handle: Cell::new(1),
                image_count,
                ..Self::default()
            }
        }

        fn handle(&self) -> u64 {
            let h = self.next_handle.get();
            self.next_handle.set(h + 1);
            h
        }
    }

    impl FrameBackend for MockBackend {
        fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
            let raw = self.handle();
            self.fences.borrow_mut().insert(raw, signaled);
            Ok(vk::Fence::from_raw(raw))
        }

        fn destroy_fence(&self, fence: vk::Fence) {
            self.fences.borrow_mut().remove(&fence.as_raw());
            self.destroyed.set(self.destroyed.get() + 1);
        }

        fn create_semaphore(&self) -> Result<vk::Semaphore> {
            Ok(vk::Semaphore::from_raw(self.handle()))
        }

        fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
            self.destroyed.set(self.destroyed.get() + 1);
        }

        fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
            Ok((0..count)
                .map(|_| vk::CommandBuffer::from_raw(self.handle()))
                .collect())
        }

        fn free_command_buffers(&self, _command_buffers: &[vk::CommandBuffer]) {}

        fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
            self.waits.set(self.waits.get() + 1);
            // An unsignaled fence would block forever on a real device.
            match self.fences.borrow().get(&fence.as_raw()) {
                Some(true) => Ok(()),
                _ => Err(GpuError::from_wait("mock fence", vk::Result::TIMEOUT)),
            }
        }

        fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
            self.resets.set(self.resets.get() + 1);
            self.fences.borrow_mut().insert(fence.as_raw(), false);
            Ok(())
        }

        fn acquire_next_image(
            &self,
            _semaphore: vk::Semaphore,
            _timeout_ns: u64,
        ) -> Result<AcquireOutcome> {
            if let Some(outcome) = self.acquires.borrow_mut().pop() {
                return Ok(outcome);
            }
            let image_index = self.next_image.get();
            self.next_image.set((image_index + 1) % self.image_count);
            Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal: false,
            })
        }

        fn begin_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> Result<()> {
            Ok(())
        }

        fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> Result<()> {
            Ok(())
        }

        fn submit(
            &self,
            _command_buffer: vk::CommandBuffer,
            _wait_semaphore: vk::Semaphore,
            wait_stage: vk::PipelineStageFlags,
            signal_semaphore: vk::Semaphore,
            fence: vk::Fence,
        ) -> Result<()> {
            assert_eq!(wait_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
            self.submitted_signals.borrow_mut().push(signal_semaphore);
            self.fences.borrow_mut().insert(fence.as_raw(), true);
            Ok(())
        }

        fn present(&self, _image_index: u32, _wait_semaphore: vk::Semaphore) -> Result<bool> {
            Ok(self.present_out_of_date.get())
        }
    }

    fn manager(backend: &MockBackend, frames: usize) -> FrameManager {
        let config = FrameManagerConfig::default().frames_in_flight(frames);
        FrameManager::new(backend, config, backend.image_count as usize).unwrap()
    }

    fn run_frame(
        frames: &mut FrameManager,
        backend: &MockBackend,
        deletion: &mut DeletionQueue,
    ) -> ActiveFrame {
        let FrameStart::Ready(frame) = frames.begin_frame(backend).unwrap() else {
            panic!("expected an acquired frame");
        };
        frames.begin_command_recording(backend).unwrap();
        frames.end_command_recording(backend).unwrap();
        frames.submit(backend).unwrap();
        frames.end_frame(backend, deletion).unwrap();
        frame
    }

    #[test]
    fn begin_frame_twice_does_not_deadlock() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);

        let first = frames.begin_frame(&backend).unwrap();
        // The fence is now reset; waiting on it again would block forever.
        let second = frames.begin_frame(&backend).unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.waits.get(), 1);
        assert_eq!(backend.resets.get(), 1);
        assert_eq!(frames.state(), SlotState::Acquired);
    }

    #[test]
    fn repeat_begin_while_recording_returns_same_frame() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);

        let FrameStart::Ready(first) = frames.begin_frame(&backend).unwrap() else {
            panic!("expected an acquired frame");
        };
        frames.begin_command_recording(&backend).unwrap();
        assert_eq!(
            frames.begin_frame(&backend).unwrap(),
            FrameStart::Ready(first)
        );
        assert_eq!(frames.state(), SlotState::Recording);
    }

    #[test]
    fn out_of_date_acquire_keeps_fence_signaled() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);
        backend.acquires.borrow_mut().push(AcquireOutcome::OutOfDate);

        assert_eq!(
            frames.begin_frame(&backend).unwrap(),
            FrameStart::SwapchainOutOfDate
        );
        assert_eq!(backend.resets.get(), 0);
        assert_eq!(frames.state(), SlotState::Idle);

        // Retrying after recreation waits again and succeeds.
        assert!(matches!(
            frames.begin_frame(&backend).unwrap(),
            FrameStart::Ready(_)
        ));
    }

    #[test]
    fn slots_cycle_and_frame_number_advances() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);
        let mut deletion = DeletionQueue::for_frames_in_flight(2);

        let indices: Vec<usize> = (0..5)
            .map(|_| run_frame(&mut frames, &backend, &mut deletion).frame_index)
            .collect();

        assert_eq!(indices, vec![0, 1, 0, 1, 0]);
        assert_eq!(frames.frame_number(), 5);
        assert_eq!(frames.current_image_index(), None);
    }

    #[test]
    fn submit_signals_render_finished_of_acquired_image() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);
        let mut deletion = DeletionQueue::for_frames_in_flight(2);

        for _ in 0..3 {
            run_frame(&mut frames, &backend, &mut deletion);
        }

        let signals = backend.submitted_signals.borrow();
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0], frames.render_finished[0]);
        assert_eq!(signals[1], frames.render_finished[1]);
        assert_eq!(signals[2], frames.render_finished[2]);
    }

    #[test]
    fn end_frame_ticks_deletion_queue() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);
        let mut deletion = DeletionQueue::for_frames_in_flight(2);

        let destroyed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&destroyed);
        deletion.submit(move || flag.set(true));

        for _ in 0..3 {
            run_frame(&mut frames, &backend, &mut deletion);
        }
        assert!(!destroyed.get());

        run_frame(&mut frames, &backend, &mut deletion);
        assert!(destroyed.get());
    }

    #[test]
    fn out_of_order_calls_are_invalid_state() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);
        let mut deletion = DeletionQueue::new(0);

        assert!(matches!(
            frames.submit(&backend),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            frames.end_frame(&backend, &mut deletion),
            Err(GpuError::InvalidState(_))
        ));

        frames.begin_frame(&backend).unwrap();
        assert!(frames.end_command_recording(&backend).is_err());
    }

    #[test]
    fn unsignaled_fence_surfaces_device_lost() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 1);
        let fence = frames.slots[0].fence;
        backend.fences.borrow_mut().insert(fence.as_raw(), false);

        assert!(matches!(
            frames.begin_frame(&backend),
            Err(GpuError::DeviceLost(_))
        ));
    }

    #[test]
    fn present_out_of_date_requests_recreation() {
        let backend = MockBackend::new(2);
        let mut frames = manager(&backend, 2);
        let mut deletion = DeletionQueue::new(0);
        backend.present_out_of_date.set(true);

        frames.begin_frame(&backend).unwrap();
        frames.begin_command_recording(&backend).unwrap();
        frames.end_command_recording(&backend).unwrap();
        frames.submit(&backend).unwrap();
        assert!(frames.end_frame(&backend, &mut deletion).unwrap());
        assert_eq!(frames.frame_index(), 1);
    }

    #[test]
    fn recreating_image_semaphores_matches_new_count() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);
        frames.recreate_image_semaphores(&backend, 5).unwrap();
        assert_eq!(frames.render_finished.len(), 5);
        assert_eq!(backend.destroyed.get(), 3);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let backend = MockBackend::new(3);
        let config = FrameManagerConfig::default().frames_in_flight(0);
        assert!(matches!(
            FrameManager::new(&backend, config, 3),
            Err(GpuError::InvalidSpecification { .. })
        ));
    }

    #[test]
    fn destroy_releases_everything() {
        let backend = MockBackend::new(3);
        let mut frames = manager(&backend, 2);
        frames.destroy(&backend);
        // Two fences, two image-available and three render-finished semaphores.
        assert_eq!(backend.destroyed.get(), 7);
        assert!(backend.fences.borrow().is_empty());
    }
}
