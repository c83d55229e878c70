//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use lumen_gpu::{
    CommandPool, DeletionQueue, FrameManager, FrameManagerConfig, FrameStart, GpuContext,
    SurfaceContext, Swapchain, VulkanFrameBackend,
};
use lumen_rt::RayTracingContext;
use winit::window::Window;

use crate::runner::AppConfig;

/// Everything an application needs to render, shared across all app methods.
pub struct AppContext {
    pub window: Arc<Window>,
    pub config: AppConfig,
    pub gpu: GpuContext,
    pub rt: RayTracingContext,
    pub surface: SurfaceContext,
    pub swapchain: Swapchain,
    pub command_pool: CommandPool,
    pub frames: FrameManager,
    /// Objects that in-flight frames may still reference go here.
    pub deletion: DeletionQueue,
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// # Safety
    /// The window must outlive the context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        config: AppConfig,
    ) -> anyhow::Result<Self> {
        let rt = RayTracingContext::new(&gpu)?;
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let swapchain = unsafe {
            surface.create_swapchain(
                &gpu,
                size.width.max(1),
                size.height.max(1),
                config.vsync,
                vk::SwapchainKHR::null(),
            )?
        };
        tracing::info!(
            "Swapchain created: {}x{} ({} images)",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.image_count()
        );

        let command_pool = unsafe {
            CommandPool::new(
                gpu.device(),
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };

        let frame_config = FrameManagerConfig::default().frames_in_flight(config.frames_in_flight);
        let frames = {
            let backend = VulkanFrameBackend::new(
                gpu.device(),
                &surface.swapchain_loader,
                &swapchain,
                gpu.graphics_queue(),
                command_pool.handle(),
            );
            FrameManager::new(&backend, frame_config, swapchain.image_count())?
        };

        Ok(Self {
            window,
            deletion: DeletionQueue::for_frames_in_flight(config.frames_in_flight),
            config,
            gpu,
            rt,
            surface,
            swapchain,
            command_pool,
            frames,
            last_frame_time: Instant::now(),
        })
    }

    /// Frame backend plus the state it drives, borrowed disjointly.
    fn frame_parts(&mut self) -> (VulkanFrameBackend<'_>, &mut FrameManager, &mut DeletionQueue) {
        let backend = VulkanFrameBackend::new(
            self.gpu.device(),
            &self.surface.swapchain_loader,
            &self.swapchain,
            self.gpu.graphics_queue(),
            self.command_pool.handle(),
        );
        (backend, &mut self.frames, &mut self.deletion)
    }

    pub fn begin_frame(&mut self) -> lumen_gpu::Result<FrameStart> {
        let (backend, frames, _) = self.frame_parts();
        frames.begin_frame(&backend)
    }

    pub fn begin_command_recording(&mut self) -> lumen_gpu::Result<vk::CommandBuffer> {
        let (backend, frames, _) = self.frame_parts();
        frames.begin_command_recording(&backend)
    }

    pub fn end_command_recording(&mut self) -> lumen_gpu::Result<()> {
        let (backend, frames, _) = self.frame_parts();
        frames.end_command_recording(&backend)
    }

    pub fn submit(&mut self) -> lumen_gpu::Result<()> {
        let (backend, frames, _) = self.frame_parts();
        frames.submit(&backend)
    }

    /// Present and advance. Returns `true` when the swapchain must be recreated.
    pub fn end_frame(&mut self) -> lumen_gpu::Result<bool> {
        let (backend, frames, deletion) = self.frame_parts();
        frames.end_frame(&backend, deletion)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn width(&self) -> u32 {
        self.swapchain.extent.width
    }

    pub fn height(&self) -> u32 {
        self.swapchain.extent.height
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent.width as f32 / self.swapchain.extent.height.max(1) as f32
    }

    pub fn swapchain_image(&self, index: u32) -> Option<vk::Image> {
        self.swapchain.images.get(index as usize).copied()
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.frames_in_flight()
    }

    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number()
    }

    /// Recreate the swapchain for a new size.
    ///
    /// Waits for the device to go idle first. Render-finished semaphores are
    /// recreated with the swapchain since a failed present may leave them
    /// signaled.
    pub(crate) fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.gpu.wait_idle()?;

        self.swapchain = unsafe {
            self.surface.recreate_swapchain(
                &self.gpu,
                &self.swapchain,
                width,
                height,
                self.config.vsync,
            )?
        };

        let image_count = self.swapchain.image_count();
        let (backend, frames, _) = self.frame_parts();
        frames.recreate_image_semaphores(&backend, image_count)?;

        tracing::info!(
            "Swapchain recreated: {}x{} ({} images)",
            self.swapchain.extent.width,
            self.swapchain.extent.height,
            image_count
        );
        Ok(())
    }

    /// Destroy frame sync objects, flush the deletion queue and release the
    /// swapchain and surface.
    ///
    /// # Safety
    /// The device must be idle.
    pub(crate) unsafe fn cleanup(&mut self) {
        let (backend, frames, deletion) = self.frame_parts();
        frames.destroy(&backend);
        let flushed = deletion.execute(true);
        tracing::debug!(flushed, "flushed deletion queue");

        let device = self.gpu.device();
        unsafe {
            self.command_pool.destroy(device);
            self.swapchain
                .destroy(device, &self.surface.swapchain_loader);
            self.surface.destroy();
        }
    }
}
