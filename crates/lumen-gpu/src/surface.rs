//! Surface management for windowed rendering.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{calculate_extent, select_present_mode, select_surface_format, Swapchain};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Vulkan surface plus the loaders needed to build swapchains for it.
pub struct SurfaceContext {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The window must outlive the surface.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = ash_window::create_surface(
            gpu.entry(),
            gpu.instance(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(gpu.entry(), gpu.instance());
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());

        let supported = surface_loader.get_physical_device_surface_support(
            gpu.physical_device(),
            gpu.graphics_queue_family(),
            surface,
        )?;
        if !supported {
            surface_loader.destroy_surface(surface, None);
            return Err(GpuError::SurfaceCreation(
                "graphics queue cannot present to this surface".to_string(),
            ));
        }

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
        })
    }

    /// Create a swapchain, optionally replacing `old_swapchain`.
    ///
    /// # Safety
    /// The old swapchain, if any, must not be in use.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Swapchain> {
        let pd = gpu.physical_device();
        let capabilities = self
            .surface_loader
            .get_physical_device_surface_capabilities(pd, self.surface)?;
        let formats = self
            .surface_loader
            .get_physical_device_surface_formats(pd, self.surface)?;
        let present_modes = self
            .surface_loader
            .get_physical_device_surface_present_modes(pd, self.surface)?;

        Swapchain::new(
            gpu.device(),
            &self.swapchain_loader,
            self.surface,
            &capabilities,
            select_surface_format(&formats)?,
            select_present_mode(&present_modes, vsync),
            calculate_extent(&capabilities, width, height),
            old_swapchain,
        )
    }

    /// Build a new swapchain that replaces `old` and destroy the old one.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn recreate_swapchain(
        &self,
        gpu: &GpuContext,
        old: &Swapchain,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Swapchain> {
        let new = self.create_swapchain(gpu, width, height, vsync, old.swapchain);
        old.destroy(gpu.device(), &self.swapchain_loader);
        new
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// All swapchains created for the surface must be destroyed.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}
