//! GPU context management.

use crate::buffer::{BufferDesc, GpuBuffer};
use crate::capabilities::{GpuCapabilities, RAY_TRACING_EXTENSIONS};
use crate::command::ImmediateSubmitter;
use crate::error::{GpuError, Result};
use crate::image::{GpuImage, ImageDesc};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{GpuAllocator, SharedAllocator};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Owns the Vulkan instance, device, allocator and the graphics queue.
///
/// Every other GPU object borrows from the context and must be destroyed
/// before it is dropped.
pub struct GpuContext {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: SharedAllocator,
    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) immediate: Mutex<ImmediateSubmitter>,
    pub(crate) ray_tracing_enabled: bool,
}

impl GpuContext {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared device handle for objects that outlive a borrow, such as
    /// deferred destructors.
    pub fn device_arc(&self) -> &Arc<ash::Device> {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Whether ray tracing extensions were enabled on the device.
    pub fn ray_tracing_enabled(&self) -> bool {
        self.ray_tracing_enabled
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    /// Create a buffer through the shared allocator.
    pub fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<GpuBuffer> {
        self.allocator.lock().create_buffer(desc)
    }

    /// Create an image through the shared allocator.
    pub fn create_image(&self, desc: &ImageDesc<'_>) -> Result<GpuImage> {
        self.allocator.lock().create_image(desc)
    }

    /// Record commands with `f`, submit them on the graphics queue and block
    /// until they finish.
    pub fn immediate_submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let immediate = self.immediate.lock();
        unsafe { immediate.submit(&self.device, f) }
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| GpuError::from_wait("device wait idle", e))
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.immediate.lock().destroy(&self.device);

            // Frees all VkDeviceMemory; must happen before the device goes away.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    ray_tracing: bool,
    fence_timeout_ns: u64,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Lumen".to_string(),
            enable_validation: cfg!(debug_assertions),
            ray_tracing: true,
            fence_timeout_ns: u64::MAX,
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Require hardware ray tracing and enable its extensions.
    pub fn ray_tracing(mut self, enable: bool) -> Self {
        self.ray_tracing = enable;
        self
    }

    /// Timeout applied to blocking one-shot submissions.
    pub fn fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let (physical_device, capabilities) =
            match unsafe { select_physical_device(&instance, self.ray_tracing) } {
                Ok(selected) => selected,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            };

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let graphics_queue_family =
            unsafe { find_graphics_queue_family(&instance, physical_device) }?;

        let device = unsafe {
            create_device(
                &instance,
                physical_device,
                graphics_queue_family,
                self.ray_tracing,
            )?
        };
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;
        let immediate = unsafe {
            ImmediateSubmitter::new(
                &device,
                graphics_queue_family,
                graphics_queue,
                self.fence_timeout_ns,
            )
        }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Arc::new(Mutex::new(allocator)),
            graphics_queue_family,
            graphics_queue,
            immediate: Mutex::new(immediate),
            ray_tracing_enabled: self.ray_tracing,
        })
    }
}

/// Find a queue family supporting graphics and compute.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

fn device_extensions(ray_tracing: bool) -> Vec<&'static CStr> {
    let mut extensions = vec![ash::khr::swapchain::NAME];
    if ray_tracing {
        extensions.extend(RAY_TRACING_EXTENSIONS);
    }
    extensions
}

/// Create the logical device with a single graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    ray_tracing: bool,
) -> Result<ash::Device> {
    let queue_priority = [1.0_f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priority)];

    let extensions = device_extensions(ray_tracing);
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    // Update-after-bind and partially bound sampled images back the bindless
    // texture table.
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true);

    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_tracing_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .shader_int64(true)
        .sampler_anisotropy(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);
    if ray_tracing {
        features2 = features2
            .push_next(&mut acceleration_structure_features)
            .push_next(&mut ray_tracing_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    Ok(instance.create_device(physical_device, &device_create_info, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_tracing_adds_extensions() {
        assert_eq!(device_extensions(false).len(), 1);
        let with_rt = device_extensions(true);
        assert_eq!(with_rt.len(), 4);
        assert!(with_rt.contains(&ash::khr::acceleration_structure::NAME));
    }

    #[test]
    fn builder_defaults() {
        let builder = GpuContextBuilder::new().app_name("viewer").ray_tracing(false);
        assert_eq!(builder.app_name, "viewer");
        assert!(!builder.ray_tracing);
        assert_eq!(builder.fence_timeout_ns, u64::MAX);
    }
}
