//! Ray tracing extension loaders and device limits.

use ash::vk;
use lumen_gpu::{GpuContext, GpuError, RayTracingCapabilities, Result};

/// Extension loaders shared by every ray tracing object.
#[derive(Clone)]
pub struct RayTracingContext {
    pub as_loader: ash::khr::acceleration_structure::Device,
    pub rt_loader: ash::khr::ray_tracing_pipeline::Device,
    pub capabilities: RayTracingCapabilities,
    /// Required alignment of scratch buffer addresses.
    pub scratch_alignment: u64,
}

impl RayTracingContext {
    /// Load the ray tracing extensions from a context created with ray tracing enabled.
    pub fn new(gpu: &GpuContext) -> Result<Self> {
        if !gpu.ray_tracing_enabled() {
            return Err(GpuError::ExtensionNotSupported(
                "ray tracing was not enabled on this device".to_string(),
            ));
        }

        let as_loader = ash::khr::acceleration_structure::Device::new(gpu.instance(), gpu.device());
        let rt_loader = ash::khr::ray_tracing_pipeline::Device::new(gpu.instance(), gpu.device());

        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut as_properties);
        unsafe {
            gpu.instance()
                .get_physical_device_properties2(gpu.physical_device(), &mut properties2);
        }

        let capabilities = gpu.capabilities().ray_tracing;
        tracing::debug!(
            handle_size = capabilities.shader_group_handle_size,
            base_alignment = capabilities.shader_group_base_alignment,
            "loaded ray tracing extensions"
        );

        Ok(Self {
            as_loader,
            rt_loader,
            capabilities,
            scratch_alignment: u64::from(
                as_properties
                    .min_acceleration_structure_scratch_offset_alignment
                    .max(1),
            ),
        })
    }
}
