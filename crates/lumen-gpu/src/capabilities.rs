//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// Extensions needed for hardware ray tracing.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Ray tracing pipeline limits relevant to shader binding table layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// All of [`RAY_TRACING_EXTENSIONS`] are available.
    pub supported: bool,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,

    pub supports_buffer_device_address: bool,
    pub supports_descriptor_indexing: bool,
    pub ray_tracing: RayTracingCapabilities,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub max_sampler_anisotropy: f32,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let available_extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let mut ray_tracing = RayTracingCapabilities {
            supported: has_extensions(&available_extensions, &RAY_TRACING_EXTENSIONS),
            ..RayTracingCapabilities::default()
        };
        if ray_tracing.supported {
            let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut properties2 =
                vk::PhysicalDeviceProperties2::default().push_next(&mut rt_properties);
            instance.get_physical_device_properties2(physical_device, &mut properties2);

            ray_tracing.shader_group_handle_size = rt_properties.shader_group_handle_size;
            ray_tracing.shader_group_handle_alignment = rt_properties.shader_group_handle_alignment;
            ray_tracing.shader_group_base_alignment = rt_properties.shader_group_base_alignment;
            ray_tracing.max_ray_recursion_depth = rt_properties.max_ray_recursion_depth;
        }

        let has_vulkan_1_2 = api_at_least(properties.api_version, 1, 2);

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            supports_buffer_device_address: has_vulkan_1_2
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_descriptor_indexing: has_vulkan_1_2
                || available_extensions.contains("VK_EXT_descriptor_indexing"),
            ray_tracing,
            device_local_memory_mb,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements for the engine.
    pub fn meets_requirements(&self, require_ray_tracing: bool) -> bool {
        api_at_least(self.api_version, 1, 3)
            && self.supports_buffer_device_address
            && self.supports_descriptor_indexing
            && (!require_ray_tracing || self.ray_tracing.supported)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.ray_tracing.supported { "yes" } else { "no" },
        )
    }
}

fn api_at_least(version: u32, major: u32, minor: u32) -> bool {
    let (v_major, v_minor) = (vk::api_version_major(version), vk::api_version_minor(version));
    v_major > major || (v_major == major && v_minor >= minor)
}

fn has_extensions(available: &HashSet<String>, required: &[&CStr]) -> bool {
    required.iter().all(|ext| {
        ext.to_str()
            .map(|name| available.contains(name))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(api_version: u32, ray_tracing: bool) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "test".to_string(),
            api_version,
            driver_version: 0,
            supports_buffer_device_address: true,
            supports_descriptor_indexing: true,
            ray_tracing: RayTracingCapabilities {
                supported: ray_tracing,
                ..Default::default()
            },
            device_local_memory_mb: 8192,
            max_sampler_anisotropy: 16.0,
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requirements_check_ray_tracing_only_when_asked() {
        let no_rt = caps(vk::API_VERSION_1_3, false);
        assert!(no_rt.meets_requirements(false));
        assert!(!no_rt.meets_requirements(true));
        assert!(caps(vk::API_VERSION_1_3, true).meets_requirements(true));
    }

    #[test]
    fn requires_vulkan_1_3() {
        assert!(!caps(vk::API_VERSION_1_2, true).meets_requirements(false));
    }

    #[test]
    fn extension_set_lookup() {
        let mut available = HashSet::new();
        for ext in RAY_TRACING_EXTENSIONS {
            available.insert(ext.to_str().unwrap().to_string());
        }
        assert!(has_extensions(&available, &RAY_TRACING_EXTENSIONS));
        available.remove("VK_KHR_deferred_host_operations");
        assert!(!has_extensions(&available, &RAY_TRACING_EXTENSIONS));
    }
}
