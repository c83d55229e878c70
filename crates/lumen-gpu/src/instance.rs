//! Vulkan instance creation and physical device selection.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions needed to present to a window on this platform.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Create a Vulkan 1.3 instance.
///
/// A missing validation layer is logged and skipped rather than failing.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Lumen")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const i8> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let mut layer_names: Vec<*const i8> = Vec::new();
    if enable_validation {
        let available = entry.enumerate_instance_layer_properties()?;
        let found = available
            .iter()
            .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == VALIDATION_LAYER);
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("Validation layer {:?} not available", VALIDATION_LAYER);
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(entry.create_instance(&create_info, None)?)
}

/// Pick the highest scoring device that meets the engine requirements.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    require_ray_tracing: bool,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    instance
        .enumerate_physical_devices()?
        .into_iter()
        .filter_map(|device| {
            let capabilities = GpuCapabilities::query(instance, device);
            if !capabilities.meets_requirements(require_ray_tracing) {
                tracing::debug!("Skipping GPU: {}", capabilities.summary());
                return None;
            }
            let properties = instance.get_physical_device_properties(device);
            let score = score_device(properties.device_type, &capabilities);
            Some((score, device, capabilities))
        })
        .max_by_key(|(score, ..)| *score)
        .map(|(_, device, capabilities)| (device, capabilities))
        .ok_or(GpuError::NoSuitableDevice)
}

fn score_device(device_type: vk::PhysicalDeviceType, capabilities: &GpuCapabilities) -> u64 {
    let type_score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };
    let rt_score = if capabilities.ray_tracing.supported {
        500
    } else {
        0
    };
    // +1 per GB of device-local memory
    type_score + rt_score + capabilities.device_local_memory_mb / 1024
}
