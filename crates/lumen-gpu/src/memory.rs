//! GPU memory management.

use crate::buffer::{BufferDesc, GpuBuffer};
use crate::error::{GpuError, Result};
use crate::image::{GpuImage, ImageDesc};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// Allocator handle shared between the context and deferred destructors.
pub type SharedAllocator = Arc<Mutex<GpuAllocator>>;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Device the allocator was created for.
    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("allocator already shut down".to_string()))
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
    }

    fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.inner()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Create a buffer and bind freshly allocated memory to it.
    ///
    /// The description is validated before any Vulkan call is made.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<GpuBuffer> {
        desc.validate()?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(desc.name, requirements, desc.location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation)?;
            return Err(e.into());
        }

        tracing::trace!(name = desc.name, size = desc.size, "created buffer");

        Ok(GpuBuffer::from_parts(
            buffer,
            Some(allocation),
            desc.size,
            desc.usage,
        ))
    }

    /// Destroy a buffer and release its memory.
    ///
    /// Only call this once no in-flight work references the buffer; otherwise
    /// go through [`crate::DeletionQueue::retire_buffer`].
    pub fn destroy_buffer(&mut self, buffer: GpuBuffer) -> Result<()> {
        let (handle, allocation) = buffer.into_parts();
        unsafe { self.device.destroy_buffer(handle, None) };
        if let Some(allocation) = allocation {
            self.free(allocation)?;
        }
        Ok(())
    }

    /// Create an image and bind freshly allocated memory to it.
    pub fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<GpuImage> {
        desc.validate()?;

        let create_info = desc.create_info();
        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(desc.name, requirements, desc.location, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation)?;
            return Err(e.into());
        }

        tracing::trace!(
            name = desc.name,
            width = desc.extent.width,
            height = desc.extent.height,
            "created image"
        );

        Ok(GpuImage::from_parts(image, Some(allocation), desc))
    }

    /// Destroy an image and release its memory.
    pub fn destroy_image(&mut self, image: GpuImage) -> Result<()> {
        let (handle, allocation) = image.into_parts();
        unsafe { self.device.destroy_image(handle, None) };
        if let Some(allocation) = allocation {
            self.free(allocation)?;
        }
        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations are freed and logged as leaks.
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
