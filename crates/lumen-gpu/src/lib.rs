//! Vulkan layer for the Lumen engine.
//!
//! This crate provides:
//! - Instance, device and capability detection (including ray tracing limits)
//! - Memory allocation via gpu-allocator, buffers, images and samplers
//! - Descriptor layouts, pools and a bindless texture table
//! - Command recording and blocking one-shot submission
//! - The frames-in-flight manager and the deferred deletion queue
//! - Surface and swapchain handling

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deletion;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod sampler;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{create_buffer_with_data, upload_to_buffer, BufferDesc, GpuBuffer};
pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::{CommandPool, ImmediateSubmitter};
pub use context::{GpuContext, GpuContextBuilder};
pub use deletion::DeletionQueue;
pub use descriptors::{
    write_acceleration_structure, write_sampled_image, write_storage_buffer, write_storage_image,
    write_uniform_buffer, BindlessTextureTable, DescriptorPool, DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use frame::{
    ActiveFrame, FrameBackend, FrameManager, FrameManagerConfig, FrameStart, SlotState,
    VulkanFrameBackend,
};
pub use image::{record_image_barrier, upload_rgba8_texture, GpuImage, ImageBarrier, ImageDesc};
pub use memory::{GpuAllocator, SharedAllocator};
pub use sampler::{create_sampler, SamplerDesc};
pub use surface::SurfaceContext;
pub use swapchain::{AcquireOutcome, Swapchain};

/// Re-exported so downstream crates name memory locations without a direct dependency.
pub use gpu_allocator::MemoryLocation;
