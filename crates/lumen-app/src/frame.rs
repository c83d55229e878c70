//! Per-frame context for rendering.

use ash::vk;

/// Context for the frame being recorded.
pub struct FrameContext {
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    pub swapchain_image: vk::Image,
    pub extent: vk::Extent2D,
    /// Frame-in-flight slot, for per-slot resources.
    pub frame_index: usize,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    pub frame_number: u64,
}
