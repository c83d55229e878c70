//! `LumenApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Lumen applications.
///
/// The framework owns the window, the GPU context, the swapchain, frame
/// synchronization and the deletion queue. Applications record commands and
/// hand retired GPU objects to `ctx.deletion`.
pub trait LumenApp: Sized {
    /// Called once after the GPU context and window exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update state. Called every frame before a swapchain image is acquired,
    /// so scene uploads and acceleration structure builds belong here.
    fn update(&mut self, ctx: &mut AppContext, dt: f32) -> anyhow::Result<()>;

    /// Record rendering commands into `frame.command_buffer`.
    ///
    /// The swapchain image arrives in `UNDEFINED` layout and must be left in
    /// `PRESENT_SRC_KHR`.
    fn render(&mut self, ctx: &mut AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Called after the swapchain was recreated for a new size.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Return `true` to stop the framework from handling the event.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Called before shutdown with the device idle. Retire GPU objects into
    /// `ctx.deletion`; the queue is flushed right after.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
