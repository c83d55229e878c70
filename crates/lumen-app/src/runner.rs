//! Application runner and event loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use lumen_core::constants::DEFAULT_FRAMES_IN_FLIGHT;
use lumen_gpu::{FrameStart, GpuContextBuilder};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::LumenApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Directory holding the precompiled ray tracing shaders.
    pub shader_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Lumen".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            shader_dir: PathBuf::from("shaders/spv"),
        }
    }
}

impl AppConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Clamped to at least one.
    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight.max(1);
        self
    }

    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run a [`LumenApp`] with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the
/// event loop until the window closes or a frame fails.
pub fn run_app<A: LumenApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new().context("creating event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failed: false,
    };

    event_loop.run_app(&mut runner).context("running event loop")?;

    if runner.failed {
        anyhow::bail!("application stopped after an unrecoverable error");
    }
    Ok(())
}

struct AppRunner<A: LumenApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failed: bool,
}

struct AppState<A: LumenApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: LumenApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failed = true;
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        let result = match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
                return;
            }
            WindowEvent::RedrawRequested => match &mut self.state {
                Some(state) => state.render_frame().context("rendering frame"),
                None => Ok(()),
            },
            WindowEvent::Resized(size) => match &mut self.state {
                Some(state) => state
                    .handle_resize(size.width, size.height)
                    .context("resizing swapchain"),
                None => Ok(()),
            },
            _ => Ok(()),
        };

        if let Err(e) = result {
            error!("{e:#}");
            self.failed = true;
            self.shutdown(event_loop);
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: LumenApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(
            event_loop
                .create_window(window_attrs)
                .context("creating window")?,
        );

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build()
            .context("creating GPU context")?;

        info!("GPU: {}", gpu.capabilities().summary());

        let mut ctx = unsafe { AppContext::new(window, gpu, self.config.clone())? };
        let app = A::init(&mut ctx).context("initializing application")?;

        Ok(AppState {
            ctx,
            app,
            target_frame_time: self.config.target_frame_time(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: LumenApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let size = self.ctx.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }

        let frame_start = Instant::now();

        let dt = {
            let now = Instant::now();
            let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
            self.ctx.last_frame_time = now;

            if dt > 0.0 {
                let fps = 1.0 / f64::from(dt);
                self.min_fps = self.min_fps.min(fps);
                self.max_fps = self.max_fps.max(fps);
                self.fps_sum += fps;
            }
            dt
        };

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.update").entered();
            self.app
                .update(&mut self.ctx, dt)
                .context("updating application")?;
        }

        let active = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.begin").entered();
            match self.ctx.begin_frame().context("beginning frame")? {
                FrameStart::Ready(active) => active,
                FrameStart::SwapchainOutOfDate => {
                    return self.recreate_for_window();
                }
            }
        };

        let swapchain_image = self
            .ctx
            .swapchain_image(active.image_index)
            .with_context(|| format!("acquired unknown swapchain image {}", active.image_index))?;

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.record").entered();

            let command_buffer = self
                .ctx
                .begin_command_recording()
                .context("beginning command recording")?;
            let mut frame = FrameContext {
                command_buffer,
                image_index: active.image_index,
                swapchain_image,
                extent: self.ctx.extent(),
                frame_index: active.frame_index,
                dt,
                frame_number: self.ctx.frame_number(),
            };
            self.app
                .render(&mut self.ctx, &mut frame)
                .context("recording frame")?;
            self.ctx
                .end_command_recording()
                .context("ending command recording")?;
        }

        let needs_recreate = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.submit_present").entered();
            self.ctx.submit().context("submitting frame")?;
            self.ctx.end_frame().context("presenting frame")?
        };
        if needs_recreate {
            self.recreate_for_window()?;
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn recreate_for_window(&mut self) -> anyhow::Result<()> {
        let size = self.ctx.window.inner_size();
        self.handle_resize(size.width, size.height)
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.ctx.recreate_swapchain(width, height)?;
        let extent = self.ctx.extent();
        self.app.on_resize(&mut self.ctx, extent.width, extent.height)?;

        info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn cleanup(&mut self) {
        let frames = self.ctx.frame_number();
        if frames > 0 {
            let avg_fps = self.fps_sum / frames as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", frames);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        self.app.cleanup(&mut self.ctx);
        unsafe {
            self.ctx.cleanup();
        }
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_is_clamped() {
        let config = AppConfig::new("test").with_frames_in_flight(0);
        assert_eq!(config.frames_in_flight, 1);
    }

    #[test]
    fn target_frame_time_from_fps() {
        let config = AppConfig::default().with_target_fps(50);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
        assert_eq!(AppConfig::default().target_frame_time(), None);
    }

    #[test]
    fn defaults_match_engine_constants() {
        let config = AppConfig::default();
        assert_eq!(config.frames_in_flight, DEFAULT_FRAMES_IN_FLIGHT);
        assert_eq!((config.width, config.height), (1280, 720));
        assert!(!config.vsync);
    }
}
