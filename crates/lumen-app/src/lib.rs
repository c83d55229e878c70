//! Application framework for the Lumen engine.
//!
//! This crate provides a trait-based application framework that handles:
//! - Window creation and management
//! - GPU and ray tracing context initialization
//! - Swapchain creation and recreation
//! - Frames in flight and deferred deletion
//! - Event loop handling
//!
//! It also ships [`SceneRenderer`], which traces a `lumen_scene::Scene` into
//! the swapchain.
//!
//! # Example
//!
//! ```no_run
//! use lumen_app::{run_app, AppConfig, AppContext, FrameContext, LumenApp};
//!
//! struct MyApp;
//!
//! impl LumenApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _dt: f32) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn render(&mut self, _ctx: &mut AppContext, _frame: &mut FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod camera;
mod context;
mod frame;
mod renderer;
mod runner;

pub use app::LumenApp;
pub use camera::{Camera, CameraPushConstants};
pub use context::AppContext;
pub use frame::FrameContext;
pub use renderer::{load_shaders, SceneRenderer, CLOSEST_HIT_SHADER, MISS_SHADER, RAYGEN_SHADER};
pub use runner::{run_app, AppConfig};

pub use lumen_gpu::{GpuContext, GpuContextBuilder};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
