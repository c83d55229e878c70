//! Hardware ray tracing for the Lumen engine.
//!
//! Requires `VK_KHR_acceleration_structure` and `VK_KHR_ray_tracing_pipeline`.
//! Provides BLAS/TLAS building, the shader binding table and the ray tracing
//! pipeline factory.

pub mod acceleration;
pub mod context;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{Blas, Tlas, TlasInstance, TriangleGeometry, MAX_CUSTOM_INDEX};
pub use context::RayTracingContext;
pub use pipeline::{RayTracingPipeline, RayTracingShaders};
pub use sbt::{SbtLayout, SbtRegion, ShaderBindingTable};
