//! Core types, math, and traits for the Lumen engine.
//!
//! This crate provides the foundational types used throughout the engine:
//! - Vertex and mesh data consumed by the GPU layer
//! - Material records shared with shaders
//! - Matrix conversions for ray tracing instance data
//! - Common error types

pub mod error;
pub mod material;
pub mod math;
pub mod mesh;

pub use error::{Error, Result};
pub use material::{MaterialDescriptor, TextureId};
pub use mesh::{MeshData, SubMesh, Vertex};

/// Engine-wide constants
pub mod constants {
    /// Default number of frames the CPU may record ahead of the GPU.
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
    /// Texture id reserved for "no texture". Shaders fall back to the material factor.
    pub const NULL_TEXTURE_ID: u32 = 0;
    /// Descriptor budget for the bindless texture array.
    pub const MAX_BINDLESS_TEXTURES: u32 = 4096;
}
