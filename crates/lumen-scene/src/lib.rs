//! Scene management for the Lumen engine.
//!
//! Owns entities (via hecs), uploaded meshes, per-entity BLAS containers, the
//! TLAS and the material library. GPU work goes through [`SceneGpuBackend`]
//! so the bookkeeping can be tested without a device.

pub mod backend;
pub mod components;
pub mod error;
pub mod material;
pub mod primitives;
pub mod scene;
pub mod texture;

pub use backend::{MeshBuffers, SceneGpuBackend, VulkanSceneBackend};
pub use components::{MaterialId, MeshId, MeshRenderer, Transform};
pub use error::{Result, SceneError};
pub use hecs::Entity;
pub use material::{MaterialLibrary, MaterialSource, TextureUploader};
pub use scene::{BlasContainer, Scene};
pub use texture::{decode_rgba8, BindlessTextures, GpuTextureUploader};
