//! Scene-level errors.

use lumen_gpu::GpuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SceneError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Data(#[from] lumen_core::Error),

    #[error("Unknown mesh id: {0}")]
    UnknownMesh(u32),

    #[error("Unknown entity: {0:?}")]
    UnknownEntity(hecs::Entity),
}

impl SceneError {
    /// Whether the renderer must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Gpu(e) => e.is_fatal(),
            Self::Data(_) | Self::UnknownMesh(_) | Self::UnknownEntity(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SceneError>;
