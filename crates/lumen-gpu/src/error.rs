//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A resource description is malformed (caller bug).
    #[error("Invalid {operation} specification: expected {expected}, got {actual}")]
    InvalidSpecification {
        operation: &'static str,
        expected: String,
        actual: String,
    },

    /// A fence or semaphore wait failed; the device must be torn down.
    #[error("Device lost during {0}")]
    DeviceLost(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Shorthand for [`GpuError::InvalidSpecification`].
    pub fn invalid_spec(
        operation: &'static str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidSpecification {
            operation,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Map the result of a fence/semaphore wait.
    ///
    /// Timeouts and device loss are both unrecoverable at this layer.
    pub fn from_wait(operation: &str, result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT | vk::Result::ERROR_DEVICE_LOST => {
                Self::DeviceLost(format!("{operation} ({result:?})"))
            }
            other => Self::Vulkan(other),
        }
    }

    /// Whether the error requires tearing down the device.
    ///
    /// Everything except an out-of-date swapchain is fatal: recoverable
    /// conditions are reported through return values, not errors.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
