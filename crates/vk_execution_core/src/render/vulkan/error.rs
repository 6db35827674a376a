//! Vulkan error types

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Resource with specified ID could not be found
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        /// The unique identifier of the resource
        id: u64,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Device initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Engine configuration was rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl VulkanError {
    /// Shorthand for [`VulkanError::InvalidOperation`]
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
