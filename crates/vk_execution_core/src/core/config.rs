//! # Engine Configuration
//!
//! Tunables for the Vulkan execution core: command buffer flush threshold,
//! transient heap sizes, descriptor pool sizes and query pool sizes.
//!
//! ## Design Goals
//!
//! - **Serializable**: Loaded from TOML or RON through the [`Config`] trait
//! - **Type Safe**: Strong typing with validation and defaults
//! - **Builder Friendly**: `with_*` methods for programmatic setup

use ash::vk;
use serde::{Deserialize, Serialize};

pub use crate::config::{Config, ConfigError};

/// Master blocks of the dynamic heap are aligned to this many bytes
pub const MASTER_BLOCK_ALIGNMENT: u64 = 1024;

/// Per-type descriptor counts of a native descriptor pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorPoolSize {
    /// Maximum number of descriptor sets allocated from one pool
    pub max_descriptor_sets: u32,
    /// Separate sampler descriptors
    pub num_separate_sampler_descriptors: u32,
    /// Combined image sampler descriptors
    pub num_combined_sampler_descriptors: u32,
    /// Sampled image descriptors
    pub num_sampled_image_descriptors: u32,
    /// Storage image descriptors
    pub num_storage_image_descriptors: u32,
    /// Uniform buffer descriptors (static and dynamic)
    pub num_uniform_buffer_descriptors: u32,
    /// Storage buffer descriptors (static and dynamic)
    pub num_storage_buffer_descriptors: u32,
    /// Uniform texel buffer descriptors
    pub num_uniform_texel_buffer_descriptors: u32,
    /// Storage texel buffer descriptors
    pub num_storage_texel_buffer_descriptors: u32,
    /// Input attachment descriptors
    pub num_input_attachment_descriptors: u32,
}

impl DescriptorPoolSize {
    /// Pool size used for static and mutable resource bindings
    pub const fn main() -> Self {
        Self {
            max_descriptor_sets: 8192,
            num_separate_sampler_descriptors: 1024,
            num_combined_sampler_descriptors: 8192,
            num_sampled_image_descriptors: 8192,
            num_storage_image_descriptors: 1024,
            num_uniform_buffer_descriptors: 4096,
            num_storage_buffer_descriptors: 4096,
            num_uniform_texel_buffer_descriptors: 1024,
            num_storage_texel_buffer_descriptors: 1024,
            num_input_attachment_descriptors: 256,
        }
    }

    /// Pool size used by per-context dynamic descriptor allocators
    pub const fn dynamic() -> Self {
        Self {
            max_descriptor_sets: 2048,
            num_separate_sampler_descriptors: 256,
            num_combined_sampler_descriptors: 2048,
            num_sampled_image_descriptors: 2048,
            num_storage_image_descriptors: 256,
            num_uniform_buffer_descriptors: 1024,
            num_storage_buffer_descriptors: 1024,
            num_uniform_texel_buffer_descriptors: 256,
            num_storage_texel_buffer_descriptors: 256,
            num_input_attachment_descriptors: 64,
        }
    }

    /// Native pool sizes. Uniform and storage buffer counts are shared
    /// between the static and dynamic descriptor types.
    pub fn to_vk_pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let entry = |ty, descriptor_count| vk::DescriptorPoolSize { ty, descriptor_count };
        [
            entry(vk::DescriptorType::SAMPLER, self.num_separate_sampler_descriptors),
            entry(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, self.num_combined_sampler_descriptors),
            entry(vk::DescriptorType::SAMPLED_IMAGE, self.num_sampled_image_descriptors),
            entry(vk::DescriptorType::STORAGE_IMAGE, self.num_storage_image_descriptors),
            entry(vk::DescriptorType::UNIFORM_TEXEL_BUFFER, self.num_uniform_texel_buffer_descriptors),
            entry(vk::DescriptorType::STORAGE_TEXEL_BUFFER, self.num_storage_texel_buffer_descriptors),
            entry(vk::DescriptorType::UNIFORM_BUFFER, self.num_uniform_buffer_descriptors),
            entry(vk::DescriptorType::STORAGE_BUFFER, self.num_storage_buffer_descriptors),
            entry(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, self.num_uniform_buffer_descriptors),
            entry(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, self.num_storage_buffer_descriptors),
            entry(vk::DescriptorType::INPUT_ATTACHMENT, self.num_input_attachment_descriptors),
        ]
        .into_iter()
        .filter(|size| size.descriptor_count > 0)
        .collect()
    }
}

/// Number of queries in each per-type query pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPoolSizes {
    /// Occlusion queries
    pub occlusion: u32,
    /// Binary occlusion queries
    pub binary_occlusion: u32,
    /// Timestamp queries
    pub timestamp: u32,
    /// Pipeline statistics queries
    pub pipeline_statistics: u32,
    /// Duration queries (each one uses two timestamps)
    pub duration: u32,
}

impl Default for QueryPoolSizes {
    fn default() -> Self {
        Self {
            occlusion: 128,
            binary_occlusion: 128,
            timestamp: 512,
            pipeline_statistics: 128,
            duration: 256,
        }
    }
}

/// # Vulkan Engine Configuration
///
/// Settings shared by the render device and every device context created from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineVkConfig {
    /// Number of draw/dispatch commands after which the immediate context
    /// flushes its command buffer on the next pipeline change
    pub num_commands_to_flush_cmd_buffer: u32,
    /// Page size of the per-context upload heaps
    pub upload_heap_page_size: u64,
    /// Size of the device-wide dynamic heap buffer
    pub dynamic_heap_size: u64,
    /// Size of the master blocks contexts borrow from the dynamic heap
    pub dynamic_heap_page_size: u64,
    /// Sizes of the pools backing static and mutable bindings
    pub main_descriptor_pool_size: DescriptorPoolSize,
    /// Sizes of the pools handed out to dynamic descriptor allocators
    pub dynamic_descriptor_pool_size: DescriptorPoolSize,
    /// Query pool sizes per query type
    pub query_pool_sizes: QueryPoolSizes,
}

impl EngineVkConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self {
            num_commands_to_flush_cmd_buffer: 256,
            upload_heap_page_size: 1 << 20,
            dynamic_heap_size: 8 << 20,
            dynamic_heap_page_size: 256 << 10,
            main_descriptor_pool_size: DescriptorPoolSize::main(),
            dynamic_descriptor_pool_size: DescriptorPoolSize::dynamic(),
            query_pool_sizes: QueryPoolSizes::default(),
        }
    }

    /// Set the command count that triggers an automatic flush
    pub fn with_num_commands_to_flush(mut self, count: u32) -> Self {
        self.num_commands_to_flush_cmd_buffer = count;
        self
    }

    /// Set upload heap page size
    pub fn with_upload_heap_page_size(mut self, size: u64) -> Self {
        self.upload_heap_page_size = size;
        self
    }

    /// Set dynamic heap size and master block size
    pub fn with_dynamic_heap(mut self, size: u64, page_size: u64) -> Self {
        self.dynamic_heap_size = size;
        self.dynamic_heap_page_size = page_size;
        self
    }

    /// Set the dynamic descriptor pool size
    pub fn with_dynamic_descriptor_pool_size(mut self, size: DescriptorPoolSize) -> Self {
        self.dynamic_descriptor_pool_size = size;
        self
    }

    /// Set query pool sizes
    pub fn with_query_pool_sizes(mut self, sizes: QueryPoolSizes) -> Self {
        self.query_pool_sizes = sizes;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.num_commands_to_flush_cmd_buffer == 0 {
            return Err("Number of commands to flush must be at least 1".to_string());
        }

        if self.upload_heap_page_size == 0 {
            return Err("Upload heap page size cannot be zero".to_string());
        }

        if self.dynamic_heap_size == 0 || self.dynamic_heap_size % MASTER_BLOCK_ALIGNMENT != 0 {
            return Err(format!(
                "Dynamic heap size ({}) must be a non-zero multiple of {}",
                self.dynamic_heap_size, MASTER_BLOCK_ALIGNMENT
            ));
        }

        if self.dynamic_heap_page_size == 0 || self.dynamic_heap_page_size > self.dynamic_heap_size {
            return Err(format!(
                "Dynamic heap page size ({}) must be in 1..={}",
                self.dynamic_heap_page_size, self.dynamic_heap_size
            ));
        }

        if self.dynamic_descriptor_pool_size.max_descriptor_sets == 0 {
            return Err("Dynamic descriptor pools must allow at least one set".to_string());
        }

        Ok(())
    }
}

impl Default for EngineVkConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for EngineVkConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineVkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_commands_to_flush_cmd_buffer, 256);
        assert_eq!(config.dynamic_heap_size, 8 << 20);
    }

    #[test]
    fn test_rejects_unaligned_dynamic_heap() {
        let config = EngineVkConfig::new().with_dynamic_heap(1000, 256);
        assert!(config.validate().is_err());

        let config = EngineVkConfig::new().with_dynamic_heap(4096, 8192);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_sizes_skip_empty_types() {
        let mut size = DescriptorPoolSize::dynamic();
        size.num_input_attachment_descriptors = 0;
        let sizes = size.to_vk_pool_sizes();
        assert!(sizes.iter().all(|s| s.ty != vk::DescriptorType::INPUT_ATTACHMENT));
        assert!(sizes.iter().any(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC));
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");

        let config = EngineVkConfig::new().with_num_commands_to_flush(64);
        config.save_to_file(&path).unwrap();

        let loaded = EngineVkConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.num_commands_to_flush_cmd_buffer, 64);
        assert_eq!(loaded.query_pool_sizes, config.query_pool_sizes);
    }

    #[test]
    fn test_ron_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.ron");

        let config = EngineVkConfig::new().with_upload_heap_page_size(4096);
        config.save_to_file(&path).unwrap();

        let loaded = EngineVkConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.upload_heap_page_size, 4096);
    }
}
