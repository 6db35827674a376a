//! Transient memory managers
//!
//! Device-wide managers pool native memory and descriptor pools. Each device
//! context owns frame-scoped allocators built on top of them. Everything a
//! context allocates during a frame is returned through the release queues by
//! [`crate::render::vulkan::DeviceContext::finish_frame`].

pub mod descriptor_pool;
pub mod dynamic_heap;
pub mod upload_heap;

pub use descriptor_pool::{
    DescriptorPoolManager, DescriptorSetAllocation, DescriptorSetAllocator, DynamicDescriptorSetAllocator,
};
pub use dynamic_heap::{DynamicAllocation, DynamicHeap, DynamicMemoryManager, MasterBlock};
pub use upload_heap::{UploadAllocation, UploadHeap, UploadPage, UploadPageManager};
