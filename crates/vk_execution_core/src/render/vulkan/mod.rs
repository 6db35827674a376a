//! Vulkan execution core
//!
//! Command recording, resource state tracking and fence-driven recycling of
//! GPU-owned objects. Every native call goes through the [`NativeDevice`]
//! seam, implemented on top of `ash` by [`AshDevice`].

/// Error types
pub mod error;
/// Native device seam and recorded command values
pub mod native;
/// `ash` implementation of the native device
pub mod ash_device;
#[cfg(test)]
pub(crate) mod mock;

/// Resource states, barrier layouts, access masks and stages
pub mod state;
/// Format helpers
pub mod format;
/// Fence values, fence pool and fence timelines
pub mod sync;
/// Deferred release of objects the GPU may still use
pub mod release_queue;
/// Command pools and the recording command buffer
pub mod commands;
/// Render pass cache
pub mod render_pass;
/// Framebuffer cache
pub mod framebuffer;
/// Transient memory managers
pub mod memory;
/// Device and command queues
pub mod device;
/// Buffers, textures, pipelines, bindings and queries
pub mod resources;
/// Immediate and deferred device contexts
pub mod context;

pub use ash_device::AshDevice;
pub use context::{
    BeginRenderPassAttribs, ClearDepthStencilFlags, CommandList, CopyTextureAttribs, DeviceContext, DrawAttribs,
    DrawIndexedAttribs, DrawIndirectAttribs, MappedTextureSubresource, RenderPassAttachment,
    ResolveTextureSubresourceAttribs, StateTransitionDesc, TransitionResource, TransitionType, Viewport,
};
pub use device::{CommandQueue, RenderDevice};
pub use error::{VulkanError, VulkanResult};
pub use native::{DeviceLimits, NativeDevice, NativeObject};
pub use release_queue::StaleResource;
pub use state::ResourceState;
pub use sync::{FenceTimeline, FenceValue};
