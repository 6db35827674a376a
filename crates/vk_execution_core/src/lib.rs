//! # Vulkan Execution Core
//!
//! Command recording and submission for a Vulkan rendering backend.
//!
//! ## Features
//!
//! - **Device contexts**: immediate contexts submit to a queue, deferred contexts record command lists
//! - **State tracking**: resource states drive batched pipeline barriers
//! - **Fence-driven recycling**: command buffers, transient memory and native objects are
//!   released once the GPU passes the fence of the last submission that used them
//! - **Caches**: render passes and framebuffers are created once per unique key
//! - **Transient memory**: per-context upload and dynamic heaps, dynamic descriptor pools
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vk_execution_core::prelude::*;
//!
//! fn frame(device: &Arc<RenderDevice>, constants: &BufferVk) -> VulkanResult<()> {
//!     let mut context = DeviceContext::new_immediate(device, 0)?;
//!     if let Some(mapped) = context.map_buffer(constants, MapType::Write, MapFlags::DISCARD)? {
//!         mapped.write(0, &[0u8; 64])?;
//!     }
//!     context.flush()?;
//!     context.finish_frame();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod core;
pub mod config;
pub mod foundation;
pub mod render;

/// Common imports for crate users
pub mod prelude {
    pub use crate::{
        config::Config,
        core::{EngineVkConfig, QueryPoolSizes},
        render::vulkan::{
            context::{BeginRenderPassAttribs, DrawAttribs, DrawIndexedAttribs, StateTransitionDesc, Viewport},
            resources::{
                BindFlags, BufferDesc, BufferVk, MapFlags, MapType, PipelineState, Query, QueryType,
                ShaderResourceBinding, StateTransitionMode, TextureDesc, TextureView, TextureVk, Usage,
            },
            AshDevice, CommandList, DeviceContext, FenceTimeline, FenceValue, RenderDevice, ResourceState,
            VulkanError, VulkanResult,
        },
    };
}
