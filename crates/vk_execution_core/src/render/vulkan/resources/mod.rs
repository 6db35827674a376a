//! Resource objects consumed by device contexts
//!
//! Buffers, textures, pipeline states and shader resource bindings are thin
//! holders of native handles. What the execution core needs from them is
//! expressed through small capability traits:
//!
//! - [`Stateful`]: the tracked usage state
//! - [`Barrierable`]: how a state change is turned into a barrier
//! - [`Mappable`]: usage and CPU access of resources that can be mapped

pub mod binding;
pub mod buffer;
pub mod pipeline;
pub mod query;
pub mod texture;

use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;
use bitflags::bitflags;

use super::commands::CommandBuffer;
use super::state::ResourceState;

pub use binding::{ResourceBinding, ShaderResourceBinding};
pub use buffer::{BufferDesc, BufferVk, MappedRange};
pub use pipeline::{GraphicsPipelineDesc, PipelineKind, PipelineState, PipelineStateDesc};
pub use query::{Query, QueryManager, QueryType};
pub use texture::{
    TextureDesc, TextureRegion, TextureSubresourceData, TextureView, TextureViewDesc, TextureViewType, TextureVk,
};

/// How a resource-consuming call treats the state of the resources it uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateTransitionMode {
    /// Leave states alone
    None,
    /// Transition resources into the required state when their state is known
    #[default]
    Transition,
    /// Check that resources already are in the required state (debug builds only)
    Verify,
}

/// Intended update frequency of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Usage {
    /// Written once at creation
    Immutable,
    /// GPU read-write, updated with copy commands
    #[default]
    Default,
    /// Rewritten by the CPU every frame through mapping
    Dynamic,
    /// Host-visible memory used for CPU readback or upload
    Staging,
}

bitflags! {
    /// CPU access allowed on a mappable resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CpuAccess: u8 {
        /// The CPU may read mapped memory
        const READ  = 0x01;
        /// The CPU may write mapped memory
        const WRITE = 0x02;
    }
}

bitflags! {
    /// Ways a resource may be bound to the pipeline
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        /// Vertex buffer
        const VERTEX_BUFFER      = 0x0001;
        /// Index buffer
        const INDEX_BUFFER       = 0x0002;
        /// Uniform buffer
        const UNIFORM_BUFFER     = 0x0004;
        /// Read-only shader access
        const SHADER_RESOURCE    = 0x0008;
        /// Read-write shader access
        const UNORDERED_ACCESS   = 0x0010;
        /// Indirect draw/dispatch arguments
        const INDIRECT_DRAW_ARGS = 0x0020;
        /// Color attachment
        const RENDER_TARGET      = 0x0040;
        /// Depth-stencil attachment
        const DEPTH_STENCIL      = 0x0080;
        /// Subpass input attachment
        const INPUT_ATTACHMENT   = 0x0100;
    }
}

bitflags! {
    /// Flags of a map request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u8 {
        /// Previous contents are discarded and new memory is handed out
        const DISCARD      = 0x01;
        /// The caller promises not to overwrite data the GPU may still read
        const NO_OVERWRITE = 0x02;
        /// Never block waiting for the GPU
        const DO_NOT_WAIT  = 0x04;
    }
}

/// Kind of CPU access requested by a map call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    /// Read only
    Read,
    /// Write only
    Write,
    /// Read and write
    ReadWrite,
}

/// Atomic cell holding a [`ResourceState`]
#[derive(Debug, Default)]
pub struct ResourceStateCell(AtomicU32);

impl ResourceStateCell {
    /// Cell holding `state`
    pub fn new(state: ResourceState) -> Self {
        Self(AtomicU32::new(state.bits()))
    }

    /// Current state
    pub fn get(&self) -> ResourceState {
        ResourceState::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    /// Replace the state
    pub fn set(&self, state: ResourceState) {
        self.0.store(state.bits(), Ordering::Release);
    }
}

/// Resource whose usage state is tracked
pub trait Stateful {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Tracked state, [`ResourceState::UNKNOWN`] when untracked
    fn state(&self) -> ResourceState;

    /// Replace the tracked state
    fn set_state(&self, state: ResourceState);

    /// Whether the state is tracked
    fn is_known_state(&self) -> bool {
        self.state().is_known()
    }

    /// Whether the resource can be used as `state` without a barrier
    fn check_state(&self, state: ResourceState) -> bool;
}

/// Resource that knows how to record a barrier for a state change
pub trait Barrierable: Stateful {
    /// Whether moving from `old` to `new` needs a barrier
    fn needs_barrier(&self, old: ResourceState, new: ResourceState) -> bool;

    /// Queue the barrier moving the resource (or `range` of it) from `old` to `new`
    fn record_barrier(
        &self,
        command_buffer: &mut CommandBuffer,
        old: ResourceState,
        new: ResourceState,
        range: Option<vk::ImageSubresourceRange>,
    );
}

/// Resource that can be mapped into CPU address space
pub trait Mappable {
    /// Usage the resource was created with
    fn usage(&self) -> Usage;

    /// Allowed CPU access
    fn cpu_access(&self) -> CpuAccess;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::*;
    use crate::core::EngineVkConfig;
    use crate::render::vulkan::device::RenderDevice;
    use crate::render::vulkan::mock::MockDevice;

    pub fn test_device() -> (Arc<MockDevice>, Arc<RenderDevice>) {
        crate::foundation::logging::init_for_tests();
        let native = Arc::new(MockDevice::new());
        let device = RenderDevice::new(native.clone(), EngineVkConfig::default()).unwrap();
        (native, device)
    }

    pub fn render_target(device: &Arc<RenderDevice>, name: &str, format: vk::Format) -> Arc<TextureVk> {
        let bind_flags = if crate::render::vulkan::format::is_depth_format(format) {
            BindFlags::DEPTH_STENCIL
        } else {
            BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE
        };
        TextureVk::new(
            device,
            TextureDesc {
                name: name.to_string(),
                format,
                bind_flags,
                ..TextureDesc::texture_2d(64, 64)
            },
            None,
        )
        .unwrap()
    }
}
