//! Resource state transitions
//!
//! Every resource tracks the state it was last transitioned to. A transition
//! from an unknown state is refused because no barrier can be derived for it.
//! Barriers are queued on the command buffer and flushed before the next
//! command that depends on them.

use std::sync::Arc;

use ash::vk;

use super::DeviceContext;
use crate::foundation::logging::{error, warn};
use crate::render::vulkan::error::VulkanResult;
use crate::render::vulkan::format::aspect_flags;
use crate::render::vulkan::resources::{Barrierable, BufferVk, StateTransitionMode, TextureVk};
use crate::render::vulkan::state::ResourceState;

/// Resource referenced by a [`StateTransitionDesc`]
#[derive(Clone)]
pub enum TransitionResource {
    /// Texture, optionally restricted to some mips and slices
    Texture(Arc<TextureVk>),
    /// Whole buffer
    Buffer(Arc<BufferVk>),
}

/// Part of a split barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionType {
    /// Transition right away
    #[default]
    Immediate,
    /// Start of a split barrier. Vulkan has no split barriers, so it is ignored.
    Begin,
    /// End of a split barrier, performed like an immediate transition
    End,
}

/// One state transition requested through [`DeviceContext::transition_resource_states`]
#[derive(Clone)]
pub struct StateTransitionDesc {
    /// Transitioned resource
    pub resource: TransitionResource,
    /// State the resource is in, [`ResourceState::UNKNOWN`] to use the tracked state
    pub old_state: ResourceState,
    /// State to transition to
    pub new_state: ResourceState,
    /// First transitioned mip of a texture
    pub first_mip_level: u32,
    /// Transitioned mips, [`vk::REMAINING_MIP_LEVELS`] for the rest of the chain
    pub mip_levels_count: u32,
    /// First transitioned slice of a texture
    pub first_array_slice: u32,
    /// Transitioned slices, [`vk::REMAINING_ARRAY_LAYERS`] for the rest
    pub array_slice_count: u32,
    /// Whether the tracked state is set to `new_state`
    pub update_resource_state: bool,
    /// Split barrier part
    pub transition_type: TransitionType,
}

impl StateTransitionDesc {
    fn new(resource: TransitionResource, new_state: ResourceState) -> Self {
        Self {
            resource,
            old_state: ResourceState::UNKNOWN,
            new_state,
            first_mip_level: 0,
            mip_levels_count: vk::REMAINING_MIP_LEVELS,
            first_array_slice: 0,
            array_slice_count: vk::REMAINING_ARRAY_LAYERS,
            update_resource_state: true,
            transition_type: TransitionType::Immediate,
        }
    }

    /// Transition every subresource of `texture` to `new_state`
    pub fn texture(texture: Arc<TextureVk>, new_state: ResourceState) -> Self {
        Self::new(TransitionResource::Texture(texture), new_state)
    }

    /// Transition `buffer` to `new_state`
    pub fn buffer(buffer: Arc<BufferVk>, new_state: ResourceState) -> Self {
        Self::new(TransitionResource::Buffer(buffer), new_state)
    }

    /// Use `old_state` instead of the tracked state
    pub fn with_old_state(mut self, old_state: ResourceState) -> Self {
        self.old_state = old_state;
        self
    }

    /// Restrict a texture transition to some mips
    pub fn with_mips(mut self, first: u32, count: u32) -> Self {
        self.first_mip_level = first;
        self.mip_levels_count = count;
        self
    }

    /// Restrict a texture transition to some array slices
    pub fn with_slices(mut self, first: u32, count: u32) -> Self {
        self.first_array_slice = first;
        self.array_slice_count = count;
        self
    }

    /// Leave the tracked state untouched
    pub fn without_state_update(mut self) -> Self {
        self.update_resource_state = false;
        self
    }
}

impl DeviceContext {
    /// Record the barriers described by `barriers`
    pub fn transition_resource_states(&mut self, barriers: &[StateTransitionDesc]) -> VulkanResult<()> {
        if self.active_render_pass.is_some() {
            error!("State transitions are not allowed inside a render pass");
            return Ok(());
        }
        if barriers.is_empty() {
            return Ok(());
        }
        self.ensure_command_buffer()?;

        for barrier in barriers {
            if barrier.transition_type == TransitionType::Begin {
                if barrier.update_resource_state {
                    warn!("The resource state can't be updated by the beginning of a split barrier");
                }
                continue;
            }
            match &barrier.resource {
                TransitionResource::Texture(texture) => {
                    let range = vk::ImageSubresourceRange {
                        aspect_mask: aspect_flags(texture.format()),
                        base_mip_level: barrier.first_mip_level,
                        level_count: barrier.mip_levels_count,
                        base_array_layer: barrier.first_array_slice,
                        layer_count: barrier.array_slice_count,
                    };
                    self.transition_texture_state(
                        texture,
                        barrier.old_state,
                        barrier.new_state,
                        barrier.update_resource_state,
                        Some(range),
                    )?;
                }
                TransitionResource::Buffer(buffer) => {
                    self.transition_buffer_state(
                        buffer,
                        barrier.old_state,
                        barrier.new_state,
                        barrier.update_resource_state,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Move `texture` (or `range` of it) from `old_state` to `new_state`.
    ///
    /// An unknown `old_state` stands for the tracked state.
    pub fn transition_texture_state(
        &mut self,
        texture: &TextureVk,
        old_state: ResourceState,
        new_state: ResourceState,
        update_state: bool,
        range: Option<vk::ImageSubresourceRange>,
    ) -> VulkanResult<()> {
        self.transition_state(texture, old_state, new_state, update_state, range)
    }

    /// Move `buffer` from `old_state` to `new_state`
    pub fn transition_buffer_state(
        &mut self,
        buffer: &BufferVk,
        old_state: ResourceState,
        new_state: ResourceState,
        update_state: bool,
    ) -> VulkanResult<()> {
        self.transition_state(buffer, old_state, new_state, update_state, None)
    }

    pub(super) fn transition_state(
        &mut self,
        resource: &dyn Barrierable,
        old_state: ResourceState,
        new_state: ResourceState,
        update_state: bool,
        range: Option<vk::ImageSubresourceRange>,
    ) -> VulkanResult<()> {
        if self.active_render_pass.is_some() {
            error!("Resource '{}' can't be transitioned inside a render pass", resource.name());
            return Ok(());
        }

        let old_state = if old_state.is_known() {
            if resource.is_known_state() && resource.state() != old_state {
                warn!(
                    "The state {} of '{}' does not match the old state {} given to the transition",
                    resource.state(),
                    resource.name(),
                    old_state
                );
            }
            old_state
        } else if resource.is_known_state() {
            resource.state()
        } else {
            error!(
                "Failed to transition the state of '{}' because its state is unknown and is not explicitly \
                 specified",
                resource.name()
            );
            return Ok(());
        };

        if resource.needs_barrier(old_state, new_state) {
            self.ensure_command_buffer()?;
            // Barriers between attachments of the implicit pass end it
            if self.command_buffer.state().inside_render_pass() {
                self.command_buffer.end_render_pass();
            }
            resource.record_barrier(&mut self.command_buffer, old_state, new_state, range);
            if update_state {
                resource.set_state(new_state);
            }
        }
        Ok(())
    }

    /// Bring `resource` into `required` as `mode` asks
    pub(super) fn transition_or_verify(
        &mut self,
        resource: &dyn Barrierable,
        mode: StateTransitionMode,
        required: ResourceState,
        range: Option<vk::ImageSubresourceRange>,
    ) -> VulkanResult<()> {
        match mode {
            StateTransitionMode::Transition => {
                if resource.is_known_state() && !resource.check_state(required) {
                    self.transition_state(resource, ResourceState::UNKNOWN, required, true, range)?;
                }
            }
            StateTransitionMode::Verify => {
                #[cfg(debug_assertions)]
                if resource.is_known_state() && !resource.check_state(required) {
                    error!(
                        "'{}' is in state {} but {} is required",
                        resource.name(),
                        resource.state(),
                        required
                    );
                }
            }
            StateTransitionMode::None => {}
        }
        Ok(())
    }
}
