//! Resource usage states and their Vulkan barrier translation
//!
//! A [`ResourceState`] describes how a buffer or texture is currently used.
//! Barrier synthesis turns a pair of states into access masks, image layouts
//! and the pipeline stages that support those accesses.

use ash::vk;
use bitflags::bitflags;

use crate::foundation::logging::error;

bitflags! {
    /// Usage state of a buffer or texture
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceState: u32 {
        /// Contents are undefined and may be discarded
        const UNDEFINED         = 0x0000_0001;
        /// Bound as a vertex buffer
        const VERTEX_BUFFER     = 0x0000_0002;
        /// Bound as a uniform buffer
        const CONSTANT_BUFFER   = 0x0000_0004;
        /// Bound as an index buffer
        const INDEX_BUFFER      = 0x0000_0008;
        /// Bound as a color attachment
        const RENDER_TARGET     = 0x0000_0010;
        /// Read-write shader access (storage buffer or storage image)
        const UNORDERED_ACCESS  = 0x0000_0020;
        /// Depth/stencil attachment with writes enabled
        const DEPTH_WRITE       = 0x0000_0040;
        /// Read-only depth/stencil attachment
        const DEPTH_READ        = 0x0000_0080;
        /// Read-only shader access
        const SHADER_RESOURCE   = 0x0000_0100;
        /// Transform feedback target
        const STREAM_OUT        = 0x0000_0200;
        /// Source of indirect draw/dispatch arguments
        const INDIRECT_ARGUMENT = 0x0000_0400;
        /// Destination of a copy
        const COPY_DEST         = 0x0000_0800;
        /// Source of a copy
        const COPY_SOURCE       = 0x0000_1000;
        /// Destination of a multisample resolve
        const RESOLVE_DEST      = 0x0000_2000;
        /// Source of a multisample resolve
        const RESOLVE_SOURCE    = 0x0000_4000;
        /// Subpass input attachment
        const INPUT_ATTACHMENT  = 0x0000_8000;
        /// Ready for presentation
        const PRESENT           = 0x0001_0000;

        /// Union of every read-only buffer usage
        const GENERIC_READ = Self::VERTEX_BUFFER.bits()
            | Self::CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceState {
    /// The state of a resource whose previous usage is not tracked
    pub const UNKNOWN: Self = Self::empty();

    /// Whether this state describes a tracked usage
    pub const fn is_known(self) -> bool {
        !self.is_empty()
    }

    /// States that can never describe an image
    pub const BUFFER_ONLY: Self = Self::VERTEX_BUFFER
        .union(Self::CONSTANT_BUFFER)
        .union(Self::INDEX_BUFFER)
        .union(Self::STREAM_OUT)
        .union(Self::INDIRECT_ARGUMENT);
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("UNKNOWN");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/// Access flags implied by every usage bit in `state`
pub fn resource_state_to_access_flags(state: ResourceState) -> vk::AccessFlags {
    let mut flags = vk::AccessFlags::empty();
    let mut remaining = state.bits();
    while remaining != 0 {
        let bit = remaining & remaining.wrapping_neg();
        remaining &= !bit;
        flags |= single_state_access_flags(ResourceState::from_bits_retain(bit));
    }
    flags
}

fn single_state_access_flags(state: ResourceState) -> vk::AccessFlags {
    match state {
        ResourceState::VERTEX_BUFFER => vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        ResourceState::CONSTANT_BUFFER => vk::AccessFlags::UNIFORM_READ,
        ResourceState::INDEX_BUFFER => vk::AccessFlags::INDEX_READ,
        ResourceState::RENDER_TARGET => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        ResourceState::UNORDERED_ACCESS => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        ResourceState::DEPTH_WRITE => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        ResourceState::DEPTH_READ => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        ResourceState::SHADER_RESOURCE => vk::AccessFlags::SHADER_READ,
        ResourceState::STREAM_OUT => vk::AccessFlags::TRANSFORM_FEEDBACK_WRITE_EXT,
        ResourceState::INDIRECT_ARGUMENT => vk::AccessFlags::INDIRECT_COMMAND_READ,
        ResourceState::COPY_DEST | ResourceState::RESOLVE_DEST => vk::AccessFlags::TRANSFER_WRITE,
        ResourceState::COPY_SOURCE | ResourceState::RESOLVE_SOURCE => vk::AccessFlags::TRANSFER_READ,
        ResourceState::INPUT_ATTACHMENT => vk::AccessFlags::INPUT_ATTACHMENT_READ,
        // UNDEFINED and PRESENT need no access
        _ => vk::AccessFlags::empty(),
    }
}

/// Image layout for a single-bit texture state.
///
/// `RESOLVE_DEST` is a color attachment inside a render pass and a transfer
/// destination outside of one.
pub fn resource_state_to_image_layout(state: ResourceState, inside_render_pass: bool) -> vk::ImageLayout {
    if !state.is_known() || state == ResourceState::UNDEFINED {
        return vk::ImageLayout::UNDEFINED;
    }

    if state.bits().count_ones() != 1 {
        error!("Texture state {state} must contain exactly one usage bit");
        return vk::ImageLayout::UNDEFINED;
    }

    match state {
        ResourceState::RENDER_TARGET => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::UNORDERED_ACCESS => vk::ImageLayout::GENERAL,
        ResourceState::DEPTH_WRITE => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ResourceState::DEPTH_READ => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ResourceState::SHADER_RESOURCE | ResourceState::INPUT_ATTACHMENT => {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
        ResourceState::COPY_DEST => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::COPY_SOURCE | ResourceState::RESOLVE_SOURCE => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::RESOLVE_DEST if inside_render_pass => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::RESOLVE_DEST => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::PRESENT => vk::ImageLayout::PRESENT_SRC_KHR,
        _ => {
            error!("State {state} is not a valid texture state");
            vk::ImageLayout::UNDEFINED
        }
    }
}

/// Access mask that describes all accesses an image in `layout` may see.
///
/// `is_destination` selects the destination half of a barrier, where
/// `UNDEFINED` and `PREINITIALIZED` are illegal.
pub fn image_layout_to_access_flags(layout: vk::ImageLayout, is_destination: bool) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            if is_destination {
                error!("The new layout of an image transition must not be UNDEFINED");
            }
            vk::AccessFlags::empty()
        }
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::PREINITIALIZED => {
            if is_destination {
                error!("The new layout of an image transition must not be PREINITIALIZED");
                vk::AccessFlags::empty()
            } else {
                vk::AccessFlags::HOST_WRITE
            }
        }
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::MEMORY_READ,
        other => {
            error!("Unexpected image layout {other:?}");
            vk::AccessFlags::empty()
        }
    }
}

/// Pipeline stages that can perform the accesses in `access`
pub fn access_flags_to_pipeline_stages(
    access: vk::AccessFlags,
    enabled_shader_stages: vk::PipelineStageFlags,
) -> vk::PipelineStageFlags {
    let shader_stages = enabled_shader_stages | vk::PipelineStageFlags::COMPUTE_SHADER;
    let mut stages = vk::PipelineStageFlags::empty();
    let mut remaining = access.as_raw();

    while remaining != 0 {
        let bit = remaining & remaining.wrapping_neg();
        remaining &= !bit;

        stages |= match vk::AccessFlags::from_raw(bit) {
            vk::AccessFlags::INDIRECT_COMMAND_READ => vk::PipelineStageFlags::DRAW_INDIRECT,
            vk::AccessFlags::INDEX_READ | vk::AccessFlags::VERTEX_ATTRIBUTE_READ => {
                vk::PipelineStageFlags::VERTEX_INPUT
            }
            vk::AccessFlags::UNIFORM_READ | vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE => {
                shader_stages
            }
            vk::AccessFlags::INPUT_ATTACHMENT_READ => vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE => {
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            }
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
            vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE => vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::HOST_READ | vk::AccessFlags::HOST_WRITE => vk::PipelineStageFlags::HOST,
            vk::AccessFlags::TRANSFORM_FEEDBACK_WRITE_EXT => vk::PipelineStageFlags::TRANSFORM_FEEDBACK_EXT,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE => vk::PipelineStageFlags::empty(),
            other => {
                error!("Unknown memory access flag {other:?}");
                vk::PipelineStageFlags::empty()
            }
        };
    }

    stages
}

/// Source stages for a barrier out of `access` (or out of `layout` for images)
pub fn source_stages(
    access: vk::AccessFlags,
    layout: Option<vk::ImageLayout>,
    enabled_shader_stages: vk::PipelineStageFlags,
) -> vk::PipelineStageFlags {
    if layout == Some(vk::ImageLayout::PRESENT_SRC_KHR) {
        return vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    let stages = access_flags_to_pipeline_stages(access, enabled_shader_stages);
    if stages.is_empty() {
        // Waits for nothing
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        stages
    }
}

/// Destination stages for a barrier into `access` (or into `layout` for images)
pub fn destination_stages(
    access: vk::AccessFlags,
    layout: Option<vk::ImageLayout>,
    enabled_shader_stages: vk::PipelineStageFlags,
) -> vk::PipelineStageFlags {
    if layout == Some(vk::ImageLayout::PRESENT_SRC_KHR) {
        return vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    let stages = access_flags_to_pipeline_stages(access, enabled_shader_stages);
    if stages.is_empty() {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    } else {
        stages
    }
}

/// Whether a buffer in `old` state needs a barrier to be used as `new`
pub fn buffer_needs_barrier(old: ResourceState, new: ResourceState) -> bool {
    !old.contains(new) || new == ResourceState::UNORDERED_ACCESS
}

/// Whether a texture in `old` state needs a barrier to be used as `new`
pub fn texture_needs_barrier(old: ResourceState, new: ResourceState) -> bool {
    old != new || new == ResourceState::UNORDERED_ACCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPHICS_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
        vk::PipelineStageFlags::VERTEX_SHADER.as_raw() | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw(),
    );

    #[test]
    fn test_unknown_is_empty() {
        assert!(!ResourceState::UNKNOWN.is_known());
        assert!(ResourceState::UNDEFINED.is_known());
        assert_eq!(ResourceState::UNKNOWN.to_string(), "UNKNOWN");
    }

    #[test]
    fn test_generic_read_access() {
        let access = resource_state_to_access_flags(ResourceState::GENERIC_READ);
        assert!(access.contains(vk::AccessFlags::VERTEX_ATTRIBUTE_READ));
        assert!(access.contains(vk::AccessFlags::UNIFORM_READ));
        assert!(access.contains(vk::AccessFlags::INDEX_READ));
        assert!(access.contains(vk::AccessFlags::SHADER_READ));
        assert!(access.contains(vk::AccessFlags::INDIRECT_COMMAND_READ));
        assert!(access.contains(vk::AccessFlags::TRANSFER_READ));
        assert!(!access.contains(vk::AccessFlags::TRANSFER_WRITE));
    }

    #[test]
    fn test_texture_layouts() {
        assert_eq!(
            resource_state_to_image_layout(ResourceState::RENDER_TARGET, false),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            resource_state_to_image_layout(ResourceState::UNORDERED_ACCESS, false),
            vk::ImageLayout::GENERAL
        );
        assert_eq!(
            resource_state_to_image_layout(ResourceState::INPUT_ATTACHMENT, false),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            resource_state_to_image_layout(ResourceState::RESOLVE_DEST, true),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            resource_state_to_image_layout(ResourceState::RESOLVE_DEST, false),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            resource_state_to_image_layout(ResourceState::UNKNOWN, false),
            vk::ImageLayout::UNDEFINED
        );
    }

    #[test]
    fn test_buffer_states_are_not_image_layouts() {
        assert_eq!(
            resource_state_to_image_layout(ResourceState::VERTEX_BUFFER, false),
            vk::ImageLayout::UNDEFINED
        );
        assert_eq!(
            resource_state_to_image_layout(ResourceState::SHADER_RESOURCE | ResourceState::COPY_SOURCE, false),
            vk::ImageLayout::UNDEFINED
        );
    }

    #[test]
    fn test_access_to_stages() {
        assert_eq!(
            access_flags_to_pipeline_stages(vk::AccessFlags::UNIFORM_READ, GRAPHICS_STAGES),
            GRAPHICS_STAGES | vk::PipelineStageFlags::COMPUTE_SHADER
        );
        assert_eq!(
            access_flags_to_pipeline_stages(
                vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::INDEX_READ,
                GRAPHICS_STAGES
            ),
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::VERTEX_INPUT
        );
        assert!(access_flags_to_pipeline_stages(vk::AccessFlags::MEMORY_READ, GRAPHICS_STAGES).is_empty());
    }

    #[test]
    fn test_present_stages() {
        let src_access = image_layout_to_access_flags(vk::ImageLayout::PRESENT_SRC_KHR, false);
        assert_eq!(src_access, vk::AccessFlags::MEMORY_READ);
        assert_eq!(
            source_stages(src_access, Some(vk::ImageLayout::PRESENT_SRC_KHR), GRAPHICS_STAGES),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        );
        assert_eq!(
            destination_stages(src_access, Some(vk::ImageLayout::PRESENT_SRC_KHR), GRAPHICS_STAGES),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
        assert_eq!(
            source_stages(vk::AccessFlags::empty(), Some(vk::ImageLayout::UNDEFINED), GRAPHICS_STAGES),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
    }

    #[test]
    fn test_barrier_rules() {
        assert!(!buffer_needs_barrier(ResourceState::GENERIC_READ, ResourceState::VERTEX_BUFFER));
        assert!(buffer_needs_barrier(ResourceState::COPY_DEST, ResourceState::VERTEX_BUFFER));
        assert!(buffer_needs_barrier(ResourceState::UNORDERED_ACCESS, ResourceState::UNORDERED_ACCESS));

        assert!(!texture_needs_barrier(ResourceState::SHADER_RESOURCE, ResourceState::SHADER_RESOURCE));
        assert!(texture_needs_barrier(ResourceState::SHADER_RESOURCE, ResourceState::RENDER_TARGET));
        assert!(texture_needs_barrier(ResourceState::UNORDERED_ACCESS, ResourceState::UNORDERED_ACCESS));
    }
}
