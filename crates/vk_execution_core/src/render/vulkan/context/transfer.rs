//! Buffer and texture transfers
//!
//! CPU data reaches default-usage resources through the upload heap and a
//! copy command. Dynamic resources are mapped straight into the dynamic heap.
//! Dynamic buffers without backing memory are consumed from there directly.
//! Dynamic buffers with backing memory and dynamic textures are copied into
//! their own memory on unmap.

use std::sync::Arc;

use ash::vk;

use super::{DeviceContext, MappedTexture};
use crate::foundation::logging::{error, info, warn};
use crate::render::vulkan::error::VulkanResult;
use crate::render::vulkan::format::{aspect_flags, is_depth_format};
use crate::render::vulkan::resources::texture::{buffer_to_texture_copy_info, pack_subresource};
use crate::render::vulkan::resources::{
    BufferVk, MapFlags, MapType, MappedRange, StateTransitionMode, Stateful, TextureRegion,
    TextureSubresourceData, TextureVk, Usage,
};
use crate::render::vulkan::state::ResourceState;

/// Texture subresource mapped for writing
pub struct MappedTextureSubresource {
    /// Mapped staging memory
    pub range: MappedRange,
    /// Bytes between rows
    pub stride: u64,
    /// Bytes between depth slices
    pub depth_stride: u64,
}

/// Parameters of [`DeviceContext::copy_texture`]
#[derive(Debug, Clone, Copy)]
pub struct CopyTextureAttribs {
    /// Source mip
    pub src_mip_level: u32,
    /// Source array slice
    pub src_slice: u32,
    /// Copied source region, the whole mip when `None`
    pub src_region: Option<TextureRegion>,
    /// How the source is brought into `COPY_SOURCE`
    pub src_transition_mode: StateTransitionMode,
    /// Destination mip
    pub dst_mip_level: u32,
    /// Destination array slice
    pub dst_slice: u32,
    /// Destination X offset
    pub dst_x: u32,
    /// Destination Y offset
    pub dst_y: u32,
    /// Destination Z offset
    pub dst_z: u32,
    /// How the destination is brought into `COPY_DEST`
    pub dst_transition_mode: StateTransitionMode,
}

impl Default for CopyTextureAttribs {
    fn default() -> Self {
        Self {
            src_mip_level: 0,
            src_slice: 0,
            src_region: None,
            src_transition_mode: StateTransitionMode::Transition,
            dst_mip_level: 0,
            dst_slice: 0,
            dst_x: 0,
            dst_y: 0,
            dst_z: 0,
            dst_transition_mode: StateTransitionMode::Transition,
        }
    }
}

/// Parameters of [`DeviceContext::resolve_texture_subresource`]
#[derive(Debug, Clone, Copy)]
pub struct ResolveTextureSubresourceAttribs {
    /// Source mip
    pub src_mip_level: u32,
    /// Source array slice
    pub src_slice: u32,
    /// How the source is brought into `RESOLVE_SOURCE`
    pub src_transition_mode: StateTransitionMode,
    /// Destination mip
    pub dst_mip_level: u32,
    /// Destination array slice
    pub dst_slice: u32,
    /// How the destination is brought into `RESOLVE_DEST`
    pub dst_transition_mode: StateTransitionMode,
}

impl Default for ResolveTextureSubresourceAttribs {
    fn default() -> Self {
        Self {
            src_mip_level: 0,
            src_slice: 0,
            src_transition_mode: StateTransitionMode::Transition,
            dst_mip_level: 0,
            dst_slice: 0,
            dst_transition_mode: StateTransitionMode::Transition,
        }
    }
}

/// Whether `len` bytes at `offset` lie inside a resource of `size` bytes
fn range_fits(offset: u64, len: u64, size: u64) -> bool {
    offset.checked_add(len).map_or(false, |end| end <= size)
}

impl DeviceContext {
    fn texture_copy_alignment(&self) -> u64 {
        self.device.limits().optimal_buffer_copy_offset_alignment.max(4)
    }

    /// Write `data` to `buffer` at `offset` through the upload heap
    pub fn update_buffer(
        &mut self,
        buffer: &BufferVk,
        offset: u64,
        data: &[u8],
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        if buffer.desc().usage == Usage::Dynamic {
            error!("Dynamic buffer '{}' must be updated by mapping", buffer.name());
            return Ok(());
        }
        let size = data.len() as u64;
        if !range_fits(offset, size, buffer.size()) {
            error!(
                "Update of {size} bytes at offset {offset} is out of bounds of '{}' ({} bytes)",
                buffer.name(),
                buffer.size()
            );
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }

        let allocation = self.upload_heap.allocate(size, 4)?;
        self.device
            .native()
            .write_memory(allocation.memory, allocation.offset, data)?;
        self.update_buffer_region(buffer, offset, size, allocation.buffer, allocation.offset, mode)
    }

    fn update_buffer_region(
        &mut self,
        buffer: &BufferVk,
        dst_offset: u64,
        size: u64,
        src_buffer: vk::Buffer,
        src_offset: u64,
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        self.ensure_command_buffer()?;
        if !self.ensure_outside_render_pass("Buffer update") {
            return Ok(());
        }
        self.transition_or_verify(buffer, mode, ResourceState::COPY_DEST, None)?;
        self.command_buffer.copy_buffer(
            src_buffer,
            buffer.vk_buffer(),
            vec![vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            }],
        );
        self.state.num_commands += 1;
        Ok(())
    }

    /// Copy `size` bytes between two buffers
    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer(
        &mut self,
        src: &BufferVk,
        src_offset: u64,
        src_mode: StateTransitionMode,
        dst: &BufferVk,
        dst_offset: u64,
        size: u64,
        dst_mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        if dst.desc().usage == Usage::Dynamic {
            error!("Dynamic buffer '{}' can't be a copy destination", dst.name());
            return Ok(());
        }
        if !range_fits(src_offset, size, src.size()) || !range_fits(dst_offset, size, dst.size()) {
            error!("Copy of {size} bytes from '{}' to '{}' is out of bounds", src.name(), dst.name());
            return Ok(());
        }
        self.ensure_command_buffer()?;
        if !self.ensure_outside_render_pass("Buffer copy") {
            return Ok(());
        }
        self.transition_or_verify(src, src_mode, ResourceState::COPY_SOURCE, None)?;
        self.transition_or_verify(dst, dst_mode, ResourceState::COPY_DEST, None)?;
        self.command_buffer.copy_buffer(
            src.vk_buffer(),
            dst.vk_buffer(),
            vec![vk::BufferCopy {
                src_offset: src_offset + src.dynamic_offset(self.id),
                dst_offset,
                size,
            }],
        );
        self.state.num_commands += 1;
        Ok(())
    }

    /// Map `buffer` into CPU address space.
    ///
    /// Returns `None` when the request is not valid for the buffer.
    pub fn map_buffer(
        &mut self,
        buffer: &BufferVk,
        map_type: MapType,
        flags: MapFlags,
    ) -> VulkanResult<Option<MappedRange>> {
        let native = self.device.native();
        let usage = buffer.desc().usage;
        match map_type {
            MapType::Read => {
                if usage != Usage::Staging {
                    error!("Only staging buffers can be mapped for reading, '{}' is {usage:?}", buffer.name());
                    return Ok(None);
                }
                if !flags.contains(MapFlags::DO_NOT_WAIT) {
                    warn!(
                        "Mapping '{}' for reading never waits for the GPU. Pass DO_NOT_WAIT and synchronize with a \
                         fence",
                        buffer.name()
                    );
                }
                Ok(self.map_own_memory(buffer))
            }
            MapType::Write => match usage {
                Usage::Staging => Ok(self.map_own_memory(buffer)),
                Usage::Dynamic => {
                    if !flags.intersects(MapFlags::DISCARD | MapFlags::NO_OVERWRITE) {
                        error!(
                            "Dynamic buffer '{}' must be mapped with DISCARD or NO_OVERWRITE",
                            buffer.name()
                        );
                        return Ok(None);
                    }
                    let allocation = match buffer.dynamic_allocation(self.id) {
                        Some(previous) if !flags.contains(MapFlags::DISCARD) => {
                            if !buffer.is_suballocated() {
                                // Unmapping copies the whole buffer, previous contents included
                                error!(
                                    "NO_OVERWRITE is not supported for dynamic buffer '{}' with backing memory",
                                    buffer.name()
                                );
                                return Ok(None);
                            }
                            previous
                        }
                        _ => {
                            let allocation = self.dynamic_heap.allocate(buffer.size(), buffer.dynamic_alignment())?;
                            buffer.set_dynamic_allocation(self.id, allocation);
                            allocation
                        }
                    };
                    Ok(Some(MappedRange::new(
                        Arc::clone(native),
                        allocation.buffer,
                        allocation.memory,
                        allocation.offset,
                        buffer.size(),
                    )))
                }
                _ => {
                    error!("Only dynamic and staging buffers can be mapped for writing, '{}' is {usage:?}", buffer.name());
                    Ok(None)
                }
            },
            MapType::ReadWrite => {
                error!("Mapping '{}' for reading and writing is not supported", buffer.name());
                Ok(None)
            }
        }
    }

    fn map_own_memory(&self, buffer: &BufferVk) -> Option<MappedRange> {
        match buffer.vk_memory() {
            Some(memory) => Some(MappedRange::new(
                Arc::clone(self.device.native()),
                buffer.vk_buffer(),
                memory,
                0,
                buffer.size(),
            )),
            None => {
                error!("Buffer '{}' has no host-visible memory to map", buffer.name());
                None
            }
        }
    }

    /// Finish a map of `buffer`. Dynamic buffers with backing memory are
    /// copied into it.
    pub fn unmap_buffer(&mut self, buffer: &BufferVk, map_type: MapType) -> VulkanResult<()> {
        if map_type != MapType::Write || buffer.desc().usage != Usage::Dynamic || buffer.is_suballocated() {
            return Ok(());
        }
        let Some(allocation) = buffer.dynamic_allocation(self.id) else {
            error!("Dynamic buffer '{}' is unmapped without being mapped", buffer.name());
            return Ok(());
        };
        self.update_buffer_region(
            buffer,
            0,
            buffer.size(),
            allocation.buffer,
            allocation.offset,
            StateTransitionMode::Transition,
        )
    }

    /// Upload `data` into `region` of one subresource of a default-usage texture
    #[allow(clippy::too_many_arguments)]
    pub fn update_texture(
        &mut self,
        texture: &TextureVk,
        mip_level: u32,
        slice: u32,
        region: TextureRegion,
        data: &TextureSubresourceData<'_>,
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        if texture.desc().usage != Usage::Default {
            error!("Only default-usage textures can be updated, '{}' is {:?}", texture.name(), texture.desc().usage);
            return Ok(());
        }
        if texture.desc().sample_count > 1 {
            error!("Multisampled texture '{}' can't be updated", texture.name());
            return Ok(());
        }
        let copy_info = buffer_to_texture_copy_info(
            texture.format(),
            region,
            self.device.limits().optimal_buffer_copy_row_pitch_alignment,
        )?;
        let packed = pack_subresource(data, &copy_info)?;

        let alignment = self.texture_copy_alignment();
        let allocation = self.upload_heap.allocate(copy_info.memory_size, alignment)?;
        self.device
            .native()
            .write_memory(allocation.memory, allocation.offset, &packed)?;
        self.copy_buffer_to_texture(
            allocation.buffer,
            allocation.offset,
            copy_info.stride_in_texels,
            texture,
            region,
            mip_level,
            slice,
            mode,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_buffer_to_texture(
        &mut self,
        src: vk::Buffer,
        src_offset: u64,
        stride_in_texels: u32,
        texture: &TextureVk,
        region: TextureRegion,
        mip_level: u32,
        slice: u32,
        mode: StateTransitionMode,
    ) -> VulkanResult<()> {
        self.ensure_command_buffer()?;
        if !self.ensure_outside_render_pass("Texture update") {
            return Ok(());
        }
        self.transition_or_verify(texture, mode, ResourceState::COPY_DEST, None)?;
        self.command_buffer.copy_buffer_to_image(
            src,
            texture.vk_image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vec![vk::BufferImageCopy {
                buffer_offset: src_offset,
                buffer_row_length: stride_in_texels,
                buffer_image_height: 0,
                image_subresource: texture.subresource_layers(mip_level, slice, 1),
                image_offset: region.offset(),
                image_extent: region.extent(),
            }],
        );
        self.state.num_commands += 1;
        Ok(())
    }

    /// Copy a region between two textures
    pub fn copy_texture(
        &mut self,
        src: &TextureVk,
        dst: &TextureVk,
        attribs: &CopyTextureAttribs,
    ) -> VulkanResult<()> {
        let src_region = attribs
            .src_region
            .unwrap_or_else(|| TextureRegion::from_extent(src.mip_extent(attribs.src_mip_level)));
        self.unbind_texture_from_framebuffer(src);
        self.unbind_texture_from_framebuffer(dst);

        self.ensure_command_buffer()?;
        if !self.ensure_outside_render_pass("Texture copy") {
            return Ok(());
        }
        self.transition_or_verify(src, attribs.src_transition_mode, ResourceState::COPY_SOURCE, None)?;
        self.transition_or_verify(dst, attribs.dst_transition_mode, ResourceState::COPY_DEST, None)?;

        let aspect_mask = aspect_flags(dst.format());
        let region = vk::ImageCopy {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: attribs.src_mip_level,
                base_array_layer: attribs.src_slice,
                layer_count: 1,
            },
            src_offset: src_region.offset(),
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: attribs.dst_mip_level,
                base_array_layer: attribs.dst_slice,
                layer_count: 1,
            },
            dst_offset: vk::Offset3D {
                x: attribs.dst_x as i32,
                y: attribs.dst_y as i32,
                z: attribs.dst_z as i32,
            },
            extent: src_region.extent(),
        };
        self.command_buffer.copy_image(
            src.vk_image(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.vk_image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vec![region],
        );
        self.state.num_commands += 1;
        Ok(())
    }

    /// A texture can't be a copy operand while it is a bound attachment
    fn unbind_texture_from_framebuffer(&mut self, texture: &TextureVk) {
        let bound = self
            .render_targets
            .iter()
            .chain(self.depth_stencil.as_ref())
            .any(|view| view.texture().id() == texture.id());
        if bound && self.active_render_pass.is_none() {
            info!("Unbinding render targets because '{}' is used in a copy", texture.name());
            self.reset_render_targets();
        }
    }

    /// Map one subresource of a dynamic texture for writing. The data is
    /// copied into the texture by [`Self::unmap_texture_subresource`].
    pub fn map_texture_subresource(
        &mut self,
        texture: &TextureVk,
        mip_level: u32,
        slice: u32,
        map_type: MapType,
        flags: MapFlags,
        region: Option<TextureRegion>,
    ) -> VulkanResult<Option<MappedTextureSubresource>> {
        if texture.desc().usage != Usage::Dynamic {
            error!("Only dynamic textures can be mapped, '{}' is {:?}", texture.name(), texture.desc().usage);
            return Ok(None);
        }
        if map_type != MapType::Write {
            error!("Dynamic texture '{}' can only be mapped for writing", texture.name());
            return Ok(None);
        }
        if flags.intersects(MapFlags::DISCARD | MapFlags::NO_OVERWRITE) {
            info!("DISCARD and NO_OVERWRITE have no effect when mapping textures");
        }
        let key = (texture.id(), mip_level, slice);
        if self.mapped_textures.contains_key(&key) {
            error!("Mip {mip_level} slice {slice} of '{}' is already mapped", texture.name());
            return Ok(None);
        }

        let region = region.unwrap_or_else(|| TextureRegion::from_extent(texture.mip_extent(mip_level)));
        let copy_info = buffer_to_texture_copy_info(
            texture.format(),
            region,
            self.device.limits().optimal_buffer_copy_row_pitch_alignment,
        )?;
        let alignment = self.texture_copy_alignment();
        let allocation = self.dynamic_heap.allocate(copy_info.memory_size, alignment)?;
        self.mapped_textures.insert(key, MappedTexture { copy_info, allocation });

        Ok(Some(MappedTextureSubresource {
            range: MappedRange::new(
                Arc::clone(self.device.native()),
                allocation.buffer,
                allocation.memory,
                allocation.offset,
                copy_info.memory_size,
            ),
            stride: copy_info.stride,
            depth_stride: copy_info.depth_stride,
        }))
    }

    /// Copy a mapped texture subresource into the texture
    pub fn unmap_texture_subresource(&mut self, texture: &TextureVk, mip_level: u32, slice: u32) -> VulkanResult<()> {
        let Some(mapped) = self.mapped_textures.remove(&(texture.id(), mip_level, slice)) else {
            error!("Mip {mip_level} slice {slice} of '{}' is not mapped", texture.name());
            return Ok(());
        };
        self.copy_buffer_to_texture(
            mapped.allocation.buffer,
            mapped.allocation.offset,
            mapped.copy_info.stride_in_texels,
            texture,
            mapped.copy_info.region,
            mip_level,
            slice,
            StateTransitionMode::Transition,
        )
    }

    /// Resolve a multisampled subresource into a single-sampled one
    pub fn resolve_texture_subresource(
        &mut self,
        src: &TextureVk,
        dst: &TextureVk,
        attribs: &ResolveTextureSubresourceAttribs,
    ) -> VulkanResult<()> {
        if src.format() != dst.format() {
            error!(
                "Resolve source '{}' ({:?}) and destination '{}' ({:?}) formats differ",
                src.name(),
                src.format(),
                dst.name(),
                dst.format()
            );
            return Ok(());
        }
        if is_depth_format(src.format()) {
            error!("Depth-stencil texture '{}' can't be resolved", src.name());
            return Ok(());
        }
        self.ensure_command_buffer()?;
        if !self.ensure_outside_render_pass("Texture resolve") {
            return Ok(());
        }
        self.transition_or_verify(src, attribs.src_transition_mode, ResourceState::RESOLVE_SOURCE, None)?;
        self.transition_or_verify(dst, attribs.dst_transition_mode, ResourceState::RESOLVE_DEST, None)?;

        let layers = |mip_level, slice| vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level,
            base_array_layer: slice,
            layer_count: 1,
        };
        self.command_buffer.resolve_image(
            src.vk_image(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.vk_image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vec![vk::ImageResolve {
                src_subresource: layers(attribs.src_mip_level, attribs.src_slice),
                src_offset: vk::Offset3D::default(),
                dst_subresource: layers(attribs.dst_mip_level, attribs.dst_slice),
                dst_offset: vk::Offset3D::default(),
                extent: src.mip_extent(attribs.src_mip_level),
            }],
        );
        self.state.num_commands += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::targets;
    use super::*;
    use crate::render::vulkan::mock::MockDevice;
    use crate::render::vulkan::native::Command;
    use crate::render::vulkan::resources::test_support::{render_target, test_device};
    use crate::render::vulkan::resources::{BindFlags, BufferDesc, CpuAccess, TextureDesc};

    fn copies(native: &MockDevice) -> Vec<(vk::Buffer, vk::Buffer, vk::BufferCopy)> {
        native
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::CopyBuffer { src, dst, regions } => Some((src, dst, regions[0])),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_update_buffer_stages_through_upload_heap() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let buffer = BufferVk::new(
            &device,
            BufferDesc::new("vertices", 256, BindFlags::VERTEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();

        context
            .update_buffer(&buffer, 16, &[7u8; 32], StateTransitionMode::Transition)
            .unwrap();

        let copies = copies(&native);
        assert_eq!(copies.len(), 1);
        let (src, dst, region) = copies[0];
        assert_eq!(dst, buffer.vk_buffer());
        assert_ne!(src, buffer.vk_buffer());
        assert_eq!(region.dst_offset, 16);
        assert_eq!(region.size, 32);
        assert_eq!(buffer.state(), ResourceState::COPY_DEST);
        assert_eq!(context.upload_heap().page_count(), 1);
        assert_eq!(context.num_commands(), 1);
    }

    #[test]
    fn test_out_of_bounds_update_and_copy_are_rejected() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let src = BufferVk::new(
            &device,
            BufferDesc::new("src", 64, BindFlags::VERTEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();
        let dst = BufferVk::new(
            &device,
            BufferDesc::new("dst", 64, BindFlags::VERTEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();

        context
            .update_buffer(&dst, 60, &[1u8; 8], StateTransitionMode::Transition)
            .unwrap();
        context
            .update_buffer(&dst, u64::MAX - 2, &[1u8; 8], StateTransitionMode::Transition)
            .unwrap();
        context
            .copy_buffer(
                &src,
                u64::MAX,
                StateTransitionMode::Transition,
                &dst,
                0,
                16,
                StateTransitionMode::Transition,
            )
            .unwrap();
        context
            .copy_buffer(
                &src,
                0,
                StateTransitionMode::Transition,
                &dst,
                8,
                u64::MAX,
                StateTransitionMode::Transition,
            )
            .unwrap();

        assert!(copies(&native).is_empty());
        assert_eq!(context.num_commands(), 0);
        assert_eq!(dst.state(), ResourceState::UNDEFINED);
    }

    #[test]
    fn test_update_dynamic_buffer_is_rejected() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let buffer = BufferVk::new(
            &device,
            BufferDesc::new("constants", 64, BindFlags::UNIFORM_BUFFER, Usage::Dynamic),
            None,
        )
        .unwrap();

        context
            .update_buffer(&buffer, 0, &[0u8; 16], StateTransitionMode::Transition)
            .unwrap();
        assert!(copies(&native).is_empty());
    }

    #[test]
    fn test_discard_map_hands_out_fresh_memory() {
        let (_native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let buffer = BufferVk::new(
            &device,
            BufferDesc::new("constants", 64, BindFlags::UNIFORM_BUFFER, Usage::Dynamic),
            None,
        )
        .unwrap();

        let first = context
            .map_buffer(&buffer, MapType::Write, MapFlags::DISCARD)
            .unwrap()
            .unwrap();
        let second = context
            .map_buffer(&buffer, MapType::Write, MapFlags::DISCARD)
            .unwrap()
            .unwrap();
        assert_ne!(first.offset(), second.offset());
        assert_eq!(buffer.dynamic_offset(context.id()), second.offset());

        // NO_OVERWRITE keeps writing into the last allocation
        let third = context
            .map_buffer(&buffer, MapType::Write, MapFlags::NO_OVERWRITE)
            .unwrap()
            .unwrap();
        assert_eq!(third.offset(), second.offset());
    }

    #[test]
    fn test_dynamic_buffer_requires_discard_or_no_overwrite() {
        let (_native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let buffer = BufferVk::new(
            &device,
            BufferDesc::new("constants", 64, BindFlags::UNIFORM_BUFFER, Usage::Dynamic),
            None,
        )
        .unwrap();

        assert!(context
            .map_buffer(&buffer, MapType::Write, MapFlags::empty())
            .unwrap()
            .is_none());
        assert!(context
            .map_buffer(&buffer, MapType::ReadWrite, MapFlags::DISCARD)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unmap_copies_into_backed_dynamic_buffer() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let buffer = BufferVk::new(
            &device,
            BufferDesc::new("particles", 128, BindFlags::UNORDERED_ACCESS, Usage::Dynamic),
            None,
        )
        .unwrap();
        assert!(!buffer.is_suballocated());

        let mapped = context
            .map_buffer(&buffer, MapType::Write, MapFlags::DISCARD)
            .unwrap()
            .unwrap();
        mapped.write(0, &[1u8; 128]).unwrap();
        context.unmap_buffer(&buffer, MapType::Write).unwrap();

        let copies = copies(&native);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, device.dynamic_memory_manager().buffer());
        assert_eq!(copies[0].1, buffer.vk_buffer());
        assert_eq!(copies[0].2.src_offset, mapped.offset());
        assert_eq!(copies[0].2.size, 128);

        // The whole buffer is copied on unmap, so NO_OVERWRITE is refused
        assert!(context
            .map_buffer(&buffer, MapType::Write, MapFlags::NO_OVERWRITE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_read_map_of_staging_buffer() {
        let (_native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let staging = BufferVk::new(
            &device,
            BufferDesc {
                cpu_access: CpuAccess::READ,
                ..BufferDesc::new("readback", 64, BindFlags::empty(), Usage::Staging)
            },
            None,
        )
        .unwrap();
        let mapped = context
            .map_buffer(&staging, MapType::Read, MapFlags::DO_NOT_WAIT)
            .unwrap()
            .unwrap();
        assert_eq!(mapped.offset(), 0);
        assert_eq!(mapped.size(), 64);

        let default = BufferVk::new(
            &device,
            BufferDesc::new("vertices", 64, BindFlags::VERTEX_BUFFER, Usage::Default),
            None,
        )
        .unwrap();
        assert!(context
            .map_buffer(&default, MapType::Read, MapFlags::DO_NOT_WAIT)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_copy_buffer_transitions_both_sides() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let make = |name: &str| {
            BufferVk::new(
                &device,
                BufferDesc::new(name, 256, BindFlags::VERTEX_BUFFER, Usage::Default),
                None,
            )
            .unwrap()
        };
        let (src, dst) = (make("src"), make("dst"));

        context
            .copy_buffer(
                &src,
                64,
                StateTransitionMode::Transition,
                &dst,
                0,
                128,
                StateTransitionMode::Transition,
            )
            .unwrap();

        assert_eq!(src.state(), ResourceState::COPY_SOURCE);
        assert_eq!(dst.state(), ResourceState::COPY_DEST);
        assert_eq!(copies(&native)[0].2.src_offset, 64);
    }

    #[test]
    fn test_update_texture_repacks_rows() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let texture = TextureVk::new(
            &device,
            TextureDesc {
                name: "atlas".into(),
                ..TextureDesc::texture_2d(4, 4)
            },
            None,
        )
        .unwrap();
        let texels = [0xabu8; 4 * 4 * 4];

        context
            .update_texture(
                &texture,
                0,
                0,
                TextureRegion::from_extent(texture.mip_extent(0)),
                &TextureSubresourceData {
                    data: &texels,
                    stride: 16,
                    depth_stride: 64,
                },
                StateTransitionMode::Transition,
            )
            .unwrap();

        let copy = native.commands().into_iter().find_map(|c| match c {
            Command::CopyBufferToImage { dst, dst_layout, regions, .. } => Some((dst, dst_layout, regions[0])),
            _ => None,
        });
        let (dst, layout, region) = copy.unwrap();
        assert_eq!(dst, texture.vk_image());
        assert_eq!(layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(region.image_extent.width, 4);
        assert_eq!(region.buffer_row_length, 4);
        assert_eq!(texture.state(), ResourceState::COPY_DEST);
    }

    #[test]
    fn test_map_texture_subresource_copies_on_unmap() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let texture = TextureVk::new(
            &device,
            TextureDesc {
                name: "video".into(),
                usage: Usage::Dynamic,
                cpu_access: CpuAccess::WRITE,
                ..TextureDesc::texture_2d(8, 8)
            },
            None,
        )
        .unwrap();

        let mapped = context
            .map_texture_subresource(&texture, 0, 0, MapType::Write, MapFlags::DISCARD, None)
            .unwrap()
            .unwrap();
        assert_eq!(mapped.stride, 32);
        assert_eq!(mapped.range.size(), 8 * 32);

        // Mapping the same subresource twice is refused
        assert!(context
            .map_texture_subresource(&texture, 0, 0, MapType::Write, MapFlags::empty(), None)
            .unwrap()
            .is_none());

        context.unmap_texture_subresource(&texture, 0, 0).unwrap();
        let copied_from = native.commands().into_iter().find_map(|c| match c {
            Command::CopyBufferToImage { src, regions, .. } => Some((src, regions[0].buffer_offset)),
            _ => None,
        });
        assert_eq!(
            copied_from,
            Some((device.dynamic_memory_manager().buffer(), mapped.range.offset()))
        );

        // A second unmap finds nothing
        context.unmap_texture_subresource(&texture, 0, 0).unwrap();
        assert_eq!(
            native.count_commands(|c| matches!(c, Command::CopyBufferToImage { .. })),
            1
        );
    }

    #[test]
    fn test_copy_texture_unbinds_render_target() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let (color, _depth) = targets(&device);
        let copy = render_target(&device, "copy", vk::Format::R8G8B8A8_UNORM);
        context
            .set_render_targets(&[Arc::clone(&color)], None, StateTransitionMode::Transition)
            .unwrap();

        context
            .copy_texture(color.texture(), &copy, &CopyTextureAttribs::default())
            .unwrap();

        let region = native.commands().into_iter().find_map(|c| match c {
            Command::CopyImage { regions, .. } => Some(regions[0]),
            _ => None,
        });
        assert_eq!(region.unwrap().extent.width, 64);
        assert_eq!(color.texture().state(), ResourceState::COPY_SOURCE);
        assert_eq!(copy.state(), ResourceState::COPY_DEST);
        assert!(context.render_targets.is_empty());
    }

    #[test]
    fn test_resolve_rejects_format_mismatch() {
        let (native, device) = test_device();
        let mut context = DeviceContext::new_immediate(&device, 0).unwrap();
        let multisampled = TextureVk::new(
            &device,
            TextureDesc {
                name: "msaa".into(),
                sample_count: 4,
                bind_flags: BindFlags::RENDER_TARGET,
                ..TextureDesc::texture_2d(32, 32)
            },
            None,
        )
        .unwrap();
        let resolved = render_target(&device, "resolved", vk::Format::R8G8B8A8_UNORM);
        let other = render_target(&device, "hdr", vk::Format::R16G16B16A16_SFLOAT);

        context
            .resolve_texture_subresource(&multisampled, &other, &ResolveTextureSubresourceAttribs::default())
            .unwrap();
        assert_eq!(native.count_commands(|c| matches!(c, Command::ResolveImage { .. })), 0);

        context
            .resolve_texture_subresource(&multisampled, &resolved, &ResolveTextureSubresourceAttribs::default())
            .unwrap();
        assert_eq!(native.count_commands(|c| matches!(c, Command::ResolveImage { .. })), 1);
        assert_eq!(multisampled.state(), ResourceState::RESOLVE_SOURCE);
        assert_eq!(resolved.state(), ResourceState::RESOLVE_DEST);
    }
}
