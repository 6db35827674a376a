//! Textures and texture views

use std::sync::Arc;

use ash::vk;

use super::{Barrierable, BindFlags, CpuAccess, Mappable, ResourceStateCell, Stateful, Usage};
use crate::foundation::align::align_up;
use crate::foundation::logging::debug;
use crate::render::vulkan::commands::CommandBuffer;
use crate::render::vulkan::device::RenderDevice;
use crate::render::vulkan::error::{VulkanError, VulkanResult};
use crate::render::vulkan::format::{aspect_flags, texel_size};
use crate::render::vulkan::native::{ImageCreateDesc, ImageViewDesc, NativeObject};
use crate::render::vulkan::state::{resource_state_to_image_layout, texture_needs_barrier, ResourceState};

/// Texture creation parameters
#[derive(Debug, Clone)]
pub struct TextureDesc {
    /// Debug name
    pub name: String,
    /// 1D, 2D or 3D
    pub image_type: vk::ImageType,
    /// Width of mip 0
    pub width: u32,
    /// Height of mip 0
    pub height: u32,
    /// Depth of mip 0 for 3D textures, 1 otherwise
    pub depth: u32,
    /// Array slices
    pub array_size: u32,
    /// Mip levels, 0 for the full chain
    pub mip_levels: u32,
    /// Samples per texel
    pub sample_count: u32,
    /// Texel format
    pub format: vk::Format,
    /// Allowed bindings
    pub bind_flags: BindFlags,
    /// Update frequency
    pub usage: Usage,
    /// CPU access of dynamic textures
    pub cpu_access: CpuAccess,
}

impl TextureDesc {
    /// Single-mip RGBA8 shader resource
    pub fn texture_2d(width: u32, height: u32) -> Self {
        Self {
            name: String::new(),
            image_type: vk::ImageType::TYPE_2D,
            width,
            height,
            depth: 1,
            array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            bind_flags: BindFlags::SHADER_RESOURCE,
            usage: Usage::Default,
            cpu_access: CpuAccess::empty(),
        }
    }

    fn full_mip_chain(&self) -> u32 {
        let largest = self.width.max(self.height).max(self.depth).max(1);
        32 - largest.leading_zeros()
    }
}

/// Box within one texture subresource, max bounds exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureRegion {
    /// Left
    pub min_x: u32,
    /// Right
    pub max_x: u32,
    /// Top
    pub min_y: u32,
    /// Bottom
    pub max_y: u32,
    /// Front
    pub min_z: u32,
    /// Back
    pub max_z: u32,
}

impl TextureRegion {
    /// Region covering `extent`
    pub fn from_extent(extent: vk::Extent3D) -> Self {
        Self {
            min_x: 0,
            max_x: extent.width,
            min_y: 0,
            max_y: extent.height,
            min_z: 0,
            max_z: extent.depth,
        }
    }

    /// Width in texels
    pub fn width(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    /// Height in texels, at least 1
    pub fn height(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y).max(1)
    }

    /// Depth in texels, at least 1
    pub fn depth(&self) -> u32 {
        self.max_z.saturating_sub(self.min_z).max(1)
    }

    /// Offset of the region corner
    pub fn offset(&self) -> vk::Offset3D {
        vk::Offset3D {
            x: self.min_x as i32,
            y: self.min_y as i32,
            z: self.min_z as i32,
        }
    }

    /// Extent of the region
    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width(),
            height: self.height(),
            depth: self.depth(),
        }
    }
}

/// CPU data of one subresource
#[derive(Debug, Clone, Copy)]
pub struct TextureSubresourceData<'a> {
    /// Texel rows
    pub data: &'a [u8],
    /// Bytes between rows
    pub stride: u64,
    /// Bytes between depth slices
    pub depth_stride: u64,
}

/// Staging layout of a region copied from a buffer into a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferToTextureCopyInfo {
    /// Bytes of texel data in one row
    pub row_size: u64,
    /// Rows per depth slice
    pub row_count: u32,
    /// Bytes between rows in the staging buffer
    pub stride: u64,
    /// Stride expressed in texels, as the copy command expects
    pub stride_in_texels: u32,
    /// Bytes between depth slices in the staging buffer
    pub depth_stride: u64,
    /// Total staging size
    pub memory_size: u64,
    /// Copied region
    pub region: TextureRegion,
}

/// Staging layout of `region` for an uncompressed `format`
pub fn buffer_to_texture_copy_info(
    format: vk::Format,
    region: TextureRegion,
    row_pitch_alignment: u64,
) -> VulkanResult<BufferToTextureCopyInfo> {
    let texel = texel_size(format)
        .ok_or_else(|| VulkanError::invalid_operation(format!("format {format:?} cannot be copied texel by texel")))?
        as u64;
    let row_size = u64::from(region.width()) * texel;
    let row_count = region.height();
    let stride = align_up(row_size, row_pitch_alignment.max(1));
    let depth_stride = u64::from(row_count) * stride;
    Ok(BufferToTextureCopyInfo {
        row_size,
        row_count,
        stride,
        stride_in_texels: (stride / texel) as u32,
        depth_stride,
        memory_size: u64::from(region.depth()) * depth_stride,
        region,
    })
}

/// Repack `source` rows into the staging layout of `info`
pub(crate) fn pack_subresource(source: &TextureSubresourceData<'_>, info: &BufferToTextureCopyInfo) -> VulkanResult<Vec<u8>> {
    let mut packed = vec![0u8; info.memory_size as usize];
    let row_size = info.row_size as usize;
    for z in 0..u64::from(info.region.depth()) {
        for y in 0..u64::from(info.row_count) {
            let src = (z * source.depth_stride + y * source.stride) as usize;
            let dst = (z * info.depth_stride + y * info.stride) as usize;
            let row = source.data.get(src..src + row_size).ok_or_else(|| {
                VulkanError::invalid_operation(format!(
                    "subresource data of {} bytes is too small for row {y} of slice {z}",
                    source.data.len()
                ))
            })?;
            packed[dst..dst + row_size].copy_from_slice(row);
        }
    }
    Ok(packed)
}

fn vk_usage_flags(bind_flags: BindFlags) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if bind_flags.contains(BindFlags::RENDER_TARGET) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if bind_flags.contains(BindFlags::DEPTH_STENCIL) {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if bind_flags.contains(BindFlags::UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    if bind_flags.contains(BindFlags::SHADER_RESOURCE) {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if bind_flags.contains(BindFlags::INPUT_ATTACHMENT) {
        usage |= vk::ImageUsageFlags::INPUT_ATTACHMENT;
    }
    usage
}

/// GPU texture
pub struct TextureVk {
    device: Arc<RenderDevice>,
    desc: TextureDesc,
    id: u64,
    image: vk::Image,
    memory: vk::DeviceMemory,
    state: ResourceStateCell,
}

impl TextureVk {
    /// Create a texture, optionally filled with one data entry per subresource.
    ///
    /// Subresources are ordered slice by slice, each slice listing its mips.
    pub fn new(
        device: &Arc<RenderDevice>,
        mut desc: TextureDesc,
        initial_data: Option<&[TextureSubresourceData<'_>]>,
    ) -> VulkanResult<Arc<Self>> {
        if desc.usage == Usage::Staging {
            return Err(VulkanError::invalid_operation(format!(
                "staging texture '{}' is not supported",
                desc.name
            )));
        }
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 || desc.array_size == 0 {
            return Err(VulkanError::invalid_operation(format!(
                "texture '{}' has an empty extent",
                desc.name
            )));
        }
        if desc.usage == Usage::Immutable && initial_data.is_none() {
            return Err(VulkanError::invalid_operation(format!(
                "immutable texture '{}' must be initialized at creation",
                desc.name
            )));
        }
        if desc.mip_levels == 0 {
            desc.mip_levels = desc.full_mip_chain();
        }

        let samples = vk::SampleCountFlags::from_raw(desc.sample_count.max(1));
        let create_desc = ImageCreateDesc {
            image_type: desc.image_type,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            },
            mip_levels: desc.mip_levels,
            array_layers: desc.array_size,
            samples,
            usage: vk_usage_flags(desc.bind_flags),
            flags: vk::ImageCreateFlags::empty(),
        };

        let native = device.native();
        let (image, memory) = native.create_image(&create_desc)?;

        let texture = Self {
            device: Arc::clone(device),
            id: device.allocate_resource_id(),
            desc,
            image,
            memory,
            state: ResourceStateCell::new(ResourceState::UNDEFINED),
        };

        // From here on a failed upload releases the image through Drop
        if let Some(subresources) = initial_data {
            texture.upload_initial_data(subresources)?;
            texture.set_state(ResourceState::COPY_DEST);
        }

        debug!(
            "Created texture '{}' ({}x{}x{}, {} mip(s), {:?})",
            texture.desc.name,
            texture.desc.width,
            texture.desc.height,
            texture.desc.depth,
            texture.desc.mip_levels,
            texture.desc.format
        );
        Ok(Arc::new(texture))
    }

    fn upload_initial_data(&self, subresources: &[TextureSubresourceData<'_>]) -> VulkanResult<()> {
        let expected = (self.desc.array_size * self.desc.mip_levels) as usize;
        if subresources.len() != expected {
            return Err(VulkanError::invalid_operation(format!(
                "texture '{}' expects {expected} subresource(s) of initial data, got {}",
                self.desc.name,
                subresources.len()
            )));
        }

        let limits = *self.device.limits();
        let offset_alignment = limits.optimal_buffer_copy_offset_alignment.max(4);
        let aspect_mask = aspect_flags(self.desc.format);

        let mut staging_data = Vec::new();
        let mut regions = Vec::with_capacity(expected);
        for slice in 0..self.desc.array_size {
            for mip in 0..self.desc.mip_levels {
                let source = &subresources[(slice * self.desc.mip_levels + mip) as usize];
                let info = buffer_to_texture_copy_info(
                    self.desc.format,
                    TextureRegion::from_extent(self.mip_extent(mip)),
                    limits.optimal_buffer_copy_row_pitch_alignment,
                )?;

                let offset = align_up(staging_data.len() as u64, offset_alignment);
                staging_data.resize(offset as usize, 0);
                staging_data.extend_from_slice(&pack_subresource(source, &info)?);

                regions.push(vk::BufferImageCopy {
                    buffer_offset: offset,
                    buffer_row_length: info.stride_in_texels,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask,
                        mip_level: mip,
                        base_array_layer: slice,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: info.region.extent(),
                });
            }
        }

        let native = self.device.native();
        let (staging, staging_memory) = native.create_buffer(
            staging_data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let staging_object = NativeObject::Buffer {
            buffer: staging,
            memory: staging_memory,
        };
        if let Err(err) = native.write_memory(staging_memory, 0, &staging_data) {
            native.destroy(staging_object);
            return Err(err);
        }

        let image = self.image;
        let range = self.full_range();
        let submitted = self.device.execute_transient(0, |command_buffer| {
            command_buffer.transition_image_layout(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                range,
            );
            command_buffer.copy_buffer_to_image(staging, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, regions);
        });

        self.device.safe_release_native_object(staging_object, 1);
        submitted.map(|_| ())
    }

    /// Creation parameters, with the mip count resolved
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    /// Device-unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Native image
    pub fn vk_image(&self) -> vk::Image {
        self.image
    }

    /// Texel format
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Size of mip level `mip`
    pub fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        let width = (self.desc.width >> mip).max(1);
        let height = if self.desc.image_type == vk::ImageType::TYPE_1D {
            1
        } else {
            (self.desc.height >> mip).max(1)
        };
        let depth = if self.desc.image_type == vk::ImageType::TYPE_3D {
            (self.desc.depth >> mip).max(1)
        } else {
            1
        };
        vk::Extent3D { width, height, depth }
    }

    /// Every mip and slice of the texture
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_flags(self.desc.format),
            base_mip_level: 0,
            level_count: self.desc.mip_levels,
            base_array_layer: 0,
            layer_count: self.desc.array_size,
        }
    }

    /// One mip of one slice
    pub fn subresource_range(&self, mip: u32, slice: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_flags(self.desc.format),
            base_mip_level: mip,
            level_count: 1,
            base_array_layer: slice,
            layer_count: 1,
        }
    }

    /// Layers of one mip as the copy commands address them
    pub fn subresource_layers(&self, mip: u32, first_slice: u32, slice_count: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: aspect_flags(self.desc.format),
            mip_level: mip,
            base_array_layer: first_slice,
            layer_count: slice_count,
        }
    }

    /// Create a view of the texture
    pub fn create_view(self: &Arc<Self>, desc: TextureViewDesc) -> VulkanResult<Arc<TextureView>> {
        let desc = desc.resolve(&self.desc);
        if desc.most_detailed_mip + desc.num_mips > self.desc.mip_levels
            || desc.first_slice + desc.num_slices > self.desc.array_size
        {
            return Err(VulkanError::invalid_operation(format!(
                "view of texture '{}' is out of range",
                self.desc.name
            )));
        }

        let format = desc.format.unwrap_or(self.desc.format);
        let view_type = match (self.desc.image_type, desc.num_slices > 1) {
            (vk::ImageType::TYPE_1D, false) => vk::ImageViewType::TYPE_1D,
            (vk::ImageType::TYPE_1D, true) => vk::ImageViewType::TYPE_1D_ARRAY,
            (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
            (_, false) => vk::ImageViewType::TYPE_2D,
            (_, true) => vk::ImageViewType::TYPE_2D_ARRAY,
        };
        let handle = self.device.native().create_image_view(&ImageViewDesc {
            image: self.image,
            view_type,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect_flags(format),
                base_mip_level: desc.most_detailed_mip,
                level_count: desc.num_mips,
                base_array_layer: desc.first_slice,
                layer_count: desc.num_slices,
            },
        })?;

        Ok(Arc::new(TextureView {
            texture: Arc::clone(self),
            handle,
            desc,
        }))
    }
}

impl Stateful for TextureVk {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn state(&self) -> ResourceState {
        self.state.get()
    }

    fn set_state(&self, state: ResourceState) {
        self.state.set(state);
    }

    fn check_state(&self, state: ResourceState) -> bool {
        self.state() == state
    }
}

impl Barrierable for TextureVk {
    fn needs_barrier(&self, old: ResourceState, new: ResourceState) -> bool {
        texture_needs_barrier(old, new)
    }

    fn record_barrier(
        &self,
        command_buffer: &mut CommandBuffer,
        old: ResourceState,
        new: ResourceState,
        range: Option<vk::ImageSubresourceRange>,
    ) {
        command_buffer.transition_image_layout(
            self.image,
            resource_state_to_image_layout(old, false),
            resource_state_to_image_layout(new, false),
            range.unwrap_or_else(|| self.full_range()),
        );
    }
}

impl Mappable for TextureVk {
    fn usage(&self) -> Usage {
        self.desc.usage
    }

    fn cpu_access(&self) -> CpuAccess {
        self.desc.cpu_access
    }
}

impl Drop for TextureVk {
    fn drop(&mut self) {
        self.device.safe_release_native_object(
            NativeObject::Image {
                image: self.image,
                memory: self.memory,
            },
            self.device.command_queue_mask(),
        );
    }
}

/// How a view binds its texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureViewType {
    /// Sampled in shaders
    ShaderResource,
    /// Color attachment
    RenderTarget,
    /// Depth-stencil attachment
    DepthStencil,
    /// Storage image
    UnorderedAccess,
}

/// View creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureViewDesc {
    /// Binding kind
    pub view_type: TextureViewType,
    /// First viewed mip
    pub most_detailed_mip: u32,
    /// Viewed mips, 0 for the rest of the chain
    pub num_mips: u32,
    /// First viewed slice
    pub first_slice: u32,
    /// Viewed slices, 0 for the remaining slices
    pub num_slices: u32,
    /// View format, the texture format when `None`
    pub format: Option<vk::Format>,
}

impl TextureViewDesc {
    /// View of every mip and slice
    pub fn new(view_type: TextureViewType) -> Self {
        Self {
            view_type,
            most_detailed_mip: 0,
            num_mips: 0,
            first_slice: 0,
            num_slices: 0,
            format: None,
        }
    }

    fn resolve(mut self, texture: &TextureDesc) -> Self {
        if self.num_mips == 0 {
            self.num_mips = texture.mip_levels.saturating_sub(self.most_detailed_mip);
        }
        // Attachments and storage images address a single mip
        if self.view_type != TextureViewType::ShaderResource {
            self.num_mips = 1;
        }
        if self.num_slices == 0 {
            self.num_slices = texture.array_size.saturating_sub(self.first_slice);
        }
        self
    }
}

/// View of a texture. Keeps the texture alive.
pub struct TextureView {
    texture: Arc<TextureVk>,
    handle: vk::ImageView,
    desc: TextureViewDesc,
}

impl TextureView {
    /// Viewed texture
    pub fn texture(&self) -> &Arc<TextureVk> {
        &self.texture
    }

    /// Native view
    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }

    /// Resolved creation parameters
    pub fn desc(&self) -> &TextureViewDesc {
        &self.desc
    }

    /// Binding kind
    pub fn view_type(&self) -> TextureViewType {
        self.desc.view_type
    }

    /// Size of the most detailed viewed mip
    pub fn extent(&self) -> vk::Extent3D {
        self.texture.mip_extent(self.desc.most_detailed_mip)
    }

    /// Viewed mips and slices
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_flags(self.desc.format.unwrap_or(self.texture.format())),
            base_mip_level: self.desc.most_detailed_mip,
            level_count: self.desc.num_mips,
            base_array_layer: self.desc.first_slice,
            layer_count: self.desc.num_slices,
        }
    }
}

impl Drop for TextureView {
    fn drop(&mut self) {
        let device = &self.texture.device;
        device.on_destroy_image_view(self.handle);
        device.safe_release_native_object(NativeObject::ImageView(self.handle), device.command_queue_mask());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use crate::render::vulkan::native::Command;
    use crate::render::vulkan::resources::test_support::{render_target, test_device};

    #[test]
    fn test_copy_info_aligns_rows() {
        let region = TextureRegion {
            min_x: 2,
            max_x: 7,
            min_y: 0,
            max_y: 3,
            min_z: 0,
            max_z: 0,
        };
        let info = buffer_to_texture_copy_info(vk::Format::R8G8B8A8_UNORM, region, 64).unwrap();
        assert_eq!(info.row_size, 20);
        assert_eq!(info.stride, 64);
        assert_eq!(info.stride_in_texels, 16);
        assert_eq!(info.depth_stride, 192);
        // Empty z range still counts as one slice
        assert_eq!(info.memory_size, 192);

        assert!(buffer_to_texture_copy_info(vk::Format::BC1_RGB_UNORM_BLOCK, region, 1).is_err());
    }

    #[test]
    fn test_pack_subresource_restrides_rows() {
        let info = buffer_to_texture_copy_info(
            vk::Format::R8_UNORM,
            TextureRegion::from_extent(vk::Extent3D {
                width: 2,
                height: 2,
                depth: 1,
            }),
            4,
        )
        .unwrap();
        let source = TextureSubresourceData {
            data: &[1, 2, 0xff, 3, 4, 0xff],
            stride: 3,
            depth_stride: 6,
        };
        assert_eq!(pack_subresource(&source, &info).unwrap(), vec![1, 2, 0, 0, 3, 4, 0, 0]);

        let short = TextureSubresourceData {
            data: &[1, 2, 3],
            stride: 3,
            depth_stride: 6,
        };
        assert!(pack_subresource(&short, &info).is_err());
    }

    #[test]
    fn test_mip_extents_and_full_chain() {
        let (_native, device) = test_device();
        let texture = TextureVk::new(
            &device,
            TextureDesc {
                mip_levels: 0,
                ..TextureDesc::texture_2d(64, 16)
            },
            None,
        )
        .unwrap();

        assert_eq!(texture.desc().mip_levels, 7);
        assert_eq!(texture.mip_extent(3).width, 8);
        assert_eq!(texture.mip_extent(3).height, 2);
        assert_eq!(texture.mip_extent(6).height, 1);
        assert_eq!(texture.state(), ResourceState::UNDEFINED);
    }

    #[test]
    fn test_initial_data_is_uploaded_per_subresource() {
        let (native, device) = test_device();
        let mip0 = vec![0xaau8; 4 * 4 * 4];
        let mip1 = vec![0xbbu8; 2 * 2 * 4];
        let data = [
            TextureSubresourceData {
                data: &mip0,
                stride: 16,
                depth_stride: 64,
            },
            TextureSubresourceData {
                data: &mip1,
                stride: 8,
                depth_stride: 16,
            },
        ];
        let texture = TextureVk::new(
            &device,
            TextureDesc {
                mip_levels: 2,
                usage: Usage::Immutable,
                ..TextureDesc::texture_2d(4, 4)
            },
            Some(&data),
        )
        .unwrap();

        assert_eq!(texture.state(), ResourceState::COPY_DEST);
        let barriers = native.image_barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barriers[0].subresource_range.level_count, 2);

        let regions = native
            .commands()
            .into_iter()
            .find_map(|command| match command {
                Command::CopyBufferToImage { dst, regions, .. } if dst == texture.vk_image() => Some(regions),
                _ => None,
            })
            .unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].image_subresource.mip_level, 1);
        assert_eq!(regions[1].image_extent.width, 2);
        assert_eq!(regions[1].buffer_offset % 4, 0);
    }

    #[test]
    fn test_staging_texture_is_rejected() {
        let (_native, device) = test_device();
        let result = TextureVk::new(
            &device,
            TextureDesc {
                usage: Usage::Staging,
                ..TextureDesc::texture_2d(4, 4)
            },
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_attachment_view_covers_one_mip() {
        let (_native, device) = test_device();
        let texture = TextureVk::new(
            &device,
            TextureDesc {
                mip_levels: 3,
                bind_flags: BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE,
                ..TextureDesc::texture_2d(32, 32)
            },
            None,
        )
        .unwrap();

        let srv = texture.create_view(TextureViewDesc::new(TextureViewType::ShaderResource)).unwrap();
        assert_eq!(srv.subresource_range().level_count, 3);

        let rtv = texture
            .create_view(TextureViewDesc {
                most_detailed_mip: 1,
                ..TextureViewDesc::new(TextureViewType::RenderTarget)
            })
            .unwrap();
        assert_eq!(rtv.subresource_range().level_count, 1);
        assert_eq!(rtv.extent().width, 16);
    }

    #[test]
    fn test_depth_texture_barrier_uses_depth_aspect() {
        let (native, device) = test_device();
        let depth = render_target(&device, "depth", vk::Format::D32_SFLOAT);

        let mut command_buffer = CommandBuffer::new(native.clone());
        command_buffer.set_handle(vk::CommandBuffer::from_raw(1));
        depth.record_barrier(&mut command_buffer, ResourceState::UNDEFINED, ResourceState::DEPTH_WRITE, None);
        command_buffer.flush_barriers();

        let barriers = native.image_barriers();
        assert_eq!(barriers[0].subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert!(texture_needs_barrier(ResourceState::UNORDERED_ACCESS, ResourceState::UNORDERED_ACCESS));
    }

    #[test]
    fn test_view_drop_releases_handle() {
        let (native, device) = test_device();
        let texture = render_target(&device, "color", vk::Format::R8G8B8A8_UNORM);
        let view = texture.create_view(TextureViewDesc::new(TextureViewType::RenderTarget)).unwrap();
        let handle = view.handle();
        drop(view);

        device.flush_stale_resources(0).unwrap();
        assert!(native.destroyed().contains(&NativeObject::ImageView(handle)));
    }
}
