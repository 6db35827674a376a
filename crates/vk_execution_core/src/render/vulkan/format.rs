//! Texture format helpers

use ash::vk;

/// Size of one texel in bytes. `None` for block-compressed and unknown formats.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT | vk::Format::S8_UINT => 1,

        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R8G8_SINT
        | vk::Format::R16_UNORM
        | vk::Format::R16_SNORM
        | vk::Format::R16_UINT
        | vk::Format::R16_SINT
        | vk::Format::R16_SFLOAT
        | vk::Format::D16_UNORM
        | vk::Format::R5G6B5_UNORM_PACK16 => 2,

        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SINT
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R16G16_UINT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT
        | vk::Format::R32_SFLOAT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::X8_D24_UNORM_PACK32 => 4,

        vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R16G16B16A16_SINT
        | vk::Format::R32G32_UINT
        | vk::Format::R32G32_SINT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::D32_SFLOAT_S8_UINT => 8,

        vk::Format::R32G32B32_UINT | vk::Format::R32G32B32_SINT | vk::Format::R32G32B32_SFLOAT => 12,

        vk::Format::R32G32B32A32_UINT | vk::Format::R32G32B32A32_SINT | vk::Format::R32G32B32A32_SFLOAT => 16,

        _ => return None,
    };
    Some(size)
}

/// Whether the format has a depth component
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Whether the format has a stencil component
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspects present in images of the given format
pub fn aspect_flags(format: vk::Format) -> vk::ImageAspectFlags {
    let mut aspect = vk::ImageAspectFlags::empty();
    if is_depth_format(format) {
        aspect |= vk::ImageAspectFlags::DEPTH;
    }
    if has_stencil(format) {
        aspect |= vk::ImageAspectFlags::STENCIL;
    }
    if aspect.is_empty() {
        vk::ImageAspectFlags::COLOR
    } else {
        aspect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::D16_UNORM), Some(2));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn test_aspect_flags() {
        assert_eq!(aspect_flags(vk::Format::B8G8R8A8_SRGB), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_flags(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_flags(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_flags(vk::Format::S8_UINT), vk::ImageAspectFlags::STENCIL);
    }
}
