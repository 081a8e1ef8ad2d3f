//! Texture formats, their properties, and buffer/texture copy layout math.

use ash::vk;

use crate::subresource::Aspects;

/// Texture formats understood by the device factories.
///
/// This is a curated subset of what Vulkan can express; the translation to
/// `vk::Format` is pure data.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    R8Snorm,
    R8Uint,
    R8Sint,
    Rg8Unorm,
    Rg8Snorm,
    Rg8Uint,
    Rg8Sint,
    R16Uint,
    R16Sint,
    R16Float,
    Rgba8Unorm,
    Rgba8Snorm,
    Rgba8Uint,
    Rgba8Sint,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgb10a2Unorm,
    Rg11b10Float,
    Rg16Uint,
    Rg16Sint,
    Rg16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rgba16Uint,
    Rgba16Sint,
    Rgba16Float,
    Rg32Uint,
    Rg32Sint,
    Rg32Float,
    Rgba32Uint,
    Rgba32Sint,
    Rgba32Float,
    // Depth/stencil formats.
    Depth16Unorm,
    Depth32Float,
    Depth24UnormStencil8,
    Depth32FloatStencil8,
    Stencil8,
    // Block-compressed formats.
    Bc1RgbaUnorm,
    Bc1RgbaUnormSrgb,
    Bc3RgbaUnorm,
    Bc3RgbaUnormSrgb,
    Bc4RUnorm,
    Bc5RgUnorm,
    Bc7RgbaUnorm,
    Bc7RgbaUnormSrgb,
}

/// Per-format properties needed by state tracking and copy-layout math.
#[derive(Copy, Clone, Debug)]
pub struct FormatInfo {
    /// Aspects present in the format; never empty.
    pub aspects: Aspects,
    /// Bytes per texel block (texel for uncompressed formats).
    pub bytes_per_block: u32,
    /// Texel block edge length; 1 for uncompressed formats.
    pub block_size: u32,
}

impl FormatInfo {
    pub fn has_depth(&self) -> bool {
        self.aspects.contains(Aspects::DEPTH)
    }

    pub fn has_stencil(&self) -> bool {
        self.aspects.contains(Aspects::STENCIL)
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.aspects.intersects(Aspects::DEPTH | Aspects::STENCIL)
    }

    pub fn is_compressed(&self) -> bool {
        self.block_size > 1
    }
}

impl TextureFormat {
    pub fn info(self) -> FormatInfo {
        use TextureFormat::*;
        let (aspects, bytes_per_block, block_size) = match self {
            R8Unorm | R8Snorm | R8Uint | R8Sint => (Aspects::COLOR, 1, 1),
            Rg8Unorm | Rg8Snorm | Rg8Uint | Rg8Sint => (Aspects::COLOR, 2, 1),
            R16Uint | R16Sint | R16Float => (Aspects::COLOR, 2, 1),
            Rgba8Unorm | Rgba8Snorm | Rgba8Uint | Rgba8Sint | Rgba8UnormSrgb | Bgra8Unorm
            | Bgra8UnormSrgb | Rgb10a2Unorm | Rg11b10Float => (Aspects::COLOR, 4, 1),
            Rg16Uint | Rg16Sint | Rg16Float | R32Uint | R32Sint | R32Float => {
                (Aspects::COLOR, 4, 1)
            }
            Rgba16Uint | Rgba16Sint | Rgba16Float | Rg32Uint | Rg32Sint | Rg32Float => {
                (Aspects::COLOR, 8, 1)
            }
            Rgba32Uint | Rgba32Sint | Rgba32Float => (Aspects::COLOR, 16, 1),
            Depth16Unorm => (Aspects::DEPTH, 2, 1),
            Depth32Float => (Aspects::DEPTH, 4, 1),
            Depth24UnormStencil8 => (Aspects::DEPTH | Aspects::STENCIL, 4, 1),
            Depth32FloatStencil8 => (Aspects::DEPTH | Aspects::STENCIL, 5, 1),
            Stencil8 => (Aspects::STENCIL, 1, 1),
            Bc1RgbaUnorm | Bc1RgbaUnormSrgb | Bc4RUnorm => (Aspects::COLOR, 8, 4),
            Bc3RgbaUnorm | Bc3RgbaUnormSrgb | Bc5RgUnorm | Bc7RgbaUnorm | Bc7RgbaUnormSrgb => {
                (Aspects::COLOR, 16, 4)
            }
        };
        FormatInfo {
            aspects,
            bytes_per_block,
            block_size,
        }
    }

    pub(crate) fn to_vk(self) -> vk::Format {
        use TextureFormat::*;
        match self {
            R8Unorm => vk::Format::R8_UNORM,
            R8Snorm => vk::Format::R8_SNORM,
            R8Uint => vk::Format::R8_UINT,
            R8Sint => vk::Format::R8_SINT,
            Rg8Unorm => vk::Format::R8G8_UNORM,
            Rg8Snorm => vk::Format::R8G8_SNORM,
            Rg8Uint => vk::Format::R8G8_UINT,
            Rg8Sint => vk::Format::R8G8_SINT,
            R16Uint => vk::Format::R16_UINT,
            R16Sint => vk::Format::R16_SINT,
            R16Float => vk::Format::R16_SFLOAT,
            Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Rgba8Snorm => vk::Format::R8G8B8A8_SNORM,
            Rgba8Uint => vk::Format::R8G8B8A8_UINT,
            Rgba8Sint => vk::Format::R8G8B8A8_SINT,
            Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
            Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
            Rgb10a2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
            Rg11b10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
            Rg16Uint => vk::Format::R16G16_UINT,
            Rg16Sint => vk::Format::R16G16_SINT,
            Rg16Float => vk::Format::R16G16_SFLOAT,
            R32Uint => vk::Format::R32_UINT,
            R32Sint => vk::Format::R32_SINT,
            R32Float => vk::Format::R32_SFLOAT,
            Rgba16Uint => vk::Format::R16G16B16A16_UINT,
            Rgba16Sint => vk::Format::R16G16B16A16_SINT,
            Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Rg32Uint => vk::Format::R32G32_UINT,
            Rg32Sint => vk::Format::R32G32_SINT,
            Rg32Float => vk::Format::R32G32_SFLOAT,
            Rgba32Uint => vk::Format::R32G32B32A32_UINT,
            Rgba32Sint => vk::Format::R32G32B32A32_SINT,
            Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Depth16Unorm => vk::Format::D16_UNORM,
            Depth32Float => vk::Format::D32_SFLOAT,
            Depth24UnormStencil8 => vk::Format::D24_UNORM_S8_UINT,
            Depth32FloatStencil8 => vk::Format::D32_SFLOAT_S8_UINT,
            Stencil8 => vk::Format::S8_UINT,
            Bc1RgbaUnorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
            Bc1RgbaUnormSrgb => vk::Format::BC1_RGBA_SRGB_BLOCK,
            Bc3RgbaUnorm => vk::Format::BC3_UNORM_BLOCK,
            Bc3RgbaUnormSrgb => vk::Format::BC3_SRGB_BLOCK,
            Bc4RUnorm => vk::Format::BC4_UNORM_BLOCK,
            Bc5RgUnorm => vk::Format::BC5_UNORM_BLOCK,
            Bc7RgbaUnorm => vk::Format::BC7_UNORM_BLOCK,
            Bc7RgbaUnormSrgb => vk::Format::BC7_SRGB_BLOCK,
        }
    }

    /// Maps a surface format reported by the driver back to a known format.
    pub(crate) fn from_vk(format: vk::Format) -> Option<TextureFormat> {
        use TextureFormat::*;
        Some(match format {
            vk::Format::R8G8B8A8_UNORM => Rgba8Unorm,
            vk::Format::R8G8B8A8_SRGB => Rgba8UnormSrgb,
            vk::Format::B8G8R8A8_UNORM => Bgra8Unorm,
            vk::Format::B8G8R8A8_SRGB => Bgra8UnormSrgb,
            vk::Format::A2B10G10R10_UNORM_PACK32 => Rgb10a2Unorm,
            vk::Format::R16G16B16A16_SFLOAT => Rgba16Float,
            _ => return None,
        })
    }
}

pub(crate) fn vk_aspect_flags(aspects: Aspects) -> vk::ImageAspectFlags {
    let mut flags = vk::ImageAspectFlags::empty();
    if aspects.contains(Aspects::COLOR) {
        flags |= vk::ImageAspectFlags::COLOR;
    }
    if aspects.contains(Aspects::DEPTH) {
        flags |= vk::ImageAspectFlags::DEPTH;
    }
    if aspects.contains(Aspects::STENCIL) {
        flags |= vk::ImageAspectFlags::STENCIL;
    }
    if aspects.contains(Aspects::PLANE_0) {
        flags |= vk::ImageAspectFlags::PLANE_0;
    }
    if aspects.contains(Aspects::PLANE_1) {
        flags |= vk::ImageAspectFlags::PLANE_1;
    }
    if aspects.contains(Aspects::PLANE_2) {
        flags |= vk::ImageAspectFlags::PLANE_2;
    }
    flags
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Staging layout of one texture copy region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct TextureCopyLayout {
    /// Bytes of actual texel data per row of blocks.
    pub row_bytes: u32,
    /// Number of block rows per depth slice.
    pub row_count: u32,
    /// Distance in bytes between successive rows in the staging buffer.
    pub row_stride: u32,
    /// Distance in bytes between successive depth slices.
    pub depth_stride: u32,
    /// Total staging bytes for the region.
    pub total_bytes: u64,
}

/// Computes the staging buffer layout for copying `width`×`height`×`depth`
/// texels of `format`, honoring the device's optimal row-pitch alignment.
pub(crate) fn compute_texture_copy_layout(
    format: TextureFormat,
    width: u32,
    height: u32,
    depth: u32,
    row_pitch_alignment: u64,
) -> TextureCopyLayout {
    let info = format.info();

    let (row_bytes, row_count) = if info.is_compressed() {
        let block_aligned_width = (width + info.block_size - 1) / info.block_size * info.block_size;
        let block_aligned_height =
            (height + info.block_size - 1) / info.block_size * info.block_size;
        (
            block_aligned_width / info.block_size * info.bytes_per_block,
            block_aligned_height / info.block_size,
        )
    } else {
        (width * info.bytes_per_block, height)
    };

    let row_stride = align_up(row_bytes as u64, row_pitch_alignment) as u32;
    let depth_stride = row_count * row_stride;
    TextureCopyLayout {
        row_bytes,
        row_count,
        row_stride,
        depth_stride,
        total_bytes: depth as u64 * depth_stride as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_copy_layout() {
        let layout = compute_texture_copy_layout(TextureFormat::Rgba8Unorm, 64, 64, 1, 256);
        assert_eq!(layout.row_bytes, 256);
        assert_eq!(layout.row_count, 64);
        assert_eq!(layout.row_stride, 256);
        assert_eq!(layout.total_bytes, 256 * 64);
    }

    #[test]
    fn row_pitch_is_aligned() {
        let layout = compute_texture_copy_layout(TextureFormat::Rgba8Unorm, 3, 2, 2, 256);
        assert_eq!(layout.row_bytes, 12);
        assert_eq!(layout.row_stride, 256);
        assert_eq!(layout.depth_stride, 512);
        assert_eq!(layout.total_bytes, 1024);
    }

    #[test]
    fn compressed_copy_layout_rounds_to_blocks() {
        // 10x10 BC7: 3x3 blocks of 16 bytes.
        let layout = compute_texture_copy_layout(TextureFormat::Bc7RgbaUnorm, 10, 10, 1, 16);
        assert_eq!(layout.row_bytes, 3 * 16);
        assert_eq!(layout.row_count, 3);
        assert_eq!(layout.row_stride, 48);
    }

    #[test]
    fn depth_stencil_aspects() {
        assert_eq!(
            TextureFormat::Depth24UnormStencil8.info().aspects,
            Aspects::DEPTH | Aspects::STENCIL
        );
        assert_eq!(TextureFormat::Stencil8.info().aspects, Aspects::STENCIL);
        assert!(TextureFormat::Depth32Float.info().has_depth());
        assert!(!TextureFormat::Rgba8Unorm.info().is_depth_stencil());
    }
}
