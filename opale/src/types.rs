//! Shared vocabulary: queue identities, usage flags, geometry.

use bitflags::bitflags;

use crate::format::TextureFormat;

/// Identifies one of the device queues.
///
/// The graphics queue always exists; compute and transfer queues exist only
/// when the adapter exposes distinct families for them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(usize)]
pub enum QueueType {
    Graphics = 0,
    Compute = 1,
    Transfer = 2,
}

impl QueueType {
    pub(crate) const ALL: [QueueType; crate::MAX_QUEUES] =
        [QueueType::Graphics, QueueType::Compute, QueueType::Transfer];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// How a resource may move between queues.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShareMode {
    /// Owned by one queue family at a time; crossing queues emits a
    /// release/acquire barrier pair.
    Exclusive,
    /// Usable from every queue without ownership transfers.
    Concurrent,
}

bitflags! {
    /// Shader stages a resource binding is visible to.
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const TESSELLATION_CONTROL = 1 << 1;
        const TESSELLATION_EVALUATION = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
    }
}

bitflags! {
    /// Ways a buffer may be used. Each use at recording time names exactly the
    /// flags exercised by that use.
    pub struct BufferUsage: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const STORAGE = 1 << 7;
        const READ_ONLY_STORAGE = 1 << 8;
        const INDIRECT = 1 << 9;
        const QUERY_RESOLVE = 1 << 10;
    }
}

pub(crate) const SHADER_BUFFER_USAGES: BufferUsage = BufferUsage::from_bits_truncate(
    BufferUsage::UNIFORM.bits() | BufferUsage::STORAGE.bits() | BufferUsage::READ_ONLY_STORAGE.bits(),
);

pub(crate) const MAPPABLE_BUFFER_USAGES: BufferUsage =
    BufferUsage::from_bits_truncate(BufferUsage::MAP_READ.bits() | BufferUsage::MAP_WRITE.bits());

pub(crate) const READ_ONLY_BUFFER_USAGES: BufferUsage = BufferUsage::from_bits_truncate(
    BufferUsage::MAP_READ.bits()
        | BufferUsage::COPY_SRC.bits()
        | BufferUsage::INDEX.bits()
        | BufferUsage::VERTEX.bits()
        | BufferUsage::UNIFORM.bits()
        | BufferUsage::READ_ONLY_STORAGE.bits(),
);

bitflags! {
    /// Ways a texture may be used.
    ///
    /// The two `SWAPCHAIN_*` bits are internal pseudo-usages: freshly acquired
    /// swapchain images are seeded with `SWAPCHAIN_ACQUIRE` (layout UNDEFINED)
    /// and transitioned to `SWAPCHAIN_PRESENT` (PRESENT_SRC) before
    /// presentation. They never appear in combination with other bits.
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const SAMPLED_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
        const READ_ONLY_STORAGE = 1 << 29;
        const SWAPCHAIN_ACQUIRE = 1 << 30;
        const SWAPCHAIN_PRESENT = 1 << 31;
    }
}

pub(crate) const SHADER_TEXTURE_USAGES: TextureUsage = TextureUsage::from_bits_truncate(
    TextureUsage::SAMPLED_BINDING.bits()
        | TextureUsage::STORAGE_BINDING.bits()
        | TextureUsage::READ_ONLY_STORAGE.bits(),
);

pub(crate) const READ_ONLY_TEXTURE_USAGES: TextureUsage = TextureUsage::from_bits_truncate(
    TextureUsage::COPY_SRC.bits()
        | TextureUsage::SAMPLED_BINDING.bits()
        | TextureUsage::READ_ONLY_STORAGE.bits(),
);

/// Shape of a texture and its default view.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TextureDimension {
    D1,
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

/// Format of index buffer contents.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// Selects the aspects addressed by a texture copy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TextureAspect {
    All,
    DepthOnly,
    StencilOnly,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Origin3d {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
}

/// Layout of texel data in a buffer used as copy source or destination.
#[derive(Copy, Clone, Debug, Default)]
pub struct TextureDataLayout {
    pub offset: u64,
    /// Bytes between successive block rows; 0 means tightly packed.
    pub bytes_per_row: u32,
    /// Rows between successive depth slices; 0 means tightly packed.
    pub rows_per_image: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Descriptor for buffer creation.
#[derive(Clone, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub share_mode: ShareMode,
}

/// Descriptor for texture creation.
#[derive(Clone, Debug)]
pub struct TextureDesc<'a> {
    pub label: &'a str,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl<'a> Default for TextureDesc<'a> {
    fn default() -> Self {
        TextureDesc {
            label: "",
            dimension: TextureDimension::D2,
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
            mip_level_count: 1,
            sample_count: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::empty(),
        }
    }
}

/// Descriptor for texture view creation. `None` fields inherit from the
/// parent texture.
#[derive(Clone, Debug, Default)]
pub struct TextureViewDesc<'a> {
    pub label: &'a str,
    pub dimension: Option<TextureDimension>,
    pub format: Option<TextureFormat>,
    pub base_mip_level: u32,
    pub mip_level_count: Option<u32>,
    pub base_array_layer: u32,
    pub array_layer_count: Option<u32>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
    ClampToBorder,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BorderColor {
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

/// Descriptor for sampler creation.
#[derive(Clone, Debug)]
pub struct SamplerDesc<'a> {
    pub label: &'a str,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
    pub max_anisotropy: f32,
    pub compare: Option<CompareFunction>,
    pub border_color: BorderColor,
}

impl<'a> Default for SamplerDesc<'a> {
    fn default() -> Self {
        SamplerDesc {
            label: "",
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            lod_min_clamp: 0.0,
            lod_max_clamp: f32::MAX,
            max_anisotropy: 1.0,
            compare: None,
            border_color: BorderColor::OpaqueBlack,
        }
    }
}

/// Descriptor for shader module creation from SPIR-V words.
#[derive(Clone, Debug)]
pub struct ShaderModuleDesc<'a> {
    pub label: &'a str,
    pub spirv: &'a [u32],
    pub entry_point: &'a str,
}
