//! Backend-neutral handle and description types.
//!
//! Everything a backend creates is referred to by a small copyable key. The
//! keys come from `slotmap`, so a stale key never aliases a newer object.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

slotmap::new_key_type! {
    /// A buffer or texture owned by a device.
    pub struct ResourceId;
    /// A descriptor heap owned by a device.
    pub struct HeapId;
    /// A monotonic GPU timeline.
    pub struct FenceId;
    /// Backing memory for recorded commands.
    pub struct AllocatorId;
    /// Compiled pipeline state.
    pub struct PipelineId;
    /// Binding layout shared by pipelines.
    pub struct RootSignatureId;
}

/// Which backend a device runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    #[default]
    Vulkan,
    Soft,
}

/// Physical adapter category, in the order hardware is preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

/// Summary of the adapter a device was created on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub kind: AdapterKind,
    pub vendor_id: u32,
    pub device_id: u32,
    pub api_version: String,
}

impl AdapterInfo {
    /// True for CPU rasterizers.
    pub fn is_software(&self) -> bool {
        self.kind == AdapterKind::Cpu
    }
}

/// Memory placement of a committed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// CPU-writable, GPU-readable. Used for constants and staging.
    Upload,
    /// GPU-only.
    Default,
    /// GPU-writable, CPU-readable.
    Readback,
}

/// Texel and vertex attribute formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    R32Uint,
    Rg32Float,
    Rgb32Float,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    /// Size of one texel or attribute in bytes.
    pub fn bytes_per_element(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8Srgb | Self::Bgra8Unorm | Self::Bgra8Srgb => 4,
            Self::R32Float | Self::R32Uint | Self::D32Float | Self::D24UnormS8Uint => 4,
            Self::Rgba16Float | Self::Rg32Float => 8,
            Self::Rgb32Float => 12,
            Self::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8Uint)
    }
}

bitflags! {
    /// How a buffer will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

bitflags! {
    /// How a texture will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

/// Usage state of a resource, transitioned with explicit barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    DepthWrite,
    DepthRead,
    PixelShaderResource,
    NonPixelShaderResource,
    UnorderedAccess,
    CopyDest,
    CopySource,
    /// Permanent state of upload-heap resources.
    GenericRead,
}

/// Description of a committed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub heap: HeapKind,
    pub usage: BufferUsage,
}

impl BufferDesc {
    /// State a freshly created buffer starts in.
    pub fn initial_state(&self) -> ResourceState {
        match self.heap {
            HeapKind::Upload => ResourceState::GenericRead,
            HeapKind::Readback => ResourceState::CopyDest,
            HeapKind::Default => ResourceState::Common,
        }
    }
}

/// Shape of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D2,
    /// Six array layers viewed as a cube.
    Cube,
}

/// Description of a committed texture.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub dimension: TextureDimension,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
}

impl TextureDesc {
    /// A single-mip 2D texture in the `Common` state.
    pub fn new_2d(name: impl Into<String>, width: u32, height: u32, format: Format, usage: TextureUsage) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            dimension: TextureDimension::D2,
            usage,
            initial_state: ResourceState::Common,
        }
    }

    /// Number of mips in a full chain down to 1x1.
    pub fn full_mip_count(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }

    /// Width and height of a given mip level.
    pub fn mip_extent(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    /// Bytes of one tightly packed mip level of one layer.
    pub fn mip_size_bytes(&self, mip: u32) -> u64 {
        let (w, h) = self.mip_extent(mip);
        u64::from(w) * u64::from(h) * u64::from(self.format.bytes_per_element())
    }
}

/// Rasterizer viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Viewport covering a whole surface.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Scissor rectangle, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

/// Texture filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

/// Texture coordinate wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

/// Static sampler state written into the sampler heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub address_mode: AddressMode,
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_mode: AddressMode::Repeat,
            max_anisotropy: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mip_count() {
        assert_eq!(TextureDesc::full_mip_count(1, 1), 1);
        assert_eq!(TextureDesc::full_mip_count(256, 256), 9);
        assert_eq!(TextureDesc::full_mip_count(300, 20), 9);
    }

    #[test]
    fn test_mip_extent_clamps_to_one() {
        let desc = TextureDesc::new_2d("t", 64, 4, Format::Rgba8Unorm, TextureUsage::SAMPLED);
        assert_eq!(desc.mip_extent(0), (64, 4));
        assert_eq!(desc.mip_extent(3), (8, 1));
        assert_eq!(desc.mip_size_bytes(1), 32 * 2 * 4);
    }

    #[test]
    fn test_upload_buffers_start_generic_read() {
        let desc = BufferDesc {
            name: "cb".into(),
            size: 256,
            heap: HeapKind::Upload,
            usage: BufferUsage::CONSTANT,
        };
        assert_eq!(desc.initial_state(), ResourceState::GenericRead);
    }

    #[test]
    fn test_viewport_matches_scissor() {
        let vp = Viewport::from_size(640, 480);
        let sc = ScissorRect::from_size(640, 480);
        assert_eq!(vp.width as i32, sc.right);
        assert_eq!(vp.height as i32, sc.bottom);
    }
}
