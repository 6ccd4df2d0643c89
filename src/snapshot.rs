// Render snapshot - per-frame input handed to the renderer
//
// The application/asset layer produces this; the renderer only consumes it.
// Static geometry and texture data arrive as raw byte views with declared
// layout, constants as fixed-size Pod structs matching the shader side.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Light count baked into the frame constant block, mirrored by the shaders.
pub const MAX_LIGHTS: usize = 4;

/// Borrowed byte range with a declared element stride.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    pub bytes: &'a [u8],
    pub stride: u32,
}

impl<'a> ByteView<'a> {
    pub fn from_slice<T: Pod>(data: &'a [T]) -> Self {
        Self {
            bytes: bytemuck::cast_slice(data),
            stride: std::mem::size_of::<T>() as u32,
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn element_count(&self) -> u32 {
        debug_assert!(self.stride > 0);
        (self.bytes.len() / self.stride as usize) as u32
    }
}

/// Pixel formats the renderer accepts for texture uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8Unorm,
    Rgba8Srgb,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8Unorm | PixelFormat::Rgba8Srgb => 4,
        }
    }
}

/// Borrowed image data: a tightly packed mip chain, largest mip first.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub bytes: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub format: PixelFormat,
}

/// Static geometry and textures, only present on "new level" frames.
///
/// Textures bind in slot order albedo, normal, roughness, ambient occlusion,
/// environment, environment irradiance; missing trailing slots fall back to
/// the first texture's bindless index.
#[derive(Debug, Clone)]
pub struct StaticScene<'a> {
    pub positions: ByteView<'a>,
    pub attributes: ByteView<'a>,
    /// u16 indices.
    pub indices: ByteView<'a>,
    pub textures: Vec<ImageView<'a>>,
}

/// Everything the renderer needs for one frame.
pub struct RenderSnapshot<'a> {
    /// Static data to upload before this frame renders. Uploading twice in a
    /// session replaces the previous set after a full flush.
    pub scene: Option<StaticScene<'a>>,
    pub frame: FrameConstants,
    pub draw: DrawConstants,
}

// ======================= shader-facing structs =======================
// Layouts are shared with the SPIR-V side; every field is 16-byte aligned
// so std140/std430 and Rust agree.

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    /// xyz position; w unused, present for 16-byte stride.
    pub position: Vec4,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Attributes {
    pub tangent: Vec4,
    pub normal: Vec4,
    /// xy texture coordinates; zw unused.
    pub uv: Vec4,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct Light {
    /// xyz position; w is the light type.
    pub pos: Vec4,
    /// rgb radiance; w is the power.
    pub radiance: Vec4,
}

/// Per-frame constant block (b-register 1 on the shader side).
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct FrameConstants {
    pub lights: [Light; MAX_LIGHTS],
    pub view_pos: Vec4,
}

/// Per-draw constant block.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DrawConstants {
    pub obj_to_world: Mat4,
    pub world_to_clip: Mat4,
    /// Only consumed by sky rendering.
    pub clip_to_world: Mat4,
}

impl Default for DrawConstants {
    fn default() -> Self {
        Self {
            obj_to_world: Mat4::IDENTITY,
            world_to_clip: Mat4::IDENTITY,
            clip_to_world: Mat4::IDENTITY,
        }
    }
}

/// Bindless indices pushed as inline constants for every draw.
#[derive(Debug, Clone, Copy, Pod, Zeroable, Default)]
#[repr(C)]
pub struct DrawIds {
    pub pos_id: u32,
    pub attr_id: u32,

    pub albedo_id: u32,
    pub normal_id: u32,
    pub rough_id: u32,
    pub ao_id: u32,

    pub env_id: u32,
    pub env_irr_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn constant_block_layouts_match_shader_side() {
        assert_eq!(size_of::<Light>(), 32);
        assert_eq!(size_of::<FrameConstants>(), MAX_LIGHTS * 32 + 16);
        assert_eq!(size_of::<DrawConstants>(), 3 * 64);
        assert_eq!(size_of::<DrawIds>(), 8 * 4);
        assert_eq!(size_of::<Vertex>(), 16);
        assert_eq!(size_of::<Attributes>(), 48);
    }

    #[test]
    fn accepted_formats_are_four_bytes_per_pixel() {
        assert_eq!(PixelFormat::Rgba8Unorm.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgba8Srgb.bytes_per_pixel(), 4);
    }

    #[test]
    fn byte_view_reports_declared_layout() {
        let verts = [
            Vertex { position: Vec4::ZERO },
            Vertex { position: Vec4::ONE },
        ];
        let view = ByteView::from_slice(&verts);
        assert_eq!(view.stride, 16);
        assert_eq!(view.len(), 32);
        assert_eq!(view.element_count(), 2);
    }
}
