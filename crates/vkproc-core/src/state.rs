//! Render state and vertex formats carried by draw commands.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// How a draw blends into the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// Overwrite the destination.
    None,
    /// Standard alpha blending.
    #[default]
    Alpha,
    /// Additive blending.
    Additive,
}

impl BlendMode {
    /// All blend modes, in pipeline table order.
    pub const ALL: [Self; 3] = [Self::Alpha, Self::None, Self::Additive];

    /// Index of this mode in the pipeline table.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Alpha => 0,
            Self::None => 1,
            Self::Additive => 2,
        }
    }
}

/// Texture address mode requested by a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WrapMode {
    /// Repeat texture coordinates.
    #[default]
    Repeat,
    /// Clamp texture coordinates to the edge.
    Clamp,
}

impl WrapMode {
    /// Index of the matching sampler/descriptor slot on a texture.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Repeat => 0,
            Self::Clamp => 1,
        }
    }
}

/// Scissor rectangle in window coordinates with a bottom-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClipRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Primitive topology of a streamed draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimType {
    Lines,
    Triangles,
    /// Quads are drawn as two indexed triangles each.
    Quads,
}

impl PrimType {
    /// Vertices consumed per primitive.
    #[inline]
    pub const fn vertices_per_primitive(self) -> usize {
        match self {
            Self::Lines => 2,
            Self::Triangles => 3,
            Self::Quads => 4,
        }
    }
}

/// Per-draw state: blending, texturing, clipping and the screen mapping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderState {
    pub blend_mode: BlendMode,
    pub wrap_mode: WrapMode,
    /// Texture slot to sample from, `None` for untextured draws.
    pub texture: Option<usize>,
    /// Scissor rectangle, `None` when clipping is disabled.
    pub clip: Option<ClipRect>,
    /// Screen-space top-left corner mapped to clip-space (-1, -1).
    pub screen_tl: Vec2,
    /// Screen-space bottom-right corner mapped to clip-space (1, 1).
    pub screen_br: Vec2,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            blend_mode: BlendMode::Alpha,
            wrap_mode: WrapMode::Repeat,
            texture: None,
            clip: None,
            screen_tl: Vec2::ZERO,
            screen_br: Vec2::ONE,
        }
    }
}

impl RenderState {
    /// Create a state covering the given screen rectangle.
    pub fn new(screen_tl: Vec2, screen_br: Vec2) -> Self {
        Self {
            screen_tl,
            screen_br,
            ..Self::default()
        }
    }

    /// Set the blend mode.
    #[must_use]
    pub const fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    /// Set the wrap mode.
    #[must_use]
    pub const fn with_wrap_mode(mut self, wrap_mode: WrapMode) -> Self {
        self.wrap_mode = wrap_mode;
        self
    }

    /// Bind a texture slot.
    #[must_use]
    pub const fn with_texture(mut self, texture: usize) -> Self {
        self.texture = Some(texture);
        self
    }

    /// Enable scissor clipping.
    #[must_use]
    pub const fn with_clip(mut self, clip: ClipRect) -> Self {
        self.clip = Some(clip);
        self
    }

    /// Whether a texture is bound.
    #[inline]
    pub const fn is_textured(&self) -> bool {
        self.texture.is_some()
    }

    /// Column-major 4x2 orthographic matrix mapping the screen rectangle to clip space.
    ///
    /// Layout: `[sx, 0, 0, sy, 0, 0, tx, ty]`, consumed by the vertex shaders as
    /// `pos.x * m[0] + pos.y * m[2] + m[6]` and the matching y expression.
    pub fn screen_matrix(&self) -> [f32; 8] {
        let tl = self.screen_tl;
        let br = self.screen_br;
        let width = br.x - tl.x;
        let height = br.y - tl.y;
        [
            2.0 / width,
            0.0,
            0.0,
            2.0 / height,
            0.0,
            0.0,
            -(tl.x + br.x) / width,
            -(tl.y + br.y) / height,
        ]
    }
}

/// Standard 2D vertex.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec2,
    pub tex: Vec2,
    /// RGBA8 colour, normalised in the shader.
    pub color: [u8; 4],
}

impl Vertex {
    pub const fn new(pos: Vec2, tex: Vec2, color: [u8; 4]) -> Self {
        Self { pos, tex, color }
    }
}

/// Vertex sampling a 2D-array texture.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex3D {
    pub pos: Vec2,
    pub color: [u8; 4],
    /// `z` selects the array layer.
    pub tex: Vec3,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn screen_matrix_maps_corners_to_clip_space() {
        let state = RenderState::new(Vec2::new(0.0, 0.0), Vec2::new(100.0, 50.0));
        let m = state.screen_matrix();
        let map = |p: Vec2| Vec2::new(p.x * m[0] + p.y * m[2] + m[6], p.x * m[1] + p.y * m[3] + m[7]);

        let tl = map(Vec2::ZERO);
        let br = map(Vec2::new(100.0, 50.0));
        assert_relative_eq!(tl.x, -1.0);
        assert_relative_eq!(tl.y, -1.0);
        assert_relative_eq!(br.x, 1.0);
        assert_relative_eq!(br.y, 1.0);
    }

    #[test]
    fn vertex_layouts_are_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
        assert_eq!(std::mem::size_of::<Vertex3D>(), 24);
    }

    #[test]
    fn blend_indices_are_distinct() {
        let mut seen = [false; 3];
        for mode in BlendMode::ALL {
            assert!(!seen[mode.index()]);
            seen[mode.index()] = true;
        }
    }
}
