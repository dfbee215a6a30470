//! The closed command model submitted by the front end.
//!
//! Every command is one variant of [`Command`]. The backend classifies
//! commands by their [`CommandKind`] and never looks inside a payload it
//! does not handle.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use crossbeam::channel::Sender;
use glam::{IVec2, Vec2, Vec4};

use crate::error::{Error, Result};
use crate::state::{PrimType, RenderState, Vertex, Vertex3D};

bitflags! {
    /// Texture creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        /// Skip the regular 2D image.
        const NO_2D_TEXTURE = 0b0001;
        /// Also build a 2D-array image from a 16x16 tile grid.
        const TO_2D_ARRAY_TEXTURE = 0b0010;
        /// Upload only the base level.
        const NO_MIPMAPS = 0b0100;
    }
}

bitflags! {
    /// Buffer object creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// The data lives for one frame and is streamed instead of cached.
        const ONE_TIME_USE = 0b0001;
    }
}

/// Pixel layout of texture uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8,
    Rgb,
    Rgba,
}

impl TextureFormat {
    /// Bytes per pixel.
    #[inline]
    pub const fn pixel_size(self) -> usize {
        match self {
            Self::R8 => 1,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

/// Owned pixel data with validated dimensions.
///
/// Only [`Pixels::new`] builds one, so `data` always holds exactly
/// `width * height` pixels.
#[derive(Clone, PartialEq, Eq)]
pub struct Pixels {
    width: u32,
    height: u32,
    format: TextureFormat,
    data: Vec<u8>,
}

impl Pixels {
    /// Wrap pixel data, checking that its length matches the dimensions.
    pub fn new(width: u32, height: u32, format: TextureFormat, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * format.pixel_size();
        if data.len() != expected {
            return Err(Error::PixelDataSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub const fn format(&self) -> TextureFormat {
        self.format
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Pixels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pixels")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// An RGBA8 image read back from the presented swapchain image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Per-quad data of a quad layer, laid out for a uniform buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct QuadRenderInfo {
    pub color: Vec4,
    pub offset: Vec2,
    pub rotation: f32,
    pub padding: f32,
}

/// Position, scale and rotation of one sprite instance.
///
/// `x`/`y` hold the position, `z` the scale and `w` the rotation.
pub type SpriteRenderInfo = Vec4;

#[derive(Debug)]
pub struct TextureCreate {
    pub slot: usize,
    pub pixels: Pixels,
    pub flags: TextureFlags,
}

#[derive(Debug)]
pub struct TextTexturesCreate {
    pub slot: usize,
    pub slot_outline: usize,
    pub text: Pixels,
    pub outline: Pixels,
}

#[derive(Debug)]
pub struct TextTextureUpdate {
    pub slot: usize,
    pub x: u32,
    pub y: u32,
    pub pixels: Pixels,
}

#[derive(Debug, Clone, Copy)]
pub struct Clear {
    pub color: Vec4,
    /// Record a clear even if the colour did not change.
    pub force_clear: bool,
}

#[derive(Debug)]
pub struct Render {
    pub state: RenderState,
    pub prim_type: PrimType,
    pub prim_count: usize,
    pub vertices: Vec<Vertex>,
}

#[derive(Debug)]
pub struct RenderTex3D {
    pub state: RenderState,
    pub prim_type: PrimType,
    pub prim_count: usize,
    pub vertices: Vec<Vertex3D>,
}

#[derive(Debug)]
pub struct CreateBufferObject {
    pub index: usize,
    pub data: Vec<u8>,
    pub flags: BufferFlags,
}

#[derive(Debug)]
pub struct UpdateBufferObject {
    pub index: usize,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyBufferObject {
    pub src: usize,
    pub dst: usize,
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferContainerBinding {
    pub container: usize,
    pub buffer_object: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteBufferContainer {
    pub container: usize,
    /// Also delete the buffer object the container points at.
    pub destroy_buffer_objects: bool,
}

#[derive(Debug)]
pub struct RenderTileLayer {
    pub state: RenderState,
    pub color: Vec4,
    pub buffer_container: usize,
    /// Byte offsets into the index buffer, one per draw.
    pub indices_offsets: Vec<u64>,
    /// Index counts, parallel to `indices_offsets`.
    pub draw_counts: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderBorderTile {
    pub state: RenderState,
    pub color: Vec4,
    pub buffer_container: usize,
    pub indices_offset: u64,
    /// Number of tiles; each contributes six indices.
    pub draw_count: u32,
    pub offset: Vec2,
    pub scale: Vec2,
}

#[derive(Debug)]
pub struct RenderQuadLayer {
    pub state: RenderState,
    pub buffer_container: usize,
    pub quad_infos: Vec<QuadRenderInfo>,
    /// First quad of the layer inside the container.
    pub quad_offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderText {
    pub state: RenderState,
    pub buffer_container: usize,
    pub text_texture: usize,
    pub text_outline_texture: usize,
    pub texture_size: f32,
    pub draw_count: u32,
    pub text_color: Vec4,
    pub outline_color: Vec4,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderQuadContainer {
    pub state: RenderState,
    pub buffer_container: usize,
    /// Byte offset into the index buffer.
    pub offset: u64,
    pub draw_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderQuadContainerEx {
    pub state: RenderState,
    pub buffer_container: usize,
    pub offset: u64,
    pub draw_count: u32,
    pub rotation: f32,
    pub center: Vec2,
    pub vertex_color: Vec4,
}

#[derive(Debug)]
pub struct RenderQuadContainerAsSpriteMultiple {
    pub state: RenderState,
    pub buffer_container: usize,
    pub offset: u64,
    /// Indices drawn per sprite instance.
    pub draw_count: u32,
    pub center: Vec2,
    pub vertex_color: Vec4,
    /// One entry per instance.
    pub render_infos: Vec<SpriteRenderInfo>,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateViewport {
    /// Bottom-left origin.
    pub position: IVec2,
    pub width: u32,
    pub height: u32,
    /// The window was resized; the swapchain must follow.
    pub by_resize: bool,
}

/// A command submitted by the front end.
#[derive(Debug)]
pub enum Command {
    TextureCreate(TextureCreate),
    TextureDestroy { slot: usize },
    TextTexturesCreate(TextTexturesCreate),
    TextTexturesDestroy { slot: usize, slot_outline: usize },
    TextTextureUpdate(TextTextureUpdate),
    Clear(Clear),
    Render(Render),
    RenderTex3D(RenderTex3D),
    CreateBufferObject(CreateBufferObject),
    RecreateBufferObject(CreateBufferObject),
    UpdateBufferObject(UpdateBufferObject),
    CopyBufferObject(CopyBufferObject),
    DeleteBufferObject { index: usize },
    CreateBufferContainer(BufferContainerBinding),
    UpdateBufferContainer(BufferContainerBinding),
    DeleteBufferContainer(DeleteBufferContainer),
    IndicesRequiredNumNotify { required_indices: usize },
    RenderTileLayer(RenderTileLayer),
    RenderBorderTile(RenderBorderTile),
    RenderQuadLayer(RenderQuadLayer),
    RenderText(RenderText),
    RenderQuadContainer(RenderQuadContainer),
    RenderQuadContainerEx(RenderQuadContainerEx),
    RenderQuadContainerAsSpriteMultiple(RenderQuadContainerAsSpriteMultiple),
    Swap,
    VSync {
        vsync: bool,
        reply: Option<Sender<bool>>,
    },
    MultiSampling {
        requested: u32,
        reply: Option<Sender<u32>>,
    },
    /// Swap if needed, then read one pixel of the presented image.
    TrySwapAndReadPixel {
        position: IVec2,
        reply: Sender<[u8; 4]>,
    },
    /// Swap if needed, then read back the whole presented image.
    TrySwapAndScreenshot {
        reply: Sender<PresentedImage>,
    },
    UpdateViewport(UpdateViewport),
    WindowCreateNtf,
    WindowDestroyNtf,
}

/// Tag of a [`Command`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum CommandKind {
    TextureCreate,
    TextureDestroy,
    TextTexturesCreate,
    TextTexturesDestroy,
    TextTextureUpdate,
    Clear,
    Render,
    RenderTex3D,
    CreateBufferObject,
    RecreateBufferObject,
    UpdateBufferObject,
    CopyBufferObject,
    DeleteBufferObject,
    CreateBufferContainer,
    UpdateBufferContainer,
    DeleteBufferContainer,
    IndicesRequiredNumNotify,
    RenderTileLayer,
    RenderBorderTile,
    RenderQuadLayer,
    RenderText,
    RenderQuadContainer,
    RenderQuadContainerEx,
    RenderQuadContainerAsSpriteMultiple,
    Swap,
    VSync,
    MultiSampling,
    TrySwapAndReadPixel,
    TrySwapAndScreenshot,
    UpdateViewport,
    WindowCreateNtf,
    WindowDestroyNtf,
}

impl CommandKind {
    /// Number of command kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// Every kind, in tag order.
    pub const ALL: [Self; 32] = [
        Self::TextureCreate,
        Self::TextureDestroy,
        Self::TextTexturesCreate,
        Self::TextTexturesDestroy,
        Self::TextTextureUpdate,
        Self::Clear,
        Self::Render,
        Self::RenderTex3D,
        Self::CreateBufferObject,
        Self::RecreateBufferObject,
        Self::UpdateBufferObject,
        Self::CopyBufferObject,
        Self::DeleteBufferObject,
        Self::CreateBufferContainer,
        Self::UpdateBufferContainer,
        Self::DeleteBufferContainer,
        Self::IndicesRequiredNumNotify,
        Self::RenderTileLayer,
        Self::RenderBorderTile,
        Self::RenderQuadLayer,
        Self::RenderText,
        Self::RenderQuadContainer,
        Self::RenderQuadContainerEx,
        Self::RenderQuadContainerAsSpriteMultiple,
        Self::Swap,
        Self::VSync,
        Self::MultiSampling,
        Self::TrySwapAndReadPixel,
        Self::TrySwapAndScreenshot,
        Self::UpdateViewport,
        Self::WindowCreateNtf,
        Self::WindowDestroyNtf,
    ];

    /// Position of this kind in [`Self::ALL`].
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl Command {
    /// The kind tag of this command.
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::TextureCreate(_) => CommandKind::TextureCreate,
            Self::TextureDestroy { .. } => CommandKind::TextureDestroy,
            Self::TextTexturesCreate(_) => CommandKind::TextTexturesCreate,
            Self::TextTexturesDestroy { .. } => CommandKind::TextTexturesDestroy,
            Self::TextTextureUpdate(_) => CommandKind::TextTextureUpdate,
            Self::Clear(_) => CommandKind::Clear,
            Self::Render(_) => CommandKind::Render,
            Self::RenderTex3D(_) => CommandKind::RenderTex3D,
            Self::CreateBufferObject(_) => CommandKind::CreateBufferObject,
            Self::RecreateBufferObject(_) => CommandKind::RecreateBufferObject,
            Self::UpdateBufferObject(_) => CommandKind::UpdateBufferObject,
            Self::CopyBufferObject(_) => CommandKind::CopyBufferObject,
            Self::DeleteBufferObject { .. } => CommandKind::DeleteBufferObject,
            Self::CreateBufferContainer(_) => CommandKind::CreateBufferContainer,
            Self::UpdateBufferContainer(_) => CommandKind::UpdateBufferContainer,
            Self::DeleteBufferContainer(_) => CommandKind::DeleteBufferContainer,
            Self::IndicesRequiredNumNotify { .. } => CommandKind::IndicesRequiredNumNotify,
            Self::RenderTileLayer(_) => CommandKind::RenderTileLayer,
            Self::RenderBorderTile(_) => CommandKind::RenderBorderTile,
            Self::RenderQuadLayer(_) => CommandKind::RenderQuadLayer,
            Self::RenderText(_) => CommandKind::RenderText,
            Self::RenderQuadContainer(_) => CommandKind::RenderQuadContainer,
            Self::RenderQuadContainerEx(_) => CommandKind::RenderQuadContainerEx,
            Self::RenderQuadContainerAsSpriteMultiple(_) => {
                CommandKind::RenderQuadContainerAsSpriteMultiple
            }
            Self::Swap => CommandKind::Swap,
            Self::VSync { .. } => CommandKind::VSync,
            Self::MultiSampling { .. } => CommandKind::MultiSampling,
            Self::TrySwapAndReadPixel { .. } => CommandKind::TrySwapAndReadPixel,
            Self::TrySwapAndScreenshot { .. } => CommandKind::TrySwapAndScreenshot,
            Self::UpdateViewport(_) => CommandKind::UpdateViewport,
            Self::WindowCreateNtf => CommandKind::WindowCreateNtf,
            Self::WindowDestroyNtf => CommandKind::WindowDestroyNtf,
        }
    }

    /// Build a streamed 2D draw, checking that the vertices cover every primitive.
    pub fn render(
        state: RenderState,
        prim_type: PrimType,
        prim_count: usize,
        vertices: Vec<Vertex>,
    ) -> Result<Self> {
        let required = prim_count * prim_type.vertices_per_primitive();
        if vertices.len() < required {
            return Err(Error::VertexData(format!(
                "{prim_count} {prim_type:?} need {required} vertices, got {}",
                vertices.len()
            )));
        }
        Ok(Self::Render(Render {
            state,
            prim_type,
            prim_count,
            vertices,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_indices_follow_tag_order() {
        for (i, kind) in CommandKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(CommandKind::COUNT, 32);
    }

    #[test]
    fn pixels_reject_mismatched_length() {
        assert!(Pixels::new(2, 2, TextureFormat::Rgba, vec![0; 16]).is_ok());
        let err = Pixels::new(2, 2, TextureFormat::Rgb, vec![0; 16]).unwrap_err();
        assert!(matches!(
            err,
            Error::PixelDataSize {
                expected: 12,
                actual: 16
            }
        ));
    }

    #[test]
    fn pixel_accessors_match_the_validated_length() {
        let pixels = Pixels::new(3, 2, TextureFormat::R8, vec![7; 6]).unwrap();
        assert_eq!((pixels.width(), pixels.height()), (3, 2));
        assert_eq!(pixels.format(), TextureFormat::R8);
        assert_eq!(
            pixels.data().len(),
            pixels.width() as usize * pixels.height() as usize * pixels.format().pixel_size()
        );
    }

    #[test]
    fn render_requires_enough_vertices() {
        let state = RenderState::default();
        assert!(Command::render(state, PrimType::Quads, 2, vec![Vertex::default(); 8]).is_ok());
        assert!(Command::render(state, PrimType::Quads, 2, vec![Vertex::default(); 7]).is_err());
    }

    #[test]
    fn quad_info_matches_uniform_layout() {
        assert_eq!(std::mem::size_of::<QuadRenderInfo>(), 32);
    }
}
