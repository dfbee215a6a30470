//! Core types shared by the vkproc command processor.
//!
//! This crate provides the pieces every other crate agrees on:
//! - The closed command model the front end submits
//! - Render state and the vertex formats carried by draw commands
//! - Backend configuration
//! - Shared memory usage counters

pub mod command;
pub mod config;
pub mod error;
pub mod state;
pub mod usage;

pub use command::{Command, CommandKind, PresentedImage};
pub use config::{BackendConfig, DebugLevel};
pub use error::{Error, Result};
pub use state::{BlendMode, ClipRect, PrimType, RenderState, WrapMode};
pub use usage::{MemoryUsage, MemoryUsageKind};

/// Backend-wide constants.
pub mod constants {
    /// Maximum number of vertices a single streamed draw may carry.
    pub const MAX_VERTICES: usize = 32 * 1024;
    /// Quads drawn per uniform chunk by the quad layer family.
    pub const MAX_QUADS_PER_CHUNK: usize = 256;
    /// Sprites drawn per uniform chunk by the sprite-multi family.
    pub const MAX_SPRITES_PER_CHUNK: usize = 512;
    /// Edge length of one layer tile when a texture is repacked into a 2D array.
    pub const ARRAY_TILE_GRID: u32 = 16;
    /// Initial size of the texture table.
    pub const MAX_TEXTURES: usize = 1024 * 8;
}
