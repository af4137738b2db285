//! Rendering layer
//!
//! The compositor speaks to the graphics backend through the [`Renderer`]
//! trait: textures are created per surface, refreshed from backing buffers,
//! and drawn into an output-sized frame with explicit opacity and blending.
//! The per-frame orchestration lives in [`painter`], the per-surface
//! resource lifecycle in [`resources`], and damage bookkeeping in
//! [`damage`].

pub mod damage;
pub mod painter;
pub mod resources;
pub mod software;

use anyhow::Result;

use crate::protocol::PixelImage;

pub use damage::{DamageOutcome, DamageTracker};
pub use software::{FrameSink, SoftwareRenderer};

/// Renderer-side handle to a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// How a texture's alpha channel is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// Alpha is ignored and treated as fully opaque
    Opaque,
    /// Premultiplied alpha is honoured
    Alpha,
}

/// Axis-aligned rectangle in output pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RectF {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RectF {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Per-draw blending parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawParams {
    /// Global opacity multiplier in [0, 1]
    pub opacity: f32,
    /// Blend over the frame; when false the texture replaces what is there
    pub blend: bool,
}

impl DrawParams {
    pub fn replace() -> Self {
        Self {
            opacity: 1.0,
            blend: false,
        }
    }

    pub fn blended(opacity: f32) -> Self {
        Self {
            opacity: opacity.clamp(0.0, 1.0),
            blend: true,
        }
    }
}

/// One line of the debug overlay
#[derive(Debug, Clone, PartialEq)]
pub struct DebugLine {
    pub text: String,
    pub color: [f32; 3],
}

impl DebugLine {
    pub fn new(text: impl Into<String>, color: [f32; 3]) -> Self {
        Self {
            text: text.into(),
            color,
        }
    }
}

/// Paint commands issued by the compositor
pub trait Renderer {
    /// Allocate a texture for a surface of the given size
    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat)
        -> Result<TextureId>;

    /// Replace a texture's contents
    fn upload_texture(&mut self, texture: TextureId, image: &PixelImage) -> Result<()>;

    fn destroy_texture(&mut self, texture: TextureId);

    /// Start a frame: set the viewport to the output and clear to black
    fn begin_frame(&mut self, width: u32, height: u32) -> Result<()>;

    /// Fill rectangles with a solid non-premultiplied RGBA colour, blended
    fn fill_rects(&mut self, rects: &[RectF], rgba: [f32; 4]);

    /// Draw a texture stretched over `dest`, edge-clamped with linear filtering
    fn draw_texture(&mut self, texture: TextureId, dest: RectF, params: DrawParams);

    fn draw_debug_text(&mut self, _lines: &[DebugLine]) {}

    fn present(&mut self) -> Result<()>;

    /// Error raised by the renderer since the last call, if any
    fn take_error(&mut self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blended_params_clamp_opacity() {
        assert_eq!(DrawParams::blended(1.5).opacity, 1.0);
        assert_eq!(DrawParams::blended(-0.5).opacity, 0.0);
        assert!(!DrawParams::replace().blend);
    }

    #[test]
    fn test_empty_rects() {
        assert!(RectF::new(0.0, 0.0, 0.0, 10.0).is_empty());
        assert!(!RectF::new(5.0, 5.0, 1.0, 1.0).is_empty());
    }
}
