//! CPU renderer built on tiny-skia
//!
//! Textures are premultiplied RGBA pixmaps, frames are composited into an
//! output-sized pixmap and handed to an optional [`FrameSink`] on present.
//! Sampling is bilinear and pattern edges are padded, which gives the same
//! edge-clamped linear look as the GPU path.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use bytemuck::{Pod, Zeroable};
use log::{debug, trace};
use tiny_skia::{
    BlendMode, Color, FilterQuality, Paint, Pixmap, PixmapPaint, Rect, Transform,
};

use super::{DebugLine, DrawParams, RectF, Renderer, TextureFormat, TextureId};
use crate::protocol::PixelImage;

/// Receives every presented frame
pub trait FrameSink {
    fn submit(&mut self, frame: &Pixmap) -> Result<()>;
}

/// One premultiplied RGBA pixel as laid out in a pixmap
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct Rgba8 {
    r: u8,
    g: u8,
    b: u8,
    a: u8,
}

impl Rgba8 {
    /// Convert an ARGB32 pixel. Opaque formats force alpha to 255; alpha
    /// formats are already premultiplied, colour channels are clamped to
    /// alpha so the result stays a valid premultiplied value.
    fn from_argb(argb: u32, format: TextureFormat) -> Self {
        let r = (argb >> 16) as u8;
        let g = (argb >> 8) as u8;
        let b = argb as u8;
        match format {
            TextureFormat::Opaque => Self { r, g, b, a: 255 },
            TextureFormat::Alpha => {
                let a = (argb >> 24) as u8;
                Self {
                    r: r.min(a),
                    g: g.min(a),
                    b: b.min(a),
                    a,
                }
            }
        }
    }
}

struct Texture {
    pixmap: Pixmap,
    format: TextureFormat,
}

pub struct SoftwareRenderer {
    textures: HashMap<TextureId, Texture>,
    next_texture: u32,
    frame: Option<Pixmap>,
    sink: Option<Box<dyn FrameSink>>,
    error: Option<String>,
    frames_presented: u64,
    draws_this_frame: usize,
    debug_lines: Vec<DebugLine>,
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self {
            textures: HashMap::new(),
            next_texture: 1,
            frame: None,
            sink: None,
            error: None,
            frames_presented: 0,
            draws_this_frame: 0,
            debug_lines: Vec::new(),
        }
    }

    /// Renderer that forwards each presented frame to `sink`
    pub fn with_sink(sink: Box<dyn FrameSink>) -> Self {
        let mut renderer = Self::new();
        renderer.sink = Some(sink);
        renderer
    }

    /// The frame being composited, or the last presented one
    pub fn frame(&self) -> Option<&Pixmap> {
        self.frame.as_ref()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Texture and fill draws issued since the last `begin_frame`
    pub fn draws_this_frame(&self) -> usize {
        self.draws_this_frame
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn has_texture(&self, texture: TextureId) -> bool {
        self.textures.contains_key(&texture)
    }

    /// Debug lines submitted for the current frame
    pub fn debug_lines(&self) -> &[DebugLine] {
        &self.debug_lines
    }

    fn allocate(width: u32, height: u32) -> Result<Pixmap> {
        Pixmap::new(width.max(1), height.max(1))
            .ok_or_else(|| anyhow!("cannot allocate {}x{} pixmap", width, height))
    }
}

impl Default for SoftwareRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for SoftwareRenderer {
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<TextureId> {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;

        let pixmap = Self::allocate(width, height)?;
        self.textures.insert(id, Texture { pixmap, format });
        trace!("Created {:?} texture {:?} ({}x{})", format, id, width, height);
        Ok(id)
    }

    fn upload_texture(&mut self, texture: TextureId, image: &PixelImage) -> Result<()> {
        let Some(entry) = self.textures.get_mut(&texture) else {
            return Err(anyhow!("upload to unknown texture {:?}", texture));
        };

        if entry.pixmap.width() != image.width.max(1) || entry.pixmap.height() != image.height.max(1)
        {
            entry.pixmap = Self::allocate(image.width, image.height)?;
        }

        let format = entry.format;
        let dest: &mut [Rgba8] = bytemuck::cast_slice_mut(entry.pixmap.data_mut());
        for (out, &argb) in dest.iter_mut().zip(image.pixels.iter()) {
            *out = Rgba8::from_argb(argb, format);
        }
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_some() {
            trace!("Destroyed texture {:?}", texture);
        }
    }

    fn begin_frame(&mut self, width: u32, height: u32) -> Result<()> {
        let reuse = matches!(&self.frame, Some(f) if f.width() == width.max(1) && f.height() == height.max(1));
        if !reuse {
            self.frame = Some(Self::allocate(width, height)?);
        }
        if let Some(frame) = self.frame.as_mut() {
            frame.fill(Color::BLACK);
        }
        self.draws_this_frame = 0;
        self.debug_lines.clear();
        Ok(())
    }

    fn fill_rects(&mut self, rects: &[RectF], rgba: [f32; 4]) {
        let Some(frame) = self.frame.as_mut() else {
            return;
        };

        let mut paint = Paint::default();
        paint.set_color(
            Color::from_rgba(
                rgba[0].clamp(0.0, 1.0),
                rgba[1].clamp(0.0, 1.0),
                rgba[2].clamp(0.0, 1.0),
                rgba[3].clamp(0.0, 1.0),
            )
            .unwrap_or(Color::BLACK),
        );
        paint.anti_alias = false;

        for rect in rects.iter().filter(|r| !r.is_empty()) {
            if let Some(r) = Rect::from_xywh(rect.x, rect.y, rect.width, rect.height) {
                frame.fill_rect(r, &paint, Transform::identity(), None);
                self.draws_this_frame += 1;
            }
        }
    }

    fn draw_texture(&mut self, texture: TextureId, dest: RectF, params: DrawParams) {
        let Some(frame) = self.frame.as_mut() else {
            return;
        };
        let Some(entry) = self.textures.get(&texture) else {
            trace!("Skipping draw of unknown texture {:?}", texture);
            return;
        };
        if dest.is_empty() {
            return;
        }

        let sx = dest.width / entry.pixmap.width() as f32;
        let sy = dest.height / entry.pixmap.height() as f32;
        let paint = PixmapPaint {
            opacity: params.opacity.clamp(0.0, 1.0),
            blend_mode: if params.blend {
                BlendMode::SourceOver
            } else {
                BlendMode::Source
            },
            quality: FilterQuality::Bilinear,
        };

        frame.draw_pixmap(
            0,
            0,
            entry.pixmap.as_ref(),
            &paint,
            Transform::from_row(sx, 0.0, 0.0, sy, dest.x, dest.y),
            None,
        );
        self.draws_this_frame += 1;
    }

    fn draw_debug_text(&mut self, lines: &[DebugLine]) {
        for line in lines {
            debug!("[overlay] {}", line.text);
        }
        self.debug_lines = lines.to_vec();
    }

    fn present(&mut self) -> Result<()> {
        let Some(frame) = self.frame.as_ref() else {
            return Ok(());
        };

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.submit(frame) {
                self.error = Some(format!("frame sink failed: {e:#}"));
            }
        }
        self.frames_presented += 1;
        Ok(())
    }

    fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }
}
