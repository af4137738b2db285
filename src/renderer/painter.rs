//! Surface placement and per-layer drawing
//!
//! Content that does not match the output is scaled uniformly to fit and
//! centred; the uncovered margins are the letterbox. A non-unity global
//! scale shrinks the content further (overscan compensation) and a zoom
//! pans the content so the pointer stays under the magnified area.

use std::time::{Duration, Instant};

use log::trace;

use super::{DebugLine, DrawParams, RectF, Renderer};
use crate::surface::Surface;

/// Scale factors shared by every layer of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleContext {
    pub output: (u32, u32),
    /// Overscan compensation (screen scale)
    pub global_ratio: f32,
    /// Magnification (screen zoom)
    pub zoom_ratio: f32,
    /// Pointer position in root coordinates
    pub cursor: (i32, i32),
}

impl ScaleContext {
    pub fn unscaled(output: (u32, u32)) -> Self {
        Self {
            output,
            global_ratio: 1.0,
            zoom_ratio: 1.0,
            cursor: (0, 0),
        }
    }
}

/// Where and how large a surface is drawn
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    /// Effective scale, including the global ratio
    pub ratio: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    pub scaling: bool,
}

impl Placement {
    pub fn identity() -> Self {
        Self {
            ratio: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            scaling: false,
        }
    }
}

/// Whether content of `size` has to be scaled to be presented
pub fn needs_scale(output: (u32, u32), size: (u32, u32), global_ratio: f32) -> bool {
    size != output || global_ratio != 1.0
}

/// Aspect-preserving fit ratio of `size` into `output`
pub fn fit_ratio(output: (u32, u32), size: (u32, u32)) -> f32 {
    let x = output.0 as f32 / size.0.max(1) as f32;
    let y = output.1 as f32 / size.1.max(1) as f32;
    x.min(y)
}

/// Centering offset of `size` scaled by `fit_ratio * global_ratio`
///
/// ```
/// use gamecomp::renderer::painter::letterbox_offset;
///
/// let (x, y) = letterbox_offset((1920, 1080), (1280, 720), 2.0 / 3.0);
/// assert_eq!((x.round(), y.round()), (320.0, 180.0));
/// ```
pub fn letterbox_offset(output: (u32, u32), size: (u32, u32), global_ratio: f32) -> (f32, f32) {
    let ratio = fit_ratio(output, size) * global_ratio;
    (
        (output.0 as f32 - size.0 as f32 * ratio) / 2.0,
        (output.1 as f32 - size.1 as f32 * ratio) / 2.0,
    )
}

/// Placement of content of `source` size in the frame
pub fn compute_placement(ctx: &ScaleContext, source: (u32, u32)) -> Placement {
    if !needs_scale(ctx.output, source, ctx.global_ratio) {
        return Placement::identity();
    }

    let ratio = fit_ratio(ctx.output, source) * ctx.global_ratio;
    let (mut offset_x, mut offset_y) = letterbox_offset(ctx.output, source, ctx.global_ratio);

    if ctx.zoom_ratio != 1.0 {
        offset_x += ((source.0 / 2) as f32 - ctx.cursor.0 as f32) * ratio;
        offset_y += ((source.1 / 2) as f32 - ctx.cursor.1 as f32) * ratio;
    }

    Placement {
        ratio,
        offset_x,
        offset_y,
        scaling: true,
    }
}

/// Bars covering the area outside centred content. Top and bottom span
/// the full width; the sides fill the remaining height only, so nothing
/// is drawn twice.
pub fn letterbox_bars(output: (u32, u32), offset_x: f32, offset_y: f32) -> Vec<RectF> {
    let (width, height) = (output.0 as f32, output.1 as f32);
    let mut bars = Vec::with_capacity(4);

    if offset_y > 0.0 {
        bars.push(RectF::new(0.0, 0.0, width, offset_y));
        bars.push(RectF::new(0.0, height - offset_y, width, offset_y));
    }
    if offset_x > 0.0 {
        let middle = (height - 2.0 * offset_y).max(0.0);
        bars.push(RectF::new(0.0, offset_y.max(0.0), offset_x, middle));
        bars.push(RectF::new(width - offset_x, offset_y.max(0.0), offset_x, middle));
    }
    bars
}

/// Destination of a notification: scaled like the overlay, anchored to
/// the bottom-right corner inside the global-scale inset
pub fn notification_rect(ctx: &ScaleContext, overlay: (u32, u32), notification: (u32, u32)) -> RectF {
    let ratio = compute_placement(ctx, overlay).ratio;
    let width = notification.0 as f32 * ratio;
    let height = notification.1 as f32 * ratio;

    let (mut inset_x, mut inset_y) = (0.0, 0.0);
    if ctx.global_ratio != 1.0 {
        inset_x = (ctx.output.0 as f32 - ctx.output.0 as f32 * ctx.global_ratio) / 2.0;
        inset_y = (ctx.output.1 as f32 - ctx.output.1 as f32 * ctx.global_ratio) / 2.0;
    }

    RectF::new(
        ctx.output.0 as f32 - inset_x - width,
        ctx.output.1 as f32 - inset_y - height,
        width,
        height,
    )
}

/// How one layer is drawn
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerMode {
    Normal,
    /// Anchored bottom-right, sized by the overlay of the given size
    Notification { overlay: (u32, u32) },
}

/// Draw one surface layer.
///
/// Returns `false` when nothing was drawn: the surface has no texture yet,
/// or it is an overlay whose contents were never valid.
pub fn paint_surface<R: Renderer + ?Sized>(
    renderer: &mut R,
    surface: &Surface,
    ctx: &ScaleContext,
    params: DrawParams,
    mode: LayerMode,
) -> bool {
    if surface.is_overlay && !surface.valid_contents {
        return false;
    }
    let Some(texture) = surface.texture else {
        trace!("{} has no texture, skipping", surface.id);
        return false;
    };
    if surface.upload_pending {
        return false;
    }

    let size = (surface.geometry.width, surface.geometry.height);
    let dest = match mode {
        LayerMode::Notification { overlay } => notification_rect(ctx, overlay, size),
        LayerMode::Normal => {
            let placement = compute_placement(ctx, size);

            if placement.scaling && params.blend {
                let bars = letterbox_bars(ctx.output, placement.offset_x, placement.offset_y);
                if !bars.is_empty() {
                    renderer.fill_rects(&bars, [0.0, 0.0, 0.0, params.opacity]);
                }
            }

            RectF::new(
                placement.offset_x,
                placement.offset_y,
                size.0 as f32 * placement.ratio,
                size.1 as f32 * placement.ratio,
            )
        }
    };

    renderer.draw_texture(texture, dest, params);
    true
}

/// Frame-rate measurement sampled every N presented frames
#[derive(Debug, Clone)]
pub struct FrameRateSampler {
    sample_frames: u32,
    frames: u32,
    last_sample: Instant,
    rate: f32,
}

impl FrameRateSampler {
    pub fn new(sample_frames: u32, now: Instant) -> Self {
        Self {
            sample_frames: sample_frames.max(1),
            frames: 0,
            last_sample: now,
            rate: 0.0,
        }
    }

    /// Count a frame; returns the new rate when a sample was taken
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        if self.frames < self.sample_frames {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed > Duration::ZERO {
            self.rate = self.sample_frames as f32 / elapsed.as_secs_f32();
        }
        self.last_sample = now;
        self.frames = 0;
        Some(self.rate)
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }
}

/// Inputs for the debug overlay text
#[derive(Debug, Clone, Default)]
pub struct DebugState {
    pub frame_rate: f32,
    /// Focused surface, and whether it is a game
    pub focus: Option<(String, bool)>,
    pub overlay_opacity: Option<f32>,
    pub notification_opacity: Option<f32>,
    pub scaling: bool,
    pub protocol_error: bool,
}

pub fn debug_lines(state: &DebugState) -> Vec<DebugLine> {
    let mut lines = vec![DebugLine::new(
        format!("Compositing at {:.1} FPS", state.frame_rate),
        [1.0, 1.0, 1.0],
    )];

    match &state.focus {
        Some((id, true)) => lines.push(DebugLine::new(
            format!("Presenting game window {}", id),
            [0.0, 1.0, 0.0],
        )),
        Some((_, false)) => lines.push(DebugLine::new("Presenting shell", [1.0, 1.0, 0.0])),
        None => {}
    }

    if let Some(opacity) = state.overlay_opacity {
        lines.push(DebugLine::new(
            format!("Compositing overlay at opacity {:.6}", opacity),
            [1.0, 0.0, 1.0],
        ));
    }
    if let Some(opacity) = state.notification_opacity {
        lines.push(DebugLine::new(
            format!("Compositing notification at opacity {:.6}", opacity),
            [1.0, 0.0, 1.0],
        ));
    }
    if state.scaling {
        lines.push(DebugLine::new("Scaling current window", [0.0, 0.0, 1.0]));
    }
    if state.protocol_error {
        lines.push(DebugLine::new("Encountered protocol error", [1.0, 0.0, 0.0]));
    }
    lines
}
