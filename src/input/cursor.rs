//! Pointer tracking, auto-hide, confinement and the software cursor
//!
//! The hardware cursor is hidden for two independent reasons: the pointer
//! has been idle for the hide timeout, or the focused content is scaled and
//! the compositor draws the cursor itself. Visibility requests are only
//! sent to the display when the combined state changes.
//!
//! Every focus change is followed by a few synthetic warps (ours, the
//! client's, its toolkit's); the first `ignored_warps` position changes seen
//! on a surface are not treated as user movement.

use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, trace};

use crate::protocol::{BarrierId, BarrierLine, CursorImage, DisplayServer, PixelImage};
use crate::renderer::painter::fit_ratio;
use crate::renderer::{DrawParams, RectF, Renderer, TextureFormat, TextureId};
use crate::surface::{Geometry, Surface, SurfaceId};

/// Result of a pointer position update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    /// Same position as before
    Unchanged,
    /// A likely synthetic warp, not counted as user movement
    Suppressed,
    /// Real movement: the idle timer restarted
    Recognized,
}

/// Focus state that decides how the pointer is confined
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confinement {
    pub focus: SurfaceId,
    pub geometry: Geometry,
    pub output: (u32, u32),
    pub needs_scale: bool,
    pub game_focused: bool,
    pub render_enabled: bool,
}

/// Scale state the software cursor is positioned with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorPlacement {
    pub output: (u32, u32),
    /// Fit ratio of the focused content, without the global scale
    pub fit_ratio: f32,
    /// Letterbox offset of the focused content
    pub offset: (f32, f32),
    pub global_ratio: f32,
    pub zoom_ratio: f32,
    /// Size of the overlay surface, if one exists
    pub overlay: Option<(u32, u32)>,
}

/// Four segments along the focused surface's edges, each spanning the
/// output so the pointer cannot slip around a corner
pub fn barrier_lines(geometry: &Geometry, output: (u32, u32)) -> [BarrierLine; 4] {
    let (out_w, out_h) = (output.0 as i32, output.1 as i32);
    let (x, y) = (geometry.x, geometry.y);
    let (w, h) = (geometry.width as i32, geometry.height as i32);

    [
        BarrierLine { x1: 0, y1: y, x2: out_w, y2: y },
        BarrierLine { x1: x + w, y1: 0, x2: x + w, y2: out_h },
        BarrierLine { x1: out_w, y1: y + h, x2: 0, y2: y + h },
        BarrierLine { x1: x, y1: out_h, x2: x, y2: 0 },
    ]
}

/// Screen rectangle of the software cursor.
///
/// The hotspot lands where the pointer would be on the scaled content. The
/// image is sized as the overlay would draw it, so the cursor looks the
/// same as under the overlay's own rendering.
pub fn software_cursor_rect(
    pointer: (i32, i32),
    focus: &Geometry,
    placement: &CursorPlacement,
    image: &CursorImage,
) -> RectF {
    let ratio = placement.fit_ratio * placement.global_ratio;
    let mut x = (pointer.0 - focus.x) as f32 * ratio + placement.offset.0;
    let mut y = (pointer.1 - focus.y) as f32 * ratio + placement.offset.1;

    if placement.zoom_ratio != 1.0 {
        x += ((focus.width / 2) as f32 - pointer.0 as f32) * ratio;
        y += ((focus.height / 2) as f32 - pointer.1 as f32) * ratio;
    }

    let display_ratio = match placement.overlay {
        Some(size) => fit_ratio(placement.output, size) * placement.global_ratio,
        None => 1.0,
    };

    RectF::new(
        x - image.hot_x as f32 * display_ratio,
        y - image.hot_y as f32 * display_ratio,
        image.width as f32 * display_ratio,
        image.height as f32 * display_ratio,
    )
}

pub struct CursorManager {
    position: (i32, i32),
    last_moved: Instant,
    hide_timeout: Duration,
    ignored_warps: u32,

    hide_for_movement: bool,
    hide_for_scale: bool,
    visible: bool,

    barriers: Vec<BarrierId>,

    image: Option<CursorImage>,
    image_dirty: bool,
    texture: Option<TextureId>,
}

impl CursorManager {
    pub fn new(hide_timeout: Duration, ignored_warps: u32, now: Instant) -> Self {
        Self {
            position: (0, 0),
            last_moved: now,
            hide_timeout,
            ignored_warps,
            hide_for_movement: false,
            hide_for_scale: false,
            visible: true,
            barriers: Vec::new(),
            image: None,
            image_dirty: true,
            texture: None,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn hidden_for_movement(&self) -> bool {
        self.hide_for_movement
    }

    pub fn hidden_for_scale(&self) -> bool {
        self.hide_for_scale
    }

    pub fn barrier_count(&self) -> usize {
        self.barriers.len()
    }

    pub fn mark_image_dirty(&mut self) {
        self.image_dirty = true;
    }

    /// Hide the cursor until the pointer next moves
    pub fn hide_until_moved<D: DisplayServer + ?Sized>(&mut self, display: &mut D) -> Result<()> {
        self.hide_for_movement = true;
        self.apply_state(display)
    }

    /// Push the combined visibility to the display if it changed
    pub fn apply_state<D: DisplayServer + ?Sized>(&mut self, display: &mut D) -> Result<()> {
        let visible = !(self.hide_for_scale || self.hide_for_movement);
        if visible != self.visible {
            self.visible = visible;
            debug!("Cursor {}", if visible { "shown" } else { "hidden" });
            display.show_cursor(visible)?;
        }
        Ok(())
    }

    /// Handle a pointer position update.
    ///
    /// `focus` is the focused surface; when `damage_focus` is set it is
    /// marked damaged so the software cursor follows the pointer.
    pub fn handle_motion<D: DisplayServer + ?Sized>(
        &mut self,
        display: &mut D,
        x: i32,
        y: i32,
        focus: Option<&mut Surface>,
        damage_focus: bool,
        now: Instant,
    ) -> Result<Motion> {
        if self.position == (x, y) {
            return Ok(Motion::Unchanged);
        }
        self.position = (x, y);

        if let Some(surface) = focus {
            if damage_focus {
                surface.damaged = true;
            }
            let seen = surface.warps_seen;
            surface.warps_seen = seen.saturating_add(1);
            if seen < self.ignored_warps {
                trace!("Ignoring warp {} on {}", seen + 1, surface.id);
                return Ok(Motion::Suppressed);
            }
        }

        self.record_movement(display, now)?;
        Ok(Motion::Recognized)
    }

    /// A pressed pointer button counts as movement
    pub fn handle_buttons<D: DisplayServer + ?Sized>(
        &mut self,
        display: &mut D,
        pressed: bool,
        now: Instant,
    ) -> Result<()> {
        if pressed {
            self.record_movement(display, now)?;
        }
        Ok(())
    }

    fn record_movement<D: DisplayServer + ?Sized>(&mut self, display: &mut D, now: Instant) -> Result<()> {
        self.last_moved = now;
        self.hide_for_movement = false;
        self.apply_state(display)
    }

    /// Hide the cursor once the pointer has been idle for the timeout.
    ///
    /// Re-arms warp suppression on the focus and, when `damage_focus` is
    /// set, damages it so the software cursor disappears. Returns whether
    /// the cursor was hidden by this call.
    pub fn check_idle<D: DisplayServer + ?Sized>(
        &mut self,
        display: &mut D,
        focus: Option<&mut Surface>,
        damage_focus: bool,
        now: Instant,
    ) -> Result<bool> {
        if self.hide_for_movement {
            return Ok(false);
        }
        if now.saturating_duration_since(self.last_moved) < self.hide_timeout {
            return Ok(false);
        }

        self.hide_for_movement = true;
        self.apply_state(display)?;

        if let Some(surface) = focus {
            surface.warps_seen = 0;
            if damage_focus {
                surface.damaged = true;
            }
        }
        Ok(true)
    }

    /// Recreate the confinement barriers for the current focus
    pub fn update_barriers<D: DisplayServer + ?Sized>(
        &mut self,
        display: &mut D,
        confinement: &Confinement,
    ) -> Result<()> {
        for barrier in self.barriers.drain(..) {
            display.destroy_barrier(barrier)?;
        }

        if !confinement.needs_scale && confinement.game_focused {
            self.hide_for_scale = false;
            return self.apply_state(display);
        }

        // Scaled content: the compositor draws the cursor
        if confinement.render_enabled {
            self.hide_for_scale = true;
            self.apply_state(display)?;
        }

        if !confinement.game_focused {
            return Ok(());
        }

        for line in barrier_lines(&confinement.geometry, confinement.output) {
            self.barriers.push(display.create_barrier(line)?);
        }

        let pointer = display.query_pointer()?;
        let (width, height) = (confinement.geometry.width as i32, confinement.geometry.height as i32);
        if pointer.x >= width || pointer.y >= height {
            display.warp_pointer(confinement.focus, width / 2, height / 2)?;
        }
        Ok(())
    }

    /// Pointer left the focused surface through a barrier gap: put it back
    pub fn handle_leave<D: DisplayServer + ?Sized>(&mut self, display: &mut D, focus: SurfaceId) -> Result<()> {
        let (x, y) = self.position;
        display.warp_pointer(focus, x, y)
    }

    /// Draw the software cursor over scaled content.
    ///
    /// The pointer is sampled fresh and run through motion handling; a
    /// moved pointer damages the focus so the next frame follows it. The
    /// cursor image is re-uploaded only after it changed. Returns
    /// whether anything was drawn.
    pub fn draw_software_cursor<D, R>(
        &mut self,
        display: &mut D,
        renderer: &mut R,
        focus: &mut Surface,
        placement: &CursorPlacement,
        now: Instant,
    ) -> Result<bool>
    where
        D: DisplayServer + ?Sized,
        R: Renderer + ?Sized,
    {
        let pointer = display.query_pointer()?;
        self.handle_motion(display, pointer.x, pointer.y, Some(&mut *focus), true, now)?;

        if self.image_dirty {
            let Some(image) = display.cursor_image()? else {
                return Ok(false);
            };
            let texture = match self.texture {
                Some(texture) => texture,
                None => {
                    let texture = renderer.create_texture(image.width, image.height, TextureFormat::Alpha)?;
                    self.texture = Some(texture);
                    texture
                }
            };
            renderer.upload_texture(
                texture,
                &PixelImage {
                    width: image.width,
                    height: image.height,
                    pixels: image.pixels.clone(),
                },
            )?;
            self.image = Some(image);
            self.image_dirty = false;
        }

        let (Some(image), Some(texture)) = (self.image.as_ref(), self.texture) else {
            return Ok(false);
        };

        let dest = software_cursor_rect((pointer.x, pointer.y), &focus.geometry, placement, image);
        renderer.draw_texture(texture, dest, DrawParams::blended(1.0));
        Ok(true)
    }

    /// Release the cursor texture
    pub fn release<R: Renderer + ?Sized>(&mut self, renderer: &mut R) {
        if let Some(texture) = self.texture.take() {
            renderer.destroy_texture(texture);
        }
        self.image = None;
        self.image_dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::headless::{HeadlessDisplay, Request};
    use crate::protocol::SurfaceAttributes;
    use crate::surface::{MapState, SurfaceClass};

    fn surface() -> Surface {
        Surface::new(
            SurfaceId(0x400001),
            &SurfaceAttributes {
                geometry: Geometry::new(0, 0, 1280, 720),
                override_redirect: false,
                map_state: MapState::Viewable,
                class: SurfaceClass::InputOutput,
                format: None,
            },
        )
    }

    fn manager(now: Instant) -> CursorManager {
        CursorManager::new(Duration::from_millis(10_000), 3, now)
    }

    #[test]
    fn test_first_three_warps_are_suppressed() {
        let now = Instant::now();
        let mut display = HeadlessDisplay::new(1920, 1080);
        let mut cursor = manager(now);
        let mut focus = surface();

        for i in 0..3 {
            let motion = cursor
                .handle_motion(&mut display, 10 + i, 10, Some(&mut focus), false, now)
                .unwrap();
            assert_eq!(motion, Motion::Suppressed);
        }
        let motion = cursor
            .handle_motion(&mut display, 50, 50, Some(&mut focus), false, now)
            .unwrap();
        assert_eq!(motion, Motion::Recognized);
        assert_eq!(focus.warps_seen, 4);
    }

    #[test]
    fn test_unchanged_position_is_ignored() {
        let now = Instant::now();
        let mut display = HeadlessDisplay::new(1920, 1080);
        let mut cursor = manager(now);
        let mut focus = surface();

        cursor.handle_motion(&mut display, 5, 5, Some(&mut focus), true, now).unwrap();
        focus.damaged = false;
        let motion = cursor.handle_motion(&mut display, 5, 5, Some(&mut focus), true, now).unwrap();

        assert_eq!(motion, Motion::Unchanged);
        assert_eq!(focus.warps_seen, 1);
        assert!(!focus.damaged);
    }

    #[test]
    fn test_idle_hide_requires_full_timeout() {
        let start = Instant::now();
        let mut display = HeadlessDisplay::new(1920, 1080);
        let mut cursor = manager(start);
        let mut focus = surface();
        focus.warps_seen = 7;

        let early = start + Duration::from_millis(9_999);
        assert!(!cursor.check_idle(&mut display, Some(&mut focus), true, early).unwrap());
        assert!(cursor.visible());

        let late = start + Duration::from_millis(10_000);
        assert!(cursor.check_idle(&mut display, Some(&mut focus), true, late).unwrap());
        assert!(!cursor.visible());
        assert!(!display.cursor_visible());
        assert_eq!(focus.warps_seen, 0);
        assert!(focus.damaged);

        // Already hidden: no repeated request
        display.clear_requests();
        assert!(!cursor.check_idle(&mut display, Some(&mut focus), true, late).unwrap());
        assert!(display.requests().is_empty());
    }

    #[test]
    fn test_button_press_counts_as_movement() {
        let start = Instant::now();
        let mut display = HeadlessDisplay::new(1920, 1080);
        let mut cursor = manager(start);
        let late = start + Duration::from_secs(11);

        cursor.check_idle(&mut display, None, false, late).unwrap();
        assert!(cursor.hidden_for_movement());

        cursor.handle_buttons(&mut display, true, late).unwrap();
        assert!(!cursor.hidden_for_movement());
        assert!(display.cursor_visible());
    }

    #[test]
    fn test_barriers_surround_scaled_game() {
        let now = Instant::now();
        let mut display = HeadlessDisplay::new(1920, 1080);
        let mut cursor = manager(now);
        let focus = surface();

        let confinement = Confinement {
            focus: focus.id,
            geometry: focus.geometry,
            output: (1920, 1080),
            needs_scale: true,
            game_focused: true,
            render_enabled: true,
        };
        let root = display.root();
        display.warp_pointer(root, 1500, 900).unwrap();
        cursor.update_barriers(&mut display, &confinement).unwrap();

        assert_eq!(display.barriers(), barrier_lines(&focus.geometry, (1920, 1080)).to_vec());
        assert_eq!(display.barriers()[1], BarrierLine { x1: 1280, y1: 0, x2: 1280, y2: 1080 });
        assert!(cursor.hidden_for_scale());
        assert!(display.requests().contains(&Request::WarpPointer(focus.id, 640, 360)));

        // Recreated, never accumulated
        cursor.update_barriers(&mut display, &confinement).unwrap();
        assert_eq!(display.barriers().len(), 4);
    }

    #[test]
    fn test_unscaled_game_releases_cursor() {
        let now = Instant::now();
        let mut display = HeadlessDisplay::new(1920, 1080);
        let mut cursor = manager(now);
        let focus = surface();
        let mut confinement = Confinement {
            focus: focus.id,
            geometry: focus.geometry,
            output: (1920, 1080),
            needs_scale: true,
            game_focused: true,
            render_enabled: true,
        };
        cursor.update_barriers(&mut display, &confinement).unwrap();

        confinement.needs_scale = false;
        cursor.update_barriers(&mut display, &confinement).unwrap();

        assert!(display.barriers().is_empty());
        assert!(!cursor.hidden_for_scale());
        assert!(display.cursor_visible());
    }

    #[test]
    fn test_no_barriers_without_game() {
        let now = Instant::now();
        let mut display = HeadlessDisplay::new(1920, 1080);
        let mut cursor = manager(now);
        let focus = surface();

        cursor
            .update_barriers(
                &mut display,
                &Confinement {
                    focus: focus.id,
                    geometry: focus.geometry,
                    output: (1920, 1080),
                    needs_scale: true,
                    game_focused: false,
                    render_enabled: true,
                },
            )
            .unwrap();

        assert!(display.barriers().is_empty());
        assert!(cursor.hidden_for_scale());
    }

    #[test]
    fn test_software_cursor_matches_overlay_scale() {
        let image = CursorImage {
            width: 32,
            height: 32,
            hot_x: 4,
            hot_y: 2,
            pixels: vec![0; 32 * 32],
        };
        let focus = Geometry::new(0, 0, 1280, 720);
        let placement = CursorPlacement {
            output: (1920, 1080),
            fit_ratio: 1.5,
            offset: (0.0, 0.0),
            global_ratio: 1.0,
            zoom_ratio: 1.0,
            overlay: Some((1280, 720)),
        };

        let rect = software_cursor_rect((100, 100), &focus, &placement, &image);
        assert_eq!(rect, RectF::new(144.0, 147.0, 48.0, 48.0));

        let native = CursorPlacement {
            overlay: None,
            ..placement
        };
        let rect = software_cursor_rect((100, 100), &focus, &native, &image);
        assert_eq!(rect, RectF::new(146.0, 148.0, 32.0, 32.0));
    }
}
