//! Tracked surfaces and their per-surface state
//!
//! A [`Surface`] is the compositor's record of one top-level window: its
//! geometry and stacking, its classification (shell, game, overlay), its
//! damage bookkeeping and the lazily created buffer/texture pair used to
//! composite it. Records are plain values; the fade controller keeps a
//! full copy of one after the live record may have been destroyed.

pub mod registry;

use std::fmt;

use crate::protocol::{SizeHints, SurfaceAttributes, SurfaceProperties};
use crate::renderer::TextureId;

pub use registry::SurfaceRegistry;

/// Fully opaque opacity value
pub const OPAQUE: u32 = 0xffff_ffff;

/// Fully transparent opacity value, the default until a value is observed
pub const TRANSLUCENT: u32 = 0;

/// Opaque identity of a surface, stable for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle to a surface's backing buffer on the display side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    Unmapped,
    Viewable,
}

/// Whether a surface has visible contents at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceClass {
    InputOutput,
    InputOnly,
}

/// Pixel-format descriptor of a surface's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub depth: u8,
}

/// Position, size and border of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
}

impl Geometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            border_width: 0,
        }
    }

    /// Extents including the border on both sides
    pub fn outer_size(&self) -> (u32, u32) {
        (
            self.width + self.border_width * 2,
            self.height + self.border_width * 2,
        )
    }

    pub fn is_at_origin(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

/// Compositor record for one tracked window
#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    pub id: SurfaceId,
    pub geometry: Geometry,
    pub override_redirect: bool,
    pub map_state: MapState,
    pub class: SurfaceClass,

    /// Caller-visible "hidden" annotation, distinct from unmapped
    pub hidden: bool,

    pub format: Option<PixelFormat>,
    pub buffer: Option<BufferHandle>,
    pub texture: Option<TextureId>,

    /// Texture contents must be refreshed from the buffer before drawing
    pub upload_pending: bool,

    pub opacity: u32,

    pub is_shell: bool,
    pub is_overlay: bool,
    pub is_fullscreen: bool,
    pub game_id: u32,

    /// Fixed size the client asked for, from its size hints
    pub requested_size: Option<(u32, u32)>,

    /// Override flag disregarded for focus (fullscreen-wrapper heuristic)
    pub ignore_override_redirect: bool,

    /// Already nudged by one pixel on first focus
    pub nudged: bool,

    pub damaged: bool,
    pub damage_sequence: u64,
    pub map_sequence: u64,

    /// Pointer warps observed since the last focus change or re-arm
    pub warps_seen: u32,

    /// True once at least one damage event has been observed
    pub valid_contents: bool,

    /// Whether a damage object exists for this surface on the display side
    pub has_damage_object: bool,
}

impl Surface {
    pub fn new(id: SurfaceId, attributes: &SurfaceAttributes) -> Self {
        Self {
            id,
            geometry: attributes.geometry,
            override_redirect: attributes.override_redirect,
            map_state: attributes.map_state,
            class: attributes.class,
            hidden: false,
            format: attributes.format,
            buffer: None,
            texture: None,
            upload_pending: false,
            opacity: TRANSLUCENT,
            is_shell: false,
            is_overlay: false,
            is_fullscreen: false,
            game_id: 0,
            requested_size: None,
            ignore_override_redirect: false,
            nudged: false,
            damaged: false,
            damage_sequence: 0,
            map_sequence: 0,
            warps_seen: 0,
            valid_contents: false,
            has_damage_object: false,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.map_state == MapState::Viewable
    }

    /// Override flag as seen by focus arbitration
    pub fn effective_override(&self) -> bool {
        self.override_redirect && !self.ignore_override_redirect
    }

    /// Eligible to be focused as a game surface
    pub fn is_focusable_game(&self) -> bool {
        self.game_id != 0 && self.is_mapped() && self.class == SurfaceClass::InputOutput
    }

    pub fn has_resources(&self) -> bool {
        self.buffer.is_some()
    }

    /// Opacity as a normalized fraction
    pub fn opacity_fraction(&self) -> f32 {
        (self.opacity as f64 / OPAQUE as f64) as f32
    }

    pub fn set_opacity_fraction(&mut self, fraction: f64) {
        self.opacity = (fraction.clamp(0.0, 1.0) * OPAQUE as f64) as u32;
    }

    /// Apply the classification properties observed when the surface maps
    pub fn apply_properties(&mut self, properties: &SurfaceProperties) {
        self.opacity = properties.opacity;
        self.is_shell = properties.is_shell;
        self.game_id = properties.game_id;
        self.is_overlay = properties.is_overlay;
    }

    /// Fixed size declared through equal min/max hints, if any
    pub fn fixed_size_from_hints(hints: &SizeHints) -> Option<(u32, u32)> {
        match (hints.min_size, hints.max_size) {
            (Some((min_w, min_h)), Some((max_w, max_h)))
                if min_w > 0 && min_h > 0 && min_w == max_w && min_h == max_h =>
            {
                Some((max_w, max_h))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes() -> SurfaceAttributes {
        SurfaceAttributes {
            geometry: Geometry::new(10, 20, 640, 480),
            override_redirect: true,
            map_state: MapState::Unmapped,
            class: SurfaceClass::InputOutput,
            format: Some(PixelFormat { depth: 24 }),
        }
    }

    #[test]
    fn test_new_surface_defaults_to_transparent() {
        let surface = Surface::new(SurfaceId(0x400001), &attributes());
        assert_eq!(surface.opacity, TRANSLUCENT);
        assert!(!surface.valid_contents);
        assert!(!surface.has_resources());
        assert_eq!(surface.id.to_string(), "0x400001");
    }

    #[test]
    fn test_effective_override_respects_wrapper_heuristic() {
        let mut surface = Surface::new(SurfaceId(1), &attributes());
        assert!(surface.effective_override());
        surface.ignore_override_redirect = true;
        assert!(!surface.effective_override());
    }

    #[test]
    fn test_fixed_size_requires_equal_nonzero_bounds() {
        let fixed = SizeHints {
            min_size: Some((1280, 720)),
            max_size: Some((1280, 720)),
        };
        assert_eq!(Surface::fixed_size_from_hints(&fixed), Some((1280, 720)));

        let ranged = SizeHints {
            min_size: Some((640, 480)),
            max_size: Some((1280, 720)),
        };
        assert_eq!(Surface::fixed_size_from_hints(&ranged), None);

        let zero = SizeHints {
            min_size: Some((0, 0)),
            max_size: Some((0, 0)),
        };
        assert_eq!(Surface::fixed_size_from_hints(&zero), None);
    }

    #[test]
    fn test_opacity_fraction_roundtrip_is_close() {
        let mut surface = Surface::new(SurfaceId(1), &attributes());
        surface.set_opacity_fraction(0.5);
        assert!((surface.opacity_fraction() - 0.5).abs() < 1e-3);
    }
}
