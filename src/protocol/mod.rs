//! Display protocol seam
//!
//! The compositor never talks to a display connection directly. It consumes
//! typed [`Event`]s and issues requests through the [`DisplayServer`] trait,
//! which a backend implements on top of a real connection (`x11`, behind
//! the feature of the same name) or in memory (`headless`).
//!
//! Property reads are typed: a backend returns a [`SurfaceProperties`] or
//! [`GlobalProperties`] snapshot with the per-key defaults already applied.

pub mod headless;
#[cfg(feature = "x11")]
pub mod x11;

use anyhow::Result;
use std::time::Duration;

use crate::error::{ErrorBases, ProtocolError};
use crate::surface::{BufferHandle, Geometry, MapState, PixelFormat, SurfaceClass, SurfaceId, TRANSLUCENT};

/// Default screen-scale value, meaning "no overscan compensation"
pub const SCREEN_SCALE_UNITY: u32 = 0xffff_ffff;

/// Default screen-zoom value, meaning "no magnification"
pub const SCREEN_ZOOM_UNITY: u32 = 0xffff;

/// Attributes queried when a surface starts being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceAttributes {
    pub geometry: Geometry,
    pub override_redirect: bool,
    pub map_state: MapState,
    pub class: SurfaceClass,
    pub format: Option<PixelFormat>,
}

/// Per-surface properties, re-read whenever a surface maps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceProperties {
    pub opacity: u32,
    pub is_shell: bool,
    pub game_id: u32,
    pub is_overlay: bool,
}

impl Default for SurfaceProperties {
    fn default() -> Self {
        Self {
            opacity: TRANSLUCENT,
            is_shell: false,
            game_id: 0,
            is_overlay: false,
        }
    }
}

/// Root-level properties shared by the whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalProperties {
    pub games_running: u32,
    pub screen_scale: u32,
    pub screen_zoom: u32,
}

impl Default for GlobalProperties {
    fn default() -> Self {
        Self {
            games_running: 0,
            screen_scale: SCREEN_SCALE_UNITY,
            screen_zoom: SCREEN_ZOOM_UNITY,
        }
    }
}

impl GlobalProperties {
    /// Overscan compensation as a ratio
    pub fn overscan_ratio(&self) -> f32 {
        (self.screen_scale as f64 / SCREEN_SCALE_UNITY as f64) as f32
    }

    /// Magnification as a ratio
    pub fn zoom_ratio(&self) -> f32 {
        (self.screen_zoom as f64 / SCREEN_ZOOM_UNITY as f64) as f32
    }
}

/// Size constraints a client declared for its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeHints {
    pub min_size: Option<(u32, u32)>,
    pub max_size: Option<(u32, u32)>,
}

impl SizeHints {
    const FLAG_MIN_SIZE: u32 = 1 << 4;
    const FLAG_MAX_SIZE: u32 = 1 << 5;

    /// Decode a raw `WM_NORMAL_HINTS` value (flags, x, y, w, h, min, max, ...)
    pub fn from_wm_normal_hints(raw: &[u32]) -> Self {
        let flags = raw.first().copied().unwrap_or(0);
        let pair = |i: usize| match (raw.get(i), raw.get(i + 1)) {
            (Some(&w), Some(&h)) => Some((w, h)),
            _ => None,
        };

        Self {
            min_size: if flags & Self::FLAG_MIN_SIZE != 0 { pair(5) } else { None },
            max_size: if flags & Self::FLAG_MAX_SIZE != 0 { pair(7) } else { None },
        }
    }
}

/// Property keys the compositor reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Opacity,
    Shell,
    GameId,
    Overlay,
    SizeHints,
    GamesRunning,
    ScreenScale,
    ScreenZoom,
    Other(u32),
}

/// Requested change to a surface's fullscreen state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullscreenAction {
    Remove,
    Add,
    Toggle,
}

impl FullscreenAction {
    pub fn from_raw(action: u32) -> Self {
        match action {
            0 => FullscreenAction::Remove,
            1 => FullscreenAction::Add,
            _ => FullscreenAction::Toggle,
        }
    }

    pub fn apply(&self, current: bool) -> bool {
        match self {
            FullscreenAction::Remove => false,
            FullscreenAction::Add => true,
            FullscreenAction::Toggle => !current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CirculatePlace {
    OnTop,
    OnBottom,
}

/// Inbound notification payloads
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Create {
        window: SurfaceId,
        parent: SurfaceId,
    },
    Configure {
        window: SurfaceId,
        geometry: Geometry,
        override_redirect: bool,
        above: Option<SurfaceId>,
    },
    Destroy {
        window: SurfaceId,
    },
    Map {
        window: SurfaceId,
    },
    Unmap {
        window: SurfaceId,
    },
    Reparent {
        window: SurfaceId,
        parent: SurfaceId,
    },
    Circulate {
        window: SurfaceId,
        place: CirculatePlace,
    },
    Property {
        window: SurfaceId,
        key: PropertyKey,
    },
    Fullscreen {
        window: SurfaceId,
        action: FullscreenAction,
    },
    Leave {
        window: SurfaceId,
    },
    Motion {
        window: SurfaceId,
        x: i32,
        y: i32,
    },
    Damage {
        drawable: SurfaceId,
    },
    CursorChanged,
    Expose,
    Error(ProtocolError),
}

/// A notification and the request serial it was generated at
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub serial: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(serial: u64, kind: EventKind) -> Self {
        Self { serial, kind }
    }
}

/// Pointer position and button state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerState {
    pub x: i32,
    pub y: i32,
    pub buttons_pressed: bool,
}

/// Current cursor image, ARGB32 pixels in row-major order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    pub pixels: Vec<u32>,
}

/// Snapshot of a backing buffer's pixels, ARGB32 in row-major order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl PixelImage {
    pub fn solid(width: u32, height: u32, argb: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![argb; (width * height) as usize],
        }
    }
}

/// A pointer barrier segment in root coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierLine {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BarrierId(pub u32);

/// Input event classes the compositor subscribes to on a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSelection {
    /// Property, structure, pointer-motion and leave notifications
    Tracked,
    /// Pointer motion only (descendants of the focused surface)
    PointerMotion,
    /// Nothing
    None,
}

/// Requests and queries the compositor issues against the display
pub trait DisplayServer {
    /// The display root window
    fn root(&self) -> SurfaceId;

    /// Current output size in pixels
    fn output_size(&self) -> (u32, u32);

    /// Serial the next request will be issued with
    fn next_request_serial(&self) -> u64;

    /// Base codes used to name extension errors
    fn error_bases(&self) -> ErrorBases {
        ErrorBases::default()
    }

    /// Next pending notification without blocking
    fn poll_event(&mut self) -> Result<Option<Event>>;

    /// Wait up to `timeout` for a notification
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<Event>>;

    /// Top-level windows that exist right now, bottom to top
    fn query_toplevels(&mut self) -> Result<Vec<SurfaceId>>;

    fn query_parent(&mut self, window: SurfaceId) -> Result<Option<SurfaceId>>;
    fn query_children(&mut self, window: SurfaceId) -> Result<Vec<SurfaceId>>;
    fn query_attributes(&mut self, window: SurfaceId) -> Result<Option<SurfaceAttributes>>;
    fn query_properties(&mut self, window: SurfaceId) -> Result<SurfaceProperties>;
    fn query_property(&mut self, window: SurfaceId, key: PropertyKey) -> Result<Option<u32>>;
    fn query_global_properties(&mut self) -> Result<GlobalProperties>;
    fn query_size_hints(&mut self, window: SurfaceId) -> Result<SizeHints>;

    fn set_hidden(&mut self, window: SurfaceId, hidden: bool) -> Result<()>;
    fn raise(&mut self, window: SurfaceId) -> Result<()>;
    fn move_to(&mut self, window: SurfaceId, x: i32, y: i32) -> Result<()>;
    fn resize(&mut self, window: SurfaceId, width: u32, height: u32) -> Result<()>;
    fn set_input_focus(&mut self, window: SurfaceId) -> Result<()>;
    fn select_input(&mut self, window: SurfaceId, selection: InputSelection) -> Result<()>;

    fn create_damage(&mut self, window: SurfaceId) -> Result<()>;
    fn destroy_damage(&mut self, window: SurfaceId) -> Result<()>;
    fn subtract_damage(&mut self, window: SurfaceId) -> Result<()>;

    /// Name the backing buffer currently holding a redirected surface
    fn name_buffer(&mut self, window: SurfaceId) -> Result<Option<BufferHandle>>;
    fn free_buffer(&mut self, buffer: BufferHandle) -> Result<()>;
    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Option<PixelImage>>;

    /// Re-enroll a surface in compositing
    fn redirect(&mut self, window: SurfaceId) -> Result<()>;
    /// Hand a surface directly to the display (scan-out bypass)
    fn unredirect(&mut self, window: SurfaceId) -> Result<()>;

    fn create_barrier(&mut self, line: BarrierLine) -> Result<BarrierId>;
    fn destroy_barrier(&mut self, barrier: BarrierId) -> Result<()>;

    fn query_pointer(&mut self) -> Result<PointerState>;
    fn warp_pointer(&mut self, window: SurfaceId, x: i32, y: i32) -> Result<()>;
    fn show_cursor(&mut self, visible: bool) -> Result<()>;
    fn cursor_image(&mut self) -> Result<Option<CursorImage>>;

    /// Push buffered requests to the display
    fn flush(&mut self) -> Result<()>;
}
