//! X11 display backend
//!
//! Talks to a real X server through x11rb. Requires the Composite, Damage
//! and XFixes extensions; Render is only consulted for error naming.
//! Requests are fire-and-forget: their errors come back through the event
//! queue tagged with the full request serial, which is what the
//! compositor's ignore list keys on.

use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info};
use tiny_skia::Pixmap;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::cookie::{Cookie, VoidCookie};
use x11rb::errors::ReplyError;
use x11rb::protocol::composite::{self, ConnectionExt as _, Redirect};
use x11rb::protocol::damage::{self, ConnectionExt as _, ReportLevel};
use x11rb::protocol::render;
use x11rb::protocol::xfixes::{self, BarrierDirections, ConnectionExt as _, CursorNotifyMask};
use x11rb::protocol::xproto::{
    self, AtomEnum, ChangeWindowAttributesAux, ConfigureWindowAux, ConnectionExt as _,
    CreateGCAux, CreateWindowAux, EventMask, ImageFormat, InputFocus, KeyButMask, Place,
    PropMode, StackMode, WindowClass,
};
use x11rb::protocol::Event as X11Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{CURRENT_TIME, NONE};

use super::{
    BarrierId, BarrierLine, CirculatePlace, CursorImage, DisplayServer, Event, EventKind,
    FullscreenAction, GlobalProperties, InputSelection, PixelImage, PointerState, PropertyKey,
    SizeHints, SurfaceAttributes, SurfaceProperties, SCREEN_SCALE_UNITY, SCREEN_ZOOM_UNITY,
};
use crate::error::{CompositorError, ErrorBases, ProtocolError};
use crate::renderer::FrameSink;
use crate::surface::{BufferHandle, Geometry, MapState, PixelFormat, SurfaceClass, SurfaceId, TRANSLUCENT};

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        _NET_WM_WINDOW_OPACITY,
        STEAM_BIGPICTURE,
        STEAM_GAME,
        STEAM_OVERLAY,
        STEAM_GAMES_RUNNING,
        STEAM_SCREEN_SCALE,
        STEAM_SCREEN_MAGNIFICATION,
        _NET_WM_STATE,
        _NET_WM_STATE_HIDDEN,
        _NET_WM_STATE_FULLSCREEN,
        _NET_WM_NAME,
        _NET_SUPPORTING_WM_CHECK,
        _NET_SUPPORTED,
        UTF8_STRING,
    }
}

/// Events polled while waiting for input
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Name advertised on the compositor's selection-owner window
const WM_NAME: &[u8] = b"gamecomp";

pub struct X11Display {
    conn: Arc<RustConnection>,
    screen: usize,
    root: xproto::Window,
    root_depth: u8,
    output: (u32, u32),
    atoms: Atoms,
    composite_opcode: u8,
    error_bases: ErrorBases,
    damage_objects: std::collections::HashMap<SurfaceId, damage::Damage>,
    last_sequence: Cell<u64>,
    synchronous: bool,
    /// Window owning the compositor selection
    owner: xproto::Window,
}

impl X11Display {
    /// Connect, verify extensions, claim the compositor selection and,
    /// when `redirect` is set, take over painting of the root's children
    pub fn connect(display: Option<&str>, synchronous: bool, redirect: bool) -> Result<Self> {
        let (conn, screen) =
            x11rb::connect(display).map_err(|e| CompositorError::Connection(e.to_string()))?;
        let conn = Arc::new(conn);

        let (root, root_depth, output) = {
            let screen = &conn.setup().roots[screen];
            (
                screen.root,
                screen.root_depth,
                (screen.width_in_pixels as u32, screen.height_in_pixels as u32),
            )
        };
        info!("🔌 Connected to X server, screen {} ({}x{})", screen, output.0, output.1);

        let composite = conn
            .extension_information(composite::X11_EXTENSION_NAME)?
            .ok_or(CompositorError::MissingExtension("composite"))?;
        conn.composite_query_version(0, 4)?.reply()?;

        let damage_info = conn
            .extension_information(damage::X11_EXTENSION_NAME)?
            .ok_or(CompositorError::MissingExtension("damage"))?;
        conn.damage_query_version(1, 1)?.reply()?;

        let xfixes_info = conn
            .extension_information(xfixes::X11_EXTENSION_NAME)?
            .ok_or(CompositorError::MissingExtension("XFixes"))?;
        conn.xfixes_query_version(5, 0)?.reply()?;

        let render_info = conn.extension_information(render::X11_EXTENSION_NAME)?;

        let atoms = Atoms::new(conn.as_ref())?.reply()?;

        let mut display = Self {
            conn,
            screen,
            root,
            root_depth,
            output,
            atoms,
            composite_opcode: composite.major_opcode,
            error_bases: ErrorBases {
                xfixes: Some(xfixes_info.first_error),
                damage: Some(damage_info.first_error),
                render: render_info.map(|r| r.first_error),
            },
            damage_objects: std::collections::HashMap::new(),
            last_sequence: Cell::new(0),
            synchronous,
            owner: NONE,
        };

        display.register_compositor()?;
        display.take_over_root(redirect)?;
        Ok(display)
    }

    /// Sink presenting composited frames onto the root window
    pub fn frame_sink(&self) -> Result<Box<dyn FrameSink>> {
        let gc = self.conn.generate_id()?;
        self.conn.create_gc(gc, self.root, &CreateGCAux::new())?;
        Ok(Box::new(RootSink {
            conn: Arc::clone(&self.conn),
            window: self.root,
            gc,
            depth: self.root_depth,
            max_bytes: self.conn.maximum_request_bytes(),
        }))
    }

    fn register_compositor(&mut self) -> Result<()> {
        let selection_name = format!("_NET_WM_CM_S{}", self.screen);
        let selection = self.conn.intern_atom(false, selection_name.as_bytes())?.reply()?.atom;

        let owner = self.conn.get_selection_owner(selection)?.reply()?.owner;
        if owner != NONE {
            let name = self
                .text_property(owner, self.atoms._NET_WM_NAME, self.atoms.UTF8_STRING)?
                .or(self.text_property(owner, AtomEnum::WM_NAME.into(), AtomEnum::STRING.into())?)
                .unwrap_or_else(|| format!("{:#x}", owner));
            return Err(CompositorError::AnotherCompositor(name).into());
        }

        let window = self.conn.generate_id()?;
        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            self.root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new(),
        )?;
        self.conn
            .change_property8(PropMode::REPLACE, window, AtomEnum::WM_NAME, AtomEnum::STRING, WM_NAME)?;
        self.conn.change_property8(
            PropMode::REPLACE,
            window,
            self.atoms._NET_WM_NAME,
            self.atoms.UTF8_STRING,
            WM_NAME,
        )?;

        for target in [self.root, window] {
            self.conn.change_property32(
                PropMode::REPLACE,
                target,
                self.atoms._NET_SUPPORTING_WM_CHECK,
                AtomEnum::WINDOW,
                &[window],
            )?;
        }
        self.conn.change_property32(
            PropMode::APPEND,
            self.root,
            self.atoms._NET_SUPPORTED,
            AtomEnum::ATOM,
            &[self.atoms._NET_WM_STATE_FULLSCREEN],
        )?;

        self.conn.set_selection_owner(window, selection, CURRENT_TIME)?;
        self.owner = window;
        debug!("Registered as compositing manager on screen {}", self.screen);
        Ok(())
    }

    fn take_over_root(&mut self, redirect: bool) -> Result<()> {
        self.conn.grab_server()?;

        if redirect {
            let cookie = self.conn.composite_redirect_subwindows(self.root, Redirect::MANUAL)?;
            self.sent(&cookie);
        }

        let mask = EventMask::SUBSTRUCTURE_NOTIFY
            | EventMask::EXPOSURE
            | EventMask::STRUCTURE_NOTIFY
            | EventMask::FOCUS_CHANGE
            | EventMask::POINTER_MOTION
            | EventMask::LEAVE_WINDOW
            | EventMask::PROPERTY_CHANGE;
        self.conn
            .change_window_attributes(self.root, &ChangeWindowAttributesAux::new().event_mask(mask))?;
        self.conn
            .xfixes_select_cursor_input(self.root, CursorNotifyMask::DISPLAY_CURSOR)?;

        self.conn.ungrab_server()?;
        self.conn.flush()?;
        Ok(())
    }

    fn sent(&self, cookie: &VoidCookie<'_, RustConnection>) {
        self.last_sequence.set(cookie.sequence_number());
    }

    fn sent_reply<R>(&self, cookie: &Cookie<'_, RustConnection, R>) {
        self.last_sequence.set(cookie.sequence_number());
    }

    fn text_property(&self, window: xproto::Window, property: xproto::Atom, type_: xproto::Atom) -> Result<Option<String>> {
        let reply = match self.conn.get_property(false, window, property, type_, 0, 256)?.reply() {
            Ok(reply) => reply,
            Err(ReplyError::X11Error(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if reply.value.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&reply.value).into_owned()))
    }

    fn cardinal(&self, window: SurfaceId, property: xproto::Atom) -> Result<Option<u32>> {
        let cookie = self
            .conn
            .get_property(false, window.0, property, AtomEnum::CARDINAL, 0, 1)?;
        self.sent_reply(&cookie);
        match cookie.reply() {
            Ok(reply) => Ok(reply.value32().and_then(|mut values| values.next())),
            Err(ReplyError::X11Error(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn atom_for(&self, key: PropertyKey) -> Option<xproto::Atom> {
        let atoms = &self.atoms;
        match key {
            PropertyKey::Opacity => Some(atoms._NET_WM_WINDOW_OPACITY),
            PropertyKey::Shell => Some(atoms.STEAM_BIGPICTURE),
            PropertyKey::GameId => Some(atoms.STEAM_GAME),
            PropertyKey::Overlay => Some(atoms.STEAM_OVERLAY),
            PropertyKey::GamesRunning => Some(atoms.STEAM_GAMES_RUNNING),
            PropertyKey::ScreenScale => Some(atoms.STEAM_SCREEN_SCALE),
            PropertyKey::ScreenZoom => Some(atoms.STEAM_SCREEN_MAGNIFICATION),
            PropertyKey::SizeHints => None,
            PropertyKey::Other(atom) => Some(atom),
        }
    }

    fn key_for(&self, atom: xproto::Atom) -> PropertyKey {
        let atoms = &self.atoms;
        match atom {
            a if a == atoms._NET_WM_WINDOW_OPACITY => PropertyKey::Opacity,
            a if a == atoms.STEAM_BIGPICTURE => PropertyKey::Shell,
            a if a == atoms.STEAM_GAME => PropertyKey::GameId,
            a if a == atoms.STEAM_OVERLAY => PropertyKey::Overlay,
            a if a == atoms.STEAM_GAMES_RUNNING => PropertyKey::GamesRunning,
            a if a == atoms.STEAM_SCREEN_SCALE => PropertyKey::ScreenScale,
            a if a == atoms.STEAM_SCREEN_MAGNIFICATION => PropertyKey::ScreenZoom,
            a if a == u32::from(AtomEnum::WM_NORMAL_HINTS) => PropertyKey::SizeHints,
            other => PropertyKey::Other(other),
        }
    }

    fn translate(&mut self, event: X11Event, serial: u64) -> Option<EventKind> {
        let kind = match event {
            X11Event::CreateNotify(e) => EventKind::Create {
                window: SurfaceId(e.window),
                parent: SurfaceId(e.parent),
            },
            X11Event::ConfigureNotify(e) => {
                if e.window == self.root {
                    self.output = (e.width as u32, e.height as u32);
                }
                EventKind::Configure {
                    window: SurfaceId(e.window),
                    geometry: Geometry {
                        x: e.x as i32,
                        y: e.y as i32,
                        width: e.width as u32,
                        height: e.height as u32,
                        border_width: e.border_width as u32,
                    },
                    override_redirect: e.override_redirect,
                    above: (e.above_sibling != NONE).then_some(SurfaceId(e.above_sibling)),
                }
            }
            X11Event::DestroyNotify(e) => EventKind::Destroy {
                window: SurfaceId(e.window),
            },
            X11Event::MapNotify(e) => EventKind::Map {
                window: SurfaceId(e.window),
            },
            X11Event::UnmapNotify(e) => EventKind::Unmap {
                window: SurfaceId(e.window),
            },
            X11Event::ReparentNotify(e) => EventKind::Reparent {
                window: SurfaceId(e.window),
                parent: SurfaceId(e.parent),
            },
            X11Event::CirculateNotify(e) => EventKind::Circulate {
                window: SurfaceId(e.window),
                place: if e.place == Place::ON_TOP {
                    CirculatePlace::OnTop
                } else {
                    CirculatePlace::OnBottom
                },
            },
            X11Event::PropertyNotify(e) => EventKind::Property {
                window: SurfaceId(e.window),
                key: self.key_for(e.atom),
            },
            X11Event::ClientMessage(e) => {
                let data = e.data.as_data32();
                if e.type_ != self.atoms._NET_WM_STATE || data[1] != self.atoms._NET_WM_STATE_FULLSCREEN {
                    return None;
                }
                EventKind::Fullscreen {
                    window: SurfaceId(e.window),
                    action: FullscreenAction::from_raw(data[0]),
                }
            }
            X11Event::LeaveNotify(e) => EventKind::Leave {
                window: SurfaceId(e.event),
            },
            X11Event::MotionNotify(e) => EventKind::Motion {
                window: SurfaceId(e.event),
                x: e.event_x as i32,
                y: e.event_y as i32,
            },
            X11Event::DamageNotify(e) => EventKind::Damage {
                drawable: SurfaceId(e.drawable),
            },
            X11Event::XfixesCursorNotify(_) => EventKind::CursorChanged,
            X11Event::Expose(_) => EventKind::Expose,
            X11Event::Error(e) => EventKind::Error(ProtocolError {
                serial,
                error_code: e.error_code,
                request_code: e.major_opcode,
                minor_code: e.minor_opcode,
                generic_text: format!("{:?}", e.error_kind),
                redirect_conflict: e.major_opcode == self.composite_opcode
                    && e.minor_opcode == u16::from(composite::REDIRECT_SUBWINDOWS_REQUEST),
            }),
            other => {
                log::trace!("Unhandled X event {:?}", other);
                return None;
            }
        };
        Some(kind)
    }
}

impl DisplayServer for X11Display {
    fn root(&self) -> SurfaceId {
        SurfaceId(self.root)
    }

    fn output_size(&self) -> (u32, u32) {
        self.output
    }

    fn next_request_serial(&self) -> u64 {
        self.last_sequence.get() + 1
    }

    fn error_bases(&self) -> ErrorBases {
        self.error_bases
    }

    fn poll_event(&mut self) -> Result<Option<Event>> {
        while let Some((event, serial)) = self
            .conn
            .poll_for_event_with_sequence()
            .map_err(|e| CompositorError::Connection(e.to_string()))?
        {
            if let Some(kind) = self.translate(event, serial) {
                return Ok(Some(Event::new(serial, kind)));
            }
        }
        Ok(None)
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<Option<Event>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.poll_event()? {
                return Ok(Some(event));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn query_toplevels(&mut self) -> Result<Vec<SurfaceId>> {
        let tree = self.conn.query_tree(self.root)?.reply()?;
        Ok(tree.children.into_iter().map(SurfaceId).collect())
    }

    fn query_parent(&mut self, window: SurfaceId) -> Result<Option<SurfaceId>> {
        match self.conn.query_tree(window.0)?.reply() {
            Ok(tree) if tree.parent != NONE => Ok(Some(SurfaceId(tree.parent))),
            Ok(_) | Err(ReplyError::X11Error(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn query_children(&mut self, window: SurfaceId) -> Result<Vec<SurfaceId>> {
        match self.conn.query_tree(window.0)?.reply() {
            Ok(tree) => Ok(tree.children.into_iter().map(SurfaceId).collect()),
            Err(ReplyError::X11Error(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn query_attributes(&mut self, window: SurfaceId) -> Result<Option<SurfaceAttributes>> {
        let cookie = self.conn.get_window_attributes(window.0)?;
        self.sent_reply(&cookie);
        let attributes = match cookie.reply() {
            Ok(reply) => reply,
            Err(ReplyError::X11Error(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let cookie = self.conn.get_geometry(window.0)?;
        self.sent_reply(&cookie);
        let geometry = match cookie.reply() {
            Ok(reply) => reply,
            Err(ReplyError::X11Error(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let class = if attributes.class == WindowClass::INPUT_ONLY {
            SurfaceClass::InputOnly
        } else {
            SurfaceClass::InputOutput
        };

        Ok(Some(SurfaceAttributes {
            geometry: Geometry {
                x: geometry.x as i32,
                y: geometry.y as i32,
                width: geometry.width as u32,
                height: geometry.height as u32,
                border_width: geometry.border_width as u32,
            },
            override_redirect: attributes.override_redirect,
            map_state: if attributes.map_state == xproto::MapState::VIEWABLE {
                MapState::Viewable
            } else {
                MapState::Unmapped
            },
            class,
            format: (class == SurfaceClass::InputOutput).then_some(PixelFormat { depth: geometry.depth }),
        }))
    }

    fn query_properties(&mut self, window: SurfaceId) -> Result<SurfaceProperties> {
        Ok(SurfaceProperties {
            opacity: self
                .cardinal(window, self.atoms._NET_WM_WINDOW_OPACITY)?
                .unwrap_or(TRANSLUCENT),
            is_shell: self.cardinal(window, self.atoms.STEAM_BIGPICTURE)?.unwrap_or(0) != 0,
            game_id: self.cardinal(window, self.atoms.STEAM_GAME)?.unwrap_or(0),
            is_overlay: self.cardinal(window, self.atoms.STEAM_OVERLAY)?.unwrap_or(0) != 0,
        })
    }

    fn query_property(&mut self, window: SurfaceId, key: PropertyKey) -> Result<Option<u32>> {
        match self.atom_for(key) {
            Some(atom) => self.cardinal(window, atom),
            None => Ok(None),
        }
    }

    fn query_global_properties(&mut self) -> Result<GlobalProperties> {
        let root = SurfaceId(self.root);
        Ok(GlobalProperties {
            games_running: self.cardinal(root, self.atoms.STEAM_GAMES_RUNNING)?.unwrap_or(0),
            screen_scale: self
                .cardinal(root, self.atoms.STEAM_SCREEN_SCALE)?
                .unwrap_or(SCREEN_SCALE_UNITY),
            screen_zoom: self
                .cardinal(root, self.atoms.STEAM_SCREEN_MAGNIFICATION)?
                .unwrap_or(SCREEN_ZOOM_UNITY),
        })
    }

    fn query_size_hints(&mut self, window: SurfaceId) -> Result<SizeHints> {
        let cookie = self.conn.get_property(
            false,
            window.0,
            AtomEnum::WM_NORMAL_HINTS,
            AtomEnum::WM_SIZE_HINTS,
            0,
            18,
        )?;
        self.sent_reply(&cookie);
        match cookie.reply() {
            Ok(reply) => {
                let raw: Vec<u32> = reply.value32().map(|v| v.collect()).unwrap_or_default();
                Ok(SizeHints::from_wm_normal_hints(&raw))
            }
            Err(ReplyError::X11Error(_)) => Ok(SizeHints::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_hidden(&mut self, window: SurfaceId, hidden: bool) -> Result<()> {
        let state: &[u32] = if hidden { &[self.atoms._NET_WM_STATE_HIDDEN] } else { &[] };
        let cookie = self.conn.change_property32(
            PropMode::REPLACE,
            window.0,
            self.atoms._NET_WM_STATE,
            AtomEnum::ATOM,
            state,
        )?;
        self.sent(&cookie);
        Ok(())
    }

    fn raise(&mut self, window: SurfaceId) -> Result<()> {
        let cookie = self
            .conn
            .configure_window(window.0, &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE))?;
        self.sent(&cookie);
        Ok(())
    }

    fn move_to(&mut self, window: SurfaceId, x: i32, y: i32) -> Result<()> {
        let cookie = self
            .conn
            .configure_window(window.0, &ConfigureWindowAux::new().x(x).y(y))?;
        self.sent(&cookie);
        Ok(())
    }

    fn resize(&mut self, window: SurfaceId, width: u32, height: u32) -> Result<()> {
        let cookie = self
            .conn
            .configure_window(window.0, &ConfigureWindowAux::new().width(width).height(height))?;
        self.sent(&cookie);
        Ok(())
    }

    fn set_input_focus(&mut self, window: SurfaceId) -> Result<()> {
        let cookie = self
            .conn
            .set_input_focus(InputFocus::POINTER_ROOT, window.0, CURRENT_TIME)?;
        self.sent(&cookie);
        Ok(())
    }

    fn select_input(&mut self, window: SurfaceId, selection: InputSelection) -> Result<()> {
        let mask = match selection {
            InputSelection::Tracked => {
                EventMask::PROPERTY_CHANGE
                    | EventMask::SUBSTRUCTURE_NOTIFY
                    | EventMask::POINTER_MOTION
                    | EventMask::LEAVE_WINDOW
            }
            InputSelection::PointerMotion => EventMask::POINTER_MOTION,
            InputSelection::None => EventMask::NO_EVENT,
        };
        let cookie = self
            .conn
            .change_window_attributes(window.0, &ChangeWindowAttributesAux::new().event_mask(mask))?;
        self.sent(&cookie);
        Ok(())
    }

    fn create_damage(&mut self, window: SurfaceId) -> Result<()> {
        let damage = self.conn.generate_id()?;
        let cookie = self.conn.damage_create(damage, window.0, ReportLevel::NON_EMPTY)?;
        self.sent(&cookie);
        self.damage_objects.insert(window, damage);
        Ok(())
    }

    fn destroy_damage(&mut self, window: SurfaceId) -> Result<()> {
        if let Some(damage) = self.damage_objects.remove(&window) {
            let cookie = self.conn.damage_destroy(damage)?;
            self.sent(&cookie);
        }
        Ok(())
    }

    fn subtract_damage(&mut self, window: SurfaceId) -> Result<()> {
        if let Some(&damage) = self.damage_objects.get(&window) {
            let cookie = self.conn.damage_subtract(damage, NONE, NONE)?;
            self.sent(&cookie);
        }
        Ok(())
    }

    fn name_buffer(&mut self, window: SurfaceId) -> Result<Option<BufferHandle>> {
        let pixmap = self.conn.generate_id()?;
        let cookie = self.conn.composite_name_window_pixmap(window.0, pixmap)?;
        self.sent(&cookie);
        Ok(Some(BufferHandle(pixmap)))
    }

    fn free_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let cookie = self.conn.free_pixmap(buffer.0)?;
        self.sent(&cookie);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Option<PixelImage>> {
        let geometry = match self.conn.get_geometry(buffer.0)?.reply() {
            Ok(reply) => reply,
            Err(ReplyError::X11Error(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let image = match self
            .conn
            .get_image(ImageFormat::Z_PIXMAP, buffer.0, 0, 0, geometry.width, geometry.height, u32::MAX)?
            .reply()
        {
            Ok(reply) => reply,
            Err(ReplyError::X11Error(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // 32 bits per pixel, BGRA in memory
        let opaque = geometry.depth != 32;
        let pixels = image
            .data
            .chunks_exact(4)
            .map(|px| {
                let argb = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
                if opaque {
                    argb | 0xff00_0000
                } else {
                    argb
                }
            })
            .collect();

        Ok(Some(PixelImage {
            width: geometry.width as u32,
            height: geometry.height as u32,
            pixels,
        }))
    }

    fn redirect(&mut self, window: SurfaceId) -> Result<()> {
        let cookie = self.conn.composite_redirect_window(window.0, Redirect::MANUAL)?;
        self.sent(&cookie);
        Ok(())
    }

    fn unredirect(&mut self, window: SurfaceId) -> Result<()> {
        let cookie = self.conn.composite_unredirect_window(window.0, Redirect::MANUAL)?;
        self.sent(&cookie);
        Ok(())
    }

    fn create_barrier(&mut self, line: BarrierLine) -> Result<BarrierId> {
        let barrier = self.conn.generate_id()?;
        let clamp = |v: i32| v.clamp(0, u16::MAX as i32) as u16;
        let cookie = self.conn.xfixes_create_pointer_barrier(
            barrier,
            self.root,
            clamp(line.x1),
            clamp(line.y1),
            clamp(line.x2),
            clamp(line.y2),
            BarrierDirections::from(0u32),
            &[],
        )?;
        self.sent(&cookie);
        Ok(BarrierId(barrier))
    }

    fn destroy_barrier(&mut self, barrier: BarrierId) -> Result<()> {
        let cookie = self.conn.xfixes_delete_pointer_barrier(barrier.0)?;
        self.sent(&cookie);
        Ok(())
    }

    fn query_pointer(&mut self) -> Result<PointerState> {
        let reply = self.conn.query_pointer(self.root)?.reply()?;
        let buttons = u16::from(KeyButMask::BUTTON1)
            | u16::from(KeyButMask::BUTTON2)
            | u16::from(KeyButMask::BUTTON3)
            | u16::from(KeyButMask::BUTTON4)
            | u16::from(KeyButMask::BUTTON5);
        Ok(PointerState {
            x: reply.root_x as i32,
            y: reply.root_y as i32,
            buttons_pressed: u16::from(reply.mask) & buttons != 0,
        })
    }

    fn warp_pointer(&mut self, window: SurfaceId, x: i32, y: i32) -> Result<()> {
        let cookie = self
            .conn
            .warp_pointer(NONE, window.0, 0, 0, 0, 0, x as i16, y as i16)?;
        self.sent(&cookie);
        Ok(())
    }

    fn show_cursor(&mut self, visible: bool) -> Result<()> {
        let cookie = if visible {
            self.conn.xfixes_show_cursor(self.root)?
        } else {
            self.conn.xfixes_hide_cursor(self.root)?
        };
        self.sent(&cookie);
        Ok(())
    }

    fn cursor_image(&mut self) -> Result<Option<CursorImage>> {
        match self.conn.xfixes_get_cursor_image()?.reply() {
            Ok(reply) => Ok(Some(CursorImage {
                width: reply.width as u32,
                height: reply.height as u32,
                hot_x: reply.xhot as u32,
                hot_y: reply.yhot as u32,
                pixels: reply.cursor_image,
            })),
            Err(ReplyError::X11Error(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.conn.flush()?;
        if self.synchronous {
            self.conn.sync()?;
        }
        Ok(())
    }
}

impl Drop for X11Display {
    fn drop(&mut self) {
        if self.owner != NONE {
            let _ = self.conn.destroy_window(self.owner);
            let _ = self.conn.flush();
        }
    }
}

/// Presents frames by uploading them to the root window in strips
struct RootSink {
    conn: Arc<RustConnection>,
    window: xproto::Window,
    gc: xproto::Gcontext,
    depth: u8,
    max_bytes: usize,
}

impl FrameSink for RootSink {
    fn submit(&mut self, frame: &Pixmap) -> Result<()> {
        let width = frame.width() as usize;
        let stride = width * 4;
        if stride == 0 {
            return Ok(());
        }

        // RGBA to BGRX
        let data: Vec<u8> = bytemuck::cast_slice::<u8, [u8; 4]>(frame.data())
            .iter()
            .flat_map(|&[r, g, b, _]| [b, g, r, 0xff])
            .collect();

        let rows_per_request = (self.max_bytes.saturating_sub(64) / stride).max(1);
        for (index, strip) in data.chunks(rows_per_request * stride).enumerate() {
            let rows = strip.len() / stride;
            self.conn
                .put_image(
                    ImageFormat::Z_PIXMAP,
                    self.window,
                    self.gc,
                    width as u16,
                    rows as u16,
                    0,
                    (index * rows_per_request) as i16,
                    0,
                    self.depth,
                    strip,
                )
                .context("Failed to upload frame")?;
        }
        self.conn.flush()?;
        Ok(())
    }
}
