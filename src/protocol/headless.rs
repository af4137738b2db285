//! In-memory display server
//!
//! `HeadlessDisplay` keeps a window tree, properties, pointer state and
//! pixel contents in memory. Scripting helpers (`create_window`,
//! `map_window`, `set_property`, ...) change that state and queue the
//! notification a real server would send; requests the compositor issues
//! are applied to the tree and appended to a log that tests inspect.
//!
//! Pointer warps move the pointer but do not synthesise motion. Stacking
//! and geometry requests report a configure only when something changed.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use log::trace;

use super::{
    BarrierId, BarrierLine, CursorImage, DisplayServer, Event, EventKind, FullscreenAction,
    GlobalProperties, InputSelection, PixelImage, PointerState, PropertyKey, SizeHints,
    SurfaceAttributes, SurfaceProperties, SCREEN_SCALE_UNITY, SCREEN_ZOOM_UNITY,
};
use crate::error::{ErrorBases, ProtocolError};
use crate::surface::{
    BufferHandle, Geometry, MapState, PixelFormat, SurfaceClass, SurfaceId, TRANSLUCENT,
};

/// Default contents of a window that was never given any
const DEFAULT_FILL: u32 = 0xff20_2020;

/// An outbound request, as logged by the headless display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SetHidden(SurfaceId, bool),
    Raise(SurfaceId),
    Move(SurfaceId, i32, i32),
    Resize(SurfaceId, u32, u32),
    SetInputFocus(SurfaceId),
    SelectInput(SurfaceId, InputSelection),
    CreateDamage(SurfaceId),
    DestroyDamage(SurfaceId),
    SubtractDamage(SurfaceId),
    NameBuffer(SurfaceId),
    FreeBuffer(BufferHandle),
    Redirect(SurfaceId),
    Unredirect(SurfaceId),
    CreateBarrier(BarrierLine),
    DestroyBarrier(BarrierId),
    WarpPointer(SurfaceId, i32, i32),
    ShowCursor(bool),
}

#[derive(Debug, Clone)]
struct Window {
    parent: Option<SurfaceId>,
    /// Bottom to top
    children: Vec<SurfaceId>,
    attributes: SurfaceAttributes,
    properties: HashMap<PropertyKey, u32>,
    size_hints: SizeHints,
    contents: Option<PixelImage>,
    redirected: bool,
    hidden: bool,
    selection: InputSelection,
}

impl Window {
    fn new(parent: Option<SurfaceId>, attributes: SurfaceAttributes) -> Self {
        Self {
            parent,
            children: Vec::new(),
            attributes,
            properties: HashMap::new(),
            size_hints: SizeHints::default(),
            contents: None,
            redirected: true,
            hidden: false,
            selection: InputSelection::None,
        }
    }

    fn image(&self) -> PixelImage {
        match &self.contents {
            Some(image) => image.clone(),
            None => {
                let (width, height) = self.attributes.geometry.outer_size();
                PixelImage::solid(width, height, DEFAULT_FILL)
            }
        }
    }
}

pub struct HeadlessDisplay {
    root: SurfaceId,
    output: (u32, u32),
    windows: HashMap<SurfaceId, Window>,
    next_window: u32,
    events: VecDeque<Event>,
    serial: u64,
    requests: Vec<Request>,
    buffers: HashMap<BufferHandle, (SurfaceId, PixelImage)>,
    next_buffer: u32,
    barriers: HashMap<BarrierId, BarrierLine>,
    next_barrier: u32,
    damage_objects: HashMap<SurfaceId, usize>,
    pointer: PointerState,
    cursor: Option<CursorImage>,
    cursor_visible: bool,
    input_focus: Option<SurfaceId>,
    error_bases: ErrorBases,
}

impl HeadlessDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        let root = SurfaceId(0x100);
        let root_window = Window::new(
            None,
            SurfaceAttributes {
                geometry: Geometry::new(0, 0, width, height),
                override_redirect: false,
                map_state: MapState::Viewable,
                class: SurfaceClass::InputOutput,
                format: Some(PixelFormat { depth: 24 }),
            },
        );

        let mut windows = HashMap::new();
        windows.insert(root, root_window);

        Self {
            root,
            output: (width, height),
            windows,
            next_window: 0x40_0001,
            events: VecDeque::new(),
            serial: 0,
            requests: Vec::new(),
            buffers: HashMap::new(),
            next_buffer: 1,
            barriers: HashMap::new(),
            next_barrier: 1,
            damage_objects: HashMap::new(),
            pointer: PointerState::default(),
            cursor: None,
            cursor_visible: true,
            input_focus: None,
            error_bases: ErrorBases::default(),
        }
    }

    pub fn with_error_bases(mut self, bases: ErrorBases) -> Self {
        self.error_bases = bases;
        self
    }

    // ----- scripting -----

    /// Create an unmapped top-level window above all others
    pub fn create_window(&mut self, geometry: Geometry, override_redirect: bool) -> SurfaceId {
        let root = self.root;
        self.create_child(root, geometry, override_redirect)
    }

    /// Create an unmapped window inside `parent`, above its siblings
    pub fn create_child(
        &mut self,
        parent: SurfaceId,
        geometry: Geometry,
        override_redirect: bool,
    ) -> SurfaceId {
        let id = SurfaceId(self.next_window);
        self.next_window += 1;

        let attributes = SurfaceAttributes {
            geometry,
            override_redirect,
            map_state: MapState::Unmapped,
            class: SurfaceClass::InputOutput,
            format: Some(PixelFormat { depth: 24 }),
        };
        self.windows.insert(id, Window::new(Some(parent), attributes));
        if let Some(p) = self.windows.get_mut(&parent) {
            p.children.push(id);
        }

        self.queue(EventKind::Create { window: id, parent });
        id
    }

    /// Change a window's class; takes effect for later attribute queries
    pub fn set_class(&mut self, window: SurfaceId, class: SurfaceClass) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.attributes.class = class;
        }
    }

    pub fn map_window(&mut self, window: SurfaceId) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.attributes.map_state = MapState::Viewable;
            self.queue(EventKind::Map { window });
        }
    }

    pub fn unmap_window(&mut self, window: SurfaceId) {
        if let Some(w) = self.windows.get_mut(&window) {
            if w.attributes.map_state == MapState::Viewable {
                w.attributes.map_state = MapState::Unmapped;
                self.queue(EventKind::Unmap { window });
            }
        }
    }

    /// Destroy a window and its whole subtree
    pub fn destroy_window(&mut self, window: SurfaceId) {
        self.unmap_window(window);

        let Some(w) = self.windows.remove(&window) else {
            return;
        };
        if let Some(parent) = w.parent.and_then(|p| self.windows.get_mut(&p)) {
            parent.children.retain(|&c| c != window);
        }
        for child in w.children {
            self.destroy_window(child);
        }
        self.damage_objects.remove(&window);
        self.queue(EventKind::Destroy { window });
    }

    /// Move a window under a new parent
    pub fn reparent_window(&mut self, window: SurfaceId, parent: SurfaceId) {
        let Some(old_parent) = self.windows.get(&window).and_then(|w| w.parent) else {
            return;
        };
        if let Some(p) = self.windows.get_mut(&old_parent) {
            p.children.retain(|&c| c != window);
        }
        if let Some(p) = self.windows.get_mut(&parent) {
            p.children.push(window);
        }
        if let Some(w) = self.windows.get_mut(&window) {
            w.parent = Some(parent);
        }
        self.queue(EventKind::Reparent { window, parent });
    }

    pub fn set_property(&mut self, window: SurfaceId, key: PropertyKey, value: u32) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.properties.insert(key, value);
            self.queue(EventKind::Property { window, key });
        }
    }

    pub fn remove_property(&mut self, window: SurfaceId, key: PropertyKey) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.properties.remove(&key);
            self.queue(EventKind::Property { window, key });
        }
    }

    /// Set a root-level property
    pub fn set_global(&mut self, key: PropertyKey, value: u32) {
        let root = self.root;
        self.set_property(root, key, value);
    }

    pub fn set_size_hints(&mut self, window: SurfaceId, hints: SizeHints) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.size_hints = hints;
            self.queue(EventKind::Property {
                window,
                key: PropertyKey::SizeHints,
            });
        }
    }

    pub fn set_contents(&mut self, window: SurfaceId, image: PixelImage) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.contents = Some(image);
        }
    }

    /// Report a damage notification for `window` (or a descendant)
    pub fn damage(&mut self, window: SurfaceId) {
        self.queue(EventKind::Damage { drawable: window });
    }

    pub fn request_fullscreen(&mut self, window: SurfaceId, action: FullscreenAction) {
        self.queue(EventKind::Fullscreen { window, action });
    }

    /// Move the pointer and report motion on `window`
    pub fn move_pointer(&mut self, window: SurfaceId, x: i32, y: i32) {
        self.pointer.x = x;
        self.pointer.y = y;
        self.queue(EventKind::Motion { window, x, y });
    }

    pub fn leave(&mut self, window: SurfaceId) {
        self.queue(EventKind::Leave { window });
    }

    pub fn set_buttons_pressed(&mut self, pressed: bool) {
        self.pointer.buttons_pressed = pressed;
    }

    pub fn set_cursor_image(&mut self, image: CursorImage) {
        self.cursor = Some(image);
        self.queue(EventKind::CursorChanged);
    }

    /// Change the output size and report it as a root configure
    pub fn set_output_size(&mut self, width: u32, height: u32) {
        self.output = (width, height);
        let root = self.root;
        let geometry = Geometry::new(0, 0, width, height);
        if let Some(w) = self.windows.get_mut(&root) {
            w.attributes.geometry = geometry;
        }
        self.queue(EventKind::Configure {
            window: root,
            geometry,
            override_redirect: false,
            above: None,
        });
    }

    pub fn inject_error(&mut self, error: ProtocolError) {
        self.events.push_back(Event::new(error.serial, EventKind::Error(error)));
    }

    pub fn push_event(&mut self, kind: EventKind) {
        self.queue(kind);
    }

    // ----- inspection -----

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn attributes_of(&self, window: SurfaceId) -> Option<SurfaceAttributes> {
        self.windows.get(&window).map(|w| w.attributes)
    }

    pub fn geometry_of(&self, window: SurfaceId) -> Option<Geometry> {
        self.windows.get(&window).map(|w| w.attributes.geometry)
    }

    pub fn is_hidden(&self, window: SurfaceId) -> bool {
        self.windows.get(&window).map(|w| w.hidden).unwrap_or(false)
    }

    pub fn is_redirected(&self, window: SurfaceId) -> bool {
        self.windows.get(&window).map(|w| w.redirected).unwrap_or(false)
    }

    pub fn selection_of(&self, window: SurfaceId) -> Option<InputSelection> {
        self.windows.get(&window).map(|w| w.selection)
    }

    /// Top-level windows, bottom to top
    pub fn stacking(&self) -> Vec<SurfaceId> {
        self.windows
            .get(&self.root)
            .map(|r| r.children.clone())
            .unwrap_or_default()
    }

    pub fn input_focus(&self) -> Option<SurfaceId> {
        self.input_focus
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn barriers(&self) -> Vec<BarrierLine> {
        let mut ids: Vec<_> = self.barriers.keys().copied().collect();
        ids.sort_by_key(|id| id.0);
        ids.iter().filter_map(|id| self.barriers.get(id).copied()).collect()
    }

    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    pub fn pointer(&self) -> PointerState {
        self.pointer
    }

    pub fn has_damage_object(&self, window: SurfaceId) -> bool {
        self.damage_objects.get(&window).copied().unwrap_or(0) > 0
    }

    // ----- internals -----

    fn queue(&mut self, kind: EventKind) {
        self.events.push_back(Event::new(self.serial, kind));
    }

    fn request(&mut self, request: Request) {
        self.serial += 1;
        trace!("headless request #{}: {:?}", self.serial, request);
        self.requests.push(request);
    }

    fn configure_notify(&mut self, window: SurfaceId) {
        let Some(w) = self.windows.get(&window) else {
            return;
        };
        let siblings = w
            .parent
            .and_then(|p| self.windows.get(&p))
            .map(|p| p.children.clone())
            .unwrap_or_default();
        let above = siblings
            .iter()
            .position(|&c| c == window)
            .and_then(|i| i.checked_sub(1))
            .map(|i| siblings[i]);

        let kind = EventKind::Configure {
            window,
            geometry: w.attributes.geometry,
            override_redirect: w.attributes.override_redirect,
            above,
        };
        self.queue(kind);
    }
}

impl DisplayServer for HeadlessDisplay {
    fn root(&self) -> SurfaceId {
        self.root
    }

    fn output_size(&self) -> (u32, u32) {
        self.output
    }

    fn next_request_serial(&self) -> u64 {
        self.serial + 1
    }

    fn error_bases(&self) -> ErrorBases {
        self.error_bases
    }

    fn poll_event(&mut self) -> Result<Option<Event>> {
        Ok(self.events.pop_front())
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if self.events.is_empty() {
            std::thread::sleep(timeout);
        }
        Ok(self.events.pop_front())
    }

    fn query_toplevels(&mut self) -> Result<Vec<SurfaceId>> {
        Ok(self.stacking())
    }

    fn query_parent(&mut self, window: SurfaceId) -> Result<Option<SurfaceId>> {
        Ok(self.windows.get(&window).and_then(|w| w.parent))
    }

    fn query_children(&mut self, window: SurfaceId) -> Result<Vec<SurfaceId>> {
        Ok(self
            .windows
            .get(&window)
            .map(|w| w.children.clone())
            .unwrap_or_default())
    }

    fn query_attributes(&mut self, window: SurfaceId) -> Result<Option<SurfaceAttributes>> {
        Ok(self.attributes_of(window))
    }

    fn query_properties(&mut self, window: SurfaceId) -> Result<SurfaceProperties> {
        let Some(w) = self.windows.get(&window) else {
            return Ok(SurfaceProperties::default());
        };
        let get = |key| w.properties.get(&key).copied();
        Ok(SurfaceProperties {
            opacity: get(PropertyKey::Opacity).unwrap_or(TRANSLUCENT),
            is_shell: get(PropertyKey::Shell).unwrap_or(0) != 0,
            game_id: get(PropertyKey::GameId).unwrap_or(0),
            is_overlay: get(PropertyKey::Overlay).unwrap_or(0) != 0,
        })
    }

    fn query_property(&mut self, window: SurfaceId, key: PropertyKey) -> Result<Option<u32>> {
        Ok(self
            .windows
            .get(&window)
            .and_then(|w| w.properties.get(&key).copied()))
    }

    fn query_global_properties(&mut self) -> Result<GlobalProperties> {
        let root = self.root;
        let get = |key| self.windows.get(&root).and_then(|w| w.properties.get(&key).copied());
        Ok(GlobalProperties {
            games_running: get(PropertyKey::GamesRunning).unwrap_or(0),
            screen_scale: get(PropertyKey::ScreenScale).unwrap_or(SCREEN_SCALE_UNITY),
            screen_zoom: get(PropertyKey::ScreenZoom).unwrap_or(SCREEN_ZOOM_UNITY),
        })
    }

    fn query_size_hints(&mut self, window: SurfaceId) -> Result<SizeHints> {
        Ok(self
            .windows
            .get(&window)
            .map(|w| w.size_hints)
            .unwrap_or_default())
    }

    fn set_hidden(&mut self, window: SurfaceId, hidden: bool) -> Result<()> {
        self.request(Request::SetHidden(window, hidden));
        if let Some(w) = self.windows.get_mut(&window) {
            w.hidden = hidden;
        }
        Ok(())
    }

    fn raise(&mut self, window: SurfaceId) -> Result<()> {
        self.request(Request::Raise(window));
        let Some(parent) = self.windows.get(&window).and_then(|w| w.parent) else {
            return Ok(());
        };
        let Some(p) = self.windows.get_mut(&parent) else {
            return Ok(());
        };
        if p.children.last() == Some(&window) {
            return Ok(());
        }
        p.children.retain(|&c| c != window);
        p.children.push(window);
        self.configure_notify(window);
        Ok(())
    }

    fn move_to(&mut self, window: SurfaceId, x: i32, y: i32) -> Result<()> {
        self.request(Request::Move(window, x, y));
        if let Some(w) = self.windows.get_mut(&window) {
            let geometry = &mut w.attributes.geometry;
            if (geometry.x, geometry.y) != (x, y) {
                geometry.x = x;
                geometry.y = y;
                self.configure_notify(window);
            }
        }
        Ok(())
    }

    fn resize(&mut self, window: SurfaceId, width: u32, height: u32) -> Result<()> {
        self.request(Request::Resize(window, width, height));
        if let Some(w) = self.windows.get_mut(&window) {
            let geometry = &mut w.attributes.geometry;
            if (geometry.width, geometry.height) != (width, height) {
                geometry.width = width;
                geometry.height = height;
                self.configure_notify(window);
            }
        }
        Ok(())
    }

    fn set_input_focus(&mut self, window: SurfaceId) -> Result<()> {
        self.request(Request::SetInputFocus(window));
        self.input_focus = Some(window);
        Ok(())
    }

    fn select_input(&mut self, window: SurfaceId, selection: InputSelection) -> Result<()> {
        self.request(Request::SelectInput(window, selection));
        if let Some(w) = self.windows.get_mut(&window) {
            w.selection = selection;
        }
        Ok(())
    }

    fn create_damage(&mut self, window: SurfaceId) -> Result<()> {
        self.request(Request::CreateDamage(window));
        *self.damage_objects.entry(window).or_default() += 1;
        Ok(())
    }

    fn destroy_damage(&mut self, window: SurfaceId) -> Result<()> {
        self.request(Request::DestroyDamage(window));
        if let Some(count) = self.damage_objects.get_mut(&window) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    fn subtract_damage(&mut self, window: SurfaceId) -> Result<()> {
        self.request(Request::SubtractDamage(window));
        Ok(())
    }

    fn name_buffer(&mut self, window: SurfaceId) -> Result<Option<BufferHandle>> {
        self.request(Request::NameBuffer(window));
        let Some(w) = self.windows.get(&window) else {
            return Ok(None);
        };
        if !w.redirected || w.attributes.map_state != MapState::Viewable {
            return Ok(None);
        }

        let handle = BufferHandle(self.next_buffer);
        self.next_buffer += 1;
        let image = w.image();
        self.buffers.insert(handle, (window, image));
        Ok(Some(handle))
    }

    fn free_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.request(Request::FreeBuffer(buffer));
        self.buffers.remove(&buffer);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Option<PixelImage>> {
        let Some((window, snapshot)) = self.buffers.get(&buffer) else {
            return Ok(None);
        };
        // A live window keeps updating its buffer; a destroyed one keeps
        // its last contents.
        Ok(Some(match self.windows.get(window) {
            Some(w) => w.image(),
            None => snapshot.clone(),
        }))
    }

    fn redirect(&mut self, window: SurfaceId) -> Result<()> {
        self.request(Request::Redirect(window));
        if let Some(w) = self.windows.get_mut(&window) {
            w.redirected = true;
        }
        Ok(())
    }

    fn unredirect(&mut self, window: SurfaceId) -> Result<()> {
        self.request(Request::Unredirect(window));
        if let Some(w) = self.windows.get_mut(&window) {
            w.redirected = false;
        }
        Ok(())
    }

    fn create_barrier(&mut self, line: BarrierLine) -> Result<BarrierId> {
        self.request(Request::CreateBarrier(line));
        let id = BarrierId(self.next_barrier);
        self.next_barrier += 1;
        self.barriers.insert(id, line);
        Ok(id)
    }

    fn destroy_barrier(&mut self, barrier: BarrierId) -> Result<()> {
        self.request(Request::DestroyBarrier(barrier));
        self.barriers.remove(&barrier);
        Ok(())
    }

    fn query_pointer(&mut self) -> Result<PointerState> {
        Ok(self.pointer)
    }

    fn warp_pointer(&mut self, window: SurfaceId, x: i32, y: i32) -> Result<()> {
        self.request(Request::WarpPointer(window, x, y));
        let (ox, oy) = self
            .windows
            .get(&window)
            .map(|w| (w.attributes.geometry.x, w.attributes.geometry.y))
            .unwrap_or((0, 0));
        self.pointer.x = ox + x;
        self.pointer.y = oy + y;
        Ok(())
    }

    fn show_cursor(&mut self, visible: bool) -> Result<()> {
        self.request(Request::ShowCursor(visible));
        self.cursor_visible = visible;
        Ok(())
    }

    fn cursor_image(&mut self) -> Result<Option<CursorImage>> {
        Ok(self.cursor.clone())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
