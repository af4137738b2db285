//! Core compositor implementation
//!
//! [`Compositor`] is the single context object every operation runs
//! against: the display connection, the renderer, the surface registry and
//! the session state (focus, overlay, scale ratios, timers). One
//! cooperative loop drains notifications, re-runs focus arbitration when
//! something relevant changed, and paints at most one frame per iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::GameCompConfig;
use crate::effects::fade::{cross_fade, FadeController, FadeState};
use crate::error::{CompositorError, ErrorBases, IgnoreList, ProtocolError};
use crate::focus::{resolve_size_hints, select_overlay};
use crate::input::{CursorManager, CursorPlacement};
use crate::protocol::{
    CirculatePlace, DisplayServer, Event, EventKind, FullscreenAction, GlobalProperties,
    InputSelection, PropertyKey,
};
use crate::renderer::painter::{debug_lines, paint_surface, DebugState, FrameRateSampler, LayerMode, ScaleContext};
use crate::renderer::resources::{self, ScanoutBypass};
use crate::renderer::{DamageOutcome, DamageTracker, DrawParams, Renderer};
use crate::surface::{Geometry, MapState, Surface, SurfaceClass, SurfaceId, SurfaceRegistry, TRANSLUCENT};

/// Longest wait for a notification while nothing is animating
pub const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Wait while a fade needs frames pushed
pub const FRAME_WAIT: Duration = Duration::from_millis(4);

/// Process-wide state shared by focus arbitration and painting
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub output: (u32, u32),

    pub focus: Option<SurfaceId>,
    pub overlay: Option<SurfaceId>,
    pub notification: Option<SurfaceId>,

    /// The focus is a game surface rather than the shell
    pub game_focused: bool,
    pub focus_needs_scale: bool,
    /// Fit ratio and letterbox offset of the focus, valid while scaled
    pub fit_ratio: f32,
    pub letterbox_offset: (f32, f32),

    pub games_running: u32,
    pub overscan_ratio: f32,
    pub zoom_ratio: f32,
    /// overscan × zoom
    pub global_ratio: f32,

    pub focus_dirty: bool,
    pub got_protocol_error: bool,
}

impl Session {
    pub fn new(output: (u32, u32)) -> Self {
        Self {
            output,
            focus: None,
            overlay: None,
            notification: None,
            game_focused: false,
            focus_needs_scale: false,
            fit_ratio: 1.0,
            letterbox_offset: (0.0, 0.0),
            games_running: 0,
            overscan_ratio: 1.0,
            zoom_ratio: 1.0,
            global_ratio: 1.0,
            focus_dirty: false,
            got_protocol_error: false,
        }
    }

    pub fn apply_globals(&mut self, globals: &GlobalProperties) {
        self.games_running = globals.games_running;
        self.overscan_ratio = globals.overscan_ratio();
        self.zoom_ratio = globals.zoom_ratio();
        self.global_ratio = self.overscan_ratio * self.zoom_ratio;
    }
}

/// The compositing engine, generic over the display connection and the
/// renderer
pub struct Compositor<D: DisplayServer, R: Renderer> {
    pub(crate) display: D,
    pub(crate) renderer: R,
    pub(crate) config: GameCompConfig,
    pub(crate) clock: Box<dyn Clock>,

    pub(crate) registry: SurfaceRegistry,
    pub(crate) session: Session,

    pub(crate) damage: DamageTracker,
    pub(crate) bypass: ScanoutBypass,
    pub(crate) fade: FadeController,
    pub(crate) cursor: CursorManager,
    pub(crate) frame_rate: FrameRateSampler,

    pub(crate) ignore: IgnoreList,
    pub(crate) error_bases: ErrorBases,
}

impl<D: DisplayServer, R: Renderer> Compositor<D, R> {
    pub fn new(display: D, renderer: R, config: GameCompConfig) -> Self {
        Self::with_clock(display, renderer, config, Box::new(SystemClock))
    }

    pub fn with_clock(display: D, renderer: R, config: GameCompConfig, clock: Box<dyn Clock>) -> Self {
        let now = clock.now();
        let output = display.output_size();
        let error_bases = display.error_bases();

        Self {
            fade: FadeController::new(config.fade.duration()),
            cursor: CursorManager::new(config.cursor.hide_timeout(), config.cursor.ignored_warps, now),
            frame_rate: FrameRateSampler::new(config.frame.fps_sample_frames, now),
            registry: SurfaceRegistry::new(),
            session: Session::new(output),
            damage: DamageTracker::new(),
            bypass: ScanoutBypass::new(),
            ignore: IgnoreList::new(),
            error_bases,
            display,
            renderer,
            config,
            clock,
        }
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn config(&self) -> &GameCompConfig {
        &self.config
    }

    pub fn registry(&self) -> &SurfaceRegistry {
        &self.registry
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.registry.get(id)
    }

    pub fn fade(&self) -> &FadeController {
        &self.fade
    }

    pub fn cursor(&self) -> &CursorManager {
        &self.cursor
    }

    pub fn bypass(&self) -> &ScanoutBypass {
        &self.bypass
    }

    /// Track the existing windows and pick the first focus
    pub fn initialize(&mut self) -> Result<()> {
        info!("🔍 Scanning existing windows...");

        let toplevels = self.display.query_toplevels()?;
        let mut below = None;
        for id in toplevels {
            let serial = self.display.next_request_serial();
            self.add_surface(id, below, serial)?;
            below = Some(id);
        }
        info!("🪟 Tracking {} windows", self.registry.len());

        self.cursor.hide_until_moved(&mut self.display)?;

        let globals = self.display.query_global_properties()?;
        self.session.apply_globals(&globals);

        self.determine_and_apply_focus()?;
        self.session.focus_dirty = false;
        self.display.flush()
    }

    /// Run until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!("🎬 Starting compositor event loop");

        while !shutdown.load(Ordering::Relaxed) {
            let timeout = if self.fade.is_active() { FRAME_WAIT } else { IDLE_WAIT };
            if let Some(event) = self.display.wait_event(timeout)? {
                self.handle_event(event)?;
            }
            self.step()?;
        }

        info!("🛑 Compositor event loop finished");
        self.release_all()
    }

    /// One loop iteration after the blocking wait: drain, arbitrate, paint
    pub fn step(&mut self) -> Result<()> {
        self.dispatch_pending()?;

        if self.session.focus_dirty {
            self.session.focus_dirty = false;
            self.determine_and_apply_focus()?;
        }

        if self.config.general.render {
            self.paint_all()?;

            let now = self.clock.now();
            let pointer = self.display.query_pointer()?;
            self.cursor.handle_buttons(&mut self.display, pointer.buttons_pressed, now)?;

            let damage_focus = self.session.focus_needs_scale && self.session.game_focused;
            let focus = self.session.focus.and_then(|id| self.registry.get_mut(id));
            if self.cursor.check_idle(&mut self.display, focus, damage_focus, now)? {
                debug!("Cursor idle, hiding it");
            }
        }

        self.display.flush()
    }

    /// Handle every notification already queued
    pub fn dispatch_pending(&mut self) -> Result<()> {
        while let Some(event) = self.display.poll_event()? {
            self.handle_event(event)?;
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        self.ignore.discard_before(event.serial);

        if self.config.general.debug_events {
            info!("📨 #{} {:?}", event.serial, event.kind);
        } else {
            trace!("event #{} {:?}", event.serial, event.kind);
        }

        let root = self.display.root();
        match event.kind {
            EventKind::Create { window, parent } => {
                if parent == root {
                    self.add_surface(window, None, event.serial)?;
                }
            }
            EventKind::Configure {
                window,
                geometry,
                override_redirect,
                above,
            } => self.configure_surface(window, geometry, override_redirect, above)?,
            EventKind::Destroy { window } => {
                if self.registry.contains(window) {
                    self.destroy_surface(window, true)?;
                }
            }
            EventKind::Map { window } => {
                if self.registry.contains(window) {
                    self.map_surface(window, event.serial)?;
                }
            }
            EventKind::Unmap { window } => {
                if self.registry.contains(window) {
                    self.unmap_surface(window)?;
                }
            }
            EventKind::Reparent { window, parent } => self.reparent_surface(window, parent, event.serial)?,
            EventKind::Circulate { window, place } => self.circulate_surface(window, place),
            EventKind::Property { window, key } => self.property_changed(window, key)?,
            EventKind::Fullscreen { window, action } => self.fullscreen_requested(window, action),
            EventKind::Leave { window } => {
                if self.session.focus == Some(window) {
                    self.cursor.handle_leave(&mut self.display, window)?;
                }
            }
            EventKind::Motion { window, x, y } => self.pointer_moved(window, x, y)?,
            EventKind::Damage { drawable } => self.surface_damaged(drawable)?,
            EventKind::CursorChanged => self.cursor.mark_image_dirty(),
            EventKind::Expose => {}
            EventKind::Error(error) => self.protocol_error(error)?,
        }
        Ok(())
    }

    /// Resolve `id` to itself or its nearest tracked ancestor
    pub fn find(&mut self, id: SurfaceId) -> Option<SurfaceId> {
        let root = self.display.root();
        let display = &mut self.display;
        self.registry
            .resolve(id, root, |window| display.query_parent(window).ok().flatten())
    }

    // ----- lifecycle -----

    fn add_surface(&mut self, id: SurfaceId, above: Option<SurfaceId>, serial: u64) -> Result<()> {
        if self.registry.contains(id) {
            debug!("{} is already tracked", id);
            return Ok(());
        }

        self.ignore.set(self.display.next_request_serial());
        let Some(attributes) = self.display.query_attributes(id)? else {
            debug!("{} vanished before it could be tracked", id);
            return Ok(());
        };

        let mut surface = Surface::new(id, &attributes);
        if attributes.class != SurfaceClass::InputOnly {
            self.display.create_damage(id)?;
            surface.has_damage_object = true;
        }

        let viewable = surface.is_mapped();
        self.registry.insert(surface, above);
        debug!("Tracking {} ({}x{})", id, attributes.geometry.width, attributes.geometry.height);

        if viewable {
            self.map_surface(id, serial)?;
        }
        self.session.focus_dirty = true;
        Ok(())
    }

    fn map_surface(&mut self, id: SurfaceId, serial: u64) -> Result<()> {
        let Some(surface) = self.registry.get_mut(id) else {
            return Ok(());
        };
        surface.map_state = MapState::Viewable;

        // Property notifications are not delivered while unmapped
        self.display.select_input(id, InputSelection::Tracked)?;
        let properties = self.display.query_properties(id)?;
        surface.apply_properties(&properties);
        resolve_size_hints(&mut self.display, surface)?;

        surface.damaged = false;
        surface.damage_sequence = 0;
        surface.map_sequence = serial;
        surface.valid_contents = false;

        debug!(
            "Mapped {} (shell: {}, game: {}, overlay: {})",
            id, surface.is_shell, surface.game_id, surface.is_overlay
        );
        self.session.focus_dirty = true;
        Ok(())
    }

    fn unmap_surface(&mut self, id: SurfaceId) -> Result<()> {
        if let Some(surface) = self.registry.get_mut(id) {
            surface.map_state = MapState::Unmapped;
        }
        self.session.focus_dirty = true;
        self.finish_unmap(id)
    }

    fn finish_unmap(&mut self, id: SurfaceId) -> Result<()> {
        if self.fade.mark_gone(id) {
            debug!("{} went away while fading out", id);
        }
        self.release_resources(id)?;

        self.ignore.set(self.display.next_request_serial());
        self.display.select_input(id, InputSelection::None)
    }

    /// Stop tracking `id`. `gone` is set when the window itself was
    /// destroyed rather than reparented away from the root.
    fn destroy_surface(&mut self, id: SurfaceId, gone: bool) -> Result<()> {
        if gone {
            for slot in [
                &mut self.session.focus,
                &mut self.session.overlay,
                &mut self.session.notification,
            ] {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        self.session.focus_dirty = true;

        if gone {
            self.finish_unmap(id)?;
        } else {
            self.release_resources(id)?;
        }

        let Some(surface) = self.registry.remove(id) else {
            return Ok(());
        };
        if surface.has_damage_object {
            self.ignore.set(self.display.next_request_serial());
            self.display.destroy_damage(id)?;
        }
        self.bypass.forget(id);
        debug!("Stopped tracking {}", id);
        Ok(())
    }

    fn configure_surface(
        &mut self,
        window: SurfaceId,
        geometry: Geometry,
        override_redirect: bool,
        above: Option<SurfaceId>,
    ) -> Result<()> {
        if window == self.display.root() {
            self.session.output = (geometry.width, geometry.height);
            info!("🖥️ Output resized to {}x{}", geometry.width, geometry.height);
            self.session.focus_dirty = true;
            return Ok(());
        }

        let shared = self.shares_snapshot_buffer(window);
        let Some(surface) = self.registry.get_mut(window) else {
            return Ok(());
        };

        let resized = (surface.geometry.width, surface.geometry.height) != (geometry.width, geometry.height);
        surface.geometry = geometry;
        surface.override_redirect = override_redirect;

        if resized && surface.buffer.is_some() {
            if shared {
                detach_resources(surface);
            } else {
                resources::drop_stale_buffer(&mut self.display, &mut self.renderer, surface)?;
            }
        }

        self.registry.restack(window, above);
        self.session.focus_dirty = true;
        Ok(())
    }

    fn circulate_surface(&mut self, window: SurfaceId, place: CirculatePlace) {
        if !self.registry.contains(window) {
            return;
        }

        let above = match place {
            CirculatePlace::OnTop => self.registry.top().map(|s| s.id),
            CirculatePlace::OnBottom => None,
        };
        if above == Some(window) {
            return;
        }
        if self.registry.restack(window, above) {
            self.session.focus_dirty = true;
        }
    }

    fn reparent_surface(&mut self, window: SurfaceId, parent: SurfaceId, serial: u64) -> Result<()> {
        if parent == self.display.root() {
            return self.add_surface(window, None, serial);
        }

        if self.registry.contains(window) {
            return self.destroy_surface(window, false);
        }

        // Something moved into a tracked window: the fullscreen wrapper
        // check may apply now
        if let Some(ancestor) = self.find(parent) {
            if let Some(surface) = self.registry.get_mut(ancestor) {
                resolve_size_hints(&mut self.display, surface)?;
            }
            self.session.focus_dirty = true;
        }
        Ok(())
    }

    // ----- properties and input -----

    fn property_changed(&mut self, window: SurfaceId, key: PropertyKey) -> Result<()> {
        match key {
            PropertyKey::Opacity => self.opacity_changed(window),
            PropertyKey::Shell | PropertyKey::GameId | PropertyKey::Overlay | PropertyKey::SizeHints => {
                let Some(id) = self.find(window) else {
                    return Ok(());
                };
                let value = match key {
                    PropertyKey::SizeHints => None,
                    _ => Some(self.display.query_property(id, key)?.unwrap_or(0)),
                };

                let mut release = false;
                if let Some(surface) = self.registry.get_mut(id) {
                    match (key, value) {
                        (PropertyKey::Shell, Some(v)) => surface.is_shell = v != 0,
                        (PropertyKey::GameId, Some(v)) => surface.game_id = v,
                        (PropertyKey::Overlay, Some(v)) => {
                            surface.is_overlay = v != 0;
                            // Overlays need an alpha-capable texture
                            release = surface.is_overlay && surface.has_resources();
                        }
                        _ => resolve_size_hints(&mut self.display, surface)?,
                    }
                }
                if release {
                    self.release_resources(id)?;
                }
                self.session.focus_dirty = true;
                Ok(())
            }
            PropertyKey::GamesRunning | PropertyKey::ScreenScale | PropertyKey::ScreenZoom => {
                let globals = self.display.query_global_properties()?;
                self.session.apply_globals(&globals);

                if key != PropertyKey::GamesRunning {
                    debug!(
                        "Scale now {:.3} (overscan {:.3}, zoom {:.3})",
                        self.session.global_ratio, self.session.overscan_ratio, self.session.zoom_ratio
                    );
                    if let Some(focus) = self.session.focus.and_then(|id| self.registry.get_mut(id)) {
                        focus.damaged = true;
                    }
                }
                self.session.focus_dirty = true;
                Ok(())
            }
            PropertyKey::Other(_) => Ok(()),
        }
    }

    fn opacity_changed(&mut self, window: SurfaceId) -> Result<()> {
        let Some(id) = self.find(window) else {
            return Ok(());
        };
        if !self.registry.get(id).is_some_and(|s| s.is_overlay) {
            return Ok(());
        }

        let opacity = self
            .display
            .query_property(id, PropertyKey::Opacity)?
            .unwrap_or(TRANSLUCENT);

        if let Some(surface) = self.registry.get_mut(id) {
            if surface.opacity != opacity {
                surface.damaged = true;
                surface.opacity = opacity;
            }
        }

        // A visible overlay must be composited over the game
        if opacity != TRANSLUCENT {
            self.reverse_bypass()?;
        }

        self.set_surface_hidden(id, opacity == TRANSLUCENT)?;

        if let Some(overlay) = select_overlay(&self.registry, self.config.focus.overlay_reference_width) {
            self.session.overlay = Some(overlay);
        }
        Ok(())
    }

    fn fullscreen_requested(&mut self, window: SurfaceId, action: FullscreenAction) {
        let Some(id) = self.find(window) else {
            return;
        };
        if let Some(surface) = self.registry.get_mut(id) {
            surface.is_fullscreen = action.apply(surface.is_fullscreen);
            debug!("{} fullscreen: {}", id, surface.is_fullscreen);
            self.session.focus_dirty = true;
        }
    }

    fn pointer_moved(&mut self, window: SurfaceId, x: i32, y: i32) -> Result<()> {
        let Some(focus) = self.session.focus else {
            return Ok(());
        };
        if self.find(window) != Some(focus) {
            return Ok(());
        }

        let now = self.clock.now();
        let damage_focus = self.session.focus_needs_scale && self.session.game_focused;
        self.cursor.handle_motion(
            &mut self.display,
            x,
            y,
            self.registry.get_mut(focus),
            damage_focus,
            now,
        )?;
        Ok(())
    }

    fn surface_damaged(&mut self, drawable: SurfaceId) -> Result<()> {
        let Some(id) = self.find(drawable) else {
            return Ok(());
        };

        let focus = self
            .session
            .focus
            .and_then(|f| self.registry.get(f))
            .map(|s| (s.id, s.damage_sequence));
        let Some(surface) = self.registry.get_mut(id) else {
            return Ok(());
        };

        match self.damage.record(surface, focus) {
            DamageOutcome::Ignored => {}
            DamageOutcome::Recorded { focus_dirty } => {
                if focus_dirty {
                    self.session.focus_dirty = true;
                }
                if surface.has_damage_object {
                    self.display.subtract_damage(id)?;
                }
            }
        }
        Ok(())
    }

    fn protocol_error(&mut self, error: ProtocolError) -> Result<()> {
        if self.ignore.should_ignore(error.serial) {
            trace!("Ignoring expected error for request #{}", error.serial);
            return Ok(());
        }

        let name = error.describe(&self.error_bases);
        if error.redirect_conflict {
            return Err(CompositorError::AnotherCompositor(name).into());
        }

        warn!(
            "⚠️ Protocol error {} (request {}.{}, serial {})",
            name, error.request_code, error.minor_code, error.serial
        );
        self.session.got_protocol_error = true;
        Ok(())
    }

    // ----- painting -----

    /// Composite and present one frame if anything changed
    pub(crate) fn paint_all(&mut self) -> Result<()> {
        let now = self.clock.now();

        if let Some(bypassed) = self.bypass.active() {
            if self.bypass_still_valid(bypassed) {
                return Ok(());
            }
            self.reverse_bypass()?;
        }

        let Some(focus_id) = self.session.focus else {
            return Ok(());
        };
        let games_running = self.session.games_running > 0;

        let overlay_damaged = games_running
            && [self.session.overlay, self.session.notification]
                .into_iter()
                .flatten()
                .any(|id| self.registry.get(id).is_some_and(|s| s.damaged));

        let Some(focus) = self.registry.get_mut(focus_id) else {
            return Ok(());
        };
        if !focus.damaged && !overlay_damaged && !self.fade.is_active() {
            return Ok(());
        }
        focus.damaged = false;

        if let Some(rate) = self.frame_rate.tick(now) {
            trace!("Compositing at {:.1} FPS", rate);
        }

        self.prepare_layer(focus_id)?;
        if games_running {
            for id in [self.session.overlay, self.session.notification].into_iter().flatten() {
                self.prepare_layer(id)?;
            }
        }
        if let Some(snapshot) = self.fade.snapshot_mut() {
            resources::refresh(&mut self.display, &mut self.renderer, snapshot)?;
        }

        let output = self.session.output;
        self.renderer.begin_frame(output.0, output.1)?;

        let ctx = ScaleContext {
            output,
            global_ratio: self.session.global_ratio,
            zoom_ratio: self.session.zoom_ratio,
            cursor: self.cursor.position(),
        };
        let mut can_bypass = true;

        match self.fade.state(now) {
            FadeState::Fading { progress } => {
                let (outgoing, incoming) = cross_fade(progress);
                if let Some(snapshot) = self.fade.snapshot() {
                    paint_surface(&mut self.renderer, snapshot, &ctx, DrawParams::blended(outgoing), LayerMode::Normal);
                }
                if let Some(focus) = self.registry.get(focus_id) {
                    paint_surface(&mut self.renderer, focus, &ctx, DrawParams::blended(incoming), LayerMode::Normal);
                }
                can_bypass = false;
            }
            state => {
                let params = if state == FadeState::Done {
                    DrawParams::blended(1.0)
                } else {
                    DrawParams::replace()
                };
                if let Some(focus) = self.registry.get(focus_id) {
                    paint_surface(&mut self.renderer, focus, &ctx, params, LayerMode::Normal);
                }
                if self.session.focus_needs_scale {
                    can_bypass = false;
                }
                if state == FadeState::Done {
                    self.finish_fade()?;
                }
            }
        }

        let overlay_size = self
            .session
            .overlay
            .and_then(|id| self.registry.get(id))
            .map(|s| (s.geometry.width, s.geometry.height));

        if games_running {
            // The notification is sized against the main overlay and has no placement without one
            let layers = [
                (self.session.overlay, Some(LayerMode::Normal)),
                (
                    self.session.notification,
                    overlay_size.map(|overlay| LayerMode::Notification { overlay }),
                ),
            ];
            for (id, mode) in layers {
                let Some(layer) = id.and_then(|id| self.registry.get_mut(id)) else {
                    continue;
                };
                if layer.opacity != TRANSLUCENT {
                    if let Some(mode) = mode {
                        let params = DrawParams::blended(layer.opacity_fraction());
                        paint_surface(&mut self.renderer, layer, &ctx, params, mode);
                    }
                    can_bypass = false;
                }
                layer.damaged = false;
            }
        }

        if self.session.focus_needs_scale && self.session.game_focused {
            if !self.cursor.hidden_for_movement() {
                let placement = CursorPlacement {
                    output,
                    fit_ratio: self.session.fit_ratio,
                    offset: self.session.letterbox_offset,
                    global_ratio: self.session.global_ratio,
                    zoom_ratio: self.session.zoom_ratio,
                    overlay: overlay_size,
                };
                if let Some(focus) = self.registry.get_mut(focus_id) {
                    self.cursor
                        .draw_software_cursor(&mut self.display, &mut self.renderer, focus, &placement, now)?;
                }
            }
            can_bypass = false;
        }

        if self.config.general.debug_overlay {
            let lines = debug_lines(&self.debug_state());
            self.renderer.draw_debug_text(&lines);
        }

        self.renderer.present()?;
        if let Some(error) = self.renderer.take_error() {
            return Err(CompositorError::Renderer(error).into());
        }

        if self.config.general.allow_unredirect && can_bypass {
            if let Some(focus) = self.registry.get_mut(focus_id) {
                self.bypass.engage(&mut self.display, &mut self.renderer, focus)?;
            }
        }
        Ok(())
    }

    /// Bind resources for a layer and pull in its current contents
    fn prepare_layer(&mut self, id: SurfaceId) -> Result<()> {
        let Some(surface) = self.registry.get_mut(id) else {
            return Ok(());
        };
        resources::ensure(&mut self.display, &mut self.renderer, surface)?;
        resources::refresh(&mut self.display, &mut self.renderer, surface)?;
        Ok(())
    }

    fn finish_fade(&mut self) -> Result<()> {
        let Some(finished) = self.fade.finish() else {
            return Ok(());
        };
        let mut snapshot = finished.snapshot;

        let live_shares = self
            .registry
            .get(snapshot.id)
            .is_some_and(|live| live.buffer.is_some() && live.buffer == snapshot.buffer);

        // Sole owner of the buffer and texture now
        if finished.surface_gone || !live_shares {
            resources::teardown(&mut self.display, &mut self.renderer, &mut snapshot)?;
        }

        if self.session.focus != Some(snapshot.id) {
            self.set_surface_hidden(snapshot.id, true)?;
        }
        debug!("Fade out of {} complete", snapshot.id);
        Ok(())
    }

    fn bypass_still_valid(&self, bypassed: SurfaceId) -> bool {
        let visible_overlay = self.session.games_running > 0
            && [self.session.overlay, self.session.notification]
                .into_iter()
                .flatten()
                .any(|id| self.registry.get(id).is_some_and(|s| s.opacity != TRANSLUCENT));

        self.session.focus == Some(bypassed)
            && !self.session.focus_needs_scale
            && !self.fade.is_active()
            && !visible_overlay
    }

    fn reverse_bypass(&mut self) -> Result<()> {
        if let Some(id) = self.bypass.reverse(&mut self.display, &mut self.renderer, &mut self.registry)? {
            if let Some(surface) = self.registry.get_mut(id) {
                surface.damaged = true;
            }
        }
        Ok(())
    }

    fn debug_state(&self) -> DebugState {
        let games_running = self.session.games_running > 0;
        let visible_opacity = |id: Option<SurfaceId>| {
            id.and_then(|id| self.registry.get(id))
                .filter(|s| games_running && s.opacity != TRANSLUCENT)
                .map(|s| s.opacity_fraction())
        };

        DebugState {
            frame_rate: self.frame_rate.rate(),
            focus: self
                .session
                .focus
                .map(|id| (id.to_string(), self.session.game_focused)),
            overlay_opacity: visible_opacity(self.session.overlay),
            notification_opacity: visible_opacity(self.session.notification),
            scaling: self.session.focus_needs_scale,
            protocol_error: self.session.got_protocol_error,
        }
    }

    // ----- resources -----

    /// The fade snapshot was taken from `id` and still shares its buffer
    fn shares_snapshot_buffer(&self, id: SurfaceId) -> bool {
        match (self.fade.snapshot(), self.registry.get(id)) {
            (Some(snapshot), Some(live)) => {
                snapshot.id == id && live.buffer.is_some() && snapshot.buffer == live.buffer
            }
            _ => false,
        }
    }

    /// Drop a surface's compositing resources. Handles shared with the
    /// fade snapshot are left to it.
    fn release_resources(&mut self, id: SurfaceId) -> Result<()> {
        let shared = self.shares_snapshot_buffer(id);
        let Some(surface) = self.registry.get_mut(id) else {
            return Ok(());
        };

        if shared {
            detach_resources(surface);
            surface.damaged = false;
            surface.valid_contents = false;
            Ok(())
        } else {
            resources::teardown(&mut self.display, &mut self.renderer, surface)
        }
    }

    pub(crate) fn set_surface_hidden(&mut self, id: SurfaceId, hidden: bool) -> Result<()> {
        let Some(surface) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if surface.hidden == hidden {
            return Ok(());
        }
        surface.hidden = hidden;
        self.display.set_hidden(id, hidden)
    }

    /// Free every resource the compositor holds
    fn release_all(&mut self) -> Result<()> {
        if let Some(finished) = self.fade.finish() {
            let mut snapshot = finished.snapshot;
            let live_shares = self
                .registry
                .get(snapshot.id)
                .is_some_and(|live| live.buffer.is_some() && live.buffer == snapshot.buffer);
            if !live_shares {
                resources::teardown(&mut self.display, &mut self.renderer, &mut snapshot)?;
            }
        }

        for surface in self.registry.iter_mut() {
            resources::teardown(&mut self.display, &mut self.renderer, surface)?;
        }
        self.cursor.release(&mut self.renderer);
        self.display.flush()
    }
}

/// Forget buffer and texture handles without freeing them
fn detach_resources(surface: &mut Surface) {
    surface.buffer = None;
    surface.texture = None;
    surface.upload_pending = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::headless::{HeadlessDisplay, Request};
    use crate::renderer::SoftwareRenderer;

    fn compositor(display: HeadlessDisplay) -> (Compositor<HeadlessDisplay, SoftwareRenderer>, ManualClock) {
        let clock = ManualClock::new();
        let mut compositor = Compositor::with_clock(
            display,
            SoftwareRenderer::new(),
            GameCompConfig::default(),
            Box::new(clock.clone()),
        );
        compositor.initialize().unwrap();
        (compositor, clock)
    }

    #[test]
    fn test_startup_scan_keeps_stacking_order() {
        let mut display = HeadlessDisplay::new(1920, 1080);
        let bottom = display.create_window(Geometry::new(0, 0, 100, 100), false);
        let top = display.create_window(Geometry::new(0, 0, 100, 100), false);
        while display.poll_event().unwrap().is_some() {}

        let (compositor, _) = compositor(display);
        assert_eq!(compositor.registry().ids(), vec![top, bottom]);
    }

    #[test]
    fn test_create_and_destroy_track_one_entry() {
        let (mut compositor, _) = compositor(HeadlessDisplay::new(1920, 1080));
        let id = compositor.display_mut().create_window(Geometry::new(0, 0, 100, 100), false);
        compositor.step().unwrap();
        assert_eq!(compositor.registry().len(), 1);
        assert!(compositor.display().has_damage_object(id));

        compositor.display_mut().destroy_window(id);
        compositor.step().unwrap();
        assert!(compositor.registry().is_empty());
        assert!(!compositor.display().has_damage_object(id));
    }

    #[test]
    fn test_input_only_windows_get_no_damage_object() {
        let mut display = HeadlessDisplay::new(1920, 1080);
        let id = display.create_window(Geometry::new(0, 0, 10, 10), false);
        display.set_class(id, SurfaceClass::InputOnly);
        while display.poll_event().unwrap().is_some() {}

        let (compositor, _) = compositor(display);
        assert!(compositor.surface(id).is_some());
        assert!(!compositor.display().has_damage_object(id));
    }

    #[test]
    fn test_descendant_events_resolve_to_toplevel() {
        let (mut compositor, _) = compositor(HeadlessDisplay::new(1920, 1080));
        let display = compositor.display_mut();
        let top = display.create_window(Geometry::new(0, 0, 100, 100), false);
        let child = display.create_child(top, Geometry::new(0, 0, 50, 50), false);
        let grandchild = display.create_child(child, Geometry::new(0, 0, 10, 10), false);
        compositor.step().unwrap();

        assert_eq!(compositor.find(grandchild), Some(top));
        assert_eq!(compositor.find(SurfaceId(0xdead)), None);
    }

    #[test]
    fn test_circulate_to_top_when_already_top_is_a_noop() {
        let (mut compositor, _) = compositor(HeadlessDisplay::new(1920, 1080));
        let a = compositor.display_mut().create_window(Geometry::new(0, 0, 10, 10), false);
        let b = compositor.display_mut().create_window(Geometry::new(0, 0, 10, 10), false);
        compositor.step().unwrap();
        assert_eq!(compositor.registry().ids(), vec![b, a]);

        compositor.display_mut().push_event(EventKind::Circulate {
            window: b,
            place: CirculatePlace::OnTop,
        });
        compositor.step().unwrap();
        assert_eq!(compositor.registry().ids(), vec![b, a]);

        compositor.display_mut().push_event(EventKind::Circulate {
            window: b,
            place: CirculatePlace::OnBottom,
        });
        compositor.step().unwrap();
        assert_eq!(compositor.registry().ids(), vec![a, b]);
    }

    #[test]
    fn test_root_configure_updates_output() {
        let (mut compositor, _) = compositor(HeadlessDisplay::new(1920, 1080));
        compositor.display_mut().set_output_size(2560, 1440);
        compositor.step().unwrap();
        assert_eq!(compositor.session().output, (2560, 1440));
    }

    #[test]
    fn test_ignored_errors_are_swallowed() {
        let (mut compositor, _) = compositor(HeadlessDisplay::new(1920, 1080));
        let id = compositor.display_mut().create_window(Geometry::new(0, 0, 10, 10), false);
        compositor.display_mut().map_window(id);
        compositor.step().unwrap();

        // Deselecting input on an unmapped window is expected to fail
        compositor.display_mut().unmap_window(id);
        compositor.dispatch_pending().unwrap();
        assert_eq!(
            compositor.display().requests().last(),
            Some(&Request::SelectInput(id, InputSelection::None))
        );

        let serial = compositor.display().next_request_serial() - 1;
        compositor.display_mut().inject_error(ProtocolError {
            serial,
            error_code: 3,
            request_code: 25,
            minor_code: 0,
            generic_text: "BadWindow".to_string(),
            redirect_conflict: false,
        });
        compositor.dispatch_pending().unwrap();
        assert!(!compositor.session().got_protocol_error);
    }

    #[test]
    fn test_unexpected_errors_are_flagged_not_fatal() {
        let (mut compositor, _) = compositor(HeadlessDisplay::new(1920, 1080));
        compositor.display_mut().inject_error(ProtocolError {
            serial: 999,
            error_code: 3,
            request_code: 12,
            minor_code: 0,
            generic_text: "BadWindow".to_string(),
            redirect_conflict: false,
        });
        compositor.step().unwrap();
        assert!(compositor.session().got_protocol_error);
    }

    #[test]
    fn test_redirect_conflict_is_fatal() {
        let (mut compositor, _) = compositor(HeadlessDisplay::new(1920, 1080));
        compositor.display_mut().inject_error(ProtocolError {
            serial: 999,
            error_code: 10,
            request_code: 142,
            minor_code: 2,
            generic_text: "BadAccess".to_string(),
            redirect_conflict: true,
        });

        let err = compositor.step().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompositorError>(),
            Some(CompositorError::AnotherCompositor(_))
        ));
    }

    #[test]
    fn test_globals_combine_into_global_ratio() {
        let mut session = Session::new((1920, 1080));
        session.apply_globals(&GlobalProperties {
            games_running: 1,
            screen_scale: u32::MAX / 2,
            screen_zoom: 0xffff,
        });
        assert!((session.global_ratio - 0.5).abs() < 1e-3);
        assert_eq!(session.games_running, 1);
    }
}
