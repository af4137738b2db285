//! Focus arbitration
//!
//! A single pass over the registry decides which surface receives focus,
//! which overlay is the main overlay and which is the notification. The
//! compositor then applies the result to the display: stacking, input
//! focus, placement, size and pointer confinement.

use std::collections::VecDeque;

use anyhow::Result;
use log::{debug, info};

use crate::compositor::Compositor;
use crate::input::Confinement;
use crate::protocol::{DisplayServer, InputSelection};
use crate::renderer::painter::{fit_ratio, letterbox_offset, needs_scale};
use crate::renderer::resources;
use crate::renderer::Renderer;
use crate::surface::{Surface, SurfaceId, SurfaceRegistry};

/// Outcome of one arbitration pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    pub focus: Option<SurfaceId>,
    /// The focus is a game surface rather than the shell
    pub game_focused: bool,
    /// Only set when an overlay of the reference width exists
    pub overlay: Option<SurfaceId>,
    /// Only set when an overlay of another width exists
    pub notification: Option<SurfaceId>,
}

/// Pick the focus, overlay and notification surfaces.
///
/// The shell is the fallback. Among eligible game surfaces the most
/// recently damaged one wins, later entries winning ties. An override
/// surface can win only while no other override surface has been picked,
/// and never against a non-override surface with the same sequence.
pub fn select(registry: &SurfaceRegistry, reference_width: u32) -> Selection {
    let mut selection = Selection::default();
    let mut max_sequence = 0;
    let mut using_override = false;
    let mut plain_sequence = None;
    let mut max_opacity = 0;

    for surface in registry.iter() {
        if surface.is_shell && !selection.game_focused {
            selection.focus = Some(surface.id);
        }

        if surface.is_focusable_game() && surface.damage_sequence >= max_sequence {
            let is_override = surface.effective_override();
            let loses_tie = plain_sequence == Some(surface.damage_sequence);

            if !is_override || !(using_override || loses_tie) {
                selection.focus = Some(surface.id);
                selection.game_focused = true;
                max_sequence = surface.damage_sequence;

                if is_override {
                    using_override = true;
                } else {
                    plain_sequence = Some(surface.damage_sequence);
                }
            }
        }

        if surface.is_overlay {
            if surface.geometry.width == reference_width && surface.opacity >= max_opacity {
                selection.overlay = Some(surface.id);
                max_opacity = surface.opacity;
            } else {
                selection.notification = Some(surface.id);
            }
        }
    }

    selection
}

/// Main overlay among the tracked overlays, by reference width and opacity
pub fn select_overlay(registry: &SurfaceRegistry, reference_width: u32) -> Option<SurfaceId> {
    let mut overlay = None;
    let mut max_opacity = 0;
    for surface in registry.iter().filter(|s| s.is_overlay) {
        if surface.geometry.width == reference_width && surface.opacity >= max_opacity {
            overlay = Some(surface.id);
            max_opacity = surface.opacity;
        }
    }
    overlay
}

/// Work out the size `surface` wants to be presented at.
///
/// Equal minimum and maximum size hints give a fixed size. Failing that,
/// an override surface wrapping exactly one non-override child that fits
/// inside it is treated as a fullscreen wrapper: the child's size is the
/// requested size, the child is moved to the wrapper's origin and the
/// wrapper's override flag stops counting for focus.
pub fn resolve_size_hints<D: DisplayServer + ?Sized>(display: &mut D, surface: &mut Surface) -> Result<()> {
    let hints = display.query_size_hints(surface.id)?;
    if let Some(size) = Surface::fixed_size_from_hints(&hints) {
        surface.requested_size = Some(size);
        return Ok(());
    }

    surface.requested_size = None;
    if !surface.override_redirect {
        return Ok(());
    }

    let children = display.query_children(surface.id)?;
    let [child] = children.as_slice() else {
        return Ok(());
    };
    let Some(attributes) = display.query_attributes(*child)? else {
        return Ok(());
    };

    let inner = attributes.geometry;
    if !attributes.override_redirect
        && inner.width <= surface.geometry.width
        && inner.height <= surface.geometry.height
    {
        debug!(
            "{} wraps {} ({}x{}), treating it as fullscreen content",
            surface.id, child, inner.width, inner.height
        );
        surface.requested_size = Some((inner.width, inner.height));
        display.move_to(*child, 0, 0)?;
        surface.ignore_override_redirect = true;
    }
    Ok(())
}

impl<D: DisplayServer, R: Renderer> Compositor<D, R> {
    /// Re-run arbitration and apply the new focus
    pub(crate) fn determine_and_apply_focus(&mut self) -> Result<()> {
        if let Some(id) = self.bypass.reverse(&mut self.display, &mut self.renderer, &mut self.registry)? {
            if let Some(surface) = self.registry.get_mut(id) {
                surface.damaged = true;
            }
        }

        let selection = select(&self.registry, self.config.focus.overlay_reference_width);
        if selection.overlay.is_some() {
            self.session.overlay = selection.overlay;
        }
        if selection.notification.is_some() {
            self.session.notification = selection.notification;
        }
        self.session.game_focused = selection.game_focused;

        let Some(focus_id) = selection.focus else {
            if self.session.focus.take().is_some() {
                debug!("No surface to focus");
            }
            self.session.focus_needs_scale = false;
            return Ok(());
        };

        let previous = self.session.focus;
        if let Some(previous_id) = previous.filter(|&id| id != focus_id) {
            self.start_focus_transition(previous_id)?;
            info!("🎯 Focus {} -> {}", previous_id, focus_id);
        } else if previous.is_none() {
            info!("🎯 Focus -> {}", focus_id);
        }

        self.session.focus = Some(focus_id);
        self.set_surface_hidden(focus_id, false)?;

        let Some(focus) = self.registry.get(focus_id) else {
            return Ok(());
        };
        let geometry = focus.geometry;
        let is_fullscreen = focus.is_fullscreen;
        let requested_size = focus.requested_size;
        let nudged = focus.nudged;

        let output = self.session.output;
        let size = (geometry.width, geometry.height);
        let scaled = needs_scale(output, size, self.session.global_ratio);
        self.session.focus_needs_scale = scaled;
        if scaled {
            self.session.fit_ratio = fit_ratio(output, size);
            self.session.letterbox_offset = letterbox_offset(output, size, self.session.global_ratio);
        } else {
            self.session.fit_ratio = 1.0;
            self.session.letterbox_offset = (0.0, 0.0);
        }

        self.cursor.update_barriers(
            &mut self.display,
            &Confinement {
                focus: focus_id,
                geometry,
                output,
                needs_scale: scaled,
                game_focused: selection.game_focused,
                render_enabled: self.config.general.render,
            },
        )?;

        let on_top = self.registry.top().map(|s| s.id) == Some(focus_id);
        if selection.game_focused || (self.session.games_running == 0 && !on_top) {
            self.display.raise(focus_id)?;
        }

        self.display.set_input_focus(focus_id)?;

        // Some clients ignore the first move to the origin
        if !nudged {
            self.display.move_to(focus_id, 1, 1)?;
            if let Some(surface) = self.registry.get_mut(focus_id) {
                surface.nudged = true;
            }
            self.display.move_to(focus_id, 0, 0)?;
        } else if !geometry.is_at_origin() {
            self.display.move_to(focus_id, 0, 0)?;
        }

        if is_fullscreen && scaled {
            self.display.resize(focus_id, output.0, output.1)?;
        } else if !is_fullscreen {
            if let Some((width, height)) = requested_size.filter(|&requested| requested != size) {
                self.display.resize(focus_id, width, height)?;
            }
        }

        self.select_descendant_motion(focus_id)
    }

    /// Fade out the outgoing focus, or hide it outright when a fade is
    /// already running
    fn start_focus_transition(&mut self, previous: SurfaceId) -> Result<()> {
        if self.fade.is_active() {
            return self.set_surface_hidden(previous, true);
        }

        let now = self.clock.now();
        if let Some(surface) = self.registry.get_mut(previous) {
            resources::ensure(&mut self.display, &mut self.renderer, surface)?;
            self.fade.begin(surface.clone(), now);
        }
        Ok(())
    }

    /// Pointer motion from anywhere inside the focus reaches us
    fn select_descendant_motion(&mut self, focus: SurfaceId) -> Result<()> {
        let mut queue: VecDeque<SurfaceId> = self.display.query_children(focus)?.into();
        while let Some(child) = queue.pop_front() {
            self.display.select_input(child, InputSelection::PointerMotion)?;
            queue.extend(self.display.query_children(child)?);
        }
        Ok(())
    }
}
