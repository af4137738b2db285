//! Cross-fade between the outgoing and incoming focus
//!
//! The controller owns an independent copy of the outgoing surface taken
//! when the fade starts. The live record may change or be destroyed during
//! the fade; the copy keeps its buffer and texture handles so it can still
//! be drawn, and is the last owner of them once the live surface is gone.

use std::time::{Duration, Instant};

use log::debug;

use crate::surface::{Surface, SurfaceId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FadeState {
    Idle,
    /// Blend in progress, `progress` in [0, 1)
    Fading { progress: f32 },
    /// Duration elapsed, waiting for [`FadeController::finish`]
    Done,
}

/// The outgoing surface handed back when a fade finishes
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedFade {
    pub snapshot: Surface,
    /// The live surface was unmapped or destroyed during the fade; the
    /// snapshot's resources must be released by the caller
    pub surface_gone: bool,
}

#[derive(Debug, Clone)]
pub struct FadeController {
    duration: Duration,
    snapshot: Option<Surface>,
    started: Option<Instant>,
    surface_gone: bool,
}

impl FadeController {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            snapshot: None,
            started: None,
            surface_gone: false,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// A snapshot is held, whether or not its duration has elapsed
    pub fn is_active(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Start fading out `outgoing`. Ignored while another fade is active.
    pub fn begin(&mut self, outgoing: Surface, now: Instant) -> bool {
        if self.is_active() {
            return false;
        }
        debug!("Fading out {} over {:?}", outgoing.id, self.duration);
        self.snapshot = Some(outgoing);
        self.started = Some(now);
        self.surface_gone = false;
        true
    }

    pub fn state(&self, now: Instant) -> FadeState {
        match (&self.snapshot, self.started) {
            (Some(_), Some(started)) => {
                let elapsed = now.saturating_duration_since(started);
                if elapsed >= self.duration {
                    FadeState::Done
                } else {
                    FadeState::Fading {
                        progress: progress(elapsed, self.duration),
                    }
                }
            }
            _ => FadeState::Idle,
        }
    }

    pub fn snapshot(&self) -> Option<&Surface> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_mut(&mut self) -> Option<&mut Surface> {
        self.snapshot.as_mut()
    }

    /// Whether the snapshot was taken from `id`
    pub fn holds(&self, id: SurfaceId) -> bool {
        self.snapshot.as_ref().map(|s| s.id) == Some(id)
    }

    /// Record that the live surface behind the snapshot went away
    pub fn mark_gone(&mut self, id: SurfaceId) -> bool {
        if self.holds(id) {
            self.surface_gone = true;
            true
        } else {
            false
        }
    }

    /// End the fade and hand back the snapshot
    pub fn finish(&mut self) -> Option<FinishedFade> {
        self.started = None;
        let snapshot = self.snapshot.take()?;
        let surface_gone = std::mem::take(&mut self.surface_gone);
        debug!("Fade of {} finished (gone: {})", snapshot.id, surface_gone);
        Some(FinishedFade {
            snapshot,
            surface_gone,
        })
    }
}

/// Linear progress `elapsed / duration`, clamped to [0, 1]
pub fn progress(elapsed: Duration, duration: Duration) -> f32 {
    if duration.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0) as f32
}

/// Opacities of the outgoing and incoming layers at `t`
pub fn cross_fade(t: f32) -> (f32, f32) {
    let t = t.clamp(0.0, 1.0);
    (1.0 - t, t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SurfaceAttributes;
    use crate::surface::{Geometry, MapState, SurfaceClass, OPAQUE};

    fn surface(id: u32) -> Surface {
        Surface::new(
            SurfaceId(id),
            &SurfaceAttributes {
                geometry: Geometry::new(0, 0, 64, 64),
                override_redirect: false,
                map_state: MapState::Viewable,
                class: SurfaceClass::InputOutput,
                format: None,
            },
        )
    }

    #[test]
    fn test_halfway_opacities() {
        let t = progress(Duration::from_millis(100), Duration::from_millis(200));
        let (out, incoming) = cross_fade(t);

        let outgoing_value = (out as f64 * OPAQUE as f64) as u32;
        assert!(outgoing_value.abs_diff(OPAQUE / 2) <= 1);
        assert!((incoming - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_state_transitions() {
        let start = Instant::now();
        let mut fade = FadeController::new(Duration::from_millis(200));
        assert_eq!(fade.state(start), FadeState::Idle);

        assert!(fade.begin(surface(1), start));
        assert!(matches!(
            fade.state(start + Duration::from_millis(50)),
            FadeState::Fading { progress } if (progress - 0.25).abs() < 1e-6
        ));
        assert_eq!(fade.state(start + Duration::from_millis(200)), FadeState::Done);

        let finished = fade.finish().unwrap();
        assert_eq!(finished.snapshot.id, SurfaceId(1));
        assert!(!finished.surface_gone);
        assert_eq!(fade.state(start + Duration::from_millis(300)), FadeState::Idle);
    }

    #[test]
    fn test_no_overlapping_fades() {
        let start = Instant::now();
        let mut fade = FadeController::new(Duration::from_millis(200));

        assert!(fade.begin(surface(1), start));
        assert!(!fade.begin(surface(2), start + Duration::from_millis(10)));
        assert!(fade.holds(SurfaceId(1)));
    }

    #[test]
    fn test_snapshot_survives_live_changes() {
        let start = Instant::now();
        let mut fade = FadeController::new(Duration::from_millis(200));
        let mut live = surface(1);
        fade.begin(live.clone(), start);

        live.geometry.width = 1;
        live.hidden = true;
        assert!(fade.mark_gone(live.id));
        assert!(!fade.mark_gone(SurfaceId(9)));

        let finished = fade.finish().unwrap();
        assert_eq!(finished.snapshot.geometry.width, 64);
        assert!(!finished.snapshot.hidden);
        assert!(finished.surface_gone);
    }
}
