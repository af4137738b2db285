//! Damage tracking
//!
//! Every damage notification stamps the surface with a value from a
//! process-wide, strictly increasing sequence. The sequence is the total
//! order the focus arbiter uses to pick the most recently active game
//! surface, so a surface with sequence 0 has never been damaged.
//!
//! # Example
//!
//! ```
//! use gamecomp::renderer::damage::DamageTracker;
//!
//! let mut tracker = DamageTracker::new();
//! assert_eq!(tracker.next_sequence(), 1);
//! assert_eq!(tracker.next_sequence(), 2);
//! ```

use crate::surface::{Surface, SurfaceId};

/// What a damage notification changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    /// A transparent overlay: contents became valid, nothing to repaint
    Ignored,
    /// The surface is dirty; `focus_dirty` asks for focus arbitration
    Recorded { focus_dirty: bool },
}

#[derive(Debug, Clone)]
pub struct DamageTracker {
    next: u64,
}

impl DamageTracker {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate the next sequence value
    pub fn next_sequence(&mut self) -> u64 {
        let value = self.next;
        self.next += 1;
        value
    }

    /// Last value handed out, 0 if none yet
    pub fn current(&self) -> u64 {
        self.next - 1
    }

    /// Record a damage notification on `surface`.
    ///
    /// `focus` is the current focus identity and its damage sequence, used
    /// to notice a game surface overtaking it.
    pub fn record(&mut self, surface: &mut Surface, focus: Option<(SurfaceId, u64)>) -> DamageOutcome {
        surface.valid_contents = true;

        if surface.is_overlay && surface.opacity == 0 {
            return DamageOutcome::Ignored;
        }

        // Only damaged surfaces are worth focusing
        let mut focus_dirty = surface.game_id != 0 && surface.damage_sequence == 0;

        surface.damage_sequence = self.next_sequence();

        if let Some((focus_id, focus_sequence)) = focus {
            if focus_id != surface.id
                && surface.game_id != 0
                && surface.damage_sequence > focus_sequence
            {
                focus_dirty = true;
            }
        }

        surface.damaged = true;
        DamageOutcome::Recorded { focus_dirty }
    }
}

impl Default for DamageTracker {
    fn default() -> Self {
        Self::new()
    }
}
