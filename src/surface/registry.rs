//! Stacking-ordered collection of tracked surfaces
//!
//! Surfaces are stored top to bottom: index 0 is the head of the stack and
//! is the topmost surface. A position map gives O(1) identity lookup; the
//! structural operations are O(n), which is fine at window-count scale.
//!
//! # Examples
//!
//! ```
//! use gamecomp::surface::{SurfaceId, SurfaceRegistry};
//!
//! let registry = SurfaceRegistry::new();
//! assert!(registry.is_empty());
//! assert!(registry.get(SurfaceId(1)).is_none());
//! ```

use std::collections::{HashMap, HashSet};

use super::{Surface, SurfaceId};

#[derive(Debug, Clone, Default)]
pub struct SurfaceRegistry {
    /// Surfaces ordered from top to bottom
    surfaces: Vec<Surface>,

    /// Fast lookup: surface ID → index in `surfaces`
    positions: HashMap<SurfaceId, usize>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a surface directly above `above`, or at the top when `above`
    /// is `None`. An `above` that is not tracked places it at the bottom.
    ///
    /// Returns `false` (and leaves the registry untouched) if a surface with
    /// the same identity is already tracked.
    pub fn insert(&mut self, surface: Surface, above: Option<SurfaceId>) -> bool {
        if self.positions.contains_key(&surface.id) {
            return false;
        }

        let index = match above {
            None => 0,
            Some(sibling) => self
                .positions
                .get(&sibling)
                .copied()
                .unwrap_or(self.surfaces.len()),
        };
        self.surfaces.insert(index, surface);
        self.rebuild_positions();
        true
    }

    /// Remove a surface, returning its record
    pub fn remove(&mut self, id: SurfaceId) -> Option<Surface> {
        let index = self.positions.remove(&id)?;
        let surface = self.surfaces.remove(index);
        self.rebuild_positions();
        Some(surface)
    }

    /// Place `id` directly above `above`, or at the bottom when `above` is
    /// `None` or untracked.
    ///
    /// Returns `true` if the stacking order changed.
    pub fn restack(&mut self, id: SurfaceId, above: Option<SurfaceId>) -> bool {
        let Some(&index) = self.positions.get(&id) else {
            return false;
        };

        let current_below = self.surfaces.get(index + 1).map(|s| s.id);
        if current_below == above {
            return false;
        }

        let surface = self.surfaces.remove(index);
        self.rebuild_positions();

        let target = above
            .and_then(|sibling| self.positions.get(&sibling).copied())
            .unwrap_or(self.surfaces.len());
        self.surfaces.insert(target, surface);
        self.rebuild_positions();
        true
    }

    /// Exact identity lookup
    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.positions.get(&id).map(|&i| &self.surfaces[i])
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        match self.positions.get(&id) {
            Some(&i) => Some(&mut self.surfaces[i]),
            None => None,
        }
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Resolve `id` to itself or its nearest tracked ancestor.
    ///
    /// `parent_of` queries the display for a window's parent. The walk stops
    /// at a window without a parent, at the display root, or if the display
    /// reports a cycle.
    pub fn resolve<F>(&self, id: SurfaceId, root: SurfaceId, mut parent_of: F) -> Option<SurfaceId>
    where
        F: FnMut(SurfaceId) -> Option<SurfaceId>,
    {
        let mut visited = HashSet::new();
        let mut current = id;

        loop {
            if self.contains(current) {
                return Some(current);
            }
            if current == root || !visited.insert(current) {
                return None;
            }
            match parent_of(current) {
                Some(parent) if parent != root => current = parent,
                _ => return None,
            }
        }
    }

    /// Topmost surface
    pub fn top(&self) -> Option<&Surface> {
        self.surfaces.first()
    }

    /// Surfaces from top to bottom
    pub fn iter(&self) -> impl Iterator<Item = &Surface> {
        self.surfaces.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Surface> {
        self.surfaces.iter_mut()
    }

    /// Identities from top to bottom
    pub fn ids(&self) -> Vec<SurfaceId> {
        self.surfaces.iter().map(|s| s.id).collect()
    }

    /// Stack index of a surface; 0 is the top
    pub fn position(&self, id: SurfaceId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    fn rebuild_positions(&mut self) {
        self.positions.clear();
        for (i, surface) in self.surfaces.iter().enumerate() {
            self.positions.insert(surface.id, i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SurfaceAttributes;
    use crate::surface::{Geometry, MapState, SurfaceClass};

    fn surface(id: u32) -> Surface {
        let attributes = SurfaceAttributes {
            geometry: Geometry::new(0, 0, 100, 100),
            override_redirect: false,
            map_state: MapState::Viewable,
            class: SurfaceClass::InputOutput,
            format: None,
        };
        Surface::new(SurfaceId(id), &attributes)
    }

    fn ids(registry: &SurfaceRegistry) -> Vec<u32> {
        registry.ids().into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn test_insert_without_sibling_goes_on_top() {
        let mut registry = SurfaceRegistry::new();
        assert!(registry.insert(surface(1), None));
        assert!(registry.insert(surface(2), None));

        assert_eq!(ids(&registry), vec![2, 1]);
        assert_eq!(registry.top().map(|s| s.id), Some(SurfaceId(2)));
    }

    #[test]
    fn test_insert_above_sibling() {
        let mut registry = SurfaceRegistry::new();
        registry.insert(surface(1), None);
        registry.insert(surface(2), Some(SurfaceId(1)));
        registry.insert(surface(3), Some(SurfaceId(2)));

        assert_eq!(ids(&registry), vec![3, 2, 1]);
    }

    #[test]
    fn test_insert_above_unknown_sibling_goes_to_bottom() {
        let mut registry = SurfaceRegistry::new();
        registry.insert(surface(1), None);
        registry.insert(surface(2), Some(SurfaceId(99)));

        assert_eq!(ids(&registry), vec![1, 2]);
    }

    #[test]
    fn test_insert_duplicate_is_rejected() {
        let mut registry = SurfaceRegistry::new();
        assert!(registry.insert(surface(1), None));
        assert!(!registry.insert(surface(1), None));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_keeps_positions_consistent() {
        let mut registry = SurfaceRegistry::new();
        for id in 1..=3 {
            registry.insert(surface(id), None);
        }

        assert_eq!(registry.remove(SurfaceId(2)).map(|s| s.id), Some(SurfaceId(2)));
        assert!(registry.remove(SurfaceId(2)).is_none());

        for (i, id) in registry.ids().into_iter().enumerate() {
            assert_eq!(registry.position(id), Some(i));
        }
    }

    #[test]
    fn test_restack_above_sibling() {
        let mut registry = SurfaceRegistry::new();
        for id in 1..=4 {
            registry.insert(surface(id), None);
        }
        assert_eq!(ids(&registry), vec![4, 3, 2, 1]);

        assert!(registry.restack(SurfaceId(1), Some(SurfaceId(3))));
        assert_eq!(ids(&registry), vec![4, 1, 3, 2]);
    }

    #[test]
    fn test_restack_to_bottom_and_noop() {
        let mut registry = SurfaceRegistry::new();
        for id in 1..=3 {
            registry.insert(surface(id), None);
        }

        assert!(registry.restack(SurfaceId(3), None));
        assert_eq!(ids(&registry), vec![2, 1, 3]);

        // Already directly above 1
        assert!(!registry.restack(SurfaceId(2), Some(SurfaceId(1))));
    }

    #[test]
    fn test_resolve_walks_to_tracked_ancestor() {
        let mut registry = SurfaceRegistry::new();
        registry.insert(surface(10), None);

        let parents: HashMap<u32, u32> = [(30, 20), (20, 10), (10, 1)].into_iter().collect();
        let root = SurfaceId(1);

        let resolved = registry.resolve(SurfaceId(30), root, |id| {
            parents.get(&id.0).map(|&p| SurfaceId(p))
        });
        assert_eq!(resolved, Some(SurfaceId(10)));
    }

    #[test]
    fn test_resolve_stops_at_root_and_orphans() {
        let registry = SurfaceRegistry::new();
        let root = SurfaceId(1);

        assert_eq!(registry.resolve(SurfaceId(5), root, |_| Some(root)), None);
        assert_eq!(registry.resolve(SurfaceId(5), root, |_| None), None);
    }

    #[test]
    fn test_resolve_terminates_on_cycles() {
        let registry = SurfaceRegistry::new();
        let resolved = registry.resolve(SurfaceId(5), SurfaceId(1), |id| {
            Some(if id.0 == 5 { SurfaceId(6) } else { SurfaceId(5) })
        });
        assert_eq!(resolved, None);
    }
}
