//! Sparse per-tile elevation bounds, propagated toward the root so the
//! selector can build conservative AABBs without visiting every descendant.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::tile_code::TileCode;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMax {
    pub min: f32,
    pub max: f32,
}

impl MinMax {
    pub fn covers(&self, other: &MinMax) -> bool {
        self.min <= other.min && self.max >= other.max
    }

    fn union(a: Option<MinMax>, b: MinMax) -> MinMax {
        match a {
            None => b,
            Some(a) => MinMax {
                min: a.min.min(b.min),
                max: a.max.max(b.max),
            },
        }
    }
}

pub struct MinMaxTree {
    map: Mutex<HashMap<u64, MinMax>>,
    default: MinMax,
}

impl MinMaxTree {
    pub fn new(default: MinMax) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            default,
        }
    }

    /// Monotonic insert (used on load completion): inserts `(min,max)` at
    /// `code` if absent, then walks ancestors expanding each parent's
    /// interval to cover the child. Stops as soon as a parent already covers it.
    pub fn insert_monotonic(&self, code: TileCode, value: MinMax) {
        let mut map = self.map.lock();
        if map.contains_key(&code.pack()) {
            return;
        }
        map.insert(code.pack(), value);

        let mut child = code;
        let mut covering = value;
        while child.zoom > 0 {
            let parent = child.coarsen();
            let parent_key = parent.pack();
            match map.get(&parent_key).copied() {
                Some(existing) if existing.covers(&covering) => break,
                Some(existing) => {
                    let merged = MinMax {
                        min: existing.min.min(covering.min),
                        max: existing.max.max(covering.max),
                    };
                    map.insert(parent_key, merged);
                    covering = merged;
                }
                None => {
                    map.insert(parent_key, covering);
                }
            }
            child = parent;
        }
    }

    /// Overwrite `code`'s value and recompute every ancestor from its
    /// existing children (children with no stored value contribute nothing).
    /// Uses the true min/max across present children.
    pub fn modify(&self, code: TileCode, value: MinMax) {
        let mut map = self.map.lock();
        map.insert(code.pack(), value);

        let mut child = code;
        while child.zoom > 0 {
            let parent = child.coarsen();
            let mut agg: Option<MinMax> = None;
            for q in crate::tile_code::QUADRANTS {
                let c = parent.refine(q);
                let c_val = if c == child {
                    Some(value)
                } else {
                    map.get(&c.pack()).copied()
                };
                if let Some(v) = c_val {
                    agg = Some(MinMax::union(agg, v));
                }
            }
            let Some(agg) = agg else { break };
            map.insert(parent.pack(), agg);
            child = parent;
        }
    }

    /// Walks up from `code`, returning the first stored ancestor's value, or
    /// the configured default if none is stored.
    pub fn minmax(&self, mut code: TileCode) -> MinMax {
        let map = self.map.lock();
        loop {
            if let Some(v) = map.get(&code.pack()) {
                return *v;
            }
            if code.zoom == 0 {
                return self.default;
            }
            code = code.coarsen();
        }
    }
}

/// Mutex-protected queue workers push `(code, min, max)` updates onto; the
/// render thread drains it once per frame and applies monotonic inserts,
/// keeping the tree itself touched only from the single owning thread.
#[derive(Default)]
pub struct MinMaxUpdateQueue {
    pending: Mutex<VecDeque<(TileCode, MinMax)>>,
}

impl MinMaxUpdateQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Called from a worker thread on load completion.
    pub fn push(&self, code: TileCode, value: MinMax) {
        self.pending.lock().push_back((code, value));
    }

    /// Drain everything queued so far into `tree` via monotonic insert.
    /// Called once per frame from the render thread.
    pub fn drain_into(&self, tree: &MinMaxTree) -> usize {
        let mut pending = self.pending.lock();
        let n = pending.len();
        for (code, value) in pending.drain(..) {
            tree.insert_monotonic(code, value);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile_code::Quadrant;

    #[test]
    fn monotonic_insert_expands_ancestors() {
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let root = TileCode::new(0, 0, 0);
        let child = root.refine(Quadrant::UpperRight);

        tree.insert_monotonic(child, MinMax { min: -1.0, max: 2.0 });
        let parent_val = tree.minmax(root);
        assert_eq!(parent_val, MinMax { min: -1.0, max: 2.0 });
    }

    #[test]
    fn monotonic_insert_stops_early_if_already_covered() {
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let root = TileCode::new(0, 0, 0);
        let child_a = root.refine(Quadrant::LowerLeft);
        let child_b = root.refine(Quadrant::UpperRight);

        tree.insert_monotonic(child_a, MinMax { min: -5.0, max: 5.0 });
        tree.insert_monotonic(child_b, MinMax { min: -1.0, max: 1.0 });

        assert_eq!(tree.minmax(root), MinMax { min: -5.0, max: 5.0 });
        assert_eq!(tree.minmax(child_b), MinMax { min: -1.0, max: 1.0 });
    }

    #[test]
    fn query_walks_up_to_nearest_stored_ancestor() {
        let tree = MinMaxTree::new(MinMax { min: -9.0, max: 9.0 });
        let root = TileCode::new(1, 0, 0);
        let child = root.refine(Quadrant::LowerRight);
        let grandchild = child.refine(Quadrant::UpperLeft);

        tree.insert_monotonic(child, MinMax { min: -2.0, max: 2.0 });
        assert_eq!(tree.minmax(grandchild), MinMax { min: -2.0, max: 2.0 });
    }

    #[test]
    fn query_returns_default_when_nothing_stored() {
        let tree = MinMaxTree::new(MinMax { min: -9.0, max: 9.0 });
        let code = TileCode::new(3, 4, 7);
        assert_eq!(tree.minmax(code), MinMax { min: -9.0, max: 9.0 });
    }

    #[test]
    fn modify_recomputes_parent_with_true_max_not_min() {
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let root = TileCode::new(0, 0, 0);
        let a = root.refine(Quadrant::LowerLeft);
        let b = root.refine(Quadrant::LowerRight);

        tree.modify(a, MinMax { min: -1.0, max: 1.0 });
        tree.modify(b, MinMax { min: -3.0, max: 8.0 });

        let parent = tree.minmax(root);
        // true max across children is 8.0; the original's defect would give 1.0.
        assert_eq!(parent.max, 8.0);
        assert_eq!(parent.min, -3.0);
    }

    #[test]
    fn modify_overwrite_updates_value_in_place() {
        let tree = MinMaxTree::new(MinMax { min: 0.0, max: 0.0 });
        let code = TileCode::new(0, 2, 5);
        tree.modify(code, MinMax { min: -1.0, max: 1.0 });
        tree.modify(code, MinMax { min: -4.0, max: 4.0 });
        assert_eq!(tree.minmax(code), MinMax { min: -4.0, max: 4.0 });
    }
}
