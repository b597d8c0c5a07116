//! Uniform grid index over shape bounds.
//!
//! Each shape is bucketed into every cell its bounds touch, so a region
//! query only inspects the cells the region covers and then confirms each
//! candidate against its exact bounds. Shapes covering more than
//! `MAX_CELLS_PER_SHAPE` cells are kept aside and checked on every query.

use crate::geometry::{expand, intersects, Bounds};
use crate::types::ShapeId;
use std::collections::{HashMap, HashSet};

const MAX_CELLS_PER_SHAPE: i64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CellKey(i32, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellRange {
    min: CellKey,
    max: CellKey,
}

impl CellRange {
    fn cell_count(&self) -> i64 {
        let w = self.max.0 as i64 - self.min.0 as i64 + 1;
        let h = self.max.1 as i64 - self.min.1 as i64 + 1;
        w.saturating_mul(h)
    }
}

#[derive(Debug, Clone)]
pub struct ViewportCuller {
    inv_cell_size: f32,
    margin: f32,
    grid: HashMap<CellKey, Vec<ShapeId>>,
    bounds: HashMap<ShapeId, Bounds>,
    oversized: HashSet<ShapeId>,
}

impl ViewportCuller {
    /// `margin` is the fraction of the query rect added on each side.
    pub fn new(cell_size: f32, margin: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            log::warn!("invalid grid cell size {}, falling back to 256", cell_size);
            256.0
        };
        Self {
            inv_cell_size: 1.0 / cell_size,
            margin: margin.max(0.0),
            grid: HashMap::new(),
            bounds: HashMap::new(),
            oversized: HashSet::new(),
        }
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    fn to_cell(&self, x: f32, y: f32) -> CellKey {
        let cell = |v: f32| {
            (v * self.inv_cell_size)
                .floor()
                .clamp(i32::MIN as f32, i32::MAX as f32) as i32
        };
        CellKey(cell(x), cell(y))
    }

    fn cell_range(&self, bounds: &Bounds) -> CellRange {
        CellRange {
            min: self.to_cell(bounds.min.x, bounds.min.y),
            max: self.to_cell(bounds.max.x, bounds.max.y),
        }
    }

    pub fn insert(&mut self, id: ShapeId, bounds: Bounds) {
        if self.bounds.contains_key(&id) {
            self.remove(&id);
        }

        let range = self.cell_range(&bounds);
        if range.cell_count() > MAX_CELLS_PER_SHAPE {
            self.oversized.insert(id.clone());
        } else {
            for cx in range.min.0..=range.max.0 {
                for cy in range.min.1..=range.max.1 {
                    self.grid.entry(CellKey(cx, cy)).or_default().push(id.clone());
                }
            }
        }
        self.bounds.insert(id, bounds);
    }

    pub fn update(&mut self, id: ShapeId, bounds: Bounds) {
        if self.bounds.get(&id) == Some(&bounds) {
            return;
        }
        self.insert(id, bounds);
    }

    /// No-op for unknown ids.
    pub fn remove(&mut self, id: &str) {
        let bounds = match self.bounds.remove(id) {
            Some(bounds) => bounds,
            None => return,
        };
        if self.oversized.remove(id) {
            return;
        }

        let range = self.cell_range(&bounds);
        for cx in range.min.0..=range.max.0 {
            for cy in range.min.1..=range.max.1 {
                let key = CellKey(cx, cy);
                if let Some(ids) = self.grid.get_mut(&key) {
                    if let Some(pos) = ids.iter().position(|x| x == id) {
                        ids.swap_remove(pos);
                    }
                    if ids.is_empty() {
                        self.grid.remove(&key);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.grid.clear();
        self.bounds.clear();
        self.oversized.clear();
    }

    /// Ids of shapes whose bounds intersect `rect` grown by the margin,
    /// sorted by id.
    pub fn query(&self, rect: &Bounds) -> Vec<ShapeId> {
        self.query_exact(&expand(rect, self.margin))
    }

    /// Same as `query` without the margin.
    pub fn query_exact(&self, region: &Bounds) -> Vec<ShapeId> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let mut consider = |id: &ShapeId| {
            if seen.insert(id.clone()) {
                if let Some(bounds) = self.bounds.get(id) {
                    if intersects(bounds, region) {
                        result.push(id.clone());
                    }
                }
            }
        };

        let range = self.cell_range(region);
        if range.cell_count() > self.grid.len() as i64 {
            // Region covers more cells than are occupied; walk the occupied ones.
            for ids in self.grid.values() {
                ids.iter().for_each(&mut consider);
            }
        } else {
            for cx in range.min.0..=range.max.0 {
                for cy in range.min.1..=range.max.1 {
                    if let Some(ids) = self.grid.get(&CellKey(cx, cy)) {
                        ids.iter().for_each(&mut consider);
                    }
                }
            }
        }
        self.oversized.iter().for_each(&mut consider);

        result.sort();
        result
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.bounds.contains_key(id)
    }
}
