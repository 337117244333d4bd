//! Spatial index strategies for circular range queries over entity positions.
//!
//! The index never owns entity data: callers rebuild it from a dense slice of
//! positions once per tick and query it by slot. Both strategies implement the
//! same exact-radius contract, so the linear scan doubles as the reference
//! implementation for the grid.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by spatial indices.
pub trait SpatialIndex: Send + Sync {
    /// Rebuild internal structures from the dense position slice. Slot `i` of
    /// every subsequent query refers to `positions[i]`.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit every slot whose position lies within `radius` of `(x, y)`,
    /// boundary inclusive. Visit order is unspecified; no slot is visited twice.
    fn neighbors_within(
        &self,
        x: f32,
        y: f32,
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );

    /// Nearest slot within `radius` of `(x, y)`. Ties on distance resolve to
    /// the smaller slot so results are total and reproducible.
    fn nearest(&self, x: f32, y: f32, radius: f32) -> Option<usize> {
        let mut best: Option<(OrderedFloat<f32>, usize)> = None;
        self.neighbors_within(x, y, radius, &mut |slot, distance| {
            let candidate = (distance, slot);
            if best.map_or(true, |current| candidate < current) {
                best = Some(candidate);
            }
        });
        best.map(|(_, slot)| slot)
    }
}

/// Linear-scan index. Correct by construction; the default for small worlds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NaiveIndex {
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl NaiveIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl SpatialIndex for NaiveIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        Ok(())
    }

    fn neighbors_within(
        &self,
        x: f32,
        y: f32,
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if radius < 0.0 {
            return;
        }
        let radius_sq = radius * radius;
        for (slot, &(px, py)) in self.positions.iter().enumerate() {
            let dx = px - x;
            let dy = py - y;
            let dist_sq = dx * dx + dy * dy;
            if dist_sq <= radius_sq {
                visitor(slot, OrderedFloat(dist_sq.sqrt()));
            }
        }
    }
}

/// Uniform grid index bucketing slots by cell. Cell size should sit near the
/// typical query radius so a range query touches a handful of cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing positions.
    pub cell_size: f32,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
    #[serde(skip)]
    buckets: HashMap<(i32, i32), Vec<usize>>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            positions: Vec::new(),
            buckets: HashMap::new(),
        }
    }

    fn cell_coord(cell_size: f32, value: f32) -> i32 {
        (value / cell_size).floor() as i32
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(50.0)
    }
}

impl SpatialIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        // Buckets keep their allocations across per-tick rebuilds.
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }
        let cell_size = self.cell_size;
        for (slot, &(x, y)) in positions.iter().enumerate() {
            let cell = (
                Self::cell_coord(cell_size, x),
                Self::cell_coord(cell_size, y),
            );
            self.buckets.entry(cell).or_default().push(slot);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        x: f32,
        y: f32,
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if radius < 0.0 || self.positions.is_empty() {
            return;
        }
        let radius_sq = radius * radius;
        let min_cx = Self::cell_coord(self.cell_size, x - radius);
        let max_cx = Self::cell_coord(self.cell_size, x + radius);
        let min_cy = Self::cell_coord(self.cell_size, y - radius);
        let max_cy = Self::cell_coord(self.cell_size, y + radius);
        for cx in min_cx..=max_cx {
            for cy in min_cy..=max_cy {
                let Some(bucket) = self.buckets.get(&(cx, cy)) else {
                    continue;
                };
                for &slot in bucket {
                    let (px, py) = self.positions[slot];
                    let dx = px - x;
                    let dy = py - y;
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        visitor(slot, OrderedFloat(dist_sq.sqrt()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect_sorted(index: &dyn SpatialIndex, x: f32, y: f32, radius: f32) -> Vec<usize> {
        let mut slots = Vec::new();
        index.neighbors_within(x, y, radius, &mut |slot, _| slots.push(slot));
        slots.sort_unstable();
        slots
    }

    #[test]
    fn naive_query_is_boundary_inclusive() {
        let mut index = NaiveIndex::new();
        index
            .rebuild(&[(0.0, 0.0), (3.0, 4.0), (3.1, 4.0)])
            .unwrap();
        assert_eq!(collect_sorted(&index, 0.0, 0.0, 5.0), vec![0, 1]);
    }

    #[test]
    fn naive_query_reports_euclidean_distance() {
        let mut index = NaiveIndex::new();
        index.rebuild(&[(3.0, 4.0)]).unwrap();
        let mut seen = Vec::new();
        index.neighbors_within(0.0, 0.0, 10.0, &mut |slot, dist| seen.push((slot, dist)));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 0);
        assert!((seen[0].1.into_inner() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn grid_finds_neighbors_across_cell_boundaries() {
        let mut index = UniformGridIndex::new(10.0);
        index
            .rebuild(&[(9.9, 9.9), (10.1, 10.1), (35.0, 35.0)])
            .unwrap();
        assert_eq!(collect_sorted(&index, 10.0, 10.0, 1.0), vec![0, 1]);
    }

    #[test]
    fn grid_handles_negative_coordinates() {
        let mut index = UniformGridIndex::new(25.0);
        index.rebuild(&[(-40.0, -40.0), (-41.0, -40.0)]).unwrap();
        assert_eq!(collect_sorted(&index, -40.0, -40.0, 2.0), vec![0, 1]);
    }

    #[test]
    fn rebuild_discards_stale_entries() {
        let mut index = UniformGridIndex::new(10.0);
        index.rebuild(&[(5.0, 5.0), (100.0, 100.0)]).unwrap();
        index.rebuild(&[(5.0, 5.0)]).unwrap();
        assert_eq!(collect_sorted(&index, 100.0, 100.0, 5.0), Vec::<usize>::new());
        assert_eq!(collect_sorted(&index, 5.0, 5.0, 1.0), vec![0]);
    }

    #[test]
    fn rebuild_rejects_nonpositive_cell_size() {
        let mut index = UniformGridIndex::new(0.0);
        assert!(matches!(
            index.rebuild(&[(0.0, 0.0)]),
            Err(IndexError::InvalidConfig(_))
        ));
    }

    #[test]
    fn nearest_prefers_smaller_slot_on_distance_tie() {
        let mut index = NaiveIndex::new();
        index
            .rebuild(&[(2.0, 0.0), (-2.0, 0.0), (1.0, 0.0)])
            .unwrap();
        // Slots 0 and 1 are equidistant from the origin; 2 is closer.
        assert_eq!(index.nearest(0.0, 0.0, 10.0), Some(2));
        index.rebuild(&[(2.0, 0.0), (-2.0, 0.0)]).unwrap();
        assert_eq!(index.nearest(0.0, 0.0, 10.0), Some(0));
    }

    #[test]
    fn nearest_returns_none_outside_radius() {
        let mut index = UniformGridIndex::default();
        index.rebuild(&[(100.0, 100.0)]).unwrap();
        assert_eq!(index.nearest(0.0, 0.0, 10.0), None);
    }

    #[test]
    fn negative_radius_yields_no_neighbors() {
        let mut naive = NaiveIndex::new();
        naive.rebuild(&[(0.0, 0.0)]).unwrap();
        assert!(collect_sorted(&naive, 0.0, 0.0, -1.0).is_empty());
        let mut grid = UniformGridIndex::default();
        grid.rebuild(&[(0.0, 0.0)]).unwrap();
        assert!(collect_sorted(&grid, 0.0, 0.0, -1.0).is_empty());
    }

    proptest! {
        #[test]
        fn grid_matches_naive_reference(
            positions in prop::collection::vec((-500.0f32..500.0, -500.0f32..500.0), 0..200),
            qx in -500.0f32..500.0,
            qy in -500.0f32..500.0,
            radius in 0.0f32..250.0,
            cell_size in 1.0f32..120.0,
        ) {
            let mut naive = NaiveIndex::new();
            naive.rebuild(&positions).unwrap();
            let mut grid = UniformGridIndex::new(cell_size);
            grid.rebuild(&positions).unwrap();
            prop_assert_eq!(
                collect_sorted(&naive, qx, qy, radius),
                collect_sorted(&grid, qx, qy, radius)
            );
        }

        #[test]
        fn nearest_agrees_between_strategies(
            positions in prop::collection::vec((-200.0f32..200.0, -200.0f32..200.0), 0..64),
            qx in -200.0f32..200.0,
            qy in -200.0f32..200.0,
            radius in 0.0f32..150.0,
        ) {
            let mut naive = NaiveIndex::new();
            naive.rebuild(&positions).unwrap();
            let mut grid = UniformGridIndex::new(40.0);
            grid.rebuild(&positions).unwrap();
            prop_assert_eq!(naive.nearest(qx, qy, radius), grid.nearest(qx, qy, radius));
        }
    }
}
