//! Filter Engine.
//!
//! Keeps each filter's `includes` set in step with its polygon and with the
//! derived dataset of the plot it is drawn on. Evaluation is synchronous.

use crate::core::config::FilterConfig;
use crate::core::time::DeadlineQueue;
use crate::store::{AxisBinding, EntityId, Filter, PlotRow, Stores};
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in for a null coordinate.
pub const NULL_EPSILON: f64 = 1e-5;

/// A polygon with its bounding rectangle.
#[derive(Debug, Clone)]
pub struct Polygon {
    points: Vec<[f64; 2]>,
    min: [f64; 2],
    max: [f64; 2],
}

impl Polygon {
    /// Build a polygon. Fewer than three points is no polygon.
    pub fn new(points: &[[f64; 2]]) -> Option<Self> {
        if points.len() < 3 {
            return None;
        }
        let mut min = [f64::INFINITY; 2];
        let mut max = [f64::NEG_INFINITY; 2];
        for p in points {
            for axis in 0..2 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Some(Self {
            points: points.to_vec(),
            min,
            max,
        })
    }

    /// Whether the point lies within the bounding rectangle on the given
    /// axis.
    fn in_extent(&self, axis: usize, value: f64) -> bool {
        value >= self.min[axis] && value <= self.max[axis]
    }

    /// Even-odd ray cast, after a bounding-rectangle reject.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        if !self.in_extent(0, x) || !self.in_extent(1, y) {
            return false;
        }
        let mut inside = false;
        let mut j = self.points.len() - 1;
        for i in 0..self.points.len() {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Test a point under an axis binding: both axes use the full polygon,
    /// a single axis only the polygon's extent on that axis.
    pub fn matches(&self, binding: AxisBinding, x: f64, y: f64) -> bool {
        if binding == AxisBinding::X {
            self.in_extent(0, x)
        } else if binding == AxisBinding::Y {
            self.in_extent(1, y)
        } else {
            self.contains(x, y)
        }
    }
}

/// Row ids of `rows` inside the filter's region, ascending.
pub fn compute_includes(filter: &Filter, rows: &[PlotRow]) -> Vec<i64> {
    let Some(polygon) = Polygon::new(filter.path()) else {
        return Vec::new();
    };
    let binding = filter.bound_axis();
    let mut includes: Vec<i64> = rows
        .iter()
        .filter(|row| {
            polygon.matches(
                binding,
                row.x.unwrap_or(NULL_EPSILON),
                row.y.unwrap_or(NULL_EPSILON),
            )
        })
        .map(|row| row.row_id)
        .collect();
    includes.sort_unstable();
    includes.dedup();
    includes
}

/// Inclusion maintenance and the empty-filter grace period.
#[derive(Debug)]
pub struct FilterEngine {
    grace: Duration,
    pending: DeadlineQueue<EntityId>,
}

impl FilterEngine {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            grace: Duration::from_millis(config.empty_grace_ms),
            pending: DeadlineQueue::new(),
        }
    }

    /// Recompute one filter's inclusion set. Returns whether it changed.
    pub fn refresh(&self, stores: &mut Stores, filter_id: EntityId) -> bool {
        let Some(filter) = stores.filters.get_cached(filter_id) else {
            return false;
        };
        let includes = match stores.plots.get_cached(filter.origin()) {
            Some(plot) => compute_includes(filter, plot.data()),
            None => Vec::new(),
        };
        let changed = stores
            .filters
            .edit(filter_id, None, |f| f.set_includes(includes))
            .unwrap_or(false);
        if changed {
            tracing::debug!(filter_id, "filter inclusion changed");
        }
        changed
    }

    /// Recompute every filter drawn on a plot.
    pub fn refresh_plot(&self, stores: &mut Stores, plot_id: EntityId) {
        for filter_id in Self::dependents(stores, plot_id) {
            self.refresh(stores, filter_id);
        }
    }

    /// Filters drawn on a plot.
    pub fn dependents(stores: &Stores, plot_id: EntityId) -> Vec<EntityId> {
        stores
            .filters
            .iter()
            .filter(|f| f.origin() == plot_id)
            .map(crate::store::Entity::id)
            .collect()
    }

    /// Start the grace period of a newly created filter.
    pub fn track_new(&mut self, filter_id: EntityId, now: Instant) {
        self.pending.schedule(filter_id, now + self.grace);
    }

    /// Forget a deleted filter.
    pub fn forget(&mut self, filter_id: EntityId) {
        self.pending.cancel(&filter_id);
    }

    /// When the next grace period ends.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    /// Filters whose grace period ended while they still include nothing.
    /// The caller deletes them.
    pub fn expired_empty(&mut self, stores: &Stores, now: Instant) -> Vec<EntityId> {
        self.pending
            .pop_due(now)
            .into_iter()
            .filter(|id| {
                stores
                    .filters
                    .get_cached(*id)
                    .is_some_and(|f| f.includes().is_empty())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Entity;

    fn row(row_id: i64, x: f64, y: f64) -> PlotRow {
        PlotRow {
            row_id,
            x: Some(x),
            y: Some(y),
            filtered: false,
        }
    }

    fn filter(path: Vec<[f64; 2]>, binding: AxisBinding) -> Filter {
        let mut filter = Filter::new_with_id(1);
        filter.set_path(path);
        filter.set_bound_axis(binding);
        filter
    }

    #[test]
    fn test_rectangle_includes() {
        let f = filter(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]], AxisBinding::all());
        let rows = [row(7, 0.5, 0.5), row(8, 1.5, 1.5)];
        assert_eq!(compute_includes(&f, &rows), vec![7]);
    }

    #[test]
    fn test_concave_polygon() {
        // A "U" shape; the notch between the arms is outside.
        let path = vec![
            [0.0, 0.0],
            [1.0, 0.0],
            [1.0, 1.0],
            [0.7, 1.0],
            [0.7, 0.3],
            [0.3, 0.3],
            [0.3, 1.0],
            [0.0, 1.0],
        ];
        let polygon = Polygon::new(&path).unwrap();
        assert!(polygon.contains(0.1, 0.9));
        assert!(polygon.contains(0.5, 0.1));
        assert!(!polygon.contains(0.5, 0.8));
        assert!(!polygon.contains(-0.1, 0.5));
    }

    #[test]
    fn test_null_coordinates_use_epsilon() {
        let f = filter(vec![[0.0, 0.0], [0.1, 0.0], [0.1, 0.1], [0.0, 0.1]], AxisBinding::all());
        let rows = [PlotRow {
            row_id: 3,
            x: None,
            y: Some(0.05),
            filtered: false,
        }];
        assert_eq!(compute_includes(&f, &rows), vec![3]);
    }

    #[test]
    fn test_axis_binding() {
        let triangle = vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let rows = [row(1, 0.9, 0.9), row(2, 0.9, 2.0), row(3, 2.0, 0.5)];

        assert!(compute_includes(&filter(triangle.clone(), AxisBinding::all()), &rows).is_empty());
        assert_eq!(compute_includes(&filter(triangle.clone(), AxisBinding::X), &rows), vec![1, 2]);
        assert_eq!(compute_includes(&filter(triangle, AxisBinding::Y), &rows), vec![1, 3]);
    }

    #[test]
    fn test_degenerate_path() {
        let f = filter(vec![[0.0, 0.0], [1.0, 1.0]], AxisBinding::all());
        assert!(compute_includes(&f, &[row(1, 0.5, 0.5)]).is_empty());
    }
}
