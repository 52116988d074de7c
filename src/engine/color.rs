//! Color Engine.
//!
//! One [`ColorTable`] per connected component of the plot graph. Tables keep
//! their id across topology changes: each recomputed component inherits the
//! old table it overlaps most, leftover components get fresh tables and
//! tables that lost every plot are dropped.
//!
//! Row colors resolve in priority order: the component's coloring plot, else
//! its coloring link, else a neutral default. Every color then gets a small
//! jitter derived from the row id.

use super::graph::PlotGraph;
use crate::store::{ColorSpec, Entity, EntityId, Plot, PlotRow, Stores};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// RGB with channels in [0, 1].
pub type Rgb = [f64; 3];

/// Color for rows no colorer touches.
pub const NEUTRAL: Rgb = [0.6, 0.6, 0.6];
/// Color for every row of a coloring plot that has no filter.
pub const COLORED_NO_FILTER: Rgb = [0.25, 0.55, 0.95];
/// Ends of the default gradient over normalized y.
pub const GRADIENT_LOW: Rgb = [0.15, 0.2, 0.8];
pub const GRADIENT_HIGH: Rgb = [0.95, 0.8, 0.2];
/// Stops of the inclination gradient.
pub const DECLINE: Rgb = [0.9, 0.1, 0.1];
pub const LEVEL: Rgb = [1.0, 1.0, 1.0];
pub const INCLINE: Rgb = [0.1, 0.8, 0.2];

/// Largest jitter per channel.
const JITTER: f64 = 0.04;

/// The one entity allowed to color a component. Plots order before links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Colorer {
    Plot(EntityId),
    Link(EntityId),
}

/// Colors shared by every plot and link of one component.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorTable {
    pub id: u64,
    pub plots: BTreeSet<EntityId>,
    pub colorer: Option<Colorer>,
    pub colors: BTreeMap<i64, Rgb>,
}

impl ColorTable {
    fn new(id: u64, plots: BTreeSet<EntityId>) -> Self {
        Self {
            id,
            plots,
            colorer: None,
            colors: BTreeMap::new(),
        }
    }

    /// Wire form: `{id, plots, colors: [[rowId, "#rrggbb"], ..]}`.
    pub fn to_wire(&self) -> Value {
        let colors: Vec<Value> = self
            .colors
            .iter()
            .map(|(row, rgb)| json!([row, to_hex(*rgb)]))
            .collect();
        json!({
            "id": self.id,
            "plots": self.plots,
            "colors": colors,
        })
    }
}

/// Outcome of matching tables to recomputed components.
#[derive(Debug, Default, PartialEq)]
pub struct Reconciled {
    /// Tables that are new or whose membership changed.
    pub changed: Vec<u64>,
    /// Tables that no longer have any plot.
    pub removed: Vec<u64>,
}

/// Parse `#rrggbb`.
pub fn parse_hex(s: &str) -> Option<Rgb> {
    let hex = s.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok().map(|c| f64::from(c) / 255.0);
    Some([channel(0)?, channel(2)?, channel(4)?])
}

/// Format as `#rrggbb`.
pub fn to_hex(rgb: Rgb) -> String {
    let c = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", c(rgb[0]), c(rgb[1]), c(rgb[2]))
}

fn lerp(a: Rgb, b: Rgb, t: f64) -> Rgb {
    if t <= 0.0 {
        return a;
    }
    if t >= 1.0 {
        return b;
    }
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

/// Per-row jitter, identical for identical row ids.
pub fn jitter(row_id: i64, rgb: Rgb) -> Rgb {
    let mut hasher = XxHash64::with_seed(row_id as u64);
    hasher.write(b"row-color");
    let hash = hasher.finish();
    let offset = |shift: u32| (((hash >> shift) & 0xff) as f64 / 255.0 - 0.5) * 2.0 * JITTER;
    [
        (rgb[0] + offset(0)).clamp(0.0, 1.0),
        (rgb[1] + offset(8)).clamp(0.0, 1.0),
        (rgb[2] + offset(16)).clamp(0.0, 1.0),
    ]
}

/// Three-stop inclination gradient over `t` in [-1, 1].
pub fn inclination_color(t: f64) -> Rgb {
    if t < 0.0 {
        lerp(LEVEL, DECLINE, -t)
    } else {
        lerp(LEVEL, INCLINE, t)
    }
}

fn spec_color(spec: &ColorSpec, y: f64) -> Rgb {
    match spec {
        ColorSpec::Solid(hex) => parse_hex(hex).unwrap_or(COLORED_NO_FILTER),
        ColorSpec::Gradient { from, to } => lerp(
            parse_hex(from).unwrap_or(GRADIENT_LOW),
            parse_hex(to).unwrap_or(GRADIENT_HIGH),
            y,
        ),
    }
}

/// Resolve the colors of a coloring plot.
fn plot_colors(stores: &Stores, plot: &Plot, rows: &BTreeSet<i64>) -> BTreeMap<i64, Rgb> {
    let plot_id = plot.id();
    let filters: Vec<_> = stores.filters.iter().filter(|f| f.origin() == plot_id).collect();
    let by_row: BTreeMap<i64, &PlotRow> = plot.data().iter().map(|r| (r.row_id, r)).collect();
    rows.iter()
        .map(|row_id| {
            let y = by_row.get(row_id).and_then(|r| r.y);
            let color = if filters.is_empty() {
                COLORED_NO_FILTER
            } else if let Some(filter) = filters.iter().find(|f| f.includes().binary_search(row_id).is_ok()) {
                spec_color(filter.color(), y.unwrap_or(0.0))
            } else if by_row.contains_key(row_id) {
                lerp(GRADIENT_LOW, GRADIENT_HIGH, y.unwrap_or(0.0))
            } else {
                NEUTRAL
            };
            (*row_id, color)
        })
        .collect()
}

/// Merge-join two row lists sorted by row id, yielding `downstream.y -
/// upstream.y` for rows present in both with both values set.
pub fn inclinations(upstream: &[PlotRow], downstream: &[PlotRow]) -> BTreeMap<i64, f64> {
    let mut out = BTreeMap::new();
    let (mut i, mut j) = (0, 0);
    while i < upstream.len() && j < downstream.len() {
        let (up, down) = (&upstream[i], &downstream[j]);
        match up.row_id.cmp(&down.row_id) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                if let (Some(a), Some(b)) = (up.y, down.y) {
                    out.insert(up.row_id, b - a);
                }
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Resolve the colors of a coloring link.
fn link_colors(stores: &Stores, link_id: EntityId, rows: &BTreeSet<i64>) -> BTreeMap<i64, Rgb> {
    let slope = stores
        .links
        .get_cached(link_id)
        .and_then(|link| {
            let up = stores.plots.get_cached(link.upstream())?;
            let down = stores.plots.get_cached(link.downstream())?;
            Some(inclinations(up.data(), down.data()))
        })
        .unwrap_or_default();
    rows.iter()
        .map(|row_id| {
            let color = slope.get(row_id).map_or(NEUTRAL, |t| inclination_color(*t));
            (*row_id, color)
        })
        .collect()
}

/// Component tables and colorer enforcement.
#[derive(Debug)]
pub struct ColorEngine {
    tables: BTreeMap<u64, ColorTable>,
    next_id: u64,
}

impl Default for ColorEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorEngine {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &ColorTable> {
        self.tables.values()
    }

    pub fn table(&self, id: u64) -> Option<&ColorTable> {
        self.tables.get(&id)
    }

    /// Table holding a plot.
    pub fn table_of(&self, plot: EntityId) -> Option<u64> {
        self.tables
            .values()
            .find(|t| t.plots.contains(&plot))
            .map(|t| t.id)
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Match tables to the components of the current graph.
    pub fn reconcile(&mut self, graph: &PlotGraph, plots: impl IntoIterator<Item = EntityId>) -> Reconciled {
        let components = graph.components(plots);

        let mut candidates: Vec<(usize, u64, usize)> = Vec::new();
        for (index, component) in components.iter().enumerate() {
            let overlapping: Vec<&ColorTable> = self
                .tables
                .values()
                .filter(|t| !t.plots.is_disjoint(component))
                .collect();
            if overlapping.len() > 1 {
                tracing::debug!(
                    tables = ?overlapping.iter().map(|t| t.id).collect::<Vec<_>>(),
                    "color components merged"
                );
            }
            for table in overlapping {
                candidates.push((table.plots.intersection(component).count(), table.id, index));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut assigned: BTreeMap<usize, u64> = BTreeMap::new();
        let mut used: BTreeSet<u64> = BTreeSet::new();
        for (_, table, index) in candidates {
            if assigned.contains_key(&index) || used.contains(&table) {
                continue;
            }
            assigned.insert(index, table);
            used.insert(table);
        }

        let mut result = Reconciled::default();
        let mut next = BTreeMap::new();
        for (index, component) in components.into_iter().enumerate() {
            match assigned.get(&index).and_then(|id| self.tables.remove(id)) {
                Some(mut table) => {
                    if table.plots != component {
                        if !table.plots.is_subset(&component) {
                            tracing::debug!(table = table.id, "color component split");
                        }
                        table.plots = component;
                        result.changed.push(table.id);
                    }
                    next.insert(table.id, table);
                }
                None => {
                    let id = self.fresh_id();
                    next.insert(id, ColorTable::new(id, component));
                    result.changed.push(id);
                }
            }
        }
        result.removed = self.tables.keys().copied().collect();
        for id in &result.removed {
            tracing::debug!(table = id, "color table dropped");
        }
        self.tables = next;
        result
    }

    /// Colorers present in a set of plots and the links between them.
    fn colorers(stores: &Stores, graph: &PlotGraph, plots: &BTreeSet<EntityId>) -> Vec<Colorer> {
        let mut found: Vec<Colorer> = plots
            .iter()
            .filter(|id| stores.plots.get_cached(**id).is_some_and(|p| p.use_color()))
            .map(|id| Colorer::Plot(*id))
            .collect();
        found.extend(
            graph
                .links_within(plots)
                .into_iter()
                .filter(|id| stores.links.get_cached(*id).is_some_and(|l| l.use_color()))
                .map(Colorer::Link),
        );
        found.sort();
        found
    }

    /// Leave at most one colorer per component. Entities that just turned
    /// coloring on are listed in `preferred`, oldest first; the newest one in
    /// a component wins there. Otherwise plots win over links and lower ids
    /// over higher. Returns the cleared entities.
    pub fn enforce_single_colorer(
        &self,
        stores: &mut Stores,
        graph: &PlotGraph,
        preferred: &[Colorer],
    ) -> Vec<Colorer> {
        let mut cleared = Vec::new();
        for table in self.tables.values() {
            let found = Self::colorers(stores, graph, &table.plots);
            if found.len() <= 1 {
                continue;
            }
            let keep = preferred
                .iter()
                .rev()
                .find(|p| found.contains(p))
                .copied()
                .unwrap_or(found[0]);
            for colorer in found.into_iter().filter(|c| *c != keep) {
                match colorer {
                    Colorer::Plot(id) => {
                        stores.plots.edit(id, None, |p| p.set_use_color(false));
                    }
                    Colorer::Link(id) => {
                        stores.links.edit(id, None, |l| l.set_use_color(false));
                    }
                }
                tracing::debug!(?colorer, ?keep, "cleared competing colorer");
                cleared.push(colorer);
            }
        }
        cleared
    }

    /// Recompute one table. Returns whether its colors changed.
    pub fn recompute(&mut self, stores: &Stores, graph: &PlotGraph, table_id: u64) -> bool {
        let Some(table) = self.tables.get(&table_id) else {
            return false;
        };
        let rows: BTreeSet<i64> = table
            .plots
            .iter()
            .filter_map(|id| stores.plots.get_cached(*id))
            .flat_map(|p| p.data().iter().map(|r| r.row_id))
            .collect();
        let colorer = Self::colorers(stores, graph, &table.plots).into_iter().next();

        let base = match colorer {
            Some(Colorer::Plot(id)) => match stores.plots.get_cached(id) {
                Some(plot) => plot_colors(stores, plot, &rows),
                None => BTreeMap::new(),
            },
            Some(Colorer::Link(id)) => link_colors(stores, id, &rows),
            None => rows.iter().map(|r| (*r, NEUTRAL)).collect(),
        };
        let colors: BTreeMap<i64, Rgb> = base
            .into_iter()
            .map(|(row, rgb)| (row, jitter(row, rgb)))
            .collect();

        let Some(table) = self.tables.get_mut(&table_id) else {
            return false;
        };
        if table.colors == colors && table.colorer == colorer {
            return false;
        }
        table.colors = colors;
        table.colorer = colorer;
        tracing::debug!(table = table_id, ?colorer, rows = table.colors.len(), "color table recomputed");
        true
    }
}
