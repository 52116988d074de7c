//! Dataflow Engine.
//!
//! Recomputes each plot's derived dataset from its source rows and cascades
//! the change downstream.
//!
//! Requests are coalesced into two batches: a fast batch for direct edits
//! and a slow batch for rescheduled work. When a batch comes due it becomes
//! a [`Cascade`]: the requested plots plus everything downstream of them,
//! processed one plot per engine turn in dependency order. Structural edits
//! advance a transaction counter; a cascade that observes a newer
//! transaction before its next hop stops and hands its remaining plots to
//! the slow batch.

use super::graph::PlotGraph;
use crate::core::config::DataflowConfig;
use crate::core::error::SyncResult;
use crate::core::time::{earliest, CoalescingWindow};
use crate::storage::{SourceRow, StorageHandle};
use crate::store::{EntityId, Plot, PlotRow, Stores};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Which batch a request lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Fast,
    Slow,
}

#[derive(Debug)]
struct Batch {
    window: CoalescingWindow,
    plots: BTreeSet<EntityId>,
}

impl Batch {
    fn new(window: Duration) -> Self {
        Self {
            window: CoalescingWindow::new(window),
            plots: BTreeSet::new(),
        }
    }

    fn add(&mut self, plot: EntityId, now: Instant) {
        self.plots.insert(plot);
        self.window.open(now);
    }

    fn take(&mut self) -> BTreeSet<EntityId> {
        self.window.close();
        std::mem::take(&mut self.plots)
    }
}

/// A running cascade.
#[derive(Debug)]
pub struct Cascade {
    epoch: u64,
    work: BTreeSet<EntityId>,
    queue: VecDeque<EntityId>,
    done: BTreeSet<EntityId>,
}

impl Cascade {
    /// Plots still waiting, in rotation order.
    pub fn pending(&self) -> impl Iterator<Item = &EntityId> {
        self.queue.iter()
    }
}

/// Batching, ordering and cancellation state of the recompute pipeline.
#[derive(Debug)]
pub struct Dataflow {
    transaction: u64,
    fast: Batch,
    slow: Batch,
    cascade: Option<Cascade>,
}

impl Dataflow {
    pub fn new(config: &DataflowConfig) -> Self {
        Self {
            transaction: 0,
            fast: Batch::new(Duration::from_millis(config.fast_window_ms)),
            slow: Batch::new(Duration::from_millis(config.slow_window_ms)),
            cascade: None,
        }
    }

    /// Current transaction counter.
    pub fn transaction(&self) -> u64 {
        self.transaction
    }

    /// Record a structural change.
    pub fn bump(&mut self) -> u64 {
        self.transaction += 1;
        tracing::trace!(transaction = self.transaction, "transaction advanced");
        self.transaction
    }

    /// Queue a plot for recompute.
    pub fn request(&mut self, plot: EntityId, tier: Tier, now: Instant) {
        match tier {
            Tier::Fast => self.fast.add(plot, now),
            Tier::Slow => self.slow.add(plot, now),
        }
    }

    /// Whether a cascade is in progress.
    pub fn is_cascading(&self) -> bool {
        self.cascade.is_some()
    }

    /// The running cascade, if any.
    pub fn cascade(&self) -> Option<&Cascade> {
        self.cascade.as_ref()
    }

    /// Plots queued in a batch.
    pub fn queued(&self, tier: Tier) -> &BTreeSet<EntityId> {
        match tier {
            Tier::Fast => &self.fast.plots,
            Tier::Slow => &self.slow.plots,
        }
    }

    /// When the next batch comes due. `None` while a cascade is running or
    /// nothing is queued.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.cascade.is_some() {
            return None;
        }
        earliest(self.fast.window.deadline(), self.slow.window.deadline())
    }

    /// Start a cascade from the first due batch, fast before slow. Returns
    /// whether a cascade started.
    pub fn start_due(
        &mut self,
        now: Instant,
        graph: &PlotGraph,
        exists: impl Fn(EntityId) -> bool,
    ) -> bool {
        if self.cascade.is_some() {
            return false;
        }
        let (tier, roots) = if self.fast.window.is_due(now) {
            (Tier::Fast, self.fast.take())
        } else if self.slow.window.is_due(now) {
            (Tier::Slow, self.slow.take())
        } else {
            return false;
        };

        let work: BTreeSet<EntityId> = graph
            .with_descendants(roots.iter().copied().filter(|p| exists(*p)))
            .into_iter()
            .filter(|p| exists(*p))
            .collect();
        if work.is_empty() {
            return false;
        }
        tracing::debug!(
            ?tier,
            roots = roots.len(),
            plots = work.len(),
            transaction = self.transaction,
            "cascade started"
        );
        self.cascade = Some(Cascade {
            epoch: self.transaction,
            queue: work.iter().copied().collect(),
            work,
            done: BTreeSet::new(),
        });
        true
    }

    /// Next plot whose upstreams within the cascade are all done.
    ///
    /// Rotates past plots that still wait on an upstream. Deleted plots are
    /// dropped. If the transaction moved on since the cascade began, the
    /// cascade stops and its remaining live plots go to the slow batch.
    pub fn next_ready(
        &mut self,
        graph: &PlotGraph,
        exists: impl Fn(EntityId) -> bool,
        now: Instant,
    ) -> Option<EntityId> {
        let cascade = self.cascade.as_mut()?;

        if cascade.epoch != self.transaction {
            let remaining: Vec<EntityId> = cascade.queue.drain(..).filter(|p| exists(*p)).collect();
            tracing::debug!(
                epoch = cascade.epoch,
                transaction = self.transaction,
                rescheduled = remaining.len(),
                "stale cascade rescheduled"
            );
            self.cascade = None;
            for plot in remaining {
                self.slow.add(plot, now);
            }
            return None;
        }

        cascade.queue.retain(|p| exists(*p));
        let mut rotations = 0;
        while let Some(plot) = cascade.queue.pop_front() {
            let waiting = graph
                .upstreams(plot)
                .into_iter()
                .any(|up| cascade.work.contains(&up) && !cascade.done.contains(&up) && exists(up));
            if !waiting || rotations >= cascade.queue.len() + 1 {
                if waiting {
                    tracing::warn!(plot_id = plot, "cascade stalled on a cycle, recomputing anyway");
                }
                return Some(plot);
            }
            cascade.queue.push_back(plot);
            rotations += 1;
        }

        tracing::debug!(plots = cascade.done.len(), "cascade finished");
        self.cascade = None;
        None
    }

    /// Mark a plot handed out by [`next_ready`](Self::next_ready) as done.
    pub fn complete(&mut self, plot: EntityId) {
        if let Some(cascade) = self.cascade.as_mut() {
            cascade.done.insert(plot);
        }
    }
}

/// Derived dataset of one plot.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub rows: Vec<PlotRow>,
    /// Row ids the plot exposes downstream, or `None` when nothing is
    /// filtered out.
    pub kept: Option<Vec<i64>>,
}

/// Map raw dimension values to numbers. Numbers (and numeric strings) pass
/// through, booleans become 0/1 and other strings become their index among
/// the sorted distinct strings.
fn transform(values: &[&Value]) -> Vec<Option<f64>> {
    let categories: BTreeSet<&str> = values
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|s| s.trim().parse::<f64>().is_err())
        .collect();
    values
        .iter()
        .map(|value| match value {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Some(n),
                _ => categories.iter().position(|c| c == s).map(|i| i as f64),
            },
            _ => None,
        })
        .collect()
}

/// Min/max normalize into [0, 1]. A constant column maps to 0.5.
fn normalize(values: &mut [Option<f64>]) {
    let (min, max) = values
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    for value in values.iter_mut().flatten() {
        *value = if max > min { (*value - min) / (max - min) } else { 0.5 };
    }
}

/// Replace each value with its rank among the non-null values, scaled to
/// [0, 1]. Ties keep source order.
fn rank(values: &mut [Option<f64>]) {
    let mut order: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();
    order.sort_by(|a, b| a.1.total_cmp(&b.1));
    let n = order.len();
    for (rank, (index, _)) in order.into_iter().enumerate() {
        values[index] = Some(if n > 1 { rank as f64 / (n - 1) as f64 } else { 0.5 });
    }
}

/// Snap to the center of one of `bins` equal-width bins.
fn snap(value: f64, bins: u32) -> f64 {
    let bins = f64::from(bins);
    let bin = (value * bins).floor().clamp(0.0, bins - 1.0);
    (bin + 0.5) / bins
}

/// Derive a plot's dataset from its source rows. `includes` is the union of
/// the bound filters' inclusion sets, or `None` when the plot has no filter.
pub fn derive_rows(source: &[SourceRow], plot: &Plot, includes: Option<&BTreeSet<i64>>) -> Derived {
    let xs: Vec<&Value> = source.iter().map(|r| &r.x).collect();
    let ys: Vec<&Value> = source.iter().map(|r| &r.y).collect();
    let mut x = transform(&xs);
    let mut y = transform(&ys);
    normalize(&mut x);
    normalize(&mut y);
    if plot.use_sort() {
        rank(&mut y);
    }
    let bins = plot.aggregation_level();
    if bins > 0 {
        for value in x.iter_mut().chain(y.iter_mut()).flatten() {
            *value = snap(*value, bins);
        }
    }

    let rows: Vec<PlotRow> = source
        .iter()
        .zip(x.into_iter().zip(y))
        .map(|(row, (x, y))| PlotRow {
            row_id: row.row_id,
            x,
            y,
            filtered: plot.use_filter() && includes.is_some_and(|set| !set.contains(&row.row_id)),
        })
        .collect();

    let kept = rows
        .iter()
        .any(|r| r.filtered)
        .then(|| rows.iter().filter(|r| !r.filtered).map(|r| r.row_id).collect());
    Derived { rows, kept }
}

/// Union of the inclusion sets of every filter drawn on `plot`, or `None`
/// when it has none.
pub fn filter_union(stores: &Stores, plot: EntityId) -> Option<BTreeSet<i64>> {
    let mut bound = stores.filters.iter().filter(|f| f.origin() == plot).peekable();
    bound.peek()?;
    Some(bound.flat_map(|f| f.includes().iter().copied()).collect())
}

/// Recompute one plot: read its source rows, derive the dataset, store it
/// and republish the plot's view. Returns whether the dataset changed.
pub async fn recompute_plot(
    stores: &mut Stores,
    storage: &StorageHandle,
    graph: &PlotGraph,
    plot_id: EntityId,
) -> SyncResult<bool> {
    let Some(plot) = stores.plots.get_cached(plot_id) else {
        return Ok(false);
    };
    let upstreams: Vec<EntityId> = graph
        .upstreams(plot_id)
        .into_iter()
        .filter(|p| stores.plots.contains(*p))
        .collect();
    let source = storage
        .source_rows(upstreams.clone(), plot.dim_x().to_string(), plot.dim_y().to_string())
        .await?;
    let includes = filter_union(stores, plot_id);
    let derived = match stores.plots.get_cached(plot_id) {
        Some(plot) => derive_rows(&source, plot, includes.as_ref()),
        None => return Ok(false),
    };

    let changed = stores
        .plots
        .edit(plot_id, None, |p| p.set_data(derived.rows))
        .unwrap_or(false);
    storage.replace_view(plot_id, upstreams, derived.kept).await?;
    tracing::debug!(plot_id, changed, "plot recomputed");
    Ok(changed)
}
