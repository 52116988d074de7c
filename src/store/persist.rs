//! Debounced persistence.
//!
//! Persisted field writes are accumulated per entity and flushed once the
//! window that opened on the first dirty write has elapsed. Further writes
//! inside the window join the pending flush without extending it, so an
//! entity is written at most once per window.

use super::entity::EntityId;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Pending {
    fields: Vec<&'static str>,
    due: Instant,
}

/// Per-store write coalescer.
#[derive(Debug)]
pub struct WriteCoalescer {
    window: Duration,
    pending: BTreeMap<EntityId, Pending>,
}

impl WriteCoalescer {
    /// Create a coalescer with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
        }
    }

    /// Mark fields of an entity dirty.
    pub fn mark(&mut self, id: EntityId, fields: &[&'static str], now: Instant) {
        if fields.is_empty() {
            return;
        }
        let window = self.window;
        let pending = self.pending.entry(id).or_insert_with(|| Pending {
            fields: Vec::new(),
            due: now + window,
        });
        for &field in fields {
            if !pending.fields.contains(&field) {
                pending.fields.push(field);
            }
        }
    }

    /// Drop any pending write for an entity.
    pub fn cancel(&mut self, id: EntityId) {
        self.pending.remove(&id);
    }

    /// Earliest pending flush.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Take the writes whose window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<(EntityId, Vec<&'static str>)> {
        let due: Vec<EntityId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(id, _)| *id)
            .collect();
        due.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p.fields)))
            .collect()
    }

    /// Take every pending write regardless of its window.
    pub fn take_all(&mut self) -> Vec<(EntityId, Vec<&'static str>)> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(id, p)| (id, p.fields))
            .collect()
    }

    /// Number of entities with pending writes.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
