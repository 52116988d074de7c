//! Engine-wide change bus.
//!
//! Every store publishes its created/changed/deleted events onto one
//! unbounded channel. Events for a single entity arrive in emission order.

use super::entity::{AnyEntity, EntityId, EntityKind, Origin};
use tokio::sync::mpsc;

/// What happened to an entity.
#[derive(Debug, Clone)]
pub enum Change {
    /// The entity was created.
    Created,
    /// The listed wire fields changed.
    Changed { fields: Vec<&'static str> },
    /// The entity was deleted; `last` is its final state.
    Deleted { last: AnyEntity },
}

/// A change event.
#[derive(Debug, Clone)]
pub struct EntityEvent {
    pub kind: EntityKind,
    pub id: EntityId,
    pub change: Change,
    /// Client that caused the change, or `None` for internal changes.
    pub origin: Origin,
}

impl EntityEvent {
    /// Whether this is a change touching any of `fields`.
    pub fn changed_any(&self, fields: &[&str]) -> bool {
        match &self.change {
            Change::Changed { fields: changed } => changed.iter().any(|f| fields.contains(f)),
            _ => false,
        }
    }
}

/// Sending side of the change bus.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: mpsc::UnboundedSender<EntityEvent>,
}

impl ChangeBus {
    /// Create a bus and its receiving side.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EntityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. Dropped silently once the receiver is gone.
    pub fn publish(&self, event: EntityEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("change bus closed");
        }
    }
}
