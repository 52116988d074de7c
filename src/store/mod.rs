//! Entity Store.
//!
//! A typed, persistence-backed object cache. The in-memory cache is the
//! single source of truth for reads; the relational store is only touched to
//! hydrate on a cache miss and to write back debounced field changes.
//!
//! All mutation goes through `&mut EntityStore`, so lookups that create on a
//! miss cannot race: the first caller hydrates or creates, and every later
//! identical lookup finds the cached entity.
//!
//! # Modules
//!
//! - [`entity`] - Entity trait, change sets and lookups
//! - [`plot`], [`link`], [`filter`], [`client`] - Entity types
//! - [`bus`] - Engine-wide change bus
//! - [`persist`] - Debounced write coalescer

pub mod bus;
pub mod client;
pub mod entity;
pub mod filter;
pub mod link;
pub mod persist;
pub mod plot;

pub use bus::{Change, ChangeBus, EntityEvent};
pub use client::{Client, ClientKind};
pub use entity::{AnyEntity, Entity, EntityId, EntityKind, Lookup, Origin, NO_ID};
pub use filter::{AxisBinding, ColorSpec, Filter};
pub use link::Link;
pub use plot::{Plot, PlotRow};

use crate::core::error::{SyncError, SyncResult};
use crate::core::time::earliest;
use crate::storage::StorageHandle;
use persist::WriteCoalescer;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Cache and persistence for one entity type.
pub struct EntityStore<T: Entity> {
    storage: StorageHandle,
    bus: ChangeBus,
    cache: BTreeMap<EntityId, T>,
    next_id: EntityId,
    writes: WriteCoalescer,
}

impl<T: Entity> EntityStore<T> {
    /// Open the store: ensure the table exists and continue ids after the
    /// largest persisted one. A storage failure is logged and the store
    /// starts empty.
    pub async fn open(storage: StorageHandle, bus: ChangeBus, debounce: Duration) -> Self {
        let mut next_id = 1;
        match storage.ensure_table(T::TABLE, T::columns()).await {
            Ok(()) => match storage.max_id(T::TABLE).await {
                Ok(max) => next_id = max + 1,
                Err(e) => tracing::warn!(table = T::TABLE, error = %e, "failed to read max id"),
            },
            Err(e) => tracing::warn!(table = T::TABLE, error = %e, "failed to prepare table"),
        }
        Self {
            storage,
            bus,
            cache: BTreeMap::new(),
            next_id,
            writes: WriteCoalescer::new(debounce),
        }
    }

    /// Hydrate every persisted row into the cache without emitting events.
    pub async fn load_all(&mut self) -> SyncResult<usize> {
        let rows = self.storage.load_all(T::TABLE, T::columns()).await?;
        let mut loaded = 0;
        for row in &rows {
            if let Some(entity) = T::hydrate(row) {
                self.next_id = self.next_id.max(entity.id() + 1);
                self.cache.entry(entity.id()).or_insert(entity);
                loaded += 1;
            }
        }
        tracing::info!(table = T::TABLE, loaded, "loaded entities");
        Ok(loaded)
    }

    /// A cached entity.
    pub fn get_cached(&self, id: EntityId) -> Option<&T> {
        self.cache.get(&id)
    }

    /// Whether the id is cached.
    pub fn contains(&self, id: EntityId) -> bool {
        self.cache.contains_key(&id)
    }

    /// Iterate cached entities in id order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.cache.values()
    }

    /// Cached ids in ascending order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.cache.keys().copied().collect()
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// First cached entity matching the lookup.
    pub fn find(&self, lookup: &Lookup) -> Option<&T> {
        if let Some(id) = lookup.id() {
            return self.cache.get(&id).filter(|e| lookup.matches(*e));
        }
        self.cache.values().find(|e| lookup.matches(*e))
    }

    /// Resolve a lookup: the cache first, then the backing store, then
    /// (optionally) creation from the lookup fields.
    pub async fn get(
        &mut self,
        lookup: &Lookup,
        create_if_missing: bool,
        origin: Origin,
    ) -> SyncResult<Option<EntityId>> {
        if let Some(entity) = self.find(lookup) {
            return Ok(Some(entity.id()));
        }

        match self
            .storage
            .load_where(T::TABLE, T::columns(), lookup.pairs().to_vec())
            .await
        {
            Ok(rows) => {
                // A cached id that missed the lookup has changed in memory
                // since its row was written; the row is stale.
                let fresh = rows
                    .iter()
                    .filter_map(|row| T::hydrate(row))
                    .find(|entity| !self.cache.contains_key(&entity.id()));
                if let Some(entity) = fresh {
                    let id = entity.id();
                    self.next_id = self.next_id.max(id + 1);
                    self.cache.insert(id, entity);
                    return Ok(Some(id));
                }
            }
            Err(e) if e.is_retriable() => {
                tracing::warn!(table = T::TABLE, error = %e, "lookup served from cache only");
            }
            Err(e) => return Err(e),
        }

        if !create_if_missing {
            return Ok(None);
        }
        Ok(Some(self.create(lookup.to_fields(), origin).await))
    }

    /// Create an entity from wire fields. Invalid fields are logged and
    /// skipped. The row is inserted immediately.
    pub async fn create(&mut self, fields: Map<String, Value>, origin: Origin) -> EntityId {
        let id = self.next_id;
        self.next_id += 1;

        let mut entity = T::new_with_id(id);
        for (name, value) in &fields {
            if name == "id" {
                continue;
            }
            if let Err(e) = entity.set_field(name, value) {
                tracing::warn!(kind = %T::KIND, id, error = %e, "skipping field on create");
            }
        }
        entity.take_changes();

        let row = entity.to_fields();
        self.cache.insert(id, entity);
        self.bus.publish(EntityEvent {
            kind: T::KIND,
            id,
            change: Change::Created,
            origin,
        });
        tracing::debug!(kind = %T::KIND, id, "created");

        if let Err(e) = self.storage.insert(T::TABLE, T::columns(), id, row).await {
            tracing::warn!(kind = %T::KIND, id, error = %e, "failed to persist new entity");
        }
        id
    }

    /// Delete an entity, returning its final state.
    pub async fn delete(&mut self, id: EntityId, origin: Origin) -> Option<T> {
        let entity = self.cache.remove(&id)?;
        self.writes.cancel(id);
        self.bus.publish(EntityEvent {
            kind: T::KIND,
            id,
            change: Change::Deleted {
                last: entity.clone().wrap(),
            },
            origin,
        });
        tracing::debug!(kind = %T::KIND, id, "deleted");

        if let Err(e) = self.storage.delete(T::TABLE, id).await {
            tracing::warn!(kind = %T::KIND, id, error = %e, "failed to delete persisted entity");
        }
        Some(entity)
    }

    /// Run setters on an entity. Emits one change event listing every changed
    /// field, or nothing when no setter changed a value.
    pub fn edit<R>(
        &mut self,
        id: EntityId,
        origin: Origin,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let entity = self.cache.get_mut(&id)?;
        let result = f(entity);
        let fields = entity.take_changes();
        self.record(id, fields, origin);
        Some(result)
    }

    /// Apply a remote partial diff through the entity setters. Unknown or
    /// ill-typed fields are logged and skipped. Returns the changed fields.
    pub fn apply_patch(
        &mut self,
        id: EntityId,
        origin: Origin,
        patch: &Map<String, Value>,
    ) -> SyncResult<Vec<&'static str>> {
        let entity = self.cache.get_mut(&id).ok_or(SyncError::EntityNotFound {
            kind: T::KIND.as_str(),
            id,
        })?;
        for (name, value) in patch {
            if name == "id" {
                continue;
            }
            if let Err(e) = entity.set_field(name, value) {
                tracing::warn!(kind = %T::KIND, id, error = %e, "skipping patch field");
            }
        }
        let fields = entity.take_changes();
        self.record(id, fields.clone(), origin);
        Ok(fields)
    }

    fn record(&mut self, id: EntityId, fields: Vec<&'static str>, origin: Origin) {
        if fields.is_empty() {
            return;
        }
        let persisted: Vec<&'static str> = fields
            .iter()
            .copied()
            .filter(|f| T::columns().iter().any(|c| c.name == *f))
            .collect();
        self.writes.mark(id, &persisted, Instant::now());
        self.bus.publish(EntityEvent {
            kind: T::KIND,
            id,
            change: Change::Changed { fields },
            origin,
        });
    }

    /// Earliest pending debounced write.
    pub fn next_flush(&self) -> Option<Instant> {
        self.writes.next_due()
    }

    /// Write back the entities whose debounce window has elapsed.
    pub async fn flush_due(&mut self, now: Instant) {
        let due = self.writes.take_due(now);
        self.write_back(due).await;
    }

    /// Write back every pending change.
    pub async fn flush_all(&mut self) {
        let all = self.writes.take_all();
        self.write_back(all).await;
    }

    async fn write_back(&mut self, writes: Vec<(EntityId, Vec<&'static str>)>) {
        for (id, fields) in writes {
            let Some(entity) = self.cache.get(&id) else {
                continue;
            };
            let mut all = entity.to_fields();
            let patch: Map<String, Value> = fields
                .iter()
                .filter_map(|f| all.remove(*f).map(|v| (f.to_string(), v)))
                .collect();
            if let Err(e) = self.storage.update(T::TABLE, T::columns(), id, patch).await {
                tracing::warn!(kind = %T::KIND, id, error = %e, "failed to write back entity");
            }
        }
    }
}

/// The four entity stores sharing one storage worker and change bus.
pub struct Stores {
    pub plots: EntityStore<Plot>,
    pub links: EntityStore<Link>,
    pub filters: EntityStore<Filter>,
    pub clients: EntityStore<Client>,
}

impl Stores {
    /// Open every store and hydrate persisted entities.
    pub async fn open(storage: StorageHandle, bus: ChangeBus, debounce: Duration) -> Self {
        let mut stores = Self {
            plots: EntityStore::open(storage.clone(), bus.clone(), debounce).await,
            links: EntityStore::open(storage.clone(), bus.clone(), debounce).await,
            filters: EntityStore::open(storage.clone(), bus.clone(), debounce).await,
            clients: EntityStore::open(storage, bus, debounce).await,
        };
        stores.load_all().await;
        stores
    }

    async fn load_all(&mut self) {
        let results = [
            (EntityKind::Plot, self.plots.load_all().await),
            (EntityKind::Link, self.links.load_all().await),
            (EntityKind::Filter, self.filters.load_all().await),
            (EntityKind::Client, self.clients.load_all().await),
        ];
        for (kind, result) in results {
            if let Err(e) = result {
                tracing::warn!(%kind, error = %e, "failed to load persisted entities");
            }
        }
    }

    /// Wire snapshot of every entity of a kind.
    pub fn snapshot(&self, kind: EntityKind) -> Vec<Value> {
        fn collect<T: Entity>(store: &EntityStore<T>) -> Vec<Value> {
            store.iter().map(|e| Value::Object(e.to_fields())).collect()
        }
        match kind {
            EntityKind::Plot => collect(&self.plots),
            EntityKind::Link => collect(&self.links),
            EntityKind::Filter => collect(&self.filters),
            EntityKind::Client => collect(&self.clients),
        }
    }

    /// Wire fields of one entity.
    pub fn fields(&self, kind: EntityKind, id: EntityId) -> Option<Map<String, Value>> {
        match kind {
            EntityKind::Plot => self.plots.get_cached(id).map(Entity::to_fields),
            EntityKind::Link => self.links.get_cached(id).map(Entity::to_fields),
            EntityKind::Filter => self.filters.get_cached(id).map(Entity::to_fields),
            EntityKind::Client => self.clients.get_cached(id).map(Entity::to_fields),
        }
    }

    /// Earliest pending debounced write across stores.
    pub fn next_flush(&self) -> Option<Instant> {
        [
            self.links.next_flush(),
            self.filters.next_flush(),
            self.clients.next_flush(),
        ]
        .into_iter()
        .fold(self.plots.next_flush(), earliest)
    }

    /// Write back due entities in every store.
    pub async fn flush_due(&mut self, now: Instant) {
        self.plots.flush_due(now).await;
        self.links.flush_due(now).await;
        self.filters.flush_due(now).await;
        self.clients.flush_due(now).await;
    }

    /// Write back everything pending, used on shutdown.
    pub async fn flush_all(&mut self) {
        self.plots.flush_all().await;
        self.links.flush_all().await;
        self.filters.flush_all().await;
        self.clients.flush_all().await;
    }
}
