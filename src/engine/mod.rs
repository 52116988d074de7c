//! Engine.
//!
//! The single logical event loop. It owns the entity stores, the client
//! registry and the three recompute engines, so every mutation and every
//! recompute is serialized without locks. Transports and the storage worker
//! are reached only through channels.
//!
//! ```text
//! AdapterEvent ──► router ──► Stores ──► change bus ──► settle()
//!                                                        │
//!        ┌──────────────┬─────────────┬──────────────────┤
//!        ▼              ▼             ▼                  ▼
//!   broadcast       Dataflow      FilterEngine       ColorEngine
//!   (Gateway)     (batched)      (synchronous)      (per component)
//! ```
//!
//! - [`graph`] - Plot dependency graph
//! - [`dataflow`] - Batched, cancellable plot recompute
//! - [`filter`] - Polygon inclusion sets
//! - [`color`] - Component color tables
//! - [`admin`] - Administrative text commands

pub mod admin;
pub mod color;
pub mod dataflow;
pub mod filter;
pub mod graph;
mod router;

use crate::adapters::{AdapterEvent, Channel, ClientKey, Command, Envelope, Gateway};
use crate::core::config::Config;
use crate::core::error::{SyncError, SyncResult};
use crate::core::time::earliest;
use crate::storage::StorageHandle;
use crate::store::{
    Change, ChangeBus, ClientKind, Entity, EntityEvent, EntityId, EntityKind, Lookup, Stores,
};
use admin::AdminCommand;
use color::{ColorEngine, Colorer};
use dataflow::{Dataflow, Tier};
use filter::FilterEngine;
use graph::PlotGraph;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::future::pending;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

/// Longest idle sleep of the event loop.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// The collaborative sync engine.
pub struct Engine {
    storage: StorageHandle,
    stores: Stores,
    changes: mpsc::UnboundedReceiver<EntityEvent>,
    gateway: Gateway,
    /// Registered clients and their client record.
    sessions: BTreeMap<ClientKey, EntityId>,
    graph: PlotGraph,
    dataflow: Dataflow,
    filters: FilterEngine,
    colors: ColorEngine,
    topology_dirty: bool,
    colorer_check: bool,
    /// Entities that turned coloring on since the last enforcement.
    preferred_colorers: Vec<Colorer>,
    color_plots: BTreeSet<EntityId>,
    color_tables: BTreeSet<u64>,
}

impl Engine {
    /// Open the stores, repair what a previous run left behind and queue
    /// every plot for recompute.
    pub async fn open(config: &Config, storage: StorageHandle) -> Self {
        let (bus, changes) = ChangeBus::new();
        let debounce = Duration::from_millis(config.storage.write_debounce_ms);
        let stores = Stores::open(storage.clone(), bus, debounce).await;
        let mut engine = Self {
            storage,
            stores,
            changes,
            gateway: Gateway::new(),
            sessions: BTreeMap::new(),
            graph: PlotGraph::default(),
            dataflow: Dataflow::new(&config.dataflow),
            filters: FilterEngine::new(&config.filters),
            colors: ColorEngine::new(),
            topology_dirty: true,
            colorer_check: true,
            preferred_colorers: Vec::new(),
            color_plots: BTreeSet::new(),
            color_tables: BTreeSet::new(),
        };
        engine.bootstrap().await;
        engine
    }

    async fn bootstrap(&mut self) {
        // Nobody is connected yet: half-drawn links are orphans and voice
        // sessions are over.
        let orphans: Vec<EntityId> = self
            .stores
            .links
            .iter()
            .filter(|l| !l.is_finalized())
            .map(|l| l.id())
            .collect();
        for id in orphans {
            self.stores.links.delete(id, None).await;
        }
        for id in self.stores.clients.ids() {
            self.stores.clients.edit(id, None, |c| c.set_voice_active(false));
        }

        self.rebuild_graph();
        let mut links = self.stores.links.ids();
        links.sort_unstable_by(|a, b| b.cmp(a));
        for id in links {
            self.check_link(id).await;
        }

        let now = Instant::now();
        for plot in self.stores.plots.ids() {
            self.dataflow.request(plot, Tier::Fast, now);
        }
        self.settle().await;
        tracing::info!(
            plots = self.stores.plots.len(),
            links = self.stores.links.len(),
            filters = self.stores.filters.len(),
            clients = self.stores.clients.len(),
            "engine ready"
        );
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn graph(&self) -> &PlotGraph {
        &self.graph
    }

    pub fn colors(&self) -> &ColorEngine {
        &self.colors
    }

    pub fn dataflow(&self) -> &Dataflow {
        &self.dataflow
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Client record of a registered client.
    pub fn session(&self, key: &ClientKey) -> Option<EntityId> {
        self.sessions.get(key).copied()
    }

    /// Drive the engine until shutdown.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<AdapterEvent>,
        mut console: Option<mpsc::UnboundedReceiver<String>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("engine started");
        loop {
            let cascading = self.dataflow.is_cascading();
            let wake = self
                .next_wake()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                event = events.recv() => match event {
                    Some(event) => self.handle_adapter(event).await,
                    None => break,
                },

                line = next_line(&mut console) => match line {
                    Some(line) => self.console(&line).await,
                    None => console = None,
                },

                _ = std::future::ready(()), if cascading => {
                    self.step_cascade().await;
                }

                _ = sleep_until(wake) => self.on_timers(Instant::now()).await,
            }
        }
        self.stop().await;
    }

    async fn stop(&mut self) {
        self.stores.flush_all().await;
        self.gateway.clear();
        tracing::info!("engine stopped");
    }

    fn next_wake(&self) -> Option<Instant> {
        [self.filters.next_deadline(), self.stores.next_flush()]
            .into_iter()
            .fold(self.dataflow.next_deadline(), earliest)
    }

    /// Run everything that is due now, including any cascade it starts, to
    /// completion.
    pub async fn run_due(&mut self) {
        loop {
            self.on_timers(Instant::now()).await;
            if !self.dataflow.is_cascading() {
                break;
            }
            while self.dataflow.is_cascading() {
                self.step_cascade().await;
            }
        }
    }

    /// Run the timers that are due now. A due batch starts a cascade but
    /// does not advance it.
    pub async fn run_timers(&mut self) {
        self.on_timers(Instant::now()).await;
    }

    async fn on_timers(&mut self, now: Instant) {
        self.stores.flush_due(now).await;

        for id in self.filters.expired_empty(&self.stores, now) {
            tracing::info!(filter_id = id, "deleting empty filter");
            self.stores.filters.delete(id, None).await;
        }

        let plots = &self.stores.plots;
        self.dataflow
            .start_due(now, &self.graph, |p| plots.contains(p));
        self.settle().await;
    }

    /// Advance the running cascade by one plot. Returns the recomputed plot,
    /// or `None` when the cascade finished or was cancelled.
    pub async fn step_cascade(&mut self) -> Option<EntityId> {
        let plots = &self.stores.plots;
        let plot = self
            .dataflow
            .next_ready(&self.graph, |p| plots.contains(p), Instant::now())?;
        if let Err(e) = dataflow::recompute_plot(&mut self.stores, &self.storage, &self.graph, plot).await {
            tracing::warn!(plot_id = plot, error = %e, "plot recompute failed");
        }
        self.dataflow.complete(plot);
        self.settle().await;
        Some(plot)
    }

    /// Replace the raw data source and recompute every plot.
    pub async fn reload_dataset(
        &mut self,
        columns: Vec<String>,
        rows: Vec<(i64, Vec<Value>)>,
    ) -> SyncResult<()> {
        self.storage.replace_dataset(columns, rows).await?;
        self.reload();
        Ok(())
    }

    fn reload(&mut self) {
        let now = Instant::now();
        for plot in self.stores.plots.ids() {
            self.dataflow.request(plot, Tier::Fast, now);
        }
    }

    /// Handle one transport event.
    pub async fn handle_adapter(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Connected {
                key,
                conn,
                outbound,
            } => {
                if self.gateway.attach(key.clone(), conn, outbound).is_some() {
                    self.client_left(&key).await;
                }
                self.client_joined(&key).await;
            }
            AdapterEvent::Message {
                key,
                conn,
                envelope,
            } => {
                if !self.gateway.is_current(&key, conn) {
                    tracing::debug!(client = %key, conn = %conn, "dropping message from replaced connection");
                    return;
                }
                self.route(&key, envelope).await;
            }
            AdapterEvent::Disconnected { key, conn } => {
                if self.gateway.detach(&key, conn) {
                    self.client_left(&key).await;
                } else {
                    tracing::debug!(client = %key, conn = %conn, "ignoring disconnect of replaced connection");
                }
            }
        }
        self.settle().await;
    }

    async fn client_joined(&mut self, key: &ClientKey) {
        let lookup = Lookup::new()
            .with("name", key.name.clone())
            .with("kind", key.kind.as_str());
        match self.stores.clients.get(&lookup, true, None).await {
            Ok(Some(id)) => {
                self.sessions.insert(key.clone(), id);
                tracing::info!(client = %key, client_id = id, "client joined");
                let ack = Envelope::new(
                    Channel::Registration,
                    Command::Register,
                    json!({ "id": id, "name": key.name, "kind": key.kind }),
                );
                self.gateway.send(key, ack);
            }
            Ok(None) => tracing::warn!(client = %key, "client record unavailable"),
            Err(e) => tracing::warn!(client = %key, error = %e, "failed to resolve client record"),
        }
    }

    async fn client_left(&mut self, key: &ClientKey) {
        let Some(id) = self.sessions.remove(key) else {
            return;
        };
        self.stores.clients.edit(id, None, |c| c.set_voice_active(false));
        let pending: Vec<EntityId> = self
            .stores
            .links
            .iter()
            .filter(|l| l.created_by() == id)
            .map(|l| l.id())
            .collect();
        for link in pending {
            tracing::info!(client = %key, link_id = link, "deleting unfinished link");
            self.stores.links.delete(link, None).await;
        }
        tracing::info!(client = %key, client_id = id, "client left");
    }

    async fn console(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match self.handle_admin(line).await {
            Ok(Some(output)) => tracing::info!("{output}"),
            Ok(None) => tracing::info!(command = line.trim(), "admin command applied"),
            Err(e) => tracing::warn!(command = line.trim(), error = %e, "admin command failed"),
        }
    }

    /// Parse and run an administrative command. Returns text output, if the
    /// command has any.
    pub async fn handle_admin(&mut self, line: &str) -> SyncResult<Option<String>> {
        let command = AdminCommand::parse(line)?;
        let output = self.run_admin(command).await;
        self.settle().await;
        output
    }

    async fn run_admin(&mut self, command: AdminCommand) -> SyncResult<Option<String>> {
        let not_found = |kind: EntityKind, id| SyncError::EntityNotFound {
            kind: kind.as_str(),
            id,
        };
        match command {
            AdminCommand::DeletePlot(id) => {
                self.stores
                    .plots
                    .delete(id, None)
                    .await
                    .ok_or(not_found(EntityKind::Plot, id))?;
            }
            AdminCommand::DeleteLink(id) => {
                self.stores
                    .links
                    .delete(id, None)
                    .await
                    .ok_or(not_found(EntityKind::Link, id))?;
            }
            AdminCommand::Rename { client, name } => {
                self.stores
                    .clients
                    .edit(client, None, |c| c.set_name(name))
                    .ok_or(not_found(EntityKind::Client, client))?;
            }
            AdminCommand::Calibrate(client) => {
                self.stores
                    .clients
                    .edit(client, None, |c| c.set_calibrated(false))
                    .ok_or(not_found(EntityKind::Client, client))?;
            }
            AdminCommand::Debug(client) => {
                self.stores
                    .clients
                    .edit(client, None, |c| {
                        let debug = !c.is_debug();
                        c.set_debug(debug)
                    })
                    .ok_or(not_found(EntityKind::Client, client))?;
            }
            AdminCommand::Restart(name) => {
                self.send_to_web(&name, json!({ "command": "restart" }))?;
            }
            AdminCommand::Configure { client, config } => {
                self.send_to_web(&client, json!({ "command": "configure", "config": config }))?;
            }
            AdminCommand::Reload => self.reload(),
            AdminCommand::Help => return Ok(Some(admin::USAGE.to_string())),
        }
        Ok(None)
    }

    fn send_to_web(&self, name: &str, payload: Value) -> SyncResult<()> {
        let key = ClientKey::new(name, ClientKind::Web);
        if self
            .gateway
            .send(&key, Envelope::new(Channel::Control, Command::Cmd, payload))
        {
            Ok(())
        } else {
            Err(SyncError::ClientNotConnected {
                client: key.to_string(),
            })
        }
    }

    fn rebuild_graph(&mut self) {
        self.graph = PlotGraph::from_links(self.stores.links.iter());
    }

    /// Remove a finalized link that breaks a graph invariant. Returns whether
    /// the link survived.
    async fn check_link(&mut self, id: EntityId) -> bool {
        let Some(link) = self.stores.links.get_cached(id) else {
            return false;
        };
        if !link.is_finalized() {
            return true;
        }
        let plots = &self.stores.plots;
        let verdict = self.graph.validate(link, |p| plots.contains(p));
        match verdict {
            Ok(()) => true,
            Err(violation) => {
                tracing::warn!(link_id = id, %violation, "removing invalid link");
                self.stores.links.delete(id, None).await;
                self.rebuild_graph();
                false
            }
        }
    }

    /// Drain the change bus: broadcast every change, run the reactions it
    /// triggers, then bring color tables up to date. Repeats until no
    /// reaction produces further changes.
    async fn settle(&mut self) {
        loop {
            while let Ok(event) = self.changes.try_recv() {
                self.publish(&event);
                self.react(event).await;
            }
            if !self.refresh_colors() {
                break;
            }
        }
    }

    fn channel_of(&self, event: &EntityEvent) -> Channel {
        match event.kind {
            EntityKind::Plot => Channel::Plot,
            EntityKind::Link => Channel::Link,
            EntityKind::Filter => Channel::Filter,
            EntityKind::Client => {
                let kind = match &event.change {
                    Change::Deleted {
                        last: crate::store::AnyEntity::Client(c),
                    } => Some(c.kind()),
                    _ => self.stores.clients.get_cached(event.id).map(|c| c.kind()),
                };
                match kind {
                    Some(ClientKind::Web) => Channel::WebClient,
                    _ => Channel::ArClient,
                }
            }
        }
    }

    /// Broadcast one change. Field diffs skip the client that caused them;
    /// creations and deletions go to everyone so the author learns the id.
    fn publish(&self, event: &EntityEvent) {
        let channel = self.channel_of(event);
        let (command, payload) = match &event.change {
            Change::Created => match self.stores.fields(event.kind, event.id) {
                Some(fields) => (Command::Add, Value::Object(fields)),
                None => return,
            },
            Change::Changed { fields } => {
                let Some(mut all) = self.stores.fields(event.kind, event.id) else {
                    return;
                };
                let mut diff = Map::new();
                diff.insert("id".into(), json!(event.id));
                for field in fields {
                    if let Some(value) = all.remove(*field) {
                        diff.insert(field.to_string(), value);
                    }
                }
                (Command::Update, Value::Object(diff))
            }
            Change::Deleted { .. } => (Command::Remove, json!({ "id": event.id })),
        };
        let envelope = Envelope::new(channel, command, payload);
        let echo = matches!(event.change, Change::Changed { .. });
        self.gateway.broadcast(&envelope, |key| {
            !(echo && event.origin.is_some() && self.sessions.get(key) == event.origin.as_ref())
        });
    }

    fn mark_topology(&mut self) {
        self.dataflow.bump();
        self.rebuild_graph();
        self.topology_dirty = true;
    }

    async fn react(&mut self, event: EntityEvent) {
        let now = Instant::now();
        match (event.kind, &event.change) {
            (EntityKind::Plot, Change::Created) => {
                self.dataflow.request(event.id, Tier::Fast, now);
                self.topology_dirty = true;
            }
            (EntityKind::Plot, Change::Changed { fields }) => {
                if event.changed_any(crate::store::plot::RECOMPUTE_FIELDS) {
                    self.dataflow.request(event.id, Tier::Fast, now);
                }
                if fields.contains(&"data") {
                    self.filters.refresh_plot(&mut self.stores, event.id);
                    self.color_plots.insert(event.id);
                }
                if fields.contains(&"useColor") {
                    self.colorer_check = true;
                    self.color_plots.insert(event.id);
                    if self.stores.plots.get_cached(event.id).is_some_and(|p| p.use_color()) {
                        self.prefer_colorer(Colorer::Plot(event.id));
                    }
                }
            }
            (EntityKind::Plot, Change::Deleted { .. }) => {
                let plot = event.id;
                if let Err(e) = self.storage.drop_view(plot).await {
                    tracing::warn!(plot_id = plot, error = %e, "failed to drop plot view");
                }
                let links: Vec<EntityId> = self
                    .stores
                    .links
                    .iter()
                    .filter(|l| l.touches(plot))
                    .map(|l| l.id())
                    .collect();
                for link in links {
                    self.stores.links.delete(link, None).await;
                }
                for filter in FilterEngine::dependents(&self.stores, plot) {
                    self.stores.filters.delete(filter, None).await;
                }
                let selecting: Vec<EntityId> = self
                    .stores
                    .clients
                    .iter()
                    .filter(|c| c.selected_plot() == plot)
                    .map(|c| c.id())
                    .collect();
                for client in selecting {
                    self.stores
                        .clients
                        .edit(client, None, |c| c.set_selected_plot(crate::store::NO_ID));
                }
                self.mark_topology();
            }

            (EntityKind::Link, Change::Created) => {
                self.mark_topology();
                if self.check_link(event.id).await {
                    self.request_downstream_of_link(event.id, now);
                }
            }
            (EntityKind::Link, Change::Changed { fields }) => {
                if event.changed_any(&["upstream", "downstream", "createdBy"]) {
                    self.mark_topology();
                    if self.check_link(event.id).await {
                        self.request_downstream_of_link(event.id, now);
                    }
                }
                if fields.contains(&"useColor") {
                    self.colorer_check = true;
                    if let Some(link) = self.stores.links.get_cached(event.id) {
                        self.color_plots.insert(link.upstream());
                        if link.use_color() {
                            self.prefer_colorer(Colorer::Link(event.id));
                        }
                    }
                }
            }
            (EntityKind::Link, Change::Deleted { last }) => {
                self.mark_topology();
                if let crate::store::AnyEntity::Link(link) = last {
                    if link.is_finalized() && self.stores.plots.contains(link.downstream()) {
                        self.dataflow.request(link.downstream(), Tier::Fast, now);
                    }
                }
            }

            (EntityKind::Filter, Change::Created) => {
                self.filters.track_new(event.id, now);
                self.filters.refresh(&mut self.stores, event.id);
                self.request_filter_origin(event.id, now);
            }
            (EntityKind::Filter, Change::Changed { fields }) => {
                if event.changed_any(&["path", "boundAxis", "origin"]) {
                    self.filters.refresh(&mut self.stores, event.id);
                }
                if event.changed_any(&["includes", "origin"]) {
                    self.request_filter_origin(event.id, now);
                }
                if fields.contains(&"color") || fields.contains(&"includes") {
                    if let Some(filter) = self.stores.filters.get_cached(event.id) {
                        self.color_plots.insert(filter.origin());
                    }
                }
            }
            (EntityKind::Filter, Change::Deleted { last }) => {
                self.filters.forget(event.id);
                if let crate::store::AnyEntity::Filter(filter) = last {
                    if self.stores.plots.contains(filter.origin()) {
                        self.dataflow.request(filter.origin(), Tier::Fast, now);
                        self.color_plots.insert(filter.origin());
                    }
                }
            }

            (EntityKind::Client, _) => {}
        }
    }

    fn prefer_colorer(&mut self, colorer: Colorer) {
        self.preferred_colorers.retain(|c| *c != colorer);
        self.preferred_colorers.push(colorer);
    }

    fn request_downstream_of_link(&mut self, link: EntityId, now: Instant) {
        if let Some(link) = self.stores.links.get_cached(link) {
            if link.is_finalized() && self.stores.plots.contains(link.downstream()) {
                self.dataflow.request(link.downstream(), Tier::Fast, now);
            }
        }
    }

    fn request_filter_origin(&mut self, filter: EntityId, now: Instant) {
        if let Some(filter) = self.stores.filters.get_cached(filter) {
            if self.stores.plots.contains(filter.origin()) {
                self.dataflow.request(filter.origin(), Tier::Fast, now);
            }
        }
    }

    /// Reconcile tables after topology changes, enforce one colorer per
    /// component and recompute stale tables. Returns true when colorer
    /// enforcement changed entities, which must settle first.
    fn refresh_colors(&mut self) -> bool {
        if self.topology_dirty {
            self.topology_dirty = false;
            let outcome = self.colors.reconcile(&self.graph, self.stores.plots.ids());
            for id in outcome.removed {
                let envelope = Envelope::new(Channel::Color, Command::Remove, json!({ "id": id }));
                self.gateway.broadcast(&envelope, |_| true);
            }
            self.color_tables.extend(outcome.changed);
            self.colorer_check = true;
        }

        if self.colorer_check {
            self.colorer_check = false;
            let preferred = std::mem::take(&mut self.preferred_colorers);
            let cleared = self
                .colors
                .enforce_single_colorer(&mut self.stores, &self.graph, &preferred);
            if !cleared.is_empty() {
                return true;
            }
        }

        for plot in std::mem::take(&mut self.color_plots) {
            if let Some(table) = self.colors.table_of(plot) {
                self.color_tables.insert(table);
            }
        }
        for table in std::mem::take(&mut self.color_tables) {
            if self.colors.recompute(&self.stores, &self.graph, table) {
                if let Some(table) = self.colors.table(table) {
                    let envelope = Envelope::new(Channel::Color, Command::Update, table.to_wire());
                    self.gateway.broadcast(&envelope, |_| true);
                }
            }
        }
        false
    }
}

async fn next_line(console: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match console {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}
