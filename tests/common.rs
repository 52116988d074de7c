//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use plotsync::adapters::{AdapterEvent, Channel, ClientKey, Command, Envelope};
use plotsync::core::config::Config;
use plotsync::engine::Engine;
use plotsync::net::tcp::ConnectionId;
use plotsync::storage::StorageHandle;
use plotsync::store::{ClientKind, EntityId};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Configuration for engine tests: in-memory database and zero-length
/// windows, so `Engine::run_due` completes all pending work immediately.
pub fn engine_config() -> Config {
    let mut config = Config::default();
    config.storage.database = ":memory:".into();
    config.storage.write_debounce_ms = 0;
    config.dataflow.fast_window_ms = 0;
    config.dataflow.slow_window_ms = 0;
    config.filters.empty_grace_ms = 0;
    config
}

/// Write a config file.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Dataset with dimensions `a` and `b` and three rows.
pub fn small_dataset() -> (Vec<String>, Vec<(i64, Vec<Value>)>) {
    (
        vec!["a".into(), "b".into()],
        vec![
            (1, vec![json!(1.0), json!(10.0)]),
            (2, vec![json!(2.0), json!(20.0)]),
            (3, vec![json!(3.0), json!(30.0)]),
        ],
    )
}

/// Open an engine on a private in-memory store loaded with `small_dataset`.
pub async fn engine() -> Engine {
    let config = engine_config();
    let storage = StorageHandle::open(&config.storage);
    let mut engine = Engine::open(&config, storage).await;
    let (columns, rows) = small_dataset();
    engine
        .reload_dataset(columns, rows)
        .await
        .expect("dataset loads");
    engine.run_due().await;
    engine
}

/// A registered client as seen by the engine.
pub struct TestClient {
    pub key: ClientKey,
    pub conn: ConnectionId,
    pub rx: mpsc::UnboundedReceiver<Envelope>,
}

impl TestClient {
    /// Everything queued for this client so far.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    /// Queued messages on one channel with one command.
    pub fn drain_matching(&mut self, channel: Channel, command: Command) -> Vec<Value> {
        self.drain()
            .into_iter()
            .filter(|e| e.channel == channel.id() && e.command == command.as_str())
            .map(|e| e.payload)
            .collect()
    }
}

/// Register a client with the engine.
pub async fn connect(engine: &mut Engine, name: &str, kind: ClientKind) -> TestClient {
    let key = ClientKey::new(name, kind);
    let conn = ConnectionId(NEXT_CONN.fetch_add(1, Ordering::Relaxed));
    let (outbound, rx) = mpsc::unbounded_channel();
    engine
        .handle_adapter(AdapterEvent::Connected {
            key: key.clone(),
            conn,
            outbound,
        })
        .await;
    TestClient { key, conn, rx }
}

/// Deliver a message from a client without running timers.
pub async fn deliver(engine: &mut Engine, client: &TestClient, channel: Channel, command: Command, payload: Value) {
    engine
        .handle_adapter(AdapterEvent::Message {
            key: client.key.clone(),
            conn: client.conn,
            envelope: Envelope::new(channel, command, payload),
        })
        .await;
}

/// Deliver a message from a client and run whatever became due.
pub async fn send(engine: &mut Engine, client: &TestClient, channel: Channel, command: Command, payload: Value) {
    deliver(engine, client, channel, command, payload).await;
    engine.run_due().await;
}

/// Disconnect a client.
pub async fn disconnect(engine: &mut Engine, client: &TestClient) {
    engine
        .handle_adapter(AdapterEvent::Disconnected {
            key: client.key.clone(),
            conn: client.conn,
        })
        .await;
    engine.run_due().await;
}

/// Add a plot over dimensions `a`/`b` and return its id.
pub async fn add_plot(engine: &mut Engine, client: &TestClient, extra: Value) -> EntityId {
    let mut fields = json!({"dimX": "a", "dimY": "b"});
    if let (Some(fields), Value::Object(extra)) = (fields.as_object_mut(), extra) {
        fields.extend(extra);
    }
    let before = engine.stores().plots.ids();
    send(engine, client, Channel::Plot, Command::Add, fields).await;
    newest(before, engine.stores().plots.ids())
}

/// Add a finalized link and return its id.
pub async fn add_link(engine: &mut Engine, client: &TestClient, upstream: EntityId, downstream: EntityId) -> EntityId {
    let before = engine.stores().links.ids();
    send(
        engine,
        client,
        Channel::Link,
        Command::Add,
        json!({"upstream": upstream, "downstream": downstream}),
    )
    .await;
    newest(before, engine.stores().links.ids())
}

fn newest(before: Vec<EntityId>, after: Vec<EntityId>) -> EntityId {
    after
        .into_iter()
        .find(|id| !before.contains(id))
        .expect("entity was created")
}

/// Row ids of a plot's derived dataset that are not filtered out.
pub fn visible_rows(engine: &Engine, plot: EntityId) -> Vec<i64> {
    engine
        .stores()
        .plots
        .get_cached(plot)
        .expect("plot exists")
        .data()
        .iter()
        .filter(|r| !r.filtered)
        .map(|r| r.row_id)
        .collect()
}
