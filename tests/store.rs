//! Entity Store persistence tests against an on-disk database.

mod common;

use common::{add_plot, connect, engine_config, send, small_dataset};
use plotsync::adapters::{Channel, Command};
use plotsync::core::config::Config;
use plotsync::engine::Engine;
use plotsync::storage::StorageHandle;
use plotsync::store::{ClientKind, Entity};
use serde_json::json;
use tempfile::TempDir;

fn disk_config(dir: &TempDir) -> Config {
    let mut config = engine_config();
    config.storage.database = dir.path().join("plotsync.db").to_string_lossy().into_owned();
    config
}

async fn open(config: &Config) -> Engine {
    Engine::open(config, StorageHandle::open(&config.storage)).await
}

#[tokio::test]
async fn entities_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);

    let (plot, lens_id) = {
        let mut engine = open(&config).await;
        let (columns, rows) = small_dataset();
        engine.reload_dataset(columns, rows).await.unwrap();
        let lens = connect(&mut engine, "lens", ClientKind::Ar).await;
        let plot = add_plot(&mut engine, &lens, json!({"aggregationLevel": 4})).await;
        send(&mut engine, &lens, Channel::Plot, Command::Update, json!({"id": plot, "useSort": true})).await;
        send(&mut engine, &lens, Channel::Voice, Command::Update, json!({"isVoiceActive": true})).await;
        // A link still being drawn when the server goes away.
        send(&mut engine, &lens, Channel::Link, Command::Add, json!({"upstream": plot})).await;
        engine.run_due().await;
        (plot, engine.session(&lens.key).unwrap())
    };

    let mut engine = open(&config).await;
    engine.run_due().await;

    let restored = engine.stores().plots.get_cached(plot).unwrap();
    assert_eq!(restored.id(), plot);
    assert_eq!(restored.aggregation_level(), 4);
    assert!(restored.use_sort());
    assert_eq!(restored.data().len(), 3);

    assert!(engine.stores().links.is_empty());
    let lens = engine.stores().clients.get_cached(lens_id).unwrap();
    assert_eq!(lens.name(), "lens");
    assert!(!lens.is_voice_active());
}

#[tokio::test]
async fn ids_continue_after_the_largest_persisted_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);

    let first = {
        let mut engine = open(&config).await;
        let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
        add_plot(&mut engine, &tablet, json!({})).await;
        add_plot(&mut engine, &tablet, json!({})).await
    };

    let mut engine = open(&config).await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let next = add_plot(&mut engine, &tablet, json!({})).await;
    assert!(next > first);
    assert_eq!(engine.stores().plots.len(), 3);
}

#[tokio::test]
async fn invalid_links_are_removed_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);

    let (a, b) = {
        let mut engine = open(&config).await;
        let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
        let a = add_plot(&mut engine, &tablet, json!({})).await;
        let b = add_plot(&mut engine, &tablet, json!({})).await;
        common::add_link(&mut engine, &tablet, a, b).await;
        // Rejected at once: the reverse edge closes a loop.
        send(&mut engine, &tablet, Channel::Link, Command::Add, json!({"upstream": b, "downstream": a})).await;
        assert_eq!(engine.stores().links.len(), 1);
        (a, b)
    };

    let engine = open(&config).await;
    assert_eq!(engine.stores().links.len(), 1);
    assert_eq!(engine.graph().upstreams(b), vec![a]);
}

#[tokio::test]
async fn half_drawn_link_is_dropped_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);

    let (a, b) = {
        let mut engine = open(&config).await;
        let lens = connect(&mut engine, "lens", ClientKind::Ar).await;
        let a = add_plot(&mut engine, &lens, json!({})).await;
        let b = add_plot(&mut engine, &lens, json!({})).await;
        let owner = engine.session(&lens.key).unwrap();
        // Both ends are set but the lens is still dragging it.
        send(
            &mut engine,
            &lens,
            Channel::Link,
            Command::Add,
            json!({"upstream": a, "downstream": b, "createdBy": owner}),
        )
        .await;
        let link = engine.stores().links.iter().next().unwrap();
        assert!(!link.is_finalized());
        assert!(engine.graph().is_empty());
        (a, b)
    };

    let engine = open(&config).await;
    assert!(engine.stores().plots.contains(a) && engine.stores().plots.contains(b));
    assert!(engine.stores().links.is_empty());
    assert!(engine.graph().upstreams(b).is_empty());
}

#[tokio::test]
async fn edited_client_is_not_replaced_by_its_stale_row() {
    let mut config = engine_config();
    config.storage.write_debounce_ms = 60_000;
    let mut engine = open(&config).await;

    let lens = connect(&mut engine, "hl", ClientKind::Ar).await;
    let id = engine.session(&lens.key).unwrap();
    engine.handle_admin(&format!("rename {id} alpha")).await.unwrap();
    engine.handle_admin(&format!("debug {id}")).await.unwrap();
    common::disconnect(&mut engine, &lens).await;

    // The row written at creation still says "hl"; the rename has not been
    // flushed yet.
    let again = connect(&mut engine, "hl", ClientKind::Ar).await;

    let edited = engine.stores().clients.get_cached(id).unwrap();
    assert_eq!(edited.name(), "alpha");
    assert!(edited.is_debug());
    assert_ne!(engine.session(&again.key), Some(id));
}
