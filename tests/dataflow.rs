//! Dataflow integration tests.
//!
//! Drive the engine with client messages over an in-memory store and check
//! the derived datasets along the plot graph.

mod common;

use common::{add_link, add_plot, connect, deliver, engine, send, visible_rows};
use plotsync::adapters::{Channel, Command};
use plotsync::engine::dataflow::Tier;
use plotsync::store::{ClientKind, Entity, PlotRow};
use serde_json::json;

const CORNER: [[f64; 2]; 4] = [[-0.1, -0.1], [0.2, -0.1], [0.2, 0.2], [-0.1, 0.2]];

// ============================================================================
// Cascades
// ============================================================================

#[tokio::test]
async fn new_plot_derives_from_dataset() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let plot = add_plot(&mut engine, &tablet, json!({})).await;

    let data = engine.stores().plots.get_cached(plot).unwrap().data().to_vec();
    assert_eq!(data.len(), 3);
    assert_eq!(data[0].x, Some(0.0));
    assert_eq!(data[1].x, Some(0.5));
    assert_eq!(data[2].y, Some(1.0));
    assert!(data.iter().all(|r| !r.filtered));
}

#[tokio::test]
async fn filter_on_root_cascades_down_the_chain() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let a = add_plot(&mut engine, &tablet, json!({})).await;
    let b = add_plot(&mut engine, &tablet, json!({})).await;
    let c = add_plot(&mut engine, &tablet, json!({})).await;
    add_link(&mut engine, &tablet, a, b).await;
    add_link(&mut engine, &tablet, b, c).await;
    assert_eq!(visible_rows(&engine, c), vec![1, 2, 3]);

    send(
        &mut engine,
        &tablet,
        Channel::Filter,
        Command::Add,
        json!({"origin": a, "path": CORNER}),
    )
    .await;

    assert_eq!(visible_rows(&engine, a), vec![1]);
    // B and C only see what A keeps, so they were computed after A.
    assert_eq!(engine.stores().plots.get_cached(b).unwrap().data().len(), 1);
    assert_eq!(visible_rows(&engine, c), vec![1]);
}

#[tokio::test]
async fn removing_a_link_recomputes_downstream() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let a = add_plot(&mut engine, &tablet, json!({})).await;
    let b = add_plot(&mut engine, &tablet, json!({})).await;
    let link = add_link(&mut engine, &tablet, a, b).await;
    send(
        &mut engine,
        &tablet,
        Channel::Filter,
        Command::Add,
        json!({"origin": a, "path": CORNER}),
    )
    .await;
    assert_eq!(visible_rows(&engine, b), vec![1]);

    send(&mut engine, &tablet, Channel::Link, Command::Remove, json!({"id": link})).await;

    assert_eq!(visible_rows(&engine, b), vec![1, 2, 3]);
}

#[tokio::test]
async fn deleting_a_plot_detaches_links_and_filters() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let a = add_plot(&mut engine, &tablet, json!({})).await;
    let b = add_plot(&mut engine, &tablet, json!({})).await;
    add_link(&mut engine, &tablet, a, b).await;
    send(
        &mut engine,
        &tablet,
        Channel::Filter,
        Command::Add,
        json!({"origin": a, "path": CORNER}),
    )
    .await;
    assert_eq!(engine.stores().filters.len(), 1);

    send(&mut engine, &tablet, Channel::Plot, Command::Remove, json!(a)).await;

    assert!(engine.stores().links.is_empty());
    assert!(engine.stores().filters.is_empty());
    assert!(engine.graph().is_empty());
    assert_eq!(visible_rows(&engine, b), vec![1, 2, 3]);
}

#[tokio::test]
async fn disabling_filter_use_restores_rows() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let a = add_plot(&mut engine, &tablet, json!({})).await;
    send(
        &mut engine,
        &tablet,
        Channel::Filter,
        Command::Add,
        json!({"origin": a, "path": CORNER}),
    )
    .await;
    assert_eq!(visible_rows(&engine, a), vec![1]);

    send(&mut engine, &tablet, Channel::Plot, Command::Update, json!({"id": a, "useFilter": false})).await;

    assert_eq!(visible_rows(&engine, a), vec![1, 2, 3]);
}

#[tokio::test]
async fn deleting_a_plot_mid_cascade_cancels_it() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let a = add_plot(&mut engine, &tablet, json!({})).await;
    let b = add_plot(&mut engine, &tablet, json!({})).await;
    let c = add_plot(&mut engine, &tablet, json!({})).await;
    add_link(&mut engine, &tablet, a, b).await;
    add_link(&mut engine, &tablet, b, c).await;

    deliver(&mut engine, &tablet, Channel::Plot, Command::Update, json!({"id": a, "dimX": "b"})).await;
    engine.run_timers().await;
    let pending: Vec<i64> = engine.dataflow().cascade().unwrap().pending().copied().collect();
    assert_eq!(pending, vec![a, b, c]);

    assert_eq!(engine.step_cascade().await, Some(a));
    let before = engine.dataflow().transaction();

    deliver(&mut engine, &tablet, Channel::Plot, Command::Remove, json!(b)).await;
    assert!(engine.dataflow().transaction() > before);
    assert!(engine.stores().plots.get_cached(b).is_none());

    // The stale cascade stops before its next hop and hands C on.
    assert_eq!(engine.step_cascade().await, None);
    assert!(!engine.dataflow().is_cascading());
    assert!(engine.dataflow().queued(Tier::Slow).contains(&c));
    assert!(!engine.dataflow().queued(Tier::Slow).contains(&b));

    engine.run_due().await;
    assert!(engine.stores().plots.get_cached(b).is_none());
    assert_eq!(visible_rows(&engine, c), vec![1, 2, 3]);
}

// ============================================================================
// Determinism
// ============================================================================

#[tokio::test]
async fn recompute_is_idempotent() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let a = add_plot(&mut engine, &tablet, json!({"useSort": true, "aggregationLevel": 2})).await;
    let before: Vec<PlotRow> = engine.stores().plots.get_cached(a).unwrap().data().to_vec();

    engine.handle_admin("reload").await.unwrap();
    engine.run_due().await;

    let after = engine.stores().plots.get_cached(a).unwrap().data().to_vec();
    assert_eq!(before, after);
    assert_eq!(
        serde_json::to_string(&before).unwrap(),
        serde_json::to_string(&after).unwrap()
    );
}

#[tokio::test]
async fn changing_a_dimension_recomputes() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let a = add_plot(&mut engine, &tablet, json!({})).await;
    send(&mut engine, &tablet, Channel::Plot, Command::Update, json!({"id": a, "dimX": "missing"})).await;

    let data = engine.stores().plots.get_cached(a).unwrap().data().to_vec();
    assert_eq!(data.len(), 3);
    assert!(data.iter().all(|r| r.x.is_none() && r.y.is_some()));
}

// ============================================================================
// Graph invariants
// ============================================================================

#[tokio::test]
async fn retargeting_a_link_onto_an_existing_edge_removes_it() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let a = add_plot(&mut engine, &tablet, json!({})).await;
    let b = add_plot(&mut engine, &tablet, json!({})).await;
    let c = add_plot(&mut engine, &tablet, json!({})).await;
    let first = add_link(&mut engine, &tablet, a, b).await;
    let second = add_link(&mut engine, &tablet, a, c).await;

    send(&mut engine, &tablet, Channel::Link, Command::Update, json!({"id": first, "downstream": c})).await;

    let a_to_c: Vec<i64> = engine
        .stores()
        .links
        .iter()
        .filter(|l| l.upstream() == a && l.downstream() == c)
        .map(|l| l.id())
        .collect();
    assert_eq!(a_to_c, vec![second]);
    assert!(engine.stores().links.get_cached(first).is_none());
}
