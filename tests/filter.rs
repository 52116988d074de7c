//! Filter engine integration tests.

mod common;

use common::{add_plot, connect, engine, send};
use plotsync::adapters::{Channel, Command};
use plotsync::store::ClientKind;
use serde_json::json;

#[tokio::test]
async fn includes_follow_the_polygon() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let plot = add_plot(&mut engine, &tablet, json!({})).await;

    let lower_left = json!([[-0.1, -0.1], [0.6, -0.1], [0.6, 0.6], [-0.1, 0.6]]);
    send(&mut engine, &tablet, Channel::Filter, Command::Add, json!({"origin": plot, "path": lower_left})).await;
    let id = engine.stores().filters.ids()[0];
    assert_eq!(engine.stores().filters.get_cached(id).unwrap().includes(), &[1, 2]);

    let upper_right = json!([[0.4, 0.4], [1.1, 0.4], [1.1, 1.1], [0.4, 1.1]]);
    send(&mut engine, &tablet, Channel::Filter, Command::Update, json!({"id": id, "path": upper_right})).await;
    assert_eq!(engine.stores().filters.get_cached(id).unwrap().includes(), &[2, 3]);
}

#[tokio::test]
async fn axis_binding_uses_one_extent() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let plot = add_plot(&mut engine, &tablet, json!({})).await;

    // A thin band over x in [0.4, 0.6] that misses every point in y.
    let band = json!([[0.4, 2.0], [0.6, 2.0], [0.6, 3.0], [0.4, 3.0]]);
    send(
        &mut engine,
        &tablet,
        Channel::Filter,
        Command::Add,
        json!({"origin": plot, "path": band, "boundAxis": "x"}),
    )
    .await;
    let id = engine.stores().filters.ids()[0];
    assert_eq!(engine.stores().filters.get_cached(id).unwrap().includes(), &[2]);
}

#[tokio::test]
async fn filters_on_one_plot_are_ored() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let plot = add_plot(&mut engine, &tablet, json!({})).await;

    let first = json!([[-0.1, -0.1], [0.1, -0.1], [0.1, 0.1], [-0.1, 0.1]]);
    let last = json!([[0.9, 0.9], [1.1, 0.9], [1.1, 1.1], [0.9, 1.1]]);
    send(&mut engine, &tablet, Channel::Filter, Command::Add, json!({"origin": plot, "path": first})).await;
    send(&mut engine, &tablet, Channel::Filter, Command::Add, json!({"origin": plot, "path": last})).await;

    assert_eq!(common::visible_rows(&engine, plot), vec![1, 3]);
}

#[tokio::test]
async fn empty_filter_is_deleted_after_grace() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let plot = add_plot(&mut engine, &tablet, json!({})).await;

    let nowhere = json!([[5.0, 5.0], [6.0, 5.0], [6.0, 6.0]]);
    send(&mut engine, &tablet, Channel::Filter, Command::Add, json!({"origin": plot, "path": nowhere})).await;

    assert!(engine.stores().filters.is_empty());
    assert_eq!(common::visible_rows(&engine, plot), vec![1, 2, 3]);
}

#[tokio::test]
async fn includes_are_read_only_for_clients() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let plot = add_plot(&mut engine, &tablet, json!({})).await;
    let all = json!([[-0.1, -0.1], [1.1, -0.1], [1.1, 1.1], [-0.1, 1.1]]);
    send(&mut engine, &tablet, Channel::Filter, Command::Add, json!({"origin": plot, "path": all})).await;
    let id = engine.stores().filters.ids()[0];

    send(&mut engine, &tablet, Channel::Filter, Command::Update, json!({"id": id, "includes": [9]})).await;

    assert_eq!(engine.stores().filters.get_cached(id).unwrap().includes(), &[1, 2, 3]);
}
