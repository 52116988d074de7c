//! Engine routing and session tests.

mod common;

use common::{add_plot, connect, disconnect, engine, send};
use plotsync::adapters::{AdapterEvent, Channel, Command, Envelope};
use plotsync::error::SyncError;
use plotsync::store::ClientKind;
use serde_json::json;

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn registration_is_acknowledged_with_client_id() {
    let mut engine = engine().await;
    let mut lens = connect(&mut engine, "lens-1", ClientKind::Ar).await;

    let acks = lens.drain_matching(Channel::Registration, Command::Register);
    assert_eq!(acks.len(), 1);
    let id = engine.session(&lens.key).unwrap();
    assert_eq!(acks[0]["id"], json!(id));
    assert_eq!(acks[0]["name"], json!("lens-1"));
    assert_eq!(engine.stores().clients.get_cached(id).unwrap().kind(), ClientKind::Ar);
}

#[tokio::test]
async fn reconnecting_reuses_the_client_record() {
    let mut engine = engine().await;
    let first = connect(&mut engine, "tablet", ClientKind::Web).await;
    let id = engine.session(&first.key).unwrap();
    disconnect(&mut engine, &first).await;
    assert!(engine.session(&first.key).is_none());

    let second = connect(&mut engine, "tablet", ClientKind::Web).await;
    assert_eq!(engine.session(&second.key), Some(id));
    assert_eq!(engine.stores().clients.len(), 1);
}

#[tokio::test]
async fn replaced_connection_is_ignored() {
    let mut engine = engine().await;
    let old = connect(&mut engine, "tablet", ClientKind::Web).await;
    let new = connect(&mut engine, "tablet", ClientKind::Web).await;
    assert!(engine.gateway().is_current(&new.key, new.conn));

    // Messages and the disconnect of the evicted connection change nothing.
    send(&mut engine, &old, Channel::Plot, Command::Add, json!({"dimX": "a", "dimY": "b"})).await;
    assert!(engine.stores().plots.is_empty());
    disconnect(&mut engine, &old).await;
    assert!(engine.gateway().is_connected(&new.key));
    assert!(engine.session(&new.key).is_some());
}

#[tokio::test]
async fn disconnect_drops_unfinished_links_and_voice() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let lens = connect(&mut engine, "lens", ClientKind::Ar).await;
    let a = add_plot(&mut engine, &tablet, json!({})).await;

    send(&mut engine, &lens, Channel::Link, Command::Add, json!({"upstream": a})).await;
    send(&mut engine, &lens, Channel::Voice, Command::Update, json!(true)).await;
    let lens_id = engine.session(&lens.key).unwrap();
    assert_eq!(engine.stores().links.len(), 1);
    let link = engine.stores().links.iter().next().unwrap();
    assert_eq!(link.created_by(), lens_id);
    assert!(!link.is_finalized());
    assert!(engine.stores().clients.get_cached(lens_id).unwrap().is_voice_active());

    disconnect(&mut engine, &lens).await;

    assert!(engine.stores().links.is_empty());
    assert!(!engine.stores().clients.get_cached(lens_id).unwrap().is_voice_active());
}

// ============================================================================
// Propagation
// ============================================================================

#[tokio::test]
async fn updates_skip_their_author_but_creations_do_not() {
    let mut engine = engine().await;
    let mut tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let mut lens = connect(&mut engine, "lens", ClientKind::Ar).await;
    let plot = add_plot(&mut engine, &tablet, json!({})).await;

    assert!(tablet
        .drain_matching(Channel::Plot, Command::Add)
        .iter()
        .any(|p| p["id"] == json!(plot)));
    assert_eq!(lens.drain_matching(Channel::Plot, Command::Add).len(), 1);

    send(
        &mut engine,
        &tablet,
        Channel::Plot,
        Command::Update,
        json!({"id": plot, "position": [1.0, 2.0, 3.0]}),
    )
    .await;

    let seen = lens.drain_matching(Channel::Plot, Command::Update);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], json!({"id": plot, "position": [1.0, 2.0, 3.0]}));
    assert!(tablet.drain_matching(Channel::Plot, Command::Update).is_empty());
}

#[tokio::test]
async fn request_returns_snapshot_to_sender_only() {
    let mut engine = engine().await;
    let mut tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let mut lens = connect(&mut engine, "lens", ClientKind::Ar).await;
    add_plot(&mut engine, &tablet, json!({})).await;
    add_plot(&mut engine, &tablet, json!({})).await;
    tablet.drain();
    lens.drain();

    send(&mut engine, &lens, Channel::Plot, Command::Request, json!(null)).await;
    send(&mut engine, &lens, Channel::ArClient, Command::Request, json!(null)).await;

    let plots = lens.drain_matching(Channel::Plot, Command::Request);
    assert_eq!(plots[0].as_array().unwrap().len(), 2);
    let ar = lens.drain_matching(Channel::ArClient, Command::Request);
    assert_eq!(ar[0].as_array().unwrap().len(), 1);
    assert!(tablet.drain().is_empty());
}

#[tokio::test]
async fn menu_actions_and_voice_commands_are_relayed() {
    let mut engine = engine().await;
    let mut tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let mut lens = connect(&mut engine, "lens", ClientKind::Ar).await;
    tablet.drain();
    lens.drain();

    send(&mut engine, &tablet, Channel::Control, Command::Action, json!({"menu": "plot"})).await;
    assert_eq!(lens.drain_matching(Channel::Control, Command::Action), vec![json!({"menu": "plot"})]);
    assert!(tablet.drain().is_empty());

    send(&mut engine, &tablet, Channel::Voice, Command::Cmd, json!("create plot")).await;
    assert_eq!(lens.drain_matching(Channel::Voice, Command::Cmd), vec![json!("create plot")]);
}

#[tokio::test]
async fn malformed_messages_are_dropped() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;

    let envelope = Envelope {
        channel: 99,
        command: "request".into(),
        payload: json!(null),
    };
    engine
        .handle_adapter(AdapterEvent::Message {
            key: tablet.key.clone(),
            conn: tablet.conn,
            envelope,
        })
        .await;
    send(&mut engine, &tablet, Channel::Plot, Command::Update, json!({"useSort": true})).await;
    send(&mut engine, &tablet, Channel::Plot, Command::Remove, json!({"id": 404})).await;

    assert!(engine.gateway().is_connected(&tablet.key));
    assert!(engine.stores().plots.is_empty());
}

// ============================================================================
// Administration
// ============================================================================

#[tokio::test]
async fn admin_commands_edit_the_store() {
    let mut engine = engine().await;
    let tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    let lens = connect(&mut engine, "lens", ClientKind::Ar).await;
    let lens_id = engine.session(&lens.key).unwrap();
    let plot = add_plot(&mut engine, &tablet, json!({})).await;

    engine.handle_admin(&format!("rename {lens_id} Left Lens")).await.unwrap();
    engine.handle_admin(&format!("debug {lens_id}")).await.unwrap();
    let client = engine.stores().clients.get_cached(lens_id).unwrap();
    assert_eq!(client.name(), "Left Lens");
    assert!(client.is_debug());

    send(&mut engine, &tablet, Channel::Control, Command::Cmd, json!(format!("delete plot {plot}"))).await;
    assert!(engine.stores().plots.is_empty());

    let help = engine.handle_admin("help").await.unwrap().unwrap();
    assert!(help.contains("delete plot"));
}

#[tokio::test]
async fn admin_commands_to_web_clients() {
    let mut engine = engine().await;
    let mut tablet = connect(&mut engine, "tablet", ClientKind::Web).await;
    tablet.drain();

    engine
        .handle_admin(r#"configure tablet {"mode": "map"}"#)
        .await
        .unwrap();
    let sent = tablet.drain_matching(Channel::Control, Command::Cmd);
    assert_eq!(sent, vec![json!({"command": "configure", "config": {"mode": "map"}})]);

    let err = engine.handle_admin("restart kiosk").await.unwrap_err();
    assert!(matches!(err, SyncError::ClientNotConnected { .. }));
    assert!(engine.handle_admin("delete plot 77").await.is_err());
}
