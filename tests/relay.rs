//! Host relay, time sync, and persistence flows driven through the frame
//! dispatcher against a throwaway SQLite database.

use std::sync::Arc;

use hyper_tungstenite::tungstenite::Message;
use serde_json::Value;
use tokio::sync::mpsc;

use live_reaction_server::connection::{dispatch, ConnInfo};
use live_reaction_server::db::Database;
use live_reaction_server::hub::{ConnectionHandle, Hub, OUTBOUND_QUEUE_FRAMES};
use live_reaction_server::messages::{
    decode_client_frame, ClientFrame, EventCounts, ReactionFrame, StateFlags,
};
use live_reaction_server::store::ReactionStore;
use live_reaction_server::AppContext;

async fn test_ctx() -> AppContext {
    let dir = std::env::temp_dir().join(format!("live-reaction-test-{}", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}/test.db?mode=rwc", dir.display());
    let db = Database::connect(&url).await.expect("test database");
    AppContext {
        store: Arc::new(ReactionStore::new()),
        hub: Arc::new(Hub::new()),
        db,
    }
}

fn join(
    ctx: &AppContext,
    user_id: &str,
    group: &str,
    is_host: bool,
) -> (ConnInfo, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
    let conn_id = format!("conn-{user_id}");
    ctx.hub.register(ConnectionHandle::new(
        conn_id.clone(),
        user_id.to_string(),
        group.to_string(),
        is_host,
        0,
        tx,
    ));
    (
        ConnInfo {
            conn_id,
            user_id: user_id.to_string(),
            experiment_group: group.to_string(),
            is_host,
        },
        rx,
    )
}

fn next_json(rx: &mut mpsc::Receiver<Message>) -> Value {
    match rx.try_recv().expect("expected a queued frame") {
        Message::Text(text) => serde_json::from_str(&text).expect("frame is JSON"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

fn control(text: &str) -> ClientFrame {
    decode_client_frame(text).expect("test frame decodes")
}

#[tokio::test]
async fn host_transport_reaches_participants_but_not_the_host() {
    let ctx = test_ctx().await;
    let (host, mut host_rx) = join(&ctx, "u-1", "control2", true);
    let (_p2, mut rx2) = join(&ctx, "u-2", "control2", false);
    let (_p3, mut rx3) = join(&ctx, "u-3", "control2", false);

    dispatch(&ctx, &host, control(r#"{"type":"video_play","currentTime":10.0}"#))
        .await
        .unwrap();

    for rx in [&mut rx2, &mut rx3] {
        let frame = next_json(rx);
        assert_eq!(frame["type"], "video_play");
        assert_eq!(frame["currentTime"], 10.0);
        assert!(frame["timestamp"].is_i64());
    }
    assert!(host_rx.try_recv().is_err());
}

#[tokio::test]
async fn non_host_transport_is_a_no_op() {
    let ctx = test_ctx().await;
    let (_host, mut host_rx) = join(&ctx, "u-1", "control2", true);
    let (p2, _rx2) = join(&ctx, "u-2", "control2", false);
    let (_p3, mut rx3) = join(&ctx, "u-3", "control2", false);

    dispatch(&ctx, &p2, control(r#"{"type":"video_play","currentTime":99.0}"#))
        .await
        .unwrap();

    assert!(host_rx.try_recv().is_err());
    assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn time_sync_round_trip_is_unicast_both_ways() {
    let ctx = test_ctx().await;
    let (host, mut host_rx) = join(&ctx, "u-1", "control2", true);
    let (p2, mut rx2) = join(&ctx, "u-2", "control2", false);
    let (_p3, mut rx3) = join(&ctx, "u-3", "control2", false);

    // Participant asks; only the host hears about it.
    dispatch(&ctx, &p2, control(r#"{"type":"time_sync_request"}"#))
        .await
        .unwrap();
    let to_host = next_json(&mut host_rx);
    assert_eq!(to_host["type"], "time_sync_request");
    assert_eq!(to_host["requesterId"], "u-2");
    assert!(rx3.try_recv().is_err());

    // Host answers; only the requester hears back, without the id echoed.
    dispatch(
        &ctx,
        &host,
        control(r#"{"type":"time_sync_response","requesterId":"u-2","currentTime":42.0}"#),
    )
    .await
    .unwrap();
    let to_requester = next_json(&mut rx2);
    assert_eq!(to_requester["type"], "time_sync_response");
    assert_eq!(to_requester["currentTime"], 42.0);
    assert!(to_requester.get("requesterId").is_none());
    assert!(rx3.try_recv().is_err());
    assert!(host_rx.try_recv().is_err());
}

#[tokio::test]
async fn sync_request_without_a_host_is_dropped_silently() {
    let ctx = test_ctx().await;
    let (p2, mut rx2) = join(&ctx, "u-2", "control2", false);

    dispatch(&ctx, &p2, control(r#"{"type":"time_sync_request"}"#))
        .await
        .unwrap();
    assert!(rx2.try_recv().is_err());
}

#[tokio::test]
async fn video_selection_by_the_host_reaches_everyone() {
    let ctx = test_ctx().await;
    let (host, mut host_rx) = join(&ctx, "u-1", "control2", true);
    let (_p2, mut rx2) = join(&ctx, "u-2", "control2", false);

    dispatch(
        &ctx,
        &host,
        control(r#"{"type":"video_url_selected","videoId":"XYZ"}"#),
    )
    .await
    .unwrap();

    for rx in [&mut host_rx, &mut rx2] {
        let frame = next_json(rx);
        assert_eq!(frame["type"], "video_url_selected");
        assert_eq!(frame["videoId"], "XYZ");
    }
}

#[tokio::test]
async fn manual_effect_needs_the_debug_group() {
    let ctx = test_ctx().await;
    let (debugger, mut debug_rx) = join(&ctx, "u-dbg", "debug", false);
    let (viewer, mut viewer_rx) = join(&ctx, "u-2", "control2", false);

    // Non-debug sender is rejected and nothing is broadcast or logged.
    let rejected = dispatch(
        &ctx,
        &viewer,
        control(r#"{"type":"manual_effect","effectType":"sparkle","intensity":1.0,"durationMs":2000}"#),
    )
    .await;
    assert!(rejected.is_err());
    assert!(debug_rx.try_recv().is_err());
    let snapshot = ctx.db.debug_snapshot(5).await.unwrap();
    assert_eq!(snapshot.row_counts.effects_log, 0);

    // Debug sender passes through to everyone and the log.
    dispatch(
        &ctx,
        &debugger,
        control(r#"{"type":"manual_effect","effectType":"sparkle","intensity":0.8,"durationMs":1500}"#),
    )
    .await
    .unwrap();
    for rx in [&mut debug_rx, &mut viewer_rx] {
        let frame = next_json(rx);
        assert_eq!(frame["type"], "effect");
        assert_eq!(frame["effectType"], "sparkle");
        assert_eq!(frame["intensity"], 0.8);
        assert_eq!(frame["durationMs"], 1500);
    }
    let snapshot = ctx.db.debug_snapshot(5).await.unwrap();
    assert_eq!(snapshot.row_counts.effects_log, 1);
    assert_eq!(snapshot.recent_effects[0].effect_type, "sparkle");
}

#[tokio::test]
async fn unknown_manual_effect_is_rejected() {
    let ctx = test_ctx().await;
    let (debugger, _rx) = join(&ctx, "u-dbg", "debug", false);
    let rejected = dispatch(
        &ctx,
        &debugger,
        control(r#"{"type":"manual_effect","effectType":"confetti"}"#),
    )
    .await;
    assert!(rejected.is_err());
}

#[tokio::test]
async fn reactions_land_in_the_window_and_the_log() {
    let ctx = test_ctx().await;
    let (viewer, _rx) = join(&ctx, "u-1", "control2", false);
    ctx.db.ensure_user_row("u-1", "control2", 0).await.unwrap();

    let frame = ReactionFrame {
        states: StateFlags {
            is_smiling: true,
            ..StateFlags::default()
        },
        events: EventCounts {
            clap: 2,
            ..EventCounts::default()
        },
        video_time: Some(12.5),
        session_id: Some("u-1_1".to_string()),
        ..ReactionFrame::default()
    };
    dispatch(&ctx, &viewer, ClientFrame::Reaction(frame))
        .await
        .unwrap();

    let snapshot = ctx.db.debug_snapshot(5).await.unwrap();
    assert_eq!(snapshot.row_counts.users, 1);
    assert_eq!(snapshot.row_counts.reactions_log, 1);
    assert_eq!(snapshot.recent_reactions[0].user_id, "u-1");
    assert_eq!(
        snapshot.recent_reactions[0].session_id.as_deref(),
        Some("u-1_1")
    );

    let now = snapshot.recent_reactions[0].timestamp;
    let active = ctx.store.snapshot_active(now);
    assert_eq!(active["u-1"].len(), 1);
    assert!(active["u-1"][0].states.is_smiling);
}

#[tokio::test]
async fn user_rows_are_inserted_exactly_once() {
    let ctx = test_ctx().await;
    for _ in 0..3 {
        ctx.db.ensure_user_row("u-1", "experiment", 1).await.unwrap();
    }
    let snapshot = ctx.db.debug_snapshot(5).await.unwrap();
    assert_eq!(snapshot.row_counts.users, 1);
}

#[tokio::test]
async fn sessions_are_created_and_completed() {
    let ctx = test_ctx().await;
    let (viewer, _rx) = join(&ctx, "u-1", "control2", false);

    dispatch(
        &ctx,
        &viewer,
        control(r#"{"type":"session_create","sessionId":"u-1_1","videoId":"XYZ"}"#),
    )
    .await
    .unwrap();
    dispatch(
        &ctx,
        &viewer,
        control(r#"{"type":"session_completed","sessionId":"u-1_1"}"#),
    )
    .await
    .unwrap();

    let snapshot = ctx.db.debug_snapshot(5).await.unwrap();
    assert_eq!(snapshot.row_counts.sessions, 1);
}
