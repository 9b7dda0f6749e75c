//! One bidirectional viewer session.
//!
//! The socket splits into a reader (this task) and a writer draining the
//! bounded outbound queue. The first frame must be a handshake naming the
//! user; everything after flows through the demultiplexer. A faulty frame
//! is logged and skipped; protocol violations (bad JSON, oversize frames,
//! rate abuse) close this connection and nothing else. The user's sample
//! window outlives the connection.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use hyper_tungstenite::tungstenite::protocol::CloseFrame;
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::WebSocketStream;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::clock::{iso_now, now_ms};
use crate::db::EffectRecord;
use crate::hub::{ConnectionHandle, OUTBOUND_QUEUE_FRAMES};
use crate::messages::{
    decode_client_frame, decode_handshake, ClientFrame, ControlFrame, EffectType, FrameError,
    ServerFrame, DEBUG_EXPERIMENT_GROUP, DEFAULT_EXPERIMENT_GROUP, KNOWN_EXPERIMENT_GROUPS,
};
use crate::store::Sample;
use crate::AppContext;

/// Inbound text frames above this size close the connection.
pub const MAX_FRAME_BYTES: usize = 8 * 1024;
/// Inbound frames per second above this close the connection.
pub const MAX_FRAMES_PER_SECOND: u32 = 50;
/// A connection with no inbound frames for this long is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a fresh connection gets to present its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity established at handshake, threaded through the demux.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub conn_id: String,
    pub user_id: String,
    pub experiment_group: String,
    pub is_host: bool,
}

/// Rolling one-second inbound frame counter.
struct RateLimiter {
    window_start_ms: i64,
    frames: u32,
}

impl RateLimiter {
    fn new(now_ms: i64) -> Self {
        Self {
            window_start_ms: now_ms,
            frames: 0,
        }
    }

    /// Count one frame; true when the current second went over the limit.
    fn record(&mut self, now_ms: i64) -> bool {
        if now_ms - self.window_start_ms >= 1000 {
            self.window_start_ms = now_ms;
            self.frames = 0;
        }
        self.frames += 1;
        self.frames > MAX_FRAMES_PER_SECOND
    }
}

async fn enqueue_close(tx: &mpsc::Sender<Message>, code: CloseCode, reason: &'static str) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    let _ = tx.send(frame).await;
}

pub async fn handle_connection(
    ws: WebSocketStream<Upgraded>,
    ctx: AppContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_FRAMES);

    // Writer: drain the outbound queue onto the socket. A Close frame is
    // the last thing this task ever sends.
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sender.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    // The first frame must be the handshake.
    let handshake = match timeout(HANDSHAKE_TIMEOUT, ws_receiver.next()).await {
        Err(_) => Err("handshake timed out".to_string()),
        Ok(None) => Err("peer closed before handshake".to_string()),
        Ok(Some(Err(e))) => Err(format!("socket error before handshake: {e}")),
        Ok(Some(Ok(Message::Text(text)))) => decode_handshake(&text),
        Ok(Some(Ok(_))) => Err("handshake must be a text frame".to_string()),
    };
    let handshake = match handshake {
        Ok(handshake) => handshake,
        Err(reason) => {
            warn!("connection {conn_id}: {reason}");
            enqueue_close(&tx, CloseCode::Policy, "valid handshake required").await;
            let _ = timeout(Duration::from_secs(1), &mut send_task).await;
            send_task.abort();
            return;
        }
    };

    let user_id = handshake.user_id;
    let experiment_group = handshake
        .experiment_group
        .unwrap_or_else(|| DEFAULT_EXPERIMENT_GROUP.to_string());
    if !KNOWN_EXPERIMENT_GROUPS.contains(&experiment_group.as_str()) {
        warn!("user {user_id} declared unknown experiment group \"{experiment_group}\"");
    }

    let joined_ms = now_ms();
    ctx.store.ensure_user(&user_id, &experiment_group, joined_ms);
    if let Err(e) = ctx
        .db
        .ensure_user_row(&user_id, &experiment_group, joined_ms)
        .await
    {
        error!("user row for {user_id}: {e}");
    }

    ctx.hub.register(ConnectionHandle::new(
        conn_id.clone(),
        user_id.clone(),
        experiment_group.clone(),
        handshake.is_host,
        joined_ms,
        tx.clone(),
    ));
    info!(
        "user {user_id} connected (group {experiment_group}{})",
        if handshake.is_host { ", host" } else { "" }
    );

    let established = ServerFrame::ConnectionEstablished {
        user_id: user_id.clone(),
        experiment_group: experiment_group.clone(),
        is_host: handshake.is_host,
        message: format!("welcome {user_id}, you are in the {experiment_group} group"),
        timestamp: iso_now(),
    };
    match serde_json::to_string(&established) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json)).await;
        }
        Err(e) => error!("serializing connection_established: {e}"),
    }

    let conn = ConnInfo {
        conn_id,
        user_id,
        experiment_group,
        is_host: handshake.is_host,
    };

    let mut limiter = RateLimiter::new(now_ms());
    loop {
        tokio::select! {
            incoming = timeout(IDLE_TIMEOUT, ws_receiver.next()) => {
                let message = match incoming {
                    Err(_) => {
                        info!("user {}: no frames for 60s, closing", conn.user_id);
                        enqueue_close(&tx, CloseCode::Normal, "idle timeout").await;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        error!("socket error for {}: {e}", conn.user_id);
                        break;
                    }
                    Ok(Some(Ok(message))) => message,
                };
                match message {
                    Message::Text(text) => {
                        if text.len() > MAX_FRAME_BYTES {
                            warn!(
                                "user {}: {} byte frame exceeds the {} byte ceiling",
                                conn.user_id,
                                text.len(),
                                MAX_FRAME_BYTES
                            );
                            enqueue_close(&tx, CloseCode::Size, "frame too large").await;
                            break;
                        }
                        if limiter.record(now_ms()) {
                            warn!(
                                "user {}: over {} frames in one second",
                                conn.user_id, MAX_FRAMES_PER_SECOND
                            );
                            enqueue_close(&tx, CloseCode::Policy, "message rate exceeded").await;
                            break;
                        }
                        match decode_client_frame(&text) {
                            Ok(frame) => {
                                if let Err(e) = dispatch(&ctx, &conn, frame).await {
                                    warn!("user {}: {e}", conn.user_id);
                                }
                            }
                            Err(FrameError::Syntax(e)) => {
                                warn!("user {}: {e}", conn.user_id);
                                enqueue_close(&tx, CloseCode::Policy, "malformed frame").await;
                                break;
                            }
                            Err(FrameError::Schema(e)) => {
                                warn!("user {}: skipping frame: {e}", conn.user_id);
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("user {} closed the connection", conn.user_id);
                        break;
                    }
                    Message::Ping(data) => {
                        let _ = tx.try_send(Message::Pong(data));
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => break,
            _ = shutdown.changed() => {
                enqueue_close(&tx, CloseCode::Normal, "server shutting down").await;
                break;
            }
        }
    }

    // The window stays in the store; the user just ages out of the
    // active set if no reconnect happens.
    if ctx.hub.unregister(&conn.user_id, &conn.conn_id) {
        info!("user {} disconnected", conn.user_id);
    }
    let _ = timeout(Duration::from_secs(1), &mut send_task).await;
    send_task.abort();
}

/// Route one decoded frame. Errors are reported to the caller for
/// logging; they never close the connection.
pub async fn dispatch(ctx: &AppContext, conn: &ConnInfo, frame: ClientFrame) -> Result<(), String> {
    match frame {
        ClientFrame::Unknown(tag) => {
            warn!("user {}: ignoring unknown frame tag \"{tag}\"", conn.user_id);
            Ok(())
        }
        ClientFrame::Reaction(frame) => {
            let received_ms = now_ms();
            if let Some(client_ms) = frame.timestamp {
                debug!(
                    "user {}: client clock offset {} ms",
                    conn.user_id,
                    received_ms - client_ms
                );
            }
            let sample = Arc::new(Sample::from_frame(frame, received_ms));
            ctx.store.append(&conn.user_id, Arc::clone(&sample));
            ctx.db.log_reaction(&conn.user_id, &sample).await
        }
        ClientFrame::Control(control) => dispatch_control(ctx, conn, control).await,
    }
}

async fn dispatch_control(
    ctx: &AppContext,
    conn: &ConnInfo,
    control: ControlFrame,
) -> Result<(), String> {
    match control {
        ControlFrame::VideoPlay { current_time } => relay_transport(
            ctx,
            conn,
            ServerFrame::VideoPlay {
                current_time,
                timestamp: now_ms(),
            },
        ),
        ControlFrame::VideoPause { current_time } => relay_transport(
            ctx,
            conn,
            ServerFrame::VideoPause {
                current_time,
                timestamp: now_ms(),
            },
        ),
        ControlFrame::VideoSeek { current_time } => relay_transport(
            ctx,
            conn,
            ServerFrame::VideoSeek {
                current_time,
                timestamp: now_ms(),
            },
        ),
        ControlFrame::TimeSyncRequest => {
            if conn.is_host {
                debug!("host {} sent a time sync request; ignoring", conn.user_id);
                return Ok(());
            }
            let forwarded = ctx.hub.send_to_host(&ServerFrame::TimeSyncRequest {
                requester_id: conn.user_id.clone(),
            });
            if !forwarded {
                debug!(
                    "no host registered; dropping time sync request from {}",
                    conn.user_id
                );
            }
            Ok(())
        }
        ControlFrame::TimeSyncResponse {
            requester_id,
            current_time,
        } => {
            if !conn.is_host {
                debug!(
                    "ignoring time sync response from non-host {}",
                    conn.user_id
                );
                return Ok(());
            }
            if !ctx
                .hub
                .send_to(&requester_id, &ServerFrame::TimeSyncResponse { current_time })
            {
                debug!("time sync requester {requester_id} is gone");
            }
            Ok(())
        }
        ControlFrame::VideoUrlSelected { video_id } => {
            if !conn.is_host {
                debug!(
                    "ignoring video selection from non-host {}",
                    conn.user_id
                );
                return Ok(());
            }
            ctx.hub
                .broadcast(&ServerFrame::VideoUrlSelected { video_id });
            Ok(())
        }
        ControlFrame::SessionCreate {
            session_id,
            video_id,
        } => {
            ctx.db
                .session_create(&session_id, &conn.user_id, &video_id, now_ms())
                .await
        }
        ControlFrame::SessionCompleted { session_id } => {
            ctx.db.session_complete(&session_id, now_ms()).await
        }
        ControlFrame::ManualEffect {
            effect_type,
            intensity,
            duration_ms,
            session_id,
            video_time,
        } => {
            if conn.experiment_group != DEBUG_EXPERIMENT_GROUP {
                return Err(format!(
                    "manual_effect rejected: {} is not in the debug group",
                    conn.user_id
                ));
            }
            let Some(effect_type) = EffectType::from_name(&effect_type) else {
                return Err(format!(
                    "manual_effect rejected: unknown effect \"{effect_type}\""
                ));
            };
            let record = EffectRecord {
                timestamp: now_ms(),
                effect_type,
                intensity: intensity.clamp(0.0, 1.0),
                duration_ms,
                session_id,
                video_time,
                active_users: None,
            };
            if let Err(e) = ctx.db.log_effect(&record).await {
                error!("persisting manual effect failed: {e}");
            }
            ctx.hub.broadcast(&ServerFrame::Effect {
                effect_type,
                intensity: record.intensity,
                duration_ms: record.duration_ms,
                timestamp: record.timestamp,
                debug: None,
            });
            info!(
                "manual effect {} from {}",
                effect_type.name(),
                conn.user_id
            );
            Ok(())
        }
    }
}

fn relay_transport(ctx: &AppContext, conn: &ConnInfo, frame: ServerFrame) -> Result<(), String> {
    if !conn.is_host {
        debug!("ignoring transport frame from non-host {}", conn.user_id);
        return Ok(());
    }
    ctx.hub.broadcast_except(&conn.conn_id, &frame);
    Ok(())
}
