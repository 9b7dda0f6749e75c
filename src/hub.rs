//! Registry of live connections and best-effort fan-out.
//!
//! Each connection owns a bounded outbound queue; the hub only ever
//! `try_send`s into it. A full queue drops that one frame for that one
//! subscriber and bumps a counter, so no peer's slowness can stall the
//! fan-out or starve anyone else. The registry lock is held just long
//! enough to copy the target list; delivery happens outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use hyper_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use hyper_tungstenite::tungstenite::protocol::CloseFrame;
use hyper_tungstenite::tungstenite::Message;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::messages::ServerFrame;

/// Outbound queue depth per connection. Full queue drops the new frame.
pub const OUTBOUND_QUEUE_FRAMES: usize = 64;

/// Everything the hub needs to reach one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: String,
    pub user_id: String,
    pub experiment_group: String,
    pub is_host: bool,
    pub joined_ms: i64,
    sender: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    pub fn new(
        conn_id: String,
        user_id: String,
        experiment_group: String,
        is_host: bool,
        joined_ms: i64,
        sender: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            conn_id,
            user_id,
            experiment_group,
            is_host,
            joined_ms,
            sender,
        }
    }
}

pub struct Hub {
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    dropped_frames: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Register a connection under its user id. A colliding id means a
    /// reconnect: the newest connection wins and the displaced one is
    /// told to close.
    pub fn register(&self, handle: ConnectionHandle) {
        let displaced = {
            let mut connections = self.connections.lock().expect("hub lock poisoned");
            connections.insert(handle.user_id.clone(), handle)
        };
        if let Some(old) = displaced {
            warn!(
                "user {} reconnected; closing displaced connection {}",
                old.user_id, old.conn_id
            );
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "replaced by a newer connection".into(),
            }));
            let _ = old.sender.try_send(close);
        }
    }

    /// Remove a connection, but only if the registry still maps the user
    /// to this exact connection. A displaced connection's late cleanup
    /// must not evict its replacement. Idempotent.
    pub fn unregister(&self, user_id: &str, conn_id: &str) -> bool {
        let mut connections = self.connections.lock().expect("hub lock poisoned");
        match connections.get(user_id) {
            Some(current) if current.conn_id == conn_id => {
                connections.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Enqueue a frame to every registered connection.
    pub fn broadcast(&self, frame: &ServerFrame) {
        self.fan_out(frame, None);
    }

    /// Enqueue a frame to every registered connection except the named
    /// one. Used to suppress the host's own transport echo.
    pub fn broadcast_except(&self, skip_conn_id: &str, frame: &ServerFrame) {
        self.fan_out(frame, Some(skip_conn_id));
    }

    fn fan_out(&self, frame: &ServerFrame, skip_conn_id: Option<&str>) {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize broadcast frame: {e}");
                return;
            }
        };
        let targets: Vec<ConnectionHandle> = {
            let connections = self.connections.lock().expect("hub lock poisoned");
            connections
                .values()
                .filter(|h| skip_conn_id != Some(h.conn_id.as_str()))
                .cloned()
                .collect()
        };
        for target in targets {
            self.deliver(&target, Message::Text(json.clone()));
        }
    }

    /// Enqueue a frame to one user. Returns false when the user has no
    /// registered connection.
    pub fn send_to(&self, user_id: &str, frame: &ServerFrame) -> bool {
        let target = {
            let connections = self.connections.lock().expect("hub lock poisoned");
            connections.get(user_id).cloned()
        };
        let Some(target) = target else {
            return false;
        };
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize frame for {user_id}: {e}");
                return false;
            }
        };
        self.deliver(&target, Message::Text(json));
        true
    }

    /// Enqueue a frame to the host connection, if one is registered.
    pub fn send_to_host(&self, frame: &ServerFrame) -> bool {
        let host = {
            let connections = self.connections.lock().expect("hub lock poisoned");
            connections.values().find(|h| h.is_host).cloned()
        };
        match host {
            Some(host) => self.send_to(&host.user_id, frame),
            None => false,
        }
    }

    fn deliver(&self, target: &ConnectionHandle, message: Message) {
        match target.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "outbound queue full for {}; dropping frame",
                    target.user_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("connection for {} already closed", target.user_id);
            }
        }
    }

    /// Tell every connection to close. Used at shutdown.
    pub fn close_all(&self) {
        let targets: Vec<ConnectionHandle> = {
            let connections = self.connections.lock().expect("hub lock poisoned");
            connections.values().cloned().collect()
        };
        for target in targets {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "server shutting down".into(),
            }));
            let _ = target.sender.try_send(close);
        }
    }

    pub fn count(&self) -> usize {
        self.connections.lock().expect("hub lock poisoned").len()
    }

    pub fn user_ids(&self) -> Vec<String> {
        let connections = self.connections.lock().expect("hub lock poisoned");
        let mut ids: Vec<String> = connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
