//! CDP Session Hub: the set of connected CDP
//! client WebSockets, with broadcast/unicast dispatch and bounded,
//! per-socket write queues.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::extract::ws::Message;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::warn;
use uuid::Uuid;

pub type SocketId = Uuid;

struct Connection {
    tx: mpsc::Sender<Message>,
    force_close: std::sync::Arc<Notify>,
}

#[derive(Default)]
pub struct CdpSessionHub {
    connections: Mutex<HashMap<SocketId, Connection>>,
}

/// Returned to the caller that accepted a CDP client socket; it owns the
/// receiving half of the per-socket write queue and the force-close signal,
/// both consumed by the writer task.
pub struct Registration {
    pub socket_id: SocketId,
    pub rx: mpsc::Receiver<Message>,
    pub force_close: std::sync::Arc<Notify>,
}

impl CdpSessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted CDP client socket with a bounded write
    /// queue of `cap` frames.
    pub fn register(&self, cap: usize) -> Registration {
        let socket_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(cap);
        let force_close = std::sync::Arc::new(Notify::new());

        self.connections.lock().unwrap().insert(
            socket_id,
            Connection {
                tx,
                force_close: force_close.clone(),
            },
        );

        Registration {
            socket_id,
            rx,
            force_close,
        }
    }

    pub fn unregister(&self, socket_id: SocketId) {
        self.connections.lock().unwrap().remove(&socket_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Send a frame to every connected CDP client. Sockets whose write
    /// queue is full are force-closed with code 1013 rather
    /// than block the broadcaster.
    pub fn broadcast(&self, frame: Value) {
        let text = match serde_json::to_string(&frame) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast frame");
                return;
            }
        };

        let mut to_close = Vec::new();
        {
            let connections = self.connections.lock().unwrap();
            for (id, conn) in connections.iter() {
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    conn.tx.try_send(Message::Text(text.clone()))
                {
                    to_close.push((*id, conn.force_close.clone()));
                }
            }
        }
        for (id, notify) in to_close {
            warn!(socket_id = %id, "CDP client write queue full, force-closing (1013)");
            notify.notify_one();
        }
    }

    /// Close every connected CDP client socket and drop their registrations,
    /// used by `stopRelay`.
    pub fn close_all(&self) {
        let mut connections = self.connections.lock().unwrap();
        for (id, conn) in connections.drain() {
            if conn.tx.try_send(Message::Close(None)).is_err() {
                warn!(socket_id = %id, "failed to queue close frame during shutdown");
            }
        }
    }

    /// Send a frame to one specific CDP client.
    pub fn send(&self, socket_id: SocketId, frame: Value) {
        let text = match serde_json::to_string(&frame) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to serialize unicast frame");
                return;
            }
        };

        let connections = self.connections.lock().unwrap();
        if let Some(conn) = connections.get(&socket_id) {
            if let Err(mpsc::error::TrySendError::Full(_)) =
                conn.tx.try_send(Message::Text(text))
            {
                warn!(socket_id = %socket_id, "CDP client write queue full, force-closing (1013)");
                conn.force_close.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_registered_sockets() {
        let hub = CdpSessionHub::new();
        let mut reg_a = hub.register(8);
        let mut reg_b = hub.register(8);

        hub.broadcast(serde_json::json!({"method": "Target.attachedToTarget"}));

        let msg_a = reg_a.rx.recv().await.unwrap();
        let msg_b = reg_b.rx.recv().await.unwrap();
        assert!(matches!(msg_a, Message::Text(_)));
        assert!(matches!(msg_b, Message::Text(_)));
    }

    #[tokio::test]
    async fn unicast_reaches_only_target_socket() {
        let hub = CdpSessionHub::new();
        let mut reg_a = hub.register(8);
        let reg_b = hub.register(8);

        hub.send(reg_a.socket_id, serde_json::json!({"id": 1, "result": {}}));

        let msg = reg_a.rx.recv().await.unwrap();
        assert!(matches!(msg, Message::Text(_)));
        drop(reg_b);
    }

    #[tokio::test]
    async fn full_queue_triggers_force_close() {
        let hub = CdpSessionHub::new();
        let reg = hub.register(1);
        hub.broadcast(serde_json::json!({"n": 1}));
        hub.broadcast(serde_json::json!({"n": 2}));

        let notified = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            reg.force_close.notified(),
        )
        .await;
        assert!(notified.is_ok());
    }
}
