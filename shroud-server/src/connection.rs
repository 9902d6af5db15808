//! Connection registry: which users are reachable right now, and how.
//!
//! Two maps: connection id → outbound frame channel, and user id →
//! connection id. One active transport per user; a reconnect replaces the
//! prior binding, and the stale handler task must not tear the new one
//! down; removal is guarded by connection id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::frames::{self, Frame, PresenceData, kind};
use crate::msgid;
use crate::store::{PRESENCE_CHANNEL, PRESENCE_TTL_SECS, Store, keys};

pub type FrameSender = mpsc::UnboundedSender<Frame>;

pub struct ConnectionRegistry {
    store: Arc<Store>,
    connections: Mutex<HashMap<String, FrameSender>>,
    users: Mutex<HashMap<String, String>>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            connections: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a user to a fresh connection. Replaces any prior binding (its
    /// channel is dropped, which ends the stale handler task). Publishes
    /// presence and refreshes the presence hint key.
    pub async fn connect(&self, user_id: &str, sender: FrameSender) -> String {
        let connection_id = msgid::connection_id();
        {
            let mut users = self.users.lock();
            let mut connections = self.connections.lock();
            if let Some(previous) = users.insert(user_id.to_string(), connection_id.clone()) {
                connections.remove(&previous);
            }
            connections.insert(connection_id.clone(), sender);
        }
        self.publish_presence(user_id, "online").await;
        self.store
            .set_ex(&keys::presence(user_id), "online", PRESENCE_TTL_SECS)
            .await;
        tracing::info!(user = %user_id, connection = %connection_id, "user connected");
        connection_id
    }

    /// Unbind `connection_id` from `user_id`. A no-op when the user has
    /// already been rebound to a newer connection. Returns whether the
    /// binding was actually removed.
    pub async fn disconnect(&self, user_id: &str, connection_id: &str) -> bool {
        let removed = {
            let mut users = self.users.lock();
            let mut connections = self.connections.lock();
            match users.get(user_id) {
                Some(current) if current == connection_id => {
                    users.remove(user_id);
                    connections.remove(connection_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.publish_presence(user_id, "offline").await;
            self.store.delete(&keys::presence(user_id)).await;
            tracing::info!(user = %user_id, connection = %connection_id, "user disconnected");
        }
        removed
    }

    /// Push a frame to a user's transport. Returns false when the user has
    /// no binding (offline). A dead channel tears the binding down and
    /// also reports false.
    pub async fn send_to_user(&self, user_id: &str, frame: Frame) -> bool {
        let bound = {
            let users = self.users.lock();
            let connections = self.connections.lock();
            users.get(user_id).and_then(|connection_id| {
                connections
                    .get(connection_id)
                    .map(|sender| (connection_id.clone(), sender.clone()))
            })
        };
        let Some((connection_id, sender)) = bound else {
            return false;
        };
        if sender.send(frame).is_err() {
            tracing::warn!(user = %user_id, "transport write failed; dropping binding");
            self.disconnect(user_id, &connection_id).await;
            return false;
        }
        true
    }

    /// Online per the presence hint key (shared, TTL-bounded truth).
    pub async fn is_user_online(&self, user_id: &str) -> bool {
        self.store.exists(&keys::presence(user_id)).await
    }

    /// Users with a live transport binding on this process.
    pub fn connected_users(&self) -> Vec<String> {
        self.users.lock().keys().cloned().collect()
    }

    async fn publish_presence(&self, user_id: &str, status: &str) {
        let payload = serde_json::json!({
            "user_id": user_id,
            "status": status,
            "timestamp": frames::unix_now(),
        });
        self.store.publish(PRESENCE_CHANNEL, payload.to_string()).await;
    }
}

/// Build a `presence` frame for fan-out to connected clients.
pub fn presence_frame(user_id: &str, status: &str) -> Frame {
    Frame::new(
        kind::PRESENCE,
        PresenceData {
            user_id: user_id.to_string(),
            status: status.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_marks_presence_and_delivers() {
        let store = Arc::new(Store::new());
        let registry = ConnectionRegistry::new(store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let connection_id = registry.connect("alice", tx).await;
        assert_eq!(connection_id.len(), 16);
        assert!(registry.is_user_online("alice").await);

        assert!(registry.send_to_user("alice", Frame::error("ping")).await);
        assert_eq!(rx.recv().await.unwrap().kind, kind::ERROR);
    }

    #[tokio::test]
    async fn offline_user_is_unreachable() {
        let store = Arc::new(Store::new());
        let registry = ConnectionRegistry::new(store);
        assert!(!registry.send_to_user("ghost", Frame::error("x")).await);
    }

    #[tokio::test]
    async fn dead_channel_tears_down_binding() {
        let store = Arc::new(Store::new());
        let registry = ConnectionRegistry::new(store);
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect("alice", tx).await;
        drop(rx);

        assert!(!registry.send_to_user("alice", Frame::error("x")).await);
        assert!(!registry.is_user_online("alice").await);
        assert!(registry.connected_users().is_empty());
    }

    #[tokio::test]
    async fn reconnect_replaces_binding_and_stale_disconnect_is_noop() {
        let store = Arc::new(Store::new());
        let registry = ConnectionRegistry::new(store);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let first = registry.connect("alice", tx1).await;
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let second = registry.connect("alice", tx2).await;

        // Replacement dropped the first channel
        assert!(rx1.recv().await.is_none());

        // The stale task's cleanup must not kill the new binding
        assert!(!registry.disconnect("alice", &first).await);
        assert!(registry.is_user_online("alice").await);
        assert!(registry.send_to_user("alice", Frame::error("hi")).await);
        assert!(rx2.recv().await.is_some());

        assert!(registry.disconnect("alice", &second).await);
        assert!(!registry.is_user_online("alice").await);
    }
}
