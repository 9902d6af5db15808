//! The external KV/queue directory, in-memory edition.
//!
//! The protocol treats this as the source of truth for cross-process
//! state; the operation surface is what the delivery plane actually needs,
//! so a networked store can be dropped in without touching callers:
//!
//! | Shape      | Keys                                              |
//! |------------|---------------------------------------------------|
//! | string KV  | `prekey_bundle:{user}`, `user_record:{user}`,     |
//! |            | `x3dh_ephemeral:{sender}:{recipient}`,            |
//! |            | `message_meta:{id}`, `presence:{user}`            |
//! | hash       | `user_info:{user}`                                |
//! | sorted set | `offline_messages:{user}`, `self_destruct_messages` |
//! | pub/sub    | presence channel, `typing:{user}`                 |
//!
//! TTLs are enforced lazily: an expired entry is dropped on first access.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Pub/sub channel carrying `{user_id, status, timestamp}` updates.
pub const PRESENCE_CHANNEL: &str = "shroud:presence";
/// Sorted set of message ids scored by their self-destruct deadline.
pub const SELF_DESTRUCT_INDEX: &str = "self_destruct_messages";

pub const PRESENCE_TTL_SECS: u64 = 300;
pub const META_TTL_SECS: u64 = 86_400;
pub const X3DH_EPHEMERAL_TTL_SECS: u64 = 86_400;

/// Key-name helpers for the directory layout.
pub mod keys {
    pub fn prekey_bundle(user: &str) -> String {
        format!("prekey_bundle:{user}")
    }
    pub fn user_record(user: &str) -> String {
        format!("user_record:{user}")
    }
    pub fn user_info(user: &str) -> String {
        format!("user_info:{user}")
    }
    pub fn x3dh_ephemeral(sender: &str, recipient: &str) -> String {
        format!("x3dh_ephemeral:{sender}:{recipient}")
    }
    pub fn offline_messages(user: &str) -> String {
        format!("offline_messages:{user}")
    }
    pub fn message_meta(id: &str) -> String {
        format!("message_meta:{id}")
    }
    pub fn presence(user: &str) -> String {
        format!("presence:{user}")
    }
    pub fn typing_channel(user: &str) -> String {
        format!("typing:{user}")
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    sorted: HashMap<String, Vec<(f64, String)>>,
}

/// In-memory KV/queue/pub-sub store.
pub struct Store {
    inner: Mutex<Inner>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    // ── String KV ──────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.strings.get(key).is_some_and(Entry::expired) {
            inner.strings.remove(key);
            return None;
        }
        inner.strings.get(key).map(|entry| entry.value.clone())
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) {
        self.inner.lock().strings.insert(
            key.to_string(),
            Entry {
                value: value.into(),
                expires_at: None,
            },
        );
    }

    pub async fn set_ex(&self, key: &str, value: impl Into<String>, ttl_secs: u64) {
        self.set_with_ttl(key, value, Duration::from_secs(ttl_secs)).await;
    }

    pub async fn set_with_ttl(&self, key: &str, value: impl Into<String>, ttl: Duration) {
        self.inner.lock().strings.insert(
            key.to_string(),
            Entry {
                value: value.into(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let existed = inner.strings.remove(key).is_some_and(|entry| !entry.expired());
        inner.hashes.remove(key);
        inner.sorted.remove(key);
        existed
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// All live string keys starting with `prefix` (for rehydration scans).
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.strings.retain(|_, entry| !entry.expired());
        inner
            .strings
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    // ── Hashes ─────────────────────────────────────────────────────

    pub async fn hset(&self, key: &str, field: &str, value: impl Into<String>) {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    pub async fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.inner.lock().hashes.get(key)?.get(field).cloned()
    }

    pub async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        self.inner.lock().hashes.get(key).cloned().unwrap_or_default()
    }

    // ── Sorted sets ────────────────────────────────────────────────

    pub async fn zadd(&self, key: &str, score: f64, member: impl Into<String>) {
        let mut inner = self.inner.lock();
        let set = inner.sorted.entry(key.to_string()).or_default();
        set.push((score, member.into()));
        // Stable: equal scores keep insertion order
        set.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    }

    /// All members in score order.
    pub async fn zrange_all(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .sorted
            .get(key)
            .map(|set| set.iter().map(|(_, member)| member.clone()).collect())
            .unwrap_or_default()
    }

    /// Members with `min <= score <= max`, in score order.
    pub async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        self.inner
            .lock()
            .sorted
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(score, _)| *score >= min && *score <= max)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove members with `min <= score <= max`; returns how many.
    pub async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> usize {
        let mut inner = self.inner.lock();
        let Some(set) = inner.sorted.get_mut(key) else {
            return 0;
        };
        let before = set.len();
        set.retain(|(score, _)| *score < min || *score > max);
        before - set.len()
    }

    // ── Pub/sub ────────────────────────────────────────────────────

    /// Publish to a channel. Returns the number of live subscribers.
    pub async fn publish(&self, channel: &str, payload: impl Into<String>) -> usize {
        let sender = self.sender_for(channel);
        sender.send(payload.into()).unwrap_or(0)
    }

    /// Subscribe to a channel. Slow receivers may observe lag errors.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender_for(channel).subscribe()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
