//! In-memory registry of local users and their pairwise ratchet sessions.
//!
//! The registry is a cache over the durable directory: registration writes
//! `user_record:{user}` and `prekey_bundle:{user}` to the store, and a warm
//! start rehydrates identities from those keys. Sessions are runtime-only
//! and are created exclusively by the message handler.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use shroud_core::crypto::KeyPair;
use shroud_core::ratchet::RatchetState;
use shroud_core::x3dh::{self, PreKeyBundle, X3dhError};

use crate::msgid;
use crate::store::{Store, keys};

/// A ratchet session handle. The mutex serializes all access: exactly one
/// task mutates a session's state at a time.
pub type Session = Arc<Mutex<RatchetState>>;

/// One local user: identity, published key material, live sessions.
pub struct UserRecord {
    pub user_id: String,
    pub identity: KeyPair,
    /// The published bundle, private halves included.
    pub bundle: PreKeyBundle,
    /// The signed pre-key pair, kept decoded for responder handshakes.
    pub signed_prekey: KeyPair,
    pub device_id: String,
    pub registration_id: u32,
    sessions: Mutex<HashMap<String, Session>>,
}

impl UserRecord {
    /// Create a fresh user with new identity and pre-key material.
    pub fn create(user_id: &str, one_time_count: usize) -> Result<Self, X3dhError> {
        let identity = KeyPair::generate();
        let (bundle, signed_prekey) = x3dh::generate_prekey_bundle(&identity, one_time_count)?;
        Ok(Self {
            user_id: user_id.to_string(),
            identity,
            bundle,
            signed_prekey,
            device_id: msgid::device_id(),
            registration_id: rand::random::<u32>(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Rebuild a user from its durable halves.
    pub fn from_stored(
        user_id: &str,
        stored: &StoredUserRecord,
        bundle: PreKeyBundle,
    ) -> Result<Self, X3dhError> {
        let identity = KeyPair::from_secret(x3dh::decode_key(&stored.identity_secret)?);
        let signed_prekey = KeyPair::from_secret(bundle.signed_prekey_secret()?);
        Ok(Self {
            user_id: user_id.to_string(),
            identity,
            bundle,
            signed_prekey,
            device_id: stored.device_id.clone(),
            registration_id: stored.registration_id,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// The durable half of this record.
    pub fn stored(&self) -> StoredUserRecord {
        StoredUserRecord {
            identity_secret: B64.encode(self.identity.secret_bytes()),
            device_id: self.device_id.clone(),
            registration_id: self.registration_id,
        }
    }

    pub fn session_with(&self, peer: &str) -> Option<Session> {
        self.sessions.lock().get(peer).cloned()
    }

    pub fn has_session_with(&self, peer: &str) -> bool {
        self.sessions.lock().contains_key(peer)
    }

    /// Install a session for `peer` unless one already exists; returns the
    /// session that won. Two racing establishments keep the first.
    pub fn install_session(&self, peer: &str, state: RatchetState) -> Session {
        self.sessions
            .lock()
            .entry(peer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(state)))
            .clone()
    }
}

/// Durable identity material, stored under `user_record:{user}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredUserRecord {
    /// X25519 identity secret (base64).
    pub identity_secret: String,
    pub device_id: String,
    pub registration_id: u32,
}

/// The user map. A single lock guards insertion; individual sessions have
/// their own locks.
#[derive(Default)]
pub struct Registry {
    users: RwLock<HashMap<String, Arc<UserRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<UserRecord>> {
        self.users.read().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.read().contains_key(user_id)
    }

    /// Insert a record. Returns false (leaving the map unchanged) if the
    /// user already exists.
    pub fn insert(&self, record: Arc<UserRecord>) -> bool {
        let mut users = self.users.write();
        if users.contains_key(&record.user_id) {
            return false;
        }
        users.insert(record.user_id.clone(), record);
        true
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Warm-start: rebuild user records from the durable directory.
    /// Returns how many users were restored.
    pub async fn rehydrate(&self, store: &Store) -> usize {
        let mut restored = 0;
        for key in store.keys_with_prefix("user_record:").await {
            let user_id = key.trim_start_matches("user_record:").to_string();
            let Some(record_json) = store.get(&key).await else {
                continue;
            };
            let Some(bundle_json) = store.get(&keys::prekey_bundle(&user_id)).await else {
                tracing::warn!(user = %user_id, "stored user has no prekey bundle; skipping");
                continue;
            };
            let parsed: Result<(StoredUserRecord, PreKeyBundle), _> =
                serde_json::from_str(&record_json).and_then(|record| {
                    serde_json::from_str(&bundle_json).map(|bundle| (record, bundle))
                });
            let Ok((stored, bundle)) = parsed else {
                tracing::warn!(user = %user_id, "malformed stored user record; skipping");
                continue;
            };
            match UserRecord::from_stored(&user_id, &stored, bundle) {
                Ok(record) => {
                    if self.insert(Arc::new(record)) {
                        restored += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(user = %user_id, %error, "could not rebuild stored user");
                }
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_rejected() {
        let registry = Registry::new();
        let record = Arc::new(UserRecord::create("alice", 0).unwrap());
        assert!(registry.insert(record.clone()));
        assert!(!registry.insert(record));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn racing_session_installs_keep_the_first() {
        let record = UserRecord::create("alice", 0).unwrap();
        let shared = [1u8; 32];
        let peer_key = KeyPair::generate();

        let first =
            record.install_session("bob", RatchetState::init_initiator(&shared, peer_key.public()).unwrap());
        let second =
            record.install_session("bob", RatchetState::init_initiator(&shared, peer_key.public()).unwrap());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn stored_record_roundtrips_identity() {
        let record = UserRecord::create("alice", 2).unwrap();
        let stored = record.stored();
        let rebuilt =
            UserRecord::from_stored("alice", &stored, record.bundle.clone()).unwrap();
        assert_eq!(rebuilt.identity.public(), record.identity.public());
        assert_eq!(rebuilt.signed_prekey.public(), record.signed_prekey.public());
        assert_eq!(rebuilt.device_id, record.device_id);
        assert_eq!(rebuilt.registration_id, record.registration_id);
    }
}
