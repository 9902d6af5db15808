//! Message handling: session establishment, encryption, decryption, and
//! routing to the online or offline path.
//!
//! The handler performs the crypto on behalf of registered users. On a
//! first contact it runs the X3DH handshake (initiator side on send,
//! responder side on the first inbound decrypt), installs the ratchet
//! session, and marks the outgoing envelope as a first message so the
//! receiver knows to materialize its own session before decrypting.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::Value;

use shroud_core::crypto::{KEY_LEN, KeyPair};
use shroud_core::envelope::Envelope;
use shroud_core::ratchet::{RatchetError, RatchetState};
use shroud_core::x3dh::{self, PreKeyBundle};

use crate::connection::ConnectionRegistry;
use crate::frames::{self, EncryptedMessageData, Frame, MessageDestroyedData, MessageStatusData, TypingData, kind};
use crate::msgid;
use crate::registry::{Registry, Session, UserRecord};
use crate::store::{
    META_TTL_SECS, SELF_DESTRUCT_INDEX, Store, X3DH_EPHEMERAL_TTL_SECS, keys,
};

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct RegisteredUser {
    pub user_id: String,
    pub device_id: String,
    pub registration_id: u32,
    /// Identity public key (base64).
    pub identity_key: String,
}

pub struct MessageHandler {
    store: Arc<Store>,
    connections: Arc<ConnectionRegistry>,
    registry: Arc<Registry>,
    prekey_batch: usize,
}

impl MessageHandler {
    pub fn new(
        store: Arc<Store>,
        connections: Arc<ConnectionRegistry>,
        registry: Arc<Registry>,
        prekey_batch: usize,
    ) -> Self {
        Self {
            store,
            connections,
            registry,
            prekey_batch,
        }
    }

    // ── Registration ───────────────────────────────────────────────

    /// Create a user, publish its bundle and durable record to the
    /// directory.
    pub async fn register_user(&self, user_id: &str) -> Result<RegisteredUser, HandlerError> {
        if self.registry.contains(user_id) {
            return Err(HandlerError::UserExists(user_id.to_string()));
        }
        let record = UserRecord::create(user_id, self.prekey_batch)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let record = Arc::new(record);
        if !self.registry.insert(record.clone()) {
            return Err(HandlerError::UserExists(user_id.to_string()));
        }

        let bundle_json = serde_json::to_string(&record.bundle)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let stored_json = serde_json::to_string(&record.stored())
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        self.store.set(&keys::prekey_bundle(user_id), bundle_json).await;
        self.store.set(&keys::user_record(user_id), stored_json).await;

        tracing::info!(user = %user_id, device = %record.device_id, "user registered");
        Ok(RegisteredUser {
            user_id: user_id.to_string(),
            device_id: record.device_id.clone(),
            registration_id: record.registration_id,
            identity_key: B64.encode(record.identity.public()),
        })
    }

    // ── Send path ──────────────────────────────────────────────────

    /// Encrypt `content` for `recipient_id` and route the envelope.
    ///
    /// Returns the envelope and whether it was delivered online (false
    /// means it went to the offline queue, which is not an error).
    pub async fn send_text(
        &self,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        self_destruct_seconds: Option<u64>,
    ) -> Result<(Envelope, bool), HandlerError> {
        let sender = self
            .registry
            .get(sender_id)
            .ok_or_else(|| HandlerError::UnknownUser(sender_id.to_string()))?;
        if !self.registry.contains(recipient_id) {
            return Err(HandlerError::UnknownUser(recipient_id.to_string()));
        }

        let is_first = !sender.has_session_with(recipient_id);
        let session = match sender.session_with(recipient_id) {
            Some(session) => session,
            None => self.establish_initiator_session(&sender, recipient_id).await?,
        };

        let payload = serde_json::json!({
            "type": "text",
            "content": content,
            "timestamp": frames::unix_now(),
            "sender_id": sender_id,
        });
        let outgoing = {
            let mut ratchet = session.lock();
            ratchet.encrypt(payload.to_string().as_bytes())?
        };

        let envelope = Envelope {
            id: msgid::message_id(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            ciphertext: outgoing.ciphertext,
            ephemeral_public_key: Some(outgoing.ratchet_public),
            previous_chain_length: outgoing.previous_chain_length,
            message_number: outgoing.message_number,
            timestamp: frames::unix_now(),
            self_destruct_seconds,
            message_type: "text".to_string(),
        };

        let delivered = self.deliver(&envelope, is_first).await;
        if !delivered {
            self.queue_offline(&envelope, is_first).await?;
            tracing::debug!(
                recipient = %recipient_id,
                message = %envelope.id,
                "recipient offline; message queued"
            );
        }

        if let Some(seconds) = self_destruct_seconds {
            self.store
                .zadd(
                    SELF_DESTRUCT_INDEX,
                    envelope.timestamp + seconds as f64,
                    envelope.id.clone(),
                )
                .await;
        }

        Ok((envelope, delivered))
    }

    /// First contact: fetch the recipient's published bundle, run the
    /// initiator side of X3DH, install the ratchet, and persist the X3DH
    /// ephemeral public key for the responder.
    async fn establish_initiator_session(
        &self,
        sender: &Arc<UserRecord>,
        recipient_id: &str,
    ) -> Result<Session, HandlerError> {
        let bundle_json = self
            .store
            .get(&keys::prekey_bundle(recipient_id))
            .await
            .ok_or_else(|| {
                HandlerError::Handshake(format!("missing prekey bundle for {recipient_id}"))
            })?;
        let bundle: PreKeyBundle = serde_json::from_str(&bundle_json)
            .map_err(|_| HandlerError::InvalidInput("malformed prekey bundle".into()))?;
        let peer = bundle
            .public_keys()
            .map_err(|_| HandlerError::InvalidInput("malformed prekey bundle".into()))?;

        let ephemeral = KeyPair::generate();
        let shared_secret = x3dh::agree_initiator(
            &sender.identity.secret_bytes(),
            &ephemeral.secret_bytes(),
            &peer,
        )
        .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let state = RatchetState::init_initiator(&shared_secret, peer.signed_prekey)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let session = sender.install_session(recipient_id, state);

        self.store
            .set_ex(
                &keys::x3dh_ephemeral(&sender.user_id, recipient_id),
                B64.encode(ephemeral.public()),
                X3DH_EPHEMERAL_TTL_SECS,
            )
            .await;

        tracing::info!(
            sender = %sender.user_id,
            recipient = %recipient_id,
            "initiator session established"
        );
        Ok(session)
    }

    /// Online delivery. On success the message metadata is recorded for
    /// status relays and self-destruct notices.
    async fn deliver(&self, envelope: &Envelope, is_first: bool) -> bool {
        if !self.connections.is_user_online(&envelope.recipient_id).await {
            return false;
        }
        let frame = Frame::new(
            kind::ENCRYPTED_MESSAGE,
            EncryptedMessageData {
                envelope: envelope.clone(),
                is_first_message: is_first,
            },
        );
        let sent = self.connections.send_to_user(&envelope.recipient_id, frame).await;
        if sent {
            let meta = serde_json::json!({
                "sender_id": envelope.sender_id,
                "recipient_id": envelope.recipient_id,
                "timestamp": envelope.timestamp,
            });
            self.store
                .set_ex(&keys::message_meta(&envelope.id), meta.to_string(), META_TTL_SECS)
                .await;
        }
        sent
    }

    async fn queue_offline(&self, envelope: &Envelope, is_first: bool) -> Result<(), HandlerError> {
        let entry = serde_json::to_string(&EncryptedMessageData {
            envelope: envelope.clone(),
            is_first_message: is_first,
        })
        .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        self.store
            .zadd(
                &keys::offline_messages(&envelope.recipient_id),
                envelope.timestamp,
                entry,
            )
            .await;
        Ok(())
    }

    // ── Receive path ───────────────────────────────────────────────

    /// Decrypt an inbound ciphertext for `receiver_id`.
    ///
    /// On a first-message envelope with no session, the responder side of
    /// X3DH runs first: the stored X3DH ephemeral and the sender's
    /// published identity key produce the shared secret, and the envelope's
    /// ephemeral key (the initiator's first ratchet key) seeds the
    /// receiving chain.
    pub async fn decrypt_request(
        &self,
        receiver_id: &str,
        sender_id: &str,
        ciphertext: &[u8],
        ephemeral_public_key: Option<[u8; KEY_LEN]>,
        message_number: u32,
        previous_chain_length: u32,
        is_first_message: bool,
    ) -> Result<String, HandlerError> {
        let receiver = self
            .registry
            .get(receiver_id)
            .ok_or_else(|| HandlerError::UnknownUser(receiver_id.to_string()))?;
        let remote_public = ephemeral_public_key
            .ok_or_else(|| HandlerError::InvalidInput("missing ephemeral public key".into()))?;

        let session = match receiver.session_with(sender_id) {
            Some(session) => session,
            None if is_first_message => {
                self.establish_responder_session(&receiver, sender_id, ephemeral_public_key)
                    .await?
            }
            None => {
                return Err(HandlerError::SessionNotEstablished(sender_id.to_string()));
            }
        };
        let plaintext = {
            let mut ratchet = session.lock();
            ratchet.decrypt(ciphertext, remote_public, message_number, previous_chain_length)?
        };

        let payload: Value = serde_json::from_slice(&plaintext)
            .map_err(|_| HandlerError::InvalidInput("malformed decrypted payload".into()))?;
        payload
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HandlerError::InvalidInput("payload missing content".into()))
    }

    async fn establish_responder_session(
        &self,
        receiver: &Arc<UserRecord>,
        sender_id: &str,
        initiator_ratchet_public: Option<[u8; KEY_LEN]>,
    ) -> Result<Session, HandlerError> {
        let ephemeral_b64 = self
            .store
            .get(&keys::x3dh_ephemeral(sender_id, &receiver.user_id))
            .await
            .ok_or_else(|| {
                HandlerError::Handshake(format!(
                    "missing stored X3DH ephemeral for {sender_id} -> {}",
                    receiver.user_id
                ))
            })?;
        let initiator_ephemeral = x3dh::decode_key(&ephemeral_b64)
            .map_err(|_| HandlerError::InvalidInput("malformed stored X3DH ephemeral".into()))?;

        let bundle_json = self
            .store
            .get(&keys::prekey_bundle(sender_id))
            .await
            .ok_or_else(|| {
                HandlerError::Handshake(format!("missing prekey bundle for {sender_id}"))
            })?;
        let bundle: PreKeyBundle = serde_json::from_str(&bundle_json)
            .map_err(|_| HandlerError::InvalidInput("malformed prekey bundle".into()))?;
        let initiator_identity = bundle
            .identity_public()
            .map_err(|_| HandlerError::InvalidInput("malformed prekey bundle".into()))?;

        // No one-time pre-key on this path; both sides agree on three DHs.
        let shared_secret = x3dh::agree_responder(
            &receiver.identity.secret_bytes(),
            &receiver.signed_prekey.secret_bytes(),
            None,
            &initiator_identity,
            &initiator_ephemeral,
        )
        .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let state = RatchetState::init_responder(
            &shared_secret,
            receiver.signed_prekey.clone(),
            initiator_ratchet_public,
        )
        .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let session = receiver.install_session(sender_id, state);

        tracing::info!(
            receiver = %receiver.user_id,
            sender = %sender_id,
            "responder session established"
        );
        Ok(session)
    }

    // ── Delivery plane ─────────────────────────────────────────────

    /// Replay queued envelopes to a (re)connected user in timestamp
    /// order, then drop the queue. Returns how many frames went out.
    pub async fn deliver_offline_messages(&self, user_id: &str) -> usize {
        let key = keys::offline_messages(user_id);
        let entries = self.store.zrange_all(&key).await;
        if entries.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        for raw in &entries {
            match serde_json::from_str::<EncryptedMessageData>(raw) {
                Ok(data) => {
                    let frame = Frame::new(kind::ENCRYPTED_MESSAGE, data);
                    if self.connections.send_to_user(user_id, frame).await {
                        delivered += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(user = %user_id, %error, "dropping malformed queued message");
                }
            }
        }
        self.store.delete(&key).await;
        tracing::info!(user = %user_id, count = delivered, "offline queue replayed");
        delivered
    }

    /// Forward a typing indicator; also published on the recipient's
    /// typing channel for other processes.
    pub async fn handle_typing(&self, sender_id: &str, recipient_id: &str, is_typing: bool) {
        let payload = serde_json::json!({
            "sender_id": sender_id,
            "is_typing": is_typing,
            "timestamp": frames::unix_now(),
        });
        self.store
            .publish(&keys::typing_channel(recipient_id), payload.to_string())
            .await;
        let frame = Frame::new(
            kind::TYPING,
            TypingData {
                sender_id: sender_id.to_string(),
                is_typing,
            },
        );
        self.connections.send_to_user(recipient_id, frame).await;
    }

    /// Relay a delivery/read status back to the original sender.
    pub async fn handle_message_status(&self, message_id: &str, status: &str, user_id: &str) {
        let Some(meta_json) = self.store.get(&keys::message_meta(message_id)).await else {
            return;
        };
        let Ok(meta) = serde_json::from_str::<Value>(&meta_json) else {
            return;
        };
        let Some(original_sender) = meta.get("sender_id").and_then(Value::as_str) else {
            return;
        };
        let frame = Frame::new(
            status,
            MessageStatusData {
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
                timestamp: frames::unix_now(),
            },
        );
        self.connections.send_to_user(original_sender, frame).await;
    }

    /// One self-destruct sweep: expire everything scored at or before
    /// now, notify both endpoints, and drop the metadata.
    pub async fn sweep_self_destruct(&self) -> Result<usize, HandlerError> {
        let now = frames::unix_now();
        let expired = self
            .store
            .zrange_by_score(SELF_DESTRUCT_INDEX, 0.0, now)
            .await;
        for message_id in &expired {
            if let Some(meta_json) = self.store.get(&keys::message_meta(message_id)).await {
                match serde_json::from_str::<Value>(&meta_json) {
                    Ok(meta) => {
                        for endpoint in ["sender_id", "recipient_id"] {
                            if let Some(user) = meta.get(endpoint).and_then(Value::as_str) {
                                let frame = Frame::new(
                                    kind::MESSAGE_DESTROYED,
                                    MessageDestroyedData {
                                        message_id: message_id.clone(),
                                    },
                                );
                                self.connections.send_to_user(user, frame).await;
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(message = %message_id, %error, "malformed message metadata");
                    }
                }
            }
            self.store.delete(&keys::message_meta(message_id)).await;
            tracing::debug!(message = %message_id, "message self-destructed");
        }
        self.store
            .zrem_range_by_score(SELF_DESTRUCT_INDEX, 0.0, now)
            .await;
        Ok(expired.len())
    }
}

// ── Errors ─────────────────────────────────────────────────────────

/// The handler's error taxonomy. `DeliveryUnavailable` is deliberately
/// absent: an offline recipient routes to the queue and is not an error.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no session established with {0}")]
    SessionNotEstablished(String),
    #[error("handshake failure: {0}")]
    Handshake(String),
    #[error("decrypt failure: {0}")]
    Decrypt(#[from] RatchetError),
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("crypto failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    /// Whether this error belongs on a `decryption_error` control frame
    /// (as opposed to a generic `error` frame).
    pub fn is_decrypt_error(&self) -> bool {
        matches!(
            self,
            HandlerError::Decrypt(_) | HandlerError::SessionNotEstablished(_)
        )
    }
}
