//! The transport frame contract: `{type, data, timestamp}` JSON frames.
//!
//! Payloads are tagged record types; binary fields ride as base64 and are
//! converted only at the serde boundary (helpers live in
//! `shroud_core::envelope`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shroud_core::crypto::KEY_LEN;
use shroud_core::envelope::Envelope;

/// Frame kinds recognized at the cryptographic boundary.
pub mod kind {
    pub const AUTH: &str = "auth";
    pub const AUTH_SUCCESS: &str = "auth_success";
    pub const ENCRYPTED_MESSAGE: &str = "encrypted_message";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const DECRYPT_MESSAGE: &str = "decrypt_message";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const DECRYPTED_MESSAGE: &str = "decrypted_message";
    pub const MESSAGE_DESTROYED: &str = "message_destroyed";
    pub const PRESENCE: &str = "presence";
    pub const TYPING: &str = "typing";
    pub const ERROR: &str = "error";
    pub const DECRYPTION_ERROR: &str = "decryption_error";
    pub const PREKEY_BUNDLE: &str = "prekey_bundle";
    pub const GET_PREKEYS: &str = "get_prekeys";
}

/// One WebSocket frame, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(default)]
    pub timestamp: f64,
}

impl Frame {
    pub fn new(kind: &str, data: impl Serialize) -> Self {
        Self {
            kind: kind.to_string(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            timestamp: unix_now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            kind::ERROR,
            ErrorData {
                message: message.into(),
            },
        )
    }

    /// Decode the payload into its typed record.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Current unix time as fractional seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ── Client → server payloads ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthData {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageData {
    pub recipient_id: String,
    pub content: String,
    #[serde(default)]
    pub self_destruct_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptMessageData {
    pub sender_id: String,
    #[serde(with = "shroud_core::envelope::b64")]
    pub encrypted_content: Vec<u8>,
    #[serde(default, with = "shroud_core::envelope::b64_key_opt")]
    pub ephemeral_public_key: Option<[u8; KEY_LEN]>,
    pub message_number: u32,
    /// Messages on the sender's previous chain. Optional on the wire;
    /// absent means the old-chain tail cannot be cached.
    #[serde(default)]
    pub previous_chain_length: u32,
    #[serde(default)]
    pub is_first_message: bool,
    pub message_id: String,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRequest {
    pub recipient_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusRequest {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPrekeysData {
    pub user_id: String,
}

// ── Server → client payloads ───────────────────────────────────────

/// The wire envelope plus the session-bootstrap discriminator: `true`
/// only on the first envelope of a session, telling the responder to
/// materialize its ratchet before decrypting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMessageData {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default)]
    pub is_first_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSentData {
    pub message_id: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptedMessageData {
    pub message_id: String,
    pub sender_id: String,
    pub content: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptionErrorData {
    pub message_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDestroyedData {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceData {
    pub user_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingData {
    pub sender_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusData {
    pub message_id: String,
    pub user_id: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}
