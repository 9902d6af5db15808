//! The wire envelope carrying one ratcheted ciphertext between two users.
//!
//! Binary fields live as raw bytes in memory; base64 conversion happens
//! only at the serde boundary, via the helpers at the bottom of this
//! module. Wire field names follow the transport contract
//! (`encrypted_content` for the ciphertext).

use serde::{Deserialize, Serialize};

use crate::crypto::KEY_LEN;

/// One encrypted message in flight.
///
/// `ephemeral_public_key` is overloaded by the protocol: on the first
/// envelope of a session it is the initiator's first ratchet public key
/// (the responder must treat it as such); on every later envelope it is
/// the sender's current ratchet public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(rename = "encrypted_content", with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64_key_opt")]
    pub ephemeral_public_key: Option<[u8; KEY_LEN]>,
    pub previous_chain_length: u32,
    pub message_number: u32,
    /// Unix seconds.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_destruct_seconds: Option<u64>,
    pub message_type: String,
}

/// Serde helper: `Vec<u8>` as standard padded base64.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        STANDARD
            .decode(value)
            .map_err(|_| serde::de::Error::custom("invalid base64"))
    }
}

/// Serde helper: `Option<[u8; 32]>` as standard padded base64 (or null).
pub mod b64_key_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::crypto::KEY_LEN;

    pub fn serialize<S: Serializer>(
        key: &Option<[u8; KEY_LEN]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => serializer.serialize_some(&STANDARD.encode(key)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<[u8; KEY_LEN]>, D::Error> {
        let Some(value) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(value)
            .map_err(|_| serde::de::Error::custom("invalid base64"))?;
        if bytes.len() != KEY_LEN {
            return Err(serde::de::Error::custom("key must be 32 bytes"));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let envelope = Envelope {
            id: "deadbeef".into(),
            sender_id: "alice".into(),
            recipient_id: "bob".into(),
            ciphertext: vec![1, 2, 3, 4],
            ephemeral_public_key: Some([7u8; 32]),
            previous_chain_length: 3,
            message_number: 5,
            timestamp: 1_700_000_000.25,
            self_destruct_seconds: Some(30),
            message_type: "text".into(),
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"encrypted_content\":\"AQIDBA==\""));

        let restored: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.ciphertext, envelope.ciphertext);
        assert_eq!(restored.ephemeral_public_key, Some([7u8; 32]));
        assert_eq!(restored.message_number, 5);
        assert_eq!(restored.self_destruct_seconds, Some(30));
    }

    #[test]
    fn self_destruct_omitted_when_absent() {
        let envelope = Envelope {
            id: "1".into(),
            sender_id: "a".into(),
            recipient_id: "b".into(),
            ciphertext: vec![],
            ephemeral_public_key: None,
            previous_chain_length: 0,
            message_number: 0,
            timestamp: 0.0,
            self_destruct_seconds: None,
            message_type: "text".into(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("self_destruct_seconds"));

        let restored: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.self_destruct_seconds, None);
        assert_eq!(restored.ephemeral_public_key, None);
    }

    #[test]
    fn oversized_key_rejected() {
        let json = r#"{
            "id": "1", "sender_id": "a", "recipient_id": "b",
            "encrypted_content": "AQID",
            "ephemeral_public_key": "AQID",
            "previous_chain_length": 0, "message_number": 0,
            "timestamp": 0.0, "message_type": "text"
        }"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }
}
