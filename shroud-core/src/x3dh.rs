//! Extended Triple Diffie-Hellman (X3DH) key agreement.
//!
//! Establishes the shared secret that seeds a Double Ratchet session.
//! The responder publishes a pre-key bundle; the initiator fetches it and
//! derives the secret without the responder being online.
//!
//! Reference: <https://signal.org/docs/specifications/x3dh/>
//!
//! # Protocol
//!
//! The initiator computes:
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OTPK_B)          (only if a one-time pre-key is in play)
//! SK  = HKDF(DH1 ‖ DH2 ‖ DH3 [‖ DH4], "X3DHSharedSecret", 32)
//! ```
//!
//! The responder mirrors the computation with roles swapped. The
//! concatenation order is fixed; both sides must agree on whether DH4 was
//! included or the secrets diverge.
//!
//! # Directory format for a pre-key bundle
//!
//! Stored under `prekey_bundle:{user}` in the directory, private halves
//! included (the directory is inside the server's trust domain):
//!
//! ```json
//! {
//!   "identity_key": "<base64 32 bytes>",
//!   "signed_prekey": { "public": "…", "private": "…", "signature": "…" },
//!   "one_time_prekeys": [ { "public": "…", "private": "…" }, … ]
//! }
//! ```
//!
//! The "signature" is an HKDF over `identity_secret ‖ spk_public`. It is a
//! protocol-compatibility surrogate, not a verifiable signature; see
//! DESIGN.md before relying on it for authentication.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, KEY_LEN, KeyPair};

/// Length of the signed-prekey signature surrogate.
pub const SIGNATURE_LEN: usize = 64;

/// HKDF info strings; wire-visible protocol constants.
const INFO_SHARED_SECRET: &[u8] = b"X3DHSharedSecret";
const INFO_SIGNED_PREKEY: &[u8] = b"SignedPreKey";

/// A signed pre-key entry as stored in the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// X25519 public key (base64).
    pub public: String,
    /// X25519 secret key (base64). Retained so the responder side of the
    /// handshake can run for this user.
    pub private: String,
    /// HKDF surrogate over `identity_secret ‖ public` (base64, 64 bytes).
    pub signature: String,
}

/// A one-time pre-key entry as stored in the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    pub public: String,
    pub private: String,
}

/// A user's full pre-key bundle, private halves included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// X25519 identity public key (base64).
    pub identity_key: String,
    pub signed_prekey: SignedPreKeyRecord,
    pub one_time_prekeys: Vec<OneTimePreKeyRecord>,
}

/// The public projection of a bundle: what an initiator actually needs.
#[derive(Debug, Clone)]
pub struct PublicPreKey {
    pub identity_key: [u8; KEY_LEN],
    pub signed_prekey: [u8; KEY_LEN],
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey: Option<[u8; KEY_LEN]>,
}

impl PreKeyBundle {
    /// Extract the identity public key.
    pub fn identity_public(&self) -> Result<[u8; KEY_LEN], X3dhError> {
        decode_key(&self.identity_key)
    }

    /// Extract the signed pre-key public key.
    pub fn signed_prekey_public(&self) -> Result<[u8; KEY_LEN], X3dhError> {
        decode_key(&self.signed_prekey.public)
    }

    /// Extract the signed pre-key secret key.
    pub fn signed_prekey_secret(&self) -> Result<[u8; KEY_LEN], X3dhError> {
        decode_key(&self.signed_prekey.private)
    }

    /// The initiator-facing view of this bundle. No one-time pre-key is
    /// selected here; callers that consume one fill it in themselves.
    pub fn public_keys(&self) -> Result<PublicPreKey, X3dhError> {
        Ok(PublicPreKey {
            identity_key: self.identity_public()?,
            signed_prekey: self.signed_prekey_public()?,
            signed_prekey_signature: B64
                .decode(&self.signed_prekey.signature)
                .map_err(|_| X3dhError::InvalidBundle)?,
            one_time_prekey: None,
        })
    }
}

/// Generate a fresh pre-key bundle for `identity`: a signed pre-key, its
/// signature surrogate, and `one_time_count` one-time pre-keys.
///
/// Returns the bundle and the signed pre-key pair (the caller keeps the
/// pair around to run responder handshakes without re-decoding base64).
pub fn generate_prekey_bundle(
    identity: &KeyPair,
    one_time_count: usize,
) -> Result<(PreKeyBundle, KeyPair), X3dhError> {
    let signed_prekey = KeyPair::generate();
    let signature = sign_prekey(&identity.secret_bytes(), &signed_prekey.public())?;

    let one_time_prekeys = (0..one_time_count)
        .map(|_| {
            let pair = KeyPair::generate();
            OneTimePreKeyRecord {
                public: B64.encode(pair.public()),
                private: B64.encode(pair.secret_bytes()),
            }
        })
        .collect();

    let bundle = PreKeyBundle {
        identity_key: B64.encode(identity.public()),
        signed_prekey: SignedPreKeyRecord {
            public: B64.encode(signed_prekey.public()),
            private: B64.encode(signed_prekey.secret_bytes()),
            signature: B64.encode(signature),
        },
        one_time_prekeys,
    };
    Ok((bundle, signed_prekey))
}

/// The signed-prekey "signature": HKDF(identity_secret ‖ spk_public,
/// "SignedPreKey", 64). Only the identity secret can recompute it.
fn sign_prekey(
    identity_secret: &[u8; KEY_LEN],
    spk_public: &[u8; KEY_LEN],
) -> Result<[u8; SIGNATURE_LEN], X3dhError> {
    let mut ikm = zeroize::Zeroizing::new(Vec::with_capacity(2 * KEY_LEN));
    ikm.extend_from_slice(identity_secret);
    ikm.extend_from_slice(spk_public);
    let mut signature = [0u8; SIGNATURE_LEN];
    crypto::hkdf(&ikm, INFO_SIGNED_PREKEY, &mut signature)?;
    Ok(signature)
}

/// Initiator side: derive the shared secret from the peer's bundle.
pub fn agree_initiator(
    identity_secret: &[u8; KEY_LEN],
    ephemeral_secret: &[u8; KEY_LEN],
    peer: &PublicPreKey,
) -> Result<[u8; KEY_LEN], X3dhError> {
    let dh1 = crypto::dh(identity_secret, &peer.signed_prekey);
    let dh2 = crypto::dh(ephemeral_secret, &peer.identity_key);
    let dh3 = crypto::dh(ephemeral_secret, &peer.signed_prekey);
    let dh4 = peer
        .one_time_prekey
        .map(|otpk| crypto::dh(ephemeral_secret, &otpk));
    derive_shared_secret(dh1, dh2, dh3, dh4)
}

/// Responder side: mirror computation. Must yield the initiator's bytes.
pub fn agree_responder(
    identity_secret: &[u8; KEY_LEN],
    signed_prekey_secret: &[u8; KEY_LEN],
    one_time_secret: Option<&[u8; KEY_LEN]>,
    initiator_identity: &[u8; KEY_LEN],
    initiator_ephemeral: &[u8; KEY_LEN],
) -> Result<[u8; KEY_LEN], X3dhError> {
    let dh1 = crypto::dh(signed_prekey_secret, initiator_identity);
    let dh2 = crypto::dh(identity_secret, initiator_ephemeral);
    let dh3 = crypto::dh(signed_prekey_secret, initiator_ephemeral);
    let dh4 = one_time_secret.map(|otpk| crypto::dh(otpk, initiator_ephemeral));
    derive_shared_secret(dh1, dh2, dh3, dh4)
}

/// SK = HKDF(DH1 ‖ DH2 ‖ DH3 [‖ DH4], "X3DHSharedSecret", 32).
/// The concatenation order is the authentication boundary.
fn derive_shared_secret(
    dh1: [u8; KEY_LEN],
    dh2: [u8; KEY_LEN],
    dh3: [u8; KEY_LEN],
    dh4: Option<[u8; KEY_LEN]>,
) -> Result<[u8; KEY_LEN], X3dhError> {
    let mut ikm = zeroize::Zeroizing::new(Vec::with_capacity(4 * KEY_LEN));
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4);
    }
    let mut shared = [0u8; KEY_LEN];
    crypto::hkdf(&ikm, INFO_SHARED_SECRET, &mut shared)?;
    Ok(shared)
}

/// Decode a base64 X25519 key, enforcing the 32-byte length.
pub fn decode_key(value: &str) -> Result<[u8; KEY_LEN], X3dhError> {
    let bytes = B64.decode(value).map_err(|_| X3dhError::InvalidBundle)?;
    if bytes.len() != KEY_LEN {
        return Err(X3dhError::InvalidBundle);
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum X3dhError {
    #[error("invalid pre-key bundle")]
    InvalidBundle,
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

// ── Tests ──────────────────────────────────────────────────────────
