//! Cryptographic primitives: X25519 agreement, HKDF-SHA256, AES-256-GCM.
//!
//! Everything above this module (X3DH, Double Ratchet) is deterministic key
//! schedule machinery; the randomness and the cipher live here.
//!
//! # Sealed message format
//!
//! ```text
//! nonce (12 bytes) ‖ ciphertext ‖ GCM tag (16 bytes)
//! ```
//!
//! Nonces are sampled fresh per call. Every message key is used exactly
//! once, so random nonces cannot collide under the same key.

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 key length; also the AES-256 key length.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;
/// Smallest well-formed sealed message: nonce + tag around empty plaintext.
pub const MIN_SEALED_LEN: usize = NONCE_LEN + TAG_LEN;

/// An X25519 keypair. The secret half is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, serde::Serialize, serde::Deserialize)]
pub struct KeyPair {
    secret: [u8; KEY_LEN],
    #[zeroize(skip)]
    public: [u8; KEY_LEN],
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    /// Restore a keypair from a 32-byte secret.
    pub fn from_secret(secret: [u8; KEY_LEN]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(secret));
        Self {
            secret,
            public: public.to_bytes(),
        }
    }

    /// The secret key bytes (for persistence).
    pub fn secret_bytes(&self) -> [u8; KEY_LEN] {
        self.secret
    }

    /// The public key bytes.
    pub fn public(&self) -> [u8; KEY_LEN] {
        self.public
    }

    /// X25519 agreement between our secret and a peer public key.
    pub fn dh(&self, peer_public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        dh(&self.secret, peer_public)
    }
}

/// Plain X25519 Diffie-Hellman.
pub fn dh(secret: &[u8; KEY_LEN], peer_public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*secret);
    let public = PublicKey::from(*peer_public);
    secret.diffie_hellman(&public).to_bytes()
}

/// HKDF-SHA256 with an empty salt (zero-filled per RFC 5869).
///
/// The empty salt is a fixed protocol parameter; changing it breaks
/// interoperability with every existing session.
pub fn hkdf(ikm: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    hk.expand(info, okm).map_err(|_| CryptoError::KdfFailed)
}

/// Encrypt with AES-256-GCM. Returns `nonce ‖ ciphertext ‖ tag`.
pub fn aead_seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let ciphertext = cipher
        .encrypt(&nonce, payload)
        .map_err(|_| CryptoError::AeadFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a `nonce ‖ ciphertext ‖ tag` message produced by [`aead_seal`].
pub fn aead_open(key: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    if sealed.len() < MIN_SEALED_LEN {
        return Err(CryptoError::SealedTooShort(sealed.len()));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
    let payload = Payload {
        msg: &sealed[NONCE_LEN..],
        aad,
    };
    cipher
        .decrypt(nonce, payload)
        .map_err(|_| CryptoError::AeadFailed)
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length: {0} bytes (expected 32)")]
    InvalidKeyLength(usize),
    #[error("sealed message too short: {0} bytes (minimum 28)")]
    SealedTooShort(usize),
    #[error("AEAD authentication failed")]
    AeadFailed,
    #[error("HKDF expand failed")]
    KdfFailed,
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let sealed = aead_seal(&key, b"attack at dawn", b"").unwrap();
        let opened = aead_open(&key, &sealed, b"").unwrap();
        assert_eq!(opened, b"attack at dawn");
    }

    #[test]
    fn roundtrip_with_aad() {
        let key = [9u8; 32];
        let sealed = aead_seal(&key, b"payload", b"header").unwrap();
        assert_eq!(aead_open(&key, &sealed, b"header").unwrap(), b"payload");
        // Same ciphertext, different AAD: must fail
        assert!(matches!(
            aead_open(&key, &sealed, b"other"),
            Err(CryptoError::AeadFailed)
        ));
    }

    #[test]
    fn any_bit_flip_fails() {
        let key = [1u8; 32];
        let sealed = aead_seal(&key, b"integrity matters", b"").unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(
                aead_open(&key, &tampered, b"").is_err(),
                "flip at byte {i} went unnoticed"
            );
        }
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = aead_seal(&[1u8; 32], b"secret", b"").unwrap();
        assert!(matches!(
            aead_open(&[2u8; 32], &sealed, b""),
            Err(CryptoError::AeadFailed)
        ));
    }

    #[test]
    fn bad_key_length_rejected() {
        assert!(matches!(
            aead_seal(&[0u8; 16], b"x", b""),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert!(matches!(
            aead_open(&[0u8; 31], &[0u8; 40], b""),
            Err(CryptoError::InvalidKeyLength(31))
        ));
    }

    #[test]
    fn short_sealed_rejected() {
        // 27 bytes: one short of nonce + tag
        assert!(matches!(
            aead_open(&[0u8; 32], &[0u8; 27], b""),
            Err(CryptoError::SealedTooShort(27))
        ));
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = [3u8; 32];
        let sealed = aead_seal(&key, b"", b"").unwrap();
        assert_eq!(sealed.len(), MIN_SEALED_LEN);
        assert_eq!(aead_open(&key, &sealed, b"").unwrap(), b"");
    }

    #[test]
    fn nonces_are_fresh() {
        let key = [5u8; 32];
        let a = aead_seal(&key, b"same plaintext", b"").unwrap();
        let b = aead_seal(&key, b"same plaintext", b"").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn hkdf_is_deterministic() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        hkdf(b"input keying material", b"SomeInfo", &mut a).unwrap();
        hkdf(b"input keying material", b"SomeInfo", &mut b).unwrap();
        assert_eq!(a, b);

        let mut c = [0u8; 64];
        hkdf(b"input keying material", b"OtherInfo", &mut c).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn dh_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        assert_eq!(alice.dh(&bob.public()), bob.dh(&alice.public()));
    }

    #[test]
    fn keypair_restores_from_secret() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_secret(pair.secret_bytes());
        assert_eq!(pair.public(), restored.public());
    }
}
