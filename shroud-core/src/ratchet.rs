//! Double Ratchet session state for forward-secret messaging.
//!
//! Combines a Diffie-Hellman ratchet (a fresh X25519 exchange whenever the
//! conversation changes direction, rekeying the root key) with a symmetric
//! ratchet (one derived key per message along a chain). Out-of-order
//! delivery is handled by deriving and caching the keys of messages that
//! have not arrived yet.
//!
//! Reference: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! # Key schedule
//!
//! ```text
//! root_key                  = HKDF(SK, "RootKey", 32)
//! root_key' ‖ chain_key     = HKDF(root_key ‖ DH_out, "RatchetStep", 64)
//! message_key               = HKDF(chain_key ‖ 0x01, "MessageKey", 32)
//! chain_key'                = HKDF(chain_key ‖ 0x02, "ChainKey", 32)
//! ```
//!
//! The info strings and the 0x01/0x02 domain separators are wire-visible
//! protocol constants.
//!
//! # Failure atomicity
//!
//! [`RatchetState::decrypt`] mutates a shadow copy of the state and commits
//! it only after the AEAD opens. A failed decrypt (bad tag, skip-window
//! blowout, missing chain) leaves the state bit-for-bit untouched.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN, KeyPair};

/// Maximum number of message positions a single skip may advance.
/// A larger jump is either a denial-of-service attempt or a dropped chain.
pub const MAX_SKIP: u32 = 1000;

/// Upper bound on cached skipped keys per session. Inserting past the
/// bound evicts the oldest cached key.
const MAX_CACHED_KEYS: usize = MAX_SKIP as usize;

const INFO_ROOT: &[u8] = b"RootKey";
const INFO_RATCHET_STEP: &[u8] = b"RatchetStep";
const INFO_MESSAGE_KEY: &[u8] = b"MessageKey";
const INFO_CHAIN_KEY: &[u8] = b"ChainKey";

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// A message key derived ahead of its ciphertext, cached for out-of-order
/// delivery. Keyed by the sender's ratchet public key and message number.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
struct SkippedKey {
    remote_public: [u8; KEY_LEN],
    message_number: u32,
    message_key: [u8; KEY_LEN],
}

/// The result of encrypting one message: everything the envelope needs.
pub struct Outgoing {
    /// `nonce ‖ ciphertext ‖ tag`.
    pub ciphertext: Vec<u8>,
    /// Our current ratchet public key. On the first envelope of a session
    /// this doubles as the initiator's first ratchet key.
    pub ratchet_public: [u8; KEY_LEN],
    /// Message number within the current sending chain.
    pub message_number: u32,
    /// Messages sent on the previous sending chain.
    pub previous_chain_length: u32,
}

/// Per-(local user, peer) Double Ratchet state.
///
/// Serializable so sessions can be persisted across restarts; secret
/// material is wiped on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    root_key: [u8; KEY_LEN],
    chain_key_send: Option<[u8; KEY_LEN]>,
    chain_key_recv: Option<[u8; KEY_LEN]>,
    message_number_send: u32,
    message_number_recv: u32,
    previous_chain_length: u32,
    ratchet: KeyPair,
    remote_public: Option<[u8; KEY_LEN]>,
    skipped: Vec<SkippedKey>,
}

impl RatchetState {
    /// Initialize as the initiator.
    ///
    /// `shared_secret` comes from X3DH; `remote_public` is the responder's
    /// signed pre-key. A sending DH step runs immediately, so the first
    /// envelope already carries a fresh ratchet key distinct from any X3DH
    /// input.
    pub fn init_initiator(
        shared_secret: &[u8; KEY_LEN],
        remote_public: [u8; KEY_LEN],
    ) -> Result<Self, RatchetError> {
        let mut state = Self::fresh(derive_root(shared_secret)?, KeyPair::generate());
        state.remote_public = Some(remote_public);
        state.dh_step_send(remote_public)?;
        Ok(state)
    }

    /// Initialize as the responder.
    ///
    /// `ratchet` is our signed pre-key pair, installed as the first ratchet
    /// keypair. If the initiator's ratchet public key is already known
    /// (it rides on the first envelope), the receiving DH step runs now;
    /// otherwise it is deferred until the first inbound message supplies it.
    pub fn init_responder(
        shared_secret: &[u8; KEY_LEN],
        ratchet: KeyPair,
        initiator_public: Option<[u8; KEY_LEN]>,
    ) -> Result<Self, RatchetError> {
        let mut state = Self::fresh(derive_root(shared_secret)?, ratchet);
        if let Some(public) = initiator_public {
            state.dh_step_recv(public)?;
        }
        Ok(state)
    }

    fn fresh(root_key: [u8; KEY_LEN], ratchet: KeyPair) -> Self {
        Self {
            root_key,
            chain_key_send: None,
            chain_key_recv: None,
            message_number_send: 0,
            message_number_recv: 0,
            previous_chain_length: 0,
            ratchet,
            remote_public: None,
            skipped: Vec::new(),
        }
    }

    /// Encrypt one message, advancing the sending chain.
    ///
    /// Opens a fresh sending chain (a sending DH step) if the previous one
    /// was closed by a receiving DH step, or if this is the responder's
    /// first send.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Outgoing, RatchetError> {
        if self.chain_key_send.is_none() {
            let peer = self.remote_public.ok_or(RatchetError::NoRemoteKey)?;
            self.dh_step_send(peer)?;
        }
        let chain_key = self.chain_key_send.ok_or(RatchetError::NoSendingChain)?;
        let (next_chain, message_key) = derive_chain(&chain_key)?;
        let ciphertext = crypto::aead_seal(&message_key, plaintext, b"")?;

        self.chain_key_send = Some(next_chain);
        let message_number = self.message_number_send;
        self.message_number_send += 1;

        Ok(Outgoing {
            ciphertext,
            ratchet_public: self.ratchet.public(),
            message_number,
            previous_chain_length: self.previous_chain_length,
        })
    }

    /// Decrypt one message.
    ///
    /// `remote_public` and `message_number` come from the envelope;
    /// `previous_chain_length` is the envelope's count of messages on the
    /// peer's previous chain, used to cache the tail of the outgoing chain
    /// when the ratchet turns over (pass 0 when unknown).
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        remote_public: [u8; KEY_LEN],
        message_number: u32,
        previous_chain_length: u32,
    ) -> Result<Vec<u8>, RatchetError> {
        let mut next = self.clone();
        let plaintext =
            next.decrypt_inner(ciphertext, remote_public, message_number, previous_chain_length)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_inner(
        &mut self,
        ciphertext: &[u8],
        remote_public: [u8; KEY_LEN],
        message_number: u32,
        previous_chain_length: u32,
    ) -> Result<Vec<u8>, RatchetError> {
        // Out-of-order arrival of an already-derived key
        if let Some(message_key) = self.take_skipped(&remote_public, message_number) {
            return Ok(crypto::aead_open(&message_key, ciphertext, b"")?);
        }

        // New chain: cache the tail of the old one, then turn the ratchet
        if self.remote_public != Some(remote_public) {
            self.skip_to(previous_chain_length)?;
            self.dh_step_recv(remote_public)?;
        }

        // Cache any keys between here and the message we actually got
        self.skip_to(message_number)?;

        let chain_key = self.chain_key_recv.ok_or(RatchetError::NoReceivingChain)?;
        let (next_chain, message_key) = derive_chain(&chain_key)?;
        let plaintext = crypto::aead_open(&message_key, ciphertext, b"")?;

        self.chain_key_recv = Some(next_chain);
        self.message_number_recv = message_number + 1;
        Ok(plaintext)
    }

    /// Sending DH step: close the current sending chain, generate a fresh
    /// ratchet keypair, and open a new chain against `peer`.
    fn dh_step_send(&mut self, peer: [u8; KEY_LEN]) -> Result<(), RatchetError> {
        self.previous_chain_length = self.message_number_send;
        self.message_number_send = 0;
        self.ratchet = KeyPair::generate();
        let dh_out = self.ratchet.dh(&peer);
        let (root_key, chain_key) = derive_step(&self.root_key, &dh_out)?;
        self.root_key = root_key;
        self.chain_key_send = Some(chain_key);
        Ok(())
    }

    /// Receiving DH step: open a receiving chain for the peer's new
    /// ratchet key, using the local ratchet private already held. Closes
    /// the sending chain so the next send ratchets too; that alternation
    /// is what gives each direction change a fresh DH.
    fn dh_step_recv(&mut self, peer: [u8; KEY_LEN]) -> Result<(), RatchetError> {
        self.message_number_recv = 0;
        self.remote_public = Some(peer);
        let dh_out = self.ratchet.dh(&peer);
        let (root_key, chain_key) = derive_step(&self.root_key, &dh_out)?;
        self.root_key = root_key;
        self.chain_key_recv = Some(chain_key);
        self.chain_key_send = None;
        Ok(())
    }

    /// Derive and cache receiving-chain keys up to (not including) `until`.
    fn skip_to(&mut self, until: u32) -> Result<(), RatchetError> {
        if until > self.message_number_recv.saturating_add(MAX_SKIP) {
            return Err(RatchetError::TooManySkipped {
                current: self.message_number_recv,
                until,
            });
        }
        let (Some(mut chain_key), Some(remote)) = (self.chain_key_recv, self.remote_public) else {
            return Ok(());
        };
        while self.message_number_recv < until {
            let (next_chain, message_key) = derive_chain(&chain_key)?;
            chain_key = next_chain;
            self.cache_skipped(remote, self.message_number_recv, message_key);
            self.message_number_recv += 1;
        }
        self.chain_key_recv = Some(chain_key);
        Ok(())
    }

    fn cache_skipped(&mut self, remote_public: [u8; KEY_LEN], message_number: u32, message_key: [u8; KEY_LEN]) {
        if self.skipped.len() >= MAX_CACHED_KEYS {
            self.skipped.remove(0);
        }
        self.skipped.push(SkippedKey {
            remote_public,
            message_number,
            message_key,
        });
    }

    /// Consume a cached skipped key, if present. At most once per key.
    fn take_skipped(&mut self, remote_public: &[u8; KEY_LEN], message_number: u32) -> Option<[u8; KEY_LEN]> {
        let index = self.skipped.iter().position(|entry| {
            entry.message_number == message_number && &entry.remote_public == remote_public
        })?;
        Some(self.skipped.remove(index).message_key)
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Message number of the next outgoing message on the current chain.
    pub fn send_count(&self) -> u32 {
        self.message_number_send
    }

    /// Message number expected next on the current receiving chain.
    pub fn recv_count(&self) -> u32 {
        self.message_number_recv
    }

    /// The peer's last observed ratchet public key.
    pub fn remote_public(&self) -> Option<[u8; KEY_LEN]> {
        self.remote_public
    }

    /// Whether a sending chain is currently open.
    pub fn has_sending_chain(&self) -> bool {
        self.chain_key_send.is_some()
    }

    /// Number of cached skipped message keys.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Serialize the session state for persistence.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ratchet state is serializable")
    }

    /// Restore a persisted session state.
    pub fn from_bytes(data: &[u8]) -> Result<Self, RatchetError> {
        serde_json::from_slice(data).map_err(|_| RatchetError::InvalidState)
    }
}

// ── Key schedule ───────────────────────────────────────────────────

/// root_key = HKDF(SK, "RootKey", 32).
fn derive_root(shared_secret: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], RatchetError> {
    let mut root = [0u8; KEY_LEN];
    crypto::hkdf(shared_secret, INFO_ROOT, &mut root)?;
    Ok(root)
}

/// root_key' ‖ chain_key = HKDF(root_key ‖ dh_out, "RatchetStep", 64).
fn derive_step(
    root_key: &[u8; KEY_LEN],
    dh_out: &[u8; KEY_LEN],
) -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), RatchetError> {
    let mut ikm = zeroize::Zeroizing::new([0u8; 2 * KEY_LEN]);
    ikm[..KEY_LEN].copy_from_slice(root_key);
    ikm[KEY_LEN..].copy_from_slice(dh_out);

    let mut okm = zeroize::Zeroizing::new([0u8; 2 * KEY_LEN]);
    crypto::hkdf(&ikm[..], INFO_RATCHET_STEP, &mut okm[..])?;

    let mut next_root = [0u8; KEY_LEN];
    let mut chain_key = [0u8; KEY_LEN];
    next_root.copy_from_slice(&okm[..KEY_LEN]);
    chain_key.copy_from_slice(&okm[KEY_LEN..]);
    Ok((next_root, chain_key))
}

/// Advance a chain: message_key from seed 0x01, successor from seed 0x02.
fn derive_chain(
    chain_key: &[u8; KEY_LEN],
) -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), RatchetError> {
    let mut seeded = zeroize::Zeroizing::new([0u8; KEY_LEN + 1]);
    seeded[..KEY_LEN].copy_from_slice(chain_key);

    seeded[KEY_LEN] = MESSAGE_KEY_SEED;
    let mut message_key = [0u8; KEY_LEN];
    crypto::hkdf(&seeded[..], INFO_MESSAGE_KEY, &mut message_key)?;

    seeded[KEY_LEN] = CHAIN_KEY_SEED;
    let mut next_chain = [0u8; KEY_LEN];
    crypto::hkdf(&seeded[..], INFO_CHAIN_KEY, &mut next_chain)?;

    Ok((next_chain, message_key))
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RatchetError {
    #[error("no sending chain (session not fully initialized)")]
    NoSendingChain,
    #[error("no receiving chain")]
    NoReceivingChain,
    #[error("no remote ratchet key to step against")]
    NoRemoteKey,
    #[error("refusing to skip from message {current} to {until} (window {MAX_SKIP})")]
    TooManySkipped { current: u32, until: u32 },
    #[error("invalid persisted session state")]
    InvalidState,
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

// ── Tests ──────────────────────────────────────────────────────────
