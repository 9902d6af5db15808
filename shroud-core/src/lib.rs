//! Cryptographic session engine for end-to-end encrypted messaging.
//!
//! Three layers, bottom up:
//!
//! - [`crypto`] — X25519 agreement, HKDF-SHA256, AES-256-GCM sealing.
//! - [`x3dh`] — pre-key bundles and the initial key agreement that seeds
//!   a session.
//! - [`ratchet`] — the Double Ratchet: per-session state, DH and symmetric
//!   ratchet steps, skipped-key cache, encrypt/decrypt.
//!
//! [`envelope`] defines the wire record a ciphertext travels in.
//!
//! This crate is deliberately free of async and I/O; the server crate owns
//! scheduling, storage, and delivery.

pub mod crypto;
pub mod envelope;
pub mod ratchet;
pub mod x3dh;
