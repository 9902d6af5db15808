//! End-to-end encrypted messaging server.
//!
//! The cryptographic engine lives in `shroud-core`; this crate owns
//! everything around it:
//!
//! - [`registry`] — local users, their key material, and per-peer ratchet
//!   sessions
//! - [`handler`] — session establishment and message encrypt/decrypt flows
//! - [`connection`] — who is reachable right now, and how
//! - [`store`] — the external KV/queue directory (in-memory stand-in)
//! - [`frames`] — the `{type, data, timestamp}` WebSocket frame contract
//! - [`web`] — the WebSocket endpoint and the registration REST surface
//! - [`server`] — shared state, listener, and background tasks

pub mod config;
pub mod connection;
pub mod frames;
pub mod handler;
pub mod msgid;
pub mod registry;
pub mod server;
pub mod store;
pub mod web;
