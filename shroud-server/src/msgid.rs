//! Random hex token generation.
//!
//! Message ids are 16 random bytes (32 hex chars); connection and device
//! ids are 8 random bytes (16 hex chars).

use rand::RngCore;

/// `n` random bytes as a lowercase hex string.
pub fn token_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Fresh message id.
pub fn message_id() -> String {
    token_hex(16)
}

/// Fresh connection id.
pub fn connection_id() -> String {
    token_hex(8)
}

/// Fresh device id.
pub fn device_id() -> String {
    token_hex(8)
}
