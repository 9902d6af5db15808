//! End-to-end messaging scenarios against the shared server state.
//!
//! Tests cover:
//! - Session establishment in both directions (X3DH + ratchet init)
//! - In-order, out-of-order, and offline delivery
//! - Tamper resistance and error taxonomy boundaries
//! - Self-destruct sweep
//! - Registry rehydration from the directory

use std::sync::Arc;

use tokio::sync::mpsc;

use shroud_server::config::ServerConfig;
use shroud_server::frames::{EncryptedMessageData, Frame, kind};
use shroud_server::handler::HandlerError;
use shroud_server::registry::Registry;
use shroud_server::server::SharedState;
use shroud_server::store::keys;

fn make_state() -> Arc<SharedState> {
    SharedState::new(ServerConfig::default())
}

async fn register(state: &Arc<SharedState>, user: &str) {
    state.handler.register_user(user).await.unwrap();
}

/// Bind a user to a fake transport; returns the outbound frame queue.
async fn connect(state: &Arc<SharedState>, user: &str) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    state.connections.connect(user, tx).await;
    rx
}

/// Pull the next `encrypted_message` frame off a transport queue.
fn next_encrypted(rx: &mut mpsc::UnboundedReceiver<Frame>) -> EncryptedMessageData {
    loop {
        let frame = rx.try_recv().expect("expected a queued frame");
        if frame.kind == kind::ENCRYPTED_MESSAGE {
            return frame.data_as().unwrap();
        }
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// What a client does with a delivered envelope: echo its fields back as
/// a decrypt request.
async fn client_decrypt(
    state: &Arc<SharedState>,
    receiver: &str,
    data: &EncryptedMessageData,
) -> Result<String, HandlerError> {
    state
        .handler
        .decrypt_request(
            receiver,
            &data.envelope.sender_id,
            &data.envelope.ciphertext,
            data.envelope.ephemeral_public_key,
            data.envelope.message_number,
            data.envelope.previous_chain_length,
            data.is_first_message,
        )
        .await
}

// ═══════════════════════════════════════════════════════════════════
// 1. Session establishment and ping-pong
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ping_pong_establishes_bidirectional_sessions() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;
    let mut alice_rx = connect(&state, "alice").await;
    let mut bob_rx = connect(&state, "bob").await;

    // First contact: alice -> bob
    let (envelope, delivered) = state
        .handler
        .send_text("alice", "bob", "hi", None)
        .await
        .unwrap();
    assert!(delivered);
    assert_eq!(envelope.message_number, 0);

    let first = next_encrypted(&mut bob_rx);
    assert!(first.is_first_message);
    assert_eq!(client_decrypt(&state, "bob", &first).await.unwrap(), "hi");

    // Reply: bob -> alice, over the session materialized on receipt
    state
        .handler
        .send_text("bob", "alice", "hello", None)
        .await
        .unwrap();
    let reply = next_encrypted(&mut alice_rx);
    assert!(!reply.is_first_message);
    assert_eq!(
        client_decrypt(&state, "alice", &reply).await.unwrap(),
        "hello"
    );

    // Both ratchets are live in both directions
    let alice_session = state
        .registry
        .get("alice")
        .unwrap()
        .session_with("bob")
        .unwrap();
    let bob_session = state
        .registry
        .get("bob")
        .unwrap()
        .session_with("alice")
        .unwrap();
    {
        let alice_ratchet = alice_session.lock();
        let bob_ratchet = bob_session.lock();
        assert_eq!(alice_ratchet.recv_count(), 1);
        assert_eq!(bob_ratchet.recv_count(), 1);
        assert_eq!(bob_ratchet.send_count(), 1);
        assert!(alice_ratchet.remote_public().is_some());
        assert!(bob_ratchet.remote_public().is_some());
    }

    // The X3DH ephemeral was published for the responder path
    assert!(
        state
            .store
            .get(&keys::x3dh_ephemeral("alice", "bob"))
            .await
            .is_some()
    );
}

// ═══════════════════════════════════════════════════════════════════
// 2. Ordering
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn out_of_order_within_a_chain() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;
    let mut bob_rx = connect(&state, "bob").await;

    for text in ["m0", "m1", "m2"] {
        state.handler.send_text("alice", "bob", text, None).await.unwrap();
    }
    let m0 = next_encrypted(&mut bob_rx);
    let m1 = next_encrypted(&mut bob_rx);
    let m2 = next_encrypted(&mut bob_rx);

    // Delivered in order m2, m0, m1; all three must decrypt
    assert_eq!(client_decrypt(&state, "bob", &m2).await.unwrap(), "m2");
    assert_eq!(client_decrypt(&state, "bob", &m0).await.unwrap(), "m0");
    assert_eq!(client_decrypt(&state, "bob", &m1).await.unwrap(), "m1");
}

#[tokio::test]
async fn dh_ratchet_turnover() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;
    let mut alice_rx = connect(&state, "alice").await;
    let mut bob_rx = connect(&state, "bob").await;

    // Alice's first burst: three messages on one chain
    let mut burst1_key = None;
    for text in ["a0", "a1", "a2"] {
        state.handler.send_text("alice", "bob", text, None).await.unwrap();
        let data = next_encrypted(&mut bob_rx);
        burst1_key = data.envelope.ephemeral_public_key;
        client_decrypt(&state, "bob", &data).await.unwrap();
    }

    // Bob replies once
    state.handler.send_text("bob", "alice", "b0", None).await.unwrap();
    let reply = next_encrypted(&mut alice_rx);
    client_decrypt(&state, "alice", &reply).await.unwrap();

    // Alice's second burst rides a fresh ratchet key and reports the
    // previous chain's length
    state.handler.send_text("alice", "bob", "a3", None).await.unwrap();
    let data = next_encrypted(&mut bob_rx);
    assert_ne!(data.envelope.ephemeral_public_key, burst1_key);
    assert_eq!(data.envelope.previous_chain_length, 3);
    assert_eq!(data.envelope.message_number, 0);
    assert_eq!(client_decrypt(&state, "bob", &data).await.unwrap(), "a3");

    state.handler.send_text("alice", "bob", "a4", None).await.unwrap();
    let data = next_encrypted(&mut bob_rx);
    assert_eq!(data.envelope.message_number, 1);
    assert_eq!(client_decrypt(&state, "bob", &data).await.unwrap(), "a4");
}

// ═══════════════════════════════════════════════════════════════════
// 3. Offline queue
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn offline_messages_replay_in_order() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;

    // Bob is not connected; both sends queue (the first one carries the
    // session-bootstrap flag)
    let (_, delivered) = state
        .handler
        .send_text("alice", "bob", "queued1", None)
        .await
        .unwrap();
    assert!(!delivered);
    state.handler.send_text("alice", "bob", "queued2", None).await.unwrap();

    assert_eq!(
        state.store.zrange_all(&keys::offline_messages("bob")).await.len(),
        2
    );

    // Bob reconnects and the queue drains in order
    let mut bob_rx = connect(&state, "bob").await;
    let replayed = state.handler.deliver_offline_messages("bob").await;
    assert_eq!(replayed, 2);

    let first = next_encrypted(&mut bob_rx);
    assert!(first.is_first_message);
    assert_eq!(client_decrypt(&state, "bob", &first).await.unwrap(), "queued1");
    let second = next_encrypted(&mut bob_rx);
    assert!(!second.is_first_message);
    assert_eq!(client_decrypt(&state, "bob", &second).await.unwrap(), "queued2");

    // Queue is gone
    assert!(
        state
            .store
            .zrange_all(&keys::offline_messages("bob"))
            .await
            .is_empty()
    );
}

// ═══════════════════════════════════════════════════════════════════
// 4. Self-destruct
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn self_destruct_notifies_both_endpoints() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;
    let mut alice_rx = connect(&state, "alice").await;
    let mut bob_rx = connect(&state, "bob").await;

    let (envelope, delivered) = state
        .handler
        .send_text("alice", "bob", "x", Some(0))
        .await
        .unwrap();
    assert!(delivered);

    // Delivered first, destroyed on the next sweep
    let data = next_encrypted(&mut bob_rx);
    assert_eq!(client_decrypt(&state, "bob", &data).await.unwrap(), "x");

    let expired = state.handler.sweep_self_destruct().await.unwrap();
    assert_eq!(expired, 1);

    for rx in [&mut alice_rx, &mut bob_rx] {
        let destroyed = drain(rx)
            .into_iter()
            .find(|frame| frame.kind == kind::MESSAGE_DESTROYED)
            .expect("message_destroyed frame");
        assert_eq!(destroyed.data["message_id"], envelope.id.as_str());
    }

    // Metadata is gone, and the sweep is idempotent
    assert!(state.store.get(&keys::message_meta(&envelope.id)).await.is_none());
    assert_eq!(state.handler.sweep_self_destruct().await.unwrap(), 0);
}

// ═══════════════════════════════════════════════════════════════════
// 5. Tampering and error taxonomy
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tampered_ciphertext_fails_then_session_recovers() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;
    let mut bob_rx = connect(&state, "bob").await;

    state.handler.send_text("alice", "bob", "first", None).await.unwrap();
    state.handler.send_text("alice", "bob", "second", None).await.unwrap();
    let mut m0 = next_encrypted(&mut bob_rx);
    let m1 = next_encrypted(&mut bob_rx);

    // Flip one ciphertext byte in flight
    let last = m0.envelope.ciphertext.len() - 1;
    m0.envelope.ciphertext[last] ^= 0x01;

    let error = client_decrypt(&state, "bob", &m0).await.unwrap_err();
    assert!(error.is_decrypt_error(), "unexpected error: {error}");

    // The failed decrypt did not advance the ratchet: the next
    // (unmodified) message still decrypts
    assert_eq!(client_decrypt(&state, "bob", &m1).await.unwrap(), "second");
}

#[tokio::test]
async fn decrypt_without_session_is_rejected() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;

    let error = state
        .handler
        .decrypt_request("bob", "alice", &[0u8; 32], Some([1u8; 32]), 0, 0, false)
        .await
        .unwrap_err();
    assert!(matches!(error, HandlerError::SessionNotEstablished(_)));

    // And no session was created by the failed attempt
    assert!(!state.registry.get("bob").unwrap().has_session_with("alice"));
}

#[tokio::test]
async fn missing_prekey_bundle_is_a_handshake_failure() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;

    state.store.delete(&keys::prekey_bundle("bob")).await;

    let error = state
        .handler
        .send_text("alice", "bob", "hi", None)
        .await
        .unwrap_err();
    assert!(matches!(error, HandlerError::Handshake(_)));
}

#[tokio::test]
async fn unknown_users_are_rejected() {
    let state = make_state();
    register(&state, "alice").await;

    assert!(matches!(
        state.handler.send_text("alice", "ghost", "hi", None).await,
        Err(HandlerError::UnknownUser(_))
    ));
    assert!(matches!(
        state.handler.send_text("ghost", "alice", "hi", None).await,
        Err(HandlerError::UnknownUser(_))
    ));
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let state = make_state();
    register(&state, "alice").await;
    assert!(matches!(
        state.handler.register_user("alice").await,
        Err(HandlerError::UserExists(_))
    ));
}

#[tokio::test]
async fn concurrent_first_sends_in_both_directions() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;

    // No prior session in either direction; both first sends race
    let (a_to_b, b_to_a) = tokio::join!(
        state.handler.send_text("alice", "bob", "from alice", None),
        state.handler.send_text("bob", "alice", "from bob", None),
    );
    a_to_b.unwrap();
    b_to_a.unwrap();

    // Two independent sessions exist, each with its own sending chain
    let alice = state.registry.get("alice").unwrap();
    let bob = state.registry.get("bob").unwrap();
    let alice_out = alice.session_with("bob").unwrap();
    let bob_out = bob.session_with("alice").unwrap();
    assert!(alice_out.lock().has_sending_chain());
    assert!(bob_out.lock().has_sending_chain());
    assert!(!Arc::ptr_eq(&alice_out, &bob_out));
}

// ═══════════════════════════════════════════════════════════════════
// 6. Rehydration
// ═══════════════════════════════════════════════════════════════════

#[tokio::test]
async fn registry_rehydrates_from_directory() {
    let state = make_state();
    register(&state, "alice").await;
    register(&state, "bob").await;

    let warm = Registry::new();
    assert_eq!(warm.rehydrate(&state.store).await, 2);

    let original = state.registry.get("alice").unwrap();
    let restored = warm.get("alice").unwrap();
    assert_eq!(restored.identity.public(), original.identity.public());
    assert_eq!(restored.device_id, original.device_id);
    assert_eq!(restored.registration_id, original.registration_id);
    assert_eq!(
        restored.signed_prekey.public(),
        original.signed_prekey.public()
    );

    // Rehydrating twice is a no-op
    assert_eq!(warm.rehydrate(&state.store).await, 0);
}
