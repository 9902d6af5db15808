//! WebSocket transport and the registration REST surface.
//!
//! The WebSocket endpoint (`/ws`) speaks `{type, data, timestamp}` JSON
//! frames. The first frame on a new connection must be `auth`; anything
//! else gets an `error` frame and a close. After auth the handler task
//! owns the socket and selects between inbound client frames and the
//! user's outbound frame queue.
//!
//! The REST endpoints cover registration and directory lookups; everything
//! that touches ciphertext goes over the WebSocket.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::connection::presence_frame;
use crate::frames::{
    self, AuthData, DecryptMessageData, DecryptedMessageData, DecryptionErrorData, Frame,
    GetPrekeysData, MessageSentData, MessageStatusRequest, SendMessageData, TypingRequest, kind,
};
use crate::server::SharedState;
use crate::store::keys;

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/register", post(api_register))
        .route("/api/users", get(api_users))
        .route("/api/users/{user_id}", get(api_user))
        .route("/health", get(api_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── WebSocket ──────────────────────────────────────────────────────

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<SharedState>) {
    // First frame must be auth
    let Some(user_id) = authenticate(&mut socket).await else {
        let _ = socket
            .send(frame_text(&Frame::error("Authentication required")))
            .await;
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let connection_id = state.connections.connect(&user_id, tx).await;

    // Greeting sequence: ack, who's online, then any queued messages
    state
        .connections
        .send_to_user(
            &user_id,
            Frame::new(kind::AUTH_SUCCESS, AuthData {
                user_id: user_id.clone(),
            }),
        )
        .await;
    broadcast_presence(&state, &user_id, "online").await;
    send_online_list(&state, &user_id).await;
    state.handler.deliver_offline_messages(&user_id).await;

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    dispatch_client_frame(&state, &user_id, text.as_str()).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {} // Ping/Pong handled by axum
                Some(Err(_)) => break,
            },
            outbound = rx.recv() => match outbound {
                Some(frame) => {
                    if socket.send(frame_text(&frame)).await.is_err() {
                        break;
                    }
                }
                // Binding replaced by a reconnect; this task is stale
                None => break,
            }
        }
    }

    let removed = state.connections.disconnect(&user_id, &connection_id).await;
    if removed {
        broadcast_presence(&state, &user_id, "offline").await;
        state
            .store
            .hset(
                &keys::user_info(&user_id),
                "last_seen",
                frames::unix_now().to_string(),
            )
            .await;
    }
}

/// Read the auth frame. Returns the user id, or None on anything else.
async fn authenticate(socket: &mut WebSocket) -> Option<String> {
    let text = match socket.recv().await {
        Some(Ok(WsMessage::Text(text))) => text,
        _ => return None,
    };
    let frame: Frame = serde_json::from_str(text.as_str()).ok()?;
    if frame.kind != kind::AUTH {
        return None;
    }
    let auth: AuthData = frame.data_as().ok()?;
    tracing::info!(user = %auth.user_id, "authenticating websocket");
    Some(auth.user_id)
}

/// Route one client frame. Failures go back as control frames; nothing
/// here closes the transport.
async fn dispatch_client_frame(state: &Arc<SharedState>, user_id: &str, text: &str) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            tracing::warn!(user = %user_id, "malformed frame");
            state
                .connections
                .send_to_user(user_id, Frame::error("Malformed frame"))
                .await;
            return;
        }
    };

    match frame.kind.as_str() {
        kind::SEND_MESSAGE => {
            let data: SendMessageData = match frame.data_as() {
                Ok(data) => data,
                Err(_) => {
                    reply_error(state, user_id, "Malformed send_message payload").await;
                    return;
                }
            };
            match state
                .handler
                .send_text(
                    user_id,
                    &data.recipient_id,
                    &data.content,
                    data.self_destruct_seconds,
                )
                .await
            {
                Ok((envelope, _delivered)) => {
                    state
                        .connections
                        .send_to_user(
                            user_id,
                            Frame::new(kind::MESSAGE_SENT, MessageSentData {
                                message_id: envelope.id,
                                timestamp: envelope.timestamp,
                            }),
                        )
                        .await;
                }
                Err(error) => {
                    tracing::warn!(user = %user_id, %error, "send_message failed");
                    reply_error(state, user_id, &format!("Failed to send message: {error}")).await;
                }
            }
        }

        kind::DECRYPT_MESSAGE => {
            let data: DecryptMessageData = match frame.data_as() {
                Ok(data) => data,
                Err(_) => {
                    reply_error(state, user_id, "Malformed decrypt_message payload").await;
                    return;
                }
            };
            match state
                .handler
                .decrypt_request(
                    user_id,
                    &data.sender_id,
                    &data.encrypted_content,
                    data.ephemeral_public_key,
                    data.message_number,
                    data.previous_chain_length,
                    data.is_first_message,
                )
                .await
            {
                Ok(content) => {
                    state
                        .connections
                        .send_to_user(
                            user_id,
                            Frame::new(kind::DECRYPTED_MESSAGE, DecryptedMessageData {
                                message_id: data.message_id,
                                sender_id: data.sender_id,
                                content,
                                timestamp: data.timestamp,
                            }),
                        )
                        .await;
                }
                Err(error) if error.is_decrypt_error() => {
                    tracing::warn!(user = %user_id, sender = %data.sender_id, %error, "decrypt failed");
                    state
                        .connections
                        .send_to_user(
                            user_id,
                            Frame::new(kind::DECRYPTION_ERROR, DecryptionErrorData {
                                message_id: data.message_id,
                                message: error.to_string(),
                            }),
                        )
                        .await;
                }
                Err(error) => {
                    tracing::warn!(user = %user_id, %error, "decrypt_message rejected");
                    reply_error(state, user_id, &error.to_string()).await;
                }
            }
        }

        kind::TYPING => {
            if let Ok(data) = frame.data_as::<TypingRequest>() {
                state
                    .handler
                    .handle_typing(user_id, &data.recipient_id, data.is_typing)
                    .await;
            }
        }

        kind::GET_PREKEYS => {
            let Ok(data) = frame.data_as::<GetPrekeysData>() else {
                reply_error(state, user_id, "Malformed get_prekeys payload").await;
                return;
            };
            match public_bundle(state, &data.user_id) {
                Some(bundle) => {
                    state
                        .connections
                        .send_to_user(user_id, Frame::new(kind::PREKEY_BUNDLE, bundle))
                        .await;
                }
                None => {
                    reply_error(state, user_id, &format!("No prekey bundle for {}", data.user_id))
                        .await;
                }
            }
        }

        "delivered" | "read" => {
            if let Ok(data) = frame.data_as::<MessageStatusRequest>() {
                state
                    .handler
                    .handle_message_status(&data.message_id, &frame.kind, user_id)
                    .await;
            }
        }

        other => {
            tracing::debug!(user = %user_id, kind = %other, "ignoring unknown frame kind");
        }
    }
}

async fn reply_error(state: &Arc<SharedState>, user_id: &str, message: &str) {
    state
        .connections
        .send_to_user(user_id, Frame::error(message))
        .await;
}

fn frame_text(frame: &Frame) -> WsMessage {
    let json = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    WsMessage::Text(json.into())
}

/// Tell everyone else that `user_id` changed status.
async fn broadcast_presence(state: &Arc<SharedState>, user_id: &str, status: &str) {
    for other in state.connections.connected_users() {
        if other != user_id {
            state
                .connections
                .send_to_user(&other, presence_frame(user_id, status))
                .await;
        }
    }
}

/// Tell a fresh arrival who is already online.
async fn send_online_list(state: &Arc<SharedState>, user_id: &str) {
    for other in state.connections.connected_users() {
        if other != user_id {
            state
                .connections
                .send_to_user(user_id, presence_frame(&other, "online"))
                .await;
        }
    }
}

// ── Public bundle projection ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct PublicSignedPreKey {
    public: String,
    signature: String,
}

/// What `get_prekeys` answers with: the published bundle minus every
/// private half.
#[derive(Debug, Serialize)]
struct PublicBundleData {
    user_id: String,
    identity_key: String,
    signed_prekey: PublicSignedPreKey,
    one_time_prekeys: Vec<String>,
    device_id: String,
    registration_id: u32,
}

fn public_bundle(state: &Arc<SharedState>, user_id: &str) -> Option<PublicBundleData> {
    let record = state.registry.get(user_id)?;
    Some(PublicBundleData {
        user_id: user_id.to_string(),
        identity_key: record.bundle.identity_key.clone(),
        signed_prekey: PublicSignedPreKey {
            public: record.bundle.signed_prekey.public.clone(),
            signature: record.bundle.signed_prekey.signature.clone(),
        },
        one_time_prekeys: record
            .bundle
            .one_time_prekeys
            .iter()
            .map(|otpk| otpk.public.clone())
            .collect(),
        device_id: record.device_id.clone(),
        registration_id: record.registration_id,
    })
}

// ── REST ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    display_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct UserResponse {
    user_id: String,
    device_id: String,
    registration_id: u32,
    display_name: String,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct UserInfo {
    user_id: String,
    display_name: String,
    is_online: bool,
    last_seen: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    registered_users: usize,
    online_users: usize,
}

async fn api_register(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<UserResponse>, (StatusCode, String)> {
    let username = request.username;

    // Re-registering returns the existing record
    if let Some(record) = state.registry.get(&username) {
        let info = state.store.hgetall(&keys::user_info(&username)).await;
        return Ok(Json(UserResponse {
            user_id: username.clone(),
            device_id: record.device_id.clone(),
            registration_id: record.registration_id,
            display_name: info
                .get("display_name")
                .cloned()
                .unwrap_or_else(|| username.clone()),
            created_at: info
                .get("created_at")
                .cloned()
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        }));
    }

    let registered = state
        .handler
        .register_user(&username)
        .await
        .map_err(|error| (StatusCode::BAD_REQUEST, error.to_string()))?;

    let display_name = request.display_name.unwrap_or_else(|| username.clone());
    let created_at = chrono::Utc::now().to_rfc3339();
    let info_key = keys::user_info(&username);
    state.store.hset(&info_key, "display_name", display_name.clone()).await;
    state.store.hset(&info_key, "created_at", created_at.clone()).await;

    Ok(Json(UserResponse {
        user_id: registered.user_id,
        device_id: registered.device_id,
        registration_id: registered.registration_id,
        display_name,
        created_at,
    }))
}

async fn api_users(State(state): State<Arc<SharedState>>) -> Json<Vec<UserInfo>> {
    let mut users = Vec::new();
    for user_id in state.registry.user_ids() {
        users.push(user_info(&state, &user_id).await);
    }
    Json(users)
}

async fn api_user(
    State(state): State<Arc<SharedState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserInfo>, StatusCode> {
    if !state.registry.contains(&user_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(user_info(&state, &user_id).await))
}

async fn user_info(state: &Arc<SharedState>, user_id: &str) -> UserInfo {
    let info = state.store.hgetall(&keys::user_info(user_id)).await;
    UserInfo {
        user_id: user_id.to_string(),
        display_name: info
            .get("display_name")
            .cloned()
            .unwrap_or_else(|| user_id.to_string()),
        is_online: state.connections.is_user_online(user_id).await,
        last_seen: info.get("last_seen").cloned(),
    }
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        registered_users: state.registry.len(),
        online_users: state.connections.connected_users().len(),
    })
}
