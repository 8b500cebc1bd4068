//! HTTP and WebSocket surface.
//!
//! - `GET /health`
//! - `GET /api/rooms`, `GET /api/rooms/:room_id`, `GET /api/rooms/:room_id/snapshot`
//!   run the room's access policy on the `Authorization: Bearer` token, the
//!   same way a join does
//! - `GET /ws/:room_id` upgrades to the sync protocol. Binary frames carry
//!   framed bincode messages; a client that speaks JSON text frames gets JSON
//!   text frames back.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::AccessError;
use crate::storage::{RoomMetadata, StorageStats};
use crate::sync::codec;
use crate::sync::protocol::{
    ClientMessage, ErrorCode, PeerInfo, ServerMessage, SyncProtocol, PROTOCOL_VERSION,
};
use crate::sync::room::RoomState;
use crate::sync::server::validate_room_id;
use crate::sync::{Document, SyncError, SyncServer};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Room and peer registries
    pub sync_server: Arc<SyncServer>,
    /// Server start time
    started_at: Instant,
}

impl AppState {
    pub fn new(sync_server: Arc<SyncServer>) -> Self {
        Self {
            sync_server,
            started_at: Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_rooms: usize,
    active_peers: usize,
    /// `None` when the backend could not report
    storage: Option<StorageStats>,
}

#[derive(Debug, Serialize)]
struct RoomSummary {
    room_id: String,
    /// `None` when the room is only in storage
    state: Option<RoomState>,
    peer_count: usize,
    updated_at: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RoomListResponse {
    rooms: Vec<RoomSummary>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct RoomDetailResponse {
    room_id: String,
    state: Option<RoomState>,
    peers: Vec<PeerInfo>,
    /// Visible characters
    len: usize,
    log_len: usize,
    pending_ops: usize,
    metadata: Option<RoomMetadata>,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    room_id: String,
    /// Codec-encoded snapshot, base64
    snapshot: String,
    text: String,
    len: usize,
}

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    error!("Request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn checked_room_id(room_id: &str) -> Result<(), ApiError> {
    validate_room_id(room_id).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

/// Token from an `Authorization: Bearer` header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn access_denied(e: SyncError) -> ApiError {
    let status = match &e {
        SyncError::Unauthorized(AccessError::RoomNotAllowed(_)) => StatusCode::FORBIDDEN,
        SyncError::Unauthorized(AccessError::InvalidConfig(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        SyncError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        SyncError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Apply the access policy for `room_id` to the request's credentials
fn authorize(state: &AppState, headers: &HeaderMap, room_id: &str) -> Result<(), ApiError> {
    state
        .sync_server
        .authorize(room_id, bearer_token(headers))
        .map(|_| ())
        .map_err(access_denied)
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync_server.stats();
    let storage = match state.sync_server.store().stats().await {
        Ok(storage) => Some(storage),
        Err(e) => {
            warn!("Storage stats unavailable: {}", e);
            None
        }
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_rooms: stats.active_rooms,
        active_peers: stats.active_peers,
        storage,
    })
}

/// List live and stored rooms the caller may open
async fn list_rooms(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<RoomListResponse>, ApiError> {
    let live = state.sync_server.room_views().await;
    let stored = state
        .sync_server
        .store()
        .list_rooms()
        .await
        .map_err(internal)?;

    let mut rooms: Vec<RoomSummary> = live
        .iter()
        .map(|view| RoomSummary {
            room_id: view.room_id.clone(),
            state: Some(view.state),
            peer_count: view.peers.len(),
            updated_at: stored
                .iter()
                .find(|m| m.room_id == view.room_id)
                .map(|m| m.updated_at),
        })
        .collect();
    rooms.extend(
        stored
            .iter()
            .filter(|m| !live.iter().any(|v| v.room_id == m.room_id))
            .map(|m| RoomSummary {
                room_id: m.room_id.clone(),
                state: None,
                peer_count: 0,
                updated_at: Some(m.updated_at),
            }),
    );
    rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));

    // Rooms outside the token's grant are hidden; a bad token fails the request
    let mut visible = Vec::with_capacity(rooms.len());
    for room in rooms {
        match authorize(&state, &headers, &room.room_id) {
            Ok(()) => visible.push(room),
            Err((StatusCode::FORBIDDEN, _)) => {}
            Err(e) => return Err(e),
        }
    }
    let rooms = visible;

    let total = rooms.len();
    Ok(Json(RoomListResponse { rooms, total }))
}

/// Get room details
async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomDetailResponse>, ApiError> {
    checked_room_id(&room_id)?;
    authorize(&state, &headers, &room_id)?;
    let metadata = state
        .sync_server
        .store()
        .room_metadata(&room_id)
        .await
        .map_err(internal)?;

    match state.sync_server.room_view(&room_id).await {
        Ok(view) => Ok(Json(RoomDetailResponse {
            room_id,
            state: Some(view.state),
            peers: view.peers,
            len: view.len,
            log_len: view.log_len,
            pending_ops: view.pending_ops,
            metadata,
        })),
        Err(_) => {
            let metadata =
                metadata.ok_or((StatusCode::NOT_FOUND, format!("Room not found: {}", room_id)))?;
            let doc = load_stored(&state, &room_id).await?.unwrap_or_else(|| Document::new(0));
            Ok(Json(RoomDetailResponse {
                room_id,
                state: None,
                peers: Vec::new(),
                len: doc.len(),
                log_len: metadata.pending_updates as usize,
                pending_ops: doc.pending_len(),
                metadata: Some(metadata),
            }))
        }
    }
}

/// Current document state of a room
async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SnapshotResponse>, ApiError> {
    checked_room_id(&room_id)?;
    authorize(&state, &headers, &room_id)?;

    let (snapshot, text, len) = match state.sync_server.room_view(&room_id).await {
        Ok(view) => (view.snapshot, view.text, view.len),
        Err(_) => {
            let doc = load_stored(&state, &room_id)
                .await?
                .ok_or((StatusCode::NOT_FOUND, format!("Room not found: {}", room_id)))?;
            let snapshot = codec::encode_snapshot(&doc.snapshot()).map_err(internal)?;
            (snapshot.to_vec(), doc.visible_text(), doc.len())
        }
    };

    Ok(Json(SnapshotResponse {
        room_id,
        snapshot: BASE64.encode(snapshot),
        text,
        len,
    }))
}

/// Rebuild a room that is not live from its snapshot and update tail
async fn load_stored(state: &AppState, room_id: &str) -> Result<Option<Document>, ApiError> {
    let store = state.sync_server.store();
    let snapshot = store.load_latest_snapshot(room_id).await.map_err(internal)?;
    let tail = store.load_updates(room_id).await.map_err(internal)?;
    if snapshot.is_none() && tail.is_empty() {
        return Ok(None);
    }

    let mut doc = Document::new(0);
    if let Some(bytes) = snapshot {
        let snapshot = codec::decode_snapshot(&bytes).map_err(internal)?;
        doc.load_snapshot(&snapshot).map_err(internal)?;
    }
    for bytes in tail {
        match codec::decode_update(&bytes) {
            Ok(update) => {
                doc.merge_remote(&update).map_err(internal)?;
            }
            Err(e) => warn!("Skipping stored update for room {}: {}", room_id, e),
        }
    }
    Ok(Some(doc))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    checked_room_id(&room_id)?;
    info!("WebSocket upgrade request for room: {}", room_id);
    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, room_id, state)))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, room_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Generate peer identifiers
    let peer_id = uuid::Uuid::new_v4().to_string();
    let session_token = generate_session_token();

    info!("New WebSocket connection: peer={}, room={}", peer_id, room_id);

    // Create channel for sending messages to this peer
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Register peer with sync server
    if let Err(e) = state.sync_server.register_peer(
        &peer_id,
        "Anonymous", // Will be updated on Hello
        &session_token,
        tx.clone(),
    ) {
        error!("Failed to register peer: {}", e);
        return;
    }

    // Send welcome message
    let welcome = ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        peer_id: peer_id.clone(),
        session_token: session_token.clone(),
        server_time: chrono::Utc::now().timestamp(),
    };

    if let Err(e) = send_server_message(&mut ws_sender, &welcome).await {
        error!("Failed to send welcome: {}", e);
        state.sync_server.unregister_peer(&peer_id);
        return;
    }

    // Set once the client sends a text frame; replies follow its lead
    let json_mode = Arc::new(AtomicBool::new(false));

    // Clone values for tasks
    let peer_id_recv = peer_id.clone();
    let peer_id_send = peer_id.clone();
    let state_recv = state.clone();
    let json_send = json_mode.clone();

    // Task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = if json_send.load(Ordering::Relaxed) {
                serde_json::to_string(&msg)
                    .map(Message::Text)
                    .map_err(|e| e.to_string())
            } else {
                SyncProtocol::encode_server(&msg)
                    .map(|bytes| Message::Binary(bytes.to_vec()))
                    .map_err(|e| e.to_string())
            };
            let goodbye = matches!(msg, ServerMessage::Goodbye { .. });
            match frame {
                Ok(frame) => {
                    if ws_sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message for peer {}: {}", peer_id_send, e);
                    let notice = SyncProtocol::error_response(
                        ErrorCode::ServerError,
                        format!("message could not be delivered: {}", e),
                        None,
                    );
                    if send_server_message(&mut ws_sender, &notice).await.is_err() {
                        break;
                    }
                }
            }
            if goodbye {
                let _ = ws_sender.close().await;
                break;
            }
        }
        debug!("Send task ended for peer {}", peer_id_send);
    });

    // Task to handle incoming WebSocket messages
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let client_msg = match msg {
                Message::Binary(data) => match SyncProtocol::decode_client(&data) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("Failed to decode binary message: {}", e);
                        let _ = tx.send(SyncProtocol::error_response(
                            ErrorCode::InvalidMessage,
                            e.to_string(),
                            None,
                        ));
                        continue;
                    }
                },
                Message::Text(text) => {
                    json_mode.store(true, Ordering::Relaxed);
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => client_msg,
                        Err(e) => {
                            warn!("Failed to decode JSON message: {}", e);
                            let _ = tx.send(SyncProtocol::error_response(
                                ErrorCode::InvalidMessage,
                                e.to_string(),
                                None,
                            ));
                            continue;
                        }
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // Pong is handled automatically
                    state_recv.sync_server.touch_peer(&peer_id_recv);
                    continue;
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", peer_id_recv);
                    break;
                }
            };

            state_recv.sync_server.touch_peer(&peer_id_recv);
            if !handle_client_message(client_msg, &peer_id_recv, &state_recv, &tx).await {
                break;
            }
        }
        debug!("Receive task ended for peer {}", peer_id_recv);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Cleanup
    state.sync_server.unregister_peer(&peer_id);
    info!("Peer {} disconnected (connected via room {})", peer_id, room_id);
}

fn send_error(tx: &mpsc::UnboundedSender<ServerMessage>, e: &SyncError, room_id: Option<String>) {
    let _ = tx.send(SyncProtocol::error_response(e.code(), e.to_string(), room_id));
}

/// Handle a decoded client message; returns false when the connection should close
async fn handle_client_message(
    msg: ClientMessage,
    peer_id: &str,
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> bool {
    let server = &state.sync_server;

    match msg {
        ClientMessage::Hello {
            protocol_version,
            client_name,
            session_token,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                let _ = tx.send(SyncProtocol::error_response(
                    ErrorCode::VersionMismatch,
                    format!(
                        "Server speaks protocol {}, client sent {}",
                        PROTOCOL_VERSION, protocol_version
                    ),
                    None,
                ));
                return false;
            }

            if let Err(e) = server.set_peer_name(peer_id, &client_name) {
                warn!("Hello from unknown peer {}: {}", peer_id, e);
            }

            // A reconnecting client supersedes its previous connection
            if let Some(token) = session_token {
                if let Some(previous) = server.restore_session(&token) {
                    if previous != peer_id {
                        info!("Session restored for peer {} -> {}", previous, peer_id);
                        server.unregister_peer(&previous);
                    }
                }
            }

            debug!("Hello from peer {}: {}", peer_id, client_name);
        }

        ClientMessage::Join {
            room_id,
            credentials,
        } => {
            if let Err(e) = server
                .join_room(peer_id, &room_id, credentials.as_deref())
                .await
            {
                send_error(tx, &e, Some(room_id));
            }
        }

        ClientMessage::Leave { room_id } => match server.leave_room(peer_id, &room_id).await {
            Ok(()) => {
                let _ = tx.send(ServerMessage::Left { room_id });
            }
            Err(e) => send_error(tx, &e, Some(room_id)),
        },

        ClientMessage::Update { room_id, update } => {
            if let Err(e) = server.handle_update(peer_id, &room_id, update) {
                send_error(tx, &e, Some(room_id));
            }
        }

        ClientMessage::Awareness { room_id, state } => {
            if let Err(e) = server.handle_awareness(peer_id, &room_id, state) {
                send_error(tx, &e, Some(room_id));
            }
        }

        ClientMessage::ResyncRequest { room_id } => {
            if let Err(e) = server.request_resync(peer_id, &room_id) {
                send_error(tx, &e, Some(room_id));
            }
        }

        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp(),
            });
        }

        ClientMessage::Goodbye { reason } => {
            info!(
                "Peer {} saying goodbye: {:?}",
                peer_id,
                reason.unwrap_or_default()
            );
            let _ = tx.send(ServerMessage::Goodbye { reason: None });
            return false;
        }
    }
    true
}

/// Send a server message over WebSocket
async fn send_server_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bytes = SyncProtocol::encode_server(msg)?;
    sender.send(Message::Binary(bytes.to_vec())).await?;
    Ok(())
}

/// Generate a secure session token
pub fn generate_session_token() -> String {
    use sha2::{Digest, Sha256};
    let random_bytes: [u8; 32] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Room inspection
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/:room_id", get(get_room))
        .route("/api/rooms/:room_id/snapshot", get(get_snapshot))
        // WebSocket endpoint
        .route("/ws/:room_id", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, JwtAccess, JwtConfig};
    use crate::storage::MemoryStore;
    use crate::sync::SyncServerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(SyncServer::in_memory())))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        get_json_as(app, uri, None).await
    }

    async fn get_json_as(
        app: Router,
        uri: &str,
        token: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test]
    fn test_session_tokens_are_unique() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_health() {
        let (status, json) = get_json(router(test_state()), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["protocol_version"], PROTOCOL_VERSION);
        assert_eq!(json["active_rooms"], 0);
        assert_eq!(json["storage"]["room_count"], 0);
    }

    #[tokio::test]
    async fn test_unknown_room_is_404() {
        let state = test_state();

        let (status, _) = get_json(router(state.clone()), "/api/rooms/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(router(state), "/api/rooms/nope/snapshot").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stored_room_snapshot() {
        let state = test_state();
        let mut doc = Document::new(4);
        let update = doc.apply_local_insert(0, "print('hi')").unwrap();
        state
            .sync_server
            .store()
            .append_update("py-1", &codec::encode_update(&update).unwrap())
            .await
            .unwrap();

        let (status, json) = get_json(router(state.clone()), "/api/rooms/py-1/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["text"], "print('hi')");
        assert_eq!(json["len"], 11);

        let bytes = BASE64.decode(json["snapshot"].as_str().unwrap()).unwrap();
        let snapshot = codec::decode_snapshot(&bytes).unwrap();
        assert_eq!(snapshot.visible_text(), "print('hi')");

        let (status, json) = get_json(router(state), "/api/rooms").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 1);
        assert_eq!(json["rooms"][0]["room_id"], "py-1");
        assert!(json["rooms"][0]["state"].is_null());
    }

    #[tokio::test]
    async fn test_live_room_detail() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        state
            .sync_server
            .register_peer("peer-1", "Alice", "token-1", tx)
            .unwrap();
        state
            .sync_server
            .join_room("peer-1", "live-1", None)
            .await
            .unwrap();

        let (status, json) = get_json(router(state), "/api/rooms/live-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "Active");
        assert_eq!(json["peers"][0]["name"], "Alice");
        assert_eq!(json["len"], 0);
    }

    #[tokio::test]
    async fn test_invalid_room_id_is_400() {
        let (status, _) = get_json(router(test_state()), "/api/rooms/bad%20id").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_inspection_requires_room_token() {
        let access = JwtAccess::new(JwtConfig::new("http-test-secret-long-enough")).unwrap();
        let ada = Identity::new("user-1", "Ada", "#4ECDC4");
        let private = access.issue_token(&ada, &["private-*"], None).unwrap();
        let other = access.issue_token(&ada, &["public-*"], None).unwrap();
        let sync_server = SyncServer::new(
            Arc::new(MemoryStore::new()),
            Arc::new(access),
            SyncServerConfig::default(),
        );
        let state = Arc::new(AppState::new(Arc::new(sync_server)));

        let store = state.sync_server.store();
        for room_id in ["private-1", "public-1"] {
            let mut doc = Document::new(4);
            let update = doc.apply_local_insert(0, "secret").unwrap();
            store
                .append_update(room_id, &codec::encode_update(&update).unwrap())
                .await
                .unwrap();
        }

        let app = router(state);
        for uri in ["/api/rooms/private-1", "/api/rooms/private-1/snapshot", "/api/rooms"] {
            let (status, json) = get_json_as(app.clone(), uri, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
            assert!(json.is_null());

            let (status, _) = get_json_as(app.clone(), uri, Some("garbage")).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
        }

        let (status, _) =
            get_json_as(app.clone(), "/api/rooms/private-1/snapshot", Some(&other)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, json) =
            get_json_as(app.clone(), "/api/rooms/private-1/snapshot", Some(&private)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["text"], "secret");

        let (status, json) = get_json_as(app, "/api/rooms", Some(&private)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 1);
        assert_eq!(json["rooms"][0]["room_id"], "private-1");
    }
}
