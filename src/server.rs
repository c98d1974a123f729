//! WebSocket fanout and REST endpoints for the submission queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::events::{EventBus, PipelineEvent, SubscriptionId};
use crate::submissions::model::SubmissionIntake;
use crate::submissions::repository::SubmissionRepository;

/// Events buffered per WebSocket client before it is considered lagging.
const CLIENT_BUFFER: usize = 256;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<SubmissionRepository>,
}

/// Build the Axum router: WebSocket feed, REST API, and stored uploads.
pub fn router(repo: Arc<SubmissionRepository>, uploads_dir: impl Into<PathBuf>) -> Router {
    let state = AppState { repo };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/submissions", get(list_submissions).post(create_submission))
        .nest_service("/uploads", ServeDir::new(uploads_dir.into()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let processing = state.repo.processing_id().await;
    let counts = state.repo.stats().await;

    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "processing": processing,
        "counts": counts,
    }))
}

// ── REST ────────────────────────────────────────────────────────────────

async fn list_submissions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.repo.list().await)
}

/// Admit a submission directly, bypassing the mailbox.
async fn create_submission(
    State(state): State<AppState>,
    Json(mut intake): Json<SubmissionIntake>,
) -> impl IntoResponse {
    intake.sender_address = intake.sender_address.trim().to_string();
    if intake.sender_address.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "senderAddress is required" })),
        )
            .into_response();
    }

    let submission = state.repo.add(intake).await;
    info!(submission_id = %submission.id, "Submission created via API");
    (StatusCode::CREATED, Json(submission)).into_response()
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.repo))
}

/// One client's view of the event bus: a bounded queue plus a lag flag.
///
/// Dropping the feed unsubscribes it, discarding anything still queued.
struct ClientFeed {
    rx: mpsc::Receiver<PipelineEvent>,
    lagged: Arc<AtomicBool>,
    subscription: SubscriptionId,
    bus: Arc<EventBus>,
}

impl ClientFeed {
    /// Subscribe and return the snapshot the client must see first.
    async fn open(repo: &SubmissionRepository) -> (Self, PipelineEvent) {
        // The bus delivers synchronously; this client's handler only enqueues.
        let (tx, rx) = mpsc::channel::<PipelineEvent>(CLIENT_BUFFER);
        let lagged = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lagged);

        let (initial, subscription) = repo
            .snapshot_and_subscribe(move |event| {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                    flag.store(true, Ordering::Relaxed);
                }
            })
            .await;

        let feed = Self {
            rx,
            lagged,
            subscription,
            bus: Arc::clone(repo.bus()),
        };
        (feed, initial)
    }

    fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Relaxed)
    }
}

impl Drop for ClientFeed {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
    }
}

async fn handle_socket(mut socket: WebSocket, repo: Arc<SubmissionRepository>) {
    info!("WebSocket client connected");

    let (mut feed, initial) = ClientFeed::open(&repo).await;
    if !send_event(&mut socket, &initial).await {
        warn!("Failed to send initial data, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            event = feed.rx.recv() => {
                let Some(event) = event else { break };

                // Events were dropped, so the queue is no longer a faithful
                // delta. Replace it with a fresh snapshot and subscription.
                if feed.is_lagged() {
                    warn!("WS client lagged behind event feed, resyncing");
                    let (fresh, snapshot) = ClientFeed::open(&repo).await;
                    feed = fresh;
                    if !send_event(&mut socket, &snapshot).await {
                        break;
                    }
                    continue;
                }

                if !send_event(&mut socket, &event).await {
                    debug!("Client disconnected during send");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(text = %text.as_str(), "Ignoring WS message from client");
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Serialize and send one event. Returns `false` once the client is gone.
async fn send_event(socket: &mut WebSocket, event: &PipelineEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(event = %event.kind(), error = %e, "Failed to serialize event");
            true
        }
    }
}
