use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::chat::Role;
use crate::composer::{Attachment, Draft};
use crate::controller::Controller;
use crate::entity::Identity;
use crate::llm::{persona::Persona, Dispatcher};
use crate::store::ConversationStore;

pub const OWNER_HEADER: &str = "x-owner-id";
pub const OWNER_NAME_HEADER: &str = "x-owner-name";

// -----------------------------------------------------------------------------
// Request / Response Types
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RenameBody {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentBody {
    pub file_name: String,
    pub mime_type: Option<String>,
    /// Base64, optionally as a `data:` URL.
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub text: String,
    pub role: Option<String>,
    pub persona: Option<String>,
    pub attachment: Option<AttachmentBody>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    BadRequest(String),
    /// The caller's conversations could not be loaded yet.
    Unavailable(String),
    /// The controller refused or failed the operation; carries its error text.
    Rejected(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                format!("missing {} header", OWNER_HEADER),
            ),
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("chat {} not found", id)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Rejected(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// The caller, as asserted by the fronting auth layer.
pub struct Caller(pub Identity);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner_id = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        let mut identity = Identity::new(owner_id);
        if let Some(name) = parts
            .headers
            .get(OWNER_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
        {
            identity = identity.with_name(name);
        }
        Ok(Caller(identity))
    }
}

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

struct Session {
    controller: Arc<Controller>,
    last_seen: Mutex<Instant>,
}

impl Session {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

pub struct ApiState {
    store: Arc<dyn ConversationStore>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        dispatcher: Arc<Dispatcher>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            bus,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The caller's controller, signing them in on first contact. A failed
    /// load is retried on the caller's next request.
    async fn session(&self, identity: Identity) -> Arc<Controller> {
        let session = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions
                .entry(identity.owner_id.clone())
                .or_insert_with(|| {
                    Arc::new(Session {
                        controller: Arc::new(Controller::new(
                            self.store.clone(),
                            self.dispatcher.clone(),
                            self.bus.clone(),
                        )),
                        last_seen: Mutex::new(Instant::now()),
                    })
                })
                .clone()
        };
        session.touch();

        session.controller.ensure_loaded(&identity).await;
        session.controller.clone()
    }

    /// Like `session`, but refuses to answer from a list that never loaded.
    async fn loaded_session(&self, identity: Identity) -> Result<Arc<Controller>, ApiError> {
        let controller = self.session(identity).await;
        let state = controller.snapshot();
        if state.loaded {
            Ok(controller)
        } else {
            Err(ApiError::Unavailable(
                state
                    .error
                    .unwrap_or_else(|| "conversations are still loading".to_string()),
            ))
        }
    }

    fn end_session(&self, owner_id: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(owner_id);
        match removed {
            Some(session) => {
                session.controller.sign_out();
                true
            }
            None => false,
        }
    }

    /// Signs out and drops sessions unused for `idle` that have no reply in
    /// progress. Returns how many were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let evicted: Vec<(String, Arc<Session>)> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() >= idle && !s.controller.is_busy())
                .map(|(owner, _)| owner.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|owner| sessions.remove(&owner).map(|s| (owner, s)))
                .collect()
        };

        for (owner, session) in &evicted {
            debug!(owner = %owner, "evicting idle session");
            session.controller.sign_out();
        }
        evicted.len()
    }
}

/// Periodically evicts sessions idle for longer than `idle`.
pub fn spawn_session_reaper(state: Arc<ApiState>, idle: Duration) -> JoinHandle<()> {
    let period = (idle / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = state.evict_idle(idle);
            if evicted > 0 {
                info!(evicted, "idle sessions evicted");
            }
        }
    })
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/personas", get(list_personas))
        .route("/session", axum::routing::delete(end_session))
        .route("/error", axum::routing::delete(clear_error))
        .route("/chats", get(list_chats).post(create_chat))
        .route("/chats/:id", axum::routing::patch(rename_chat).delete(delete_chat))
        .route("/chats/:id/current", post(set_current_chat))
        .route("/chats/:id/messages", post(post_message))
        .route("/chats/:id/cancel", post(cancel_turn))
        .route("/events", get(events))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn health() -> &'static str {
    "ok"
}

async fn list_personas() -> impl IntoResponse {
    Json(Persona::all())
}

async fn end_session(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
) -> StatusCode {
    if state.end_session(&identity.owner_id) {
        info!(owner = %identity, "session ended");
    }
    StatusCode::NO_CONTENT
}

async fn clear_error(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
) -> StatusCode {
    state.session(identity).await.clear_error();
    StatusCode::NO_CONTENT
}

async fn list_chats(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.loaded_session(identity).await?;
    Ok(Json(controller.snapshot()))
}

async fn create_chat(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.loaded_session(identity).await?;
    match controller.create_new_chat().await {
        Some(conversation) => Ok((StatusCode::CREATED, Json(conversation))),
        None => Err(rejected(&controller)),
    }
}

async fn rename_chat(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<StatusCode, ApiError> {
    let controller = state.loaded_session(identity).await?;
    ensure_chat(&controller, &id)?;
    if controller.rename_chat(&id, &body.title).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(rejected(&controller))
    }
}

async fn delete_chat(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let controller = state.loaded_session(identity).await?;
    ensure_chat(&controller, &id)?;
    if controller.delete_chat(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(rejected(&controller))
    }
}

async fn set_current_chat(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let controller = state.loaded_session(identity).await?;
    if controller.set_current_chat(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(id))
    }
}

#[axum::debug_handler]
async fn post_message(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<StatusCode, ApiError> {
    let role = match body.role.as_deref() {
        None => Role::User,
        Some(raw) => Role::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown role {:?}", raw)))?,
    };
    let draft = match body.attachment {
        None => Draft::Text(body.text),
        Some(attachment) => Draft::WithAttachment {
            text: body.text,
            attachment: decode_attachment(attachment)?,
        },
    };

    let persona = body.persona;
    let owner_id = identity.owner_id.clone();
    let controller = state.loaded_session(identity).await?;
    ensure_chat(&controller, &id)?;

    // The reply can take minutes; progress is reported on /events.
    let sender_id = (role == Role::User).then_some(owner_id);
    tokio::spawn(async move {
        controller
            .add_message(&id, draft, role, sender_id, persona)
            .await;
    });

    Ok(StatusCode::ACCEPTED)
}

async fn cancel_turn(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.loaded_session(identity).await?;
    ensure_chat(&controller, &id)?;
    Ok(Json(json!({ "cancelled": controller.cancel_turn(&id) })))
}

async fn events(
    State(state): State<Arc<ApiState>>,
    Caller(identity): Caller,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    info!(owner = %identity, "new event stream");

    let owner_id = identity.owner_id.clone();
    let mut rx = state.bus.subscribe();
    let controller = state.session(identity).await;
    let snapshot = controller.snapshot();

    let stream = async_stream::stream! {
        if let Ok(data) = serde_json::to_string(&snapshot) {
            yield Ok(SseEvent::default().event("snapshot").data(data));
        }

        loop {
            match rx.recv().await {
                Ok(event) if event.owner_id() == owner_id => {
                    match serde_json::to_string(&event) {
                        Ok(data) => yield Ok(SseEvent::default().event(event_name(&event)).data(data)),
                        Err(e) => warn!("failed to encode event: {}", e),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::ConversationsChanged { .. } => "conversations",
        Event::TurnState { .. } => "turn",
        Event::Notification { .. } => "notification",
    }
}

fn ensure_chat(controller: &Controller, id: &str) -> Result<(), ApiError> {
    if controller.snapshot().conversation(id).is_some() {
        Ok(())
    } else {
        Err(ApiError::NotFound(id.to_string()))
    }
}

fn rejected(controller: &Controller) -> ApiError {
    ApiError::Rejected(
        controller
            .snapshot()
            .error
            .unwrap_or_else(|| "operation failed".to_string()),
    )
}

fn decode_attachment(body: AttachmentBody) -> Result<Attachment, ApiError> {
    let encoded = match body.data.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => body.data.as_str(),
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ApiError::BadRequest(format!("attachment is not valid base64: {}", e)))?;

    Ok(Attachment {
        file_name: body.file_name,
        mime_type: body.mime_type,
        bytes,
    })
}
