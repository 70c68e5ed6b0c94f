//! HTTP API for the editor and the rendering surface.
//!
//! Editor routes identify the owner with `Authorization: Bearer <token>`.
//! The preview stream and the ready signal belong to the rendering surface,
//! which names the session it renders with `?session=<id>` (the `sessionId`
//! returned by sign-in) and only ever sees that session's snapshot.

use crate::host::{HostError, SessionHost};
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use vows_common::{Document, DocumentPatch, OwnerIdentity};
use vows_editor::{
    EditorSession, SurfaceError, SurfaceMessage, SyncError, ValidationState,
};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("missing or malformed bearer token")]
    Unauthorized,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("no owner is signed in")]
    NoSession,

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Surface(#[from] SurfaceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NoSession => StatusCode::CONFLICT,
            ServerError::Host(HostError::NotSignedIn(_)) => StatusCode::UNAUTHORIZED,
            ServerError::Host(HostError::Sync(err)) | ServerError::Sync(err) => sync_status(err),
            ServerError::Surface(_) => StatusCode::CONFLICT,
            ServerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retryable(&self) -> bool {
        match self {
            ServerError::Host(HostError::Sync(err)) | ServerError::Sync(err) => err.is_retryable(),
            _ => false,
        }
    }
}

fn sync_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::Persistence { .. } | SyncError::NotFound { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SyncError::NoSession | SyncError::SessionEnded => StatusCode::CONFLICT,
        SyncError::SlugNotConfirmed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::NotARecord(_)
        | SyncError::NotASequence(_)
        | SyncError::NotAValue(_)
        | SyncError::ImmutableId
        | SyncError::Common(_) => StatusCode::BAD_REQUEST,
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            retryable: self.retryable(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the API router
pub fn router(host: Arc<SessionHost>) -> Router {
    Router::new()
        .route("/api/session", post(sign_in_handler).delete(sign_out_handler))
        .route("/api/document", get(document_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route(
            "/api/pending",
            post(set_pending_handler).delete(clear_pending_handler),
        )
        .route(
            "/api/sequence/:section",
            put(replace_sequence_handler).post(add_item_handler),
        )
        .route("/api/sequence/:section/:id", delete(remove_item_handler))
        .route("/api/commit", post(commit_handler))
        .route("/api/save", post(save_handler))
        .route(
            "/api/template/preview",
            post(preview_template_handler).delete(discard_template_handler),
        )
        .route("/api/template/save", post(save_template_handler))
        .route("/api/slug", post(check_slug_handler).get(slug_state_handler))
        .route("/api/preview", get(preview_sse_handler))
        .route("/api/preview/ready", post(surface_ready_handler))
        .with_state(host)
        .layer(CorsLayer::permissive())
}

/// Serve the API until ctrl-c, then end the running session
pub async fn serve(addr: SocketAddr, host: Arc<SessionHost>) -> ServerResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, router(host.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    host.shutdown().await;
    info!("server stopped");
    Ok(())
}

fn bearer_identity(headers: &HeaderMap) -> ServerResult<OwnerIdentity> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ServerError::Unauthorized)?;
    OwnerIdentity::new(token).map_err(|_| ServerError::Unauthorized)
}

async fn owner_session(host: &SessionHost, headers: &HeaderMap) -> ServerResult<Arc<EditorSession>> {
    let identity = bearer_identity(headers)?;
    Ok(host.session(&identity).await?)
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInfo {
    session_id: String,
    identity: OwnerIdentity,
    document: Document,
}

async fn sign_in_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
) -> ServerResult<Json<SessionInfo>> {
    let identity = bearer_identity(&headers)?;
    let session = host.sign_in(identity).await?;
    Ok(Json(SessionInfo {
        session_id: session.id().to_string(),
        identity: session.identity().clone(),
        document: session.snapshot(),
    }))
}

async fn sign_out_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
) -> ServerResult<StatusCode> {
    let identity = bearer_identity(&headers)?;
    host.sign_out(&identity).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn document_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
) -> ServerResult<Json<Document>> {
    let session = owner_session(&host, &headers).await?;
    Ok(Json(session.committed()))
}

async fn snapshot_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
) -> ServerResult<Json<Document>> {
    let session = owner_session(&host, &headers).await?;
    Ok(Json(session.snapshot()))
}

// ============================================================================
// Pending edits
// ============================================================================

#[derive(Debug, Deserialize)]
struct PendingRequest {
    section: String,
    field: Option<String>,
    index: Option<usize>,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct ClearQuery {
    section: Option<String>,
    field: Option<String>,
    index: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Changed {
    changed: bool,
}

async fn set_pending_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
    Json(request): Json<PendingRequest>,
) -> ServerResult<Json<Changed>> {
    let session = owner_session(&host, &headers).await?;
    let changed = match (request.index, request.field) {
        (Some(index), Some(field)) => {
            session.set_pending_item(&request.section, index, &field, request.value)?
        }
        (Some(_), None) => {
            return Err(ServerError::BadRequest(
                "an element edit needs a field".to_string(),
            ))
        }
        (None, Some(field)) => session.set_pending(&request.section, &field, request.value)?,
        (None, None) => session.set_pending_value(&request.section, request.value)?,
    };
    Ok(Json(Changed { changed }))
}

async fn clear_pending_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
    Query(query): Query<ClearQuery>,
) -> ServerResult<Json<Changed>> {
    let session = owner_session(&host, &headers).await?;
    let changed = match (query.section, query.index, query.field) {
        (None, _, _) => session.clear_all(),
        (Some(section), Some(index), Some(field)) => {
            session.clear_item_field(&section, index, &field)
        }
        (Some(section), None, Some(field)) => session.clear_field(&section, &field),
        (Some(section), _, None) => session.clear_section(&section),
    };
    Ok(Json(Changed { changed }))
}

async fn replace_sequence_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
    Path(section): Path<String>,
    Json(items): Json<Vec<Value>>,
) -> ServerResult<Json<Changed>> {
    let session = owner_session(&host, &headers).await?;
    let changed = session.replace_sequence(&section, items)?;
    Ok(Json(Changed { changed }))
}

#[derive(Debug, Serialize)]
struct AddedItem {
    id: String,
}

async fn add_item_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
    Path(section): Path<String>,
) -> ServerResult<(StatusCode, Json<AddedItem>)> {
    let session = owner_session(&host, &headers).await?;
    let id = session.add_item(&section)?;
    Ok((StatusCode::CREATED, Json(AddedItem { id })))
}

async fn remove_item_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
    Path((section, id)): Path<(String, String)>,
) -> ServerResult<Json<Changed>> {
    let session = owner_session(&host, &headers).await?;
    let changed = session.remove_item(&section, &id)?;
    Ok(Json(Changed { changed }))
}

// ============================================================================
// Commits
// ============================================================================

/// Either a shallow patch, or the pending key(s) to commit
#[derive(Debug, Deserialize)]
struct CommitRequest {
    patch: Option<DocumentPatch>,
    section: Option<String>,
    field: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommitResponse {
    committed: bool,
    document: Document,
}

async fn commit_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
    Json(request): Json<CommitRequest>,
) -> ServerResult<Json<CommitResponse>> {
    let session = owner_session(&host, &headers).await?;
    let committed = match (request.patch, request.section, request.field) {
        (Some(patch), None, None) => {
            session.commit(patch).await?;
            true
        }
        (None, Some(section), Some(field)) => session.commit_field(&section, &field).await?,
        (None, Some(section), None) => session.commit_section(&section).await?,
        _ => {
            return Err(ServerError::BadRequest(
                "send either a patch or a section (and optional field)".to_string(),
            ))
        }
    };
    Ok(Json(CommitResponse {
        committed,
        document: session.committed(),
    }))
}

async fn save_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
) -> ServerResult<Json<Document>> {
    let session = owner_session(&host, &headers).await?;
    session.save_all().await?;
    Ok(Json(session.committed()))
}

// ============================================================================
// Template preview
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateRequest {
    template_id: String,
}

async fn preview_template_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
    Json(request): Json<TemplateRequest>,
) -> ServerResult<Json<Changed>> {
    let session = owner_session(&host, &headers).await?;
    let changed = session.preview_template(request.template_id)?;
    Ok(Json(Changed { changed }))
}

async fn discard_template_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
) -> ServerResult<Json<Changed>> {
    let session = owner_session(&host, &headers).await?;
    Ok(Json(Changed {
        changed: session.discard_template_preview(),
    }))
}

async fn save_template_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
) -> ServerResult<Json<CommitResponse>> {
    let session = owner_session(&host, &headers).await?;
    let committed = session.save_template().await?;
    Ok(Json(CommitResponse {
        committed,
        document: session.committed(),
    }))
}

// ============================================================================
// Slug validation
// ============================================================================

#[derive(Debug, Deserialize)]
struct SlugRequest {
    value: String,
}

async fn check_slug_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
    Json(request): Json<SlugRequest>,
) -> ServerResult<Json<ValidationState>> {
    let session = owner_session(&host, &headers).await?;
    Ok(Json(session.check_slug(&request.value)))
}

async fn slug_state_handler(
    State(host): State<Arc<SessionHost>>,
    headers: HeaderMap,
) -> ServerResult<Json<ValidationState>> {
    let session = owner_session(&host, &headers).await?;
    Ok(Json(session.slug_state()))
}

// ============================================================================
// Rendering surface
// ============================================================================

fn surface_event(message: &SurfaceMessage) -> Event {
    let json = serde_json::to_string(message).unwrap_or_default();
    Event::default().data(json)
}

#[derive(Debug, Deserialize)]
struct SurfaceQuery {
    session: Option<String>,
}

/// Session the surface named in `?session=`, if it is still the current one
async fn surface_session(
    host: &SessionHost,
    query: &SurfaceQuery,
) -> ServerResult<Arc<EditorSession>> {
    let session = host.current().await.ok_or(ServerError::NoSession)?;
    match query.session.as_deref() {
        Some(id) if id == session.id() => Ok(session),
        _ => Err(ServerError::Unauthorized),
    }
}

/// SSE endpoint streaming surface messages for the signed-in owner.
///
/// The stream ends once that session is no longer the current one.
async fn preview_sse_handler(
    State(host): State<Arc<SessionHost>>,
    Query(query): Query<SurfaceQuery>,
) -> ServerResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let rx = host.subscribe_surface();
    let session = surface_session(&host, &query).await?;
    let session_id = session.id().to_string();

    let initial = Ok::<_, Infallible>(surface_event(&SurfaceMessage::DataUpdate {
        data: session.snapshot(),
    }));
    info!(session = %session_id, "preview stream opened");

    let initial_stream = stream::iter([initial]);

    let state = (rx, host, session_id);
    let broadcast_stream = stream::unfold(state, |(mut rx, host, session_id)| async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let current = host.current().await;
                    if current.as_ref().map(|s| s.id()) != Some(session_id.as_str()) {
                        info!(session = %session_id, "session ended, closing preview stream");
                        return None;
                    }
                    return Some((Ok(surface_event(&message)), (rx, host, session_id)));
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "preview subscriber lagged");
                }
                Err(RecvError::Closed) => {
                    info!("surface channel closed");
                    return None;
                }
            }
        }
    });

    Ok(Sse::new(initial_stream.chain(broadcast_stream))
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("ping")))
}

/// The surface finished loading and wants the template and data to render
async fn surface_ready_handler(
    State(host): State<Arc<SessionHost>>,
    Query(query): Query<SurfaceQuery>,
) -> ServerResult<StatusCode> {
    let session = surface_session(&host, &query).await?;
    session.surface_ready()?;
    Ok(StatusCode::NO_CONTENT)
}
