//! HTTP server: battle control endpoints, SSE progress and artifact serving.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::str::FromStr;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use rapbattle_core::audio::{OUTPUTS_ROUTE, artifact_url};
use rapbattle_core::{
    ArtifactStore, AudioError, BattleError, BattleId, BattleOrchestrator, BattleRequest,
    BattleState, BeatStyle, CompletionPayload, DeliveryStyle, ErrorKind, ProgressUpdate,
    UploadKind, Verse,
};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    kind: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

impl From<BattleError> for ApiError {
    fn from(err: BattleError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: kind.as_str(),
            detail: err.to_string(),
            errors: err.field_errors().to_vec(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(&self)).into_response()
    }
}

impl ApiError {
    fn bad_request(kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind,
            detail: detail.into(),
            errors: Vec::new(),
        }
    }
}

impl From<AudioError> for ApiError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::Io(e) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "storage",
                detail: e.to_string(),
                errors: Vec::new(),
            },
            other => Self::bad_request("invalid_upload", other.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

fn parse_id(raw: &str) -> Result<BattleId, ApiError> {
    BattleId::from_str(raw).map_err(ApiError::from)
}

/// Build the application router.
pub fn build_router(orchestrator: BattleOrchestrator) -> Router {
    let outputs = ServeDir::new(orchestrator.store().root());

    Router::new()
        .route("/health", get(health))
        .route("/api/battle", post(create_battle))
        .route("/api/battle/:id", get(get_battle).delete(delete_battle))
        .route("/api/battle/:id/events", get(battle_events))
        .route("/api/battle/:id/result", get(battle_result))
        .route("/api/battle/:id/cancel", post(cancel_battle))
        .route("/api/lyrics/generate", post(generate_lyrics))
        .route("/api/presets/styles", get(style_presets))
        .route(
            "/api/upload/voice",
            post(upload_voice).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(
            "/api/upload/image",
            post(upload_image).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .nest_service(OUTPUTS_ROUTE, outputs)
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Serve until Ctrl-C.
pub async fn serve(orchestrator: BattleOrchestrator, bind: SocketAddr) -> std::io::Result<()> {
    let retention = orchestrator.config().pipeline.retention();
    let reaper = orchestrator.spawn_reaper(retention.clamp(Duration::from_secs(1), Duration::from_secs(60)));
    let app = build_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on http://{}", bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    reaper.abort();
    Ok(())
}

async fn health(State(orchestrator): State<BattleOrchestrator>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "battles": orchestrator.battle_count(),
    }))
}

/// Voice samples and face images sent over HTTP must be files previously
/// stored through the upload endpoints. Face references may also be URLs.
fn confine_uploads(store: &ArtifactStore, request: &mut BattleRequest) -> Result<(), BattleError> {
    let mut errors = Vec::new();
    for (field, participant) in [
        ("fighter_a", &mut request.fighter_a),
        ("fighter_b", &mut request.fighter_b),
    ] {
        if let Some(sample) = participant.voice_sample.take() {
            match store.resolve_upload(UploadKind::Voice, &sample) {
                Some(path) => participant.voice_sample = Some(path),
                None => errors.push(format!(
                    "{}.voice_sample must reference an uploaded voice sample",
                    field
                )),
            }
        }
        if let Some(face) = &participant.face_reference {
            let is_url = face.starts_with("https://") || face.starts_with("http://");
            if !is_url && store.resolve_upload(UploadKind::Image, FsPath::new(face)).is_none() {
                errors.push(format!(
                    "{}.face_reference must be a URL or an uploaded image",
                    field
                ));
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BattleError::Validation(errors))
    }
}

async fn create_battle(
    State(orchestrator): State<BattleOrchestrator>,
    Json(mut request): Json<BattleRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    confine_uploads(orchestrator.store(), &mut request)?;
    let battle_id = orchestrator.submit(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "battle_id": battle_id, "status": "started" })),
    ))
}

async fn get_battle(
    State(orchestrator): State<BattleOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Json<BattleState>> {
    let battle_id = parse_id(&id)?;
    Ok(Json(orchestrator.get_state(&battle_id)?))
}

async fn battle_result(
    State(orchestrator): State<BattleOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Json<CompletionPayload>> {
    let battle_id = parse_id(&id)?;
    let state = orchestrator.get_state(&battle_id)?;
    state.completion().map(Json).ok_or_else(|| ApiError {
        status: StatusCode::CONFLICT,
        kind: "not_complete",
        detail: format!("battle {} is {:?}", battle_id, state.status),
        errors: Vec::new(),
    })
}

async fn cancel_battle(
    State(orchestrator): State<BattleOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let battle_id = parse_id(&id)?;
    let status = orchestrator.cancel(&battle_id)?;
    Ok(Json(json!({
        "battle_id": battle_id,
        "status": status,
        "cancel_requested": !status.is_terminal(),
    })))
}

async fn delete_battle(
    State(orchestrator): State<BattleOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let battle_id = parse_id(&id)?;
    orchestrator.remove(&battle_id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn event_name(update: &ProgressUpdate) -> &'static str {
    if update.replay {
        "replay"
    } else if update.is_terminal() {
        "terminal"
    } else {
        "progress"
    }
}

async fn battle_events(
    State(orchestrator): State<BattleOrchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let battle_id = parse_id(&id)?;
    let subscription = orchestrator.subscribe(&battle_id)?;
    debug!(%battle_id, "SSE client connected");

    let stream = subscription.into_stream().filter_map(|update| async move {
        match Event::default().event(event_name(&update)).json_data(&update) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                warn!("Failed to serialize progress update: {}", e);
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    reference: String,
    url: String,
}

async fn upload_voice(
    State(orchestrator): State<BattleOrchestrator>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    store_upload(orchestrator.store().clone(), UploadKind::Voice, multipart).await
}

async fn upload_image(
    State(orchestrator): State<BattleOrchestrator>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    store_upload(orchestrator.store().clone(), UploadKind::Image, multipart).await
}

/// Store the `file` field of a multipart body.
async fn store_upload(
    store: ArtifactStore,
    kind: UploadKind,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let malformed = |e: axum::extract::multipart::MultipartError| {
        ApiError::bad_request("invalid_upload", e.to_string())
    };

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(malformed)?;
        let reference = tokio::task::spawn_blocking(move || store.save_upload(kind, &file_name, &bytes))
            .await
            .map_err(|e| ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "storage",
                detail: e.to_string(),
                errors: Vec::new(),
            })??;
        info!(kind = kind.dir(), %reference, "upload stored");
        let url = artifact_url(&reference);
        return Ok((StatusCode::CREATED, Json(UploadResponse { reference, url })));
    }

    Err(ApiError::bad_request(
        "invalid_upload",
        "multipart body has no 'file' field",
    ))
}

#[derive(Debug, Serialize)]
struct LyricsResponse {
    verses: Vec<Verse>,
}

async fn generate_lyrics(
    State(orchestrator): State<BattleOrchestrator>,
    Json(request): Json<BattleRequest>,
) -> ApiResult<Json<LyricsResponse>> {
    let verses = orchestrator.generate_lyrics(&request).await?;
    Ok(Json(LyricsResponse { verses }))
}

async fn style_presets() -> Json<Value> {
    let delivery: Vec<Value> = DeliveryStyle::ALL
        .iter()
        .map(|style| {
            json!({
                "key": style.key(),
                "name": style.display_name(),
                "delivery": style.delivery(),
            })
        })
        .collect();
    let beats: Vec<Value> = BeatStyle::ALL
        .iter()
        .map(|style| {
            json!({
                "key": style.key(),
                "name": style.display_name(),
                "default_bpm": style.default_bpm(),
            })
        })
        .collect();
    Json(json!({ "delivery_styles": delivery, "beat_styles": beats }))
}
