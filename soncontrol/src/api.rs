//! REST handlers for the engine control surface.
//!
//! The handlers are thin adapters over [`crate::SessionController`]; every
//! control-plane error is returned synchronously with a typed JSON body.
//! The one streaming endpoint, `GET /channel_stream/{channel_id}`, attaches
//! a listener to the channel and serves its MP3 byte stream chunked, with
//! indefinite length.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sonstream::StreamError;
use sontheme::ThemeError;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{ControlError, SessionController, SessionSpec, SessionUpdate};

/// Shared state of the control surface.
pub type ControlState = Arc<SessionController>;

/// Corps d'erreur JSON commun à toutes les routes
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Code d'erreur stable
    #[schema(example = "UNKNOWN_THEME")]
    pub error: String,
    /// Message lisible
    pub message: String,
}

/// Vue d'un canal pour la surface de contrôle
#[derive(Debug, Serialize, ToSchema)]
pub struct ChannelView {
    pub channel_id: usize,
    /// idle | loading | playing | transitioning
    #[schema(example = "playing")]
    pub state: String,
    pub current_theme_ref: Option<String>,
    pub version: u64,
    pub listener_count: usize,
    pub frame_position: u64,
    /// Pistes désactivées pour ce thème (une entrée par piste)
    pub decode_failures: Vec<DecodeFailureView>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DecodeFailureView {
    pub track: String,
    pub reason: String,
}

impl From<sonstream::ChannelSnapshot> for ChannelView {
    fn from(snapshot: sonstream::ChannelSnapshot) -> Self {
        Self {
            channel_id: snapshot.channel_id,
            state: format!("{:?}", snapshot.state).to_lowercase(),
            current_theme_ref: snapshot.current_theme_ref,
            version: snapshot.version,
            listener_count: snapshot.listener_count,
            frame_position: snapshot.frame_position,
            decode_failures: snapshot
                .decode_failures
                .into_iter()
                .map(|f| DecodeFailureView {
                    track: f.track,
                    reason: f.reason,
                })
                .collect(),
        }
    }
}

/// Vue d'une session
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionView {
    pub id: Uuid,
    pub theme: String,
    pub preset: Option<String>,
    pub volume: f32,
    pub speakers: Vec<String>,
    pub playing: bool,
    pub channel_id: Option<usize>,
    /// URL du flux si la session joue
    pub stream_url: Option<String>,
}

/// Vue d'un thème disponible
#[derive(Debug, Serialize, ToSchema)]
pub struct ThemeView {
    pub name: String,
    pub track_count: usize,
    pub presets: Vec<String>,
}

/// Requête de création de session
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    #[schema(example = "forest")]
    pub theme: String,
    pub preset: Option<String>,
    /// Volume linéaire [0, 1]
    #[schema(example = 0.8)]
    pub volume: Option<f32>,
    #[serde(default)]
    pub speakers: Vec<String>,
}

/// Requête de chargement de thème sur un canal
#[derive(Debug, Deserialize, ToSchema)]
pub struct LoadThemeRequest {
    #[schema(example = "forest")]
    pub theme: String,
    pub preset: Option<String>,
}

/// Requête de mise à jour du gain maître
#[derive(Debug, Deserialize, ToSchema)]
pub struct MasterGainRequest {
    #[schema(example = 0.9)]
    pub gain: f32,
}

/// Mise à jour partielle d'une session
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateSessionRequest {
    pub theme: Option<String>,
    /// Passer explicitement null pour effacer le preset
    #[serde(default, with = "double_option")]
    pub preset: Option<Option<String>>,
    pub volume: Option<f32>,
    pub speakers: Option<Vec<String>>,
}

/// Distingue « champ absent » de « champ explicitement null ».
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

fn error_response(error: &ControlError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match error {
        ControlError::UnknownSession(_) => (StatusCode::NOT_FOUND, "UNKNOWN_SESSION"),
        ControlError::Theme(ThemeError::UnknownTheme(_)) => {
            (StatusCode::NOT_FOUND, "UNKNOWN_THEME")
        }
        ControlError::Theme(ThemeError::UnknownPreset { .. }) => {
            (StatusCode::NOT_FOUND, "UNKNOWN_PRESET")
        }
        ControlError::Theme(_) => (StatusCode::INTERNAL_SERVER_ERROR, "THEME_ERROR"),
        ControlError::Stream(StreamError::NoChannelAvailable) => {
            (StatusCode::SERVICE_UNAVAILABLE, "NO_CHANNEL_AVAILABLE")
        }
        ControlError::Stream(StreamError::LoadInProgress(_)) => {
            (StatusCode::CONFLICT, "LOAD_IN_PROGRESS")
        }
        ControlError::Stream(StreamError::UnknownChannel(_)) => {
            (StatusCode::NOT_FOUND, "UNKNOWN_CHANNEL")
        }
        ControlError::Stream(StreamError::Engine(_)) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "THEME_UNPLAYABLE")
        }
        ControlError::Stream(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STREAM_ERROR"),
    };
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: error.to_string(),
        }),
    )
}

fn session_view(controller: &SessionController, session: crate::Session) -> SessionView {
    let stream_url = session.channel_id.map(|id| controller.stream_url(id));
    SessionView {
        id: session.id,
        theme: session.theme,
        preset: session.preset,
        volume: session.volume,
        speakers: session.speakers,
        playing: session.playing,
        channel_id: session.channel_id,
        stream_url,
    }
}

/// Flux audio d'un canal
///
/// L'auditeur rejoint le direct à la position courante du canal ; le flux
/// est un MP3 CBR sans longueur, servi en chunked. La connexion se ferme
/// quand le canal s'arrête ou quand l'auditeur est déclaré mort par la
/// politique de backpressure.
#[utoipa::path(
    get,
    path = "/channel_stream/{channel_id}",
    tag = "stream",
    params(("channel_id" = usize, Path, description = "Identifiant du canal (1..max_channels)")),
    responses(
        (status = 200, description = "Flux MP3 continu", content_type = "audio/mpeg"),
        (status = 404, description = "Canal inconnu", body = ErrorResponse),
    )
)]
pub async fn channel_stream(
    State(controller): State<ControlState>,
    Path(channel_id): Path<usize>,
) -> Response {
    let channel = match controller.pool().get(channel_id) {
        Ok(channel) => channel,
        Err(error) => return error_response(&ControlError::Stream(error)).into_response(),
    };
    let mut stream = match channel.attach_listener() {
        Ok(stream) => stream,
        Err(error) => return error_response(&ControlError::Stream(error)).into_response(),
    };

    let body = Body::from_stream(async_stream::stream! {
        while let Some(chunk) = stream.next_chunk().await {
            yield Ok::<_, std::io::Error>(chunk);
        }
    });

    (
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}

/// Liste les thèmes disponibles
#[utoipa::path(
    get,
    path = "/api/themes",
    tag = "themes",
    responses((status = 200, body = [ThemeView]))
)]
pub async fn list_themes(State(controller): State<ControlState>) -> Json<Vec<ThemeView>> {
    let themes = controller
        .themes()
        .list_themes()
        .into_iter()
        .map(|info| ThemeView {
            name: info.name,
            track_count: info.track_count,
            presets: info.presets,
        })
        .collect();
    Json(themes)
}

/// Relit le répertoire des thèmes
#[utoipa::path(
    post,
    path = "/api/themes/reload",
    tag = "themes",
    responses(
        (status = 200, body = [ThemeView]),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn reload_themes(State(controller): State<ControlState>) -> Response {
    if let Err(error) = controller.themes().reload() {
        return error_response(&ControlError::Theme(error)).into_response();
    }
    list_themes(State(controller)).await.into_response()
}

/// État de tous les canaux
#[utoipa::path(
    get,
    path = "/api/snapshot",
    tag = "channels",
    responses((status = 200, body = [ChannelView]))
)]
pub async fn snapshot(State(controller): State<ControlState>) -> Json<Vec<ChannelView>> {
    Json(
        controller
            .snapshot()
            .into_iter()
            .map(ChannelView::from)
            .collect(),
    )
}

/// Charge un thème sur un canal
///
/// Sur un canal au repos le thème démarre immédiatement ; sur un canal en
/// lecture un fondu enchaîné vers le nouveau thème commence.
#[utoipa::path(
    post,
    path = "/api/channels/{channel_id}/theme",
    tag = "channels",
    params(("channel_id" = usize, Path, description = "Identifiant du canal")),
    request_body = LoadThemeRequest,
    responses(
        (status = 200, body = ChannelView),
        (status = 404, description = "Canal, thème ou preset inconnu", body = ErrorResponse),
        (status = 409, description = "Chargement déjà en cours", body = ErrorResponse),
        (status = 422, description = "Aucune piste lisible", body = ErrorResponse),
    )
)]
pub async fn load_channel_theme(
    State(controller): State<ControlState>,
    Path(channel_id): Path<usize>,
    Json(request): Json<LoadThemeRequest>,
) -> Response {
    match controller
        .load_channel_theme(channel_id, &request.theme, request.preset.as_deref())
        .await
    {
        Ok(snapshot) => Json(ChannelView::from(snapshot)).into_response(),
        Err(error) => error_response(&error).into_response(),
    }
}

/// Arrête un canal
#[utoipa::path(
    post,
    path = "/api/channels/{channel_id}/stop",
    tag = "channels",
    params(("channel_id" = usize, Path, description = "Identifiant du canal")),
    responses(
        (status = 200, body = ChannelView),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn stop_channel(
    State(controller): State<ControlState>,
    Path(channel_id): Path<usize>,
) -> Response {
    match controller.stop_channel(channel_id) {
        Ok(snapshot) => Json(ChannelView::from(snapshot)).into_response(),
        Err(error) => error_response(&error).into_response(),
    }
}

/// Crée une session
#[utoipa::path(
    post,
    path = "/api/sessions",
    tag = "sessions",
    request_body = CreateSessionRequest,
    responses((status = 201, body = SessionView))
)]
pub async fn create_session(
    State(controller): State<ControlState>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let session = controller.create_session(SessionSpec {
        theme: request.theme,
        preset: request.preset,
        volume: request.volume.unwrap_or(1.0),
        speakers: request.speakers,
    });
    let view = session_view(&controller, session);
    (StatusCode::CREATED, Json(view)).into_response()
}

/// Liste les sessions
#[utoipa::path(
    get,
    path = "/api/sessions",
    tag = "sessions",
    responses((status = 200, body = [SessionView]))
)]
pub async fn list_sessions(State(controller): State<ControlState>) -> Json<Vec<SessionView>> {
    Json(
        controller
            .list_sessions()
            .into_iter()
            .map(|s| session_view(&controller, s))
            .collect(),
    )
}

/// Démarre la lecture d'une session
#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/play",
    tag = "sessions",
    params(("session_id" = Uuid, Path, description = "Identifiant de session")),
    responses(
        (status = 200, body = SessionView),
        (status = 404, body = ErrorResponse),
        (status = 503, description = "Pool de canaux épuisé", body = ErrorResponse),
    )
)]
pub async fn play_session(
    State(controller): State<ControlState>,
    Path(session_id): Path<Uuid>,
) -> Response {
    match controller.play(session_id).await {
        Ok(_) => match controller.get_session(session_id) {
            Ok(session) => Json(session_view(&controller, session)).into_response(),
            Err(error) => error_response(&error).into_response(),
        },
        Err(error) => error_response(&error).into_response(),
    }
}

/// Arrête une session
#[utoipa::path(
    post,
    path = "/api/sessions/{session_id}/stop",
    tag = "sessions",
    params(("session_id" = Uuid, Path, description = "Identifiant de session")),
    responses(
        (status = 200, body = SessionView),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn stop_session(
    State(controller): State<ControlState>,
    Path(session_id): Path<Uuid>,
) -> Response {
    match controller.stop(session_id) {
        Ok(()) => match controller.get_session(session_id) {
            Ok(session) => Json(session_view(&controller, session)).into_response(),
            Err(error) => error_response(&error).into_response(),
        },
        Err(error) => error_response(&error).into_response(),
    }
}

/// Met à jour une session
///
/// Une session en lecture est rechargée sur son canal : le changement de
/// thème ou de preset s'entend comme un fondu enchaîné.
#[utoipa::path(
    put,
    path = "/api/sessions/{session_id}",
    tag = "sessions",
    params(("session_id" = Uuid, Path, description = "Identifiant de session")),
    request_body = UpdateSessionRequest,
    responses(
        (status = 200, body = SessionView),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn update_session(
    State(controller): State<ControlState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<UpdateSessionRequest>,
) -> Response {
    let update = SessionUpdate {
        theme: request.theme,
        preset: request.preset,
        volume: request.volume,
        speakers: request.speakers,
    };
    match controller.update(session_id, update).await {
        Ok(session) => Json(session_view(&controller, session)).into_response(),
        Err(error) => error_response(&error).into_response(),
    }
}

/// Supprime une session
#[utoipa::path(
    delete,
    path = "/api/sessions/{session_id}",
    tag = "sessions",
    params(("session_id" = Uuid, Path, description = "Identifiant de session")),
    responses(
        (status = 204, description = "Session supprimée"),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn delete_session(
    State(controller): State<ControlState>,
    Path(session_id): Path<Uuid>,
) -> Response {
    match controller.remove_session(session_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(&error).into_response(),
    }
}

/// Gain maître global
#[utoipa::path(
    put,
    path = "/api/master_gain",
    tag = "channels",
    request_body = MasterGainRequest,
    responses((status = 200, description = "Gain appliqué"))
)]
pub async fn set_master_gain(
    State(controller): State<ControlState>,
    Json(request): Json<MasterGainRequest>,
) -> impl IntoResponse {
    controller.set_master_gain(request.gain);
    Json(serde_json::json!({ "gain": controller.master_gain() }))
}

/// Assemble le routeur complet de la surface de contrôle.
pub fn control_router(controller: ControlState) -> Router {
    Router::new()
        .route("/channel_stream/{channel_id}", get(channel_stream))
        .route("/api/themes", get(list_themes))
        .route("/api/themes/reload", post(reload_themes))
        .route("/api/snapshot", get(snapshot))
        .route("/api/channels/{channel_id}/theme", post(load_channel_theme))
        .route("/api/channels/{channel_id}/stop", post(stop_channel))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{session_id}", put(update_session).delete(delete_session))
        .route("/api/sessions/{session_id}/play", post(play_session))
        .route("/api/sessions/{session_id}/stop", post(stop_session))
        .with_state(controller)
}
