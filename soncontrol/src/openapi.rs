//! Documentation OpenAPI de la surface de contrôle.

use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Sonorium Control API",
        description = "Pilotage du moteur de paysages sonores : thèmes, canaux, sessions et flux audio.",
    ),
    paths(
        api::channel_stream,
        api::list_themes,
        api::reload_themes,
        api::snapshot,
        api::load_channel_theme,
        api::stop_channel,
        api::create_session,
        api::list_sessions,
        api::play_session,
        api::stop_session,
        api::update_session,
        api::delete_session,
        api::set_master_gain,
    ),
    components(schemas(
        api::ErrorResponse,
        api::ChannelView,
        api::DecodeFailureView,
        api::SessionView,
        api::ThemeView,
        api::CreateSessionRequest,
        api::UpdateSessionRequest,
        api::LoadThemeRequest,
        api::MasterGainRequest,
    )),
    tags(
        (name = "stream", description = "Flux audio des canaux"),
        (name = "channels", description = "État et pilotage direct des canaux"),
        (name = "sessions", description = "Sessions de lecture multi-zones"),
        (name = "themes", description = "Bibliothèque de thèmes"),
    )
)]
pub struct ApiDoc;
