//! Extension de `sonserver::Server` pour monter la surface de contrôle.
//!
//! Ce trait permet à `soncontrol` d'ajouter ses routes sur un serveur
//! externe sans que `sonserver` ne dépende de cette crate.

use utoipa::OpenApi;

use crate::api::{control_router, ControlState};
use crate::openapi::ApiDoc;

pub trait ControlSurfaceExt {
    /// Monte les routes de contrôle, le flux audio des canaux et la
    /// documentation OpenAPI associée.
    async fn init_control_surface(&mut self, controller: ControlState) -> anyhow::Result<()>;
}

impl ControlSurfaceExt for sonserver::Server {
    async fn init_control_surface(&mut self, controller: ControlState) -> anyhow::Result<()> {
        self.add_router("/", control_router(controller)).await;
        self.add_openapi(ApiDoc::openapi()).await;
        Ok(())
    }
}
