//! Serveur HTTP principal.

use std::{net::SocketAddr, sync::Arc};

use axum::{routing::get, Json, Router};
use serde::Serialize;
use sonconfig::get_config;
use tokio::{signal, sync::RwLock, task::JoinHandle};
use tracing::info;
use utoipa_swagger_ui::SwaggerUi;

/// Info serveur sérialisable
#[derive(Clone, Serialize, utoipa::ToSchema)]
pub struct ServerInfo {
    /// Nom du serveur
    pub name: String,
    /// URL de base
    pub base_url: String,
    /// Port HTTP
    pub http_port: u16,
}

/// Serveur principal
pub struct Server {
    name: String,
    base_url: String,
    http_port: u16,
    router: Arc<RwLock<Router>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Crée une nouvelle instance de serveur
    ///
    /// # Arguments
    ///
    /// * `name` - Nom du serveur (pour les logs)
    /// * `base_url` - URL de base (ex: "http://192.168.1.10")
    /// * `http_port` - Port HTTP à écouter
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http_port,
            router: Arc::new(RwLock::new(Router::new())),
            join_handle: None,
        }
    }

    /// Crée le serveur depuis la configuration globale.
    pub fn new_configured() -> Self {
        let config = get_config();
        let url = config.get_base_url();
        let port = config.get_http_port();

        Self::new("Sonorium", url, port)
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            http_port: self.http_port,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Ajoute une route JSON dynamique
    ///
    /// Crée un endpoint GET qui retourne du JSON. La closure fournie est
    /// appelée à chaque requête.
    pub async fn add_route<F, Fut, T>(&mut self, path: &str, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);

        let handler = {
            let f = f.clone();
            move || {
                let f = f.clone();
                async move { Json(f().await) }
            }
        };

        let route = Router::new().route("/", get(handler));

        let mut r = self.router.write().await;
        *r = std::mem::take(&mut *r).nest(path, route);
    }

    /// Add a new router safely:
    /// - If `path` starts with '/', it is merged at root level.
    /// - Otherwise, it is nested under the given subpath.
    pub async fn add_router(&mut self, path: &str, route: Router) {
        let mut r = self.router.write().await;

        // Take current router without losing content
        let current = std::mem::take(&mut *r);

        let combined = if path.starts_with('/') {
            // Absolute path => merge directly at root
            tracing::debug!("Merging router at root path: {}", path);
            current.merge(route)
        } else {
            // Relative path => nest under the given path
            let normalized = format!("/{}", path.trim_start_matches('/'));
            tracing::debug!("Nesting router under: {}", normalized);
            current.nest(&normalized, route)
        };

        *r = combined;
    }

    /// Monte l'interface Swagger et le document OpenAPI.
    pub async fn add_openapi(&mut self, openapi: utoipa::openapi::OpenApi) {
        let swagger = SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi);
        let mut r = self.router.write().await;
        *r = std::mem::take(&mut *r).merge(swagger);
    }

    /// Démarre le serveur en arrière-plan.
    ///
    /// Le routeur courant est figé : les routes ajoutées ensuite ne seront
    /// pas servies.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let router = std::mem::take(&mut *self.router.write().await);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!(
            server = %self.name,
            %addr,
            base_url = %self.base_url,
            "HTTP server listening"
        );

        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await
            {
                tracing::error!(server = %name, error = %e, "HTTP server error");
            }
        });
        self.join_handle = Some(handle);
        Ok(())
    }

    /// Attend l'arrêt du serveur (Ctrl+C ou erreur fatale).
    pub async fn wait(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }

    /// Démarre puis attend : le mode habituel du binaire.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.start().await?;
        self.wait().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("Shutdown signal received, closing HTTP server");
}
