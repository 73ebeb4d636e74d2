//! # Module Server - API de haut niveau pour Axum
//!
//! Ce module fournit une abstraction simple pour créer le serveur HTTP de
//! Sonorium avec Axum, en cachant la configuration et le routage :
//!
//! - Routes JSON simples avec `add_route()`
//! - Routeurs complets (surface de contrôle, flux audio) avec `add_router()`
//! - Documentation OpenAPI/Swagger avec `add_openapi()`
//! - Arrêt propre sur Ctrl+C

pub mod logs;
mod server;

pub use logs::{init_logging, LoggingOptions};
pub use server::{Server, ServerInfo};
