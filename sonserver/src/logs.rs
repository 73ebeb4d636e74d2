//! Initialisation du logging tracing depuis la configuration.

use sonconfig::get_config;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Options de logging, issues de la configuration ou surchargées à la main.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Niveau minimum (TRACE, DEBUG, INFO, WARN, ERROR)
    pub min_level: String,
    pub enable_console: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        let config = get_config();
        Self {
            min_level: config.get_log_min_level(),
            enable_console: config.get_log_enable_console(),
        }
    }
}

/// Installe le subscriber global.
///
/// `RUST_LOG` a priorité sur le niveau configuré. À appeler une seule fois,
/// au démarrage du binaire.
pub fn init_logging(options: LoggingOptions) {
    if !options.enable_console {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.min_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    info!(min_level = %options.min_level, "Logging initialized");
}
