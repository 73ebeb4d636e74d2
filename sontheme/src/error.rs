use thiserror::Error;

/// Errors of the theme supply layer, rejected before any engine state
/// changes.
#[derive(Error, Debug)]
pub enum ThemeError {
    #[error("Unknown theme '{0}'")]
    UnknownTheme(String),

    #[error("Unknown preset '{preset}' for theme '{theme}'")]
    UnknownPreset { theme: String, preset: String },

    #[error("Cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid sidecar '{path}': {reason}")]
    InvalidSidecar { path: String, reason: String },
}
