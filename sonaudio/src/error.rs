//! Erreurs du moteur audio

use thiserror::Error;

/// Erreurs pouvant survenir dans le moteur de mixage.
///
/// Les erreurs de décodage sont récupérées localement (piste silencieuse) et
/// n'atteignent jamais le mixeur ni les auditeurs ; elles ne remontent que
/// dans les diagnostics du thème.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Un fichier source est illisible ou corrompu
    #[error("Cannot decode '{path}': {reason}")]
    DecodeFailure { path: String, reason: String },

    /// L'ouverture d'un décodeur a dépassé le délai imparti
    #[error("Opening decoder for '{path}' timed out after {timeout_s:.1}s")]
    DecodeOpenTimeout { path: String, timeout_s: f64 },

    /// Aucun backend de décodage utilisable au démarrage (fatal)
    #[error("No usable decoder backend: {0}")]
    FatalDecoderInit(String),

    /// Aucune piste lisible dans le thème : le chargement échoue
    #[error("Theme '{0}' has no readable audio track")]
    NoReadableTracks(String),
}

impl EngineError {
    pub fn decode_failure(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::DecodeFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
