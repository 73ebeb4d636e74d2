//! Contrat de décodage
//!
//! Le moteur ne connaît les fichiers sources qu'à travers ces deux traits :
//! un décodeur pull-based produisant des frames stéréo f32 à la cadence
//! canonique, et une fabrique ouvrant un décodeur pour un chemin donné.
//!
//! Un [`crate::RecordingPlayer`] peut détenir deux instances simultanées du
//! même fichier (décodeur principal + bras de fondu de boucle). Les tests du
//! moteur fournissent leurs propres implémentations synthétiques, ce qui rend
//! tout le chemin audio testable hors ligne.

use std::path::Path;

use crate::{EngineError, Frame};

/// Description d'un flux décodé, déjà ramené à la cadence canonique.
#[derive(Debug, Clone)]
pub struct DecoderInfo {
    /// Cadence de sortie (canonique)
    pub sample_rate: u32,
    /// Cadence du fichier source avant rééchantillonnage
    pub source_sample_rate: u32,
    /// Nombre de canaux du fichier source
    pub channels: u16,
    /// Durée en frames à la cadence canonique, si connue du conteneur
    pub duration_frames: Option<u64>,
}

impl DecoderInfo {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration_frames
            .map(|frames| frames as f64 / self.sample_rate as f64)
    }
}

/// Décodeur streaming synchrone.
pub trait Decoder: Send {
    fn info(&self) -> &DecoderInfo;

    /// Remplit `out` et retourne le nombre de frames écrites.
    ///
    /// Un retour de 0 signifie la fin du fichier ; `rewind` permet alors de
    /// reboucler. Une erreur est définitive pour cette instance.
    fn read(&mut self, out: &mut [Frame]) -> Result<usize, EngineError>;

    /// Repositionne le flux au tout début du fichier.
    fn rewind(&mut self) -> Result<(), EngineError>;
}

/// Fabrique de décodeurs.
///
/// L'implémentation de production ([`crate::MediaDecoderFactory`]) borne la
/// durée d'ouverture ; un dépassement est traité comme un échec de décodage.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Decoder>, EngineError>;
}
