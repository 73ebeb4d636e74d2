//! Réglages de piste et résolution du mode de lecture
//!
//! Les réglages sont des instantanés pris par valeur au chargement d'un
//! thème : une modification à chaud passe par un rechargement explicite du
//! thème, jamais par une mutation partagée.

use serde::{Deserialize, Serialize};

/// Mode de lecture d'une piste.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Classement automatique selon la durée du fichier
    #[default]
    Auto,
    /// Lecture en boucle permanente (nappe de fond)
    Continuous,
    /// Lectures ponctuelles espacées (cris d'oiseaux, tonnerre)
    Sparse,
    /// Présence modulée par fondus lents actifs/inactifs
    Presence,
}

/// Réglages d'une piste au sein d'un thème.
///
/// Persistés par le fournisseur de thèmes, consommés en lecture seule par le
/// moteur.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackSettings {
    /// Gain linéaire dans [0, 1]
    pub volume: f32,
    /// Cadran de fréquence dans [0, 1] : intervalle entre lectures en mode
    /// sparse, rapport actif/inactif en mode presence
    pub presence: f32,
    pub playback_mode: PlaybackMode,
    /// Boucle tête-à-queue sans fondu si vrai, fondu de boucle sinon
    pub seamless_loop: bool,
    /// Participe à la coordination d'exclusion mutuelle
    pub exclusive: bool,
    /// Contribue du silence et saute tout décodage
    pub muted: bool,
}

impl Default for TrackSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            presence: 0.5,
            playback_mode: PlaybackMode::Auto,
            seamless_loop: false,
            exclusive: false,
            muted: false,
        }
    }
}

impl TrackSettings {
    /// Applique une surcouche partielle (préréglage) sur ces réglages.
    pub fn apply(&mut self, patch: &TrackSettingsPatch) {
        if let Some(volume) = patch.volume {
            self.volume = volume.clamp(0.0, 1.0);
        }
        if let Some(presence) = patch.presence {
            self.presence = presence.clamp(0.0, 1.0);
        }
        if let Some(mode) = patch.playback_mode {
            self.playback_mode = mode;
        }
        if let Some(seamless) = patch.seamless_loop {
            self.seamless_loop = seamless;
        }
        if let Some(exclusive) = patch.exclusive {
            self.exclusive = exclusive;
        }
        if let Some(muted) = patch.muted {
            self.muted = muted;
        }
    }

    /// Retourne une copie avec la surcouche appliquée.
    pub fn overlaid(mut self, patch: &TrackSettingsPatch) -> Self {
        self.apply(patch);
        self
    }
}

/// Surcouche partielle de réglages, typiquement issue d'un préréglage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackSettingsPatch {
    pub volume: Option<f32>,
    pub presence: Option<f32>,
    pub playback_mode: Option<PlaybackMode>,
    pub seamless_loop: Option<bool>,
    pub exclusive: Option<bool>,
    pub muted: Option<bool>,
}

/// Paramètres d'ordonnancement d'un thème, en secondes.
///
/// Tous configurables par thème ; les valeurs par défaut correspondent à la
/// configuration globale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeTuning {
    /// Durée à partir de laquelle un fichier en mode auto devient continuous
    pub long_file_threshold_s: f64,
    /// Durée en dessous de laquelle un fichier en mode auto devient sparse
    pub short_file_threshold_s: f64,
    /// Intervalle moyen entre lectures sparse à presence = 1
    pub sparse_min_interval_s: f64,
    /// Intervalle moyen entre lectures sparse à presence = 0
    pub sparse_max_interval_s: f64,
    /// Demi-amplitude relative du tirage d'intervalle (0.3 = ±30 %)
    pub sparse_variance: f64,
    /// Report minimal de la première activation sparse d'une piste exclusive
    pub sparse_startup_delay_s: f64,
    /// Silence minimal après la fin d'une lecture exclusive
    pub min_gap_after_exclusive_s: f64,
    /// Plancher d'activation exclusive après le chargement du thème
    pub initial_exclusive_delay_s: f64,
    /// Période du cycle actif/inactif en mode presence
    pub presence_period_s: f64,
    /// Durée des fondus d'entrée/sortie en mode presence
    pub presence_fade_s: f64,
    /// Fenêtre du fondu de boucle des pistes continuous non seamless
    pub loop_crossfade_s: f64,
}

impl Default for ThemeTuning {
    fn default() -> Self {
        Self {
            long_file_threshold_s: 60.0,
            short_file_threshold_s: 10.0,
            sparse_min_interval_s: 180.0,
            sparse_max_interval_s: 1800.0,
            sparse_variance: 0.3,
            sparse_startup_delay_s: 60.0,
            min_gap_after_exclusive_s: 30.0,
            initial_exclusive_delay_s: 60.0,
            presence_period_s: 90.0,
            presence_fade_s: 10.0,
            loop_crossfade_s: 1.5,
        }
    }
}

/// Résout le mode de lecture effectif d'une piste.
///
/// Le mode `Auto` est classé selon la durée du fichier :
/// - durée ≥ `long_file_threshold_s` → `Continuous`
/// - durée ≤ `short_file_threshold_s` → `Sparse`
/// - sinon (y compris durée inconnue) → `Continuous`
pub fn resolve_playback_mode(
    requested: PlaybackMode,
    duration_s: Option<f64>,
    tuning: &ThemeTuning,
) -> PlaybackMode {
    match requested {
        PlaybackMode::Auto => match duration_s {
            Some(d) if d >= tuning.long_file_threshold_s => PlaybackMode::Continuous,
            Some(d) if d <= tuning.short_file_threshold_s => PlaybackMode::Sparse,
            // Durées intermédiaires ou inconnues : matériau de fond
            _ => PlaybackMode::Continuous,
        },
        explicit => explicit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_classification() {
        let tuning = ThemeTuning::default();
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Auto, Some(120.0), &tuning),
            PlaybackMode::Continuous
        );
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Auto, Some(5.0), &tuning),
            PlaybackMode::Sparse
        );
        // Les durées intermédiaires restent du matériau de fond
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Auto, Some(30.0), &tuning),
            PlaybackMode::Continuous
        );
        // Durée inconnue : continuous par défaut
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Auto, None, &tuning),
            PlaybackMode::Continuous
        );
    }

    #[test]
    fn test_auto_classification_honors_custom_thresholds() {
        // Un thème qui classe ses one-shots jusqu'à 50 s : le fichier de
        // 40 s bascule en sparse alors qu'il serait continuous par défaut.
        let tuning = ThemeTuning {
            long_file_threshold_s: 300.0,
            short_file_threshold_s: 50.0,
            ..Default::default()
        };
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Auto, Some(40.0), &tuning),
            PlaybackMode::Sparse
        );
        // À partir du seuil long c'est une nappe
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Auto, Some(300.0), &tuning),
            PlaybackMode::Continuous
        );
        // Entre les deux seuils : continuous par défaut
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Auto, Some(299.0), &tuning),
            PlaybackMode::Continuous
        );
        // En cas de seuils qui se chevauchent, le seuil long prime
        let overlapping = ThemeTuning {
            long_file_threshold_s: 20.0,
            short_file_threshold_s: 50.0,
            ..Default::default()
        };
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Auto, Some(30.0), &overlapping),
            PlaybackMode::Continuous
        );
    }

    #[test]
    fn test_explicit_mode_wins() {
        let tuning = ThemeTuning::default();
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Sparse, Some(600.0), &tuning),
            PlaybackMode::Sparse
        );
        assert_eq!(
            resolve_playback_mode(PlaybackMode::Presence, Some(2.0), &tuning),
            PlaybackMode::Presence
        );
    }

    #[test]
    fn test_patch_overlay() {
        let base = TrackSettings::default();
        let patch = TrackSettingsPatch {
            volume: Some(0.25),
            muted: Some(true),
            ..Default::default()
        };
        let merged = base.overlaid(&patch);
        assert_eq!(merged.volume, 0.25);
        assert!(merged.muted);
        // Les champs absents du patch sont inchangés
        assert_eq!(merged.presence, base.presence);
        assert_eq!(merged.playback_mode, base.playback_mode);
    }

    #[test]
    fn test_patch_clamps_ranges() {
        let base = TrackSettings::default();
        let patch = TrackSettingsPatch {
            volume: Some(3.0),
            presence: Some(-1.0),
            ..Default::default()
        };
        let merged = base.overlaid(&patch);
        assert_eq!(merged.volume, 1.0);
        assert_eq!(merged.presence, 0.0);
    }

    #[test]
    fn test_settings_yaml_roundtrip() {
        let yaml = "volume: 0.8\nplayback_mode: sparse\nexclusive: true\n";
        let settings: TrackSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.playback_mode, PlaybackMode::Sparse);
        assert!(settings.exclusive);
        assert!((settings.volume - 0.8).abs() < 1e-6);
        // Champs omis : valeurs par défaut
        assert!(!settings.muted);
    }
}
