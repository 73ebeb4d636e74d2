//! ThemeMixer : somme des players d'un thème vers un flux PCM unique
//!
//! Le mixeur expose `pull(out)` : il remplit `out` avec la somme des
//! contributions des players à la position courante puis avance son horloge
//! de `out.len()` frames. Il n'est jamais repositionné ; une pause se traduit
//! par l'absence de tirage.
//!
//! La marge de mixage est contrôlée par la normalisation `1/√(max(1, K))` où
//! `K` est le nombre de players dont la dernière frame produite avait une
//! enveloppe non nulle. Aucun écrêtage n'est fait ici : la saturation
//! n'intervient qu'à l'entrée de l'encodeur.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::decoder::DecoderFactory;
use crate::{
    EngineError, ExclusionCoordinator, Frame, FrameClock, RecordingPlayer, ThemeTuning,
    TrackSettings, SILENT_FRAME,
};

/// Une piste source : un fichier et ses réglages figés au chargement.
#[derive(Debug, Clone)]
pub struct TrackSource {
    pub path: PathBuf,
    pub settings: TrackSettings,
}

/// Options de construction d'un mixeur de thème.
#[derive(Debug, Clone)]
pub struct MixerOptions {
    /// Cadence canonique du moteur
    pub sample_rate: u32,
    /// Gain maître appliqué après normalisation
    pub master_gain: f32,
    /// Graine du générateur pseudo-aléatoire d'ordonnancement
    pub seed: u64,
    pub tuning: ThemeTuning,
}

impl Default for MixerOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            master_gain: 1.0,
            seed: 0,
            tuning: ThemeTuning::default(),
        }
    }
}

/// Trace d'un échec de décodage, exposée dans les diagnostics du canal.
#[derive(Debug, Clone, Serialize)]
pub struct DecodeDiagnostic {
    pub track: String,
    pub reason: String,
}

/// Mixeur temps réel d'un thème.
pub struct ThemeMixer {
    theme_ref: String,
    players: Vec<RecordingPlayer>,
    clock: Arc<FrameClock>,
    coordinator: Arc<ExclusionCoordinator>,
    master_gain: f32,
    load_failures: Vec<DecodeDiagnostic>,
}

impl ThemeMixer {
    /// Instancie les players du thème.
    ///
    /// Les pistes illisibles sont consignées et remplacées par du silence ;
    /// le chargement n'échoue que si aucune piste non muette n'est lisible.
    pub fn new(
        theme_ref: impl Into<String>,
        sources: Vec<TrackSource>,
        factory: Arc<dyn DecoderFactory>,
        options: MixerOptions,
    ) -> Result<Self, EngineError> {
        let theme_ref = theme_ref.into();
        let clock = Arc::new(FrameClock::new(options.sample_rate));
        let coordinator = Arc::new(ExclusionCoordinator::new(
            Arc::clone(&clock),
            options.tuning.min_gap_after_exclusive_s,
            options.tuning.initial_exclusive_delay_s,
        ));

        let mut players = Vec::with_capacity(sources.len());
        let mut load_failures = Vec::new();
        let mut readable = 0usize;

        for (index, source) in sources.into_iter().enumerate() {
            let label = source
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| source.path.display().to_string());
            let seed = options.seed.wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            match RecordingPlayer::new(
                index,
                source.path,
                source.settings,
                options.tuning.clone(),
                Arc::clone(&factory),
                Arc::clone(&clock),
                Arc::clone(&coordinator),
                seed,
            ) {
                Ok(player) => {
                    if !player.settings().muted {
                        readable += 1;
                    }
                    players.push(player);
                }
                Err(error) => {
                    warn!(theme = %theme_ref, track = %label, %error, "Track failed to load");
                    load_failures.push(DecodeDiagnostic {
                        track: label,
                        reason: error.to_string(),
                    });
                }
            }
        }

        if readable == 0 {
            return Err(EngineError::NoReadableTracks(theme_ref));
        }

        info!(
            theme = %theme_ref,
            tracks = players.len(),
            failed = load_failures.len(),
            "Theme mixer ready"
        );

        Ok(Self {
            theme_ref,
            players,
            clock,
            coordinator,
            master_gain: options.master_gain,
            load_failures,
        })
    }

    /// Produit les `out.len()` prochaines frames mixées et avance l'horloge.
    pub fn pull(&mut self, out: &mut [Frame]) {
        let n = out.len();
        out.fill(SILENT_FRAME);
        if n == 0 {
            return;
        }

        let mut active = 0usize;
        for player in &mut self.players {
            if player.mix_into(out) > 0.0 {
                active += 1;
            }
        }

        let normalization = if active > 1 {
            1.0 / (active as f32).sqrt()
        } else {
            1.0
        };
        let gain = normalization * self.master_gain;
        if (gain - 1.0).abs() > f32::EPSILON {
            for frame in out.iter_mut() {
                frame[0] *= gain;
                frame[1] *= gain;
            }
        }

        self.clock.advance(n as u64);
    }

    /// Position courante en frames depuis le chargement du thème.
    pub fn frame_position(&self) -> u64 {
        self.clock.frames()
    }

    pub fn seconds(&self) -> f64 {
        self.clock.seconds()
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    pub fn theme_ref(&self) -> &str {
        &self.theme_ref
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    pub fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain.max(0.0);
    }

    pub fn clock(&self) -> Arc<FrameClock> {
        Arc::clone(&self.clock)
    }

    pub fn coordinator(&self) -> Arc<ExclusionCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Nombre de players dont la dernière frame produite était audible.
    pub fn active_track_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| p.last_envelope() > 0.0)
            .count()
    }

    pub fn track_count(&self) -> usize {
        self.players.len()
    }

    /// Échecs de décodage du thème : pistes illisibles au chargement et
    /// pistes désactivées en cours de lecture. Une entrée par piste.
    pub fn failures(&self) -> Vec<DecodeDiagnostic> {
        let mut failures = self.load_failures.clone();
        for player in &self.players {
            if let Some(reason) = player.failure() {
                failures.push(DecodeDiagnostic {
                    track: player.label().to_string(),
                    reason: reason.to_string(),
                });
            }
        }
        failures
    }

    /// Accès aux players pour les diagnostics et les tests.
    pub fn players(&self) -> &[RecordingPlayer] {
        &self.players
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Decoder, DecoderInfo};
    use crate::{PlaybackMode, TrackSettings};
    use std::path::Path;

    struct ConstDecoder {
        info: DecoderInfo,
        value: f32,
        len: u64,
        pos: u64,
    }

    impl Decoder for ConstDecoder {
        fn info(&self) -> &DecoderInfo {
            &self.info
        }

        fn read(&mut self, out: &mut [Frame]) -> Result<usize, EngineError> {
            let remaining = (self.len - self.pos).min(out.len() as u64) as usize;
            for frame in out[..remaining].iter_mut() {
                *frame = [self.value, self.value];
            }
            self.pos += remaining as u64;
            Ok(remaining)
        }

        fn rewind(&mut self) -> Result<(), EngineError> {
            self.pos = 0;
            Ok(())
        }
    }

    /// Fabrique qui refuse les chemins finissant par `.bad`.
    struct ConstFactory {
        value: f32,
        len: u64,
    }

    impl DecoderFactory for ConstFactory {
        fn open(&self, path: &Path) -> Result<Box<dyn Decoder>, EngineError> {
            if path.extension().is_some_and(|e| e == "bad") {
                return Err(EngineError::decode_failure(path.display().to_string(), "truncated"));
            }
            Ok(Box::new(ConstDecoder {
                info: DecoderInfo {
                    sample_rate: 48_000,
                    source_sample_rate: 48_000,
                    channels: 2,
                    duration_frames: Some(self.len),
                },
                value: self.value,
                len: self.len,
                pos: 0,
            }))
        }
    }

    fn continuous_source(name: &str) -> TrackSource {
        TrackSource {
            path: PathBuf::from(name),
            settings: TrackSettings {
                playback_mode: PlaybackMode::Continuous,
                seamless_loop: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_single_track_passthrough() {
        let factory = Arc::new(ConstFactory {
            value: 0.5,
            len: 96_000,
        });
        let mut mixer = ThemeMixer::new(
            "forest",
            vec![continuous_source("bed.flac")],
            factory,
            MixerOptions::default(),
        )
        .unwrap();

        let mut out = vec![SILENT_FRAME; 4800];
        mixer.pull(&mut out);
        // Une seule piste active : pas de normalisation
        assert!((out[0][0] - 0.5).abs() < 1e-6);
        assert_eq!(mixer.frame_position(), 4800);
        assert_eq!(mixer.active_track_count(), 1);
    }

    #[test]
    fn test_normalization_scales_by_sqrt_of_active_count() {
        let factory = Arc::new(ConstFactory {
            value: 0.5,
            len: 96_000,
        });
        let sources = (0..4)
            .map(|i| continuous_source(&format!("bed{}.flac", i)))
            .collect();
        let mut mixer =
            ThemeMixer::new("forest", sources, factory, MixerOptions::default()).unwrap();

        let mut out = vec![SILENT_FRAME; 4800];
        mixer.pull(&mut out);
        // Somme 4 × 0.5 = 2.0, normalisée par 1/√4 = 0.5 → 1.0
        assert!((out[100][0] - 1.0).abs() < 1e-5, "got {}", out[100][0]);
        assert_eq!(mixer.active_track_count(), 4);
    }

    #[test]
    fn test_master_gain_applied_after_normalization() {
        let factory = Arc::new(ConstFactory {
            value: 0.5,
            len: 96_000,
        });
        let mut mixer = ThemeMixer::new(
            "forest",
            vec![continuous_source("bed.flac")],
            factory,
            MixerOptions {
                master_gain: 0.5,
                ..Default::default()
            },
        )
        .unwrap();

        let mut out = vec![SILENT_FRAME; 480];
        mixer.pull(&mut out);
        assert!((out[0][0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_muted_track_not_counted_as_active() {
        let factory = Arc::new(ConstFactory {
            value: 0.5,
            len: 96_000,
        });
        let mut muted = continuous_source("muted.flac");
        muted.settings.muted = true;
        let mut mixer = ThemeMixer::new(
            "forest",
            vec![continuous_source("bed.flac"), muted],
            factory,
            MixerOptions::default(),
        )
        .unwrap();

        let mut out = vec![SILENT_FRAME; 480];
        mixer.pull(&mut out);
        assert_eq!(mixer.active_track_count(), 1);
        // Pas de normalisation pour une seule piste audible
        assert!((out[0][0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_unreadable_track_is_silenced_with_one_diagnostic() {
        let factory = Arc::new(ConstFactory {
            value: 0.5,
            len: 96_000,
        });
        let mut mixer = ThemeMixer::new(
            "forest",
            vec![
                continuous_source("bed1.flac"),
                continuous_source("broken.bad"),
                continuous_source("bed2.flac"),
            ],
            factory,
            MixerOptions::default(),
        )
        .unwrap();

        let mut out = vec![SILENT_FRAME; 480];
        mixer.pull(&mut out);

        // Les deux pistes valides jouent normalement
        assert_eq!(mixer.active_track_count(), 2);
        let failures = mixer.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].track, "broken.bad");
    }

    #[test]
    fn test_all_tracks_unreadable_fails_load() {
        let factory = Arc::new(ConstFactory {
            value: 0.5,
            len: 96_000,
        });
        let result = ThemeMixer::new(
            "forest",
            vec![continuous_source("a.bad"), continuous_source("b.bad")],
            factory,
            MixerOptions::default(),
        );
        assert!(matches!(result, Err(EngineError::NoReadableTracks(_))));
    }

    #[test]
    fn test_clock_never_decreases() {
        let factory = Arc::new(ConstFactory {
            value: 0.1,
            len: 96_000,
        });
        let mut mixer = ThemeMixer::new(
            "forest",
            vec![continuous_source("bed.flac")],
            factory,
            MixerOptions::default(),
        )
        .unwrap();

        let mut last = 0;
        let mut out = vec![SILENT_FRAME; 123];
        for _ in 0..100 {
            mixer.pull(&mut out);
            let now = mixer.frame_position();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_determinism_with_fixed_seed() {
        // Deux mixeurs identiques avec la même graine produisent un flux
        // bit-identique, ordonnancement sparse compris.
        let build = || {
            let factory = Arc::new(ConstFactory {
                value: 0.8,
                len: 2400,
            });
            let sources = vec![TrackSource {
                path: PathBuf::from("oneshot.flac"),
                settings: TrackSettings {
                    playback_mode: PlaybackMode::Sparse,
                    presence: 1.0,
                    ..Default::default()
                },
            }];
            let options = MixerOptions {
                seed: 7,
                tuning: ThemeTuning {
                    sparse_min_interval_s: 0.1,
                    sparse_max_interval_s: 1.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            ThemeMixer::new("storm", sources, factory, options).unwrap()
        };

        let mut a = build();
        let mut b = build();
        let mut out_a = vec![SILENT_FRAME; 480];
        let mut out_b = vec![SILENT_FRAME; 480];
        for _ in 0..500 {
            a.pull(&mut out_a);
            b.pull(&mut out_b);
            assert_eq!(out_a, out_b);
        }
    }
}
