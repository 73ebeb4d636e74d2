#![doc = r#"
SonAudio - Moteur de mixage ambiant temps réel

Cette crate fournit le cœur temps réel de Sonorium : le décodage des fichiers
sources, les machines à états de lecture par piste, la coordination des pistes
exclusives et le mixage en continu d'un thème vers un flux PCM stéréo f32.

# Architecture

Le moteur est entièrement **pull-based** et synchrone : chaque composant
expose une méthode de production (`read`, `mix_into`, `pull`) remplissant un
buffer de frames `[f32; 2]` à la cadence canonique. Le haut de la chaîne
(le canal, dans `sonstream`) cadence les tirages ; aucun temps mur n'entre
dans le chemin audio.

```text
Fichier source → RecordingPlayer → ThemeMixer → pull(n) → [f32; 2] × n
                      ↑                  ↑
              DecoderFactory    ExclusionCoordinator
```

# Horloge

Chaque [`ThemeMixer`] possède une [`FrameClock`] monotone initialisée à 0 à
l'instanciation. Les players, le coordinateur d'exclusion et les transitions
lisent tous le temps depuis ce compteur, converti en secondes par
`frames / sample_rate`. Le moteur est ainsi déterministe et testable hors
ligne avec une graine RNG fixée.

# Erreurs

Les erreurs de décodage ne traversent jamais le mixeur : une piste illisible
est journalisée une fois, désactivée pour la durée du thème et remplacée par
du silence. Seule l'absence totale de piste lisible fait échouer le
chargement d'un thème.
"#]

mod clock;
mod error;
mod exclusion;
mod fade;
mod frame;
mod mixer;
mod player;
mod resample;
mod settings;

pub mod decoder;
pub mod media_decoder;

pub use clock::FrameClock;
pub use error::EngineError;
pub use exclusion::{ExclusionCoordinator, PlayerId};
pub use fade::equal_power_gains;
pub use frame::{db_to_linear, linear_to_db, Frame, SILENT_FRAME};
pub use mixer::{DecodeDiagnostic, MixerOptions, ThemeMixer, TrackSource};
pub use player::RecordingPlayer;
pub use resample::LinearResampler;
pub use settings::{
    resolve_playback_mode, PlaybackMode, ThemeTuning, TrackSettings, TrackSettingsPatch,
};

pub use decoder::{Decoder, DecoderFactory, DecoderInfo};
pub use media_decoder::MediaDecoderFactory;
