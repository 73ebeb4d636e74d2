//! Folder-backed theme library.
//!
//! Layout on disk:
//!
//! ```text
//! themes/
//! ├── forest/
//! │   ├── rain.flac
//! │   ├── birds.flac
//! │   └── sonorium.yaml      # optional sidecar
//! └── ocean/
//!     └── waves.mp3
//! ```
//!
//! The sidecar carries per-track settings, named presets and theme-level
//! scheduling options:
//!
//! ```yaml
//! tracks:
//!   rain.flac:
//!     playback_mode: continuous
//!     seamless_loop: true
//!   thunder.flac:
//!     playback_mode: sparse
//!     exclusive: true
//! presets:
//!   night:
//!     rain.flac:
//!       volume: 0.3
//! tuning:
//!   presence_period_s: 120
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;
use sonaudio::{ThemeTuning, TrackSettings, TrackSettingsPatch, TrackSource};
use tracing::{debug, info, warn};

use crate::{PresetOverlay, ThemeError, ThemeInfo, ThemeSupplier};

/// File name of the per-theme sidecar.
const SIDECAR_NAME: &str = "sonorium.yaml";

/// Extensions the decoding stack accepts.
const AUDIO_EXTENSIONS: &[&str] = &[
    "flac", "mp3", "ogg", "oga", "opus", "wav", "aiff", "aif", "m4a",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Sidecar {
    tracks: HashMap<String, TrackSettings>,
    presets: HashMap<String, HashMap<String, TrackSettingsPatch>>,
    /// Absent : le thème hérite du tuning par défaut de la bibliothèque
    tuning: Option<ThemeTuning>,
}

#[derive(Debug)]
struct ThemeFolder {
    tracks: Vec<TrackSource>,
    presets: HashMap<String, PresetOverlay>,
    tuning: ThemeTuning,
}

/// Scans a directory of theme folders. Each sub-directory is one theme.
pub struct ThemeLibrary {
    root: PathBuf,
    default_tuning: ThemeTuning,
    themes: RwLock<HashMap<String, ThemeFolder>>,
}

impl ThemeLibrary {
    /// Build the library and run the initial scan.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ThemeError> {
        Self::with_default_tuning(root, ThemeTuning::default())
    }

    /// Build the library with process-wide scheduling defaults; a theme
    /// sidecar carrying a `tuning` section still overrides them.
    pub fn with_default_tuning(
        root: impl Into<PathBuf>,
        default_tuning: ThemeTuning,
    ) -> Result<Self, ThemeError> {
        let library = Self {
            root: root.into(),
            default_tuning,
            themes: RwLock::new(HashMap::new()),
        };
        library.reload()?;
        Ok(library)
    }

    /// Rescan the themes directory. Explicit only; there is no watcher.
    pub fn reload(&self) -> Result<(), ThemeError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ThemeError::Io {
            path: self.root.display().to_string(),
            source,
        })?;

        let mut themes = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            match Self::scan_theme(&path, &self.default_tuning) {
                Ok(folder) => {
                    debug!(theme = %name, tracks = folder.tracks.len(), "Scanned theme");
                    themes.insert(name, folder);
                }
                Err(error) => {
                    warn!(theme = %name, %error, "Skipping unreadable theme folder");
                }
            }
        }

        info!(root = %self.root.display(), themes = themes.len(), "Theme library loaded");
        *self.themes.write().unwrap() = themes;
        Ok(())
    }

    fn scan_theme(dir: &Path, default_tuning: &ThemeTuning) -> Result<ThemeFolder, ThemeError> {
        let sidecar_path = dir.join(SIDECAR_NAME);
        let sidecar = if sidecar_path.exists() {
            let raw = fs::read_to_string(&sidecar_path).map_err(|source| ThemeError::Io {
                path: sidecar_path.display().to_string(),
                source,
            })?;
            serde_yaml::from_str::<Sidecar>(&raw).map_err(|e| ThemeError::InvalidSidecar {
                path: sidecar_path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            Sidecar::default()
        };

        let entries = fs::read_dir(dir).map_err(|source| ThemeError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut tracks = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !is_audio_file(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let settings = sidecar.tracks.get(&name).copied().unwrap_or_default();
            tracks.push(TrackSource { path, settings });
        }
        // Ordre stable pour un mixage déterministe
        tracks.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(ThemeFolder {
            tracks,
            presets: sidecar.presets,
            tuning: sidecar.tuning.unwrap_or_else(|| default_tuning.clone()),
        })
    }
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

impl ThemeSupplier for ThemeLibrary {
    fn list_themes(&self) -> Vec<ThemeInfo> {
        let themes = self.themes.read().unwrap();
        let mut infos: Vec<ThemeInfo> = themes
            .iter()
            .map(|(name, folder)| {
                let mut presets: Vec<String> = folder.presets.keys().cloned().collect();
                presets.sort();
                ThemeInfo {
                    name: name.clone(),
                    track_count: folder.tracks.len(),
                    presets,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn list_files(&self, theme: &str) -> Result<Vec<TrackSource>, ThemeError> {
        let themes = self.themes.read().unwrap();
        themes
            .get(theme)
            .map(|folder| folder.tracks.clone())
            .ok_or_else(|| ThemeError::UnknownTheme(theme.to_string()))
    }

    fn preset_overlay(&self, theme: &str, preset: &str) -> Result<PresetOverlay, ThemeError> {
        let themes = self.themes.read().unwrap();
        let folder = themes
            .get(theme)
            .ok_or_else(|| ThemeError::UnknownTheme(theme.to_string()))?;
        folder
            .presets
            .get(preset)
            .cloned()
            .ok_or_else(|| ThemeError::UnknownPreset {
                theme: theme.to_string(),
                preset: preset.to_string(),
            })
    }

    fn tuning(&self, theme: &str) -> Result<ThemeTuning, ThemeError> {
        let themes = self.themes.read().unwrap();
        themes
            .get(theme)
            .map(|folder| folder.tuning.clone())
            .ok_or_else(|| ThemeError::UnknownTheme(theme.to_string()))
    }

    fn reload(&self) -> Result<(), ThemeError> {
        ThemeLibrary::reload(self)
    }
}
