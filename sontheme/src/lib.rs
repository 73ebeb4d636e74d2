//! Theme supply for the Sonorium engine.
//!
//! A theme is a folder of audio files plus per-file track settings and named
//! presets. This crate defines the supplier contract the engine consumes
//! ([`ThemeSupplier`]) and a folder-backed implementation
//! ([`ThemeLibrary`]) with a YAML sidecar per theme. The engine never
//! watches the filesystem: reloads are explicit.

mod error;
mod library;

use std::collections::HashMap;

use sonaudio::{ThemeTuning, TrackSettingsPatch, TrackSource};

pub use error::ThemeError;
pub use library::ThemeLibrary;

/// Partial settings overlay keyed by track file name.
pub type PresetOverlay = HashMap<String, TrackSettingsPatch>;

/// Summary of an available theme.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ThemeInfo {
    pub name: String,
    pub track_count: usize,
    pub presets: Vec<String>,
}

/// Read-only contract between the engine and the theme collaborator.
pub trait ThemeSupplier: Send + Sync {
    /// Every known theme, sorted by name.
    fn list_themes(&self) -> Vec<ThemeInfo>;

    /// Ordered list of a theme's files with their settings snapshots.
    fn list_files(&self, theme: &str) -> Result<Vec<TrackSource>, ThemeError>;

    /// Partial settings map of a named preset.
    fn preset_overlay(&self, theme: &str, preset: &str) -> Result<PresetOverlay, ThemeError>;

    /// Theme-level scheduling options.
    fn tuning(&self, theme: &str) -> Result<ThemeTuning, ThemeError>;

    /// Re-read the underlying store. In-memory suppliers have nothing to do.
    fn reload(&self) -> Result<(), ThemeError> {
        Ok(())
    }
}

/// Apply a preset overlay onto a track list, matching by file name.
pub fn apply_overlay(sources: &mut [TrackSource], overlay: &PresetOverlay) {
    for source in sources.iter_mut() {
        let Some(name) = source.path.file_name().map(|n| n.to_string_lossy().to_string())
        else {
            continue;
        };
        if let Some(patch) = overlay.get(&name) {
            source.settings.apply(patch);
        }
    }
}
