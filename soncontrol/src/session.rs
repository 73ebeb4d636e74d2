//! Session registry and controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sonaudio::{DecoderFactory, MixerOptions};
use sonstream::{ChannelPool, ChannelSnapshot};
use sontheme::{apply_overlay, ThemeSupplier};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{ControlError, TransportAction, TransportEvent, TransportEventBus};

/// Engine-wide settings the controller needs to build mixers and URLs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sample_rate: u32,
    /// Base URL announced to speakers, e.g. `http://192.168.1.10:8171`
    pub base_url: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            base_url: "http://127.0.0.1:8171".to_string(),
        }
    }
}

/// Desired state of one session, as given by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSpec {
    pub theme: String,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub speakers: Vec<String>,
}

fn default_volume() -> f32 {
    1.0
}

/// Partial update of a playing or stopped session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdate {
    pub theme: Option<String>,
    /// `Some(None)` clears the preset
    pub preset: Option<Option<String>>,
    pub volume: Option<f32>,
    pub speakers: Option<Vec<String>>,
}

/// One external binding of {theme, preset, speakers, volume, play state}.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub theme: String,
    pub preset: Option<String>,
    pub volume: f32,
    pub speakers: Vec<String>,
    pub playing: bool,
    pub channel_id: Option<usize>,
}

/// Drives sessions onto pool channels and announces transport intents.
pub struct SessionController {
    pool: Arc<ChannelPool>,
    themes: Arc<dyn ThemeSupplier>,
    factory: Arc<dyn DecoderFactory>,
    events: TransportEventBus,
    settings: EngineSettings,
    sessions: Mutex<HashMap<Uuid, Session>>,
    master_gain: Mutex<f32>,
}

impl SessionController {
    pub fn new(
        pool: Arc<ChannelPool>,
        themes: Arc<dyn ThemeSupplier>,
        factory: Arc<dyn DecoderFactory>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            pool,
            themes,
            factory,
            events: TransportEventBus::new(),
            settings,
            sessions: Mutex::new(HashMap::new()),
            master_gain: Mutex::new(1.0),
        }
    }

    pub fn events(&self) -> &TransportEventBus {
        &self.events
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn themes(&self) -> &Arc<dyn ThemeSupplier> {
        &self.themes
    }

    pub fn create_session(&self, spec: SessionSpec) -> Session {
        let session = Session {
            id: Uuid::new_v4(),
            theme: spec.theme,
            preset: spec.preset,
            volume: spec.volume.clamp(0.0, 1.0),
            speakers: spec.speakers,
            playing: false,
            channel_id: None,
        };
        info!(session = %session.id, theme = %session.theme, "Session created");
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
        session
    }

    pub fn get_session(&self, id: Uuid) -> Result<Session, ControlError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ControlError::UnknownSession(id))
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.lock().unwrap().values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Start (or restart) a session: resolve its theme and preset, obtain a
    /// channel from the pool, load the mixer onto it and announce the stream
    /// URL to the transports.
    ///
    /// Re-playing a session already bound to a channel triggers a theme
    /// transition on that same channel.
    pub async fn play(&self, id: Uuid) -> Result<usize, ControlError> {
        let session = self.get_session(id)?;

        // Résolution avant toute modification d'état
        let mut sources = self.themes.list_files(&session.theme)?;
        if let Some(preset) = session.preset.as_deref() {
            let overlay = self.themes.preset_overlay(&session.theme, preset)?;
            apply_overlay(&mut sources, &overlay);
        }
        let tuning = self.themes.tuning(&session.theme)?;

        let channel = self.pool.assign_or_reuse(id)?;
        let master_gain = *self.master_gain.lock().unwrap();
        let options = MixerOptions {
            sample_rate: self.settings.sample_rate,
            master_gain: session.volume * master_gain,
            seed: id.as_u128() as u64,
            tuning,
        };
        channel
            .load_theme(
                session.theme.clone(),
                sources,
                Arc::clone(&self.factory),
                options,
            )
            .await?;

        let channel_id = channel.id();
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get_mut(&id) {
                session.playing = true;
                session.channel_id = Some(channel_id);
            }
        }

        self.events.broadcast(TransportEvent {
            session_id: id,
            action: TransportAction::Play,
            stream_url: self.stream_url(channel_id),
            speaker_targets: session.speakers.clone(),
        });
        info!(session = %id, channel = channel_id, theme = %session.theme, "Session playing");
        Ok(channel_id)
    }

    /// Stop a session: unbind it from its channel (the idle reaper frees the
    /// channel once the last listener leaves) and announce the stop.
    pub fn stop(&self, id: Uuid) -> Result<(), ControlError> {
        let session = self.get_session(id)?;
        self.pool.release(id);
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get_mut(&id) {
                session.playing = false;
                session.channel_id = None;
            }
        }
        self.events.broadcast(TransportEvent {
            session_id: id,
            action: TransportAction::Stop,
            stream_url: session
                .channel_id
                .map(|c| self.stream_url(c))
                .unwrap_or_default(),
            speaker_targets: session.speakers,
        });
        info!(session = %id, "Session stopped");
        Ok(())
    }

    /// Update a session. A playing session is re-played on its channel,
    /// which crossfades into the new theme or settings.
    pub async fn update(&self, id: Uuid, update: SessionUpdate) -> Result<Session, ControlError> {
        let playing = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&id)
                .ok_or(ControlError::UnknownSession(id))?;
            if let Some(theme) = update.theme {
                session.theme = theme;
            }
            if let Some(preset) = update.preset {
                session.preset = preset;
            }
            if let Some(volume) = update.volume {
                session.volume = volume.clamp(0.0, 1.0);
            }
            if let Some(speakers) = update.speakers {
                session.speakers = speakers;
            }
            session.playing
        };

        if playing {
            self.play(id).await?;
        }
        self.get_session(id)
    }

    /// Remove a session entirely, releasing its channel binding.
    pub fn remove_session(&self, id: Uuid) -> Result<(), ControlError> {
        let removed = self.sessions.lock().unwrap().remove(&id);
        match removed {
            Some(session) => {
                self.pool.release(id);
                debug!(session = %id, theme = %session.theme, "Session removed");
                Ok(())
            }
            None => Err(ControlError::UnknownSession(id)),
        }
    }

    /// Process-wide master gain, combined with each session's volume.
    pub fn set_master_gain(&self, gain: f32) {
        let gain = gain.max(0.0);
        *self.master_gain.lock().unwrap() = gain;
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            if let Some(channel_id) = session.channel_id {
                if let Ok(channel) = self.pool.get(channel_id) {
                    channel.set_master_gain(session.volume * gain);
                }
            }
        }
        info!(gain, "Master gain updated");
    }

    pub fn master_gain(&self) -> f32 {
        *self.master_gain.lock().unwrap()
    }

    /// Control-surface direct load: put a theme on a specific channel,
    /// outside of any session. Rejected before any state change when the
    /// theme or preset is unknown.
    pub async fn load_channel_theme(
        &self,
        channel_id: usize,
        theme: &str,
        preset: Option<&str>,
    ) -> Result<ChannelSnapshot, ControlError> {
        let mut sources = self.themes.list_files(theme)?;
        if let Some(preset) = preset {
            let overlay = self.themes.preset_overlay(theme, preset)?;
            apply_overlay(&mut sources, &overlay);
        }
        let tuning = self.themes.tuning(theme)?;

        let channel = self.pool.get(channel_id)?;
        let options = MixerOptions {
            sample_rate: self.settings.sample_rate,
            master_gain: *self.master_gain.lock().unwrap(),
            seed: (channel_id as u64) << 32 | channel.version(),
            tuning,
        };
        channel
            .load_theme(theme.to_string(), sources, Arc::clone(&self.factory), options)
            .await?;
        Ok(channel.snapshot())
    }

    /// Control-surface direct stop of a channel.
    pub fn stop_channel(&self, channel_id: usize) -> Result<ChannelSnapshot, ControlError> {
        let channel = self.pool.get(channel_id)?;
        channel.stop();
        Ok(channel.snapshot())
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.pool.snapshot()
    }

    pub fn stream_url(&self, channel_id: usize) -> String {
        format!(
            "{}/channel_stream/{}",
            self.settings.base_url.trim_end_matches('/'),
            channel_id
        )
    }
}
