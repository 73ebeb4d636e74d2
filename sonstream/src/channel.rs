//! Channel: a persistent, theme-aware PCM producer.
//!
//! A channel keeps one ever-advancing frame stream alive across theme
//! changes. Loading a theme over a playing channel starts an equal-power
//! crossfade between the outgoing and incoming mixers; the swap happens
//! under the per-channel lock, so every attached listener observes the
//! transition at the same frame boundary. A further load while a transition
//! is running collapses it: the old outgoing mixer is dropped immediately
//! and the prior incoming becomes the new outgoing.
//!
//! One producer task per channel paces `produce_batch` at the canonical
//! rate and fans batches out to the listener registry with `try_send` only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sonaudio::{
    equal_power_gains, DecodeDiagnostic, DecoderFactory, Frame, MixerOptions, ThemeMixer,
    TrackSource, SILENT_FRAME,
};
use tokio::sync::Notify;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::listener::{spawn_listener, ListenerConfig, ListenerHandle};
use crate::{ListenerStream, PcmBatch, SessionId, StreamError};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Idle,
    Loading,
    Playing,
    Transitioning,
}

/// Static configuration shared by all channels of a pool.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub sample_rate: u32,
    pub bitrate_bps: u32,
    /// Theme transition crossfade window, seconds
    pub crossfade_window_s: f64,
    pub listener_buffer_s: f64,
    pub listener_dead_after_drop_s: f64,
    /// Producer batch duration, milliseconds
    pub batch_ms: u64,
    pub listener_pcm_queue: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            bitrate_bps: 128_000,
            crossfade_window_s: 3.0,
            listener_buffer_s: 2.0,
            listener_dead_after_drop_s: 10.0,
            batch_ms: 100,
            listener_pcm_queue: 8,
        }
    }
}

impl ChannelConfig {
    pub fn batch_frames(&self) -> usize {
        (self.sample_rate as u64 * self.batch_ms / 1000).max(1) as usize
    }

    fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            sample_rate: self.sample_rate,
            channels: 2,
            bitrate_bps: self.bitrate_bps,
            buffer_s: self.listener_buffer_s,
            dead_after_s: self.listener_dead_after_drop_s,
            pcm_queue: self.listener_pcm_queue,
        }
    }
}

/// Point-in-time view of a channel for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub channel_id: usize,
    pub state: ChannelState,
    pub current_theme_ref: Option<String>,
    pub version: u64,
    pub listener_count: usize,
    pub frame_position: u64,
    pub decode_failures: Vec<DecodeDiagnostic>,
}

struct ChannelCore {
    state: ChannelState,
    /// The authoritative mixer (the incoming one during a transition)
    live: Option<ThemeMixer>,
    /// Only set while `state == Transitioning`
    outgoing: Option<ThemeMixer>,
    fade_pos: u64,
    fade_window: u64,
    version: u64,
    listeners: Vec<ListenerHandle>,
    bound_session: Option<SessionId>,
    last_detach: Option<Instant>,
    scratch_outgoing: Vec<Frame>,
}

impl ChannelCore {
    /// Mix the next batch into `out`. Called with the channel lock held so
    /// that theme swaps are atomic with respect to production.
    fn produce(&mut self, out: &mut [Frame]) {
        match self.state {
            ChannelState::Idle | ChannelState::Loading => out.fill(SILENT_FRAME),
            ChannelState::Playing => {
                if let Some(mixer) = self.live.as_mut() {
                    mixer.pull(out);
                } else {
                    out.fill(SILENT_FRAME);
                }
            }
            ChannelState::Transitioning => {
                let n = out.len();
                if let Some(mixer) = self.live.as_mut() {
                    mixer.pull(out);
                } else {
                    out.fill(SILENT_FRAME);
                }

                if self.scratch_outgoing.len() < n {
                    self.scratch_outgoing.resize(n, SILENT_FRAME);
                }
                if let Some(mixer) = self.outgoing.as_mut() {
                    mixer.pull(&mut self.scratch_outgoing[..n]);
                } else {
                    self.scratch_outgoing[..n].fill(SILENT_FRAME);
                }

                for j in 0..n {
                    let (gain_out, gain_in) =
                        equal_power_gains(self.fade_pos + j as u64, self.fade_window);
                    out[j][0] = out[j][0] * gain_in + self.scratch_outgoing[j][0] * gain_out;
                    out[j][1] = out[j][1] * gain_in + self.scratch_outgoing[j][1] * gain_out;
                }

                self.fade_pos += n as u64;
                if self.fade_pos >= self.fade_window {
                    // The outgoing mixer is destroyed here; its reference
                    // count drops to zero with it.
                    self.outgoing = None;
                    self.state = ChannelState::Playing;
                    debug!("Theme transition complete");
                }
            }
        }
    }
}

/// One persistent output identity of the engine.
pub struct Channel {
    id: usize,
    config: ChannelConfig,
    core: Mutex<ChannelCore>,
    wake: Notify,
    loading: AtomicBool,
    next_listener_id: AtomicU64,
}

impl Channel {
    pub fn new(id: usize, config: ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            core: Mutex::new(ChannelCore {
                state: ChannelState::Idle,
                live: None,
                outgoing: None,
                fade_pos: 0,
                fade_window: 0,
                version: 0,
                listeners: Vec::new(),
                bound_session: None,
                last_detach: None,
                scratch_outgoing: Vec::new(),
            }),
            wake: Notify::new(),
            loading: AtomicBool::new(false),
            next_listener_id: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.core.lock().unwrap().state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::Playing | ChannelState::Transitioning
        )
    }

    pub fn version(&self) -> u64 {
        self.core.lock().unwrap().version
    }

    pub fn listener_count(&self) -> usize {
        self.core.lock().unwrap().listeners.len()
    }

    pub fn theme_ref(&self) -> Option<String> {
        self.core
            .lock()
            .unwrap()
            .live
            .as_ref()
            .map(|m| m.theme_ref().to_string())
    }

    pub fn frame_position(&self) -> u64 {
        self.core
            .lock()
            .unwrap()
            .live
            .as_ref()
            .map(|m| m.frame_position())
            .unwrap_or(0)
    }

    pub fn bound_session(&self) -> Option<SessionId> {
        self.core.lock().unwrap().bound_session
    }

    pub fn bind_session(&self, session: Option<SessionId>) {
        self.core.lock().unwrap().bound_session = session;
    }

    /// Instant the listener registry last became empty.
    pub fn last_detach(&self) -> Option<Instant> {
        self.core.lock().unwrap().last_detach
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let core = self.core.lock().unwrap();
        ChannelSnapshot {
            channel_id: self.id,
            state: core.state,
            current_theme_ref: core.live.as_ref().map(|m| m.theme_ref().to_string()),
            version: core.version,
            listener_count: core.listeners.len(),
            frame_position: core.live.as_ref().map(|m| m.frame_position()).unwrap_or(0),
            decode_failures: core
                .live
                .as_ref()
                .map(|m| m.failures())
                .unwrap_or_default(),
        }
    }

    /// Load a theme onto this channel.
    ///
    /// Idle channel: the mixer goes live immediately. Playing channel: an
    /// equal-power transition starts. A load during a transition collapses
    /// the in-flight one. At most one load is in flight per channel; a
    /// concurrent call returns [`StreamError::LoadInProgress`].
    ///
    /// The channel state is untouched when the incoming mixer fails to
    /// build.
    pub async fn load_theme(
        &self,
        theme_ref: impl Into<String>,
        sources: Vec<TrackSource>,
        factory: Arc<dyn DecoderFactory>,
        options: MixerOptions,
    ) -> Result<ChannelState, StreamError> {
        if self.loading.swap(true, Ordering::SeqCst) {
            return Err(StreamError::LoadInProgress(self.id));
        }

        let theme_ref = theme_ref.into();
        let was_idle = {
            let mut core = self.core.lock().unwrap();
            if core.state == ChannelState::Idle {
                core.state = ChannelState::Loading;
                true
            } else {
                false
            }
        };

        // Decoder probing happens off the async runtime.
        let build_ref = theme_ref.clone();
        let build = tokio::task::spawn_blocking(move || {
            ThemeMixer::new(build_ref, sources, factory, options)
        })
        .await;

        let mixer = match build {
            Ok(Ok(mixer)) => mixer,
            Ok(Err(error)) => {
                warn!(channel = self.id, theme = %theme_ref, %error, "Theme load failed");
                if was_idle {
                    self.core.lock().unwrap().state = ChannelState::Idle;
                }
                self.loading.store(false, Ordering::SeqCst);
                return Err(error.into());
            }
            Err(join_error) => {
                if was_idle {
                    self.core.lock().unwrap().state = ChannelState::Idle;
                }
                self.loading.store(false, Ordering::SeqCst);
                return Err(StreamError::Engine(sonaudio::EngineError::decode_failure(
                    &theme_ref,
                    join_error,
                )));
            }
        };

        let fade_window = (self.config.crossfade_window_s * self.config.sample_rate as f64) as u64;
        let new_state = {
            let mut core = self.core.lock().unwrap();
            let state = match core.state {
                ChannelState::Idle | ChannelState::Loading => {
                    core.live = Some(mixer);
                    ChannelState::Playing
                }
                ChannelState::Playing => {
                    core.outgoing = core.live.replace(mixer);
                    core.fade_pos = 0;
                    core.fade_window = fade_window;
                    ChannelState::Transitioning
                }
                ChannelState::Transitioning => {
                    // Collapse: drop the old outgoing immediately, the prior
                    // incoming becomes the new outgoing.
                    core.outgoing = core.live.replace(mixer);
                    core.fade_pos = 0;
                    core.fade_window = fade_window;
                    ChannelState::Transitioning
                }
            };
            core.state = state;
            core.version += 1;
            // Un canal qui démarre sans auditeur est dès maintenant
            // candidat au reaper.
            if core.listeners.is_empty() && core.last_detach.is_none() {
                core.last_detach = Some(Instant::now());
            }
            state
        };

        self.loading.store(false, Ordering::SeqCst);
        self.wake.notify_one();
        info!(channel = self.id, theme = %theme_ref, state = ?new_state, "Theme loaded");
        Ok(new_state)
    }

    /// Detach the current mixers and return to idle. Attached listeners are
    /// closed: their encoders flush and their byte streams terminate.
    pub fn stop(&self) {
        let listeners = {
            let mut core = self.core.lock().unwrap();
            core.live = None;
            core.outgoing = None;
            core.fade_pos = 0;
            core.fade_window = 0;
            core.state = ChannelState::Idle;
            core.version += 1;
            core.last_detach = Some(Instant::now());
            std::mem::take(&mut core.listeners)
        };
        for listener in &listeners {
            listener.close();
        }
        info!(channel = self.id, closed_listeners = listeners.len(), "Channel stopped");
    }

    /// Attach a new listener joining live at the current frame position.
    pub fn attach_listener(&self) -> Result<ListenerStream, StreamError> {
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (handle, stream) =
            spawn_listener(self.id, listener_id, &self.config.listener_config())?;
        let mut core = self.core.lock().unwrap();
        core.listeners.push(handle);
        debug!(
            channel = self.id,
            listener = listener_id,
            total = core.listeners.len(),
            "Listener attached"
        );
        Ok(stream)
    }

    /// Remove a listener from the registry immediately. Dropping the
    /// [`ListenerStream`] achieves the same at the next batch.
    pub fn detach_listener(&self, listener_id: u64) {
        let mut core = self.core.lock().unwrap();
        if let Some(index) = core.listeners.iter().position(|l| l.id() == listener_id) {
            let handle = core.listeners.remove(index);
            handle.close();
            if core.listeners.is_empty() {
                core.last_detach = Some(Instant::now());
            }
        }
    }

    /// Master gain of the live (and transitioning) mixers.
    pub fn set_master_gain(&self, gain: f32) {
        let mut core = self.core.lock().unwrap();
        if let Some(mixer) = core.live.as_mut() {
            mixer.set_master_gain(gain);
        }
        if let Some(mixer) = core.outgoing.as_mut() {
            mixer.set_master_gain(gain);
        }
    }

    /// Decode failures of the live theme, one record per disabled track.
    pub fn decode_failures(&self) -> Vec<DecodeDiagnostic> {
        self.core
            .lock()
            .unwrap()
            .live
            .as_ref()
            .map(|m| m.failures())
            .unwrap_or_default()
    }

    /// Produce one frame batch and fan it out to the listener registry.
    ///
    /// Returns the batch for observation, or None when the channel is not
    /// producing. Listener removal (client gone, listener dead) happens
    /// here, under the same lock as production.
    pub fn produce_batch(&self) -> Option<Arc<PcmBatch>> {
        let n = self.config.batch_frames();
        let mut core = self.core.lock().unwrap();
        if !matches!(
            core.state,
            ChannelState::Playing | ChannelState::Transitioning
        ) {
            return None;
        }

        let start_frame = core.live.as_ref().map(|m| m.frame_position()).unwrap_or(0);
        let mut frames = vec![SILENT_FRAME; n];
        core.produce(&mut frames);

        let batch = Arc::new(PcmBatch {
            frames,
            start_frame,
        });

        let before = core.listeners.len();
        core.listeners.retain(|listener| listener.offer(&batch));
        if core.listeners.len() < before {
            debug!(
                channel = self.id,
                removed = before - core.listeners.len(),
                "Detached defunct listeners"
            );
            if core.listeners.is_empty() {
                core.last_detach = Some(Instant::now());
            }
        }
        Some(batch)
    }
}

/// Pace one channel's production at the canonical rate.
///
/// The task sleeps on the channel's wake notifier while idle and ticks at
/// batch granularity while the channel is active.
pub(crate) fn spawn_producer(channel: Arc<Channel>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let batch_duration = Duration::from_millis(channel.config.batch_ms);
        loop {
            while !channel.is_active() {
                channel.wake.notified().await;
            }

            let mut ticker = time::interval(batch_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while channel.is_active() {
                ticker.tick().await;
                channel.produce_batch();
            }
        }
    })
}
