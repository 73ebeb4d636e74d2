//! Persistent channel streaming for Sonorium.
//!
//! This crate turns the pull-based mixing engine of `sonaudio` into
//! long-lived, network-facing audio streams:
//!
//! - [`Channel`] owns the live [`sonaudio::ThemeMixer`] for one output
//!   identity, paces frame production at the canonical rate, performs atomic
//!   equal-power theme transitions and fans PCM batches out to listeners.
//! - [`ListenerEncoder`] gives every HTTP client its own MP3 encoder state
//!   and a bounded drop-oldest byte queue, so one slow client can never
//!   stall the channel or its peers.
//! - [`ChannelPool`] manages a fixed set of channels with session binding,
//!   LRU reassignment and an idle reaper.
//!
//! # Architecture
//!
//! ```text
//! ThemeMixer ──pull──▶ Channel producer task ──Arc<PcmBatch>──▶ per-listener
//!                      (one per channel)                        encoder tasks
//!                                                                   │ MP3
//!                                                                   ▼
//!                                                         bounded byte queue
//!                                                                   │
//!                                                                   ▼
//!                                                      ListenerStream (HTTP body)
//! ```

mod channel;
mod error;
mod listener;
mod mp3;
mod pool;
#[cfg(test)]
mod testutil;

pub use channel::{Channel, ChannelConfig, ChannelSnapshot, ChannelState};
pub use error::StreamError;
pub use listener::{ListenerStream, PcmBatch};
pub use mp3::Mp3Encoder;
pub use pool::ChannelPool;

/// External binding identity for a channel, assigned by the session layer.
pub type SessionId = uuid::Uuid;
