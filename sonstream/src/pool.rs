//! Fixed pool of channels with session binding and idle reaping.
//!
//! Allocation order for a session asking to play:
//! 1. the channel already bound to this session, if any;
//! 2. the lowest-numbered idle channel;
//! 3. the least-recently-listened channel with no remaining listeners,
//!    which is stopped and reassigned;
//! 4. otherwise the pool is exhausted.
//!
//! The reaper returns a channel to idle once its listener registry has been
//! empty for the configured timeout and no session is bound to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time;
use tracing::{debug, info};

use crate::channel::{spawn_producer, Channel, ChannelConfig, ChannelSnapshot};
use crate::{ChannelState, SessionId, StreamError};

pub struct ChannelPool {
    channels: Vec<Arc<Channel>>,
    bindings: Mutex<HashMap<SessionId, usize>>,
}

impl ChannelPool {
    /// Create `max_channels` channels (ids 1..=max) and start one producer
    /// task per channel. Must be called inside a Tokio runtime.
    pub fn new(max_channels: usize, config: ChannelConfig) -> Arc<Self> {
        let channels: Vec<Arc<Channel>> = (1..=max_channels.max(1))
            .map(|id| Channel::new(id, config.clone()))
            .collect();
        for channel in &channels {
            spawn_producer(Arc::clone(channel));
        }
        info!(channels = channels.len(), "Channel pool ready");
        Arc::new(Self {
            channels,
            bindings: Mutex::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channel by 1-based id.
    pub fn get(&self, channel_id: usize) -> Result<Arc<Channel>, StreamError> {
        self.channels
            .get(channel_id.wrapping_sub(1))
            .cloned()
            .ok_or(StreamError::UnknownChannel(channel_id))
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    /// Find or allocate a channel for a session and bind it.
    pub fn assign_or_reuse(&self, session: SessionId) -> Result<Arc<Channel>, StreamError> {
        let mut bindings = self.bindings.lock().unwrap();

        // 1. Reuse the channel still bound to this session
        if let Some(&index) = bindings.get(&session) {
            let channel = &self.channels[index];
            if channel.bound_session() == Some(session) {
                debug!(session = %session, channel = channel.id(), "Reusing bound channel");
                return Ok(Arc::clone(channel));
            }
            bindings.remove(&session);
        }

        // 2. Lowest-numbered idle channel
        if let Some((index, channel)) = self
            .channels
            .iter()
            .enumerate()
            .find(|(_, c)| c.state() == ChannelState::Idle && c.bound_session().is_none())
        {
            channel.bind_session(Some(session));
            bindings.insert(session, index);
            debug!(session = %session, channel = channel.id(), "Assigned idle channel");
            return Ok(Arc::clone(channel));
        }

        // 3. Steal the channel whose listeners left longest ago
        let candidate = self
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.listener_count() == 0)
            .min_by_key(|(_, c)| c.last_detach());
        if let Some((index, channel)) = candidate {
            info!(
                session = %session,
                channel = channel.id(),
                "Reassigning least-recently-listened channel"
            );
            if let Some(previous) = channel.bound_session() {
                bindings.remove(&previous);
            }
            channel.stop();
            channel.bind_session(Some(session));
            bindings.insert(session, index);
            return Ok(Arc::clone(channel));
        }

        // 4. Every channel still has an audience
        Err(StreamError::NoChannelAvailable)
    }

    /// Release a session's binding. The channel keeps playing until the
    /// reaper or a reassignment claims it.
    pub fn release(&self, session: SessionId) {
        let mut bindings = self.bindings.lock().unwrap();
        if let Some(index) = bindings.remove(&session) {
            let channel = &self.channels[index];
            if channel.bound_session() == Some(session) {
                channel.bind_session(None);
                debug!(session = %session, channel = channel.id(), "Session released");
            }
        }
    }

    /// One reaper pass: stop channels with no listeners for `idle_timeout`
    /// and no bound session.
    pub fn reap(&self, idle_timeout: Duration) {
        for channel in &self.channels {
            if !channel.is_active()
                || channel.listener_count() > 0
                || channel.bound_session().is_some()
            {
                continue;
            }
            let expired = match channel.last_detach() {
                Some(instant) => instant.elapsed() >= idle_timeout,
                None => false,
            };
            if expired {
                info!(channel = channel.id(), "Reaping idle channel");
                channel.stop();
            }
        }
    }

    /// Periodic reaper task.
    pub fn spawn_reaper(self: &Arc<Self>, idle_timeout: Duration) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let tick = idle_timeout.min(Duration::from_secs(2)).max(Duration::from_millis(100));
            let mut ticker = time::interval(tick);
            loop {
                ticker.tick().await;
                pool.reap(idle_timeout);
            }
        })
    }

    /// Control-surface snapshot of every channel.
    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.channels.iter().map(|c| c.snapshot()).collect()
    }

    /// Apply a process-wide master gain to every active channel.
    pub fn set_master_gain(&self, gain: f32) {
        for channel in &self.channels {
            channel.set_master_gain(gain);
        }
    }
}
