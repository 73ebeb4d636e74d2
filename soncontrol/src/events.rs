//! Fire-and-forget transport events.
//!
//! The controller announces what external transports (DLNA, AirPlay,
//! Chromecast, local sinks) should do; it never tracks delivery success.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportAction {
    Play,
    Stop,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportEvent {
    pub session_id: Uuid,
    pub action: TransportAction,
    /// URL of the channel byte stream the speakers should fetch
    pub stream_url: String,
    pub speaker_targets: Vec<String>,
}

#[derive(Clone, Default)]
pub struct TransportEventBus {
    subscribers: Arc<Mutex<Vec<Sender<TransportEvent>>>>,
}

impl TransportEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Receiver<TransportEvent> {
        let (tx, rx) = unbounded::<TransportEvent>();
        {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.push(tx);
        }
        rx
    }

    pub fn broadcast(&self, event: TransportEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let bus = TransportEventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.broadcast(TransportEvent {
            session_id: Uuid::new_v4(),
            action: TransportAction::Play,
            stream_url: "http://host/channel_stream/1".into(),
            speaker_targets: vec!["living-room".into()],
        });

        assert_eq!(rx1.try_recv().unwrap().action, TransportAction::Play);
        assert_eq!(rx2.try_recv().unwrap().action, TransportAction::Play);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = TransportEventBus::new();
        let rx = bus.subscribe();
        drop(rx);

        bus.broadcast(TransportEvent {
            session_id: Uuid::new_v4(),
            action: TransportAction::Stop,
            stream_url: String::new(),
            speaker_targets: Vec::new(),
        });
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
