//! End-to-end channel streaming tests: several listeners on one channel,
//! backpressure isolation and live joining.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sonaudio::{
    Decoder, DecoderFactory, DecoderInfo, EngineError, Frame, PlaybackMode, TrackSettings,
    TrackSource,
};
use sonstream::{Channel, ChannelConfig, ChannelState};

struct ToneDecoder {
    info: DecoderInfo,
    pos: u64,
}

impl Decoder for ToneDecoder {
    fn info(&self) -> &DecoderInfo {
        &self.info
    }

    fn read(&mut self, out: &mut [Frame]) -> Result<usize, EngineError> {
        let len = 96_000u64;
        let remaining = (len - self.pos).min(out.len() as u64) as usize;
        for (i, frame) in out[..remaining].iter_mut().enumerate() {
            let t = (self.pos + i as u64) as f32;
            let v = (t * 440.0 * 2.0 * std::f32::consts::PI / 48_000.0).sin() * 0.4;
            *frame = [v, v];
        }
        self.pos += remaining as u64;
        Ok(remaining)
    }

    fn rewind(&mut self) -> Result<(), EngineError> {
        self.pos = 0;
        Ok(())
    }
}

struct ToneFactory;

impl DecoderFactory for ToneFactory {
    fn open(&self, _path: &Path) -> Result<Box<dyn Decoder>, EngineError> {
        Ok(Box::new(ToneDecoder {
            info: DecoderInfo {
                sample_rate: 48_000,
                source_sample_rate: 48_000,
                channels: 2,
                duration_frames: Some(96_000),
            },
            pos: 0,
        }))
    }
}

fn bed() -> Vec<TrackSource> {
    vec![TrackSource {
        path: PathBuf::from("tone.flac"),
        settings: TrackSettings {
            playback_mode: PlaybackMode::Continuous,
            seamless_loop: true,
            ..Default::default()
        },
    }]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_listener_dies_without_stalling_peers() {
    let config = ChannelConfig {
        batch_ms: 10,
        listener_buffer_s: 0.1,
        listener_dead_after_drop_s: 0.2,
        ..Default::default()
    };
    let channel = Channel::new(1, config);
    channel
        .load_theme("tone", bed(), Arc::new(ToneFactory), Default::default())
        .await
        .unwrap();

    let mut fast = channel.attach_listener().unwrap();
    let slow = channel.attach_listener().unwrap();
    assert_eq!(channel.listener_count(), 2);

    // Le rapide draine en continu dans une tâche dédiée ; le lent ne lit
    // jamais rien.
    let drain = tokio::spawn(async move {
        let mut bytes = 0usize;
        while let Some(chunk) = fast.next_chunk().await {
            bytes += chunk.len();
        }
        bytes
    });

    // 3 s d'audio produites au rythme des lots
    for _ in 0..300 {
        channel.produce_batch();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Le lent a été déclaré mort et détaché ; le rapide est toujours là
    assert!(slow.is_dead(), "slow listener should be dead");
    assert_eq!(channel.listener_count(), 1);

    channel.stop();
    let fast_bytes = drain.await.unwrap();
    assert!(fast_bytes > 10_000, "fast listener got {} bytes", fast_bytes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_joins_live_at_current_position() {
    let config = ChannelConfig {
        batch_ms: 10,
        ..Default::default()
    };
    let channel = Channel::new(1, config);
    channel
        .load_theme("tone", bed(), Arc::new(ToneFactory), Default::default())
        .await
        .unwrap();

    // Avancer le canal avant le premier attachement
    for _ in 0..50 {
        channel.produce_batch();
    }
    let joined_at = channel.frame_position();
    assert!(joined_at >= 24_000);

    let mut late = channel.attach_listener().unwrap();
    let batch = channel.produce_batch().unwrap();
    // Le lot reçu commence à la position courante, pas à zéro
    assert!(batch.start_frame >= joined_at);

    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.stop();
    let mut got = 0usize;
    while let Some(chunk) = late.next_chunk().await {
        got += chunk.len();
    }
    assert!(got > 0);
}

#[tokio::test]
async fn test_stopped_channel_produces_nothing() {
    let channel = Channel::new(1, ChannelConfig::default());
    assert_eq!(channel.state(), ChannelState::Idle);
    assert!(channel.produce_batch().is_none());
}
