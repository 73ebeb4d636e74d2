//! Per-listener MP3 encoding with bounded, drop-oldest delivery.
//!
//! Every HTTP client attached to a channel gets its own encoder task and its
//! own byte queue. The channel producer only ever `try_send`s PCM batches:
//! nothing a listener does can block frame production. When a client stops
//! draining, the oldest encoded chunks are dropped first; after a configured
//! stretch of continuous dropping the listener is declared dead and its
//! stream is closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sonaudio::Frame;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::{Mp3Encoder, StreamError};

/// One batch of mixed PCM, shared by reference with every listener.
#[derive(Debug)]
pub struct PcmBatch {
    pub frames: Vec<Frame>,
    /// Channel frame position of the first frame in this batch
    pub start_frame: u64,
}

/// Listener-side tuning, derived from the channel configuration.
#[derive(Debug, Clone)]
pub(crate) struct ListenerConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate_bps: u32,
    /// Encoded buffer depth in seconds of audio
    pub buffer_s: f64,
    /// Continuous dropping time after which the listener is dead
    pub dead_after_s: f64,
    /// PCM batches queued between producer and encoder task
    pub pcm_queue: usize,
}

struct ByteQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    capacity_bytes: usize,
    bytes_per_sec: f64,
    dropping_run_s: f64,
    dead_after_s: f64,
    total_dropped_bytes: u64,
}

struct ListenerShared {
    queue: Mutex<ByteQueue>,
    notify: Notify,
    /// No more bytes will ever be pushed (flush done or listener dead)
    finished: AtomicBool,
    /// The HTTP side dropped its stream
    client_closed: AtomicBool,
    dead: AtomicBool,
}

impl ListenerShared {
    fn push(&self, data: Bytes) {
        if self.client_closed.load(Ordering::Acquire) {
            return;
        }
        let mut became_dead = false;
        {
            let mut queue = self.queue.lock().unwrap();
            queue.bytes += data.len();
            queue.chunks.push_back(data);

            let mut dropped = 0usize;
            while queue.bytes > queue.capacity_bytes && queue.chunks.len() > 1 {
                if let Some(old) = queue.chunks.pop_front() {
                    queue.bytes -= old.len();
                    dropped += old.len();
                }
            }

            if dropped > 0 {
                queue.total_dropped_bytes += dropped as u64;
                queue.dropping_run_s += dropped as f64 / queue.bytes_per_sec;
                if queue.dropping_run_s >= queue.dead_after_s {
                    became_dead = true;
                }
            } else {
                queue.dropping_run_s = 0.0;
            }
        }
        if became_dead {
            self.dead.store(true, Ordering::Release);
            self.finished.store(true, Ordering::Release);
        }
        self.notify.notify_one();
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_over(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            || self.dead.load(Ordering::Acquire)
            || self.client_closed.load(Ordering::Acquire)
    }
}

/// Channel-side handle to one listener, kept in the fan-out registry.
pub(crate) struct ListenerHandle {
    id: u64,
    pcm_tx: mpsc::Sender<Arc<PcmBatch>>,
    shared: Arc<ListenerShared>,
}

impl ListenerHandle {
    /// Offer a PCM batch to this listener without ever blocking.
    ///
    /// Returns false when the listener should be removed from the registry.
    pub(crate) fn offer(&self, batch: &Arc<PcmBatch>) -> bool {
        if self.shared.dead.load(Ordering::Acquire)
            || self.shared.client_closed.load(Ordering::Acquire)
        {
            return false;
        }
        match self.pcm_tx.try_send(Arc::clone(batch)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The encoder task is behind; skipping one batch is the
                // non-blocking valve. Encoded-side dropping handles the
                // persistent case.
                trace!(listener = self.id, "Encoder lag, PCM batch skipped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the listener when its channel stops: the encoder task flushes
    /// and the HTTP stream terminates once drained.
    pub(crate) fn close(&self) {
        self.shared.finish();
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// Encoded byte stream handed to the HTTP layer.
///
/// Dropping this stream detaches the listener: the channel removes it from
/// its registry at the next batch and in-flight bytes are discarded.
pub struct ListenerStream {
    channel_id: usize,
    id: u64,
    shared: Arc<ListenerShared>,
}

impl ListenerStream {
    /// Next encoded chunk, or None when the stream is over (channel stopped,
    /// listener dead, or flush drained).
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if let Some(chunk) = queue.chunks.pop_front() {
                    queue.bytes -= chunk.len();
                    return Some(chunk);
                }
            }
            if self.shared.is_over() {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// True when the backpressure policy declared this listener dead.
    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    pub fn listener_id(&self) -> u64 {
        self.id
    }
}

impl Drop for ListenerStream {
    fn drop(&mut self) {
        self.shared.client_closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        debug!(
            channel = self.channel_id,
            listener = self.id,
            "Listener stream dropped"
        );
    }
}

/// Create a listener: its encoder task, the registry handle and the HTTP
/// stream. The listener joins live at the channel's current frame; there is
/// no rewind and no pre-roll.
pub(crate) fn spawn_listener(
    channel_id: usize,
    id: u64,
    config: &ListenerConfig,
) -> Result<(ListenerHandle, ListenerStream), StreamError> {
    let mut encoder = Mp3Encoder::new(config.sample_rate, config.channels, config.bitrate_bps)?;

    let bytes_per_sec = config.bitrate_bps as f64 / 8.0;
    let capacity_bytes = (bytes_per_sec * config.buffer_s).ceil() as usize;
    let shared = Arc::new(ListenerShared {
        queue: Mutex::new(ByteQueue {
            chunks: VecDeque::new(),
            bytes: 0,
            capacity_bytes: capacity_bytes.max(1),
            bytes_per_sec,
            dropping_run_s: 0.0,
            dead_after_s: config.dead_after_s,
            total_dropped_bytes: 0,
        }),
        notify: Notify::new(),
        finished: AtomicBool::new(false),
        client_closed: AtomicBool::new(false),
        dead: AtomicBool::new(false),
    });

    let (pcm_tx, mut pcm_rx) = mpsc::channel::<Arc<PcmBatch>>(config.pcm_queue.max(1));

    let task_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        while let Some(batch) = pcm_rx.recv().await {
            if task_shared.client_closed.load(Ordering::Acquire)
                || task_shared.dead.load(Ordering::Acquire)
            {
                break;
            }
            let data = encoder.encode(&batch.frames);
            if !data.is_empty() {
                task_shared.push(Bytes::from(data));
            }
        }

        if task_shared.dead.load(Ordering::Acquire) {
            let dropped = task_shared.queue.lock().unwrap().total_dropped_bytes;
            warn!(
                channel = channel_id,
                listener = id,
                dropped_bytes = dropped,
                "Listener dead, stream closed"
            );
        } else if !task_shared.client_closed.load(Ordering::Acquire) {
            let tail = encoder.flush();
            if !tail.is_empty() {
                task_shared.push(Bytes::from(tail));
            }
        }
        task_shared.finish();
        info!(channel = channel_id, listener = id, "Listener encoder task done");
    });

    let handle = ListenerHandle {
        id,
        pcm_tx,
        shared: Arc::clone(&shared),
    };
    let stream = ListenerStream {
        channel_id,
        id,
        shared,
    };
    Ok((handle, stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ListenerConfig {
        ListenerConfig {
            sample_rate: 48_000,
            channels: 2,
            bitrate_bps: 128_000,
            buffer_s: 2.0,
            dead_after_s: 10.0,
            pcm_queue: 8,
        }
    }

    fn shared_with_capacity(capacity_bytes: usize, dead_after_s: f64) -> Arc<ListenerShared> {
        Arc::new(ListenerShared {
            queue: Mutex::new(ByteQueue {
                chunks: VecDeque::new(),
                bytes: 0,
                capacity_bytes,
                bytes_per_sec: 16_000.0,
                dropping_run_s: 0.0,
                dead_after_s,
                total_dropped_bytes: 0,
            }),
            notify: Notify::new(),
            finished: AtomicBool::new(false),
            client_closed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        })
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        let shared = shared_with_capacity(1000, f64::INFINITY);
        for i in 0u8..10 {
            shared.push(Bytes::from(vec![i; 300]));
        }
        let queue = shared.queue.lock().unwrap();
        assert!(queue.bytes <= 1000 + 300);
        // Le plus récent est toujours là
        assert_eq!(queue.chunks.back().unwrap()[0], 9);
        assert!(queue.total_dropped_bytes > 0);
    }

    #[test]
    fn test_continuous_dropping_marks_dead() {
        // 16 kB/s, capacity 1000 bytes, dead after 0.5 s of dropping
        // = 8000 dropped bytes.
        let shared = shared_with_capacity(1000, 0.5);
        for _ in 0..40 {
            shared.push(Bytes::from(vec![0u8; 500]));
        }
        assert!(shared.dead.load(Ordering::Acquire));
        assert!(shared.finished.load(Ordering::Acquire));
    }

    #[test]
    fn test_draining_resets_drop_run() {
        let shared = shared_with_capacity(1000, 0.5);
        for round in 0..50 {
            shared.push(Bytes::from(vec![0u8; 500]));
            if round % 2 == 0 {
                // Le client draine : la fenêtre de drop continue est remise
                // à zéro.
                let mut queue = shared.queue.lock().unwrap();
                while let Some(chunk) = queue.chunks.pop_front() {
                    queue.bytes -= chunk.len();
                }
            }
        }
        assert!(!shared.dead.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_stream_receives_encoded_bytes_in_order() {
        let (handle, mut stream) = spawn_listener(1, 7, &test_config()).unwrap();

        let batch = Arc::new(PcmBatch {
            frames: vec![[0.1, -0.1]; 4800],
            start_frame: 0,
        });
        for _ in 0..20 {
            assert!(handle.offer(&batch));
        }
        drop(handle); // channel detaches → encoder flushes → stream ends

        let mut total = 0usize;
        while let Some(chunk) = stream.next_chunk().await {
            total += chunk.len();
        }
        assert!(total > 0);
        assert!(!stream.is_dead());
    }

    #[tokio::test]
    async fn test_dropped_stream_refuses_batches() {
        let (handle, stream) = spawn_listener(1, 8, &test_config()).unwrap();
        drop(stream);

        let batch = Arc::new(PcmBatch {
            frames: vec![[0.0, 0.0]; 480],
            start_frame: 0,
        });
        // Le fan-out voit le client parti et retire le handle
        assert!(!handle.offer(&batch));
    }
}
