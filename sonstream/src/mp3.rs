//! Thin wrapper around the LAME encoder.
//!
//! Each listener owns one [`Mp3Encoder`] instance: encoder state is never
//! shared between clients, so a mid-stream join simply starts a fresh CBR
//! stream at the channel's current frame. Float frames are clamped to the
//! 16-bit range here, at the encoder boundary only.

use std::mem::MaybeUninit;

use mp3lame_encoder::{Birtate, Builder, FlushNoGap, InterleavedPcm, Quality};
use sonaudio::Frame;
use tracing::error;

use crate::StreamError;

/// Stateful MP3 CBR encoder for one listener.
pub struct Mp3Encoder {
    encoder: mp3lame_encoder::Encoder,
    bitrate_bps: u32,
}

impl Mp3Encoder {
    pub fn new(sample_rate: u32, channels: u8, bitrate_bps: u32) -> Result<Self, StreamError> {
        let mut builder =
            Builder::new().ok_or_else(|| StreamError::EncoderInit("lame builder".into()))?;
        builder
            .set_num_channels(channels)
            .map_err(|e| StreamError::EncoderInit(format!("channels: {:?}", e)))?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| StreamError::EncoderInit(format!("sample rate: {:?}", e)))?;
        builder
            .set_brate(bitrate_variant(bitrate_bps))
            .map_err(|e| StreamError::EncoderInit(format!("bitrate: {:?}", e)))?;
        builder
            .set_quality(Quality::Best)
            .map_err(|e| StreamError::EncoderInit(format!("quality: {:?}", e)))?;
        let encoder = builder
            .build()
            .map_err(|e| StreamError::EncoderInit(format!("build: {:?}", e)))?;
        Ok(Self {
            encoder,
            bitrate_bps,
        })
    }

    pub fn bitrate_bps(&self) -> u32 {
        self.bitrate_bps
    }

    /// Encode a batch of stereo frames. No flush: the encoder keeps its
    /// state between calls for a gapless byte stream.
    pub fn encode(&mut self, frames: &[Frame]) -> Vec<u8> {
        // Saturating limit at encoder ingress; the engine itself never clips.
        let mut pcm = Vec::with_capacity(frames.len() * 2);
        for frame in frames {
            pcm.push((frame[0].clamp(-1.0, 1.0) * 32767.0) as i16);
            pcm.push((frame[1].clamp(-1.0, 1.0) * 32767.0) as i16);
        }

        let mp3_buffer_size = (pcm.len() as f32 * 1.25) as usize + 7200;
        let mut mp3_buffer: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); mp3_buffer_size];

        let input = InterleavedPcm(&pcm);
        let bytes_written = match self.encoder.encode(input, &mut mp3_buffer) {
            Ok(size) => size,
            Err(e) => {
                error!("MP3 encoding failed: {:?}", e);
                return Vec::new();
            }
        };
        if bytes_written > mp3_buffer_size {
            error!(
                "MP3 encoder reported {} bytes written, exceeds buffer size {}",
                bytes_written, mp3_buffer_size
            );
            return Vec::new();
        }

        let mut mp3_data = Vec::with_capacity(bytes_written);
        unsafe {
            mp3_data.extend_from_slice(std::slice::from_raw_parts(
                mp3_buffer.as_ptr() as *const u8,
                bytes_written,
            ));
        }
        mp3_data
    }

    /// Drain the encoder's internal buffer, e.g. when the stream ends.
    pub fn flush(&mut self) -> Vec<u8> {
        let mut mp3_buffer: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); 7200];
        let bytes_written = match self.encoder.flush::<FlushNoGap>(&mut mp3_buffer) {
            Ok(size) => size.min(mp3_buffer.len()),
            Err(e) => {
                error!("MP3 flush failed: {:?}", e);
                return Vec::new();
            }
        };
        let mut mp3_data = Vec::with_capacity(bytes_written);
        unsafe {
            mp3_data.extend_from_slice(std::slice::from_raw_parts(
                mp3_buffer.as_ptr() as *const u8,
                bytes_written,
            ));
        }
        mp3_data
    }
}

/// Map a configured bit rate to the nearest CBR variant LAME supports.
fn bitrate_variant(bitrate_bps: u32) -> Birtate {
    match bitrate_bps / 1000 {
        0..=96 => Birtate::Kbps96,
        97..=112 => Birtate::Kbps112,
        113..=128 => Birtate::Kbps128,
        129..=160 => Birtate::Kbps160,
        161..=192 => Birtate::Kbps192,
        193..=224 => Birtate::Kbps224,
        225..=256 => Birtate::Kbps256,
        _ => Birtate::Kbps320,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_produces_bytes() {
        let mut encoder = Mp3Encoder::new(48_000, 2, 128_000).unwrap();
        // 0.5 s of a 440 Hz tone
        let frames: Vec<Frame> = (0..24_000)
            .map(|i| {
                let v = (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 48_000.0).sin() * 0.5;
                [v, v]
            })
            .collect();

        let mut total = 0;
        for chunk in frames.chunks(4800) {
            total += encoder.encode(chunk).len();
        }
        total += encoder.flush().len();

        // 0.5 s at 128 kbit ≈ 8000 bytes; LAME buffers, so stay loose
        assert!(total > 2000, "only {} bytes out", total);
    }

    #[test]
    fn test_overdriven_input_is_clamped_not_panicking() {
        let mut encoder = Mp3Encoder::new(48_000, 2, 128_000).unwrap();
        let frames = vec![[7.5f32, -7.5f32]; 4800];
        let out = encoder.encode(&frames);
        let _ = out.len();
        let _ = encoder.flush();
    }

    #[test]
    fn test_bitrate_mapping() {
        assert!(matches!(bitrate_variant(128_000), Birtate::Kbps128));
        assert!(matches!(bitrate_variant(192_000), Birtate::Kbps192));
        assert!(matches!(bitrate_variant(999_000), Birtate::Kbps320));
    }
}
