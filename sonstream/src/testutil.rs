//! Synthetic decoders shared by the channel and pool tests.

use std::path::Path;
use std::sync::Arc;

use sonaudio::{Decoder, DecoderFactory, DecoderInfo, EngineError, Frame};

pub(crate) struct ConstDecoder {
    info: DecoderInfo,
    value: f32,
    len: u64,
    pos: u64,
}

impl Decoder for ConstDecoder {
    fn info(&self) -> &DecoderInfo {
        &self.info
    }

    fn read(&mut self, out: &mut [Frame]) -> Result<usize, EngineError> {
        let remaining = (self.len - self.pos).min(out.len() as u64) as usize;
        for frame in out[..remaining].iter_mut() {
            *frame = [self.value, self.value];
        }
        self.pos += remaining as u64;
        Ok(remaining)
    }

    fn rewind(&mut self) -> Result<(), EngineError> {
        self.pos = 0;
        Ok(())
    }
}

/// Maps file names to constant-value synthetic decoders.
pub(crate) struct SynthFactory {
    tracks: Vec<(String, f32, u64)>,
}

impl SynthFactory {
    pub(crate) fn new(tracks: &[(&str, f32, u64)]) -> Arc<dyn DecoderFactory> {
        Arc::new(Self {
            tracks: tracks
                .iter()
                .map(|(name, value, len)| (name.to_string(), *value, *len))
                .collect(),
        })
    }
}

impl DecoderFactory for SynthFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Decoder>, EngineError> {
        let name = path.file_name().unwrap().to_string_lossy();
        let (_, value, len) = self
            .tracks
            .iter()
            .find(|(n, _, _)| *n == name)
            .ok_or_else(|| EngineError::decode_failure(path.display().to_string(), "unknown track"))?;
        Ok(Box::new(ConstDecoder {
            info: DecoderInfo {
                sample_rate: 48_000,
                source_sample_rate: 48_000,
                channels: 2,
                duration_frames: Some(*len),
            },
            value: *value,
            len: *len,
            pos: 0,
        }))
    }
}
