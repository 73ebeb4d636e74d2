//! Décodeur de production basé sur Symphonia
//!
//! Ouvre n'importe quel conteneur supporté (FLAC, MP3, OGG/Vorbis, WAV,
//! AIFF, ...), décode en f32 et ramène le flux à la cadence canonique par
//! interpolation linéaire. L'ouverture est bornée dans le temps : un
//! conteneur pathologique est traité comme un échec de décodage, jamais comme
//! un blocage du chargement de thème.

use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::debug;

use crate::decoder::{Decoder, DecoderFactory, DecoderInfo};
use crate::{EngineError, Frame, LinearResampler};

/// Délai maximal d'ouverture d'un décodeur.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fabrique de décodeurs Symphonia.
pub struct MediaDecoderFactory {
    canonical_rate: u32,
    open_timeout: Duration,
}

impl MediaDecoderFactory {
    /// Crée la fabrique pour la cadence canonique donnée.
    ///
    /// Échoue avec [`EngineError::FatalDecoderInit`] si la cadence demandée
    /// est hors de la plage utilisable.
    pub fn new(canonical_rate: u32) -> Result<Self, EngineError> {
        if !(8_000..=192_000).contains(&canonical_rate) {
            return Err(EngineError::FatalDecoderInit(format!(
                "unsupported canonical sample rate {} Hz",
                canonical_rate
            )));
        }
        Ok(Self {
            canonical_rate,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        })
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

impl DecoderFactory for MediaDecoderFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Decoder>, EngineError> {
        let (tx, rx) = mpsc::channel();
        let owned_path = path.to_path_buf();
        let rate = self.canonical_rate;

        // Le probing de conteneur est borné via un worker : un fichier
        // pathologique ne doit pas suspendre le chargement d'un thème.
        std::thread::spawn(move || {
            let _ = tx.send(MediaDecoder::open(&owned_path, rate));
        });

        match rx.recv_timeout(self.open_timeout) {
            Ok(result) => result.map(|decoder| Box::new(decoder) as Box<dyn Decoder>),
            Err(_) => Err(EngineError::DecodeOpenTimeout {
                path: path.display().to_string(),
                timeout_s: self.open_timeout.as_secs_f64(),
            }),
        }
    }
}

/// Décodeur streaming d'un fichier audio.
pub struct MediaDecoder {
    path: String,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    info: DecoderInfo,
    resampler: LinearResampler,
    sample_buf: Option<SampleBuffer<f32>>,
    buf_key: (u32, usize),
    src_block: Vec<Frame>,
    dst_block: Vec<Frame>,
    pending: VecDeque<Frame>,
    eof: bool,
}

impl MediaDecoder {
    pub fn open(path: &Path, canonical_rate: u32) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::decode_failure(path.display().to_string(), e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| EngineError::decode_failure(path.display().to_string(), e))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| EngineError::decode_failure(path.display().to_string(), "no decodable track"))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let source_rate = params
            .sample_rate
            .ok_or_else(|| EngineError::decode_failure(path.display().to_string(), "unknown sample rate"))?;
        let channels = params.channels.map(|c| c.count()).unwrap_or(2) as u16;
        if !(1..=2).contains(&channels) {
            return Err(EngineError::decode_failure(
                path.display().to_string(),
                format!("unsupported channel count: {}", channels),
            ));
        }

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| EngineError::decode_failure(path.display().to_string(), e))?;

        let resampler = LinearResampler::new(source_rate, canonical_rate);
        let duration_frames = params.n_frames.map(|n| resampler.scale_len(n));

        debug!(
            path = %path.display(),
            source_rate,
            canonical_rate,
            channels,
            ?duration_frames,
            "Opened media decoder"
        );

        Ok(Self {
            path: path.display().to_string(),
            format,
            decoder,
            track_id,
            info: DecoderInfo {
                sample_rate: canonical_rate,
                source_sample_rate: source_rate,
                channels,
                duration_frames,
            },
            resampler,
            sample_buf: None,
            buf_key: (0, 0),
            src_block: Vec::new(),
            dst_block: Vec::new(),
            pending: VecDeque::new(),
            eof: false,
        })
    }

    /// Décode des paquets jusqu'à produire au moins une frame canonique
    /// ou atteindre la fin du fichier.
    fn fill_pending(&mut self) -> Result<(), EngineError> {
        while self.pending.is_empty() && !self.eof {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(());
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.eof = true;
                    return Ok(());
                }
                Err(e) => return Err(EngineError::decode_failure(&self.path, e)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // Paquet corrompu isolé : on le saute
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(EngineError::decode_failure(&self.path, e)),
            };

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let channel_count = spec.channels.count();
            let key = (spec.rate, channel_count);
            if self.sample_buf.is_none() || self.buf_key != key {
                self.sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
                self.buf_key = key;
            }
            let sample_buf = self.sample_buf.as_mut().unwrap();
            sample_buf.copy_interleaved_ref(decoded);

            let samples = sample_buf.samples();
            self.src_block.clear();
            match channel_count {
                1 => {
                    for &s in samples {
                        self.src_block.push([s, s]);
                    }
                }
                _ => {
                    for pair in samples.chunks_exact(channel_count) {
                        self.src_block.push([pair[0], pair[1]]);
                    }
                }
            }

            self.dst_block.clear();
            self.resampler.process(&self.src_block, &mut self.dst_block);
            self.pending.extend(self.dst_block.iter().copied());
        }
        Ok(())
    }
}

impl Decoder for MediaDecoder {
    fn info(&self) -> &DecoderInfo {
        &self.info
    }

    fn read(&mut self, out: &mut [Frame]) -> Result<usize, EngineError> {
        let mut written = 0;
        while written < out.len() {
            if let Some(frame) = self.pending.pop_front() {
                out[written] = frame;
                written += 1;
                continue;
            }
            if self.eof {
                break;
            }
            self.fill_pending()?;
            if self.pending.is_empty() && self.eof {
                break;
            }
        }
        Ok(written)
    }

    fn rewind(&mut self) -> Result<(), EngineError> {
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::new(0, 0.0),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| EngineError::decode_failure(&self.path, e))?;
        self.decoder.reset();
        self.resampler.reset();
        self.pending.clear();
        self.eof = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Écrit un WAV PCM 16 bits minimal (44 octets d'en-tête + données).
    fn write_test_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
        let mut pcm = Vec::with_capacity(frames * channels as usize * 2);
        for i in 0..frames {
            let v = (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / sample_rate as f32).sin();
            let s = (v * 0.5 * 32767.0) as i16;
            for _ in 0..channels {
                pcm.extend_from_slice(&s.to_le_bytes());
            }
        }

        let byte_rate = sample_rate * channels as u32 * 2;
        let block_align = channels * 2;
        let data_len = pcm.len() as u32;

        let mut file = File::create(path).unwrap();
        file.write_all(b"RIFF").unwrap();
        file.write_all(&(36 + data_len).to_le_bytes()).unwrap();
        file.write_all(b"WAVE").unwrap();
        file.write_all(b"fmt ").unwrap();
        file.write_all(&16u32.to_le_bytes()).unwrap();
        file.write_all(&1u16.to_le_bytes()).unwrap(); // PCM
        file.write_all(&channels.to_le_bytes()).unwrap();
        file.write_all(&sample_rate.to_le_bytes()).unwrap();
        file.write_all(&byte_rate.to_le_bytes()).unwrap();
        file.write_all(&block_align.to_le_bytes()).unwrap();
        file.write_all(&16u16.to_le_bytes()).unwrap();
        file.write_all(b"data").unwrap();
        file.write_all(&data_len.to_le_bytes()).unwrap();
        file.write_all(&pcm).unwrap();
    }

    #[test]
    fn test_decode_wav_at_canonical_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 48_000, 2, 4800);

        let factory = MediaDecoderFactory::new(48_000).unwrap();
        let mut decoder = factory.open(&path).unwrap();

        assert_eq!(decoder.info().sample_rate, 48_000);
        assert_eq!(decoder.info().source_sample_rate, 48_000);
        assert_eq!(decoder.info().channels, 2);

        let mut total = 0;
        let mut buf = vec![[0.0f32; 2]; 1024];
        loop {
            let n = decoder.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 4800);
    }

    #[test]
    fn test_decode_resamples_mono_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_test_wav(&path, 24_000, 1, 2400);

        let factory = MediaDecoderFactory::new(48_000).unwrap();
        let mut decoder = factory.open(&path).unwrap();

        let mut total = 0;
        let mut buf = vec![[0.0f32; 2]; 1024];
        loop {
            let n = decoder.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            // Mono dupliqué sur les deux canaux
            for frame in &buf[..n] {
                assert!((frame[0] - frame[1]).abs() < 1e-6);
            }
            total += n;
        }
        // 2x la durée source, à quelques frames près
        assert!((total as i64 - 4800).abs() < 8, "got {}", total);
    }

    #[test]
    fn test_rewind_restarts_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 48_000, 2, 1000);

        let factory = MediaDecoderFactory::new(48_000).unwrap();
        let mut decoder = factory.open(&path).unwrap();

        let mut first = vec![[0.0f32; 2]; 256];
        let n = decoder.read(&mut first).unwrap();
        assert_eq!(n, 256);

        // Épuiser le flux
        let mut rest = vec![[0.0f32; 2]; 4096];
        while decoder.read(&mut rest).unwrap() > 0 {}

        decoder.rewind().unwrap();
        let mut again = vec![[0.0f32; 2]; 256];
        let n = decoder.read(&mut again).unwrap();
        assert_eq!(n, 256);
        for (a, b) in first.iter().zip(again.iter()) {
            assert!((a[0] - b[0]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_open_missing_file_fails() {
        let factory = MediaDecoderFactory::new(48_000).unwrap();
        let err = factory.open(Path::new("/nonexistent/audio.flac"));
        assert!(matches!(err, Err(EngineError::DecodeFailure { .. })));
    }

    #[test]
    fn test_open_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.mp3");
        std::fs::write(&path, b"this is not audio at all").unwrap();

        let factory = MediaDecoderFactory::new(48_000).unwrap();
        let err = factory.open(&path);
        assert!(matches!(err, Err(EngineError::DecodeFailure { .. })));
    }

    #[test]
    fn test_factory_rejects_bad_rate() {
        assert!(matches!(
            MediaDecoderFactory::new(0),
            Err(EngineError::FatalDecoderInit(_))
        ));
    }
}
