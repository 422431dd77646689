use crate::error::{Result, ScoreError};
use crate::pipeline::CancellationToken;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::probe::Hint;

/// Maximum accepted size for in-memory PCM sources (50 MiB).
pub const MAX_SOURCE_BYTES: usize = 50 * 1024 * 1024;

const MIN_SAMPLE_RATE_HZ: u32 = 8_000;
const MAX_SAMPLE_RATE_HZ: u32 = 192_000;

/// A PCM audio source handed to the engine by a collaborator.
///
/// Either a filesystem path (blocking read) or an in-memory byte buffer with
/// its declared content type. Byte sources never touch the filesystem.
#[derive(Debug, Clone)]
pub enum PcmSource {
    Path(PathBuf),
    Bytes { data: Vec<u8>, content_type: String },
}

impl PcmSource {
    pub fn path(p: impl Into<PathBuf>) -> Self {
        PcmSource::Path(p.into())
    }

    pub fn bytes(data: Vec<u8>, content_type: impl Into<String>) -> Self {
        PcmSource::Bytes {
            data,
            content_type: content_type.into(),
        }
    }
}

/// Decoded audio, collapsed to mono and normalized to [-1, 1].
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub sample_rate_hz: u32,
    pub channels: u8,
    pub samples: Vec<f64>,
}

impl AudioBuffer {
    pub fn duration_ms(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate_hz as f64 * 1000.0
    }

    /// Sample index for a timestamp, clamped to the buffer length.
    pub fn sample_at_ms(&self, time_ms: f64) -> usize {
        let idx = (time_ms.max(0.0) / 1000.0 * self.sample_rate_hz as f64) as usize;
        idx.min(self.samples.len())
    }
}

/// Map a declared content type to a format extension hint.
///
/// Unknown content types are rejected before any decoding work happens.
fn extension_for_content_type(content_type: &str) -> Result<&'static str> {
    match content_type.trim().to_ascii_lowercase().as_str() {
        "audio/wav" | "audio/x-wav" => Ok("wav"),
        "audio/mp3" | "audio/mpeg" => Ok("mp3"),
        "audio/ogg" => Ok("ogg"),
        "audio/m4a" => Ok("m4a"),
        "audio/aac" => Ok("aac"),
        other => Err(ScoreError::AudioDecode(format!(
            "Unsupported content type: {}",
            other
        ))),
    }
}

/// Decode a PCM source into a mono, normalized `AudioBuffer`.
///
/// Supports WAV, MP3, OGG, M4A and AAC. Multi-channel audio is collapsed by
/// arithmetic mean. No resampling is performed; the buffer keeps the source
/// rate, which is validated to lie in [8 kHz, 192 kHz]. Cancellation is
/// checked periodically inside the packet-decode loop.
pub fn load_audio(source: &PcmSource, cancel: &CancellationToken) -> Result<AudioBuffer> {
    match source {
        PcmSource::Path(path) => {
            tracing::debug!("Loading audio from path: {}", path.display());
            if !path.exists() {
                return Err(ScoreError::AudioDecode(format!(
                    "Audio file not found: {}",
                    path.display()
                )));
            }
            let file = File::open(path)?;
            let mss = MediaSourceStream::new(
                Box::new(ReadOnlySource::new(file)),
                Default::default(),
            );
            let mut hint = Hint::new();
            if let Some(ext) = path.extension() {
                hint.with_extension(&ext.to_string_lossy());
            }
            decode_stream(mss, hint, cancel)
        }
        PcmSource::Bytes { data, content_type } => {
            let ext = extension_for_content_type(content_type)?;
            if data.is_empty() {
                return Err(ScoreError::AudioDecode("Empty audio buffer".to_string()));
            }
            if data.len() > MAX_SOURCE_BYTES {
                return Err(ScoreError::AudioDecode(format!(
                    "Audio buffer exceeds {} MiB limit",
                    MAX_SOURCE_BYTES / 1024 / 1024
                )));
            }
            tracing::debug!("Loading audio from {} byte buffer ({})", data.len(), ext);
            let mss =
                MediaSourceStream::new(Box::new(Cursor::new(data.clone())), Default::default());
            let mut hint = Hint::new();
            hint.with_extension(ext);
            hint.mime_type(content_type);
            decode_stream(mss, hint, cancel)
        }
    }
}

/// Convenience wrapper for callers holding a plain path.
pub fn load_audio_path(path: impl AsRef<Path>) -> Result<AudioBuffer> {
    load_audio(
        &PcmSource::Path(path.as_ref().to_path_buf()),
        &CancellationToken::default(),
    )
}

fn decode_stream(
    mss: MediaSourceStream,
    hint: Hint,
    cancel: &CancellationToken,
) -> Result<AudioBuffer> {
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &Default::default())
        .map_err(|e| ScoreError::AudioDecode(format!("Failed to probe format: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.sample_rate.is_some())
        .ok_or_else(|| ScoreError::AudioDecode("No audio tracks found".to_string()))?;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| ScoreError::AudioDecode("No sample rate found".to_string()))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(1)
        .max(1);

    if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&sample_rate) {
        return Err(ScoreError::AudioDecode(format!(
            "Sample rate {} Hz outside supported range [{}, {}]",
            sample_rate, MIN_SAMPLE_RATE_HZ, MAX_SAMPLE_RATE_HZ
        )));
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| ScoreError::AudioDecode(format!("Decoder error: {}", e)))?;

    let mut samples = Vec::new();
    let mut packet_count = 0u64;
    loop {
        if packet_count % 64 == 0 {
            cancel.check()?;
        }
        packet_count += 1;
        match format.next_packet() {
            Ok(packet) => match decoder.decode(&packet) {
                Ok(buf) => collect_samples(&mut samples, &buf),
                Err(symphonia::core::errors::Error::DecodeError(_)) => {
                    // Skip frames that cannot be decoded
                    continue;
                }
                Err(e) => return Err(ScoreError::AudioDecode(e.to_string())),
            },
            Err(symphonia::core::errors::Error::IoError(_)) => break,
            Err(symphonia::core::errors::Error::Unsupported(_)) => break,
            Err(e) => return Err(ScoreError::AudioDecode(e.to_string())),
        }
    }

    if samples.is_empty() {
        return Err(ScoreError::AudioDecode(
            "No audio samples decoded".to_string(),
        ));
    }
    if !samples.iter().all(|s| s.is_finite()) {
        return Err(ScoreError::AudioDecode(
            "Audio contains NaN or infinite values".to_string(),
        ));
    }

    tracing::debug!(
        "Decoded {} mono samples at {} Hz ({} source channels)",
        samples.len(),
        sample_rate,
        channels
    );

    Ok(AudioBuffer {
        sample_rate_hz: sample_rate,
        channels: channels.min(u8::MAX as usize) as u8,
        samples,
    })
}

/// Append one decoded packet as mono samples.
///
/// Normalization: signed integers divide by 2^(bits-1) (so i16 -> s/32768),
/// unsigned integers are re-centered first (u8 -> (s-128)/128). Floats are
/// clamped to [-1, 1].
fn collect_samples(samples: &mut Vec<f64>, buf: &AudioBufferRef) {
    macro_rules! mix_down {
        ($buf:expr, $norm:expr) => {{
            let n_frames = $buf.frames();
            if n_frames == 0 {
                return;
            }
            let ch_count = $buf.spec().channels.count().max(1);
            for frame_idx in 0..n_frames {
                let mut sum = 0.0f64;
                for ch in 0..ch_count {
                    sum += $norm($buf.chan(ch)[frame_idx]);
                }
                samples.push(sum / ch_count as f64);
            }
        }};
    }

    match buf {
        AudioBufferRef::F32(b) => mix_down!(b, |v: f32| (v as f64).clamp(-1.0, 1.0)),
        AudioBufferRef::F64(b) => mix_down!(b, |v: f64| v.clamp(-1.0, 1.0)),
        AudioBufferRef::S8(b) => mix_down!(b, |v: i8| v as f64 / 128.0),
        AudioBufferRef::S16(b) => mix_down!(b, |v: i16| v as f64 / 32768.0),
        AudioBufferRef::S24(b) => {
            mix_down!(b, |v: symphonia::core::sample::i24| v.into_i32() as f64
                / 8_388_608.0)
        }
        AudioBufferRef::S32(b) => mix_down!(b, |v: i32| v as f64 / 2_147_483_648.0),
        AudioBufferRef::U8(b) => mix_down!(b, |v: u8| (v as f64 - 128.0) / 128.0),
        AudioBufferRef::U16(b) => mix_down!(b, |v: u16| (v as f64 - 32768.0) / 32768.0),
        AudioBufferRef::U24(b) => {
            mix_down!(b, |v: symphonia::core::sample::u24| (v.into_u32() as f64
                - 8_388_608.0)
                / 8_388_608.0)
        }
        AudioBufferRef::U32(b) => {
            mix_down!(b, |v: u32| (v as f64 - 2_147_483_648.0) / 2_147_483_648.0)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal mono 16-bit PCM WAV byte buffer for decode tests.
    pub(crate) fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&1u16.to_le_bytes()); // mono
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// 440 Hz sine as i16 PCM, handy across the test suite.
    pub(crate) fn sine_wav(duration_ms: u32, sample_rate: u32) -> Vec<u8> {
        let n = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
        let samples: Vec<i16> = (0..n)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 20000.0) as i16
            })
            .collect();
        wav_bytes(&samples, sample_rate)
    }

    #[test]
    fn test_decode_wav_bytes() {
        let bytes = sine_wav(200, 44100);
        let buf = load_audio(&PcmSource::bytes(bytes, "audio/wav"), &CancellationToken::default()).unwrap();
        assert_eq!(buf.sample_rate_hz, 44100);
        assert_eq!(buf.channels, 1);
        assert!((buf.duration_ms() - 200.0).abs() < 1.0);
        assert!(buf.samples.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_normalization_scale() {
        // Full-scale negative i16 maps exactly to -1.0
        let bytes = wav_bytes(&[i16::MIN; 512], 44100);
        let buf = load_audio(&PcmSource::bytes(bytes, "audio/wav"), &CancellationToken::default()).unwrap();
        assert!((buf.samples[0] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_unknown_content_type() {
        let err = load_audio(
            &PcmSource::bytes(vec![0u8; 16], "video/mp4"),
            &CancellationToken::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "audio_decode");
    }

    #[test]
    fn test_rejects_empty_buffer() {
        let err = load_audio(
            &PcmSource::bytes(vec![], "audio/wav"),
            &CancellationToken::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "audio_decode");
    }

    #[test]
    fn test_rejects_garbage_bytes() {
        let err = load_audio(
            &PcmSource::bytes(vec![0xAB; 256], "audio/mp3"),
            &CancellationToken::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "audio_decode");
    }

    #[test]
    fn test_decode_honors_cancellation() {
        let cancel = CancellationToken::default();
        cancel.cancel();
        let err = load_audio(&PcmSource::bytes(sine_wav(500, 44100), "audio/wav"), &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn test_rejects_missing_path() {
        let err = load_audio_path("/nonexistent/take.wav").unwrap_err();
        assert_eq!(err.kind(), "audio_decode");
    }

    #[test]
    fn test_sample_at_ms_clamps() {
        let bytes = sine_wav(100, 44100);
        let buf = load_audio(&PcmSource::bytes(bytes, "audio/wav"), &CancellationToken::default()).unwrap();
        assert_eq!(buf.sample_at_ms(0.0), 0);
        assert_eq!(buf.sample_at_ms(1e9), buf.samples.len());
    }
}
