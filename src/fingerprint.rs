// Sound fingerprinting
// Short-time timbre descriptor for the segment starting at an onset: mean
// MFCC, spectral centroid/rolloff/flatness, zero-crossing rate, RMS energy,
// and transient length. Used to compare how a beat *sounds*, not just when it
// lands.

use crate::audio::AudioBuffer;
use crate::error::Result;
use crate::fft;
use crate::mel;
use crate::pipeline::CancellationToken;
use crate::windowing::FrameWindower;
use crate::{BUFFER_SIZE, MFCC_COEFFICIENTS, ROLLOFF_FRACTION, SEGMENT_DURATION_MS};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const FLOOR: f64 = 1e-10;
/// The transient ends at the first sample below this fraction of the peak.
const TRANSIENT_DECAY_FRACTION: f64 = 0.1;

/// Perceptual quality tag derived from centroid and ZCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SoundQuality {
    Sharp,
    Muffled,
    Clear,
}

impl SoundQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoundQuality::Sharp => "SHARP",
            SoundQuality::Muffled => "MUFFLED",
            SoundQuality::Clear => "CLEAR",
        }
    }
}

/// Timbre fingerprint of one onset segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundFingerprint {
    pub mfcc: Vec<f64>,
    pub spectral_centroid_hz: f64,
    pub spectral_rolloff_hz: f64,
    pub zero_crossing_rate: f64,
    pub rms_energy: f64,
    pub spectral_flatness: f64,
    pub transient_duration_ms: f64,
}

impl SoundFingerprint {
    /// All-zero fingerprint, emitted when a segment is empty.
    pub fn zero() -> Self {
        Self {
            mfcc: vec![0.0; MFCC_COEFFICIENTS],
            spectral_centroid_hz: 0.0,
            spectral_rolloff_hz: 0.0,
            zero_crossing_rate: 0.0,
            rms_energy: 0.0,
            spectral_flatness: 0.0,
            transient_duration_ms: 0.0,
        }
    }

    /// SHARP above 3.5 kHz centroid with busy ZCR, MUFFLED below 1.5 kHz or
    /// with a sluggish ZCR, CLEAR otherwise.
    pub fn quality(&self) -> SoundQuality {
        if self.spectral_centroid_hz > 3500.0 && self.zero_crossing_rate > 0.3 {
            SoundQuality::Sharp
        } else if self.spectral_centroid_hz < 1500.0 || self.zero_crossing_rate < 0.15 {
            SoundQuality::Muffled
        } else {
            SoundQuality::Clear
        }
    }
}

/// Fingerprint the 150 ms segment starting at `onset_ms` (absolute time).
pub fn fingerprint_at(buffer: &AudioBuffer, onset_ms: f64) -> SoundFingerprint {
    let start = buffer.sample_at_ms(onset_ms);
    let end = buffer.sample_at_ms(onset_ms + SEGMENT_DURATION_MS);
    if start >= end {
        return SoundFingerprint::zero();
    }
    let segment = &buffer.samples[start..end];

    let (mags, fft_size) = fft::padded_magnitude_spectrum(segment);
    let freqs = fft::fft_frequencies(buffer.sample_rate_hz, fft_size);

    SoundFingerprint {
        mfcc: segment_mfcc(segment, buffer.sample_rate_hz),
        spectral_centroid_hz: spectral_centroid(&mags, &freqs),
        spectral_rolloff_hz: spectral_rolloff(&mags, &freqs, ROLLOFF_FRACTION),
        zero_crossing_rate: zero_crossing_rate(segment),
        rms_energy: rms(segment).clamp(0.0, 1.0),
        spectral_flatness: spectral_flatness(&mags),
        transient_duration_ms: transient_duration_ms(segment, buffer.sample_rate_hz),
    }
}

/// Fingerprint every onset of a sequence (absolute times, ms).
pub fn fingerprint_onsets(
    buffer: &AudioBuffer,
    onsets_ms: &[f64],
    cancel: &CancellationToken,
) -> Result<Vec<SoundFingerprint>> {
    tracing::debug!("Fingerprinting {} onset segments", onsets_ms.len());
    onsets_ms
        .par_iter()
        .map(|&onset| {
            cancel.check()?;
            Ok(fingerprint_at(buffer, onset))
        })
        .collect()
}

/// Mean MFCC over the segment. Segments shorter than one analysis frame are
/// zero-padded into a single frame.
fn segment_mfcc(segment: &[f64], sample_rate_hz: u32) -> Vec<f64> {
    if segment.len() < BUFFER_SIZE {
        let mut padded = segment.to_vec();
        padded.resize(BUFFER_SIZE, 0.0);
        return mel::mfcc_frame(&padded, sample_rate_hz);
    }

    let mut acc = vec![0.0f64; MFCC_COEFFICIENTS];
    let mut count = 0usize;
    for frame in FrameWindower::new(segment, sample_rate_hz, BUFFER_SIZE, BUFFER_SIZE / 2) {
        let mfcc = mel::mfcc_frame(frame.samples, sample_rate_hz);
        for (a, c) in acc.iter_mut().zip(mfcc.iter()) {
            *a += c;
        }
        count += 1;
    }
    if count == 0 {
        return vec![0.0; MFCC_COEFFICIENTS];
    }
    for a in &mut acc {
        *a /= count as f64;
    }
    acc
}

/// Magnitude-weighted mean frequency.
fn spectral_centroid(mags: &[f64], freqs: &[f64]) -> f64 {
    let total: f64 = mags.iter().sum();
    if total < FLOOR {
        return 0.0;
    }
    mags.iter()
        .zip(freqs.iter())
        .map(|(m, f)| m * f)
        .sum::<f64>()
        / total
}

/// Lowest frequency below which `fraction` of the total spectral power lies.
fn spectral_rolloff(mags: &[f64], freqs: &[f64], fraction: f64) -> f64 {
    let total_power: f64 = mags.iter().map(|m| m * m).sum();
    if total_power < FLOOR {
        return 0.0;
    }
    let threshold = fraction * total_power;
    let mut cumulative = 0.0;
    for (m, f) in mags.iter().zip(freqs.iter()) {
        cumulative += m * m;
        if cumulative >= threshold {
            return *f;
        }
    }
    freqs.last().copied().unwrap_or(0.0)
}

/// Geometric over arithmetic mean of the magnitude spectrum.
fn spectral_flatness(mags: &[f64]) -> f64 {
    let nonzero: Vec<f64> = mags.iter().filter(|&&m| m > FLOOR).copied().collect();
    if nonzero.is_empty() {
        return 0.0;
    }
    let log_mean = nonzero.iter().map(|m| m.ln()).sum::<f64>() / nonzero.len() as f64;
    let arithmetic = nonzero.iter().sum::<f64>() / nonzero.len() as f64;
    if arithmetic < FLOOR {
        return 0.0;
    }
    (log_mean.exp() / arithmetic).clamp(0.0, 1.0)
}

fn zero_crossing_rate(segment: &[f64]) -> f64 {
    if segment.len() < 2 {
        return 0.0;
    }
    let crossings = segment
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f64 / segment.len() as f64
}

fn rms(segment: &[f64]) -> f64 {
    if segment.is_empty() {
        return 0.0;
    }
    (segment.iter().map(|s| s * s).sum::<f64>() / segment.len() as f64).sqrt()
}

/// Time from the peak sample to the first later sample below 10 % of the peak.
fn transient_duration_ms(segment: &[f64], sample_rate_hz: u32) -> f64 {
    let (peak_idx, peak) = segment
        .iter()
        .map(|s| s.abs())
        .enumerate()
        .fold((0usize, 0.0f64), |(bi, bv), (i, v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        });
    if peak < FLOOR {
        return 0.0;
    }
    let decay_level = TRANSIENT_DECAY_FRACTION * peak;
    let end_idx = segment[peak_idx..]
        .iter()
        .position(|s| s.abs() < decay_level)
        .map(|offset| peak_idx + offset)
        .unwrap_or(segment.len());
    (end_idx - peak_idx) as f64 / sample_rate_hz as f64 * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_from(samples: Vec<f64>, sample_rate_hz: u32) -> AudioBuffer {
        AudioBuffer {
            sample_rate_hz,
            channels: 1,
            samples,
        }
    }

    fn sine(freq: f64, sample_rate: u32, n: usize, amp: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                amp * (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin()
            })
            .collect()
    }

    #[test]
    fn test_zero_fingerprint_past_buffer_end() {
        let buffer = buffer_from(vec![0.5; 1000], 44100);
        let fp = fingerprint_at(&buffer, 10_000.0);
        assert_eq!(fp.rms_energy, 0.0);
        assert_eq!(fp.mfcc, vec![0.0; MFCC_COEFFICIENTS]);
    }

    #[test]
    fn test_centroid_tracks_tone_frequency() {
        let buffer = buffer_from(sine(3000.0, 44100, 44100, 0.8), 44100);
        let fp = fingerprint_at(&buffer, 0.0);
        assert!(
            (fp.spectral_centroid_hz - 3000.0).abs() < 600.0,
            "centroid {}",
            fp.spectral_centroid_hz
        );
    }

    #[test]
    fn test_rolloff_above_centroid_for_tone() {
        let buffer = buffer_from(sine(1000.0, 44100, 44100, 0.8), 44100);
        let fp = fingerprint_at(&buffer, 0.0);
        assert!(fp.spectral_rolloff_hz >= 900.0);
        assert!(fp.spectral_rolloff_hz < 2000.0);
    }

    #[test]
    fn test_flatness_tone_vs_segment_of_silence() {
        let buffer = buffer_from(sine(1000.0, 44100, 44100, 0.8), 44100);
        let fp = fingerprint_at(&buffer, 0.0);
        // Pure tone: very low flatness
        assert!(fp.spectral_flatness < 0.3, "flatness {}", fp.spectral_flatness);
    }

    #[test]
    fn test_zcr_scales_with_frequency() {
        let slow = fingerprint_at(&buffer_from(sine(200.0, 44100, 44100, 0.8), 44100), 0.0);
        let fast = fingerprint_at(&buffer_from(sine(8000.0, 44100, 44100, 0.8), 44100), 0.0);
        assert!(fast.zero_crossing_rate > slow.zero_crossing_rate);
        // ZCR of a sine is 2f/sr
        let expected = 2.0 * 8000.0 / 44100.0;
        assert!((fast.zero_crossing_rate - expected).abs() < 0.05);
    }

    #[test]
    fn test_transient_duration_of_decaying_click() {
        let sample_rate = 44100u32;
        let mut samples = vec![0.0f64; 44100];
        // 1.0 peak decaying with ~2 ms time constant
        for j in 0..4410 {
            samples[j] = (-(j as f64) / 88.2).exp();
        }
        let buffer = buffer_from(samples, sample_rate);
        let fp = fingerprint_at(&buffer, 0.0);
        // Falls below 0.1 * peak after ln(10) time constants ~ 4.6 ms
        assert!(
            (fp.transient_duration_ms - 4.6).abs() < 1.5,
            "transient {} ms",
            fp.transient_duration_ms
        );
    }

    #[test]
    fn test_quality_tags() {
        let sharp = SoundFingerprint {
            spectral_centroid_hz: 5000.0,
            zero_crossing_rate: 0.4,
            ..SoundFingerprint::zero()
        };
        assert_eq!(sharp.quality(), SoundQuality::Sharp);

        let muffled = SoundFingerprint {
            spectral_centroid_hz: 900.0,
            zero_crossing_rate: 0.2,
            ..SoundFingerprint::zero()
        };
        assert_eq!(muffled.quality(), SoundQuality::Muffled);

        let clear = SoundFingerprint {
            spectral_centroid_hz: 2500.0,
            zero_crossing_rate: 0.2,
            ..SoundFingerprint::zero()
        };
        assert_eq!(clear.quality(), SoundQuality::Clear);
    }

    #[test]
    fn test_fingerprint_onsets_count_and_cancel() {
        let buffer = buffer_from(sine(1000.0, 44100, 44100, 0.8), 44100);
        let cancel = CancellationToken::default();
        let fps = fingerprint_onsets(&buffer, &[0.0, 250.0, 500.0], &cancel).unwrap();
        assert_eq!(fps.len(), 3);

        cancel.cancel();
        let err = fingerprint_onsets(&buffer, &[0.0], &cancel).unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn test_short_segment_padded_mfcc() {
        // 30 ms buffer: segment shorter than one frame still yields 13 MFCCs
        let buffer = buffer_from(sine(440.0, 44100, 1323, 0.8), 44100);
        let fp = fingerprint_at(&buffer, 0.0);
        assert_eq!(fp.mfcc.len(), MFCC_COEFFICIENTS);
        assert!(fp.mfcc.iter().any(|c| c.abs() > 0.0));
    }
}
