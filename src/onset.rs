// Onset detection
// Two detectors share this module:
//  - energy path: 20 ms RMS windows at 75 % overlap converted to dBFS, with a
//    dynamic threshold, a rising-edge rule, hysteresis on the exit, and a
//    debounce on accepted onsets (rhythm patterns);
//  - percussive path: rectified spectral flux with a median-based adaptive
//    threshold and local-maximum peak picking (note onsets).
//
// Copyright (C) 2025 Encore Team
// License: GPLv3

use crate::error::Result;
use crate::fft;
use crate::pipeline::CancellationToken;
use crate::{HYSTERESIS_DB, RISE_DB, SILENCE_DEFAULT_DB};
use ndarray::Array1;

const DB_FLOOR: f64 = 1e-10;
/// Dynamic threshold tracks the loudest window minus this many dB.
const PEAK_DROP_DB: f64 = 20.0;

/// Energy-onset detector configuration
#[derive(Clone, Debug)]
pub struct EnergyOnsetConfig {
    /// Absolute floor for the dynamic threshold (dBFS)
    pub silence_threshold_db: f64,
    /// Minimum spacing between accepted onsets (ms)
    pub min_onset_interval_ms: f64,
    /// RMS window length (ms)
    pub window_ms: f64,
}

impl Default for EnergyOnsetConfig {
    fn default() -> Self {
        Self {
            silence_threshold_db: SILENCE_DEFAULT_DB,
            min_onset_interval_ms: 100.0,
            window_ms: 20.0,
        }
    }
}

/// Detect onsets from the RMS energy envelope.
///
/// Returns strictly increasing onset times in milliseconds; consecutive
/// onsets are always at least `min_onset_interval_ms` apart.
pub fn detect_energy_onsets(
    samples: &[f64],
    sample_rate_hz: u32,
    config: &EnergyOnsetConfig,
    cancel: &CancellationToken,
) -> Result<Vec<f64>> {
    let window = ((sample_rate_hz as f64 * config.window_ms / 1000.0) as usize).max(1);
    let hop = (window / 4).max(1); // 75 % overlap

    // RMS envelope in dBFS
    let mut envelope: Vec<(f64, f64)> = Vec::new();
    let mut start = 0usize;
    while start + window <= samples.len() {
        if envelope.len() % 256 == 0 {
            cancel.check()?;
        }
        let chunk = &samples[start..start + window];
        let rms = (chunk.iter().map(|s| s * s).sum::<f64>() / window as f64).sqrt();
        let db = 20.0 * rms.max(DB_FLOOR).log10();
        let time_ms = start as f64 / sample_rate_hz as f64 * 1000.0;
        envelope.push((time_ms, db));
        start += hop;
    }

    if envelope.is_empty() {
        return Ok(Vec::new());
    }

    let peak_db = envelope.iter().map(|&(_, db)| db).fold(f64::MIN, f64::max);
    let threshold = (peak_db - PEAK_DROP_DB).max(config.silence_threshold_db);

    let mut onsets = Vec::new();
    let mut in_sound = false;
    let mut prev_db = f64::MIN;
    for &(time_ms, db) in &envelope {
        if !in_sound {
            // Rising edge: crossing the threshold with a clear jump
            if db > threshold && db > prev_db + RISE_DB {
                let accepted = onsets
                    .last()
                    .map_or(true, |&last| time_ms - last >= config.min_onset_interval_ms);
                if accepted {
                    onsets.push(time_ms);
                }
                in_sound = true;
            }
        } else if db < threshold - HYSTERESIS_DB {
            in_sound = false;
        }
        prev_db = db;
    }

    tracing::debug!(
        "Energy onset detection: {} onsets, threshold {:.1} dB (peak {:.1} dB)",
        onsets.len(),
        threshold,
        peak_db
    );

    Ok(onsets)
}

/// Percussive onset with its flux salience (0 to 1, relative to the loudest
/// flux peak in the buffer).
#[derive(Debug, Clone, Copy)]
pub struct FluxOnset {
    pub time_s: f64,
    pub salience: f64,
}

/// Spectral-flux onset detector configuration
#[derive(Clone, Debug)]
pub struct FluxOnsetConfig {
    pub fft_size: usize,
    pub hop_size: usize,
    /// Half width of the median window used for the adaptive threshold
    pub median_halfsize: usize,
    /// Multiplier on the local median; larger = less sensitive
    pub sensitivity: f64,
    /// Minimum spacing between reported onsets (ms)
    pub min_separation_ms: f64,
}

impl Default for FluxOnsetConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            hop_size: 512,
            median_halfsize: 8,
            sensitivity: 1.5,
            min_separation_ms: 50.0,
        }
    }
}

/// Detect percussive onsets via spectral flux.
pub fn detect_flux_onsets(
    samples: &[f64],
    sample_rate_hz: u32,
    config: &FluxOnsetConfig,
    cancel: &CancellationToken,
) -> Result<Vec<FluxOnset>> {
    let flux = flux_envelope(samples, config, cancel)?;
    if flux.len() < 3 {
        return Ok(Vec::new());
    }

    let max_flux = flux.iter().cloned().fold(0.0f64, f64::max);
    if max_flux <= 0.0 {
        return Ok(Vec::new());
    }

    // Local maxima above the adaptive threshold
    let mut peaks = Vec::new();
    for i in 1..flux.len() - 1 {
        let curr = flux[i];
        if curr > flux[i - 1] && curr > flux[i + 1] && curr > adaptive_threshold(&flux, i, config) {
            peaks.push(i);
        }
    }

    // Enforce minimum separation between onsets
    let frame_ms = config.hop_size as f64 / sample_rate_hz as f64 * 1000.0;
    let min_frames = (config.min_separation_ms / frame_ms).ceil() as usize;
    let mut filtered: Vec<usize> = Vec::new();
    for peak in peaks {
        if filtered
            .last()
            .map_or(true, |&last| peak - last >= min_frames.max(1))
        {
            filtered.push(peak);
        }
    }

    tracing::debug!("Spectral flux: {} onsets", filtered.len());

    Ok(filtered
        .into_iter()
        .map(|i| FluxOnset {
            time_s: i as f64 * config.hop_size as f64 / sample_rate_hz as f64,
            salience: flux[i] / max_flux,
        })
        .collect())
}

/// Rectified spectral flux envelope: sum of positive magnitude differences
/// between consecutive frames.
fn flux_envelope(
    samples: &[f64],
    config: &FluxOnsetConfig,
    cancel: &CancellationToken,
) -> Result<Array1<f64>> {
    if samples.len() < config.fft_size {
        return Ok(Array1::zeros(0));
    }
    let num_frames = (samples.len() - config.fft_size) / config.hop_size + 1;
    let mut flux = Array1::zeros(num_frames);
    let mut prev_mag: Option<Vec<f64>> = None;

    for frame_idx in 0..num_frames {
        if frame_idx % 64 == 0 {
            cancel.check()?;
        }
        let start = frame_idx * config.hop_size;
        let mag = fft::magnitude_spectrum(&samples[start..start + config.fft_size]);

        if let Some(ref prev) = prev_mag {
            flux[frame_idx] = mag
                .iter()
                .zip(prev.iter())
                .map(|(&curr, &p)| (curr - p).max(0.0))
                .sum();
        }
        prev_mag = Some(mag);
    }

    Ok(flux)
}

/// Adaptive threshold: local median times the sensitivity multiplier.
fn adaptive_threshold(flux: &Array1<f64>, index: usize, config: &FluxOnsetConfig) -> f64 {
    let start = index.saturating_sub(config.median_halfsize);
    let end = (index + config.median_halfsize + 1).min(flux.len());
    let mut window: Vec<f64> = flux.iter().skip(start).take(end - start).cloned().collect();
    window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = if window.len() % 2 == 0 {
        (window[window.len() / 2 - 1] + window[window.len() / 2]) / 2.0
    } else {
        window[window.len() / 2]
    };
    median * config.sensitivity + DB_FLOOR
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Click track with exponential-decay bursts at the given times.
    fn click_track(times_ms: &[f64], duration_ms: f64, sample_rate: u32) -> Vec<f64> {
        let n = (sample_rate as f64 * duration_ms / 1000.0) as usize;
        let mut samples = vec![0.0f64; n];
        for &t in times_ms {
            let start = (sample_rate as f64 * t / 1000.0) as usize;
            for j in 0..(sample_rate as usize / 100).min(n.saturating_sub(start)) {
                let env = (-(j as f64) / (sample_rate as f64 / 2000.0)).exp();
                let phase = 2.0 * std::f64::consts::PI * 1000.0 * j as f64 / sample_rate as f64;
                samples[start + j] = 0.8 * env * phase.sin();
            }
        }
        samples
    }

    #[test]
    fn test_energy_onsets_click_track() {
        let samples = click_track(&[0.0, 500.0, 1000.0, 1500.0], 2000.0, 44100);
        let cancel = CancellationToken::default();
        let onsets =
            detect_energy_onsets(&samples, 44100, &EnergyOnsetConfig::default(), &cancel).unwrap();

        assert_eq!(onsets.len(), 4, "onsets: {:?}", onsets);
        for (onset, expected) in onsets.iter().zip([0.0, 500.0, 1000.0, 1500.0]) {
            assert!(
                (onset - expected).abs() < 30.0,
                "onset {} vs expected {}",
                onset,
                expected
            );
        }
    }

    #[test]
    fn test_energy_onsets_debounce() {
        // Bursts 40 ms apart with a 100 ms debounce: only the first survives
        // each cluster
        let samples = click_track(&[200.0, 240.0, 280.0, 800.0], 1200.0, 44100);
        let cancel = CancellationToken::default();
        let onsets =
            detect_energy_onsets(&samples, 44100, &EnergyOnsetConfig::default(), &cancel).unwrap();

        for pair in onsets.windows(2) {
            assert!(pair[1] - pair[0] >= 100.0, "debounce violated: {:?}", onsets);
        }
    }

    #[test]
    fn test_energy_onsets_strictly_increasing() {
        let samples = click_track(&[0.0, 300.0, 600.0, 900.0, 1200.0], 1500.0, 44100);
        let cancel = CancellationToken::default();
        let onsets =
            detect_energy_onsets(&samples, 44100, &EnergyOnsetConfig::default(), &cancel).unwrap();
        for pair in onsets.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_energy_onsets_silence() {
        let samples = vec![0.0f64; 44100];
        let cancel = CancellationToken::default();
        let onsets =
            detect_energy_onsets(&samples, 44100, &EnergyOnsetConfig::default(), &cancel).unwrap();
        assert!(onsets.is_empty());
    }

    #[test]
    fn test_energy_onsets_hysteresis_no_flicker() {
        // A sustained tone should register one onset, not one per window
        let n = 44100;
        let samples: Vec<f64> = (0..n)
            .map(|i| 0.5 * (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 44100.0).sin())
            .collect();
        let cancel = CancellationToken::default();
        let onsets =
            detect_energy_onsets(&samples, 44100, &EnergyOnsetConfig::default(), &cancel).unwrap();
        assert!(onsets.len() <= 1, "flicker: {:?}", onsets);
    }

    #[test]
    fn test_flux_onsets_click_track() {
        let samples = click_track(&[100.0, 600.0, 1100.0], 1600.0, 44100);
        let cancel = CancellationToken::default();
        let onsets =
            detect_flux_onsets(&samples, 44100, &FluxOnsetConfig::default(), &cancel).unwrap();

        assert!(
            onsets.len() >= 3,
            "expected >= 3 onsets, got {}",
            onsets.len()
        );
        for onset in &onsets {
            assert!((0.0..=1.0).contains(&onset.salience));
        }
        // First onset near 100 ms
        assert!((onsets[0].time_s - 0.1).abs() < 0.06, "{:?}", onsets[0]);
    }

    #[test]
    fn test_flux_onsets_silence() {
        let samples = vec![0.0f64; 44100];
        let cancel = CancellationToken::default();
        let onsets =
            detect_flux_onsets(&samples, 44100, &FluxOnsetConfig::default(), &cancel).unwrap();
        assert!(onsets.is_empty());
    }

    #[test]
    fn test_flux_min_separation() {
        let samples = click_track(&[100.0, 130.0, 160.0, 800.0], 1200.0, 44100);
        let cancel = CancellationToken::default();
        let onsets =
            detect_flux_onsets(&samples, 44100, &FluxOnsetConfig::default(), &cancel).unwrap();
        for pair in onsets.windows(2) {
            assert!(pair[1].time_s - pair[0].time_s >= 0.04);
        }
    }

    #[test]
    fn test_cancellation_propagates() {
        let samples = click_track(&[0.0, 500.0], 1000.0, 44100);
        let cancel = CancellationToken::default();
        cancel.cancel();
        assert_eq!(
            detect_energy_onsets(&samples, 44100, &EnergyOnsetConfig::default(), &cancel)
                .unwrap_err()
                .kind(),
            "cancelled"
        );
        assert_eq!(
            detect_flux_onsets(&samples, 44100, &FluxOnsetConfig::default(), &cancel)
                .unwrap_err()
                .kind(),
            "cancelled"
        );
    }
}
