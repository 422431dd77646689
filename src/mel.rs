// MFCC extraction
// Magnitude FFT -> 40 triangular mel filters -> log energies -> DCT-II,
// keeping the first 13 coefficients. The filterbank spans 300 Hz to Nyquist
// and is cached process-wide per (sample_rate, fft_size).
//
// Copyright (C) 2025 Encore Team
// License: GPLv3

use crate::error::Result;
use crate::fft;
use crate::pipeline::CancellationToken;
use crate::windowing::FrameWindower;
use crate::{BUFFER_SIZE, MEL_LOW_HZ, MFCC_COEFFICIENTS, NUM_MEL_FILTERS};
use lru::LruCache;
use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

const LOG_FLOOR: f64 = 1e-10;
const FILTERBANK_CACHE_CAPACITY: usize = 8;

static FILTERBANK_CACHE: OnceLock<Mutex<LruCache<(u32, usize), Arc<Array2<f64>>>>> =
    OnceLock::new();

/// Hz to mel: 2595 * log10(1 + f/700)
pub fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

/// Mel to Hz, inverse of `hz_to_mel`.
pub fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank matrix of shape (NUM_MEL_FILTERS, fft_size/2 + 1).
pub fn mel_filterbank(sample_rate_hz: u32, fft_size: usize) -> Arc<Array2<f64>> {
    let cache = FILTERBANK_CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(FILTERBANK_CACHE_CAPACITY).unwrap(),
        ))
    });
    let key = (sample_rate_hz, fft_size);
    let mut cache = cache.lock();
    if let Some(fb) = cache.get(&key) {
        return fb.clone();
    }
    let fb = Arc::new(build_filterbank(sample_rate_hz, fft_size));
    cache.put(key, fb.clone());
    fb
}

fn build_filterbank(sample_rate_hz: u32, fft_size: usize) -> Array2<f64> {
    let n_bins = fft_size / 2 + 1;
    let nyquist = sample_rate_hz as f64 / 2.0;

    let mel_low = hz_to_mel(MEL_LOW_HZ);
    let mel_high = hz_to_mel(nyquist);

    // NUM_MEL_FILTERS triangles need NUM_MEL_FILTERS + 2 edge points
    let edges: Vec<f64> = (0..NUM_MEL_FILTERS + 2)
        .map(|i| {
            mel_to_hz(mel_low + (mel_high - mel_low) * i as f64 / (NUM_MEL_FILTERS + 1) as f64)
        })
        .collect();

    let bin_hz = sample_rate_hz as f64 / fft_size as f64;
    let mut fb = Array2::zeros((NUM_MEL_FILTERS, n_bins));

    for m in 0..NUM_MEL_FILTERS {
        let (lower, center, upper) = (edges[m], edges[m + 1], edges[m + 2]);
        for k in 0..n_bins {
            let f = k as f64 * bin_hz;
            let weight = if f <= lower || f >= upper {
                0.0
            } else if f <= center {
                (f - lower) / (center - lower).max(LOG_FLOOR)
            } else {
                (upper - f) / (upper - center).max(LOG_FLOOR)
            };
            fb[[m, k]] = weight;
        }
    }

    fb
}

/// DCT-II of `input`, returning the first `n_out` coefficients.
pub fn dct_ii(input: &[f64], n_out: usize) -> Vec<f64> {
    let n = input.len();
    if n == 0 {
        return vec![0.0; n_out];
    }
    (0..n_out)
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(i, &x)| {
                    x * (std::f64::consts::PI / n as f64 * (i as f64 + 0.5) * k as f64).cos()
                })
                .sum()
        })
        .collect()
}

/// 13-coefficient MFCC vector for one analysis frame.
pub fn mfcc_frame(frame: &[f64], sample_rate_hz: u32) -> Vec<f64> {
    let mags = Array1::from(fft::magnitude_spectrum(frame));
    let fb = mel_filterbank(sample_rate_hz, frame.len());
    let energies = fb.dot(&mags);
    let log_energies: Vec<f64> = energies.iter().map(|e| e.max(LOG_FLOOR).ln()).collect();
    dct_ii(&log_energies, MFCC_COEFFICIENTS)
}

/// MFCC vectors over the whole buffer at 50 % frame overlap.
pub fn mfcc_sequence(
    samples: &[f64],
    sample_rate_hz: u32,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f64>>> {
    let hop = BUFFER_SIZE / 2;
    let starts: Vec<usize> = FrameWindower::new(samples, sample_rate_hz, BUFFER_SIZE, hop)
        .map(|f| (f.index as usize) * hop)
        .collect();

    tracing::debug!("Extracting MFCCs over {} frames", starts.len());

    starts
        .par_iter()
        .map(|&start| {
            cancel.check()?;
            Ok(mfcc_frame(&samples[start..start + BUFFER_SIZE], sample_rate_hz))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [300.0, 440.0, 1000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 999.98).abs() < 0.5);
    }

    #[test]
    fn test_filterbank_shape_and_coverage() {
        let fb = mel_filterbank(44100, 2048);
        assert_eq!(fb.shape(), &[NUM_MEL_FILTERS, 1025]);
        // Every filter must have at least one nonzero weight
        for m in 0..NUM_MEL_FILTERS {
            let row_sum: f64 = fb.row(m).sum();
            assert!(row_sum > 0.0, "filter {} is empty", m);
        }
        // Nothing below 300 Hz
        let low_bins = (MEL_LOW_HZ * 2048.0 / 44100.0) as usize;
        for k in 0..low_bins {
            for m in 0..NUM_MEL_FILTERS {
                assert_eq!(fb[[m, k]], 0.0);
            }
        }
    }

    #[test]
    fn test_dct_constant_input() {
        // DCT-II of a constant concentrates in coefficient 0
        let out = dct_ii(&[1.0; 16], 4);
        assert!((out[0] - 16.0).abs() < 1e-9);
        for c in &out[1..] {
            assert!(c.abs() < 1e-9);
        }
    }

    #[test]
    fn test_mfcc_frame_len() {
        let frame: Vec<f64> = (0..2048)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 44100.0).sin())
            .collect();
        let mfcc = mfcc_frame(&frame, 44100);
        assert_eq!(mfcc.len(), MFCC_COEFFICIENTS);
        assert!(mfcc.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_mfcc_sequence_overlap() {
        let samples = vec![0.1; 44100];
        let cancel = CancellationToken::default();
        let seq = mfcc_sequence(&samples, 44100, &cancel).unwrap();
        let expected = (44100 - BUFFER_SIZE) / (BUFFER_SIZE / 2) + 1;
        assert_eq!(seq.len(), expected);
    }

    #[test]
    fn test_mfcc_sequence_cancellation() {
        let samples = vec![0.1; 44100];
        let cancel = CancellationToken::default();
        cancel.cancel();
        let err = mfcc_sequence(&samples, 44100, &cancel).unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn test_distinct_tones_distinct_mfcc() {
        let tone = |freq: f64| -> Vec<f64> {
            (0..2048)
                .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / 44100.0).sin())
                .collect()
        };
        let a = mfcc_frame(&tone(220.0), 44100);
        let b = mfcc_frame(&tone(3000.0), 44100);
        let dist: f64 = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt();
        assert!(dist > 1.0, "MFCCs of distant tones too close: {}", dist);
    }
}
