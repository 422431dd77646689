// FFT and spectral helpers
//
// Real-input forward FFT with process-wide plan and window caches. Plans and
// Hann windows are immutable once built; the caches are keyed by FFT size and
// shared by all concurrent pipeline invocations.

use lru::LruCache;
use num_complex::Complex64;
use parking_lot::Mutex;
use realfft::{RealFftPlanner, RealToComplex};
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

const PLAN_CACHE_CAPACITY: usize = 16;

static PLAN_CACHE: OnceLock<Mutex<LruCache<usize, Arc<dyn RealToComplex<f64>>>>> = OnceLock::new();
static WINDOW_CACHE: OnceLock<Mutex<LruCache<usize, Arc<Vec<f64>>>>> = OnceLock::new();

fn plan(fft_size: usize) -> Arc<dyn RealToComplex<f64>> {
    let cache = PLAN_CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(NonZeroUsize::new(PLAN_CACHE_CAPACITY).unwrap()))
    });
    let mut cache = cache.lock();
    if let Some(plan) = cache.get(&fft_size) {
        return plan.clone();
    }
    let plan = RealFftPlanner::<f64>::new().plan_fft_forward(fft_size);
    cache.put(fft_size, plan.clone());
    plan
}

/// Hann window of the given size, cached process-wide.
pub fn hann_window(size: usize) -> Arc<Vec<f64>> {
    let cache = WINDOW_CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(NonZeroUsize::new(PLAN_CACHE_CAPACITY).unwrap()))
    });
    let mut cache = cache.lock();
    if let Some(window) = cache.get(&size) {
        return window.clone();
    }
    let window: Arc<Vec<f64>> = Arc::new(
        (0..size)
            .map(|n| {
                0.5 * (1.0
                    - (2.0 * std::f64::consts::PI * n as f64 / (size.max(2) - 1) as f64).cos())
            })
            .collect(),
    );
    cache.put(size, window.clone());
    window
}

fn bin_magnitudes(spectrum: &[Complex64]) -> Vec<f64> {
    spectrum.iter().map(|c| c.norm()).collect()
}

/// Magnitude spectrum of a Hann-windowed frame (`frame.len()/2 + 1` bins).
pub fn magnitude_spectrum(frame: &[f64]) -> Vec<f64> {
    let fft_size = frame.len();
    let window = hann_window(fft_size);
    let fft = plan(fft_size);

    let mut input: Vec<f64> = frame
        .iter()
        .zip(window.iter())
        .map(|(s, w)| s * w)
        .collect();
    let mut output = fft.make_output_vec();
    // realfft only errors on mismatched buffer lengths, which we control here
    if fft.process(&mut input, &mut output).is_err() {
        return vec![0.0; fft_size / 2 + 1];
    }
    bin_magnitudes(&output)
}

/// Magnitude spectrum of an arbitrary-length segment, zero-padded up to the
/// next power of two. Returns the magnitudes and the FFT size used.
pub fn padded_magnitude_spectrum(samples: &[f64]) -> (Vec<f64>, usize) {
    if samples.is_empty() {
        return (Vec::new(), 0);
    }
    let fft_size = samples.len().next_power_of_two();
    let window = hann_window(samples.len());
    let fft = plan(fft_size);

    let mut input = vec![0.0f64; fft_size];
    for (i, (s, w)) in samples.iter().zip(window.iter()).enumerate() {
        input[i] = s * w;
    }
    let mut output = fft.make_output_vec();
    if fft.process(&mut input, &mut output).is_err() {
        return (vec![0.0; fft_size / 2 + 1], fft_size);
    }
    (bin_magnitudes(&output), fft_size)
}

/// Power spectrum (squared magnitudes) of a Hann-windowed frame.
pub fn power_spectrum(frame: &[f64]) -> Vec<f64> {
    magnitude_spectrum(frame).iter().map(|m| m * m).collect()
}

/// Center frequency in Hz of each spectrum bin.
pub fn fft_frequencies(sample_rate_hz: u32, fft_size: usize) -> Vec<f64> {
    (0..=fft_size / 2)
        .map(|k| k as f64 * sample_rate_hz as f64 / fft_size as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: u32, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin())
            .collect()
    }

    #[test]
    fn test_hann_window_symmetry() {
        let window = hann_window(512);
        assert_eq!(window.len(), 512);
        assert!((window[0]).abs() < 1e-9);
        assert!((window[1] - window[510]).abs() < 1e-9);
    }

    #[test]
    fn test_magnitude_spectrum_peak_bin() {
        // 1 kHz tone at 44.1 kHz in a 2048 frame lands near bin 46
        let frame = sine(1000.0, 44100, 2048);
        let mags = magnitude_spectrum(&frame);
        assert_eq!(mags.len(), 1025);

        let peak_bin = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        let peak_hz = peak_bin as f64 * 44100.0 / 2048.0;
        assert!((peak_hz - 1000.0).abs() < 50.0, "peak at {} Hz", peak_hz);
    }

    #[test]
    fn test_padded_spectrum_pow2() {
        let segment = sine(500.0, 44100, 6615); // 150 ms
        let (mags, fft_size) = padded_magnitude_spectrum(&segment);
        assert_eq!(fft_size, 8192);
        assert_eq!(mags.len(), 4097);
    }

    #[test]
    fn test_fft_frequencies_range() {
        let freqs = fft_frequencies(44100, 2048);
        assert_eq!(freqs.len(), 1025);
        assert_eq!(freqs[0], 0.0);
        assert!((freqs[1024] - 22050.0).abs() < 1e-6);
    }

    #[test]
    fn test_plan_cache_reuse() {
        // Two calls with the same size must agree exactly (same plan)
        let frame = sine(440.0, 44100, 1024);
        let a = magnitude_spectrum(&frame);
        let b = magnitude_spectrum(&frame);
        assert_eq!(a, b);
    }
}
