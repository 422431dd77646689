/// YIN Fundamental Frequency Detection
///
/// Autocorrelation-based monophonic pitch detection using the YIN algorithm.
///
/// Reference:
/// de Cheveigné, Alain & Kawahara, Hideki.
/// "YIN, a fundamental frequency estimator for speech and music."
/// JASA 111, 2002.
use crate::error::Result;
use crate::pipeline::CancellationToken;
use crate::windowing::FrameWindower;
use rayon::prelude::*;

/// YIN detector configuration
#[derive(Clone, Debug)]
pub struct YinConfig {
    /// Minimum detectable frequency (Hz)
    pub fmin: f64,
    /// Maximum detectable frequency (Hz)
    pub fmax: f64,
    /// Absolute threshold on the cumulative mean normalized difference
    pub threshold: f64,
}

impl Default for YinConfig {
    fn default() -> Self {
        Self {
            fmin: 60.0,
            fmax: 1600.0,
            threshold: 0.1,
        }
    }
}

/// Pitch estimate for one frame. `pitch_hz = -1` marks an unvoiced frame.
#[derive(Debug, Clone, Copy)]
pub struct PitchEstimate {
    pub pitch_hz: f64,
    pub probability: f64,
}

impl PitchEstimate {
    pub const UNVOICED: PitchEstimate = PitchEstimate {
        pitch_hz: -1.0,
        probability: 0.0,
    };

    pub fn is_voiced(&self) -> bool {
        self.pitch_hz > 0.0
    }
}

/// Voiced/unvoiced pitch sample on the analysis timeline.
#[derive(Debug, Clone, Copy)]
pub struct PitchFrame {
    pub time_ms: f64,
    pub pitch_hz: f64,
    pub probability: f64,
}

/// Per-frame YIN pitch detector. Stateless across frames; the caller
/// aggregates estimates into a contour.
pub struct YinDetector {
    sample_rate_hz: u32,
    config: YinConfig,
}

impl YinDetector {
    pub fn new(sample_rate_hz: u32, config: YinConfig) -> Self {
        Self {
            sample_rate_hz,
            config,
        }
    }

    /// Estimate the fundamental frequency of a single frame.
    ///
    /// Steps: difference function over half the frame, cumulative mean
    /// normalized difference, first dip under the absolute threshold
    /// (descending to its local minimum), parabolic interpolation of the lag.
    pub fn detect(&self, frame: &[f64]) -> PitchEstimate {
        let w = frame.len() / 2;
        if w < 2 {
            return PitchEstimate::UNVOICED;
        }

        let sr = self.sample_rate_hz as f64;
        let tau_min = ((sr / self.config.fmax).floor() as usize).max(2);
        let tau_max = ((sr / self.config.fmin).ceil() as usize).min(w);
        if tau_min >= tau_max {
            return PitchEstimate::UNVOICED;
        }

        // Difference function d(tau) = sum_j (x[j] - x[j+tau])^2
        let mut diff = vec![0.0f64; tau_max + 1];
        for tau in 1..=tau_max {
            let mut acc = 0.0;
            for j in 0..w {
                let d = frame[j] - frame[j + tau];
                acc += d * d;
            }
            diff[tau] = acc;
        }

        // Cumulative mean normalized difference d'(tau)
        let mut cmnd = vec![1.0f64; tau_max + 1];
        let mut running_sum = 0.0;
        for tau in 1..=tau_max {
            running_sum += diff[tau];
            cmnd[tau] = if running_sum > 0.0 {
                diff[tau] * tau as f64 / running_sum
            } else {
                1.0
            };
        }

        // First tau below the absolute threshold, pulled down to its local minimum
        let mut tau = tau_min;
        let mut found = false;
        while tau < tau_max {
            if cmnd[tau] < self.config.threshold {
                while tau + 1 < tau_max && cmnd[tau + 1] < cmnd[tau] {
                    tau += 1;
                }
                found = true;
                break;
            }
            tau += 1;
        }
        if !found {
            return PitchEstimate::UNVOICED;
        }

        let refined_tau = parabolic_interpolation(&cmnd, tau);
        if refined_tau <= 0.0 {
            return PitchEstimate::UNVOICED;
        }

        PitchEstimate {
            pitch_hz: sr / refined_tau,
            probability: (1.0 - cmnd[tau]).clamp(0.0, 1.0),
        }
    }

    /// Pitch contour over the whole buffer. One `PitchFrame` per analysis
    /// window; unvoiced frames carry `pitch_hz = -1`.
    pub fn track(
        &self,
        samples: &[f64],
        buffer_size: usize,
        hop_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<PitchFrame>> {
        let frames: Vec<(f64, usize)> =
            FrameWindower::new(samples, self.sample_rate_hz, buffer_size, hop_size)
                .map(|f| (f.start_ms, (f.index as usize) * hop_size))
                .collect();

        tracing::debug!("YIN tracking {} frames", frames.len());

        frames
            .par_iter()
            .map(|&(start_ms, start)| {
                cancel.check()?;
                let estimate = self.detect(&samples[start..start + buffer_size]);
                Ok(PitchFrame {
                    time_ms: start_ms,
                    pitch_hz: estimate.pitch_hz,
                    probability: estimate.probability,
                })
            })
            .collect()
    }
}

/// Refine the lag estimate around `tau` with a parabola through the
/// neighboring CMND values.
fn parabolic_interpolation(cmnd: &[f64], tau: usize) -> f64 {
    if tau == 0 || tau + 1 >= cmnd.len() {
        return tau as f64;
    }
    let (a, b, c) = (cmnd[tau - 1], cmnd[tau], cmnd[tau + 1]);
    let denom = a - 2.0 * b + c;
    if denom.abs() < 1e-12 {
        return tau as f64;
    }
    tau as f64 + 0.5 * (a - c) / denom
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
    fn test_detects_440hz() {
        let detector = YinDetector::new(44100, YinConfig::default());
        let frame = sine(440.0, 44100, 2048);
        let estimate = detector.detect(&frame);
        assert!(estimate.is_voiced());
        assert!(
            (estimate.pitch_hz - 440.0).abs() < 5.0,
            "detected {} Hz",
            estimate.pitch_hz
        );
        assert!(estimate.probability > 0.8);
    }

    #[test]
    fn test_detects_220hz() {
        let detector = YinDetector::new(44100, YinConfig::default());
        let frame = sine(220.0, 44100, 2048);
        let estimate = detector.detect(&frame);
        assert!(estimate.is_voiced());
        assert!(
            (estimate.pitch_hz - 220.0).abs() < 3.0,
            "detected {} Hz",
            estimate.pitch_hz
        );
    }

    #[test]
    fn test_silence_is_unvoiced() {
        let detector = YinDetector::new(44100, YinConfig::default());
        let estimate = detector.detect(&vec![0.0; 2048]);
        assert!(!estimate.is_voiced());
        assert_eq!(estimate.pitch_hz, -1.0);
        assert_eq!(estimate.probability, 0.0);
    }

    #[test]
    fn test_noise_is_unvoiced() {
        let detector = YinDetector::new(44100, YinConfig::default());
        // Deterministic pseudo-noise
        let mut state = 0x2545F4914F6CDD1Du64;
        let frame: Vec<f64> = (0..2048)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 33) as f64 / (u32::MAX as f64) - 0.5
            })
            .collect();
        let estimate = detector.detect(&frame);
        // White noise has no stable period under the default threshold
        assert!(estimate.probability < 0.95);
    }

    #[test]
    fn test_track_timeline() {
        let detector = YinDetector::new(44100, YinConfig::default());
        let samples = sine(330.0, 44100, 44100);
        let cancel = CancellationToken::default();
        let contour = detector.track(&samples, 2048, 512, &cancel).unwrap();
        assert_eq!(contour.len(), (44100 - 2048) / 512 + 1);
        assert_eq!(contour[0].time_ms, 0.0);

        let voiced: Vec<_> = contour.iter().filter(|f| f.pitch_hz > 0.0).collect();
        assert!(voiced.len() > contour.len() / 2);
        for f in voiced {
            assert!((f.pitch_hz - 330.0).abs() < 10.0);
        }
    }

    #[test]
    fn test_track_cancellation() {
        let detector = YinDetector::new(44100, YinConfig::default());
        let samples = sine(330.0, 44100, 44100);
        let cancel = CancellationToken::default();
        cancel.cancel();
        let err = detector.track(&samples, 2048, 512, &cancel).unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }
}
