// Rhythm pattern extraction and scoring
//
// A RhythmPattern is the persisted record of a clapped/tapped reference take:
// onset times normalized to the first beat, the interval sequence, an interval
// BPM estimate, and optionally one sound fingerprint per beat. Scoring pairs
// user onsets with reference onsets by index inside an exponential tolerance
// curve; a constant lag is forgiven by aligning the user take to its own first
// onset.
//
// Copyright (C) 2025 Encore Team
// License: GPLv3

use crate::audio::AudioBuffer;
use crate::dtw;
use crate::error::Result;
use crate::fingerprint::{fingerprint_onsets, SoundFingerprint};
use crate::onset::{detect_energy_onsets, EnergyOnsetConfig};
use crate::pipeline::CancellationToken;
use crate::result::{ScoringResult, SoundComparisonDetail};
use crate::scoring::cosine_similarity;
use crate::{DEFAULT_SOUND_WEIGHT, DEFAULT_TIMING_WEIGHT};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Beats closer than this to the reference count as perfect (ms).
const PERFECT_BEAT_MS: f64 = 50.0;
/// Beats closer than this count as good (ms).
const GOOD_BEAT_MS: f64 = 150.0;
/// Overall-score penalty per beat of count mismatch.
const BEAT_COUNT_PENALTY: f64 = 5.0;
/// Fallback mean interval for patterns without intervals (ms).
const DEFAULT_AVG_INTERVAL_MS: f64 = 500.0;
/// Display clamp for interval-derived BPM estimates.
const BPM_RANGE: (f64, f64) = (30.0, 300.0);

const MFCC_SOUND_WEIGHT: f64 = 0.6;
const BRIGHTNESS_SOUND_WEIGHT: f64 = 0.25;
const ENERGY_SOUND_WEIGHT: f64 = 0.15;

fn default_version() -> u32 {
    1
}
fn default_time_signature() -> String {
    "4/4".to_string()
}
fn default_timing_weight() -> f64 {
    DEFAULT_TIMING_WEIGHT
}
fn default_sound_weight() -> f64 {
    DEFAULT_SOUND_WEIGHT
}

/// Persisted rhythm reference pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RhythmPattern {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Onset times normalized so the first beat is at 0 ms.
    pub onset_times_ms: Vec<f64>,
    pub intervals_ms: Vec<f64>,
    pub estimated_bpm: u32,
    #[serde(default = "default_time_signature")]
    pub time_signature: String,
    pub total_beats: u32,
    pub trimmed_start_ms: f64,
    pub trimmed_end_ms: f64,
    pub original_duration_ms: f64,
    pub silence_threshold_db: f64,
    pub min_onset_interval_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beat_fingerprints: Option<Vec<SoundFingerprint>>,
    #[serde(default)]
    pub sound_similarity_enabled: bool,
    #[serde(default = "default_timing_weight")]
    pub timing_weight: f64,
    #[serde(default = "default_sound_weight")]
    pub sound_weight: f64,
}

impl RhythmPattern {
    fn from_onsets(
        onsets_ms: &[f64],
        original_duration_ms: f64,
        silence_threshold_db: f64,
        min_onset_interval_ms: f64,
    ) -> Self {
        let trimmed_start_ms = onsets_ms.first().copied().unwrap_or(0.0);
        let trimmed_end_ms = onsets_ms.last().copied().unwrap_or(0.0);
        let normalized: Vec<f64> = onsets_ms.iter().map(|&t| t - trimmed_start_ms).collect();
        let intervals_ms = dtw::intervals(&normalized);

        Self {
            version: default_version(),
            estimated_bpm: bpm_from_intervals(&intervals_ms),
            time_signature: default_time_signature(),
            total_beats: normalized.len() as u32,
            onset_times_ms: normalized,
            intervals_ms,
            trimmed_start_ms,
            trimmed_end_ms,
            original_duration_ms,
            silence_threshold_db,
            min_onset_interval_ms,
            beat_fingerprints: None,
            sound_similarity_enabled: false,
            timing_weight: default_timing_weight(),
            sound_weight: default_sound_weight(),
        }
    }

    pub fn mean_interval_ms(&self) -> f64 {
        if self.intervals_ms.is_empty() {
            DEFAULT_AVG_INTERVAL_MS
        } else {
            self.intervals_ms.iter().sum::<f64>() / self.intervals_ms.len() as f64
        }
    }
}

/// BPM estimate from an interval sequence: round(60000 / mean interval),
/// clamped to a sane display range. Zero when there are no intervals.
fn bpm_from_intervals(intervals_ms: &[f64]) -> u32 {
    if intervals_ms.is_empty() {
        return 0;
    }
    let mean = intervals_ms.iter().sum::<f64>() / intervals_ms.len() as f64;
    if mean <= 0.0 {
        return 0;
    }
    (60_000.0 / mean).clamp(BPM_RANGE.0, BPM_RANGE.1).round() as u32
}

/// Extract a rhythm pattern from a decoded take via energy-onset detection.
///
/// With fewer than two onsets the pattern is returned as-is (no intervals, no
/// BPM); the caller decides whether that is enough.
pub fn extract_pattern(
    buffer: &AudioBuffer,
    silence_threshold_db: f64,
    min_onset_interval_ms: f64,
    cancel: &CancellationToken,
) -> Result<RhythmPattern> {
    let config = EnergyOnsetConfig {
        silence_threshold_db,
        min_onset_interval_ms,
        ..EnergyOnsetConfig::default()
    };
    let onsets = detect_energy_onsets(&buffer.samples, buffer.sample_rate_hz, &config, cancel)?;
    if onsets.len() < 2 {
        tracing::warn!("Pattern extraction found only {} onsets", onsets.len());
    }
    Ok(RhythmPattern::from_onsets(
        &onsets,
        buffer.duration_ms(),
        silence_threshold_db,
        min_onset_interval_ms,
    ))
}

/// Extract a pattern and attach one sound fingerprint per beat.
pub fn extract_pattern_with_fingerprints(
    buffer: &AudioBuffer,
    silence_threshold_db: f64,
    min_onset_interval_ms: f64,
    cancel: &CancellationToken,
) -> Result<RhythmPattern> {
    let mut pattern = extract_pattern(buffer, silence_threshold_db, min_onset_interval_ms, cancel)?;

    // Fingerprints are cut from the original take, so restore absolute times
    let absolute: Vec<f64> = pattern
        .onset_times_ms
        .iter()
        .map(|&t| t + pattern.trimmed_start_ms)
        .collect();
    pattern.beat_fingerprints = Some(fingerprint_onsets(buffer, &absolute, cancel)?);
    pattern.sound_similarity_enabled = true;
    Ok(pattern)
}

/// Score a user onset sequence against a reference pattern.
///
/// The user take is first aligned to its own first onset, forgiving a constant
/// reaction-time lag; `score_aligned_onsets` does the per-beat comparison.
pub fn score_rhythm_pattern(
    pattern: &RhythmPattern,
    user_onsets_ms: &[f64],
    tolerance_ms: Option<f64>,
    min_score: Option<u32>,
) -> ScoringResult {
    if pattern.onset_times_ms.is_empty() || user_onsets_ms.is_empty() {
        return ScoringResult::insufficient();
    }
    let first = user_onsets_ms[0];
    let aligned: Vec<f64> = user_onsets_ms.iter().map(|&t| t - first).collect();
    score_aligned_onsets(pattern, &aligned, tolerance_ms, min_score)
}

/// Per-beat comparison of an already-aligned user sequence.
///
/// Beats pair by index. Inside `max_tolerance` a beat earns
/// `100 * exp(-|err| / tolerance)`; outside it scores zero and counts as
/// missed. A count mismatch costs 5 points per missing or extra beat.
pub fn score_aligned_onsets(
    pattern: &RhythmPattern,
    user_onsets_ms: &[f64],
    tolerance_ms: Option<f64>,
    min_score: Option<u32>,
) -> ScoringResult {
    let reference = &pattern.onset_times_ms;
    if reference.is_empty() || user_onsets_ms.is_empty() {
        return ScoringResult::insufficient();
    }

    let avg_interval = pattern.mean_interval_ms();
    let tolerance = tolerance_ms
        .unwrap_or_else(|| (avg_interval / 3.0).min(150.0))
        .max(1.0);
    let max_tolerance = avg_interval / 2.0;

    let paired = reference.len().min(user_onsets_ms.len());
    let mut per_beat_scores = Vec::with_capacity(paired);
    let mut timing_errors_ms = Vec::with_capacity(paired);
    let mut absolute_errors_ms = Vec::with_capacity(paired);
    let mut perfect_beats = 0u32;
    let mut good_beats = 0u32;
    let mut missed_beats = 0u32;

    for i in 0..paired {
        let err = user_onsets_ms[i] - reference[i];
        let abs_err = err.abs();
        timing_errors_ms.push(err);
        absolute_errors_ms.push(abs_err);

        if abs_err >= max_tolerance {
            per_beat_scores.push(0.0);
            missed_beats += 1;
        } else {
            per_beat_scores.push(100.0 * (-abs_err / tolerance).exp());
        }

        if abs_err < PERFECT_BEAT_MS {
            perfect_beats += 1;
        } else if abs_err < GOOD_BEAT_MS {
            good_beats += 1;
        }
    }

    let beat_count_penalty =
        BEAT_COUNT_PENALTY * (reference.len() as f64 - user_onsets_ms.len() as f64).abs();
    let mean_beat_score = per_beat_scores.iter().sum::<f64>() / per_beat_scores.len() as f64;
    let overall = (mean_beat_score - beat_count_penalty).max(0.0);

    let average_error_ms = absolute_errors_ms.iter().sum::<f64>() / paired as f64;
    let max_error_ms = absolute_errors_ms.iter().cloned().fold(0.0, f64::max);
    let consistency_score = interval_consistency(user_onsets_ms);
    let passed = min_score.map_or(true, |m| overall >= m as f64);
    let feedback = feedback_for_score(overall);

    let user_intervals = dtw::intervals(user_onsets_ms);
    let detailed_metrics = json!({
        "referencePattern": {
            "totalBeats": pattern.total_beats,
            "estimatedBpm": pattern.estimated_bpm,
            "timeSignature": pattern.time_signature,
        },
        "userPattern": {
            "totalBeats": user_onsets_ms.len(),
            "estimatedBpm": bpm_from_intervals(&user_intervals),
            "timeSignature": default_time_signature(),
        },
        "scoring": {
            "overallScore": overall,
            "perfectBeats": perfect_beats,
            "goodBeats": good_beats,
            "missedBeats": missed_beats,
            "averageErrorMs": average_error_ms,
            "maxErrorMs": max_error_ms,
            "consistencyScore": consistency_score,
            "feedback": feedback,
        },
        "dtwSimilarity": dtw::compare_rhythms(user_onsets_ms, reference),
    });

    ScoringResult {
        overall_score: overall,
        rhythm_score: overall,
        combined_score: overall,
        per_beat_scores,
        timing_errors_ms,
        absolute_errors_ms,
        perfect_beats,
        good_beats,
        missed_beats,
        average_error_ms,
        max_error_ms,
        consistency_score,
        passed,
        feedback: feedback.to_string(),
        detailed_metrics,
        ..ScoringResult::default()
    }
}

/// Timing score plus per-beat sound comparison, blended by the pattern's
/// timing/sound weights (or explicit overrides).
pub fn score_rhythm_with_sound_similarity(
    pattern: &RhythmPattern,
    user_onsets_ms: &[f64],
    tolerance_ms: Option<f64>,
    min_score: Option<u32>,
    user_audio: &AudioBuffer,
    weights: Option<(f64, f64)>,
    cancel: &CancellationToken,
) -> Result<ScoringResult> {
    let mut result = score_rhythm_pattern(pattern, user_onsets_ms, tolerance_ms, min_score);
    if pattern.onset_times_ms.is_empty() || user_onsets_ms.is_empty() {
        return Ok(result);
    }

    let reference_fps = match &pattern.beat_fingerprints {
        Some(fps) if pattern.sound_similarity_enabled && !fps.is_empty() => fps,
        _ => return Ok(result),
    };

    let user_fps = fingerprint_onsets(user_audio, user_onsets_ms, cancel)?;

    let details: Vec<SoundComparisonDetail> = reference_fps
        .iter()
        .enumerate()
        .map(|(i, reference)| match user_fps.get(i) {
            Some(user) => compare_beat_sound(i, reference, user),
            None => SoundComparisonDetail::missed(
                i,
                reference.quality().as_str(),
                reference.spectral_centroid_hz,
            ),
        })
        .collect();

    let sound_score =
        details.iter().map(|d| d.overall_sound_score).sum::<f64>() / details.len() as f64;

    let (timing_weight, sound_weight) =
        weights.unwrap_or((pattern.timing_weight, pattern.sound_weight));
    let combined = timing_weight * result.overall_score + sound_weight * sound_score;

    if let serde_json::Value::Object(ref mut map) = result.detailed_metrics {
        map.insert(
            "soundSimilarity".to_string(),
            json!({
                "aggregateScore": sound_score,
                "timingWeight": timing_weight,
                "soundWeight": sound_weight,
            }),
        );
    }

    result.combined_score = combined;
    result.passed = min_score.map_or(true, |m| combined >= m as f64);
    result.sound_details = Some(details);
    Ok(result)
}

fn compare_beat_sound(
    beat_index: usize,
    reference: &SoundFingerprint,
    user: &SoundFingerprint,
) -> SoundComparisonDetail {
    let mfcc_similarity =
        (cosine_similarity(&reference.mfcc, &user.mfcc) + 1.0) / 2.0 * 100.0;
    let brightness_match = ratio_match(
        reference.spectral_centroid_hz,
        user.spectral_centroid_hz,
    );
    let energy_match = ratio_match(reference.rms_energy, user.rms_energy);

    let overall_sound_score = MFCC_SOUND_WEIGHT * mfcc_similarity
        + BRIGHTNESS_SOUND_WEIGHT * brightness_match
        + ENERGY_SOUND_WEIGHT * energy_match;

    let feedback = if overall_sound_score >= 80.0 {
        "Great sound match"
    } else if overall_sound_score >= 50.0 {
        "Close, adjust your tone"
    } else {
        "Very different sound"
    };

    SoundComparisonDetail {
        beat_index,
        mfcc_similarity,
        spectral_centroid_ref: reference.spectral_centroid_hz,
        spectral_centroid_user: user.spectral_centroid_hz,
        brightness_match,
        energy_match,
        overall_sound_score,
        user_quality: user.quality().as_str().to_string(),
        reference_quality: reference.quality().as_str().to_string(),
        feedback: feedback.to_string(),
    }
}

/// min/max ratio as a 0-100 match percentage; 0 when either side is silent.
fn ratio_match(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max <= 0.0 {
        return 0.0;
    }
    a.min(b) / max * 100.0
}

/// How evenly spaced the user's beats are: 100 * (1 - 2 * sigma / mu) over the
/// interval sequence, clamped to [0, 100].
fn interval_consistency(onsets_ms: &[f64]) -> f64 {
    let intervals = dtw::intervals(onsets_ms);
    if intervals.is_empty() {
        return 0.0;
    }
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance =
        intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    (100.0 * (1.0 - 2.0 * variance.sqrt() / mean)).clamp(0.0, 100.0)
}

/// Consistency against a target tempo (or the user's own mean interval when
/// no target is given): per-interval relative error capped at 1, averaged.
pub fn analyze_consistency(onsets_ms: &[f64], target_bpm: Option<f64>) -> f64 {
    let intervals = dtw::intervals(onsets_ms);
    if intervals.is_empty() {
        return 0.0;
    }
    let expected = match target_bpm {
        Some(bpm) if bpm > 0.0 => 60_000.0 / bpm,
        _ => intervals.iter().sum::<f64>() / intervals.len() as f64,
    };
    if expected <= 0.0 {
        return 0.0;
    }
    let mean_error = intervals
        .iter()
        .map(|i| ((i - expected).abs() / expected).min(1.0))
        .sum::<f64>()
        / intervals.len() as f64;
    (100.0 * (1.0 - mean_error)).max(0.0)
}

/// Variety of the quantized interval vocabulary, scaled so that a pattern
/// using many distinct note values approaches 100. Neutral 50 below four
/// onsets.
pub fn analyze_creativity(onsets_ms: &[f64]) -> f64 {
    if onsets_ms.len() < 4 {
        return 50.0;
    }
    let intervals: Vec<f64> = dtw::intervals(onsets_ms)
        .into_iter()
        .filter(|&i| i > 0.0)
        .collect();
    if intervals.is_empty() {
        return 50.0;
    }
    let min_interval = intervals.iter().cloned().fold(f64::INFINITY, f64::min);
    let quantized: std::collections::BTreeSet<i64> = intervals
        .iter()
        .map(|&i| (i / min_interval).round() as i64)
        .collect();
    let variety = quantized.len() as f64 / intervals.len() as f64;
    (variety * 150.0).min(100.0)
}

pub(crate) fn feedback_for_score(score: f64) -> &'static str {
    if score >= 90.0 {
        "Excellent rhythm! Your timing is spot on."
    } else if score >= 75.0 {
        "Great job! Your rhythm is very consistent."
    } else if score >= 60.0 {
        "Good effort! Keep practicing to tighten your timing."
    } else if score >= 40.0 {
        "Getting there. Try to follow the beat more closely."
    } else {
        "Keep practicing! Listen to the reference pattern and try again."
    }
}
