// Note and voice scoring
// Index-paired comparison of user and reference note sequences (semitone
// deviation, onset timing) and frame-paired MFCC cosine similarity, plus the
// composite blends and the detailed-metrics document for note challenges.

use crate::error::{Result, ScoreError};
use crate::notes::NoteEvent;
use crate::{ONSET_EQUAL_TOLERANCE_MS, PITCH_EQUAL_TOLERANCE_SEMITONES};
use serde::Serialize;
use serde_json::json;

const ZERO_NORM: f64 = 1e-12;

/// Cosine similarity in [-1, 1]. Two zero vectors compare as identical;
/// a zero vector against a nonzero one as orthogonal.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a < ZERO_NORM && norm_b < ZERO_NORM {
        return 1.0;
    }
    if norm_a < ZERO_NORM || norm_b < ZERO_NORM {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Pitch accuracy over index-paired notes.
///
/// `100 - 20 * mean(|semitone deviation|)` plus a bonus of 20 scaled by the
/// share of notes within half a semitone. Unvoiced pairs carry no deviation.
pub fn pitch_score_semitones(user: &[NoteEvent], reference: &[NoteEvent]) -> Result<f64> {
    let paired = user.len().min(reference.len());
    if paired == 0 {
        return Err(ScoreError::AlignmentFailure(
            "No note pairs to compare".to_string(),
        ));
    }

    let deviations: Vec<f64> = (0..paired)
        .filter_map(|i| reference[i].semitones_to(&user[i]).map(f64::abs))
        .collect();
    if deviations.is_empty() {
        return Err(ScoreError::AlignmentFailure(
            "No voiced note pairs to compare".to_string(),
        ));
    }

    let mean_dev = deviations.iter().sum::<f64>() / deviations.len() as f64;
    let hits = deviations
        .iter()
        .filter(|&&d| d <= PITCH_EQUAL_TOLERANCE_SEMITONES)
        .count();

    let raw = 100.0 - 20.0 * mean_dev;
    let bonus = 20.0 * hits as f64 / paired as f64;
    Ok((raw + bonus).clamp(0.0, 100.0))
}

/// Onset-timing accuracy over index-paired notes.
///
/// `0.7 * (100 - mean(|offset|)/10) + 30 * on_time_fraction`, where a note is
/// on time within 100 ms.
pub fn rhythm_score_onsets(user: &[NoteEvent], reference: &[NoteEvent]) -> Result<f64> {
    let paired = user.len().min(reference.len());
    if paired == 0 {
        return Err(ScoreError::AlignmentFailure(
            "No note pairs to compare".to_string(),
        ));
    }

    let offsets: Vec<f64> = (0..paired)
        .map(|i| user[i].onset_ms - reference[i].onset_ms)
        .collect();
    let mean_abs = offsets.iter().map(|o| o.abs()).sum::<f64>() / paired as f64;
    let on_time = offsets
        .iter()
        .filter(|o| o.abs() <= ONSET_EQUAL_TOLERANCE_MS)
        .count() as f64
        / paired as f64;

    let raw = 100.0 - mean_abs / 10.0;
    Ok((0.7 * raw + 30.0 * on_time).clamp(0.0, 100.0))
}

/// Voice-timbre similarity over frame-paired MFCC sequences, mapped from the
/// mean cosine in [-1, 1] onto [0, 100].
pub fn voice_similarity_mfcc(user: &[Vec<f64>], reference: &[Vec<f64>]) -> Result<f64> {
    let paired = user.len().min(reference.len());
    if paired == 0 {
        return Err(ScoreError::AlignmentFailure(
            "No MFCC frames to compare".to_string(),
        ));
    }
    let mean = (0..paired)
        .map(|i| cosine_similarity(&user[i], &reference[i]))
        .sum::<f64>()
        / paired as f64;
    Ok(((mean + 1.0) / 2.0 * 100.0).clamp(0.0, 100.0))
}

/// SINGING blend: pitch carries half the weight.
pub fn singing_composite(pitch: f64, rhythm: f64, voice: f64) -> f64 {
    0.50 * pitch + 0.30 * rhythm + 0.20 * voice
}

/// SOUND_MATCH blend: timbre replaces most of the rhythm weight.
pub fn sound_match_composite(pitch: f64, rhythm: f64, voice: f64) -> f64 {
    0.50 * pitch + 0.40 * voice + 0.10 * rhythm
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PitchAccuracy {
    pub average_semitone_deviation: f64,
    pub notes_hit_correctly: usize,
    pub total_notes: usize,
    pub accuracy_percentage: f64,
    pub max_deviation: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RhythmTiming {
    pub average_timing_offset_ms: f64,
    pub on_time_notes_count: usize,
    pub early_notes_count: usize,
    pub late_notes_count: usize,
    pub max_timing_error_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSimilarity {
    pub mfcc_similarity_score: f64,
    pub spectral_distance: f64,
    pub timbre_match_percentage: f64,
}

pub fn pitch_accuracy(user: &[NoteEvent], reference: &[NoteEvent]) -> PitchAccuracy {
    let paired = user.len().min(reference.len());
    let deviations: Vec<f64> = (0..paired)
        .filter_map(|i| reference[i].semitones_to(&user[i]).map(f64::abs))
        .collect();

    let total_notes = reference.len();
    let hits = deviations
        .iter()
        .filter(|&&d| d <= PITCH_EQUAL_TOLERANCE_SEMITONES)
        .count();

    PitchAccuracy {
        average_semitone_deviation: mean(&deviations),
        notes_hit_correctly: hits,
        total_notes,
        accuracy_percentage: if total_notes > 0 {
            hits as f64 / total_notes as f64 * 100.0
        } else {
            0.0
        },
        max_deviation: deviations.iter().cloned().fold(0.0, f64::max),
    }
}

pub fn rhythm_timing(user: &[NoteEvent], reference: &[NoteEvent]) -> RhythmTiming {
    let paired = user.len().min(reference.len());
    let offsets: Vec<f64> = (0..paired)
        .map(|i| user[i].onset_ms - reference[i].onset_ms)
        .collect();

    RhythmTiming {
        average_timing_offset_ms: mean(&offsets),
        on_time_notes_count: offsets
            .iter()
            .filter(|o| o.abs() <= ONSET_EQUAL_TOLERANCE_MS)
            .count(),
        early_notes_count: offsets
            .iter()
            .filter(|&&o| o < -ONSET_EQUAL_TOLERANCE_MS)
            .count(),
        late_notes_count: offsets
            .iter()
            .filter(|&&o| o > ONSET_EQUAL_TOLERANCE_MS)
            .count(),
        max_timing_error_ms: offsets.iter().map(|o| o.abs()).fold(0.0, f64::max),
    }
}

pub fn voice_similarity_details(user: &[Vec<f64>], reference: &[Vec<f64>]) -> VoiceSimilarity {
    let paired = user.len().min(reference.len());
    if paired == 0 {
        return VoiceSimilarity {
            mfcc_similarity_score: 0.0,
            spectral_distance: 0.0,
            timbre_match_percentage: 0.0,
        };
    }

    let cosines: Vec<f64> = (0..paired)
        .map(|i| cosine_similarity(&user[i], &reference[i]))
        .collect();
    let distances: Vec<f64> = (0..paired)
        .map(|i| {
            user[i]
                .iter()
                .zip(reference[i].iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .collect();
    let matching = cosines.iter().filter(|&&c| c >= 0.8).count();

    VoiceSimilarity {
        mfcc_similarity_score: ((mean(&cosines) + 1.0) / 2.0 * 100.0).clamp(0.0, 100.0),
        spectral_distance: mean(&distances),
        timbre_match_percentage: matching as f64 / paired as f64 * 100.0,
    }
}

/// Detailed-metrics document for note/voice challenges (stable keys).
pub fn note_metrics(
    user_notes: &[NoteEvent],
    reference_notes: &[NoteEvent],
    user_mfcc: &[Vec<f64>],
    reference_mfcc: &[Vec<f64>],
    overall_score: f64,
) -> serde_json::Value {
    json!({
        "pitchAccuracy": pitch_accuracy(user_notes, reference_notes),
        "rhythmTiming": rhythm_timing(user_notes, reference_notes),
        "voiceSimilarity": voice_similarity_details(user_mfcc, reference_mfcc),
        "overallScore": overall_score,
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
