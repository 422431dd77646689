// Challenge dispatch
// Routes prepared analysis products to the metric blend of the requested
// challenge. Downstream scoring errors are folded into a zero-score result
// carrying the error in the metrics document; cancellation propagates.

use crate::audio::AudioBuffer;
use crate::error::{Result, ScoreError};
use crate::notes::NoteEvent;
use crate::pipeline::CancellationToken;
use crate::result::ScoringResult;
use crate::rhythm::{self, analyze_consistency, analyze_creativity, RhythmPattern};
use crate::scoring;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// The four supported challenge blends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeType {
    Singing,
    SoundMatch,
    RhythmRepeat,
    RhythmCreation,
}

impl ChallengeType {
    /// Parse a challenge-type string; anything unrecognized scores as SINGING.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "SOUND_MATCH" => ChallengeType::SoundMatch,
            "RHYTHM_REPEAT" => ChallengeType::RhythmRepeat,
            "RHYTHM_CREATION" => ChallengeType::RhythmCreation,
            _ => ChallengeType::Singing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Singing => "SINGING",
            ChallengeType::SoundMatch => "SOUND_MATCH",
            ChallengeType::RhythmRepeat => "RHYTHM_REPEAT",
            ChallengeType::RhythmCreation => "RHYTHM_CREATION",
        }
    }
}

impl Default for ChallengeType {
    fn default() -> Self {
        ChallengeType::Singing
    }
}

/// Everything the dispatcher needs, already analyzed. All borrows; the
/// dispatcher itself is pure.
#[derive(Default)]
pub struct ScoringInputs<'a> {
    pub user_notes: &'a [NoteEvent],
    pub reference_notes: &'a [NoteEvent],
    pub user_mfcc: Option<&'a [Vec<f64>]>,
    pub reference_mfcc: Option<&'a [Vec<f64>]>,
    pub user_onsets_ms: &'a [f64],
    pub rhythm_pattern: Option<&'a RhythmPattern>,
    pub user_audio: Option<&'a AudioBuffer>,
    pub tolerance_ms: Option<f64>,
    pub min_score: Option<u32>,
    pub timing_weight: Option<f64>,
    pub sound_weight: Option<f64>,
}

/// Score one performance under the requested challenge.
///
/// Only cancellation escapes as an error; every other failure becomes a
/// zero-score result with `{"error": ...}` metrics so the caller still gets a
/// well-formed record.
pub fn dispatch(
    challenge: ChallengeType,
    inputs: &ScoringInputs,
    cancel: &CancellationToken,
) -> Result<ScoringResult> {
    match run(challenge, inputs, cancel) {
        Ok(result) => Ok(result),
        Err(ScoreError::Cancelled) => Err(ScoreError::Cancelled),
        Err(e) => {
            tracing::warn!("{} scoring failed: {}", challenge.as_str(), e);
            Ok(ScoringResult::from_error(&e.to_string()))
        }
    }
}

fn run(
    challenge: ChallengeType,
    inputs: &ScoringInputs,
    cancel: &CancellationToken,
) -> Result<ScoringResult> {
    cancel.check()?;
    match challenge {
        ChallengeType::Singing | ChallengeType::SoundMatch => note_challenge(challenge, inputs),
        ChallengeType::RhythmRepeat => rhythm_repeat(inputs, cancel),
        ChallengeType::RhythmCreation => Ok(rhythm_creation(inputs)),
    }
}

fn note_challenge(challenge: ChallengeType, inputs: &ScoringInputs) -> Result<ScoringResult> {
    let pitch = scoring::pitch_score_semitones(inputs.user_notes, inputs.reference_notes)?;
    let note_timing = scoring::rhythm_score_onsets(inputs.user_notes, inputs.reference_notes)?;
    // Voice similarity needs reference audio; without it the timbre term is 0
    let voice = match (inputs.user_mfcc, inputs.reference_mfcc) {
        (Some(user), Some(reference)) => scoring::voice_similarity_mfcc(user, reference)?,
        _ => 0.0,
    };

    let overall = match challenge {
        ChallengeType::SoundMatch => scoring::sound_match_composite(pitch, note_timing, voice),
        _ => scoring::singing_composite(pitch, note_timing, voice),
    };

    let empty: Vec<Vec<f64>> = Vec::new();
    let user_mfcc = inputs.user_mfcc.unwrap_or(&empty);
    let reference_mfcc = inputs.reference_mfcc.unwrap_or(&empty);

    Ok(ScoringResult {
        overall_score: overall,
        pitch_score: pitch,
        rhythm_score: note_timing,
        voice_score: voice,
        combined_score: overall,
        passed: inputs.min_score.map_or(true, |m| overall >= m as f64),
        feedback: rhythm::feedback_for_score(overall).to_string(),
        detailed_metrics: scoring::note_metrics(
            inputs.user_notes,
            inputs.reference_notes,
            user_mfcc,
            reference_mfcc,
            overall,
        ),
        ..ScoringResult::default()
    })
}

fn rhythm_repeat(inputs: &ScoringInputs, cancel: &CancellationToken) -> Result<ScoringResult> {
    let pattern = match inputs.rhythm_pattern {
        Some(p) => p,
        None => {
            return Err(ScoreError::Insufficient(
                "No reference rhythm pattern".to_string(),
            ))
        }
    };

    let with_fingerprints = pattern.sound_similarity_enabled
        && pattern
            .beat_fingerprints
            .as_ref()
            .map_or(false, |f| !f.is_empty());

    if with_fingerprints {
        if let Some(user_audio) = inputs.user_audio {
            let weights = match (inputs.timing_weight, inputs.sound_weight) {
                (Some(t), Some(s)) => Some((t, s)),
                _ => None,
            };
            let mut result = rhythm::score_rhythm_with_sound_similarity(
                pattern,
                inputs.user_onsets_ms,
                inputs.tolerance_ms,
                inputs.min_score,
                user_audio,
                weights,
                cancel,
            )?;
            // With fingerprints the challenge score is the blended one
            result.overall_score = result.combined_score;
            return Ok(result);
        }
    }

    Ok(rhythm::score_rhythm_pattern(
        pattern,
        inputs.user_onsets_ms,
        inputs.tolerance_ms,
        inputs.min_score,
    ))
}

fn rhythm_creation(inputs: &ScoringInputs) -> ScoringResult {
    let consistency = analyze_consistency(inputs.user_onsets_ms, None);
    let creativity = analyze_creativity(inputs.user_onsets_ms);
    let overall = 0.70 * consistency + 0.30 * creativity;

    ScoringResult {
        overall_score: overall,
        rhythm_score: overall,
        combined_score: overall,
        consistency_score: consistency,
        passed: inputs.min_score.map_or(true, |m| overall >= m as f64),
        feedback: rhythm::feedback_for_score(overall).to_string(),
        detailed_metrics: json!({
            "consistency": consistency,
            "creativity": creativity,
            "overallScore": overall,
        }),
        ..ScoringResult::default()
    }
}
