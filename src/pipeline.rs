// Performance-scoring orchestrator
// Owns one performance end to end: decode -> analyze -> score. Emits coarse
// progress callbacks, honors a caller-provided cancellation token at frame
// granularity, and never retries. Collaborators (HTTP surface, persistence,
// object storage) live outside this crate and consume the typed results.

use crate::audio::{load_audio, AudioBuffer, PcmSource};
use crate::dispatch::{dispatch, ChallengeType, ScoringInputs};
use crate::error::{Result, ScoreError};
use crate::mel::mfcc_sequence;
use crate::notes::{extract_notes, NoteEvent, NoteExtractorConfig};
use crate::onset::{detect_energy_onsets, EnergyOnsetConfig};
use crate::result::ScoringResult;
use crate::rhythm::{self, RhythmPattern};
use crate::SILENCE_DEFAULT_DB;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Legacy reference pitch arrays are sampled every 100 ms.
const LEGACY_PITCH_INTERVAL_MS: f64 = 100.0;
/// Legacy segmentation opens a new note on a pitch jump this large (Hz).
const LEGACY_PITCH_BREAK_HZ: f64 = 50.0;

pub const MSG_ANALYZING: &str = "Analyzing audio...";
pub const MSG_VOICE_FEATURES: &str = "Extracting voice features...";
pub const MSG_REFERENCE: &str = "Loading reference data...";
pub const MSG_REFERENCE_VOICE: &str = "Processing reference voice features...";
pub const MSG_SCORING: &str = "Calculating scores...";
pub const MSG_FINALIZING: &str = "Finalizing...";
pub const MSG_COMPLETED: &str = "Processing completed successfully";

/// Cooperative cancellation flag shared between the caller and the analyzers.
/// Checked at least once per analysis window.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ScoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Pipeline state for one performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Pending,
    Processing,
    Completed,
    Failed,
}

pub type ProgressCallback = Box<dyn Fn(u8, &str) + Send + Sync>;

/// Scoring knobs forwarded to the challenge blends.
///
/// Analysis runs at the decoder's native sample rate; nothing in the pipeline
/// resamples, so onset and pitch passes always share one timebase.
#[derive(Debug, Clone, Default)]
pub struct ScoreOptions {
    pub tolerance_ms: Option<f64>,
    pub min_score: Option<u32>,
    pub timing_weight: Option<f64>,
    pub sound_weight: Option<f64>,
}

/// Reference material for one challenge.
///
/// Preferred shape is a typed `note_events` list; `pitch_data` is the legacy
/// persisted form (plain f64 array at 100 ms per sample) kept as a migration
/// path. Reference audio is required only for voice-timbre similarity.
#[derive(Debug, Clone, Default)]
pub struct ReferenceBundle {
    pub note_events: Option<Vec<NoteEvent>>,
    pub pitch_data: Option<Vec<f64>>,
    pub audio: Option<PcmSource>,
    pub rhythm_pattern: Option<RhythmPattern>,
}

impl ReferenceBundle {
    /// Resolve reference notes, converting the legacy pitch array if needed.
    pub fn resolve_notes(&self) -> Vec<NoteEvent> {
        if let Some(notes) = &self.note_events {
            return notes.clone();
        }
        match &self.pitch_data {
            Some(values) => legacy_pitch_to_notes(values),
            None => Vec::new(),
        }
    }
}

/// Convert a legacy 100 ms pitch array into note events by merging
/// consecutive voiced samples until the pitch jumps by more than 50 Hz.
fn legacy_pitch_to_notes(values: &[f64]) -> Vec<NoteEvent> {
    let mut notes = Vec::new();
    let mut segment: Vec<(usize, f64)> = Vec::new();

    let flush = |segment: &[(usize, f64)], notes: &mut Vec<NoteEvent>| {
        if segment.is_empty() {
            return;
        }
        let onset_ms = segment[0].0 as f64 * LEGACY_PITCH_INTERVAL_MS;
        let duration_ms = segment.len() as f64 * LEGACY_PITCH_INTERVAL_MS;
        let pitch = segment.iter().map(|&(_, p)| p).sum::<f64>() / segment.len() as f64;
        notes.push(NoteEvent::new(onset_ms, pitch, duration_ms, 1.0));
    };

    for (i, &value) in values.iter().enumerate() {
        if value <= 0.0 {
            flush(&segment, &mut notes);
            segment.clear();
            continue;
        }
        if let Some(mean) = segment_mean(&segment) {
            if (value - mean).abs() > LEGACY_PITCH_BREAK_HZ {
                flush(&segment, &mut notes);
                segment.clear();
            }
        }
        segment.push((i, value));
    }
    flush(&segment, &mut notes);
    notes
}

fn segment_mean(segment: &[(usize, f64)]) -> Option<f64> {
    if segment.is_empty() {
        None
    } else {
        Some(segment.iter().map(|&(_, p)| p).sum::<f64>() / segment.len() as f64)
    }
}

/// Stateful per-performance pipeline.
pub struct Orchestrator {
    state: ProcessingState,
    processing_message: String,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            state: ProcessingState::Pending,
            processing_message: String::new(),
            progress: None,
            cancel: CancellationToken::default(),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    pub fn processing_message(&self) -> &str {
        &self.processing_message
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the full pipeline for one performance.
    ///
    /// `Pending -> Processing -> Completed` on success; any analyzer failure
    /// or cancellation lands in `Failed` with the corresponding message.
    pub fn score(
        &mut self,
        audio: &PcmSource,
        reference: &ReferenceBundle,
        challenge: ChallengeType,
        opts: &ScoreOptions,
    ) -> Result<ScoringResult> {
        self.state = ProcessingState::Processing;
        match self.run(audio, reference, challenge, opts) {
            Ok(result) => {
                self.state = ProcessingState::Completed;
                self.processing_message = MSG_COMPLETED.to_string();
                self.report(100, MSG_COMPLETED);
                tracing::info!("Scored {} challenge: {:.1}", challenge.as_str(), result.overall_score);
                Ok(result)
            }
            Err(ScoreError::Cancelled) => {
                self.state = ProcessingState::Failed;
                self.processing_message = "Processing cancelled".to_string();
                tracing::info!("Scoring cancelled");
                Err(ScoreError::Cancelled)
            }
            Err(e) => {
                self.state = ProcessingState::Failed;
                self.processing_message = format!("Processing failed: {}", e);
                tracing::warn!("Scoring failed: {}", e);
                Err(e)
            }
        }
    }

    fn run(
        &self,
        audio: &PcmSource,
        reference: &ReferenceBundle,
        challenge: ChallengeType,
        opts: &ScoreOptions,
    ) -> Result<ScoringResult> {
        self.report(10, MSG_ANALYZING);
        let user_buffer = load_audio(audio, &self.cancel)?;
        self.cancel.check()?;

        let user_notes = extract_notes(&user_buffer, &NoteExtractorConfig::default(), &self.cancel)?;
        let user_onsets = detect_energy_onsets(
            &user_buffer.samples,
            user_buffer.sample_rate_hz,
            &EnergyOnsetConfig::default(),
            &self.cancel,
        )?;

        self.report(30, MSG_VOICE_FEATURES);
        let user_mfcc =
            mfcc_sequence(&user_buffer.samples, user_buffer.sample_rate_hz, &self.cancel)?;

        self.report(50, MSG_REFERENCE);
        let reference_notes = reference.resolve_notes();
        let reference_buffer: Option<AudioBuffer> = match &reference.audio {
            Some(source) => Some(load_audio(source, &self.cancel)?),
            None => None,
        };
        let mut pattern = reference.rhythm_pattern.clone();
        if pattern.is_none() && challenge == ChallengeType::RhythmRepeat {
            if let Some(buffer) = &reference_buffer {
                pattern = Some(rhythm::extract_pattern_with_fingerprints(
                    buffer,
                    SILENCE_DEFAULT_DB,
                    100.0,
                    &self.cancel,
                )?);
            }
        }

        self.report(60, MSG_REFERENCE_VOICE);
        let reference_mfcc: Option<Vec<Vec<f64>>> = match &reference_buffer {
            Some(buffer) => Some(mfcc_sequence(
                &buffer.samples,
                buffer.sample_rate_hz,
                &self.cancel,
            )?),
            None => None,
        };

        self.report(70, MSG_SCORING);
        let result = {
            let inputs = ScoringInputs {
                user_notes: &user_notes,
                reference_notes: &reference_notes,
                user_mfcc: Some(&user_mfcc),
                reference_mfcc: reference_mfcc.as_deref(),
                user_onsets_ms: &user_onsets,
                rhythm_pattern: pattern.as_ref(),
                user_audio: Some(&user_buffer),
                tolerance_ms: opts.tolerance_ms,
                min_score: opts.min_score,
                timing_weight: opts.timing_weight,
                sound_weight: opts.sound_weight,
            };
            dispatch(challenge, &inputs, &self.cancel)?
        };

        // Sample buffers are released before the result is assembled for
        // serialization; nothing below needs audio
        drop(user_buffer);
        drop(reference_buffer);

        self.report(80, MSG_FINALIZING);
        Ok(result)
    }

    fn report(&self, percent: u8, message: &str) {
        if let Some(callback) = &self.progress {
            callback(percent, message);
        }
    }
}

/// One-shot scoring with a throwaway orchestrator.
pub fn score_performance(
    audio: &PcmSource,
    reference: &ReferenceBundle,
    challenge: ChallengeType,
    opts: &ScoreOptions,
) -> Result<ScoringResult> {
    Orchestrator::new().score(audio, reference, challenge, opts)
}

/// Decode a take and extract its rhythm pattern, optionally with per-beat
/// sound fingerprints.
pub fn extract_rhythm_pattern(
    audio: &PcmSource,
    silence_threshold_db: f64,
    min_onset_interval_ms: f64,
    with_fingerprints: bool,
) -> Result<RhythmPattern> {
    let cancel = CancellationToken::default();
    let buffer = load_audio(audio, &cancel)?;
    if with_fingerprints {
        rhythm::extract_pattern_with_fingerprints(
            &buffer,
            silence_threshold_db,
            min_onset_interval_ms,
            &cancel,
        )
    } else {
        rhythm::extract_pattern(&buffer, silence_threshold_db, min_onset_interval_ms, &cancel)
    }
}

/// Optional sound-similarity leg of `score_rhythm_pattern`.
#[derive(Debug, Clone, Default)]
pub struct SoundScoreRequest {
    pub user_audio: Option<PcmSource>,
    pub timing_weight: Option<f64>,
    pub sound_weight: Option<f64>,
}

/// Score user onsets against a stored pattern, with an optional sound leg
/// when the pattern carries fingerprints and user audio is supplied.
pub fn score_rhythm_pattern(
    pattern: &RhythmPattern,
    user_onsets_ms: &[f64],
    tolerance_ms: Option<f64>,
    min_score: Option<u32>,
    with_sound: Option<&SoundScoreRequest>,
) -> Result<ScoringResult> {
    let cancel = CancellationToken::default();

    if let Some(request) = with_sound {
        if let Some(source) = &request.user_audio {
            if pattern.sound_similarity_enabled {
                let user_buffer = load_audio(source, &cancel)?;
                let weights = match (request.timing_weight, request.sound_weight) {
                    (Some(t), Some(s)) => Some((t, s)),
                    _ => None,
                };
                return rhythm::score_rhythm_with_sound_similarity(
                    pattern,
                    user_onsets_ms,
                    tolerance_ms,
                    min_score,
                    &user_buffer,
                    weights,
                    &cancel,
                );
            }
        }
    }

    Ok(rhythm::score_rhythm_pattern(
        pattern,
        user_onsets_ms,
        tolerance_ms,
        min_score,
    ))
}
