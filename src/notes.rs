// Note extraction
// Merges percussive onsets with the YIN pitch contour into discrete note
// events. When no onsets are found (legato singing), falls back to segmenting
// the continuous pitch stream on pitch jumps.

use crate::audio::AudioBuffer;
use crate::error::Result;
use crate::onset::{detect_flux_onsets, FluxOnsetConfig};
use crate::pipeline::CancellationToken;
use crate::pitch::{PitchFrame, YinConfig, YinDetector};
use crate::{BUFFER_SIZE, MIN_NOTE_DURATION_MS};
use serde::{Deserialize, Serialize};

/// A single monophonic note. `pitch_hz <= 0` marks silence/unvoiced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub onset_ms: f64,
    pub pitch_hz: f64,
    pub duration_ms: f64,
    pub amplitude: f64,
}

impl NoteEvent {
    pub fn new(onset_ms: f64, pitch_hz: f64, duration_ms: f64, amplitude: f64) -> Self {
        Self {
            onset_ms,
            pitch_hz,
            duration_ms,
            amplitude: amplitude.clamp(0.0, 1.0),
        }
    }

    pub fn is_voiced(&self) -> bool {
        self.pitch_hz > 0.0
    }

    /// Nearest MIDI note number: round(69 + 12*log2(pitch/440)).
    pub fn midi(&self) -> Option<i32> {
        if !self.is_voiced() {
            return None;
        }
        Some((69.0 + 12.0 * (self.pitch_hz / 440.0).log2()).round() as i32)
    }

    /// Signed semitone distance from `self` up to `other`:
    /// 12*log2(other.pitch / self.pitch). None when either side is unvoiced.
    pub fn semitones_to(&self, other: &NoteEvent) -> Option<f64> {
        if !self.is_voiced() || !other.is_voiced() {
            return None;
        }
        Some(12.0 * (other.pitch_hz / self.pitch_hz).log2())
    }
}

/// Note extractor configuration
#[derive(Clone, Debug)]
pub struct NoteExtractorConfig {
    /// Pitch samples within this distance of an onset are attributed to it (ms)
    pub pitch_window_ms: f64,
    /// Notes shorter than this are discarded (ms)
    pub min_note_duration_ms: f64,
    /// Fallback segmentation opens a new note on a pitch jump this large (Hz)
    pub pitch_break_hz: f64,
    pub yin: YinConfig,
    pub onset: FluxOnsetConfig,
}

impl Default for NoteExtractorConfig {
    fn default() -> Self {
        Self {
            pitch_window_ms: 100.0,
            min_note_duration_ms: MIN_NOTE_DURATION_MS,
            pitch_break_hz: 50.0,
            yin: YinConfig::default(),
            onset: FluxOnsetConfig::default(),
        }
    }
}

/// Extract note events from a decoded buffer.
///
/// Pass 1 collects percussive onsets, pass 2 the voiced pitch contour; each
/// onset is assigned the mean pitch and mean confidence of the contour samples
/// around it. Events are ordered by onset and at least 50 ms long.
pub fn extract_notes(
    buffer: &AudioBuffer,
    config: &NoteExtractorConfig,
    cancel: &CancellationToken,
) -> Result<Vec<NoteEvent>> {
    let onsets_ms: Vec<f64> = detect_flux_onsets(
        &buffer.samples,
        buffer.sample_rate_hz,
        &config.onset,
        cancel,
    )?
    .into_iter()
    .map(|o| o.time_s * 1000.0)
    .collect();

    let detector = YinDetector::new(buffer.sample_rate_hz, config.yin.clone());
    let contour = detector.track(&buffer.samples, BUFFER_SIZE, config.onset.hop_size, cancel)?;
    let voiced: Vec<PitchFrame> = contour.into_iter().filter(|f| f.pitch_hz > 0.0).collect();

    let mut notes = merge_onsets_with_pitch(&onsets_ms, &voiced, config);
    if notes.is_empty() {
        tracing::debug!("No onset-aligned notes; falling back to pitch segmentation");
        notes = segment_pitch_stream(&voiced, config);
    }

    notes.sort_by(|a, b| a.onset_ms.partial_cmp(&b.onset_ms).unwrap());
    notes.dedup_by(|a, b| a.onset_ms == b.onset_ms);

    tracing::debug!("Extracted {} note events", notes.len());
    Ok(notes)
}

fn merge_onsets_with_pitch(
    onsets_ms: &[f64],
    voiced: &[PitchFrame],
    config: &NoteExtractorConfig,
) -> Vec<NoteEvent> {
    let mut notes = Vec::new();
    let last_pitch_ms = voiced.last().map(|f| f.time_ms);

    for (i, &onset) in onsets_ms.iter().enumerate() {
        let near: Vec<&PitchFrame> = voiced
            .iter()
            .filter(|f| (f.time_ms - onset).abs() < config.pitch_window_ms)
            .collect();
        if near.is_empty() {
            continue;
        }

        let pitch = near.iter().map(|f| f.pitch_hz).sum::<f64>() / near.len() as f64;
        let amplitude = near.iter().map(|f| f.probability).sum::<f64>() / near.len() as f64;

        let duration = match onsets_ms.get(i + 1) {
            Some(&next) => next - onset,
            None => match last_pitch_ms {
                Some(last) => last - onset,
                None => 0.0,
            },
        };

        if duration >= config.min_note_duration_ms && pitch > 0.0 {
            notes.push(NoteEvent::new(onset, pitch, duration, amplitude));
        }
    }

    notes
}

/// Fallback for onset-free audio: walk the voiced contour and close the
/// current note whenever the pitch moves away from the running segment mean.
fn segment_pitch_stream(voiced: &[PitchFrame], config: &NoteExtractorConfig) -> Vec<NoteEvent> {
    let mut notes = Vec::new();
    let mut segment: Vec<&PitchFrame> = Vec::new();

    let flush = |segment: &[&PitchFrame], notes: &mut Vec<NoteEvent>| {
        let (first, last) = match (segment.first(), segment.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return,
        };
        let duration = last.time_ms - first.time_ms;
        if duration < config.min_note_duration_ms {
            return;
        }
        let pitch = segment.iter().map(|f| f.pitch_hz).sum::<f64>() / segment.len() as f64;
        let amplitude = segment.iter().map(|f| f.probability).sum::<f64>() / segment.len() as f64;
        notes.push(NoteEvent::new(first.time_ms, pitch, duration, amplitude));
    };

    for frame in voiced {
        if !segment.is_empty() {
            let mean = segment.iter().map(|f| f.pitch_hz).sum::<f64>() / segment.len() as f64;
            if (frame.pitch_hz - mean).abs() > config.pitch_break_hz {
                flush(&segment, &mut notes);
                segment.clear();
            }
        }
        segment.push(frame);
    }
    flush(&segment, &mut notes);

    notes
}
