// Scoring result records
// The superset result type shared by every challenge, plus the per-beat sound
// comparison record. `detailed_metrics` carries the stable JSON document that
// collaborators persist verbatim.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Per-beat sound comparison between reference and user fingerprints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundComparisonDetail {
    pub beat_index: usize,
    pub mfcc_similarity: f64,
    pub spectral_centroid_ref: f64,
    pub spectral_centroid_user: f64,
    pub brightness_match: f64,
    pub energy_match: f64,
    pub overall_sound_score: f64,
    pub user_quality: String,
    pub reference_quality: String,
    pub feedback: String,
}

impl SoundComparisonDetail {
    /// Placeholder for a reference beat the user never played.
    pub fn missed(beat_index: usize, reference_quality: &str, centroid_ref: f64) -> Self {
        Self {
            beat_index,
            mfcc_similarity: 0.0,
            spectral_centroid_ref: centroid_ref,
            spectral_centroid_user: 0.0,
            brightness_match: 0.0,
            energy_match: 0.0,
            overall_sound_score: 0.0,
            user_quality: String::new(),
            reference_quality: reference_quality.to_string(),
            feedback: "Missed beat".to_string(),
        }
    }
}

/// Composite scoring result. Fields not relevant to a challenge stay at their
/// zero defaults; `detailed_metrics` always documents what was computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringResult {
    pub overall_score: f64,
    pub pitch_score: f64,
    pub rhythm_score: f64,
    pub voice_score: f64,
    pub combined_score: f64,
    pub per_beat_scores: Vec<f64>,
    pub timing_errors_ms: Vec<f64>,
    pub absolute_errors_ms: Vec<f64>,
    pub perfect_beats: u32,
    pub good_beats: u32,
    pub missed_beats: u32,
    pub average_error_ms: f64,
    pub max_error_ms: f64,
    pub consistency_score: f64,
    pub passed: bool,
    pub feedback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_details: Option<Vec<SoundComparisonDetail>>,
    pub detailed_metrics: serde_json::Value,
}

impl Default for ScoringResult {
    fn default() -> Self {
        Self {
            overall_score: 0.0,
            pitch_score: 0.0,
            rhythm_score: 0.0,
            voice_score: 0.0,
            combined_score: 0.0,
            per_beat_scores: Vec::new(),
            timing_errors_ms: Vec::new(),
            absolute_errors_ms: Vec::new(),
            perfect_beats: 0,
            good_beats: 0,
            missed_beats: 0,
            average_error_ms: 0.0,
            max_error_ms: 0.0,
            consistency_score: 0.0,
            passed: false,
            feedback: String::new(),
            sound_details: None,
            detailed_metrics: serde_json::Value::Null,
        }
    }
}

impl ScoringResult {
    /// Graded zero result for inputs too thin to score meaningfully.
    pub fn insufficient() -> Self {
        Self {
            feedback: "Insufficient beats to score".to_string(),
            detailed_metrics: json!({ "reason": "insufficient" }),
            ..Self::default()
        }
    }

    /// Zero result carrying a downstream error in the metrics document.
    pub fn from_error(message: &str) -> Self {
        Self {
            feedback: message.to_string(),
            detailed_metrics: json!({ "error": message }),
            ..Self::default()
        }
    }
}
