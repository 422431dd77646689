/// Encore DSP - performance analysis and scoring engine
///
/// Converts raw PCM audio into note events, onset times, and spectral
/// fingerprints, then aligns and compares user and reference sequences:
/// - Audio: symphonia decoding to mono, normalized f64 samples
/// - Windowing: lazy analysis frames over a sample buffer
/// - FFT: real-input spectra with process-wide plan caches
/// - Pitch: YIN fundamental-frequency detection
/// - Onset: energy (rhythm path) and spectral-flux (note path) detectors
/// - Mel: 13-coefficient MFCC extraction
/// - Fingerprint: per-onset timbre descriptors
/// - Rhythm: pattern extraction, per-beat tolerance scoring, DTW comparison
/// - Scoring: pitch/timing/voice scores and challenge composites
/// - Pipeline: per-performance orchestration with progress and cancellation

// Core DSP modules
pub mod audio;
pub mod fft;
pub mod mel;
pub mod onset;
pub mod pitch;
pub mod windowing;

// Analysis products
pub mod fingerprint;
pub mod notes;

// Scoring modules
pub mod dispatch;
pub mod dtw;
pub mod result;
pub mod rhythm;
pub mod scoring;

// Orchestration
pub mod error;
pub mod pipeline;

// Re-export the main types and entry points for convenience
pub use audio::{load_audio, AudioBuffer, PcmSource};
pub use dispatch::{dispatch, ChallengeType, ScoringInputs};
pub use error::{Result, ScoreError};
pub use fingerprint::{SoundFingerprint, SoundQuality};
pub use notes::NoteEvent;
pub use pipeline::{
    extract_rhythm_pattern, score_performance, score_rhythm_pattern, CancellationToken,
    Orchestrator, ProcessingState, ReferenceBundle, ScoreOptions, SoundScoreRequest,
};
pub use result::{ScoringResult, SoundComparisonDetail};
pub use rhythm::RhythmPattern;

/// Default analysis sample rate (Hz); decoding never resamples, this is the
/// rate reference material is produced at.
pub const SAMPLE_RATE: u32 = 44_100;
/// Analysis window length in samples.
pub const BUFFER_SIZE: usize = 2048;
/// Number of cepstral coefficients kept per MFCC vector.
pub const MFCC_COEFFICIENTS: usize = 13;
/// Number of triangular mel filters.
pub const NUM_MEL_FILTERS: usize = 40;
/// Lower edge of the mel filterbank (Hz).
pub const MEL_LOW_HZ: f64 = 300.0;
/// Length of a fingerprinted onset segment (ms).
pub const SEGMENT_DURATION_MS: f64 = 150.0;
/// Pitches within this many semitones count as equal.
pub const PITCH_EQUAL_TOLERANCE_SEMITONES: f64 = 0.5;
/// Onsets within this many ms count as on time.
pub const ONSET_EQUAL_TOLERANCE_MS: f64 = 100.0;
/// Notes shorter than this are discarded (ms).
pub const MIN_NOTE_DURATION_MS: f64 = 50.0;
/// Default silence floor for energy-onset detection (dBFS).
pub const SILENCE_DEFAULT_DB: f64 = -40.0;
/// A sound ends once the level falls this far below the onset threshold (dB).
pub const HYSTERESIS_DB: f64 = 6.0;
/// Minimum level jump over the previous window to open a sound (dB).
pub const RISE_DB: f64 = 3.0;
/// Spectral rolloff energy fraction.
pub const ROLLOFF_FRACTION: f64 = 0.85;
/// Default timing weight in the timing/sound rhythm blend.
pub const DEFAULT_TIMING_WEIGHT: f64 = 0.7;
/// Default sound weight in the timing/sound rhythm blend.
pub const DEFAULT_SOUND_WEIGHT: f64 = 0.3;
