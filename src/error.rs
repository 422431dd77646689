use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("Failed to decode audio: {0}")]
    AudioDecode(String),

    #[error("Insufficient data: {0}")]
    Insufficient(String),

    #[error("Alignment failure: {0}")]
    AlignmentFailure(String),

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScoreError {
    /// Stable machine-readable error kind, independent of the display message.
    pub fn kind(&self) -> &'static str {
        match self {
            ScoreError::AudioDecode(_) => "audio_decode",
            ScoreError::Insufficient(_) => "insufficient",
            ScoreError::AlignmentFailure(_) => "alignment_failure",
            ScoreError::Cancelled => "cancelled",
            ScoreError::Internal(_) => "internal",
            ScoreError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, ScoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(ScoreError::AudioDecode("x".into()).kind(), "audio_decode");
        assert_eq!(ScoreError::Insufficient("x".into()).kind(), "insufficient");
        assert_eq!(ScoreError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_cancelled_message() {
        assert_eq!(ScoreError::Cancelled.to_string(), "Processing cancelled");
    }
}
