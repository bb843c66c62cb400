//! Error types for EmberDB

use thiserror::Error;

/// Result type alias for EmberDB operations
pub type Result<T> = std::result::Result<T, EmberError>;

/// EmberDB error types
#[derive(Error, Debug)]
pub enum EmberError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected (pointer file, segment header, ...)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Codec id or name has no registration
    #[error("Codec not found: {family} codec {codec}")]
    CodecNotFound { family: &'static str, codec: String },

    /// Segment buffer cannot hold another value; caller must roll over
    /// to a fresh writer and retry the same value
    #[error("Segment full")]
    SegmentFull,

    /// Append attempted on a writer already marked read-only
    #[error("Segment is read-only")]
    SegmentReadOnly,

    /// Reader reached the length snapshot taken when it was opened
    #[error("End of segment")]
    EndOfSegment,

    /// Value rejected by a pushed-down predicate; skip, don't propagate
    #[error("Value filtered by predicate")]
    ValueFiltered,

    /// Compaction replay produced output inconsistent with its inputs
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Field cannot store the supplied value type
    #[error("Unsupported field type: {0}")]
    UnsupportedFieldType(String),
}

impl EmberError {
    /// Check if error is the capacity-exceeded rollover signal
    pub fn is_rollover(&self) -> bool {
        matches!(self, EmberError::SegmentFull)
    }

    /// Check if error is the reader end-of-stream signal
    pub fn is_end_of_segment(&self) -> bool {
        matches!(self, EmberError::EndOfSegment)
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, EmberError::Corruption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_classification() {
        assert!(EmberError::SegmentFull.is_rollover());
        assert!(EmberError::EndOfSegment.is_end_of_segment());
        assert!(EmberError::Corruption("bad record".to_string()).is_corruption());
        // a compaction failure is a hard error, never a stream signal
        let e = EmberError::Compaction("replay mismatch".to_string());
        assert!(!e.is_rollover() && !e.is_end_of_segment());
    }
}
