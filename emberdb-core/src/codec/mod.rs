//! Pluggable segment codecs.
//!
//! A segment is one allocator buffer holding a 2-byte header
//! (`[codec-id][list-index]`) followed by a codec-owned payload. Codecs come
//! in two families: [`CodecFamily::Time`] encodes monotonic timestamps,
//! [`CodecFamily::Value`] encodes raw 64-bit field values. Both payloads
//! lead with a live `i32` record count that is bumped last on every append
//! and loaded volatile when a reader opens, so a reader never sees a
//! half-written record.

use crate::buffer::Buffer;
use crate::error::{EmberError, Result};
use crate::types::Predicate;

pub mod bitstream;
pub mod byzantine;
pub mod gorilla;

/// Bytes of segment header ahead of the codec payload
pub const SEGMENT_HEADER_SIZE: usize = 2;

/// Codec id of the byte-aligned delta codec
pub const BYZANTINE_ID: u8 = 1;
/// Codec id of the bit-packed gorilla codec
pub const GORILLA_ID: u8 = 2;

/// Which column a codec encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    /// Monotonic millisecond timestamps
    Time,
    /// Raw 64-bit field values
    Value,
}

impl CodecFamily {
    pub fn name(self) -> &'static str {
        match self {
            CodecFamily::Time => "time",
            CodecFamily::Value => "value",
        }
    }
}

/// Append-side handle to one segment.
///
/// Exactly one writer exists per segment; only the tail segment of a field's
/// list accepts appends.
pub trait SegmentWriter: Send {
    /// Append one value. `SegmentFull` means the caller must roll over to a
    /// fresh segment and retry the same value.
    fn add(&mut self, value: i64) -> Result<()>;

    /// Records currently published
    fn count(&self) -> usize;

    /// Payload bytes consumed so far (capacity accounting for compaction)
    fn position(&self) -> usize;

    /// Base timestamp of a time segment; first delta is taken against it.
    /// Value writers ignore this.
    fn set_header_timestamp(&mut self, ts: i64) -> Result<()>;

    /// Header timestamp (0 for value writers)
    fn header_timestamp(&self) -> i64;

    /// Irreversibly reject further appends
    fn make_read_only(&mut self);

    /// Independent cursor snapshotting the live count at open time
    fn reader(&self) -> Result<Box<dyn SegmentReader>>;
}

impl std::fmt::Debug for dyn SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("count", &self.count())
            .field("position", &self.position())
            .finish()
    }
}

/// Decode-side cursor over one segment snapshot.
pub trait SegmentReader: Send {
    /// Next decoded value; `EndOfSegment` past the snapshot, `ValueFiltered`
    /// when the predicate rejects (cursor still advances).
    fn read(&mut self) -> Result<i64>;

    /// Records in this reader's snapshot
    fn count(&self) -> usize;

    /// Install a pushed-down filter on decoded values
    fn set_predicate(&mut self, predicate: Predicate);
}

/// Resolve a codec name to its wire id
pub fn codec_id(name: &str) -> Result<u8> {
    match name {
        "byzantine" => Ok(BYZANTINE_ID),
        "gorilla" => Ok(GORILLA_ID),
        other => Err(EmberError::CodecNotFound {
            family: "any",
            codec: other.to_string(),
        }),
    }
}

/// Construct a writer over `buf`, whose cursor must sit at the payload start
/// (past the segment header).
///
/// `existing` selects recovery mode: the payload already holds records, so
/// the codec replays them to restore its running state and cursor instead of
/// initializing an empty payload.
pub fn create_writer(
    family: CodecFamily,
    id: u8,
    buf: Buffer,
    existing: bool,
) -> Result<Box<dyn SegmentWriter>> {
    match (family, id) {
        (CodecFamily::Time, BYZANTINE_ID) => {
            Ok(Box::new(byzantine::ByzantineTimeWriter::new(buf, existing)?))
        }
        (CodecFamily::Value, BYZANTINE_ID) => {
            Ok(Box::new(byzantine::ByzantineValueWriter::new(buf, existing)?))
        }
        (CodecFamily::Time, GORILLA_ID) => {
            Ok(Box::new(gorilla::GorillaTimeWriter::new(buf, existing)?))
        }
        (CodecFamily::Value, GORILLA_ID) => {
            Ok(Box::new(gorilla::GorillaValueWriter::new(buf, existing)?))
        }
        (family, id) => Err(EmberError::CodecNotFound {
            family: family.name(),
            codec: format!("id {}", id),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_name_resolution() {
        assert_eq!(codec_id("byzantine").unwrap(), BYZANTINE_ID);
        assert_eq!(codec_id("gorilla").unwrap(), GORILLA_ID);
        assert!(matches!(
            codec_id("zstd").unwrap_err(),
            EmberError::CodecNotFound { .. }
        ));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let buf = Buffer::heap(64);
        assert!(matches!(
            create_writer(CodecFamily::Time, 99, buf, false).unwrap_err(),
            EmberError::CodecNotFound { .. }
        ));
    }
}
