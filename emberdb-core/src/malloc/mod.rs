//! Buffer allocation over memory-mapped data files.
//!
//! The allocator hands out fixed-size [`Buffer`] slices of append-only data
//! files and records every allocation in a pointer file. The pointer file
//! alone is enough to re-slice every buffer after a restart; data files are
//! never read during recovery.

use crate::buffer::Buffer;
use crate::error::{EmberError, Result};
use std::collections::{HashMap, HashSet};

pub mod disk;

pub use disk::DiskMalloc;

/// Separator between pointer-record columns
const RECORD_SEPARATOR: char = ')';

/// Identity of one allocated buffer, as persisted in the pointer file.
///
/// Record text:
/// `fieldId)filename)local-offset)window-base-offset)size)bucket-hex`.
/// The field id may itself contain the separator, so records parse
/// right-to-left.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferId {
    /// `"{seriesId}#{fieldName}"`
    pub field_id: String,
    /// Data file holding the buffer
    pub file_name: String,
    /// Offset within the mmap window the buffer was allocated from
    pub local_offset: usize,
    /// File offset of that window's base
    pub base_offset: usize,
    /// Buffer capacity in bytes
    pub size: usize,
    /// Time bucket the buffer belongs to
    pub bucket: i32,
}

impl BufferId {
    /// Offset of the buffer within its data file
    pub fn file_offset(&self) -> usize {
        self.base_offset + self.local_offset
    }

    /// Pointer-file record text
    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{:x}",
            self.field_id,
            self.file_name,
            self.local_offset,
            self.base_offset,
            self.size,
            self.bucket,
            sep = RECORD_SEPARATOR,
        )
    }

    /// Parse a record; malformed text is corruption, never skipped
    pub fn parse(line: &str) -> Result<Self> {
        if line.is_empty() {
            return Err(EmberError::Corruption("empty pointer record".to_string()));
        }
        let mut parts: Vec<&str> = line.rsplitn(6, RECORD_SEPARATOR).collect();
        if parts.len() != 6 {
            return Err(EmberError::Corruption(format!(
                "malformed pointer record: {}",
                line
            )));
        }
        parts.reverse();
        let bad = |what: &str| EmberError::Corruption(format!("bad {} in pointer record: {}", what, line));
        Ok(Self {
            field_id: parts[0].to_string(),
            file_name: parts[1].to_string(),
            local_offset: parts[2].parse().map_err(|_| bad("local offset"))?,
            base_offset: parts[3].parse().map_err(|_| bad("base offset"))?,
            size: parts[4].parse().map_err(|_| bad("size"))?,
            bucket: i32::from_str_radix(parts[5], 16).map_err(|_| bad("bucket"))?,
        })
    }
}

/// An allocated buffer together with its persistent identity
pub struct BufferObject {
    pub id: BufferId,
    pub buf: Buffer,
}

/// Buffer allocator interface.
pub trait Malloc: Send + Sync {
    /// Allocate a buffer of the default increment size
    fn create_buffer(&self, field_id: &str, bucket: i32) -> Result<BufferObject> {
        self.create_buffer_sized(field_id, bucket, self.default_buffer_size())
    }

    /// Allocate a buffer of an explicit size (compaction output)
    fn create_buffer_sized(&self, field_id: &str, bucket: i32, size: usize) -> Result<BufferObject>;

    /// Default allocation size
    fn default_buffer_size(&self) -> usize;

    /// Re-slice every recorded buffer, grouped by field id, in pointer-file
    /// order. Restart-time entry point.
    fn series_buffer_map(&self) -> Result<HashMap<String, Vec<BufferObject>>>;

    /// Drop the given buffers from the pointer file and delete data files
    /// left with no surviving record
    fn cleanup_buffer_ids(&self, ids: &HashSet<BufferId>) -> Result<()>;

    /// Flush mapped state to disk
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_id_record_roundtrip() {
        let id = BufferId {
            field_id: "cpu,host=a#value".to_string(),
            file_name: "data-000000000003.dat".to_string(),
            local_offset: 4096,
            base_offset: 1_048_576,
            size: 32768,
            bucket: -5,
        };
        let parsed = BufferId::parse(&id.encode()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.file_offset(), 1_048_576 + 4096);
    }

    #[test]
    fn test_separator_in_field_id_survives() {
        let id = BufferId {
            field_id: "m,tag=a)b#f".to_string(),
            file_name: "data-000000000000.dat".to_string(),
            local_offset: 0,
            base_offset: 0,
            size: 64,
            bucket: 0x1abc,
        };
        assert_eq!(BufferId::parse(&id.encode()).unwrap(), id);
    }

    #[test]
    fn test_empty_record_is_corruption() {
        assert!(BufferId::parse("").unwrap_err().is_corruption());
        assert!(BufferId::parse("just-a-field-id").unwrap_err().is_corruption());
    }
}
