//! Archival hook for expired segments.
//!
//! Retention GC offers every evicted segment to the measurement's archiver
//! before releasing its buffer. The default archiver drops the data.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::malloc::BufferId;

/// Receives expired segments ahead of buffer release.
pub trait Archiver: Send + Sync {
    fn archive(&self, id: &BufferId, buf: &Buffer) -> Result<()>;
}

/// Discards expired segments.
#[derive(Debug, Default)]
pub struct NoneArchiver;

impl Archiver for NoneArchiver {
    fn archive(&self, _id: &BufferId, _buf: &Buffer) -> Result<()> {
        Ok(())
    }
}
