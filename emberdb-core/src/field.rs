//! One field of one series time bucket: an ordered list of compressed
//! segments.
//!
//! Only the last (tail) segment accepts appends. When the tail buffer fills
//! up, a fresh segment is allocated and the append is retried exactly once.
//! Compaction replays all non-tail segments into a single denser segment and
//! swaps it in at the head of the list; the freed buffer ids are returned to
//! the caller for release.

use crate::buffer::Buffer;
use crate::codec::{self, CodecFamily, SegmentReader, SegmentWriter, SEGMENT_HEADER_SIZE};
use crate::error::{EmberError, Result};
use crate::malloc::{BufferId, BufferObject, Malloc};
use crate::types::{FieldValue, Predicate};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Segment-buffer offset of the list-index byte
const INDEX_BYTE_OFFSET: usize = 1;

struct WriterSlot {
    id: BufferId,
    /// Full segment buffer, for header-byte access
    buf: Buffer,
    writer: Box<dyn SegmentWriter>,
}

/// A named field within one time bucket.
pub struct Field {
    field_id: String,
    bucket: i32,
    family: CodecFamily,
    codec_id: u8,
    compaction_codec_id: u8,
    compaction_ratio: f64,
    writers: Mutex<Vec<WriterSlot>>,
}

impl Field {
    pub fn new(
        field_id: String,
        bucket: i32,
        family: CodecFamily,
        codec_id: u8,
        compaction_codec_id: u8,
        compaction_ratio: f64,
    ) -> Self {
        Self {
            field_id,
            bucket,
            family,
            codec_id,
            compaction_codec_id,
            compaction_ratio,
            writers: Mutex::new(Vec::new()),
        }
    }

    pub fn field_id(&self) -> &str {
        &self.field_id
    }

    pub fn bucket(&self) -> i32 {
        self.bucket
    }

    /// Number of segments currently in the list
    pub fn segment_count(&self) -> usize {
        self.writers.lock().len()
    }

    /// Records published across all segments
    pub fn count(&self) -> usize {
        self.writers.lock().iter().map(|s| s.writer.count()).sum()
    }

    /// Append one raw value, rolling over to a fresh segment when the tail
    /// fills up. The retry happens exactly once; a second failure means the
    /// configured buffer size cannot hold a single record.
    pub fn add(&self, malloc: &dyn Malloc, value: i64) -> Result<()> {
        let mut list = self.writers.lock();
        if list.is_empty() {
            self.create_writer(malloc, &mut list, value)?;
        }
        let tail = match list.last_mut() {
            Some(t) => t,
            None => return Err(EmberError::Corruption("empty writer list".to_string())),
        };
        match tail.writer.add(value) {
            Ok(()) => Ok(()),
            Err(e) if e.is_rollover() => {
                debug!(
                    field_id = %self.field_id,
                    bucket = self.bucket,
                    segments = list.len(),
                    "tail segment full, rolling over"
                );
                self.create_writer(malloc, &mut list, value)?;
                match list.last_mut() {
                    Some(t) => t.writer.add(value),
                    None => Err(EmberError::Corruption("empty writer list".to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Append a typed value; timestamp fields only store integers
    pub fn add_value(&self, malloc: &dyn Malloc, value: FieldValue) -> Result<()> {
        if self.family == CodecFamily::Time && value.is_fp() {
            return Err(EmberError::UnsupportedFieldType(
                "timestamp field cannot store floating point values".to_string(),
            ));
        }
        self.add(malloc, value.to_raw())
    }

    fn create_writer(
        &self,
        malloc: &dyn Malloc,
        list: &mut Vec<WriterSlot>,
        header_ts: i64,
    ) -> Result<()> {
        let index = list.len();
        if index > u8::MAX as usize {
            return Err(EmberError::Config(format!(
                "field {} bucket {} exceeded 256 segments",
                self.field_id, self.bucket
            )));
        }
        let mut obj = malloc.create_buffer(&self.field_id, self.bucket)?;
        obj.buf.put_u8(self.codec_id)?;
        obj.buf.put_u8(index as u8)?;
        let mut writer = codec::create_writer(self.family, self.codec_id, obj.buf.clone(), false)?;
        if self.family == CodecFamily::Time {
            writer.set_header_timestamp(header_ts)?;
        }
        list.push(WriterSlot {
            id: obj.id,
            buf: obj.buf,
            writer,
        });
        Ok(())
    }

    /// Rebuild the writer list from recovered buffers. Entries arrive in
    /// pointer-file order but are sorted by their list-index byte; every
    /// segment except the last is sealed.
    pub fn load_writers(&self, entries: Vec<BufferObject>) -> Result<()> {
        let mut slots = Vec::with_capacity(entries.len());
        for mut obj in entries {
            obj.buf.set_position(0)?;
            let codec_id = obj.buf.get_u8()?;
            let index = obj.buf.get_u8()?;
            let writer = codec::create_writer(self.family, codec_id, obj.buf.clone(), true)?;
            slots.push((index, WriterSlot {
                id: obj.id,
                buf: obj.buf,
                writer,
            }));
        }
        slots.sort_by_key(|(index, _)| *index);
        let mut list = self.writers.lock();
        if !list.is_empty() {
            return Err(EmberError::Corruption(format!(
                "recovery into non-empty field {}",
                self.field_id
            )));
        }
        let last = slots.len().saturating_sub(1);
        for (i, (_, mut slot)) in slots.into_iter().enumerate() {
            if i < last {
                slot.writer.make_read_only();
            }
            list.push(slot);
        }
        Ok(())
    }

    /// Open one reader per segment, in list order
    pub fn query_readers(&self, predicate: Option<&Predicate>) -> Result<Vec<Box<dyn SegmentReader>>> {
        let list = self.writers.lock();
        let mut readers = Vec::with_capacity(list.len());
        for slot in list.iter() {
            let mut reader = slot.writer.reader()?;
            if let Some(p) = predicate {
                reader.set_predicate(p.clone());
            }
            readers.push(reader);
        }
        Ok(readers)
    }

    /// Reader iterator over all segments
    pub fn iterator(&self, predicate: Option<&Predicate>) -> Result<FieldReaderIterator> {
        Ok(FieldReaderIterator::new(self.query_readers(predicate)?))
    }

    /// Merge all sealed (non-tail) segments into one compacted segment.
    ///
    /// The merge replays into a heap buffer sized by the configured ratio,
    /// copies the result into a fresh allocator buffer, and swaps it in under
    /// the list lock. Returns the buffer ids this field no longer references;
    /// the caller releases them through the allocator. If the headroom buffer
    /// overflows, compaction of this bucket is skipped with no state change.
    ///
    /// The list lock is dropped during the replay, so the list is re-checked
    /// at swap time: if the sealed prefix changed underneath (retention GC
    /// evicting the bucket, or another compaction pass), the swap is
    /// abandoned and the orphan compacted buffer is returned for release.
    pub fn compact(&self, malloc: &dyn Malloc) -> Result<Vec<BufferId>> {
        // snapshot sealed segments under the list lock
        let (mut readers, snapshot_ids, header_ts, input_bytes) = {
            let list = self.writers.lock();
            if list.len() <= 1 {
                return Ok(Vec::new());
            }
            let sealed = list.len() - 1;
            let mut readers = Vec::with_capacity(sealed);
            let mut input_bytes = 0usize;
            for slot in &list[..sealed] {
                readers.push(slot.writer.reader()?);
                input_bytes += slot.writer.position();
            }
            let snapshot_ids: Vec<BufferId> =
                list[..sealed].iter().map(|s| s.id.clone()).collect();
            (
                readers,
                snapshot_ids,
                list[0].writer.header_timestamp(),
                input_bytes,
            )
        };
        let sealed = snapshot_ids.len();

        // replay into scratch outside any lock; sealed segments are immutable
        let capacity = SEGMENT_HEADER_SIZE + (input_bytes as f64 * self.compaction_ratio) as usize;
        let mut scratch = Buffer::heap(capacity);
        scratch.put_u8(self.compaction_codec_id)?;
        scratch.put_u8(0)?;
        let mut merged =
            codec::create_writer(self.family, self.compaction_codec_id, scratch.clone(), false)?;
        if self.family == CodecFamily::Time {
            merged.set_header_timestamp(header_ts)?;
        }
        for reader in &mut readers {
            loop {
                match reader.read() {
                    Ok(v) => match merged.add(v) {
                        Ok(()) => {}
                        Err(e) if e.is_rollover() => {
                            warn!(
                                field_id = %self.field_id,
                                bucket = self.bucket,
                                capacity,
                                "compacted output exceeds headroom, skipping bucket"
                            );
                            return Ok(Vec::new());
                        }
                        Err(e) => return Err(e),
                    },
                    Err(e) if e.is_end_of_segment() => break,
                    Err(e) => return Err(e),
                }
            }
        }
        let expected: usize = readers.iter().map(|r| r.count()).sum();
        if merged.count() != expected {
            return Err(EmberError::Compaction(format!(
                "replay of {} segments produced {} records, inputs hold {}",
                sealed,
                merged.count(),
                expected
            )));
        }

        // copy into a right-sized allocator buffer, rounded up to even
        let used = merged.position().max(SEGMENT_HEADER_SIZE);
        let size = (used + 1) & !1;
        let mut obj = malloc.create_buffer_sized(&self.field_id, self.bucket, size)?;
        obj.buf.put_buffer(&scratch, used)?;
        let mut payload = obj.buf.clone();
        payload.set_position(SEGMENT_HEADER_SIZE)?;
        let mut writer =
            codec::create_writer(self.family, self.compaction_codec_id, payload, true)?;
        writer.make_read_only();

        // swap: drop the sealed prefix, insert the compacted segment at the
        // head, renumber the index bytes. Rollovers only append, so the
        // prefix is intact unless the bucket was evicted or compacted again
        // since the snapshot.
        let mut list = self.writers.lock();
        let prefix_intact = list.len() > sealed
            && list
                .iter()
                .zip(&snapshot_ids)
                .all(|(slot, id)| slot.id == *id);
        if !prefix_intact {
            warn!(
                field_id = %self.field_id,
                bucket = self.bucket,
                "writer list changed during compaction, discarding compacted segment"
            );
            return Ok(vec![obj.id]);
        }
        let evicted: Vec<WriterSlot> = list.drain(..sealed).collect();
        list.insert(0, WriterSlot {
            id: obj.id,
            buf: obj.buf,
            writer,
        });
        for (i, slot) in list.iter_mut().enumerate() {
            slot.buf.put_u8_at(INDEX_BYTE_OFFSET, i as u8)?;
        }
        debug!(
            field_id = %self.field_id,
            bucket = self.bucket,
            merged = sealed,
            records = list[0].writer.count(),
            "compacted field bucket"
        );
        Ok(evicted.into_iter().map(|s| s.id).collect())
    }

    /// Release every segment of this field (retention eviction). Returns the
    /// freed ids with their buffers so the caller can archive the bytes
    /// before the allocator reclaims them.
    pub fn release_all(&self) -> Vec<(BufferId, Buffer)> {
        let mut list = self.writers.lock();
        list.drain(..).map(|s| (s.id, s.buf)).collect()
    }
}

/// Cursor chaining the readers of a field's segments in list order.
pub struct FieldReaderIterator {
    readers: Vec<Box<dyn SegmentReader>>,
    idx: usize,
}

impl FieldReaderIterator {
    pub fn new(readers: Vec<Box<dyn SegmentReader>>) -> Self {
        Self { readers, idx: 0 }
    }

    /// Next decoded value; `EndOfSegment` once every reader is exhausted,
    /// `ValueFiltered` passed through for the caller to skip.
    pub fn next(&mut self) -> Result<i64> {
        loop {
            let reader = match self.readers.get_mut(self.idx) {
                Some(r) => r,
                None => return Err(EmberError::EndOfSegment),
            };
            match reader.read() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_end_of_segment() => self.idx += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Records across all snapshots
    pub fn count(&self) -> usize {
        self.readers.iter().map(|r| r.count()).sum()
    }
}
