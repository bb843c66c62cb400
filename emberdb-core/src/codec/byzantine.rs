//! Byte-aligned delta codec, the default for live ingest.
//!
//! Time payload: `[count:i32][header-ts:i64]` then one record per append,
//! a flag byte followed by the delta-of-delta at the smallest width that
//! holds it (0 bytes, i8, i16 or i32). Value payload: `[count:i32]` then
//! flag + XOR against the previous value at i8/i16/i32/i64 width.
//!
//! Byte alignment keeps appends cheap and makes a partially written record
//! invisible: the count word is bumped only after the record bytes land.

use crate::buffer::Buffer;
use crate::codec::{SegmentReader, SegmentWriter};
use crate::error::{EmberError, Result};
use crate::types::Predicate;

const DOD_ZERO: u8 = 0;
const DOD_I8: u8 = 1;
const DOD_I16: u8 = 2;
const DOD_I32: u8 = 3;

const XOR_ZERO: u8 = 0;
const XOR_I8: u8 = 1;
const XOR_I16: u8 = 2;
const XOR_I32: u8 = 3;
const XOR_I64: u8 = 4;

/// Worst-case time record: flag + i32
const TIME_RECORD_MAX: usize = 5;
/// Worst-case value record: flag + i64
const VALUE_RECORD_MAX: usize = 9;

fn decode_varwidth(buf: &mut Buffer, flag: u8, widest: u8) -> Result<i64> {
    if flag > widest {
        return Err(EmberError::Corruption(format!(
            "invalid record flag {}",
            flag
        )));
    }
    Ok(match flag {
        0 => 0,
        1 => buf.get_i8()? as i64,
        2 => buf.get_i16()? as i64,
        3 => buf.get_i32()? as i64,
        _ => buf.get_i64()?,
    })
}

/// Time-family writer: delta-of-delta against a header timestamp.
pub struct ByzantineTimeWriter {
    buf: Buffer,
    start: usize,
    count: usize,
    header_ts: i64,
    prev_ts: i64,
    prev_delta: i64,
    read_only: bool,
}

impl ByzantineTimeWriter {
    pub fn new(mut buf: Buffer, existing: bool) -> Result<Self> {
        let start = buf.position();
        if existing {
            let count = buf.get_i32_volatile_at(start)? as usize;
            buf.set_position(start + 4)?;
            let header_ts = buf.get_i64()?;
            let mut w = Self {
                buf,
                start,
                count,
                header_ts,
                prev_ts: header_ts,
                prev_delta: 0,
                read_only: false,
            };
            for _ in 0..count {
                let flag = w.buf.get_u8()?;
                let dod = decode_varwidth(&mut w.buf, flag, DOD_I32)?;
                let delta = w.prev_delta + dod;
                w.prev_ts += delta;
                w.prev_delta = delta;
            }
            Ok(w)
        } else {
            buf.put_i32(0)?;
            buf.put_i64(0)?;
            Ok(Self {
                buf,
                start,
                count: 0,
                header_ts: 0,
                prev_ts: 0,
                prev_delta: 0,
                read_only: false,
            })
        }
    }
}

impl SegmentWriter for ByzantineTimeWriter {
    fn add(&mut self, value: i64) -> Result<()> {
        if self.read_only {
            return Err(EmberError::SegmentReadOnly);
        }
        if self.buf.remaining() < TIME_RECORD_MAX {
            return Err(EmberError::SegmentFull);
        }
        let delta = value - self.prev_ts;
        let dod = delta - self.prev_delta;
        if dod == 0 {
            self.buf.put_u8(DOD_ZERO)?;
        } else if (i8::MIN as i64..=i8::MAX as i64).contains(&dod) {
            self.buf.put_u8(DOD_I8)?;
            self.buf.put_i8(dod as i8)?;
        } else if (i16::MIN as i64..=i16::MAX as i64).contains(&dod) {
            self.buf.put_u8(DOD_I16)?;
            self.buf.put_i16(dod as i16)?;
        } else if (i32::MIN as i64..=i32::MAX as i64).contains(&dod) {
            self.buf.put_u8(DOD_I32)?;
            self.buf.put_i32(dod as i32)?;
        } else {
            return Err(EmberError::Corruption(format!(
                "timestamp delta-of-delta {} exceeds 32 bits",
                dod
            )));
        }
        self.prev_ts = value;
        self.prev_delta = delta;
        self.count += 1;
        self.buf.put_i32_volatile_at(self.start, self.count as i32)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn position(&self) -> usize {
        self.buf.position()
    }

    fn set_header_timestamp(&mut self, ts: i64) -> Result<()> {
        if self.count != 0 {
            return Err(EmberError::Corruption(
                "header timestamp set after first record".to_string(),
            ));
        }
        let pos = self.buf.position();
        self.buf.set_position(self.start + 4)?;
        self.buf.put_i64(ts)?;
        self.buf.set_position(pos)?;
        self.header_ts = ts;
        self.prev_ts = ts;
        Ok(())
    }

    fn header_timestamp(&self) -> i64 {
        self.header_ts
    }

    fn make_read_only(&mut self) {
        self.read_only = true;
        self.buf.mark_read_only();
    }

    fn reader(&self) -> Result<Box<dyn SegmentReader>> {
        let snapshot = self.buf.get_i32_volatile_at(self.start)? as usize;
        let mut buf = self.buf.duplicate();
        buf.set_position(self.start + 4)?;
        let header_ts = buf.get_i64()?;
        Ok(Box::new(ByzantineTimeReader {
            buf,
            count: snapshot,
            read: 0,
            prev_ts: header_ts,
            prev_delta: 0,
            predicate: None,
        }))
    }
}

pub struct ByzantineTimeReader {
    buf: Buffer,
    count: usize,
    read: usize,
    prev_ts: i64,
    prev_delta: i64,
    predicate: Option<Predicate>,
}

impl SegmentReader for ByzantineTimeReader {
    fn read(&mut self) -> Result<i64> {
        if self.read >= self.count {
            return Err(EmberError::EndOfSegment);
        }
        let flag = self.buf.get_u8()?;
        let dod = decode_varwidth(&mut self.buf, flag, DOD_I32)?;
        let delta = self.prev_delta + dod;
        self.prev_ts += delta;
        self.prev_delta = delta;
        self.read += 1;
        if let Some(p) = &self.predicate {
            if !p(self.prev_ts) {
                return Err(EmberError::ValueFiltered);
            }
        }
        Ok(self.prev_ts)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn set_predicate(&mut self, predicate: Predicate) {
        self.predicate = Some(predicate);
    }
}

/// Value-family writer: XOR against the previous raw value.
pub struct ByzantineValueWriter {
    buf: Buffer,
    start: usize,
    count: usize,
    prev: i64,
    read_only: bool,
}

impl ByzantineValueWriter {
    pub fn new(mut buf: Buffer, existing: bool) -> Result<Self> {
        let start = buf.position();
        if existing {
            let count = buf.get_i32_volatile_at(start)? as usize;
            buf.set_position(start + 4)?;
            let mut w = Self {
                buf,
                start,
                count,
                prev: 0,
                read_only: false,
            };
            for _ in 0..count {
                let flag = w.buf.get_u8()?;
                let xor = decode_varwidth(&mut w.buf, flag, XOR_I64)?;
                w.prev ^= xor;
            }
            Ok(w)
        } else {
            buf.put_i32(0)?;
            Ok(Self {
                buf,
                start,
                count: 0,
                prev: 0,
                read_only: false,
            })
        }
    }
}

impl SegmentWriter for ByzantineValueWriter {
    fn add(&mut self, value: i64) -> Result<()> {
        if self.read_only {
            return Err(EmberError::SegmentReadOnly);
        }
        if self.buf.remaining() < VALUE_RECORD_MAX {
            return Err(EmberError::SegmentFull);
        }
        let xor = self.prev ^ value;
        if xor == 0 {
            self.buf.put_u8(XOR_ZERO)?;
        } else if (i8::MIN as i64..=i8::MAX as i64).contains(&xor) {
            self.buf.put_u8(XOR_I8)?;
            self.buf.put_i8(xor as i8)?;
        } else if (i16::MIN as i64..=i16::MAX as i64).contains(&xor) {
            self.buf.put_u8(XOR_I16)?;
            self.buf.put_i16(xor as i16)?;
        } else if (i32::MIN as i64..=i32::MAX as i64).contains(&xor) {
            self.buf.put_u8(XOR_I32)?;
            self.buf.put_i32(xor as i32)?;
        } else {
            self.buf.put_u8(XOR_I64)?;
            self.buf.put_i64(xor)?;
        }
        self.prev = value;
        self.count += 1;
        self.buf.put_i32_volatile_at(self.start, self.count as i32)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn position(&self) -> usize {
        self.buf.position()
    }

    fn set_header_timestamp(&mut self, _ts: i64) -> Result<()> {
        Ok(())
    }

    fn header_timestamp(&self) -> i64 {
        0
    }

    fn make_read_only(&mut self) {
        self.read_only = true;
        self.buf.mark_read_only();
    }

    fn reader(&self) -> Result<Box<dyn SegmentReader>> {
        let snapshot = self.buf.get_i32_volatile_at(self.start)? as usize;
        let mut buf = self.buf.duplicate();
        buf.set_position(self.start + 4)?;
        Ok(Box::new(ByzantineValueReader {
            buf,
            count: snapshot,
            read: 0,
            prev: 0,
            predicate: None,
        }))
    }
}

pub struct ByzantineValueReader {
    buf: Buffer,
    count: usize,
    read: usize,
    prev: i64,
    predicate: Option<Predicate>,
}

impl SegmentReader for ByzantineValueReader {
    fn read(&mut self) -> Result<i64> {
        if self.read >= self.count {
            return Err(EmberError::EndOfSegment);
        }
        let flag = self.buf.get_u8()?;
        let xor = decode_varwidth(&mut self.buf, flag, XOR_I64)?;
        self.prev ^= xor;
        self.read += 1;
        if let Some(p) = &self.predicate {
            if !p(self.prev) {
                return Err(EmberError::ValueFiltered);
            }
        }
        Ok(self.prev)
    }

    fn count(&self) -> usize {
        self.count
    }

    fn set_predicate(&mut self, predicate: Predicate) {
        self.predicate = Some(predicate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::between;

    fn drain(reader: &mut dyn SegmentReader) -> Vec<i64> {
        let mut out = Vec::new();
        loop {
            match reader.read() {
                Ok(v) => out.push(v),
                Err(EmberError::ValueFiltered) => continue,
                Err(EmberError::EndOfSegment) => break,
                Err(e) => panic!("unexpected read error: {}", e),
            }
        }
        out
    }

    #[test]
    fn test_time_roundtrip_with_jitter() {
        let mut w = ByzantineTimeWriter::new(Buffer::heap(4096), false).unwrap();
        let base = 1_700_000_000_000i64;
        w.set_header_timestamp(base).unwrap();

        let deltas = [0i64, 1000, 1000, 997, 1003, 1000, 50_000, 1000];
        let mut ts = base;
        let mut expected = Vec::new();
        for d in deltas {
            ts += d;
            w.add(ts).unwrap();
            expected.push(ts);
        }

        let mut r = w.reader().unwrap();
        assert_eq!(r.count(), deltas.len());
        assert_eq!(drain(r.as_mut()), expected);
    }

    #[test]
    fn test_value_roundtrip_all_widths() {
        let mut w = ByzantineValueWriter::new(Buffer::heap(4096), false).unwrap();
        let values = [
            0i64,
            0, // xor zero path
            5,
            300,
            70_000,
            6_000_000_000,
            (3.25f64).to_bits() as i64,
            -1,
        ];
        for v in values {
            w.add(v).unwrap();
        }
        let mut r = w.reader().unwrap();
        assert_eq!(drain(r.as_mut()), values.to_vec());
    }

    #[test]
    fn test_segment_full_then_writer_unchanged() {
        // room for header + exactly two worst-case records
        let mut w = ByzantineTimeWriter::new(Buffer::heap(12 + 2 * TIME_RECORD_MAX), false).unwrap();
        w.set_header_timestamp(0).unwrap();
        w.add(1_000_000).unwrap();
        w.add(2_000_000).unwrap();
        assert!(w.add(3_000_000).unwrap_err().is_rollover());
        // the failed append published nothing
        let mut r = w.reader().unwrap();
        assert_eq!(drain(r.as_mut()), vec![1_000_000, 2_000_000]);
    }

    #[test]
    fn test_recovery_replay_resumes_appends() {
        let buf = Buffer::heap(4096);
        let shared = buf.duplicate();
        let mut w = ByzantineTimeWriter::new(buf, false).unwrap();
        w.set_header_timestamp(1000).unwrap();
        for i in 1..=50 {
            w.add(1000 + i * 10).unwrap();
        }
        drop(w);

        // reopen over the same bytes and keep appending
        let mut w2 = ByzantineTimeWriter::new(shared, true).unwrap();
        assert_eq!(w2.count(), 50);
        for i in 51..=60 {
            w2.add(1000 + i * 10).unwrap();
        }
        let mut r = w2.reader().unwrap();
        let all = drain(r.as_mut());
        assert_eq!(all.len(), 60);
        assert_eq!(all[0], 1010);
        assert_eq!(all[59], 1600);
    }

    #[test]
    fn test_reader_snapshot_excludes_later_appends() {
        let mut w = ByzantineValueWriter::new(Buffer::heap(4096), false).unwrap();
        w.add(1).unwrap();
        w.add(2).unwrap();
        let mut r = w.reader().unwrap();
        w.add(3).unwrap();
        assert_eq!(drain(r.as_mut()), vec![1, 2]);
    }

    #[test]
    fn test_predicate_filters_values() {
        let mut w = ByzantineValueWriter::new(Buffer::heap(4096), false).unwrap();
        for v in [10, 20, 30, 40] {
            w.add(v).unwrap();
        }
        let mut r = w.reader().unwrap();
        r.set_predicate(between(15, 35));
        assert_eq!(drain(r.as_mut()), vec![20, 30]);
    }

    #[test]
    fn test_read_only_rejects_appends() {
        let mut w = ByzantineValueWriter::new(Buffer::heap(64), false).unwrap();
        w.add(1).unwrap();
        w.make_read_only();
        assert!(matches!(
            w.add(2).unwrap_err(),
            EmberError::SegmentReadOnly
        ));
    }
}
