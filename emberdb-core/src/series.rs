//! One series: time buckets of fields, ingest, queries, retention.
//!
//! Every bucket keeps a reserved `TS` field holding the timestamp column and
//! one field per named metric. Appends write the timestamp and all values
//! under a single write-lock hold, so a point is either fully visible or not
//! at all. Queries zip each value column against the shared timestamp column
//! position by position.

use crate::buffer::Buffer;
use crate::codec::CodecFamily;
use crate::config;
use crate::error::{EmberError, Result};
use crate::field::{Field, FieldReaderIterator};
use crate::malloc::{BufferId, Malloc};
use crate::types::{
    time_bucket, DataPoint, FieldValue, Predicate, SeriesId, TimeRange, TS_FIELD,
};
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type FieldMap = SkipMap<String, Arc<Field>>;

/// Per-series knobs resolved once from [`StoreConfig`](crate::config::StoreConfig)
#[derive(Debug, Clone, Copy)]
pub struct SeriesOptions {
    pub bucket_size_secs: u32,
    pub codec_id: u8,
    pub compaction_codec_id: u8,
    pub compaction_ratio: f64,
    pub retention_buckets: usize,
}

/// All storage for one tag-set of a measurement.
pub struct Series {
    series_id: SeriesId,
    options: SeriesOptions,
    retention_buckets: AtomicUsize,
    buckets: SkipMap<i32, Arc<FieldMap>>,
    lock: RwLock<()>,
}

impl Series {
    pub fn new(series_id: SeriesId, options: SeriesOptions) -> Self {
        Self {
            series_id,
            options,
            retention_buckets: AtomicUsize::new(options.retention_buckets.max(1)),
            buckets: SkipMap::new(),
            lock: RwLock::new(()),
        }
    }

    pub fn series_id(&self) -> &SeriesId {
        &self.series_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Adjust the retention window; takes effect on the next GC pass
    pub fn set_retention_hours(&self, hours: u32) {
        let buckets = config::retention_buckets(hours, self.options.bucket_size_secs);
        self.retention_buckets.store(buckets, Ordering::Relaxed);
        debug!(series_id = %self.series_id, buckets, "retention updated");
    }

    fn get_or_create_bucket(&self, bucket: i32) -> Arc<FieldMap> {
        self.buckets
            .get_or_insert_with(bucket, || Arc::new(SkipMap::new()))
            .value()
            .clone()
    }

    fn get_or_create_field(&self, fields: &FieldMap, bucket: i32, name: &str) -> Arc<Field> {
        let family = if name == TS_FIELD {
            CodecFamily::Time
        } else {
            CodecFamily::Value
        };
        fields
            .get_or_insert_with(name.to_string(), || {
                Arc::new(Field::new(
                    self.series_id.field_id(name),
                    bucket,
                    family,
                    self.options.codec_id,
                    self.options.compaction_codec_id,
                    self.options.compaction_ratio,
                ))
            })
            .value()
            .clone()
    }

    /// Ingest one point: the timestamp column plus every value column, all
    /// under one write-lock hold
    pub fn add_point(
        &self,
        malloc: &dyn Malloc,
        timestamp: i64,
        values: &[(String, FieldValue)],
    ) -> Result<()> {
        if values.iter().any(|(name, _)| name == TS_FIELD) {
            return Err(EmberError::UnsupportedFieldType(format!(
                "field name {:?} is reserved",
                TS_FIELD
            )));
        }
        let bucket = time_bucket(timestamp, self.options.bucket_size_secs);
        let _guard = self.lock.write();
        let fields = self.get_or_create_bucket(bucket);
        self.get_or_create_field(&fields, bucket, TS_FIELD)
            .add(malloc, timestamp)?;
        for (name, value) in values {
            self.get_or_create_field(&fields, bucket, name)
                .add_value(malloc, *value)?;
        }
        Ok(())
    }

    /// Buckets overlapping a range. The lower bound backs up one bucket:
    /// a segment whose header timestamp precedes the range start can still
    /// hold in-range points.
    fn bucket_range(&self, range: &TimeRange) -> (i32, i32) {
        let lo = time_bucket(range.start, self.options.bucket_size_secs).saturating_sub(1);
        let hi = time_bucket(range.end, self.options.bucket_size_secs);
        (lo, hi)
    }

    /// Snapshot paired (timestamp, value) iterators per overlapping bucket
    fn snapshot_column_iterators(
        &self,
        field_names: &[&str],
        range: &TimeRange,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<(FieldReaderIterator, Vec<FieldReaderIterator>)>> {
        let (lo, hi) = self.bucket_range(range);
        let _guard = self.lock.read();
        let mut pairs = Vec::new();
        'buckets: for entry in self.buckets.range(lo..=hi) {
            let fields = entry.value();
            let ts_field = match fields.get(TS_FIELD) {
                Some(e) => e.value().clone(),
                None => continue,
            };
            let mut value_iters = Vec::with_capacity(field_names.len());
            for name in field_names {
                match fields.get(*name) {
                    Some(e) => value_iters.push(e.value().clone().iterator(predicate)?),
                    // a bucket missing a requested column contributes no rows
                    None => continue 'buckets,
                }
            }
            pairs.push((ts_field.iterator(None)?, value_iters));
        }
        Ok(pairs)
    }

    /// Range query over one field. Swapped endpoints are normalized; the
    /// optional predicate is pushed down to the value column.
    pub fn query_data_points(
        &self,
        field_name: &str,
        start: i64,
        end: i64,
        predicate: Option<Predicate>,
    ) -> Result<Vec<DataPoint>> {
        let range = TimeRange::new(start, end);
        let pairs = self.snapshot_column_iterators(&[field_name], &range, predicate.as_ref())?;
        let mut out = Vec::new();
        for (mut ts_iter, mut value_iters) in pairs {
            let value_iter = &mut value_iters[0];
            loop {
                let ts = match ts_iter.next() {
                    Ok(t) => t,
                    Err(EmberError::EndOfSegment) => break,
                    Err(e) => return Err(e),
                };
                // always advance the value column too, keeping it aligned
                let value = match value_iter.next() {
                    Ok(v) => Some(v),
                    Err(EmberError::ValueFiltered) => None,
                    Err(EmberError::EndOfSegment) => break,
                    Err(e) => return Err(e),
                };
                if let Some(v) = value {
                    if range.contains(ts) {
                        out.push(DataPoint::new(ts, v));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Multi-column range query: one row per timestamp with every requested
    /// field's value. Rows where any column is filtered out are dropped
    /// whole.
    pub fn query_tuples(
        &self,
        field_names: &[&str],
        start: i64,
        end: i64,
        predicate: Option<Predicate>,
    ) -> Result<Vec<(i64, Vec<i64>)>> {
        let range = TimeRange::new(start, end);
        let pairs = self.snapshot_column_iterators(field_names, &range, predicate.as_ref())?;
        let mut out = Vec::new();
        for (mut ts_iter, mut value_iters) in pairs {
            'rows: loop {
                let ts = match ts_iter.next() {
                    Ok(t) => t,
                    Err(EmberError::EndOfSegment) => break,
                    Err(e) => return Err(e),
                };
                let mut row = Vec::with_capacity(value_iters.len());
                let mut filtered = false;
                // read every column before deciding, so cursors stay aligned
                for iter in &mut value_iters {
                    match iter.next() {
                        Ok(v) => row.push(v),
                        Err(EmberError::ValueFiltered) => filtered = true,
                        Err(EmberError::EndOfSegment) => break 'rows,
                        Err(e) => return Err(e),
                    }
                }
                if !filtered && range.contains(ts) {
                    out.push((ts, row));
                }
            }
        }
        Ok(out)
    }

    /// Raw per-bucket column iterators: one timestamp iterator paired with
    /// one iterator per requested field, for callers that stream rows
    /// instead of collecting them. The snapshot happens under the read
    /// lock; iteration runs unlocked afterwards. Buckets overlapping the
    /// range can hold out-of-range points, so the caller still filters
    /// timestamps.
    pub fn query_iterators(
        &self,
        field_names: &[&str],
        start: i64,
        end: i64,
        predicate: Option<Predicate>,
    ) -> Result<Vec<(FieldReaderIterator, Vec<FieldReaderIterator>)>> {
        let range = TimeRange::new(start, end);
        self.snapshot_column_iterators(field_names, &range, predicate.as_ref())
    }

    /// Compact every field of every bucket; returns freed buffer ids
    pub fn compact(&self, malloc: &dyn Malloc) -> Result<Vec<BufferId>> {
        let mut freed = Vec::new();
        for entry in self.buckets.iter() {
            for field in entry.value().iter() {
                freed.extend(field.value().compact(malloc)?);
            }
        }
        Ok(freed)
    }

    /// Evict the oldest buckets beyond the retention window; returns the
    /// freed buffers for the caller to archive and release
    pub fn collect_garbage(&self) -> Result<Vec<(BufferId, Buffer)>> {
        let retention = self.retention_buckets.load(Ordering::Relaxed);
        let _guard = self.lock.write();
        let mut freed = Vec::new();
        while self.buckets.len() > retention {
            let entry = match self.buckets.front() {
                Some(e) => e,
                None => break,
            };
            let bucket = *entry.key();
            let fields = entry.value().clone();
            entry.remove();
            for field in fields.iter() {
                freed.extend(field.value().release_all());
            }
            debug!(series_id = %self.series_id, bucket, "evicted expired bucket");
        }
        Ok(freed)
    }

    /// Recovery: attach restored buffers to one field of one bucket
    pub fn load_field(
        &self,
        field_name: &str,
        bucket: i32,
        entries: Vec<crate::malloc::BufferObject>,
    ) -> Result<()> {
        let _guard = self.lock.write();
        let fields = self.get_or_create_bucket(bucket);
        self.get_or_create_field(&fields, bucket, field_name)
            .load_writers(entries)
    }
}
