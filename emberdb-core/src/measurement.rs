//! Measurement store: series map, allocator, recovery, background passes.
//!
//! A measurement owns one disk allocator and every series written under its
//! name. Opening a measurement replays the allocator's pointer file and
//! rebuilds all series state without touching data-file contents. Compaction
//! and retention GC run per series; a failing series is logged and skipped
//! so one bad series never stalls the pass, and the freed buffer ids are
//! handed back to the allocator in one batch.

use crate::archive::{Archiver, NoneArchiver};
use crate::codec;
use crate::config::StoreConfig;
use crate::error::{EmberError, Result};
use crate::malloc::{BufferObject, DiskMalloc, Malloc};
use crate::series::{Series, SeriesOptions};
use crate::types::{DataPoint, FieldValue, Point, Predicate, SeriesId, SeriesKey, FIELD_ID_SEPARATOR};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// All storage for one measurement name.
pub struct Measurement {
    name: String,
    options: SeriesOptions,
    malloc: Arc<DiskMalloc>,
    series: RwLock<HashMap<SeriesId, Arc<Series>>>,
    archiver: Box<dyn Archiver>,
}

impl Measurement {
    /// Open a measurement, replaying any state recorded by a previous run
    pub fn open(name: impl Into<String>, config: &StoreConfig) -> Result<Self> {
        Self::open_with_archiver(name, config, Box::new(NoneArchiver))
    }

    pub fn open_with_archiver(
        name: impl Into<String>,
        config: &StoreConfig,
        archiver: Box<dyn Archiver>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        let options = SeriesOptions {
            bucket_size_secs: config.bucket_size_secs,
            codec_id: codec::codec_id(&config.compression_codec)?,
            compaction_codec_id: codec::codec_id(&config.compaction.codec)?,
            compaction_ratio: config.compaction.ratio,
            retention_buckets: config.retention_buckets(),
        };
        let malloc = Arc::new(DiskMalloc::open(
            config.data_dir.join(&name),
            config.allocator.clone(),
        )?);
        let m = Self {
            name,
            options,
            malloc,
            series: RwLock::new(HashMap::new()),
            archiver,
        };
        m.recover()?;
        Ok(m)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    fn recover(&self) -> Result<()> {
        let buffer_map = self.malloc.series_buffer_map()?;
        let mut fields = 0usize;
        for (field_id, entries) in buffer_map {
            let (series_part, field_name) = field_id
                .rsplit_once(FIELD_ID_SEPARATOR)
                .ok_or_else(|| {
                    EmberError::Corruption(format!("field id without separator: {}", field_id))
                })?;
            let series = self.get_or_create_series_by_id(SeriesId::from(series_part));
            // pointer-file order is preserved within each bucket group
            let mut by_bucket: BTreeMap<i32, Vec<BufferObject>> = BTreeMap::new();
            for obj in entries {
                by_bucket.entry(obj.id.bucket).or_default().push(obj);
            }
            for (bucket, group) in by_bucket {
                series.load_field(field_name, bucket, group)?;
                fields += 1;
            }
        }
        if fields > 0 {
            info!(measurement = %self.name, fields, "recovered measurement state");
        }
        Ok(())
    }

    fn get_or_create_series_by_id(&self, id: SeriesId) -> Arc<Series> {
        if let Some(s) = self.series.read().get(&id) {
            return Arc::clone(s);
        }
        let mut map = self.series.write();
        Arc::clone(
            map.entry(id.clone())
                .or_insert_with(|| Arc::new(Series::new(id, self.options))),
        )
    }

    /// Series handle for a key, created on first use
    pub fn get_or_create_series(&self, key: &SeriesKey) -> Arc<Series> {
        self.get_or_create_series_by_id(key.series_id())
    }

    pub fn get_series(&self, key: &SeriesKey) -> Option<Arc<Series>> {
        self.series.read().get(&key.series_id()).cloned()
    }

    /// Ingest one point
    pub fn add_point(&self, point: &Point) -> Result<()> {
        self.get_or_create_series(&point.key).add_point(
            self.malloc.as_ref(),
            point.timestamp,
            &point.values,
        )
    }

    /// Ingest a raw (timestamp, field, value) triple
    pub fn add_value(
        &self,
        key: &SeriesKey,
        timestamp: i64,
        field: &str,
        value: FieldValue,
    ) -> Result<()> {
        self.get_or_create_series(key).add_point(
            self.malloc.as_ref(),
            timestamp,
            &[(field.to_string(), value)],
        )
    }

    /// Range query over one field of one series; unknown series yield no rows
    pub fn query_data_points(
        &self,
        key: &SeriesKey,
        field: &str,
        start: i64,
        end: i64,
        predicate: Option<Predicate>,
    ) -> Result<Vec<DataPoint>> {
        match self.get_series(key) {
            Some(s) => s.query_data_points(field, start, end, predicate),
            None => Ok(Vec::new()),
        }
    }

    /// Multi-column range query
    pub fn query_tuples(
        &self,
        key: &SeriesKey,
        fields: &[&str],
        start: i64,
        end: i64,
    ) -> Result<Vec<(i64, Vec<i64>)>> {
        match self.get_series(key) {
            Some(s) => s.query_tuples(fields, start, end, None),
            None => Ok(Vec::new()),
        }
    }

    fn series_snapshot(&self) -> Vec<Arc<Series>> {
        self.series.read().values().cloned().collect()
    }

    /// Compact every series; returns the number of buffers released
    pub fn compact(&self) -> Result<usize> {
        let mut freed = HashSet::new();
        for series in self.series_snapshot() {
            match series.compact(self.malloc.as_ref()) {
                Ok(ids) => freed.extend(ids),
                Err(e) => {
                    error!(
                        measurement = %self.name,
                        series_id = %series.series_id(),
                        error = %e,
                        "compaction failed for series, skipping"
                    );
                }
            }
        }
        let released = freed.len();
        self.malloc.cleanup_buffer_ids(&freed)?;
        if released > 0 {
            info!(measurement = %self.name, released, "compaction pass released buffers");
        }
        Ok(released)
    }

    /// Evict expired buckets from every series; archives each segment before
    /// its buffer is released
    pub fn collect_garbage(&self) -> Result<usize> {
        let mut freed = HashSet::new();
        for series in self.series_snapshot() {
            match series.collect_garbage() {
                Ok(evicted) => {
                    for (id, buf) in evicted {
                        if let Err(e) = self.archiver.archive(&id, &buf) {
                            warn!(
                                measurement = %self.name,
                                error = %e,
                                "archiver rejected expired segment"
                            );
                        }
                        freed.insert(id);
                    }
                }
                Err(e) => {
                    error!(
                        measurement = %self.name,
                        series_id = %series.series_id(),
                        error = %e,
                        "retention pass failed for series, skipping"
                    );
                }
            }
        }
        let released = freed.len();
        self.malloc.cleanup_buffer_ids(&freed)?;
        if released > 0 {
            info!(measurement = %self.name, released, "retention pass released buffers");
        }
        Ok(released)
    }

    /// Adjust retention on every series
    pub fn set_retention_hours(&self, hours: u32) {
        for series in self.series_snapshot() {
            series.set_retention_hours(hours);
        }
    }

    /// Flush mapped state to disk
    pub fn close(&self) -> Result<()> {
        self.malloc.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::config::AllocatorConfig;
    use crate::malloc::BufferId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn small_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            data_dir: dir.path().to_path_buf(),
            bucket_size_secs: 4096,
            retention_hours: 24,
            allocator: AllocatorConfig {
                buf_increment_size: 1024,
                file_map_increment: 16 * 1024,
                max_file_size: 8 * 1024 * 1024,
                ptr_file_increment: 16 * 1024,
            },
            ..StoreConfig::default()
        }
    }

    fn key() -> SeriesKey {
        SeriesKey::new("cpu").with_tag("host", "db-1")
    }

    #[test]
    fn test_restart_recovers_points() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);

        {
            let m = Measurement::open("cpu", &config).unwrap();
            for i in 0..2000i64 {
                m.add_value(&key(), 1_000_000 + i * 100, "usage", FieldValue::Integer(i))
                    .unwrap();
            }
            m.close().unwrap();
        }

        let m = Measurement::open("cpu", &config).unwrap();
        assert_eq!(m.series_count(), 1);
        let points = m
            .query_data_points(&key(), "usage", 0, i64::MAX / 2, None)
            .unwrap();
        assert_eq!(points.len(), 2000);
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        // and ingest continues where it left off
        m.add_value(&key(), 2_000_000, "usage", FieldValue::Integer(-1))
            .unwrap();
        let points = m
            .query_data_points(&key(), "usage", 0, i64::MAX / 2, None)
            .unwrap();
        assert_eq!(points.len(), 2001);
    }

    #[test]
    fn test_ingest_compact_query_scenario() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let m = Measurement::open("cpu", &config).unwrap();

        let n = 10_000i64;
        for i in 0..n {
            m.add_value(&key(), 1_000_000 + i * 100, "usage", FieldValue::Integer(i % 97))
                .unwrap();
        }
        let before = m
            .query_data_points(&key(), "usage", 0, i64::MAX / 2, None)
            .unwrap();
        assert_eq!(before.len(), n as usize);

        let released = m.compact().unwrap();
        assert!(released > 0, "expected sealed segments to be released");

        let after = m
            .query_data_points(&key(), "usage", 0, i64::MAX / 2, None)
            .unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn test_compact_then_restart() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);

        let expected = {
            let m = Measurement::open("cpu", &config).unwrap();
            for i in 0..5000i64 {
                m.add_value(&key(), 1_000_000 + i * 100, "usage", FieldValue::Integer(i))
                    .unwrap();
            }
            m.compact().unwrap();
            let points = m
                .query_data_points(&key(), "usage", 0, i64::MAX / 2, None)
                .unwrap();
            m.close().unwrap();
            points
        };

        let m = Measurement::open("cpu", &config).unwrap();
        let recovered = m
            .query_data_points(&key(), "usage", 0, i64::MAX / 2, None)
            .unwrap();
        assert_eq!(recovered, expected);
    }

    struct CountingArchiver(Arc<AtomicUsize>);

    impl Archiver for CountingArchiver {
        fn archive(&self, _id: &BufferId, _buf: &Buffer) -> Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_gc_archives_then_releases() {
        let dir = TempDir::new().unwrap();
        let mut config = small_config(&dir);
        config.bucket_size_secs = 1;
        config.retention_hours = 1;

        let counter = Arc::new(AtomicUsize::new(0));
        let m = Measurement::open_with_archiver(
            "cpu",
            &config,
            Box::new(CountingArchiver(Arc::clone(&counter))),
        )
        .unwrap();
        for i in 0..10i64 {
            m.add_value(&key(), i * 1000, "usage", FieldValue::Integer(i))
                .unwrap();
        }
        // shrink retention to a single one-second bucket
        m.get_series(&key()).unwrap().set_retention_hours(0);

        let released = m.collect_garbage().unwrap();
        assert!(released > 0);
        assert_eq!(counter.load(Ordering::Relaxed), released);

        let points = m
            .query_data_points(&key(), "usage", 0, i64::MAX / 2, None)
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, 9_000);
    }

    #[test]
    fn test_unknown_series_queries_empty() {
        let dir = TempDir::new().unwrap();
        let m = Measurement::open("cpu", &small_config(&dir)).unwrap();
        let points = m
            .query_data_points(&key(), "usage", 0, 1000, None)
            .unwrap();
        assert!(points.is_empty());
    }
}
