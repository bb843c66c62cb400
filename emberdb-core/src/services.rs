//! Scheduled background maintenance: compaction and retention GC.
//!
//! Both passes run on tokio intervals and do their blocking work on the
//! blocking pool. A failed cycle is logged and the loop keeps ticking.

use crate::config::StoreConfig;
use crate::measurement::Measurement;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Handles to the background loops of one measurement.
pub struct MaintenanceService {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceService {
    /// Spawn the maintenance loops configured for this store. Must be called
    /// from within a tokio runtime.
    pub fn start(measurement: Arc<Measurement>, config: &StoreConfig) -> Self {
        let mut tasks = Vec::new();
        if config.compaction.enabled {
            tasks.push(spawn_loop(
                Arc::clone(&measurement),
                Duration::from_secs(config.compaction.interval_secs),
                "compaction",
                |m| m.compact(),
            ));
        }
        tasks.push(spawn_loop(
            measurement,
            Duration::from_secs(config.gc_interval_secs),
            "retention",
            |m| m.collect_garbage(),
        ));
        Self { tasks }
    }

    /// Stop all loops
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MaintenanceService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_loop(
    measurement: Arc<Measurement>,
    period: Duration,
    pass: &'static str,
    run: fn(&Measurement) -> crate::error::Result<usize>,
) -> JoinHandle<()> {
    info!(measurement = %measurement.name(), pass, period_secs = period.as_secs_f64(), "starting maintenance loop");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it so a fresh store isn't
        // compacted at startup
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let m = Arc::clone(&measurement);
            let result = tokio::task::spawn_blocking(move || run(&m)).await;
            match result {
                Ok(Ok(released)) => {
                    if released > 0 {
                        debug!(pass, released, "maintenance cycle released buffers");
                    }
                }
                Ok(Err(e)) => error!(pass, error = %e, "maintenance cycle failed"),
                Err(e) => error!(pass, error = %e, "maintenance task panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::types::{FieldValue, SeriesKey};
    use tempfile::TempDir;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    fn fast_config(dir: &TempDir) -> StoreConfig {
        let mut config = StoreConfig {
            data_dir: dir.path().to_path_buf(),
            allocator: AllocatorConfig {
                buf_increment_size: 512,
                file_map_increment: 8192,
                max_file_size: 4 * 1024 * 1024,
                ptr_file_increment: 8192,
            },
            ..StoreConfig::default()
        };
        config.compaction.interval_secs = 1;
        config.gc_interval_secs = 1;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduled_compaction_preserves_data() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let config = fast_config(&dir);
        let m = Arc::new(Measurement::open("cpu", &config).unwrap());
        let key = SeriesKey::new("cpu").with_tag("host", "a");

        for i in 0..3000i64 {
            m.add_value(&key, 1_000_000 + i * 100, "usage", FieldValue::Integer(i))
                .unwrap();
        }
        let before = m
            .query_data_points(&key, "usage", 0, i64::MAX / 2, None)
            .unwrap();

        let mut service = MaintenanceService::start(Arc::clone(&m), &config);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        service.stop();

        let after = m
            .query_data_points(&key, "usage", 0, i64::MAX / 2, None)
            .unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduled_gc_evicts_expired_buckets() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(&dir);
        config.bucket_size_secs = 1;
        let m = Arc::new(Measurement::open("cpu", &config).unwrap());
        let key = SeriesKey::new("cpu").with_tag("host", "a");

        for i in 0..20i64 {
            m.add_value(&key, i * 1000, "usage", FieldValue::Integer(i))
                .unwrap();
        }
        let series = m.get_series(&key).unwrap();
        assert_eq!(series.bucket_count(), 20);
        series.set_retention_hours(0); // one bucket

        let mut service = MaintenanceService::start(Arc::clone(&m), &config);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        service.stop();

        assert_eq!(series.bucket_count(), 1);
    }
}
