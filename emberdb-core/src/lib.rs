//! # EmberDB core
//!
//! Embedded time-series storage engine. Points are keyed by a tag-derived
//! series identity, partitioned into fixed-duration time buckets, and stored
//! column-wise: every bucket keeps a timestamp column plus one column per
//! named field, each compressed into ordered segment lists by a pluggable
//! codec.
//!
//! Segments live in memory-mapped data files managed by a buffer allocator
//! whose pointer file makes every allocation recoverable after a restart
//! without reading data-file contents. Background compaction merges sealed
//! segments into denser ones and retention GC evicts buckets past the
//! configured window.
//!
//! ```no_run
//! use emberdb_core::{FieldValue, Measurement, SeriesKey, StoreConfig};
//!
//! # fn main() -> emberdb_core::Result<()> {
//! let config = StoreConfig::default();
//! let store = Measurement::open("cpu", &config)?;
//! let key = SeriesKey::new("cpu").with_tag("host", "db-1");
//! store.add_value(&key, 1_700_000_000_000, "usage", FieldValue::Float(0.42))?;
//! let points = store.query_data_points(&key, "usage", 1_700_000_000_000, 1_700_000_060_000, None)?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod field;
pub mod malloc;
pub mod measurement;
pub mod series;
pub mod services;
pub mod types;

pub use archive::{Archiver, NoneArchiver};
pub use config::{AllocatorConfig, CompactionConfig, StoreConfig};
pub use error::{EmberError, Result};
pub use measurement::Measurement;
pub use series::{Series, SeriesOptions};
pub use services::MaintenanceService;
pub use types::{between, DataPoint, FieldValue, Point, SeriesKey, TimeRange, Timestamp};
