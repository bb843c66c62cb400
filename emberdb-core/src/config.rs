//! Configuration for the storage engine

use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a measurement store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding data and pointer files
    pub data_dir: PathBuf,
    /// Width of one time bucket, in seconds
    pub bucket_size_secs: u32,
    /// Retention window, in hours
    pub retention_hours: u32,
    /// Interval between retention GC passes, in seconds
    pub gc_interval_secs: u64,
    /// Codec used for live ingest segments ("byzantine" or "gorilla")
    pub compression_codec: String,
    /// Background compaction settings
    pub compaction: CompactionConfig,
    /// Buffer allocator settings
    pub allocator: AllocatorConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bucket_size_secs: 4096,
            retention_hours: 24,
            gc_interval_secs: 300,
            compression_codec: "byzantine".to_string(),
            compaction: CompactionConfig::default(),
            allocator: AllocatorConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.bucket_size_secs == 0 {
            return Err(EmberError::Config("bucket_size_secs must be > 0".to_string()));
        }
        if self.compression_codec.is_empty() {
            return Err(EmberError::Config("compression_codec must be set".to_string()));
        }
        self.compaction.validate()?;
        self.allocator.validate()?;
        Ok(())
    }

    /// Retention expressed as a bucket count, never below one
    pub fn retention_buckets(&self) -> usize {
        retention_buckets(self.retention_hours, self.bucket_size_secs)
    }
}

/// Retention window converted to whole buckets
pub fn retention_buckets(retention_hours: u32, bucket_size_secs: u32) -> usize {
    let buckets = (retention_hours as u64 * 3600) / bucket_size_secs.max(1) as u64;
    buckets.max(1) as usize
}

/// Background compaction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Whether scheduled compaction runs at all
    pub enabled: bool,
    /// Interval between compaction passes, in seconds
    pub interval_secs: u64,
    /// Output headroom as a fraction of the summed input sizes
    pub ratio: f64,
    /// Codec used for compacted segments
    pub codec: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 1800,
            ratio: 1.0,
            codec: "gorilla".to_string(),
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ratio <= 0.0 || self.ratio > 2.0 {
            return Err(EmberError::Config(format!(
                "compaction ratio {} out of range (0, 2]",
                self.ratio
            )));
        }
        if self.codec.is_empty() {
            return Err(EmberError::Config("compaction codec must be set".to_string()));
        }
        Ok(())
    }
}

/// Buffer allocator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Default size of one allocated segment buffer, in bytes
    pub buf_increment_size: usize,
    /// Size of one mmap window over the active data file, in bytes
    pub file_map_increment: usize,
    /// Maximum data file size before rotating to a new file, in bytes
    pub max_file_size: usize,
    /// Growth step for the pointer file, in bytes
    pub ptr_file_increment: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            buf_increment_size: 32 * 1024,
            file_map_increment: 1024 * 1024,
            max_file_size: 100 * 1024 * 1024,
            ptr_file_increment: 1024 * 1024,
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buf_increment_size < 16 {
            return Err(EmberError::Config(
                "buf_increment_size too small to hold a segment header".to_string(),
            ));
        }
        if self.buf_increment_size > self.file_map_increment {
            return Err(EmberError::Config(
                "buf_increment_size must not exceed file_map_increment".to_string(),
            ));
        }
        if self.file_map_increment >= self.max_file_size {
            return Err(EmberError::Config(
                "file_map_increment must be smaller than max_file_size".to_string(),
            ));
        }
        if self.ptr_file_increment < 64 {
            return Err(EmberError::Config("ptr_file_increment too small".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = StoreConfig::default();
        config.compression_codec = "gorilla".to_string();
        config.allocator.buf_increment_size = 4096;
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.compression_codec, "gorilla");
        assert_eq!(back.allocator.buf_increment_size, 4096);
        assert!(back.validate().is_ok());
    }

    #[test]
    fn test_retention_buckets_floor() {
        assert_eq!(retention_buckets(24, 4096), 21);
        // never below one bucket
        assert_eq!(retention_buckets(0, 4096), 1);
    }

    #[test]
    fn test_rejects_map_increment_above_file_size() {
        let mut config = StoreConfig::default();
        config.allocator.file_map_increment = config.allocator.max_file_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let mut config = StoreConfig::default();
        config.compaction.ratio = 0.0;
        assert!(config.validate().is_err());
        config.compaction.ratio = 2.5;
        assert!(config.validate().is_err());
    }
}
