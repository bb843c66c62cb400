//! Disk-backed buffer allocator.
//!
//! Data lives in append-only files named `data-%012d.dat`. The active file
//! grows one mmap window at a time; when the next window would pass the
//! maximum file size the allocator rotates to a fresh file. Buffers handed
//! out keep an `Arc` on their window, so rotation never invalidates a live
//! segment.
//!
//! Every allocation appends one text record to the `.ptr` pointer file. The
//! file leads with a big-endian `i32` record count followed by
//! `u16`-length-prefixed records; the count is bumped only after the record
//! bytes are in place, so a crash mid-append loses at most the allocation
//! being written.

use crate::buffer::{Buffer, RawRegion};
use crate::config::AllocatorConfig;
use crate::error::{EmberError, Result};
use crate::malloc::{BufferId, BufferObject, Malloc};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const DATA_FILE_PREFIX: &str = "data-";
const DATA_FILE_SUFFIX: &str = ".dat";
const PTR_FILE_NAME: &str = ".ptr";

fn data_file_index(name: &str) -> Option<u64> {
    name.strip_prefix(DATA_FILE_PREFIX)?
        .strip_suffix(DATA_FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Memory-mapped disk allocator for one measurement directory.
pub struct DiskMalloc {
    dir: PathBuf,
    config: AllocatorConfig,
    state: Mutex<State>,
}

struct State {
    next_file_index: u64,
    active: Option<ActiveFile>,
    ptr: PtrFile,
}

struct ActiveFile {
    name: String,
    file: File,
    region: Arc<RawRegion>,
    window_base: usize,
    window_pos: usize,
}

impl DiskMalloc {
    /// Open (or create) the allocator for a directory
    pub fn open(dir: impl Into<PathBuf>, config: AllocatorConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let ptr = PtrFile::open(&dir.join(PTR_FILE_NAME), config.ptr_file_increment)?;
        let mut next_file_index = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(idx) = entry.file_name().to_str().and_then(data_file_index) {
                next_file_index = next_file_index.max(idx + 1);
            }
        }
        Ok(Self {
            dir,
            config,
            state: Mutex::new(State {
                next_file_index,
                active: None,
                ptr,
            }),
        })
    }

    fn new_file(&self, st: &mut State, window_size: usize) -> Result<()> {
        if let Some(old) = st.active.take() {
            old.region.flush()?;
        }
        let name = format!("{}{:012}{}", DATA_FILE_PREFIX, st.next_file_index, DATA_FILE_SUFFIX);
        st.next_file_index += 1;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.dir.join(&name))?;
        file.set_len(window_size as u64)?;
        let map = MmapOptions::new().len(window_size).map_raw(&file)?;
        info!(file = %name, size = window_size, "created data file");
        st.active = Some(ActiveFile {
            name,
            file,
            region: RawRegion::mapped(Arc::new(map)),
            window_base: 0,
            window_pos: 0,
        });
        Ok(())
    }

    fn new_window(&self, st: &mut State, base: usize, window_size: usize) -> Result<()> {
        let active = st.active.as_mut().ok_or_else(|| {
            EmberError::Corruption("window extension without an active file".to_string())
        })?;
        active.region.flush()?;
        active.file.set_len((base + window_size) as u64)?;
        let map = MmapOptions::new()
            .offset(base as u64)
            .len(window_size)
            .map_raw(&active.file)?;
        debug!(file = %active.name, base, size = window_size, "mapped new window");
        active.region = RawRegion::mapped(Arc::new(map));
        active.window_base = base;
        active.window_pos = 0;
        Ok(())
    }
}

impl Malloc for DiskMalloc {
    fn create_buffer_sized(&self, field_id: &str, bucket: i32, size: usize) -> Result<BufferObject> {
        if size == 0 || size > self.config.max_file_size {
            return Err(EmberError::Config(format!(
                "buffer size {} outside (0, {}]",
                size, self.config.max_file_size
            )));
        }
        let window_size = self.config.file_map_increment.max(size);
        let mut st = self.state.lock();

        let needs_room = match &st.active {
            None => true,
            Some(a) => a.window_pos + size > a.region.len(),
        };
        if needs_room {
            match &st.active {
                Some(a) => {
                    let next_base = a.window_base + a.window_pos;
                    if next_base + window_size > self.config.max_file_size {
                        self.new_file(&mut st, window_size)?;
                    } else {
                        self.new_window(&mut st, next_base, window_size)?;
                    }
                }
                None => self.new_file(&mut st, window_size)?,
            }
        }

        let id = {
            let active = st.active.as_ref().ok_or_else(|| {
                EmberError::Corruption("allocation without an active file".to_string())
            })?;
            BufferId {
                field_id: field_id.to_string(),
                file_name: active.name.clone(),
                local_offset: active.window_pos,
                base_offset: active.window_base,
                size,
                bucket,
            }
        };
        st.ptr.append(&id.encode(), self.config.ptr_file_increment)?;
        let active = st.active.as_mut().ok_or_else(|| {
            EmberError::Corruption("allocation without an active file".to_string())
        })?;
        let buf = Buffer::new(Arc::clone(&active.region), active.window_pos, size)?;
        active.window_pos += size;
        debug!(field_id, bucket, size, "allocated buffer");
        Ok(BufferObject { id, buf })
    }

    fn default_buffer_size(&self) -> usize {
        self.config.buf_increment_size
    }

    fn series_buffer_map(&self) -> Result<HashMap<String, Vec<BufferObject>>> {
        let mut st = self.state.lock();

        // map every data file in full; pointer records carry everything else
        let mut regions: HashMap<String, Arc<RawRegion>> = HashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = match entry.file_name().to_str() {
                Some(n) if data_file_index(n).is_some() => n.to_string(),
                _ => continue,
            };
            let file = OpenOptions::new().read(true).write(true).open(entry.path())?;
            let map = MmapOptions::new().map_raw(&file)?;
            regions.insert(name, RawRegion::mapped(Arc::new(map)));
        }

        let mut out: HashMap<String, Vec<BufferObject>> = HashMap::new();
        let mut buffers = 0usize;
        for line in st.ptr.records()? {
            let id = BufferId::parse(&line)?;
            let region = regions.get(&id.file_name).ok_or_else(|| {
                EmberError::Corruption(format!(
                    "pointer record references missing file {}",
                    id.file_name
                ))
            })?;
            let buf = Buffer::new(Arc::clone(region), id.file_offset(), id.size)?;
            out.entry(id.field_id.clone())
                .or_default()
                .push(BufferObject { id, buf });
            buffers += 1;
        }
        // new allocations go to a fresh file past the recovered ones
        st.active = None;
        info!(buffers, fields = out.len(), "recovered buffer map");
        Ok(out)
    }

    fn cleanup_buffer_ids(&self, ids: &HashSet<BufferId>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut st = self.state.lock();
        let mut survivors = Vec::new();
        let mut live_files: HashSet<String> = HashSet::new();
        for line in st.ptr.records()? {
            let id = BufferId::parse(&line)?;
            if !ids.contains(&id) {
                live_files.insert(id.file_name.clone());
                survivors.push(line);
            }
        }
        let removed = st.ptr.count as usize - survivors.len();
        st.ptr.rewrite(&survivors)?;

        // the active file is still being appended to; it becomes deletable
        // after the next rotation
        let active_name = st.active.as_ref().map(|a| a.name.clone());
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = match entry.file_name().to_str() {
                Some(n) if data_file_index(n).is_some() => n.to_string(),
                _ => continue,
            };
            if !live_files.contains(&name) && Some(&name) != active_name.as_ref() {
                fs::remove_file(entry.path())?;
                info!(file = %name, "deleted data file with no live buffers");
            }
        }
        info!(removed, surviving = survivors.len(), "cleaned up buffer ids");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let st = self.state.lock();
        if let Some(active) = &st.active {
            active.region.flush()?;
        }
        st.ptr.map.flush()?;
        Ok(())
    }
}

/// Pointer file: `[count:i32 BE]` then `u16 BE`-length-prefixed records.
struct PtrFile {
    file: File,
    map: MmapMut,
    position: usize,
    count: u32,
}

impl PtrFile {
    fn open(path: &Path, increment: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() < 4 {
            file.set_len(increment as u64)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let count = u32::from_be_bytes(map[0..4].try_into().map_err(|_| {
            EmberError::Corruption("pointer file shorter than its count word".to_string())
        })?);
        // walk the records once to find the append cursor
        let mut position = 4usize;
        for _ in 0..count {
            if position + 2 > map.len() {
                return Err(EmberError::Corruption(
                    "pointer file count exceeds file length".to_string(),
                ));
            }
            let len = u16::from_be_bytes([map[position], map[position + 1]]) as usize;
            position += 2 + len;
            if position > map.len() {
                return Err(EmberError::Corruption(
                    "pointer record runs past end of file".to_string(),
                ));
            }
        }
        Ok(Self {
            file,
            map,
            position,
            count,
        })
    }

    fn append(&mut self, record: &str, increment: usize) -> Result<()> {
        let bytes = record.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(EmberError::Config(format!(
                "pointer record of {} bytes exceeds the length prefix",
                bytes.len()
            )));
        }
        let need = 2 + bytes.len();
        if self.position + need > self.map.len() {
            // grow, remap, and keep appending at the SAME cursor; the remap
            // must not reset the write position
            self.map.flush()?;
            let new_len = self.map.len() + increment.max(need);
            self.file.set_len(new_len as u64)?;
            self.map = unsafe { MmapMut::map_mut(&self.file)? };
        }
        let p = self.position;
        self.map[p..p + 2].copy_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.map[p + 2..p + need].copy_from_slice(bytes);
        self.position += need;
        // count bumped last: a crash before this point drops the record
        self.count += 1;
        self.map[0..4].copy_from_slice(&self.count.to_be_bytes());
        Ok(())
    }

    fn records(&self) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(self.count as usize);
        let mut pos = 4usize;
        for _ in 0..self.count {
            let len = u16::from_be_bytes([self.map[pos], self.map[pos + 1]]) as usize;
            let text = std::str::from_utf8(&self.map[pos + 2..pos + 2 + len]).map_err(|_| {
                EmberError::Corruption("pointer record is not valid UTF-8".to_string())
            })?;
            out.push(text.to_string());
            pos += 2 + len;
        }
        Ok(out)
    }

    /// Replace all records; the count word is patched last
    fn rewrite(&mut self, records: &[String]) -> Result<()> {
        let mut scratch = vec![0u8; 4];
        for r in records {
            let b = r.as_bytes();
            scratch.extend_from_slice(&(b.len() as u16).to_be_bytes());
            scratch.extend_from_slice(b);
        }
        if scratch.len() > self.map.len() {
            return Err(EmberError::Corruption(
                "pointer rewrite grew past the file".to_string(),
            ));
        }
        self.map[4..scratch.len()].copy_from_slice(&scratch[4..]);
        self.position = scratch.len();
        self.count = records.len() as u32;
        self.map[0..4].copy_from_slice(&self.count.to_be_bytes());
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny_config() -> AllocatorConfig {
        AllocatorConfig {
            buf_increment_size: 128,
            file_map_increment: 512,
            max_file_size: 1024,
            ptr_file_increment: 256,
        }
    }

    #[test]
    fn test_allocate_write_recover() {
        let dir = TempDir::new().unwrap();
        let malloc = DiskMalloc::open(dir.path(), tiny_config()).unwrap();

        let mut a = malloc.create_buffer("cpu#value", 3).unwrap();
        let mut b = malloc.create_buffer("cpu#TS", 3).unwrap();
        a.buf.put_i64(111).unwrap();
        b.buf.put_i64(222).unwrap();
        malloc.close().unwrap();
        drop(malloc);

        let reopened = DiskMalloc::open(dir.path(), tiny_config()).unwrap();
        let map = reopened.series_buffer_map().unwrap();
        assert_eq!(map.len(), 2);

        let recovered = &map["cpu#value"][0];
        assert_eq!(recovered.id, a.id);
        assert_eq!(recovered.id.bucket, 3);
        let mut rdr = recovered.buf.duplicate();
        assert_eq!(rdr.get_i64().unwrap(), 111);
    }

    #[test]
    fn test_file_rotation_and_windows() {
        let dir = TempDir::new().unwrap();
        let malloc = DiskMalloc::open(dir.path(), tiny_config()).unwrap();

        // 1024-byte files, 128-byte buffers: 9 allocations need a second file
        let mut names = Vec::new();
        for i in 0..9 {
            let obj = malloc.create_buffer("m#f", i).unwrap();
            names.push(obj.id.file_name.clone());
        }
        assert_eq!(names[0], "data-000000000000.dat");
        assert_eq!(names[8], "data-000000000001.dat");
        // window boundary at 512: fifth buffer stays in the first file
        assert_eq!(names[4], "data-000000000000.dat");
    }

    #[test]
    fn test_pointer_file_growth_preserves_records() {
        let dir = TempDir::new().unwrap();
        let malloc = DiskMalloc::open(dir.path(), tiny_config()).unwrap();

        // long field ids force several .ptr grow cycles
        let field = format!("measurement,host=host-{}#value", "x".repeat(60));
        for i in 0..40 {
            malloc.create_buffer(&field, i).unwrap();
        }
        malloc.close().unwrap();
        drop(malloc);

        let reopened = DiskMalloc::open(dir.path(), tiny_config()).unwrap();
        let map = reopened.series_buffer_map().unwrap();
        let bufs = &map[&field];
        assert_eq!(bufs.len(), 40);
        // order preserved
        for (i, obj) in bufs.iter().enumerate() {
            assert_eq!(obj.id.bucket, i as i32);
        }
    }

    #[test]
    fn test_cleanup_removes_records_and_dead_files() {
        let dir = TempDir::new().unwrap();
        let malloc = DiskMalloc::open(dir.path(), tiny_config()).unwrap();

        let mut freed = HashSet::new();
        let mut kept = Vec::new();
        for i in 0..16 {
            let obj = malloc.create_buffer("m#f", i).unwrap();
            if i < 8 {
                freed.insert(obj.id);
            } else {
                kept.push(obj.id);
            }
        }
        // first file's buffers are all freed
        malloc.cleanup_buffer_ids(&freed).unwrap();

        assert!(!dir.path().join("data-000000000000.dat").exists());
        assert!(dir.path().join("data-000000000001.dat").exists());

        let map = malloc.series_buffer_map().unwrap();
        let ids: Vec<_> = map["m#f"].iter().map(|o| o.id.clone()).collect();
        assert_eq!(ids, kept);
    }

    #[test]
    fn test_cleanup_spares_active_file() {
        let dir = TempDir::new().unwrap();
        let malloc = DiskMalloc::open(dir.path(), tiny_config()).unwrap();

        let obj = malloc.create_buffer("m#f", 0).unwrap();
        let mut freed = HashSet::new();
        freed.insert(obj.id);
        malloc.cleanup_buffer_ids(&freed).unwrap();
        // record gone, file still backing the active window
        assert!(dir.path().join("data-000000000000.dat").exists());
        assert!(malloc.series_buffer_map().unwrap().is_empty());
    }
}
