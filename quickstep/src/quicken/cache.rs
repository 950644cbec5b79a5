//! On-disk cache of quicken tables, keyed by image content identity.
//!
//! One process-wide mutex serializes all builder/cache operations: two
//! threads that simultaneously encounter the same unknown image elect one
//! builder, and the loser finds the finished table when it wakes. Images
//! first observed during unwinding are enqueued as build requests that an
//! external caller drains off the hot path.
//!
//! File layout (little-endian): header `{ magic "QTBL", version u16, arch u8,
//! flags u8, record_count u32, pool_len u32, content_hash [u8;32],
//! build_id_len u8, build_id }`, then `record_count` records
//! `{ pc_start u32, pc_end u32, instruction_offset u32 }`, then the
//! instruction pool. The file name is the image base name joined with the
//! content hash.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use crate::arch::Arch;
use crate::error::CacheError;
use crate::maps::{ContentHash, Image};
use crate::quicken::builder::{BuildStats, TableBuilder};
use crate::quicken::table::{QuickenRecord, QuickenTable};

const MAGIC: [u8; 4] = *b"QTBL";
const VERSION: u16 = 1;

/// A deferred build request recorded during unwinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBuild {
    pub path: String,
    pub base_name: String,
    pub elf_offset: u64,
    pub content_hash: ContentHash,
}

struct CacheState {
    loaded: HashMap<[u8; 32], Arc<QuickenTable>>,
    requests: HashMap<[u8; 32], PendingBuild>,
}

/// Persistent store of built tables plus the in-memory loaded set.
pub struct TableCache {
    root: PathBuf,
    state: Mutex<CacheState>,
}

impl TableCache {
    /// # Errors
    /// Returns an error if the cache directory cannot be created.
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            state: Mutex::new(CacheState { loaded: HashMap::new(), requests: HashMap::new() }),
        })
    }

    fn file_path(&self, base_name: &str, hash: &ContentHash) -> PathBuf {
        self.root.join(format!("{base_name}.{}.qtbl", hash.hex()))
    }

    /// True once a table for this identity exists, whether it was generated
    /// locally or loaded from disk.
    #[must_use]
    pub fn has_hash(&self, base_name: &str, hash: &ContentHash) -> bool {
        let state = self.state.lock().expect("table cache poisoned");
        state.loaded.contains_key(&hash.0) || self.file_path(base_name, hash).exists()
    }

    /// True when any cached table for `base_name` carries this build id.
    /// Secondary key that survives path changes.
    #[must_use]
    pub fn has_build_id(&self, base_name: &str, build_id: &str) -> bool {
        let _guard = self.state.lock().expect("table cache poisoned");
        let Ok(entries) = fs::read_dir(&self.root) else {
            return false;
        };
        let prefix = format!("{base_name}.");
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".qtbl") {
                continue;
            }
            if let Ok(stored) = read_header_build_id(&entry.path()) {
                if stored == build_id {
                    return true;
                }
            }
        }
        false
    }

    /// Load the table for an image, from memory or disk.
    ///
    /// # Errors
    /// `TableMissing` when no file exists; `TableCorrupt` when the file does
    /// not validate against the requested identity.
    pub fn load(&self, image: &Image) -> Result<Arc<QuickenTable>, CacheError> {
        let mut state = self.state.lock().expect("table cache poisoned");
        self.load_locked(&mut state, image)
    }

    fn load_locked(
        &self,
        state: &mut CacheState,
        image: &Image,
    ) -> Result<Arc<QuickenTable>, CacheError> {
        if let Some(table) = state.loaded.get(&image.content_hash.0) {
            return Ok(Arc::clone(table));
        }
        let path = self.file_path(&image.base_name, &image.content_hash);
        let table = Arc::new(read_table_file(&path, &image.content_hash)?);
        state.loaded.insert(image.content_hash.0, Arc::clone(&table));
        debug!("loaded quicken table for {} from {}", image.path, path.display());
        Ok(table)
    }

    /// Persist a built table under the image identity.
    ///
    /// # Errors
    /// Propagates I/O failures; the temp file is cleaned up on error.
    pub fn save(
        &self,
        base_name: &str,
        hash: &ContentHash,
        build_id: &str,
        table: &QuickenTable,
    ) -> Result<(), CacheError> {
        let _guard = self.state.lock().expect("table cache poisoned");
        self.save_locked(base_name, hash, build_id, table)
    }

    fn save_locked(
        &self,
        base_name: &str,
        hash: &ContentHash,
        build_id: &str,
        table: &QuickenTable,
    ) -> Result<(), CacheError> {
        let path = self.file_path(base_name, hash);
        let tmp = path.with_extension("qtbl.tmp");
        let result = write_table_file(&tmp, hash, build_id, table);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
            result?;
        }
        fs::rename(&tmp, &path)?;
        debug!("saved quicken table {} ({} records)", path.display(), table.records().len());
        Ok(())
    }

    /// Resolve a table on the unwind path.
    ///
    /// Memory and disk hits return the table. A miss (or a corrupt file,
    /// which counts as a miss) enqueues a build request for the off-path
    /// drainer and reports the miss.
    ///
    /// # Errors
    /// `TableMissing`/`TableCorrupt` as above; the request is enqueued in
    /// both cases.
    pub fn table_for(&self, image: &Image) -> Result<Arc<QuickenTable>, CacheError> {
        let mut state = self.state.lock().expect("table cache poisoned");
        match self.load_locked(&mut state, image) {
            Ok(table) => Ok(table),
            Err(err) if err.is_missing_or_corrupt() => {
                state.requests.entry(image.content_hash.0).or_insert_with(|| PendingBuild {
                    path: image.path.clone(),
                    base_name: image.base_name.clone(),
                    elf_offset: image.elf_offset,
                    content_hash: image.content_hash,
                });
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Explicitly enqueue a build request for an image.
    pub fn register_request(&self, image: &Image) {
        let mut state = self.state.lock().expect("table cache poisoned");
        state.requests.entry(image.content_hash.0).or_insert_with(|| PendingBuild {
            path: image.path.clone(),
            base_name: image.base_name.clone(),
            elf_offset: image.elf_offset,
            content_hash: image.content_hash,
        });
    }

    /// Drain the pending build requests.
    #[must_use]
    pub fn consume_requests(&self) -> Vec<PendingBuild> {
        let mut state = self.state.lock().expect("table cache poisoned");
        state.requests.drain().map(|(_, pending)| pending).collect()
    }

    /// Number of pending build requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.state.lock().expect("table cache poisoned").requests.len()
    }

    /// Build, persist, and retain the table for `image`, off the hot path.
    ///
    /// Holds the cache mutex for the duration so concurrent callers for the
    /// same image elect one builder; the second caller finds the table
    /// already cached when it acquires the lock.
    ///
    /// # Errors
    /// `BuildFailed` when the image yields no usable metadata; the image is
    /// then marked not unwindable.
    pub fn build_and_save(
        &self,
        image: &Image,
        arch: Arch,
    ) -> Result<(Arc<QuickenTable>, BuildStats), CacheError> {
        let mut state = self.state.lock().expect("table cache poisoned");

        if let Ok(table) = self.load_locked(&mut state, image) {
            state.requests.remove(&image.content_hash.0);
            return Ok((table, BuildStats::default()));
        }

        let data = fs::read(&image.path)?;
        let result = TableBuilder::new(arch).build_from_elf(&data);
        let (table, stats) = match result {
            Ok(built) => built,
            Err(err) => {
                warn!("building table for {} failed: {err}", image.path);
                image.set_unwindable(false);
                state.requests.remove(&image.content_hash.0);
                return Err(err);
            }
        };

        self.save_locked(&image.base_name, &image.content_hash, image.build_id(), &table)?;
        let table = Arc::new(table);
        state.loaded.insert(image.content_hash.0, Arc::clone(&table));
        state.requests.remove(&image.content_hash.0);
        Ok((table, stats))
    }

    /// Handle an external "table is warm" notification.
    ///
    /// Only clears the pending request when the table file actually exists;
    /// a notification for an absent file is a false warm-up and is ignored.
    pub fn notify_warmed_up(&self, base_name: &str, hash: &ContentHash) {
        let mut state = self.state.lock().expect("table cache poisoned");
        if self.file_path(base_name, hash).exists() {
            state.requests.remove(&hash.0);
        } else {
            warn!("false warm-up notification for {base_name} ({})", hash.hex());
        }
    }
}

fn write_table_file(
    path: &Path,
    hash: &ContentHash,
    build_id: &str,
    table: &QuickenTable,
) -> Result<(), CacheError> {
    let mut out = BufWriter::new(File::create(path)?);
    let build_id = &build_id.as_bytes()[..build_id.len().min(255)];

    out.write_all(&MAGIC)?;
    out.write_u16::<LittleEndian>(VERSION)?;
    out.write_u8(table.arch().tag())?;
    out.write_u8(0)?; // flags, reserved
    out.write_u32::<LittleEndian>(table.records().len() as u32)?;
    out.write_u32::<LittleEndian>(table.pool().len() as u32)?;
    out.write_all(&hash.0)?;
    out.write_u8(build_id.len() as u8)?;
    out.write_all(build_id)?;

    for record in table.records() {
        out.write_u32::<LittleEndian>(record.pc_start)?;
        out.write_u32::<LittleEndian>(record.pc_end)?;
        out.write_u32::<LittleEndian>(record.instruction_offset)?;
    }
    out.write_all(table.pool())?;
    out.flush()?;
    Ok(())
}

fn corrupt(path: &Path, reason: impl Into<String>) -> CacheError {
    CacheError::TableCorrupt {
        identity: path.display().to_string(),
        reason: reason.into(),
    }
}

fn read_table_file(path: &Path, expected_hash: &ContentHash) -> Result<QuickenTable, CacheError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(CacheError::TableMissing(path.display().to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    let mut input = BufReader::new(file);
    read_table_from(&mut input, path, expected_hash)
}

fn read_table_from(
    input: &mut impl Read,
    path: &Path,
    expected_hash: &ContentHash,
) -> Result<QuickenTable, CacheError> {
    let fail = |_: io::Error| corrupt(path, "truncated file");

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic).map_err(fail)?;
    if magic != MAGIC {
        return Err(corrupt(path, "bad magic"));
    }
    let version = input.read_u16::<LittleEndian>().map_err(fail)?;
    if version != VERSION {
        return Err(corrupt(path, format!("unsupported version {version}")));
    }
    let arch = Arch::from_tag(input.read_u8().map_err(fail)?)
        .ok_or_else(|| corrupt(path, "unknown architecture tag"))?;
    let _flags = input.read_u8().map_err(fail)?;
    let record_count = input.read_u32::<LittleEndian>().map_err(fail)? as usize;
    let pool_len = input.read_u32::<LittleEndian>().map_err(fail)? as usize;

    let mut stored_hash = [0u8; 32];
    input.read_exact(&mut stored_hash).map_err(fail)?;
    if stored_hash != expected_hash.0 {
        return Err(corrupt(path, "content hash mismatch"));
    }
    let build_id_len = input.read_u8().map_err(fail)? as usize;
    let mut build_id = vec![0u8; build_id_len];
    input.read_exact(&mut build_id).map_err(fail)?;

    let mut records = Vec::with_capacity(record_count.min(1 << 20));
    for _ in 0..record_count {
        records.push(QuickenRecord {
            pc_start: input.read_u32::<LittleEndian>().map_err(fail)?,
            pc_end: input.read_u32::<LittleEndian>().map_err(fail)?,
            instruction_offset: input.read_u32::<LittleEndian>().map_err(fail)?,
        });
    }
    let mut pool = vec![0u8; pool_len];
    input.read_exact(&mut pool).map_err(fail)?;

    QuickenTable::new(arch, records, pool).map_err(|e| corrupt(path, e.to_string()))
}

/// Read only the build id out of a table file header.
fn read_header_build_id(path: &Path) -> Result<String, CacheError> {
    let file = File::open(path)?;
    let mut input = BufReader::new(file);
    let fail = |_: io::Error| corrupt(path, "truncated header");

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic).map_err(fail)?;
    if magic != MAGIC {
        return Err(corrupt(path, "bad magic"));
    }
    // version, arch, flags, record_count, pool_len
    let mut skipped = [0u8; 2 + 1 + 1 + 4 + 4];
    input.read_exact(&mut skipped).map_err(fail)?;
    let mut hash = [0u8; 32];
    input.read_exact(&mut hash).map_err(fail)?;
    let build_id_len = input.read_u8().map_err(fail)? as usize;
    let mut build_id = vec![0u8; build_id_len];
    input.read_exact(&mut build_id).map_err(fail)?;
    String::from_utf8(build_id).map_err(|_| corrupt(path, "build id is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quicken::instruction::{encode_stream, Instruction};
    use crate::quicken::table::append_stream;

    fn sample_table(arch: Arch) -> QuickenTable {
        let stream = encode_stream(&[
            Instruction::Load { dst: arch.ra(), src: arch.sp(), offset: 12 },
            Instruction::Add { reg: arch.sp(), offset: 16 },
        ]);
        let mut pool = Vec::new();
        let offset = append_stream(&mut pool, &stream).unwrap();
        QuickenTable::new(
            arch,
            vec![
                QuickenRecord { pc_start: 0x1000, pc_end: 0x1040, instruction_offset: offset },
                QuickenRecord { pc_start: 0x1040, pc_end: 0x1080, instruction_offset: offset },
            ],
            pool,
        )
        .unwrap()
    }

    fn cache() -> (tempfile::TempDir, TableCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = TableCache::new(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, cache) = cache();
        let table = sample_table(Arch::Arm64);
        let hash = ContentHash::of_identity("/lib/libfoo.so", 1234, 0);

        cache.save("libfoo.so", &hash, "abcdef012345", &table).unwrap();
        assert!(cache.has_hash("libfoo.so", &hash));
        assert!(cache.has_build_id("libfoo.so", "abcdef012345"));
        assert!(!cache.has_build_id("libfoo.so", "ffff"));

        // A fresh cache instance sees only the disk state.
        let reopened = TableCache::new(_dir.path()).unwrap();
        let path = reopened.file_path("libfoo.so", &hash);
        let loaded = read_table_file(&path, &hash).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn test_load_missing_is_table_missing() {
        let (_dir, cache) = cache();
        let hash = ContentHash::of_identity("/lib/nothere.so", 0, 0);
        let path = cache.file_path("nothere.so", &hash);
        let err = read_table_file(&path, &hash).unwrap_err();
        assert!(matches!(err, CacheError::TableMissing(_)));
    }

    #[test]
    fn test_corrupt_magic_is_table_corrupt() {
        let (dir, cache) = cache();
        let hash = ContentHash::of_identity("/lib/libbad.so", 9, 0);
        let path = cache.file_path("libbad.so", &hash);
        fs::write(&path, b"XXXXjunkjunkjunk").unwrap();

        let err = read_table_file(&path, &hash).unwrap_err();
        assert!(matches!(err, CacheError::TableCorrupt { .. }));
        drop(dir);
    }

    #[test]
    fn test_hash_mismatch_is_table_corrupt() {
        let (_dir, cache) = cache();
        let table = sample_table(Arch::Arm);
        let saved_hash = ContentHash::of_identity("/lib/a.so", 1, 0);
        cache.save("a.so", &saved_hash, "id", &table).unwrap();

        let other_hash = ContentHash::of_identity("/lib/a.so", 2, 0);
        let path = cache.file_path("a.so", &saved_hash);
        let err = read_table_file(&path, &other_hash).unwrap_err();
        assert!(matches!(err, CacheError::TableCorrupt { .. }));
    }

    #[test]
    fn test_truncated_file_is_table_corrupt() {
        let (_dir, cache) = cache();
        let table = sample_table(Arch::Arm64);
        let hash = ContentHash::of_identity("/lib/libtrunc.so", 7, 0);
        cache.save("libtrunc.so", &hash, "id", &table).unwrap();

        let path = cache.file_path("libtrunc.so", &hash);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();

        let err = read_table_file(&path, &hash).unwrap_err();
        assert!(matches!(err, CacheError::TableCorrupt { .. }));
    }

    fn test_image(path: &str) -> Arc<Image> {
        use crate::maps::{ImageRegistry, MapEntry, MapPerms, StaticMaps};
        let registry = ImageRegistry::new(Box::new(StaticMaps(vec![MapEntry {
            start: 0x1000,
            end: 0x2000,
            perms: MapPerms { read: true, exec: true },
            offset: 0,
            path: path.to_string(),
        }])));
        registry.refresh().unwrap();
        registry.find(0x1000).unwrap()
    }

    #[test]
    fn test_request_queue_register_and_consume() {
        let (_dir, cache) = cache();
        let image = test_image("/lib/libqueued.so");

        // Unwind-path miss enqueues exactly one request per identity.
        assert!(cache.table_for(&image).is_err());
        assert!(cache.table_for(&image).is_err());
        assert_eq!(cache.pending_requests(), 1);

        let drained = cache.consume_requests();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].path, "/lib/libqueued.so");
        assert_eq!(cache.pending_requests(), 0);
    }

    #[test]
    fn test_false_warm_up_keeps_request() {
        let (_dir, cache) = cache();
        let image = test_image("/lib/libwarm.so");
        let _ = cache.table_for(&image);
        assert_eq!(cache.pending_requests(), 1);

        cache.notify_warmed_up(&image.base_name, &image.content_hash);
        assert_eq!(cache.pending_requests(), 1, "absent file must not clear the request");
    }
}
