//! Loaded-image registry for the traced process.
//!
//! Parses the process map table to determine which executable images are
//! loaded where, so a raw program counter can be attributed to an image and
//! translated into an image-relative address. Images carry the identity used
//! to key the table cache: (path, on-disk size, start offset) hashed into a
//! stable fingerprint, plus the embedded build id when one exists.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use log::{debug, info};
use sha2::{Digest, Sha256};

/// Path suffixes of images that may contain interpreted code. Frames inside
/// such images are resolved through the interpreted-pc side channel rather
/// than the quicken table alone.
const INTERPRETED_SUFFIXES: &[&str] = &[".dex", ".odex", ".oat", ".art", ".vdex"];

/// Access bits of one map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapPerms {
    pub read: bool,
    pub exec: bool,
}

/// One row of the process map table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: MapPerms,
    pub offset: u64,
    pub path: String,
}

/// Source of the process map table.
///
/// The production implementation reads `/proc/self/maps`; tests substitute a
/// scripted provider.
pub trait MapsProvider: Send + Sync {
    /// # Errors
    /// Returns an error when the map table cannot be read at all.
    fn read_maps(&self) -> std::io::Result<Vec<MapEntry>>;
}

/// Reads and parses `/proc/self/maps`.
pub struct ProcMaps;

impl MapsProvider for ProcMaps {
    fn read_maps(&self) -> std::io::Result<Vec<MapEntry>> {
        let text = fs::read_to_string("/proc/self/maps")?;
        Ok(text.lines().filter_map(parse_maps_line).collect())
    }
}

/// Scripted provider returning a fixed map table. Test substitute for
/// [`ProcMaps`].
pub struct StaticMaps(pub Vec<MapEntry>);

impl MapsProvider for StaticMaps {
    fn read_maps(&self) -> std::io::Result<Vec<MapEntry>> {
        Ok(self.0.clone())
    }
}

/// Parse one line of the maps format: "start-end perms offset dev inode path".
fn parse_maps_line(line: &str) -> Option<MapEntry> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next().unwrap_or("").to_string();

    let (start, end) = range.split_once('-')?;
    Some(MapEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms: MapPerms { read: perms.contains('r'), exec: perms.contains('x') },
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

/// Stable fingerprint of an image identity (path, on-disk size, start offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Digest of the identity string, matching the cache file key.
    #[must_use]
    pub fn of_identity(path: &str, file_size: u64, elf_offset: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(file_size.to_le_bytes());
        hasher.update(b":");
        hasher.update(elf_offset.to_le_bytes());
        Self(hasher.finalize().into())
    }

    #[must_use]
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

/// A loaded executable image.
///
/// Created at first observation of the image in the map table, retired when
/// the map table no longer references the range, immutable otherwise (the
/// `unwindable` flag is the one exception: the builder clears it when an
/// image yields no usable unwind metadata).
pub struct Image {
    pub path: String,
    pub base_name: String,
    pub file_size: u64,
    pub elf_offset: u64,
    pub content_hash: ContentHash,
    pub start: u64,
    pub end: u64,
    pub load_bias: u64,
    pub perms: MapPerms,
    pub maybe_interpreted: bool,
    unwindable: AtomicBool,
    build_id: OnceLock<String>,
}

impl Image {
    fn from_entry(entry: &MapEntry) -> Self {
        let file_size = fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
        let base_name =
            entry.path.rsplit('/').next().unwrap_or(entry.path.as_str()).to_string();
        Self {
            content_hash: ContentHash::of_identity(&entry.path, file_size, entry.offset),
            base_name,
            file_size,
            elf_offset: entry.offset,
            start: entry.start,
            end: entry.end,
            load_bias: entry.start.wrapping_sub(entry.offset),
            perms: entry.perms,
            maybe_interpreted: INTERPRETED_SUFFIXES.iter().any(|s| entry.path.ends_with(s)),
            unwindable: AtomicBool::new(true),
            build_id: OnceLock::new(),
            path: entry.path.clone(),
        }
    }

    /// Check if an address falls within this image's mapped range.
    #[must_use]
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc < self.end
    }

    /// Image-relative program counter.
    #[must_use]
    pub fn rel_pc(&self, pc: u64) -> u64 {
        pc.wrapping_sub(self.load_bias)
    }

    /// Embedded build id, or a deterministic path-derived fallback when the
    /// image carries no build-id note. Read lazily on first use.
    pub fn build_id(&self) -> &str {
        self.build_id.get_or_init(|| {
            fs::read(&self.path)
                .ok()
                .as_deref()
                .and_then(extract_build_id)
                .unwrap_or_else(|| fake_build_id(&self.path))
        })
    }

    /// False once the builder has determined the image has no usable
    /// unwinding metadata.
    #[must_use]
    pub fn unwindable(&self) -> bool {
        self.unwindable.load(Ordering::Relaxed)
    }

    pub fn set_unwindable(&self, value: bool) {
        self.unwindable.store(value, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("load_bias", &format_args!("{:#x}", self.load_bias))
            .finish()
    }
}

/// Extract the GNU build id from ELF bytes.
///
/// Walks the `.note.gnu.build-id` section: `{ namesz(4), descsz(4), type(4),
/// "GNU\0" (4-aligned), desc (4-aligned) }` where type 3 is NT_GNU_BUILD_ID.
fn extract_build_id(data: &[u8]) -> Option<String> {
    use object::{Object, ObjectSection};

    let obj = object::File::parse(data).ok()?;
    let section = obj.section_by_name(".note.gnu.build-id")?;
    let note = section.data().ok()?;
    if note.len() < 12 {
        return None;
    }

    let namesz = u32::from_le_bytes(note[0..4].try_into().ok()?) as usize;
    let descsz = u32::from_le_bytes(note[4..8].try_into().ok()?) as usize;
    let note_type = u32::from_le_bytes(note[8..12].try_into().ok()?);
    if note_type != 3 {
        return None;
    }

    let desc_offset = 12 + ((namesz + 3) & !3);
    if note.len() < desc_offset + descsz || descsz == 0 {
        return None;
    }

    let mut out = String::with_capacity(descsz * 2);
    for byte in &note[desc_offset..desc_offset + descsz] {
        out.push_str(&format!("{byte:02x}"));
    }
    Some(out)
}

/// Deterministic build-id substitute for images without a note, derived from
/// the path. Prefixed so it can never collide with a real hex note.
fn fake_build_id(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"path-id:");
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::from("p-");
    for byte in &digest[..20] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Registry of currently loaded executable images.
///
/// Lookups take the read side of the lock and do not block one another;
/// `refresh` takes the write side and serializes against lookups.
pub struct ImageRegistry {
    provider: Box<dyn MapsProvider>,
    images: RwLock<Vec<Arc<Image>>>,
}

impl ImageRegistry {
    #[must_use]
    pub fn new(provider: Box<dyn MapsProvider>) -> Self {
        Self { provider, images: RwLock::new(Vec::new()) }
    }

    /// Map a program counter to its image.
    #[must_use]
    pub fn find(&self, pc: u64) -> Option<Arc<Image>> {
        let images = self.images.read().expect("image registry poisoned");
        let idx = images.partition_point(|img| img.start <= pc);
        let image = images.get(idx.checked_sub(1)?)?;
        image.contains(pc).then(|| Arc::clone(image))
    }

    /// Image-relative pc and load bias for an already-located image.
    #[must_use]
    pub fn resolve(&self, image: &Image, pc: u64) -> (u64, u64) {
        (image.rel_pc(pc), image.load_bias)
    }

    /// True when no refresh has observed any executable image yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.read().expect("image registry poisoned").is_empty()
    }

    /// Snapshot of the current image set, for off-path consumers like the
    /// build-request drainer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Image>> {
        self.images.read().expect("image registry poisoned").clone()
    }

    /// Re-read the process map table and reconcile added/removed images.
    ///
    /// Idempotent: refreshing twice with an unchanged map table leaves the
    /// registry (and the image instances it holds) untouched. Must be called
    /// when external code signals that a new image has been loaded.
    ///
    /// # Errors
    /// Returns an error when the map table cannot be read; the registry keeps
    /// its previous contents in that case.
    pub fn refresh(&self) -> std::io::Result<()> {
        let entries = self.provider.read_maps()?;

        let mut images = self.images.write().expect("image registry poisoned");
        let mut existing: HashMap<(u64, u64, &str), &Arc<Image>> = HashMap::new();
        for image in images.iter() {
            existing.insert((image.start, image.end, image.path.as_str()), image);
        }

        let mut next: Vec<Arc<Image>> = Vec::new();
        for entry in &entries {
            if !entry.perms.exec || entry.path.is_empty() || entry.path.starts_with('[') {
                continue;
            }
            match existing.get(&(entry.start, entry.end, entry.path.as_str())) {
                Some(image) => next.push(Arc::clone(image)),
                None => {
                    debug!(
                        "new image {} at {:#x}-{:#x} offset {:#x}",
                        entry.path, entry.start, entry.end, entry.offset
                    );
                    next.push(Arc::new(Image::from_entry(entry)));
                }
            }
        }
        next.sort_by_key(|img| img.start);

        let reused = next
            .iter()
            .filter(|i| existing.contains_key(&(i.start, i.end, i.path.as_str())))
            .count();
        let added = next.len() - reused;
        let removed = images.len() - reused;
        if added > 0 || removed > 0 {
            info!(
                "image registry refreshed: {} images (+{added} -{removed})",
                next.len()
            );
        }
        drop(existing);
        *images = next;
        Ok(())
    }
}

impl std::fmt::Debug for ImageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let images = self.images.read().expect("image registry poisoned");
        f.debug_struct("ImageRegistry").field("images", &images.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_entry(start: u64, end: u64, offset: u64, path: &str) -> MapEntry {
        MapEntry {
            start,
            end,
            perms: MapPerms { read: true, exec: true },
            offset,
            path: path.to_string(),
        }
    }

    #[test]
    fn test_parse_maps_line() {
        let line = "7f1000000000-7f1000010000 r-xp 00002000 fe:00 12345 /system/lib64/libfoo.so";
        let entry = parse_maps_line(line).unwrap();
        assert_eq!(entry.start, 0x7f10_0000_0000);
        assert_eq!(entry.end, 0x7f10_0001_0000);
        assert_eq!(entry.offset, 0x2000);
        assert!(entry.perms.read && entry.perms.exec);
        assert_eq!(entry.path, "/system/lib64/libfoo.so");
    }

    #[test]
    fn test_parse_maps_line_anonymous() {
        let entry = parse_maps_line("7f2000000000-7f2000001000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(entry.path, "");
        assert!(!entry.perms.exec);
    }

    #[test]
    fn test_find_maps_pc_to_image() {
        let registry = ImageRegistry::new(Box::new(StaticMaps(vec![
            exec_entry(0x1000, 0x2000, 0, "/lib/a.so"),
            exec_entry(0x3000, 0x4000, 0x1000, "/lib/b.so"),
        ])));
        registry.refresh().unwrap();

        assert_eq!(registry.find(0x1800).unwrap().path, "/lib/a.so");
        assert_eq!(registry.find(0x3000).unwrap().path, "/lib/b.so");
        assert!(registry.find(0x2800).is_none());
        assert!(registry.find(0x4000).is_none());
    }

    #[test]
    fn test_resolve_applies_load_bias() {
        let registry = ImageRegistry::new(Box::new(StaticMaps(vec![exec_entry(
            0x5000, 0x6000, 0x1000, "/lib/c.so",
        )])));
        registry.refresh().unwrap();

        let image = registry.find(0x5800).unwrap();
        assert_eq!(image.load_bias, 0x4000);
        assert_eq!(registry.resolve(&image, 0x5800), (0x1800, 0x4000));
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let registry = ImageRegistry::new(Box::new(StaticMaps(vec![exec_entry(
            0x1000, 0x2000, 0, "/lib/a.so",
        )])));
        registry.refresh().unwrap();
        let first = registry.find(0x1000).unwrap();

        registry.refresh().unwrap();
        let second = registry.find(0x1000).unwrap();

        // The same instance survives an unchanged refresh.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_refresh_retires_unmapped_images() {
        struct Shrinking(std::sync::Mutex<Vec<Vec<MapEntry>>>);
        impl MapsProvider for Shrinking {
            fn read_maps(&self) -> std::io::Result<Vec<MapEntry>> {
                let mut stages = self.0.lock().unwrap();
                Ok(if stages.len() > 1 { stages.remove(0) } else { stages[0].clone() })
            }
        }

        let registry = ImageRegistry::new(Box::new(Shrinking(std::sync::Mutex::new(vec![
            vec![
                exec_entry(0x1000, 0x2000, 0, "/lib/a.so"),
                exec_entry(0x3000, 0x4000, 0, "/lib/b.so"),
            ],
            vec![exec_entry(0x1000, 0x2000, 0, "/lib/a.so")],
        ]))));
        registry.refresh().unwrap();
        assert!(registry.find(0x3000).is_some());

        registry.refresh().unwrap();
        assert!(registry.find(0x3000).is_none());
        assert!(registry.find(0x1000).is_some());
    }

    #[test]
    fn test_content_hash_depends_on_identity() {
        let a = ContentHash::of_identity("/lib/a.so", 100, 0);
        let b = ContentHash::of_identity("/lib/a.so", 100, 0x1000);
        let c = ContentHash::of_identity("/lib/a.so", 200, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, ContentHash::of_identity("/lib/a.so", 100, 0));
        assert_eq!(a.hex().len(), 64);
    }

    #[test]
    fn test_interpreted_flag_from_suffix() {
        let entry = exec_entry(0x1000, 0x2000, 0, "/data/app/base.odex");
        assert!(Image::from_entry(&entry).maybe_interpreted);
        let entry = exec_entry(0x1000, 0x2000, 0, "/lib/libc.so");
        assert!(!Image::from_entry(&entry).maybe_interpreted);
    }

    #[test]
    fn test_fake_build_id_is_deterministic() {
        assert_eq!(fake_build_id("/lib/x.so"), fake_build_id("/lib/x.so"));
        assert_ne!(fake_build_id("/lib/x.so"), fake_build_id("/lib/y.so"));
        assert!(fake_build_id("/lib/x.so").starts_with("p-"));
    }
}
