//! One-chunk-per-file store.
//!
//! Each chunk lives in its own file at the path [`Layout`] derives from its
//! identifier. The file holds the encoded [`Index`] followed by the encoded
//! chunk, so index-only lookups never touch the chunk body. Writes go to a
//! `<file>.tmp` sibling first and are renamed into place.
//!
//! Files that fail to parse are moved under `.quarantine/` and treated as
//! absent; nothing that was quarantined is ever deleted.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use shard_types::{Address, Chunk, ChunkId, Decoder, Encoder, Index, Registry, SharedChunk, TypeTag};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::layout::{Layout, QUARANTINE_DIR, TEMP_SUFFIX};
use crate::lock::LockPool;
use crate::traits::ChunkStore;

/// Default upper bound on the encoded size of one chunk file (1 MiB).
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Shard spans wider than this are enumerated by listing the root instead
/// of probing every prefix.
const PROBE_LIMIT: u64 = 4096;

/// Outcome of parsing a chunk file.
enum Parsed<T> {
    Found(T),
    Missing,
}

/// Sharded on-disk chunk store.
pub struct FileStore {
    root: PathBuf,
    layout: Layout,
    registry: Arc<Registry>,
    max_chunk_size: usize,
    locks: LockPool<PathBuf>,
}

impl FileStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, layout: Layout, registry: Arc<Registry>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(
            root = %root.display(),
            encoding = %layout.encoding(),
            directory_bits = layout.directory_bits(),
            "opened file store"
        );
        Ok(Self {
            root,
            layout,
            registry,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            locks: LockPool::new(),
        })
    }

    /// Open the store a validated [`StorageConfig`] describes.
    pub fn from_config(config: &StorageConfig, registry: Arc<Registry>) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self::open(&config.root, config.layout()?, registry)?.with_max_chunk_size(config.max_chunk_size))
    }

    /// Set the size limit for encoded chunk files.
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Fail with [`StoreError::ChunkTooLarge`] if `chunk` would not fit in
    /// one chunk file. Layers that hold writes back call this before
    /// accepting a chunk.
    pub fn check_size(&self, chunk: &SharedChunk) -> StoreResult<()> {
        self.encode_file(&chunk.index(), chunk).map(|_| ())
    }

    /// Absolute path of the file that holds (or would hold) `id`.
    pub fn path_of(&self, id: &ChunkId) -> PathBuf {
        self.root.join(self.layout.relative_path(id))
    }

    /// Relative paths of every quarantined file, sorted.
    pub fn scan_quarantine(&self) -> StoreResult<Vec<PathBuf>> {
        let base = self.root.join(QUARANTINE_DIR);
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in WalkDir::new(&base).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e)))?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&base) {
                    found.push(rel.to_path_buf());
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Number of chunk files in each shard directory, keyed by shard name.
    pub fn shard_stats(&self) -> StoreResult<BTreeMap<String, usize>> {
        let mut stats = BTreeMap::new();
        for shard in self.list_shards()? {
            let name = self.layout.shard_name(shard);
            let count = self.list_files(shard)?.len();
            stats.insert(name, count);
        }
        Ok(stats)
    }

    fn check_registered(&self, tag: TypeTag) -> StoreResult<()> {
        if self.registry.contains(tag) {
            Ok(())
        } else {
            Err(StoreError::UnknownTag(tag))
        }
    }

    /// Parse the leading index of `rel`, quarantining the file if it is
    /// malformed or belongs to another identifier.
    ///
    /// Callers check that `id`'s own tag is registered, so any decode
    /// failure here means the file itself is bad.
    fn load_index(&self, rel: &Path, id: &ChunkId) -> StoreResult<Parsed<Index>> {
        let Some(bytes) = self.read_file(rel)? else {
            return Ok(Parsed::Missing);
        };
        let mut dec = Decoder::new(&bytes, self.max_chunk_size as u64);
        match Index::decode(&mut dec, &self.registry) {
            Ok(index) if index.id() == id => Ok(Parsed::Found(index)),
            Ok(index) => self.quarantine_missing(rel, &format!("file holds {}", index.id())),
            Err(e) => self.quarantine_missing(rel, &e.to_string()),
        }
    }

    /// Parse index and chunk of `rel`.
    fn load_chunk(&self, rel: &Path, id: &ChunkId) -> StoreResult<Parsed<SharedChunk>> {
        let Some(bytes) = self.read_file(rel)? else {
            return Ok(Parsed::Missing);
        };
        let mut dec = Decoder::new(&bytes, self.max_chunk_size as u64);
        let index = match Index::decode(&mut dec, &self.registry) {
            Ok(index) if index.id() == id => index,
            Ok(index) => return self.quarantine_missing(rel, &format!("file holds {}", index.id())),
            Err(e) => return self.quarantine_missing(rel, &e.to_string()),
        };
        let parsed = self
            .registry
            .parse_chunk(&mut dec, id.tag())
            .and_then(|chunk| dec.expect_end().map(|_| chunk));
        let chunk = match parsed {
            Ok(chunk) if chunk.id() == *id => chunk,
            Ok(chunk) => return self.quarantine_missing(rel, &format!("chunk body holds {}", chunk.id())),
            Err(e) => return self.quarantine_missing(rel, &e.to_string()),
        };
        let computed = chunk.content_hash();
        if computed != index.hash() {
            warn!(
                id = %id,
                stored = %index.hash(),
                computed = %computed,
                "content hash mismatch"
            );
        }
        Ok(Parsed::Found(chunk))
    }

    fn read_file(&self, rel: &Path) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(self.root.join(rel)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn quarantine_missing<T>(&self, rel: &Path, reason: &str) -> StoreResult<Parsed<T>> {
        self.quarantine(rel, reason)?;
        Ok(Parsed::Missing)
    }

    /// Move `rel` under the quarantine directory, never overwriting an
    /// earlier quarantined file of the same name.
    fn quarantine(&self, rel: &Path, reason: &str) -> StoreResult<PathBuf> {
        let base = self.root.join(QUARANTINE_DIR).join(rel);
        if let Some(parent) = base.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut target = base.clone();
        let mut n = 0u32;
        while target.exists() {
            n += 1;
            let mut name = base.as_os_str().to_owned();
            name.push(format!(".{n}"));
            target = PathBuf::from(name);
        }
        fs::rename(self.root.join(rel), &target)?;
        warn!(
            path = %rel.display(),
            quarantined = %target.display(),
            reason,
            "quarantined unreadable chunk file"
        );
        Ok(target)
    }

    fn encode_file(&self, index: &Index, chunk: &SharedChunk) -> StoreResult<Encoder> {
        let mut enc = Encoder::new();
        index.encode(&mut enc)?;
        chunk.encode(&mut enc)?;
        if enc.len() > self.max_chunk_size {
            return Err(StoreError::ChunkTooLarge {
                size: enc.len(),
                max: self.max_chunk_size,
            });
        }
        Ok(enc)
    }

    fn store_file(&self, rel: &Path, index: &Index, chunk: &SharedChunk) -> StoreResult<()> {
        let enc = self.encode_file(index, chunk)?;

        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp_name);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(enc.as_bytes())?;
            file.flush()?;
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(id = %index.id(), path = %rel.display(), bytes = enc.len(), "stored chunk");
        Ok(())
    }

    /// Shard prefixes present on disk, ascending.
    fn list_shards(&self) -> StoreResult<Vec<u64>> {
        let mut shards = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(prefix) = entry.file_name().to_str().and_then(|n| self.layout.parse_shard_name(n)) {
                shards.push(prefix);
            }
        }
        shards.sort_unstable();
        Ok(shards)
    }

    /// (address, tag) of every chunk file in one shard directory.
    fn list_files(&self, shard: u64) -> StoreResult<Vec<(Address, TypeTag)>> {
        let shard_name = self.layout.shard_name(shard);
        let entries = match fs::read_dir(self.root.join(&shard_name)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            match name.to_str().and_then(|n| self.layout.parse_names(&shard_name, n)) {
                Some(key) => files.push(key),
                None => debug!(shard = %shard_name, file = ?name, "ignoring foreign file"),
            }
        }
        Ok(files)
    }

    fn shards_between(&self, min: &Address, max: &Address) -> StoreResult<Vec<u64>> {
        let first = self.layout.shard_prefix(min);
        let last = self.layout.shard_prefix(max);
        if last - first < PROBE_LIMIT {
            Ok((first..=last).collect())
        } else {
            Ok(self
                .list_shards()?
                .into_iter()
                .filter(|p| (first..=last).contains(p))
                .collect())
        }
    }

    fn lookup_id(&self, address: Address, tag: TypeTag) -> ChunkId {
        ChunkId::new(LookupId { address, tag })
    }
}

/// Placeholder identifier used to lock and look up a file found during
/// enumeration before its real identifier has been parsed.
#[derive(Debug)]
struct LookupId {
    address: Address,
    tag: TypeTag,
}

impl shard_types::Identifier for LookupId {
    fn tag(&self) -> TypeTag {
        self.tag
    }

    fn address(&self) -> Address {
        self.address
    }

    fn encode(&self, enc: &mut Encoder) -> shard_types::TypeResult<()> {
        enc.write(&self.address)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl ChunkStore for FileStore {
    fn lock(&self, id: &ChunkId) -> StoreResult<()> {
        self.locks.lock(&self.layout.relative_path(id))
    }

    fn try_lock(&self, id: &ChunkId) -> StoreResult<bool> {
        self.locks.try_lock(&self.layout.relative_path(id))
    }

    fn try_lock_for(&self, id: &ChunkId, timeout: Duration) -> StoreResult<bool> {
        self.locks.try_lock_for(&self.layout.relative_path(id), timeout)
    }

    fn unlock(&self, id: &ChunkId) -> StoreResult<()> {
        self.locks.unlock(&self.layout.relative_path(id))
    }

    fn contains(&self, id: &ChunkId) -> StoreResult<bool> {
        let rel = self.layout.relative_path(id);
        let _guard = self.locks.guard(rel.clone())?;
        match fs::metadata(self.root.join(&rel)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>> {
        self.check_registered(id.tag())?;
        let rel = self.layout.relative_path(id);
        let _guard = self.locks.guard(rel.clone())?;
        match self.load_index(&rel, id)? {
            Parsed::Found(index) => Ok(Some(index)),
            Parsed::Missing => Ok(None),
        }
    }

    fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>> {
        let mut out = BTreeMap::new();
        if min > max {
            return Ok(out);
        }
        for shard in self.shards_between(min, max)? {
            for (address, tag) in self.list_files(shard)? {
                if address < *min || address > *max {
                    continue;
                }
                if !self.registry.contains(tag) {
                    warn!(address = %address, tag = %tag, "skipping chunk file with unregistered tag");
                    continue;
                }
                let lookup = self.lookup_id(address, tag);
                let rel = self.layout.relative_path(&lookup);
                let _guard = self.locks.guard(rel.clone())?;
                match self.load_index(&rel, &lookup) {
                    Ok(Parsed::Found(index)) => {
                        out.insert(index.id().clone(), index);
                    }
                    Ok(Parsed::Missing) => {}
                    Err(e) => warn!(path = %rel.display(), error = %e, "skipping unreadable chunk file"),
                }
            }
        }
        Ok(out)
    }

    fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
        self.check_registered(id.tag())?;
        let rel = self.layout.relative_path(id);
        let _guard = self.locks.guard(rel.clone())?;
        match self.load_chunk(&rel, id)? {
            Parsed::Found(chunk) => Ok(Some(chunk)),
            Parsed::Missing => Ok(None),
        }
    }

    fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
        let id = chunk.id();
        self.check_registered(id.tag())?;
        let rel = self.layout.relative_path(&id);
        let _guard = self.locks.guard(rel.clone())?;
        let index = chunk.index();
        if let Parsed::Found(existing) = self.load_index(&rel, &id)? {
            if existing == index {
                return Ok(false);
            }
        }
        self.store_file(&rel, &index, chunk)?;
        Ok(true)
    }

    fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
        let id = chunk.id();
        self.check_registered(id.tag())?;
        let rel = self.layout.relative_path(&id);
        let _guard = self.locks.guard(rel.clone())?;
        self.store_file(&rel, &chunk.index(), chunk)
    }

    fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
        let rel = self.layout.relative_path(id);
        let _guard = self.locks.guard(rel.clone())?;
        match fs::remove_file(self.root.join(&rel)) {
            Ok(()) => {
                debug!(id = %id, "deleted chunk");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> StoreResult<()> {
        self.locks.interrupt();
        info!(root = %self.root.display(), "closed file store");
        Ok(())
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("root", &self.root)
            .field("layout", &self.layout)
            .field("max_chunk_size", &self.max_chunk_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{Blob, Named, NameId, BLOB_TAG, NAMED_TAG};
    use crate::layout::NameEncoding;
    use crate::testkit::{named, registry};
    use shard_types::Timestamp;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> FileStore {
        FileStore::open(dir.path(), Layout::default(), registry()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Read / write
    // -----------------------------------------------------------------------

    #[test]
    fn write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = named("alpha", b"one");

        assert!(store.write(&chunk).unwrap());
        let read = store.read(&chunk.id()).unwrap().unwrap();
        assert_eq!(read.index(), chunk.index());
        let named = read.downcast_ref::<Named>().unwrap();
        assert_eq!(named.payload(), b"one");
        assert_eq!(named.name(), "alpha");
        assert!(store.contains(&chunk.id()).unwrap());
        assert_eq!(store.get_index(&chunk.id()).unwrap(), Some(chunk.index()));
    }

    #[test]
    fn idempotent_write() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let id = NameId::new(NAMED_TAG, "beta");
        let first = Named::with_timestamp(id.clone(), b"v1".to_vec(), Timestamp::from_millis(1)).shared();
        let same = Named::with_timestamp(id.clone(), b"v1".to_vec(), Timestamp::from_millis(1)).shared();
        let changed = Named::with_timestamp(id, b"v2".to_vec(), Timestamp::from_millis(2)).shared();

        assert!(store.write(&first).unwrap());
        assert!(!store.write(&same).unwrap());
        assert!(store.write(&changed).unwrap());
    }

    #[test]
    fn missing_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let id = NameId::new(NAMED_TAG, "ghost").chunk_id();
        assert!(!store.contains(&id).unwrap());
        assert!(store.get_index(&id).unwrap().is_none());
        assert!(store.read(&id).unwrap().is_none());
        assert!(!store.delete(&id).unwrap());
    }

    #[test]
    fn delete_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = named("gamma", b"x");
        store.write(&chunk).unwrap();
        assert!(store.path_of(&chunk.id()).is_file());
        assert!(store.delete(&chunk.id()).unwrap());
        assert!(!store.path_of(&chunk.id()).exists());
        assert!(!store.delete(&chunk.id()).unwrap());
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).with_max_chunk_size(256);
        let chunk = Blob::new(BLOB_TAG, vec![0u8; 1024]).shared();
        let err = store.write(&chunk).unwrap_err();
        assert!(matches!(err, StoreError::ChunkTooLarge { max: 256, .. }));
        assert!(!store.path_of(&chunk.id()).exists());
        assert!(matches!(store.check_size(&chunk), Err(StoreError::ChunkTooLarge { max: 256, .. })));
        assert!(store.check_size(&named("small", b"x")).is_ok());
    }

    #[test]
    fn unregistered_tag_is_misuse() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = Named::new(TypeTag(99), "stray", vec![]).shared();
        assert!(matches!(store.write(&chunk), Err(StoreError::UnknownTag(TypeTag(99)))));
    }

    #[test]
    fn placement_follows_layout() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(NameEncoding::Base64Url, 12).unwrap();
        let store = FileStore::open(dir.path(), layout, registry()).unwrap();
        let chunk = named("placed", b"p");
        store.write(&chunk).unwrap();

        let (shard, file) = layout.names(&chunk.id().address(), NAMED_TAG);
        assert!(dir.path().join(shard).join(file).is_file());
        let stats = store.shard_stats().unwrap();
        assert_eq!(stats.values().sum::<usize>(), 1);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        for i in 0..10 {
            store.write(&named(&format!("n{i}"), b"data")).unwrap();
        }
        let leftovers = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    // -----------------------------------------------------------------------
    // Range enumeration
    // -----------------------------------------------------------------------

    #[test]
    fn get_indices_returns_exactly_the_range() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunks: Vec<_> = (0..40).map(|i| named(&format!("item-{i}"), b"v")).collect();
        for c in &chunks {
            store.write(c).unwrap();
        }
        let mut addresses: Vec<_> = chunks.iter().map(|c| c.id().address()).collect();
        addresses.sort();
        let (min, max) = (addresses[10], addresses[29]);

        let found = store.get_indices(&min, &max).unwrap();
        assert_eq!(found.len(), 20);
        assert!(found.keys().all(|id| id.address() >= min && id.address() <= max));
        let all = store.get_indices(&Address::MIN, &Address::MAX).unwrap();
        assert_eq!(all.len(), 40);
    }

    #[test]
    fn single_point_range() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = named("point", b"p");
        store.write(&chunk).unwrap();
        store.write(&named("other", b"o")).unwrap();
        let a = chunk.id().address();
        let found = store.get_indices(&a, &a).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get(&chunk.id()), Some(&chunk.index()));
    }

    #[test]
    fn inverted_range_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.write(&named("x", b"x")).unwrap();
        assert!(store.get_indices(&Address::MAX, &Address::MIN).unwrap().is_empty());
    }

    #[test]
    fn enumeration_skips_unregistered_tags_without_quarantine() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = named("kept", b"k");
        store.write(&chunk).unwrap();

        // A file for tag 77, which this registry does not know.
        let (shard, file) = store.layout().names(&Address::from_u128(5), TypeTag(77));
        fs::create_dir_all(dir.path().join(&shard)).unwrap();
        fs::write(dir.path().join(&shard).join(&file), b"whatever").unwrap();

        let all = store.get_indices(&Address::MIN, &Address::MAX).unwrap();
        assert_eq!(all.len(), 1);
        assert!(dir.path().join(&shard).join(&file).exists());
        assert!(store.scan_quarantine().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Quarantine
    // -----------------------------------------------------------------------

    #[test]
    fn corrupt_file_is_quarantined_on_read() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = named("broken", b"payload");
        store.write(&chunk).unwrap();
        let path = store.path_of(&chunk.id());
        fs::write(&path, b"\x02garbage").unwrap();

        assert!(store.read(&chunk.id()).unwrap().is_none());
        assert!(!path.exists());
        let quarantined = store.scan_quarantine().unwrap();
        assert_eq!(quarantined, vec![store.layout().relative_path(&chunk.id())]);

        // A fresh write proceeds normally.
        assert!(store.write(&chunk).unwrap());
        assert!(store.read(&chunk.id()).unwrap().is_some());
    }

    #[test]
    fn quarantine_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = named("twice", b"t");
        for _ in 0..2 {
            fs::create_dir_all(store.path_of(&chunk.id()).parent().unwrap()).unwrap();
            fs::write(store.path_of(&chunk.id()), b"").unwrap();
            assert!(store.get_index(&chunk.id()).unwrap().is_none());
        }
        assert_eq!(store.scan_quarantine().unwrap().len(), 2);
    }

    #[test]
    fn corruption_during_enumeration_is_contained() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let good: Vec<_> = (0..5).map(|i| named(&format!("good-{i}"), b"g")).collect();
        for c in &good {
            store.write(c).unwrap();
        }
        let bad = named("bad", b"b");
        store.write(&bad).unwrap();
        fs::write(store.path_of(&bad.id()), [0xffu8; 3]).unwrap();

        let all = store.get_indices(&Address::MIN, &Address::MAX).unwrap();
        assert_eq!(all.len(), 5);
        assert!(!all.contains_key(&bad.id()));
        assert_eq!(store.scan_quarantine().unwrap().len(), 1);
        for c in &good {
            assert!(store.read(&c.id()).unwrap().is_some());
        }
    }

    #[test]
    fn misplaced_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let a = named("a", b"a");
        let b = named("b", b"b");
        store.write(&a).unwrap();
        fs::create_dir_all(store.path_of(&b.id()).parent().unwrap()).unwrap();
        fs::copy(store.path_of(&a.id()), store.path_of(&b.id())).unwrap();

        assert!(store.read(&b.id()).unwrap().is_none());
        assert_eq!(store.scan_quarantine().unwrap().len(), 1);
        assert!(store.read(&a.id()).unwrap().is_some());
    }

    #[test]
    fn hash_mismatch_still_returns_chunk() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = named("drift", b"body");
        let bogus = Index::new(chunk.id(), chunk.updated_at(), shard_types::Digest::from_hash([9; 20]));
        store.store_file(&store.layout().relative_path(&chunk.id()), &bogus, &chunk).unwrap();

        let read = store.read(&chunk.id()).unwrap().unwrap();
        assert_eq!(read.downcast_ref::<Named>().unwrap().payload(), b"body");
        assert_eq!(store.get_index(&chunk.id()).unwrap(), Some(bogus));
        assert!(store.scan_quarantine().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    #[test]
    fn operations_reenter_a_held_lock() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let chunk = named("held", b"h");
        store.lock(&chunk.id()).unwrap();
        assert!(store.write(&chunk).unwrap());
        assert!(store.read(&chunk.id()).unwrap().is_some());
        store.unlock(&chunk.id()).unwrap();
        assert!(store.locks.is_empty());
    }

    #[test]
    fn close_interrupts_waiters() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));
        let id = NameId::new(NAMED_TAG, "contended").chunk_id();
        store.lock(&id).unwrap();
        let other = Arc::clone(&store);
        let waiter_id = id.clone();
        let handle = std::thread::spawn(move || other.lock(&waiter_id));
        std::thread::sleep(Duration::from_millis(50));
        store.close().unwrap();
        assert!(matches!(handle.join().unwrap(), Err(StoreError::Interrupted)));
        store.unlock(&id).unwrap();
    }
}
