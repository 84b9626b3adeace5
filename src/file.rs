//! The root handle over a memory-mapped data file.
//!
//! Ties the region, the epoch manager, the allocator, and the first-page
//! metadata into one object. Opening serialises on the init lock file;
//! while a handle lives it keeps the lock shared, so recovery (`cleanup`)
//! can tell whether any process is still attached.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::epoch::GcLock;
use crate::error::{DbError, Result};
use crate::journal::Journal;
use crate::lockfile::{self, NamedLock};
use crate::map::{Map, TrieKey, TrieValue};
use crate::meta;
use crate::region::{page_size, Permissions, Region};
use crate::snapshot;
use crate::trie::Trie;

/// Paths this process already has mapped; double-mapping one file in one
/// process would break the region's locking assumptions.
static OPEN_FILES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

pub struct MmapFile {
    core: Arc<FileCore>,
}

struct FileCore {
    region: Arc<Region>,
    arena: Arc<Arena>,
    path: Option<PathBuf>,
    registry_key: Option<PathBuf>,
    attach_lock: Option<NamedLock>,
    tries: Mutex<HashMap<usize, Arc<Trie>>>,
}

impl Drop for FileCore {
    fn drop(&mut self) {
        if let Some(lock) = self.attach_lock.as_ref() {
            lock.unlock();
        }
        if let Some(key) = self.registry_key.take() {
            OPEN_FILES.lock().remove(&key);
        }
    }
}

const DEFAULT_INITIAL_PAGES: u64 = 64;

impl MmapFile {
    /// Create a new data file; fails if one already exists.
    pub fn create(path: &Path, perm: Permissions, initial_size: u64) -> Result<MmapFile> {
        Self::open_impl(path, perm, Some(initial_size), true, false)
    }

    /// Open an existing data file.
    pub fn open(path: &Path, perm: Permissions) -> Result<MmapFile> {
        Self::open_impl(path, perm, None, false, true)
    }

    /// Open the file, creating and formatting it when absent.
    pub fn open_or_create(path: &Path, perm: Permissions, initial_size: u64) -> Result<MmapFile> {
        Self::open_impl(path, perm, Some(initial_size), false, false)
    }

    /// A process-private map with no backing file; snapshots are
    /// unavailable.
    pub fn anonymous(initial_size: u64) -> Result<MmapFile> {
        let gc = Arc::new(GcLock::new());
        let region = Region::anonymous(gc, initial_size.max(page_size()))?;
        let arena = Arc::new(Arena::new(region.clone()));
        {
            let pin = region.pin();
            meta::format(&pin);
            arena.format(&pin);
        }
        Ok(MmapFile {
            core: Arc::new(FileCore {
                region,
                arena,
                path: None,
                registry_key: None,
                attach_lock: None,
                tries: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn open_impl(
        path: &Path,
        perm: Permissions,
        initial_size: Option<u64>,
        must_create: bool,
        must_exist: bool,
    ) -> Result<MmapFile> {
        let init_lock = NamedLock::open(lockfile::init_lock_path(path))?;
        init_lock.lock()?;
        let result = Self::open_locked(path, perm, initial_size, must_create, must_exist);
        init_lock.unlock();
        let mut core = result?;

        // Mark the attachment with a shared hold on the same lock file, so
        // cleanup (which wants it exclusive) knows we're here. Taken after
        // the exclusive init hold: the two would deadlock on one process.
        let attach_lock = NamedLock::open(lockfile::init_lock_path(path))?;
        attach_lock.lock_shared()?;
        core.attach_lock = Some(attach_lock);
        debug!("attached to {path:?}");
        Ok(MmapFile {
            core: Arc::new(core),
        })
    }

    fn open_locked(
        path: &Path,
        perm: Permissions,
        initial_size: Option<u64>,
        must_create: bool,
        must_exist: bool,
    ) -> Result<FileCore> {
        let page = page_size();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(perm == Permissions::ReadWrite)
            .create(!must_exist)
            .truncate(false)
            .open(path)
            .map_err(DbError::Open)?;

        let file_len = file.metadata().map_err(DbError::Open)?.len();
        let is_new = file_len == 0;
        if is_new && must_exist {
            return Err(DbError::DataFormat("data file is empty"));
        }
        if !is_new && must_create {
            return Err(DbError::Other("data file already exists"));
        }

        if is_new {
            let logical = round_up(
                initial_size.unwrap_or(DEFAULT_INITIAL_PAGES * page).max(page),
                page,
            );
            // One hidden page beyond the logical length for in-place growth.
            file.set_len(logical + page).map_err(DbError::Open)?;
            file.sync_all().map_err(DbError::Sync)?;
            info!("created data file {path:?} with {logical:#x} bytes");
        }

        let registry_key = std::fs::canonicalize(path).map_err(DbError::Open)?;
        {
            let mut open_files = OPEN_FILES.lock();
            if !open_files.insert(registry_key.clone()) {
                return Err(DbError::Other("data file is already mapped in this process"));
            }
        }

        let attached = (|| {
            let gc = Arc::new(GcLock::new());
            let region = Region::from_file(gc, file, path, perm)?;
            let arena = Arc::new(Arena::new(region.clone()));
            {
                let pin = region.pin();
                if is_new {
                    meta::format(&pin);
                    arena.format(&pin);
                } else {
                    meta::validate(&pin)?;
                    arena.validate(&pin)?;
                }
            }
            Ok::<_, DbError>(FileCore {
                region,
                arena,
                path: Some(path.to_owned()),
                registry_key: Some(registry_key.clone()),
                attach_lock: None,
                tries: Mutex::new(HashMap::new()),
            })
        })();

        if attached.is_err() {
            OPEN_FILES.lock().remove(&registry_key);
        }
        attached
    }

    pub fn path(&self) -> Option<&Path> {
        self.core.path.as_deref()
    }

    /// The size of the datastore in bytes.
    pub fn file_size(&self) -> u64 {
        self.core.region.length()
    }

    /// Bytes currently allocated inside the region, metadata aside.
    pub fn bytes_outstanding(&self) -> u64 {
        let pin = self.core.region.pin();
        self.core.arena.bytes_outstanding(&pin)
    }

    /// Block until all deferred reclamation queued so far has run.
    pub fn defer_barrier(&self) {
        self.core.region.gc().defer_barrier();
    }

    /// Push a consistent image of the region to the backing file.
    /// Returns the number of bytes written.
    pub fn snapshot(&self) -> Result<u64> {
        snapshot::snapshot(&self.core.region)
    }

    /// Claim a metadata slot for a new map. The slot must be free.
    pub fn allocate_map(&self, slot: usize, name: &str) -> Result<()> {
        let pin = self.core.region.pin();
        meta::allocate_slot(&pin, slot, name);
        Ok(())
    }

    /// Release a metadata slot. The map must have been cleared first.
    pub fn deallocate_map(&self, slot: usize) -> Result<()> {
        self.core.tries.lock().remove(&slot);
        let pin = self.core.region.pin();
        meta::deallocate_slot(&pin, slot);
        Ok(())
    }

    pub fn is_map_allocated(&self, slot: usize) -> bool {
        let pin = self.core.region.pin();
        meta::is_allocated(&pin, slot)
    }

    fn trie_for(&self, slot: usize) -> Arc<Trie> {
        let mut tries = self.core.tries.lock();
        tries
            .entry(slot)
            .or_insert_with(|| {
                Arc::new(Trie::new(
                    self.core.region.clone(),
                    self.core.arena.clone(),
                    slot,
                    self.core.path.clone(),
                ))
            })
            .clone()
    }

    /// A typed view over the map at `slot`.
    pub fn map<K, V>(&self, slot: usize) -> Map<K, V>
    where
        K: TrieKey + 'static,
        V: TrieValue + 'static,
    {
        {
            let pin = self.core.region.pin();
            assert!(
                meta::is_allocated(&pin, slot),
                "metadata slot {slot} holds no map"
            );
        }
        Map::over(self.trie_for(slot))
    }

    /// Drain deferred work and detach.
    pub fn close(self) {
        self.core.region.gc().defer_barrier();
    }

    /// Permanently delete the file and every auxiliary artefact.
    pub fn unlink(self) -> Result<()> {
        let path = self.core.path.clone();
        drop(self);
        if let Some(path) = path {
            std::fs::remove_file(&path).map_err(DbError::Io)?;
            let _ = std::fs::remove_file(lockfile::journal_path(&path));
            lockfile::remove_artefacts(&path, meta::NUM_SLOTS);
        }
        Ok(())
    }
}

fn round_up(len: u64, page: u64) -> u64 {
    (len + page - 1) & !(page - 1)
}

/// Apply or undo the journal and remove auxiliary files after a crash.
/// Refuses to run while any process is attached.
pub fn cleanup(path: &Path) -> Result<u64> {
    let init = NamedLock::open(lockfile::init_lock_path(path))?;
    if !init.try_lock()? {
        return Err(DbError::Other("mmap file is in use"));
    }

    let journal_path = lockfile::journal_path(path);
    let restored = match std::fs::OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Journal::undo(&file, &journal_path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let _ = std::fs::remove_file(&journal_path);
            0
        }
        Err(e) => return Err(DbError::Open(e)),
    };

    init.unlock();
    lockfile::remove_artefacts(path, meta::NUM_SLOTS);
    if restored > 0 {
        info!("cleanup restored {restored} bytes from the journal");
    }
    Ok(restored)
}
