//! Bounded pool of open file handles.
//!
//! Index files and source data files are opened through this pool so that
//! repeated record access does not pay for an `open` each time. The pool is
//! process-wide state with an explicit lifecycle: nothing is pooled until
//! [`initialize`] is called, and [`disable`] returns to unpooled I/O where
//! every acquire opens a fresh handle and every release closes it.
//!
//! Handles are shared: several readers may lease the same handle at once,
//! since [`FileHandle`] serializes positioned reads internally.

use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use fnv::FnvHashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{CollectionError, Result};
use crate::file_handle::FileHandle;

/// Process-wide pool; `None` means pooling is disabled.
static HANDLE_CACHE: LazyLock<PoolSlot> = LazyLock::new(PoolSlot::default);

/// Sizing and eviction settings for the handle pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleCacheConfig {
    /// Eviction never drops the pool below this many resident handles.
    pub min_resident: usize,
    /// Exceeding this many resident handles triggers an immediate trim to `min_resident`.
    pub max_resident: usize,
    /// Unleased handles idle longer than this are evicted by the periodic cleanup.
    pub idle_timeout: Duration,
    /// How often the background cleanup runs.
    pub cleanup_period: Duration,
}

impl Default for HandleCacheConfig {
    fn default() -> Self {
        Self {
            min_resident: 10,
            max_resident: 100,
            idle_timeout: Duration::from_secs(5 * 60),
            cleanup_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct PoolEntry {
    handle: Arc<FileHandle>,
    leases: usize,
    last_used: Instant,
    /// Modification time of the file when it was opened.
    modified: Option<SystemTime>,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct ReaperSignal {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

#[derive(Debug)]
struct Reaper {
    signal: Arc<ReaperSignal>,
    join_handle: Option<JoinHandle<()>>,
}

impl Reaper {
    fn stop(&mut self) {
        *self.signal.shutdown.lock() = true;
        self.signal.wake.notify_all();
        if let Some(join_handle) = self.join_handle.take() {
            // The reaper itself may drop the last pool reference.
            if join_handle.thread().id() == thread::current().id() {
                return;
            }
            if join_handle.join().is_err() {
                log::warn!("handle cache reaper thread panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A bounded pool of open file handles keyed by path.
#[derive(Debug)]
pub struct HandleCache {
    config: HandleCacheConfig,
    entries: Mutex<FnvHashMap<PathBuf, PoolEntry>>,
    disabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    reaper: Mutex<Option<Reaper>>,
}

impl HandleCache {
    /// Creates a pool without a background cleanup thread.
    pub fn new(config: HandleCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(FnvHashMap::default()),
            disabled: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            reaper: Mutex::new(None),
        })
    }

    /// Creates a pool and starts the periodic idle eviction thread.
    pub fn with_reaper(config: HandleCacheConfig) -> Result<Arc<Self>> {
        let cache = Self::new(config);
        let signal = Arc::new(ReaperSignal::default());
        let weak = Arc::downgrade(&cache);
        let thread_signal = signal.clone();
        let period = config.cleanup_period;
        let join_handle = thread::Builder::new()
            .name("handle-cache-reaper".to_string())
            .spawn(move || run_reaper(weak, thread_signal, period))
            .map_err(|error| {
                CollectionError::Internal(format!("failed to spawn handle cache reaper: {error}"))
            })?;
        *cache.reaper.lock() = Some(Reaper {
            signal,
            join_handle: Some(join_handle),
        });
        Ok(cache)
    }

    pub fn config(&self) -> &HandleCacheConfig {
        &self.config
    }

    /// Returns a pooled handle for `path`, opening it with `factory` when needed.
    ///
    /// A resident handle is reused unless the file changed on disk since it
    /// was opened, in which case a fresh handle replaces it.
    pub fn acquire<F>(self: &Arc<Self>, path: &Path, factory: F) -> Result<PooledHandle>
    where
        F: FnOnce(&Path) -> Result<FileHandle>,
    {
        if self.disabled.load(Ordering::Acquire) {
            return Ok(PooledHandle::unpooled(factory(path)?));
        }

        let current_modified = modified_time(path);
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(path) {
                if entry.modified == current_modified {
                    entry.leases += 1;
                    entry.last_used = Instant::now();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledHandle::pooled(entry.handle.clone(), self));
                }
                log::debug!("handle cache: {} changed on disk, reopening", path.display());
                entries.remove(path);
            }
        }

        // Open outside the lock; a racing acquire of the same path may open
        // twice, in which case the first registered handle wins.
        let handle = Arc::new(factory(path)?);
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.lock();
        let entry = entries.entry(path.to_path_buf()).or_insert_with(|| PoolEntry {
            handle: handle.clone(),
            leases: 0,
            last_used: Instant::now(),
            modified: current_modified,
        });
        entry.leases += 1;
        entry.last_used = Instant::now();
        let leased = entry.handle.clone();

        if entries.len() > self.config.max_resident {
            let evicted = trim(&mut entries, self.config.min_resident, |_| true);
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        Ok(PooledHandle::pooled(leased, self))
    }

    fn release_path(&self, path: &Path, handle: &Arc<FileHandle>) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(path) else {
            return;
        };
        if !Arc::ptr_eq(&entry.handle, handle) {
            // The entry was replaced after this lease was taken.
            return;
        }
        entry.leases = entry.leases.saturating_sub(1);
        entry.last_used = Instant::now();
        if entry.leases == 0 && self.disabled.load(Ordering::Acquire) {
            entries.remove(path);
        }
    }

    /// Evicts unleased handles idle past the configured timeout, keeping at
    /// least `min_resident` handles. Returns the number evicted.
    pub fn cleanup(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let now = Instant::now();
        let evicted = {
            let mut entries = self.entries.lock();
            trim(&mut entries, self.config.min_resident, |entry| {
                now.duration_since(entry.last_used) >= idle_timeout
            })
        };
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            log::debug!("handle cache: evicted {evicted} idle handles");
        }
        evicted
    }

    /// Stops pooling: drops unleased handles and closes leased ones on release.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
        if let Some(mut reaper) = self.reaper.lock().take() {
            reaper.stop();
        }
        self.entries.lock().retain(|_, entry| entry.leases > 0);
    }

    /// Drops every unleased handle.
    pub fn clear(&self) {
        self.entries.lock().retain(|_, entry| entry.leases > 0);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn stats(&self) -> HandleCacheStats {
        HandleCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Removes unleased entries matching `evictable`, least recently used first,
/// until at most `floor` entries remain.
fn trim(
    entries: &mut FnvHashMap<PathBuf, PoolEntry>,
    floor: usize,
    evictable: impl Fn(&PoolEntry) -> bool,
) -> usize {
    if entries.len() <= floor {
        return 0;
    }
    let mut candidates: Vec<(Instant, PathBuf)> = entries
        .iter()
        .filter(|(_, entry)| entry.leases == 0 && evictable(entry))
        .map(|(path, entry)| (entry.last_used, path.clone()))
        .collect();
    candidates.sort_by_key(|(last_used, _)| *last_used);

    let mut evicted = 0;
    for (_, path) in candidates {
        if entries.len() <= floor {
            break;
        }
        entries.remove(&path);
        evicted += 1;
    }
    evicted
}

fn run_reaper(cache: Weak<HandleCache>, signal: Arc<ReaperSignal>, period: Duration) {
    loop {
        {
            let mut shutdown = signal.shutdown.lock();
            if *shutdown {
                break;
            }
            signal.wake.wait_for(&mut shutdown, period);
            if *shutdown {
                break;
            }
        }
        match cache.upgrade() {
            Some(cache) => {
                cache.cleanup();
            }
            None => break,
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}

/// A leased file handle; returns to the pool when released or dropped.
#[derive(Debug)]
pub struct PooledHandle {
    handle: Arc<FileHandle>,
    owner: Option<Weak<HandleCache>>,
}

impl PooledHandle {
    fn pooled(handle: Arc<FileHandle>, owner: &Arc<HandleCache>) -> Self {
        Self {
            handle,
            owner: Some(Arc::downgrade(owner)),
        }
    }

    /// Wraps a handle that is closed when the last reference drops.
    pub fn unpooled(handle: FileHandle) -> Self {
        Self {
            handle: Arc::new(handle),
            owner: None,
        }
    }

    /// Returns a shared reference to the underlying handle.
    pub fn shared(&self) -> Arc<FileHandle> {
        self.handle.clone()
    }

    pub fn is_pooled(&self) -> bool {
        self.owner.is_some()
    }

    /// Returns the handle to its pool (or closes it when unpooled).
    pub fn release(self) {}
}

impl Deref for PooledHandle {
    type Target = FileHandle;

    fn deref(&self) -> &FileHandle {
        &self.handle
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(cache) = self.owner.take().and_then(|owner| owner.upgrade()) {
            let path = self.handle.path().to_path_buf();
            cache.release_path(&path, &self.handle);
        }
    }
}

/// Holder of the installed pool, if any.
#[derive(Default)]
struct PoolSlot {
    cache: RwLock<Option<Arc<HandleCache>>>,
}

impl PoolSlot {
    fn install(&self, config: HandleCacheConfig) -> Result<Arc<HandleCache>> {
        if config.min_resident > config.max_resident {
            return Err(CollectionError::InvalidInput(format!(
                "handle cache min_resident {} exceeds max_resident {}",
                config.min_resident, config.max_resident
            )));
        }
        let cache = HandleCache::with_reaper(config)?;
        let previous = self.cache.write().replace(cache.clone());
        if let Some(previous) = previous {
            previous.disable();
        }
        log::debug!(
            "handle cache initialized (min={}, max={}, idle={:?})",
            config.min_resident,
            config.max_resident,
            config.idle_timeout
        );
        Ok(cache)
    }

    fn remove(&self) {
        if let Some(previous) = self.cache.write().take() {
            previous.disable();
            log::debug!("handle cache disabled");
        }
    }

    fn current(&self) -> Option<Arc<HandleCache>> {
        self.cache.read().clone()
    }

    fn acquire<F>(&self, path: &Path, factory: F) -> Result<PooledHandle>
    where
        F: FnOnce(&Path) -> Result<FileHandle>,
    {
        match self.current() {
            Some(cache) => cache.acquire(path, factory),
            None => Ok(PooledHandle::unpooled(factory(path)?)),
        }
    }
}

/// Installs a process-wide pool, replacing (and disabling) any previous one.
pub fn initialize(config: HandleCacheConfig) -> Result<Arc<HandleCache>> {
    HANDLE_CACHE.install(config)
}

/// Removes the process-wide pool; subsequent acquires are unpooled.
pub fn disable() {
    HANDLE_CACHE.remove();
}

/// Returns the process-wide pool, if one is installed.
pub fn global() -> Option<Arc<HandleCache>> {
    HANDLE_CACHE.current()
}

/// Acquires a handle through the process-wide pool, or opens one directly when disabled.
pub fn acquire<F>(path: &Path, factory: F) -> Result<PooledHandle>
where
    F: FnOnce(&Path) -> Result<FileHandle>,
{
    HANDLE_CACHE.acquire(path, factory)
}

/// Acquires a read handle for `path` with the default factory.
pub fn acquire_file(path: &Path) -> Result<PooledHandle> {
    acquire(path, FileHandle::open)
}

/// Releases a handle obtained from [`acquire`].
pub fn release(handle: PooledHandle) {
    handle.release();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;

    use super::*;

    fn write_files(dir: &TempDir, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.path().join(format!("f{i}.grib2"));
                fs::write(&path, format!("data {i}")).expect("write");
                path
            })
            .collect()
    }

    fn config(min: usize, max: usize, idle: Duration) -> HandleCacheConfig {
        HandleCacheConfig {
            min_resident: min,
            max_resident: max,
            idle_timeout: idle,
            cleanup_period: Duration::from_secs(3600),
        }
    }

    #[test]
    fn acquire_reuses_resident_handle() {
        let dir = TempDir::new().expect("tempdir");
        let paths = write_files(&dir, 1);
        let cache = HandleCache::new(HandleCacheConfig::default());
        let opened = AtomicUsize::new(0);
        let factory = |path: &Path| {
            opened.fetch_add(1, Ordering::Relaxed);
            FileHandle::open(path)
        };

        let first = cache.acquire(&paths[0], factory).expect("first");
        let second = cache.acquire(&paths[0], factory).expect("second");
        assert!(Arc::ptr_eq(&first.shared(), &second.shared()));
        assert_eq!(opened.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
        first.release();
        second.release();
        assert!(cache.contains(&paths[0]));
    }

    #[test]
    fn exceeding_max_trims_to_min() {
        let dir = TempDir::new().expect("tempdir");
        let paths = write_files(&dir, 5);
        let cache = HandleCache::new(config(2, 4, Duration::from_secs(3600)));
        for path in &paths[..4] {
            cache.acquire(path, FileHandle::open).expect("acquire").release();
        }
        assert_eq!(cache.len(), 4);

        let held = cache.acquire(&paths[4], FileHandle::open).expect("acquire");
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&paths[4]), "leased handle must survive trimming");
        drop(held);
    }

    #[test]
    fn cleanup_evicts_idle_but_keeps_leased_and_minimum() {
        let dir = TempDir::new().expect("tempdir");
        let paths = write_files(&dir, 3);
        let cache = HandleCache::new(config(1, 10, Duration::ZERO));
        let held = cache.acquire(&paths[0], FileHandle::open).expect("acquire");
        cache.acquire(&paths[1], FileHandle::open).expect("acquire").release();
        cache.acquire(&paths[2], FileHandle::open).expect("acquire").release();

        let evicted = cache.cleanup();
        assert_eq!(evicted, 2);
        assert!(cache.contains(&paths[0]));
        assert_eq!(cache.stats().evictions, 2);
        drop(held);
    }

    #[test]
    fn changed_file_is_reopened() {
        let dir = TempDir::new().expect("tempdir");
        let paths = write_files(&dir, 1);
        let cache = HandleCache::new(HandleCacheConfig::default());
        let before = cache.acquire(&paths[0], FileHandle::open).expect("acquire");

        let replacement = dir.path().join("replacement");
        fs::write(&replacement, "new contents").expect("write");
        let file = fs::File::options().write(true).open(&replacement).expect("open");
        file.set_modified(SystemTime::now() + Duration::from_secs(10)).expect("set mtime");
        fs::rename(&replacement, &paths[0]).expect("rename");

        let after = cache.acquire(&paths[0], FileHandle::open).expect("acquire");
        assert!(!Arc::ptr_eq(&before.shared(), &after.shared()));
        assert_eq!(after.read_at(0, 3).expect("read"), b"new");
    }

    #[test]
    fn disabled_cache_opens_fresh_handles() {
        let dir = TempDir::new().expect("tempdir");
        let paths = write_files(&dir, 1);
        let cache = HandleCache::new(HandleCacheConfig::default());
        let leased = cache.acquire(&paths[0], FileHandle::open).expect("acquire");
        cache.disable();

        let a = cache.acquire(&paths[0], FileHandle::open).expect("acquire");
        let b = cache.acquire(&paths[0], FileHandle::open).expect("acquire");
        assert!(!a.is_pooled());
        assert!(!Arc::ptr_eq(&a.shared(), &b.shared()));

        leased.release();
        assert!(cache.is_empty());
    }

    // Lifecycle tests use their own slot: the process-wide pool is shared
    // with every other test that opens an index.
    #[test]
    fn slot_lifecycle() {
        let dir = TempDir::new().expect("tempdir");
        let paths = write_files(&dir, 1);
        let slot = PoolSlot::default();

        let first = slot.acquire(&paths[0], FileHandle::open).expect("acquire");
        assert!(!first.is_pooled());
        drop(first);

        let cache = slot.install(config(0, 8, Duration::from_secs(60))).expect("install");
        let a = slot.acquire(&paths[0], FileHandle::open).expect("acquire");
        let b = slot.acquire(&paths[0], FileHandle::open).expect("acquire");
        assert!(Arc::ptr_eq(&a.shared(), &b.shared()));
        assert!(Arc::ptr_eq(&slot.current().expect("installed"), &cache));
        release(a);
        release(b);

        let replacement = slot.install(config(0, 4, Duration::from_secs(60))).expect("replace");
        assert!(!Arc::ptr_eq(&cache, &replacement));
        assert!(cache.is_empty());

        slot.remove();
        assert!(slot.current().is_none());
        let c = slot.acquire(&paths[0], FileHandle::open).expect("acquire");
        let d = slot.acquire(&paths[0], FileHandle::open).expect("acquire");
        assert!(!c.is_pooled());
        assert!(!Arc::ptr_eq(&c.shared(), &d.shared()));
    }

    #[test]
    fn initialize_rejects_inverted_bounds() {
        let err = initialize(config(5, 2, Duration::ZERO)).expect_err("invalid");
        assert!(matches!(err, CollectionError::InvalidInput(_)));
        let slot = PoolSlot::default();
        assert!(slot.install(config(5, 2, Duration::ZERO)).is_err());
        assert!(slot.current().is_none());
    }
}
