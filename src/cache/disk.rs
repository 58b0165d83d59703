//! Disk-backed cache store.
//!
//! One file per key under a root directory, named by the SHA-256 of the key.
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a reader sees either the old entry or the new one. Temp names
//! carry a per-store token; `initialize` sweeps only other stores' leftovers,
//! so re-initializing never races this store's own in-progress writes.
//!
//! An in-memory index tracks every file's size and insertion generation.
//! When an insert would push the total over capacity, the oldest entries are
//! evicted until the total plus the incoming entry fits under
//! `capacity * low_watermark`.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::record::{self, DecodedEntry};
use super::{Cache, CacheEntry, CacheError};

/// Default capacity: 5 MiB.
pub const DEFAULT_CAPACITY_BYTES: u64 = 5 * 1024 * 1024;

/// Default fraction of capacity the store prunes down to.
pub const DEFAULT_LOW_WATERMARK: f64 = 0.9;

const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Clone)]
struct IndexRecord {
    file_name: String,
    size: u64,
    generation: u64,
}

#[derive(Debug, Default)]
struct Index {
    records: HashMap<String, IndexRecord>,
    /// generation -> key, oldest first.
    order: BTreeMap<u64, String>,
    total_size: u64,
}

impl Index {
    fn insert(&mut self, key: String, record: IndexRecord) {
        self.total_size += record.size;
        self.order.insert(record.generation, key.clone());
        self.records.insert(key, record);
    }

    fn remove(&mut self, key: &str) -> Option<IndexRecord> {
        let record = self.records.remove(key)?;
        self.order.remove(&record.generation);
        self.total_size = self.total_size.saturating_sub(record.size);
        Some(record)
    }

    fn pop_oldest(&mut self) -> Option<(String, IndexRecord)> {
        let (_, key) = self.order.pop_first()?;
        let record = self.records.remove(&key)?;
        self.total_size = self.total_size.saturating_sub(record.size);
        Some((key, record))
    }
}

/// Cache store that keeps one file per entry under a root directory.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    capacity: u64,
    low_watermark: f64,
    next_generation: AtomicU64,
    temp_token: String,
    index: Mutex<Index>,
}

impl DiskCache {
    /// Creates a store rooted at `root`. Nothing is read until
    /// [`Cache::initialize`] runs.
    ///
    /// `low_watermark` is clamped into `0.0..=1.0`.
    pub fn new(root: impl Into<PathBuf>, capacity_bytes: u64, low_watermark: f64) -> Self {
        Self {
            root: root.into(),
            capacity: capacity_bytes,
            low_watermark: low_watermark.clamp(0.0, 1.0),
            next_generation: AtomicU64::new(0),
            temp_token: format!("{:016x}", rand::random::<u64>()),
            index: Mutex::new(Index::default()),
        }
    }

    /// Creates a store with the default capacity and watermark.
    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEFAULT_CAPACITY_BYTES, DEFAULT_LOW_WATERMARK)
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes currently accounted to stored entries.
    pub async fn total_size(&self) -> u64 {
        self.index.lock().await.total_size
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.index.lock().await.records.len()
    }

    /// True when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// True when an entry for `key` is indexed.
    pub async fn contains(&self, key: &str) -> bool {
        self.index.lock().await.records.contains_key(key)
    }

    fn entry_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    fn temp_path(&self, file_name: &str, generation: u64) -> PathBuf {
        self.root.join(format!(
            "{file_name}.{}-{generation}.{TEMP_EXTENSION}",
            self.temp_token
        ))
    }

    fn is_own_temp(&self, file_name: &str) -> bool {
        file_name.contains(&format!(".{}-", self.temp_token))
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn prune_target(&self) -> u64 {
        (self.capacity as f64 * self.low_watermark) as u64
    }

    /// Evicts oldest entries so that `incoming` bytes fit. Caller holds the lock.
    async fn prune(&self, index: &mut Index, incoming: u64) {
        if index.total_size + incoming <= self.capacity {
            return;
        }
        let target = self.prune_target();
        let before = index.total_size;
        let mut evicted = 0usize;
        while index.total_size + incoming > target {
            let Some((key, record)) = index.pop_oldest() else {
                break;
            };
            remove_file_quietly(&self.entry_path(&record.file_name)).await;
            debug!(key = %key, size = record.size, "evicted cache entry");
            evicted += 1;
        }
        info!(
            evicted,
            before,
            after = index.total_size,
            incoming,
            "pruned disk cache"
        );
    }

    async fn write_temp(&self, temp_path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::io(&self.root, e))?;
        let mut file = tokio::fs::File::create(temp_path)
            .await
            .map_err(|e| CacheError::io(temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| CacheError::io(temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| CacheError::io(temp_path, e))?;
        Ok(())
    }

    /// Drops a corrupt entry, unless a concurrent put already replaced it.
    async fn discard_corrupt(&self, key: &str, generation: u64, error: &CacheError) {
        warn!(key = %key, error = %error, "discarding unreadable cache entry");
        let mut index = self.index.lock().await;
        if index
            .records
            .get(key)
            .is_some_and(|record| record.generation == generation)
            && let Some(record) = index.remove(key)
        {
            remove_file_quietly(&self.entry_path(&record.file_name)).await;
        }
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<DecodedEntry>, CacheError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => record::decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }
}

#[async_trait]
impl Cache for DiskCache {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn initialize(&self) {
        let mut index = self.index.lock().await;
        *index = Index::default();

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Err(error) = tokio::fs::create_dir_all(&self.root).await {
                    warn!(error = %error, "failed to create cache directory");
                }
                return;
            }
            Err(error) => {
                warn!(error = %error, "failed to scan cache directory");
                return;
            }
        };

        let mut max_generation = None;
        let mut dropped = 0usize;
        loop {
            let dir_entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!(error = %error, "cache directory scan interrupted");
                    break;
                }
            };
            let path = dir_entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            match path.extension().and_then(|e| e.to_str()) {
                Some(TEMP_EXTENSION) => {
                    if !self.is_own_temp(&file_name) {
                        remove_file_quietly(&path).await;
                    }
                    continue;
                }
                Some(ENTRY_EXTENSION) => {}
                _ => continue,
            }

            let decoded = match self.read_entry(&path).await {
                Ok(Some(decoded)) => decoded,
                Ok(None) => continue,
                Err(error) => {
                    warn!(file = %file_name, error = %error, "dropping corrupt cache file");
                    remove_file_quietly(&path).await;
                    dropped += 1;
                    continue;
                }
            };
            if file_name_for(&decoded.key) != file_name {
                warn!(file = %file_name, "cache file does not match its key, dropping");
                remove_file_quietly(&path).await;
                dropped += 1;
                continue;
            }

            let size = match dir_entry.metadata().await {
                Ok(meta) => meta.len(),
                Err(error) => {
                    warn!(file = %file_name, error = %error, "cannot stat cache file");
                    continue;
                }
            };
            max_generation = max_generation.max(Some(decoded.generation));
            // Generations are unique per store; a clash means a copied file.
            if let Some(existing) = index.order.get(&decoded.generation).cloned() {
                warn!(file = %file_name, other = %existing, "duplicate generation, dropping");
                remove_file_quietly(&path).await;
                dropped += 1;
                continue;
            }
            index.insert(
                decoded.key,
                IndexRecord {
                    file_name,
                    size,
                    generation: decoded.generation,
                },
            );
        }

        self.next_generation
            .store(max_generation.map_or(0, |g| g + 1), Ordering::SeqCst);
        self.prune(&mut index, 0).await;
        info!(
            entries = index.records.len(),
            total_size = index.total_size,
            dropped,
            "disk cache initialized"
        );
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let record = self.index.lock().await.records.get(key).cloned()?;
        let path = self.entry_path(&record.file_name);

        match self.read_entry(&path).await {
            Ok(Some(decoded)) if decoded.key == key => Some(decoded.entry),
            Ok(Some(decoded)) => {
                let error = CacheError::corrupt(format!("file holds key {}", decoded.key));
                self.discard_corrupt(key, record.generation, &error).await;
                None
            }
            Ok(None) => {
                let error = CacheError::corrupt("entry file missing");
                self.discard_corrupt(key, record.generation, &error).await;
                None
            }
            Err(error) => {
                self.discard_corrupt(key, record.generation, &error).await;
                None
            }
        }
    }

    #[instrument(skip(self, entry), fields(size = entry.data.len()))]
    async fn put(&self, key: &str, entry: CacheEntry) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let bytes = match record::encode(key, &entry, generation) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(error = %error, "failed to encode cache entry");
                return;
            }
        };
        let size = bytes.len() as u64;
        if size > self.capacity {
            debug!(size, capacity = self.capacity, "entry larger than cache, not stored");
            self.remove(key).await;
            return;
        }

        let file_name = file_name_for(key);
        let final_path = self.entry_path(&file_name);
        let temp_path = self.temp_path(&file_name, generation);

        if let Err(error) = self.write_temp(&temp_path, &bytes).await {
            warn!(error = %error, "failed to write cache entry");
            remove_file_quietly(&temp_path).await;
            return;
        }

        let mut index = self.index.lock().await;
        if let Err(error) = tokio::fs::rename(&temp_path, &final_path).await {
            warn!(error = %CacheError::io(&final_path, error), "failed to commit cache entry");
            remove_file_quietly(&temp_path).await;
            return;
        }
        index.remove(key);
        self.prune(&mut index, size).await;
        index.insert(
            key.to_string(),
            IndexRecord {
                file_name,
                size,
                generation,
            },
        );
        debug!(total_size = index.total_size, "cache entry stored");
    }

    async fn invalidate(&self, key: &str, full_expire: bool) {
        if let Some(mut entry) = self.get(key).await {
            entry.soft_ttl = 0;
            if full_expire {
                entry.ttl = 0;
            }
            self.put(key, entry).await;
        }
    }

    async fn remove(&self, key: &str) {
        let mut index = self.index.lock().await;
        if let Some(record) = index.remove(key) {
            remove_file_quietly(&self.entry_path(&record.file_name)).await;
        }
    }

    async fn clear(&self) {
        let mut index = self.index.lock().await;
        for record in index.records.values() {
            remove_file_quietly(&self.entry_path(&record.file_name)).await;
        }
        *index = Index::default();
        info!(root = %self.root.display(), "disk cache cleared");
    }
}

/// File name for `key`: hex SHA-256 plus the entry extension.
fn file_name_for(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{digest:x}.{ENTRY_EXTENSION}")
}

async fn remove_file_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %error, "failed to remove cache file");
    }
}
