//! Content-addressed store memoizing operation results between builds.
//!
//! Layout under the cache root:
//!
//! ```text
//! <aa>/<key>/meta.json   entry metadata, <aa> = first two hex chars of the key
//! <aa>/<key>/last_used   LRU timestamp, rewritten on every hit
//! blobs/<hex>            layer blobs, shared across keys by content digest
//! locks/<key>.lock       producer lease for the key
//! stats.json             cumulative hit/miss counters and last prune time
//! ```
//!
//! Writes are staged into a sibling directory and renamed into place, so
//! readers observe either the old state or the complete new state.

use crate::{
    error::{Error, Result},
    Digest,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

const META_FILE: &str = "meta.json";
const LAST_USED_FILE: &str = "last_used";
const STATS_FILE: &str = "stats.json";

/// Descriptor of a layer produced by a cached operation. The blob itself is
/// stored once under `blobs/` by content digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedLayer {
    pub digest: Digest,
    pub diff_id: Digest,
    pub size: i64,
    pub media_type: String,
    pub created: DateTime<Utc>,
    pub created_by: String,
}

/// Everything needed to replay an operation without executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub outputs: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub layers: Vec<CachedLayer>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Stats {
    hits: u64,
    misses: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_prune: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    created: DateTime<Utc>,
}

/// Exclusive right to produce the entry for one cache key. Dropping the lease
/// without [CacheStore::store] abandons it so another producer can take over.
#[derive(Debug)]
pub struct Lease {
    key: Digest,
    lock_path: PathBuf,
    completed: bool,
}

impl Lease {
    pub fn key(&self) -> &Digest {
        &self.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                if e.kind() != ErrorKind::NotFound {
                    log::warn!("failed to release cache lease {}: {}", self.key, e);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheInfo {
    pub total_size: u64,
    pub total_files: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub freed_bytes: u64,
    pub freed_files: u64,
}

/// Thread-safe content-addressed cache. Reservations serialize producers per
/// key; blobs are immutable once written and read without locks.
pub struct CacheStore {
    root: PathBuf,
    stats: Mutex<Stats>,
    lease_timeout: Duration,
    lease_stale: Duration,
}

impl CacheStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("locks"))?;
        let stats = match fs::read(root.join(STATS_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                log::warn!("ignoring corrupted cache stats: {e}");
                Stats::default()
            }),
            Err(_) => Stats::default(),
        };
        Ok(CacheStore {
            root,
            stats: Mutex::new(stats),
            lease_timeout: Duration::from_secs(600),
            lease_stale: Duration::from_secs(300),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Override the lease wait/staleness windows.
    pub fn with_lease_windows(mut self, timeout: Duration, stale: Duration) -> Self {
        self.lease_timeout = timeout;
        self.lease_stale = stale;
        self
    }

    fn entry_dir(&self, key: &Digest) -> PathBuf {
        self.root.join(&key.encoded[..2]).join(&key.encoded)
    }

    fn lock_path(&self, key: &Digest) -> PathBuf {
        self.root.join("locks").join(format!("{}.lock", key.encoded))
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(&digest.encoded)
    }

    /// Fetch a previously stored entry. Corrupted metadata is treated as a
    /// miss so the operation is rebuilt.
    pub fn lookup(&self, key: &Digest) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(key);
        let meta = dir.join(META_FILE);
        let entry = match fs::read(&meta) {
            Ok(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("corrupted cache metadata for {}: {e}; rebuilding", key);
                    // Drop the entry so the rebuild can publish over it.
                    fs::remove_dir_all(&dir)?;
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let mut stats = self.stats.lock().expect("cache stats mutex poisoned");
        if entry.is_some() {
            stats.hits += 1;
            let _ = fs::write(dir.join(LAST_USED_FILE), Utc::now().to_rfc3339());
        } else {
            stats.misses += 1;
        }
        self.flush_stats(&stats)?;
        Ok(entry)
    }

    /// Take the producer lease for `key`, waiting cooperatively while another
    /// builder holds it. A lease older than the staleness window is assumed
    /// dead and stolen.
    pub fn reserve(&self, key: &Digest) -> Result<Lease> {
        let lock_path = self.lock_path(key);
        let deadline = Instant::now() + self.lease_timeout;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        created: Utc::now(),
                    };
                    serde_json::to_writer(file, &info)?;
                    return Ok(Lease {
                        key: key.clone(),
                        lock_path,
                        completed: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.lease_is_stale(&lock_path) {
                        log::warn!("stealing stale cache lease for {}", key);
                        match fs::remove_file(&lock_path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::LeaseTimeout(key.to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lease_is_stale(&self, lock_path: &Path) -> bool {
        let Ok(bytes) = fs::read(lock_path) else {
            return false;
        };
        match serde_json::from_slice::<LockInfo>(&bytes) {
            Ok(info) => {
                let age = Utc::now().signed_duration_since(info.created);
                age.to_std().map(|a| a > self.lease_stale).unwrap_or(false)
            }
            // An unreadable lock may be one the holder has not finished
            // writing yet; judge it by file age instead.
            Err(_) => fs::metadata(lock_path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .map(|age| age > self.lease_stale)
                .unwrap_or(false),
        }
    }

    /// Publish `entry` under the leased key via an atomic staging rename.
    pub fn store(&self, mut lease: Lease, entry: &CacheEntry) -> Result<()> {
        let dir = self.entry_dir(&lease.key);
        fs::create_dir_all(dir.parent().expect("entry dir always has a fanout parent"))?;
        let staging = dir.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&staging)?;
        fs::write(staging.join(META_FILE), serde_json::to_vec_pretty(entry)?)?;
        fs::write(staging.join(LAST_USED_FILE), Utc::now().to_rfc3339())?;
        match fs::rename(&staging, &dir) {
            Ok(()) => {}
            Err(_) if dir.join(META_FILE).exists() => {
                // Another producer published first; their entry wins.
                fs::remove_dir_all(&staging)?;
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e.into());
            }
        }
        lease.completed = true;
        fs::remove_file(&lease.lock_path)?;
        Ok(())
    }

    /// Write a layer blob by content digest; identical blobs are shared
    /// across cache keys.
    pub fn write_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        let staging = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    /// Read a blob back, verifying its content digest.
    pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let bytes = fs::read(self.blob_path(digest))?;
        let computed = Digest::from_buf_sha256(&bytes);
        if &computed != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(bytes)
    }

    pub fn info(&self) -> Result<CacheInfo> {
        let mut total_size = 0;
        let mut total_files = 0;
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry?;
            if entry.file_type().is_file() {
                total_files += 1;
                total_size += entry.metadata()?.len();
            }
        }
        let stats = self.stats.lock().expect("cache stats mutex poisoned");
        let lookups = stats.hits + stats.misses;
        Ok(CacheInfo {
            total_size,
            total_files,
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                stats.hits as f64 / lookups as f64
            },
        })
    }

    /// Evict least-recently-used entries until both the age and byte bounds
    /// hold, then drop blobs no remaining entry references. Entries whose key
    /// is under a live lease are skipped.
    pub fn prune(&self, max_age: Duration, max_bytes: u64) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let mut entries = self.scan_entries()?;
        entries.sort_by_key(|e| e.last_used);

        let now = Utc::now();
        let mut kept: Vec<ScannedEntry> = Vec::new();
        let mut kept_bytes = 0;
        for entry in entries {
            let age = now
                .signed_duration_since(entry.last_used)
                .to_std()
                .unwrap_or_default();
            if age > max_age && !self.key_is_leased(&entry.key) {
                report.freed_bytes += entry.size;
                report.freed_files += entry.files;
                fs::remove_dir_all(&entry.dir)?;
            } else {
                kept_bytes += entry.size;
                kept.push(entry);
            }
        }
        // Oldest first until the byte budget holds
        let mut index = 0;
        while kept_bytes > max_bytes && index < kept.len() {
            let entry = &kept[index];
            index += 1;
            if self.key_is_leased(&entry.key) {
                continue;
            }
            kept_bytes -= entry.size;
            report.freed_bytes += entry.size;
            report.freed_files += entry.files;
            fs::remove_dir_all(&entry.dir)?;
        }

        report = self.sweep_blobs(report)?;

        let mut stats = self.stats.lock().expect("cache stats mutex poisoned");
        stats.last_prune = Some(now);
        self.flush_stats(&stats)?;
        log::info!(
            "cache prune freed {} bytes in {} files",
            report.freed_bytes,
            report.freed_files
        );
        Ok(report)
    }

    fn key_is_leased(&self, key: &Digest) -> bool {
        let lock_path = self.lock_path(key);
        lock_path.exists() && !self.lease_is_stale(&lock_path)
    }

    fn scan_entries(&self) -> Result<Vec<ScannedEntry>> {
        let mut found = Vec::new();
        for fanout in fs::read_dir(&self.root)? {
            let fanout = fanout?;
            let name = fanout.file_name().to_string_lossy().into_owned();
            if !fanout.file_type()?.is_dir() || name.len() != 2 {
                continue;
            }
            for entry in fs::read_dir(fanout.path())? {
                let entry = entry?;
                let dir = entry.path();
                if !dir.join(META_FILE).exists() {
                    continue;
                }
                let key = Digest {
                    algorithm: "sha256".to_string(),
                    encoded: entry.file_name().to_string_lossy().into_owned(),
                };
                let last_used = fs::read_to_string(dir.join(LAST_USED_FILE))
                    .ok()
                    .and_then(|t| DateTime::parse_from_rfc3339(t.trim()).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                let mut size = 0;
                let mut files = 0;
                for file in walkdir::WalkDir::new(&dir) {
                    let file = file?;
                    if file.file_type().is_file() {
                        size += file.metadata()?.len();
                        files += 1;
                    }
                }
                found.push(ScannedEntry {
                    key,
                    dir,
                    last_used,
                    size,
                    files,
                });
            }
        }
        Ok(found)
    }

    fn sweep_blobs(&self, mut report: PruneReport) -> Result<PruneReport> {
        let mut referenced = HashSet::new();
        for entry in self.scan_entries()? {
            if let Ok(bytes) = fs::read(entry.dir.join(META_FILE)) {
                if let Ok(meta) = serde_json::from_slice::<CacheEntry>(&bytes) {
                    referenced.extend(meta.layers.into_iter().map(|l| l.digest.encoded));
                }
            }
        }
        for blob in fs::read_dir(self.root.join("blobs"))? {
            let blob = blob?;
            let name = blob.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) {
                report.freed_bytes += blob.metadata()?.len();
                report.freed_files += 1;
                fs::remove_file(blob.path())?;
            }
        }
        Ok(report)
    }

    fn flush_stats(&self, stats: &Stats) -> Result<()> {
        fs::write(
            self.root.join(STATS_FILE),
            serde_json::to_vec_pretty(stats)?,
        )?;
        Ok(())
    }
}

struct ScannedEntry {
    key: Digest,
    dir: PathBuf,
    last_used: DateTime<Utc>,
    size: u64,
    files: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(key: &Digest) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            outputs: vec!["layer-0".to_string()],
            env: BTreeMap::new(),
            layers: Vec::new(),
            created: Utc::now(),
        }
    }

    #[test]
    fn miss_then_hit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;
        let key = Digest::from_buf_sha256(b"op");

        assert!(store.lookup(&key)?.is_none());

        let lease = store.reserve(&key)?;
        store.store(lease, &sample_entry(&key))?;

        let entry = store.lookup(&key)?.expect("entry stored");
        assert_eq!(entry.outputs, vec!["layer-0"]);

        let info = store.info()?;
        assert_eq!(info.hits, 1);
        assert_eq!(info.misses, 1);
        assert!((info.hit_rate - 0.5).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn abandoned_lease_can_be_retaken() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;
        let key = Digest::from_buf_sha256(b"op");

        let lease = store.reserve(&key)?;
        drop(lease);
        let lease = store.reserve(&key)?;
        store.store(lease, &sample_entry(&key))?;
        Ok(())
    }

    #[test]
    fn stale_lease_is_stolen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?
            .with_lease_windows(Duration::from_millis(500), Duration::from_millis(0));
        let key = Digest::from_buf_sha256(b"op");

        let abandoned = store.reserve(&key)?;
        // Simulate a crashed producer: forget the lease so Drop never runs.
        std::mem::forget(abandoned);

        let lease = store.reserve(&key)?;
        store.store(lease, &sample_entry(&key))?;
        Ok(())
    }

    #[test]
    fn blob_round_trip_verifies_digest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;
        let blob = b"layer-bytes".to_vec();
        let digest = Digest::from_buf_sha256(&blob);

        store.write_blob(&digest, &blob)?;
        assert_eq!(store.read_blob(&digest)?, blob);

        // Corrupt the blob on disk; the read must fail closed.
        fs::write(store.blob_path(&digest), b"tampered")?;
        assert!(matches!(
            store.read_blob(&digest),
            Err(Error::DigestMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn corrupted_metadata_is_a_miss() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;
        let key = Digest::from_buf_sha256(b"op");

        let lease = store.reserve(&key)?;
        store.store(lease, &sample_entry(&key))?;
        fs::write(store.entry_dir(&key).join(META_FILE), b"{ not json")?;

        assert!(store.lookup(&key)?.is_none());
        Ok(())
    }

    #[test]
    fn prune_by_age_and_unreferenced_blobs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CacheStore::open(dir.path())?;
        let key = Digest::from_buf_sha256(b"op");
        let blob = b"blob".to_vec();
        let blob_digest = Digest::from_buf_sha256(&blob);
        store.write_blob(&blob_digest, &blob)?;

        let lease = store.reserve(&key)?;
        store.store(lease, &sample_entry(&key))?;

        // Entry is fresh: an age-only prune keeps it but sweeps the blob no
        // entry references.
        let report = store.prune(Duration::from_secs(3600), u64::MAX)?;
        assert_eq!(report.freed_files, 1);
        assert!(store.lookup(&key)?.is_some());

        // Zero byte budget evicts everything not leased.
        let report = store.prune(Duration::from_secs(3600), 0)?;
        assert!(report.freed_files > 0);
        assert!(store.lookup(&key)?.is_none());
        Ok(())
    }
}
