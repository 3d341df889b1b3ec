//! On-disk synthesis cache
//!
//! Maps a content fingerprint (text + voice parameters) to a WAV file in the
//! cache directory. The index lives in memory and is rebuilt from the
//! directory on open; a file's mtime doubles as its last-access time so the
//! eviction order survives restarts.
//!
//! The byte budget is enforced by [`AudioCache::sweep`], which runs at
//! startup and on an interval, never on the write path. Between sweeps the
//! cache may sit above budget.

use crate::config::CacheConfig;
use crate::{Result, VcReadError};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CACHE_EXT: &str = "wav";
/// In-progress writes; anything left over on open is from a crash
const PARTIAL_EXT: &str = "part";

/// Content-derived cache key.
///
/// Text is trimmed and rate/pitch are rendered with three decimals, so
/// `1.0` and `1.0000001` share a key. Fields are length-delimited before
/// hashing so shifting characters between fields changes the key.
pub fn fingerprint(text: &str, voice_id: u32, rate: f32, pitch: f32) -> String {
    let voice = voice_id.to_string();
    // `+ 0.0` folds negative zero into zero
    let rate = format!("{:.3}", rate + 0.0);
    let pitch = format!("{:.3}", pitch + 0.0);

    let mut hasher = Sha256::new();
    for field in [text.trim(), voice.as_str(), rate.as_str(), pitch.as_str()] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Playable audio handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum AudioArtifact {
    /// A file inside the cache directory
    File(PathBuf),
    /// Bytes that were never persisted (fallback engine, or cache write failed)
    Inline(Vec<u8>),
}

impl AudioArtifact {
    /// Load the audio payload
    pub async fn read(&self) -> Result<Vec<u8>> {
        match self {
            AudioArtifact::File(path) => Ok(tokio::fs::read(path).await?),
            AudioArtifact::Inline(bytes) => Ok(bytes.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub file_path: PathBuf,
    pub file_size_bytes: u64,
    pub last_accessed_at: SystemTime,
    /// Total order over accesses; ties in `last_accessed_at` are common
    #[serde(skip)]
    access_seq: u64,
}

/// Outcome of a sweep pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub stale_removed: usize,
    pub evicted: usize,
    pub reclaimed_bytes: u64,
    pub total_bytes: u64,
}

pub struct AudioCache {
    dir: PathBuf,
    max_bytes: u64,
    entries: DashMap<String, CacheEntry>,
    clock: AtomicU64,
}

impl AudioCache {
    /// Open (or create) the cache directory and index the files already in it
    pub fn open(cfg: &CacheConfig) -> Result<Self> {
        fs::create_dir_all(&cfg.dir)
            .map_err(|e| VcReadError::CacheError(format!("create {:?}: {e}", cfg.dir)))?;

        let cache = Self {
            dir: cfg.dir.clone(),
            max_bytes: cfg.max_bytes,
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
        };
        let indexed = cache.rebuild_index()?;
        info!(target = "cache", dir = ?cache.dir, entries = indexed, max_bytes = cache.max_bytes, "Audio cache opened");
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Sum of recorded sizes (files are not re-checked)
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.file_size_bytes).sum()
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{CACHE_EXT}"))
    }

    /// Replace the in-memory index with what is on disk
    fn rebuild_index(&self) -> Result<usize> {
        let mut found = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if ext == Some(PARTIAL_EXT) {
                if let Err(e) = fs::remove_file(&path) {
                    debug!(target = "cache", path = ?path, error = %e, "Failed to remove partial write");
                }
                continue;
            }
            if ext != Some(CACHE_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let meta = match dirent.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((key, path, meta.len(), modified));
        }

        found.sort_by_key(|(_, _, _, modified)| *modified);
        self.entries.clear();
        let count = found.len();
        for (key, path, size, modified) in found {
            let seq = self.tick();
            self.entries.insert(
                key.clone(),
                CacheEntry {
                    fingerprint: key,
                    file_path: path,
                    file_size_bytes: size,
                    last_accessed_at: modified,
                    access_seq: seq,
                },
            );
        }
        Ok(count)
    }

    /// Look up a fingerprint. A record whose file vanished is dropped and
    /// reported as a miss.
    pub fn lookup(&self, key: &str) -> Option<AudioArtifact> {
        let path = self.entries.get(key)?.file_path.clone();

        if !path.is_file() {
            self.entries.remove(key);
            debug!(target = "cache", key = %key, "Stale cache record removed");
            return None;
        }

        let now = SystemTime::now();
        let seq = self.tick();
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_accessed_at = now;
            entry.access_seq = seq;
        }
        if let Err(e) = touch(&path, now) {
            debug!(target = "cache", key = %key, error = %e, "Failed to refresh mtime");
        }
        Some(AudioArtifact::File(path))
    }

    /// Persist synthesized audio under `key`.
    ///
    /// Each write goes to its own temporary file in the cache directory and
    /// is renamed into place, so a lookup or a concurrent insert of the same
    /// key never observes a partial file.
    pub fn insert(&self, key: &str, audio: &[u8]) -> Result<AudioArtifact> {
        let path = self.path_for(key);
        self.write_atomically(key, &path, audio)
            .map_err(|e| VcReadError::CacheError(format!("write {path:?}: {e}")))?;

        let seq = self.tick();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                fingerprint: key.to_string(),
                file_path: path.clone(),
                file_size_bytes: audio.len() as u64,
                last_accessed_at: SystemTime::now(),
                access_seq: seq,
            },
        );
        Ok(AudioArtifact::File(path))
    }

    fn write_atomically(&self, key: &str, path: &Path, audio: &[u8]) -> std::io::Result<()> {
        // Removed on drop unless persisted
        let mut partial = tempfile::Builder::new()
            .prefix(&format!("{key}."))
            .suffix(&format!(".{PARTIAL_EXT}"))
            .tempfile_in(&self.dir)?;
        partial.write_all(audio)?;
        partial.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Drop stale records and evict least-recently-accessed entries until the
    /// total size fits the budget.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let mut live: Vec<CacheEntry> = Vec::with_capacity(self.entries.len());
        let snapshot: Vec<CacheEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in snapshot {
            if entry.file_path.is_file() {
                report.total_bytes += entry.file_size_bytes;
                live.push(entry);
            } else {
                self.entries.remove(&entry.fingerprint);
                report.stale_removed += 1;
            }
        }

        if report.total_bytes <= self.max_bytes {
            debug!(target = "cache", total_bytes = report.total_bytes, "Cache within budget");
            return report;
        }

        info!(
            target = "cache",
            total_mb = format!("{:.2}", mb(report.total_bytes)),
            max_mb = format!("{:.2}", mb(self.max_bytes)),
            "Cache over budget; evicting"
        );

        live.sort_by_key(|e| e.access_seq);
        for entry in live {
            if report.total_bytes <= self.max_bytes {
                break;
            }
            // Skip entries that were read while we were sweeping
            let removed = self
                .entries
                .remove_if(&entry.fingerprint, |_, e| e.access_seq == entry.access_seq);
            if removed.is_none() {
                continue;
            }
            match fs::remove_file(&entry.file_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(target = "cache", path = ?entry.file_path, error = %e, "Failed to delete cache file");
                }
            }
            report.total_bytes -= entry.file_size_bytes;
            report.reclaimed_bytes += entry.file_size_bytes;
            report.evicted += 1;
        }

        info!(
            target = "cache",
            evicted = report.evicted,
            reclaimed_mb = format!("{:.2}", mb(report.reclaimed_bytes)),
            "Cache sweep complete"
        );
        report
    }

    /// Sweep now and then every `interval`, off the async worker threads
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let cache = Arc::clone(&self);
                if let Err(e) = tokio::task::spawn_blocking(move || cache.sweep()).await {
                    warn!(target = "cache", error = %e, "Cache sweep task failed");
                }
            }
        })
    }
}

fn touch(path: &Path, at: SystemTime) -> std::io::Result<()> {
    fs::File::options().write(true).open(path)?.set_modified(at)
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}
