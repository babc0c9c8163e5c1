//! On-disk timeline storage.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/timelines/<encoded path>.json   one FileTimeline per file
//! <root>/index.json                      sorted list of tracked paths
//! ```
//!
//! File paths are percent-encoded into storage keys so that every key is a
//! single flat file name and decodes back to the exact original path. Writes
//! go to a uniquely named temp file that is synced and then renamed over the
//! target, so a reader never observes a partial timeline.
//!
//! All store I/O is blocking `std::fs` work (writes end in `sync_all`).
//! Async callers run `save` and `update_index` on the blocking pool.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

use crate::errors::TimelineError;

use super::FileTimeline;

const TIMELINE_DIR: &str = "timelines";
const INDEX_FILE: &str = "index.json";
const KEY_SUFFIX: &str = ".json";

// ---------------------------------------------------------------------------
// Storage keys
// ---------------------------------------------------------------------------

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
}

/// Encode a file path into a flat storage key.
pub fn encode_key(file_path: &str) -> String {
    let mut out = String::with_capacity(file_path.len() + 8);
    for (i, &b) in file_path.as_bytes().iter().enumerate() {
        // Keys never start with '.', which is reserved for temp and
        // quarantined files.
        if is_plain(b) && !(i == 0 && b == b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Decode a storage key produced by [`encode_key`].
pub fn decode_key(key: &str) -> Result<String, TimelineError> {
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = key
                .get(i + 1..i + 3)
                .ok_or_else(|| TimelineError::InvalidKey(key.to_string()))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| TimelineError::InvalidKey(key.to_string()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| TimelineError::InvalidKey(key.to_string()))
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Contents of `index.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TimelineIndex {
    files: BTreeSet<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// File-backed timeline store with one writer lock per file.
pub struct TimelineStore {
    root: PathBuf,
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    index_lock: Mutex<()>,
}

impl TimelineStore {
    /// Open a store rooted at `root`. Nothing is created until the first
    /// write.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let dir = root.join(TIMELINE_DIR);
        info!(dir = %dir.display(), "opening timeline store");
        Self {
            root,
            dir,
            locks: Mutex::new(HashMap::new()),
            index_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, file_path: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(file_path), KEY_SUFFIX))
    }

    // -- locking -------------------------------------------------------------

    fn lock_for(&self, file_path: &str) -> Arc<RwLock<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(encode_key(file_path))
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Exclusive access to one file's timeline for a load-modify-save cycle.
    pub async fn write_lock(&self, file_path: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(file_path).write_owned().await
    }

    /// Shared access to one file's timeline.
    pub async fn read_lock(&self, file_path: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(file_path).read_owned().await
    }

    // -- reading -------------------------------------------------------------

    fn read_timeline(&self, path: &Path) -> Result<FileTimeline, TimelineError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| TimelineError::StorageCorruption {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Load one file's timeline; a file never stored yields an empty one.
    pub fn load(&self, file_path: &str) -> Result<FileTimeline, TimelineError> {
        let path = self.path_for(file_path);
        if !path.exists() {
            debug!(file = file_path, "no stored timeline");
            return Ok(FileTimeline::new(file_path));
        }
        let timeline = self.read_timeline(&path)?;
        if timeline.file_path != file_path {
            return Err(TimelineError::StorageCorruption {
                path: path.display().to_string(),
                detail: format!(
                    "timeline belongs to '{}', expected '{}'",
                    timeline.file_path, file_path
                ),
            });
        }
        Ok(timeline)
    }

    /// Load every stored timeline, keyed by file path. A missing storage
    /// directory yields an empty map.
    ///
    /// With `quarantine` set, undecodable files are moved aside and skipped;
    /// otherwise the first one aborts the load.
    pub fn load_all(&self, quarantine: bool) -> Result<BTreeMap<String, FileTimeline>, TimelineError> {
        let mut timelines = BTreeMap::new();
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "timeline directory missing; nothing to load");
            return Ok(timelines);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(key) = name.strip_suffix(KEY_SUFFIX) else {
                continue;
            };
            let file_path = match decode_key(key) {
                Ok(file_path) => file_path,
                Err(e) => {
                    warn!(name, error = %e, "skipping unrecognized file in timeline directory");
                    continue;
                }
            };
            match self.read_timeline(&path) {
                Ok(timeline) => {
                    timelines.insert(file_path, timeline);
                }
                Err(TimelineError::StorageCorruption { path: bad, detail }) if quarantine => {
                    warn!(path = %bad, detail = %detail, "quarantining corrupt timeline");
                    self.quarantine(&file_path)?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(count = timelines.len(), "loaded timelines");
        Ok(timelines)
    }

    /// Paths listed in the index, sorted.
    pub fn tracked_files(&self) -> Result<Vec<String>, TimelineError> {
        Ok(self.read_index()?.files.into_iter().collect())
    }

    fn read_index(&self) -> Result<TimelineIndex, TimelineError> {
        let path = self.root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(TimelineIndex::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| TimelineError::StorageCorruption {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    // -- writing -------------------------------------------------------------

    /// Write `bytes` to `target` via a synced temp file and a rename.
    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), TimelineError> {
        let parent = target.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let written = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            std::fs::rename(&tmp, target)
        })();
        if let Err(e) = written {
            warn!(target = %target.display(), error = %e, "atomic write failed");
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Persist a timeline, replacing any stored version.
    ///
    /// Callers hold the file's [`write_lock`](Self::write_lock).
    pub fn save(&self, file_path: &str, timeline: &FileTimeline) -> Result<(), TimelineError> {
        let path = self.path_for(file_path);
        let bytes = serde_json::to_vec_pretty(timeline)?;
        self.write_atomic(&path, &bytes)?;
        debug!(
            file = file_path,
            events = timeline.events.len(),
            "timeline saved"
        );
        Ok(())
    }

    /// Add `file_paths` to the index.
    pub fn update_index<S: AsRef<str>>(&self, file_paths: &[S]) -> Result<(), TimelineError> {
        let _guard = self
            .index_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut index = self.read_index()?;
        let before = index.files.len();
        index
            .files
            .extend(file_paths.iter().map(|p| p.as_ref().to_string()));
        index.updated_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&index)?;
        self.write_atomic(&self.root.join(INDEX_FILE), &bytes)?;
        debug!(
            added = index.files.len() - before,
            total = index.files.len(),
            "timeline index updated"
        );
        Ok(())
    }

    /// Move a file's stored timeline aside as `.corrupt-<timestamp>`. History
    /// is kept on disk for inspection; the file starts over empty.
    pub fn quarantine(&self, file_path: &str) -> Result<Option<PathBuf>, TimelineError> {
        let path = self.path_for(file_path);
        if !path.exists() {
            return Ok(None);
        }
        let target = self.dir.join(format!(
            ".{}.corrupt-{}",
            encode_key(file_path),
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        std::fs::rename(&path, &target)?;
        warn!(
            file = file_path,
            moved_to = %target.display(),
            "timeline quarantined"
        );
        Ok(Some(target))
    }
}
