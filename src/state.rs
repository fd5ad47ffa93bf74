//! Persisted upload state and cross-process discovery.
//!
//! Each process owns one record slot per file, named by the file's
//! fingerprint plus the owning process id, so co-running uploads never
//! clobber each other. Discovery of other processes' slots is read-only
//! except for opportunistic cleanup of demonstrably stale records.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fingerprint;

/// Another process's record survives cleanup passes for this long after its
/// last save, so an in-flight upload elsewhere keeps its checkpoint.
pub const RETENTION_SECS: i64 = 3600;

const FILE_PREFIX: &str = ".tusk_state_";

/// Snapshot of upload progress, as persisted between invocations.
///
/// `offset` always holds the last value confirmed by the server, never an
/// optimistic local count. `file_size` and `endpoint` are validation keys: a
/// loaded record is only usable when both match the current request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadState {
    pub url: String,
    pub offset: u64,
    pub file_size: u64,
    pub endpoint: String,
    pub chunk_size: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Unix timestamp of the last save; stamped by the store.
    #[serde(default)]
    pub saved_at: i64,
}

/// One record slot found during discovery.
#[derive(Debug)]
pub struct RecordEntry {
    pub path: PathBuf,
    pub pid: u32,
    /// `None` when the record could not be decoded.
    pub state: Option<UploadState>,
}

impl RecordEntry {
    pub fn saved_at(&self) -> i64 {
        self.state.as_ref().map_or(0, |s| s.saved_at)
    }
}

/// Directory-backed store for upload state records.
///
/// Always an explicit injected value, never a global: tests point it at a
/// scratch directory.
pub struct StateStore {
    dir: PathBuf,
    pid: u32,
    keys: Mutex<HashMap<PathBuf, CachedKeys>>,
}

/// Fingerprint and legacy digest for one file, with the stat stamp they
/// were computed under.
#[derive(Clone)]
struct CachedKeys {
    size: u64,
    mtime: u64,
    fingerprint: String,
    legacy: String,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pid: std::process::id(),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Store rooted in the current working directory.
    pub fn in_current_dir() -> Self {
        Self::new(".")
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Persist the record for this process's own slot. The write is atomic
    /// from a reader's perspective: the bytes land in a temp file that is
    /// renamed into place.
    pub fn save(&self, file_path: &Path, state: &UploadState) -> std::io::Result<()> {
        let (fp, _) = self.keys_for(file_path);
        let mut state = state.clone();
        state.saved_at = chrono::Utc::now().timestamp();

        let json = serde_json::to_vec_pretty(&state)?;
        fs::create_dir_all(&self.dir)?;
        let dest = self.own_slot(&fp);
        let tmp = dest.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &dest)?;
        debug!(record = %dest.display(), offset = state.offset, "saved upload state");
        Ok(())
    }

    /// Load the best available record for a file.
    ///
    /// Tries this process's own slot first, then scans slots written by
    /// other processes (including the legacy path-only naming) and keeps the
    /// newest one whose recorded size matches the file on disk. Every
    /// failure mode — missing file, undecodable record, size mismatch — is
    /// treated as "no state", never an error.
    pub fn load(&self, file_path: &Path) -> Option<UploadState> {
        let (fp, _) = self.keys_for(file_path);
        if let Some(state) = read_record(&self.own_slot(&fp)) {
            return Some(state);
        }

        let current_size = fs::metadata(file_path).ok()?.len();
        let mut best: Option<UploadState> = None;
        for entry in self.records_for(file_path) {
            let Some(state) = entry.state else { continue };
            if state.file_size != current_size {
                continue;
            }
            if best.as_ref().is_none_or(|b| state.saved_at > b.saved_at) {
                best = Some(state);
            }
        }
        best
    }

    /// Remove this process's slot, plus matching records from other
    /// processes that are past the retention threshold.
    pub fn clear(&self, file_path: &Path) {
        let (fp, _) = self.keys_for(file_path);
        remove_quiet(&self.own_slot(&fp));

        let now = chrono::Utc::now().timestamp();
        for entry in self.records_for(file_path) {
            if entry.pid == self.pid {
                continue;
            }
            if now - entry.saved_at() > RETENTION_SECS {
                remove_quiet(&entry.path);
            }
        }
    }

    /// Enumerate every record slot matching this file's fingerprint
    /// namespace, the legacy naming included.
    pub fn records_for(&self, file_path: &Path) -> Vec<RecordEntry> {
        let (fp, legacy) = self.keys_for(file_path);

        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((key, pid)) = parse_record_name(name) else {
                continue;
            };
            if key != fp && key != legacy {
                continue;
            }
            let path = entry.path();
            let state = read_record(&path);
            out.push(RecordEntry { path, pid, state });
        }
        out
    }

    /// Delete a single discovered record.
    pub fn remove_record(&self, entry: &RecordEntry) {
        remove_quiet(&entry.path);
    }

    fn own_slot(&self, fp: &str) -> PathBuf {
        self.dir.join(record_name(fp, self.pid))
    }

    /// Fingerprinting a full-tier file reads all of it, so the computed
    /// keys are cached per path and reused while the file's size and mtime
    /// are unchanged. A changed stamp forces a recompute.
    fn keys_for(&self, file_path: &Path) -> (String, String) {
        let stamp = fs::metadata(file_path).ok().map(|meta| {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            (meta.len(), mtime)
        });

        let mut cache = match self.keys.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let (Some((size, mtime)), Some(hit)) = (stamp, cache.get(file_path)) {
            if hit.size == size && hit.mtime == mtime {
                return (hit.fingerprint.clone(), hit.legacy.clone());
            }
        }

        let fp = fingerprint::fingerprint(file_path).to_string();
        let legacy = fingerprint::legacy_digest(file_path);
        if let Some((size, mtime)) = stamp {
            cache.insert(
                file_path.to_path_buf(),
                CachedKeys {
                    size,
                    mtime,
                    fingerprint: fp.clone(),
                    legacy: legacy.clone(),
                },
            );
        }
        (fp, legacy)
    }
}

pub(crate) fn record_name(key: &str, pid: u32) -> String {
    format!("{FILE_PREFIX}{key}_{pid}.json")
}

/// Split `.tusk_state_<key>_<pid>.json` into key and pid.
fn parse_record_name(name: &str) -> Option<(&str, u32)> {
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(".json")?;
    let (key, pid) = stem.rsplit_once('_')?;
    Some((key, pid.parse().ok()?))
}

fn read_record(path: &Path) -> Option<UploadState> {
    let data = fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(state) => Some(state),
        Err(e) => {
            debug!(record = %path.display(), error = %e, "undecodable state record ignored");
            None
        }
    }
}

fn remove_quiet(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(record = %path.display(), error = %e, "failed to remove state record");
        }
    }
}
