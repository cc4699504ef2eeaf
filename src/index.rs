use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{SyncError, SyncResult};
use crate::filters::IgnoreList;
use crate::hasher::hash_file;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileIndexEntry {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
    pub modified_time_unix: f64,
    pub content_hash: String,
    /// Unix seconds when the engine last confirmed this version with the remote;
    /// 0.0 for entries that only come from the start-up scan.
    pub synced_at: f64,
}

impl FileIndexEntry {
    /// Stats and hashes `abs` as it is on disk right now.
    pub fn from_disk(relative_path: &str, abs: &Path) -> SyncResult<Self> {
        let meta = fs::metadata(abs).map_err(|e| SyncError::io(abs, e))?;
        let content_hash = hash_file(abs)?;
        Ok(Self {
            relative_path: relative_path.to_string(),
            absolute_path: abs.to_path_buf(),
            size_bytes: meta.len(),
            modified_time_unix: modified_unix(&meta),
            content_hash,
            synced_at: 0.0,
        })
    }

    pub fn synced(mut self, at: f64) -> Self {
        self.synced_at = at;
        self
    }
}

/// The engine's belief about which local files are mirrored remotely.
#[derive(Debug, Default, Clone)]
pub struct FileIndex {
    entries: HashMap<String, FileIndexEntry>,
}

impl FileIndex {
    /// Full recursive scan of `root`, skipping ignored names. Files that cannot be
    /// read are left out and picked up again by a later event or pass.
    pub fn scan(root: &Path, ignore: &IgnoreList) -> SyncResult<Self> {
        let mut index = FileIndex::default();
        if !root.is_dir() {
            return Err(SyncError::Config(format!(
                "local folder does not exist: {}",
                root.display()
            )));
        }
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if ignore.is_ignored_path(path) {
                continue;
            }
            let Some(rel) = relative_key(root, path) else {
                continue;
            };
            match FileIndexEntry::from_disk(&rel, path) {
                Ok(e) => {
                    index.entries.insert(rel, e);
                }
                Err(err) => crate::logging::warn_kv(
                    "index scan skipped file",
                    &[("path", &rel), ("error", &err.to_string())],
                ),
            }
        }
        Ok(index)
    }

    pub fn get(&self, rel: &str) -> Option<&FileIndexEntry> {
        self.entries.get(rel)
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.entries.contains_key(rel)
    }

    pub fn upsert(&mut self, entry: FileIndexEntry) {
        self.entries.insert(entry.relative_path.clone(), entry);
    }

    pub fn remove(&mut self, rel: &str) -> Option<FileIndexEntry> {
        self.entries.remove(rel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by key.
    pub fn snapshot(&self) -> Vec<FileIndexEntry> {
        let mut out: Vec<FileIndexEntry> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        out
    }
}

/// `path` relative to `root` joined with `/`, or None when it is outside the root.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(p) => parts.push(p.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Remote counterpart of a relative key. The remote folder is flat, so only
/// top-level files have one.
pub fn remote_name(rel: &str) -> Option<&str> {
    if rel.is_empty() || rel.contains('/') {
        None
    } else {
        Some(rel)
    }
}

pub fn modified_unix(meta: &fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
