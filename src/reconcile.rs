//! One reconciliation pass: compare the remote listing with the local folder and
//! pull, push or delete so that both converge.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::engine::{SyncEngine, CLOCK_SKEW_TOLERANCE_SECS};
use crate::error::{SyncError, SyncResult};
use crate::filters::DOWNLOAD_TEMP_MARKER;
use crate::hasher::hash_file;
use crate::index::{modified_unix, now_unix, FileIndexEntry};
use crate::remote::{RemoteFileRecord, RemoteStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub downloaded: usize,
    pub uploaded: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PassReport {
    /// Nothing was transferred or deleted and nothing failed.
    pub fn is_noop(&self) -> bool {
        self.downloaded == 0
            && self.uploaded == 0
            && self.deleted_local == 0
            && self.deleted_remote == 0
            && self.failed == 0
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RemoteAction {
    Download,
    /// Local copy changed since it was last confirmed remotely.
    Upload,
    /// Local copy is gone; the remote file still has to go.
    DeleteRemote,
    Keep,
}

pub(crate) async fn run_pass(engine: &SyncEngine) -> SyncResult<PassReport> {
    let inner = engine.inner();
    let root = inner.settings.local_root.clone();
    let ignore = &inner.settings.ignore;
    let mut report = PassReport::default();

    let pass_start = now_unix();
    let remote_files = inner.remote.list_files(&inner.folder_id).await?;
    let last_sync = inner.lock_shared().last_sync_time;

    let mut remote_names: HashSet<&str> = HashSet::new();
    for record in &remote_files {
        remote_names.insert(record.name.as_str());
        if !is_plain_name(&record.name) || ignore.is_ignored_name(&record.name) {
            report.skipped += 1;
            continue;
        }
        let local_path = root.join(&record.name);
        let action = match decide(engine, record, &local_path, last_sync, pass_start) {
            Ok(action) => action,
            Err(err) => {
                report.failed += 1;
                engine.record_failure("error inspecting local file", &record.name, &err);
                continue;
            }
        };
        match action {
            RemoteAction::Keep => report.skipped += 1,
            RemoteAction::Download => match download(engine, record).await {
                Ok(()) => report.downloaded += 1,
                Err(err) => {
                    report.failed += 1;
                    engine.record_failure("error downloading from drive", &record.name, &err);
                }
            },
            RemoteAction::Upload => match engine.push_file(&record.name, &local_path).await {
                Ok(outcome) if outcome.transferred() => report.uploaded += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    engine.record_failure("error syncing to drive", &record.name, &err);
                }
            },
            RemoteAction::DeleteRemote => match inner.remote.delete_file(&record.id).await {
                Ok(()) => {
                    {
                        let mut shared = inner.lock_shared();
                        shared.pending_remote_deletes.remove(&record.name);
                        shared.index.remove(&record.name);
                        shared.recent_uploads.remove(&record.name);
                    }
                    report.deleted_remote += 1;
                    inner.stats.on_remote_delete();
                    crate::logging::info_kv("deleted file from drive", &[("path", &record.name)]);
                }
                Err(err) => {
                    inner
                        .lock_shared()
                        .pending_remote_deletes
                        .insert(record.name.clone());
                    report.failed += 1;
                    engine.record_failure("error deleting from drive", &record.name, &err);
                }
            },
        }
    }

    // Tombstones whose remote file disappeared on its own are done.
    {
        let mut shared = inner.lock_shared();
        shared
            .pending_remote_deletes
            .retain(|name| remote_names.contains(name.as_str()));
    }

    for name in list_top_level(&root)? {
        if remote_names.contains(name.as_str()) || ignore.is_ignored_name(&name) {
            continue;
        }
        let abs = root.join(&name);
        let synced_at = inner.lock_shared().index.get(&name).map(|e| e.synced_at);
        match synced_at {
            // Confirmed remotely before this listing and now gone there.
            Some(t) if t > 0.0 && t < pass_start => match delete_local(engine, &name, &abs) {
                Ok(()) => report.deleted_local += 1,
                Err(err) => {
                    report.failed += 1;
                    engine.record_failure("error deleting local file", &name, &err);
                }
            },
            // Pushed or pulled after the listing was taken.
            Some(t) if t >= pass_start => report.skipped += 1,
            _ => match engine.push_file(&name, &abs).await {
                Ok(outcome) if outcome.transferred() => report.uploaded += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    engine.record_failure("error syncing to drive", &name, &err);
                }
            },
        }
    }

    inner.lock_shared().last_sync_time = Some(now_unix());
    Ok(report)
}

fn decide(
    engine: &SyncEngine,
    record: &RemoteFileRecord,
    local_path: &Path,
    last_sync: Option<f64>,
    pass_start: f64,
) -> SyncResult<RemoteAction> {
    let mut shared = engine.inner().lock_shared();
    let meta = match std::fs::metadata(local_path) {
        Ok(meta) => Some(meta),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(SyncError::io(local_path, err)),
    };

    let Some(meta) = meta else {
        // An index entry for a missing file means it was deleted here after syncing.
        if shared.pending_remote_deletes.contains(&record.name)
            || shared.index.contains(&record.name)
        {
            return Ok(RemoteAction::DeleteRemote);
        }
        return Ok(RemoteAction::Download);
    };
    shared.pending_remote_deletes.remove(&record.name);
    if !meta.is_file() {
        return Ok(RemoteAction::Keep);
    }

    let remote_mtime = record.modified_unix();
    let newer_than_local = remote_mtime > modified_unix(&meta);
    let newer_than_last_pass = last_sync.map_or(true, |t| remote_mtime > t);
    let uploaded_at = shared.recent_uploads.get(&record.name).copied();
    let own_upload =
        uploaded_at.is_some_and(|t| remote_mtime <= t + CLOCK_SKEW_TOLERANCE_SECS);
    // A listing taken after the upload finished has seen its echo.
    if uploaded_at.is_some_and(|t| t < pass_start) {
        shared.recent_uploads.remove(&record.name);
    }

    if newer_than_local && newer_than_last_pass && !own_upload {
        return Ok(RemoteAction::Download);
    }
    let confirmed = shared.index.get(&record.name).is_some_and(|entry| {
        entry.synced_at > 0.0
            && entry.size_bytes == meta.len()
            && entry.modified_time_unix == modified_unix(&meta)
    });
    if confirmed {
        Ok(RemoteAction::Keep)
    } else {
        Ok(RemoteAction::Upload)
    }
}

/// Streams the remote file into a temp sibling, then renames it into place.
async fn download(engine: &SyncEngine, record: &RemoteFileRecord) -> SyncResult<()> {
    let inner = engine.inner();
    let target = inner.settings.local_root.join(&record.name);
    let tmp = temp_path_for(&target);

    let fetched = async {
        fetch_to(inner.remote.as_ref(), &record.id, &tmp).await?;
        hash_file(&tmp)
    }
    .await;
    let content_hash = match fetched {
        Ok(hash) => hash,
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
    };

    let synced_at = now_unix();
    {
        let mut shared = inner.lock_shared();
        if let Err(err) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(SyncError::io(&target, err));
        }
        let meta = std::fs::metadata(&target).map_err(|e| SyncError::io(&target, e))?;
        shared.index.upsert(FileIndexEntry {
            relative_path: record.name.clone(),
            absolute_path: target.clone(),
            size_bytes: meta.len(),
            modified_time_unix: modified_unix(&meta),
            content_hash,
            synced_at,
        });
        shared.pending_remote_deletes.remove(&record.name);
    }

    inner.stats.on_download();
    crate::logging::info_kv(
        "downloaded file from drive",
        &[("path", &record.name), ("bytes", &record.size_bytes.to_string())],
    );
    Ok(())
}

async fn fetch_to(remote: &dyn RemoteStore, id: &str, tmp: &Path) -> SyncResult<()> {
    let mut body = remote.download_file(id).await?;
    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| SyncError::io(tmp, e))?;
    while let Some(chunk) = body.next().await {
        file.write_all(&chunk?)
            .await
            .map_err(|e| SyncError::io(tmp, e))?;
    }
    file.flush().await.map_err(|e| SyncError::io(tmp, e))?;
    file.sync_all().await.map_err(|e| SyncError::io(tmp, e))?;
    Ok(())
}

fn delete_local(engine: &SyncEngine, name: &str, abs: &Path) -> SyncResult<()> {
    let inner = engine.inner();
    {
        let mut shared = inner.lock_shared();
        match std::fs::remove_file(abs) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(SyncError::io(abs, err)),
        }
        shared.self_deleted.insert(name.to_string());
        shared.index.remove(name);
        shared.recent_uploads.remove(name);
    }
    inner.stats.on_local_delete();
    crate::logging::info_kv("removed local file deleted from drive", &[("path", name)]);
    Ok(())
}

/// Hidden sibling of `target` that carries [`DOWNLOAD_TEMP_MARKER`].
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_name = format!(
        ".{name}{DOWNLOAD_TEMP_MARKER}{}",
        uuid::Uuid::new_v4().simple()
    );
    match target.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Names of the regular files directly under `root`.
fn list_top_level(root: &Path) -> SyncResult<Vec<String>> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(root).map_err(|e| SyncError::io(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SyncError::io(root, e))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::IgnoreList;

    #[test]
    fn temp_paths_are_hidden_ignored_siblings() {
        let target = Path::new("/data/root/b.txt");
        let tmp = temp_path_for(target);
        assert_eq!(tmp.parent(), Some(Path::new("/data/root")));
        let name = tmp.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".b.txt.drivesync-tmp-"));
        assert!(IgnoreList::default().is_ignored_name(name));
        assert_ne!(temp_path_for(target), tmp);
    }

    #[test]
    fn only_plain_remote_names_map_to_local_files() {
        assert!(is_plain_name("a.txt"));
        assert!(!is_plain_name(""));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("x/y.txt"));
        assert!(!is_plain_name("x\\y.txt"));
    }

    #[test]
    fn noop_ignores_skips() {
        let report = PassReport {
            skipped: 3,
            ..PassReport::default()
        };
        assert!(report.is_noop());
        let report = PassReport {
            failed: 1,
            ..PassReport::default()
        };
        assert!(!report.is_noop());
    }
}
