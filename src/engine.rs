//! The sync engine: owns the watcher subscription, the reconciliation timer and
//! the shared index state.
//!
//! All index mutations go through [`EngineInner::lock_shared`]. The guard is a
//! plain `std::sync::Mutex` guard and is never held across a remote call.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::filters::IgnoreList;
use crate::index::{now_unix, relative_key, remote_name, FileIndex, FileIndexEntry};
use crate::reconcile::{self, PassReport};
use crate::remote::RemoteStore;
use crate::telemetry::{SyncStats, SyncStatsSnapshot};
use crate::watcher::{ChangeEvent, ChangeKind, LocalWatcher};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Remote modified-times this close to our own upload are treated as that upload.
pub const CLOCK_SKEW_TOLERANCE_SECS: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub local_root: PathBuf,
    pub remote_folder: String,
    pub ignore: IgnoreList,
    pub poll_interval: Duration,
    pub debounce: Duration,
}

impl EngineSettings {
    pub fn new(local_root: impl Into<PathBuf>, remote_folder: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            remote_folder: remote_folder.into(),
            ignore: IgnoreList::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            local_root: cfg.local_folder.clone(),
            remote_folder: cfg.drive_folder.clone(),
            ignore: IgnoreList::new(&cfg.ignore_patterns),
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            debounce: Duration::from_millis(cfg.debounce_ms),
        }
    }

    pub fn with_ignore(mut self, ignore: IgnoreList) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Created,
    Updated,
    /// Index already holds this exact content.
    Unchanged,
    /// Not a top-level regular file.
    Skipped,
}

impl PushOutcome {
    pub fn transferred(self) -> bool {
        matches!(self, PushOutcome::Created | PushOutcome::Updated)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub(crate) index: FileIndex,
    pub(crate) last_sync_time: Option<f64>,
    /// Completion time of our latest upload per path.
    pub(crate) recent_uploads: HashMap<String, f64>,
    /// Paths deleted locally whose remote delete failed; retried by the next pass.
    pub(crate) pending_remote_deletes: HashSet<String>,
    /// Paths the engine removed itself; their Deleted events are not propagated.
    pub(crate) self_deleted: HashSet<String>,
}

pub(crate) struct EngineInner {
    pub(crate) settings: EngineSettings,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) folder_id: String,
    pub(crate) stats: SyncStats,
    shared: Mutex<SharedState>,
    pass_gate: tokio::sync::Mutex<()>,
    lifecycle: Mutex<EngineState>,
    shutdown: watch::Sender<bool>,
    sync_now: Notify,
}

impl EngineInner {
    pub(crate) fn lock_shared(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, EngineState> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub local_folder: PathBuf,
    pub drive_folder: String,
    pub folder_id: String,
    pub indexed_files: usize,
    pub pending_remote_deletes: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub stats: SyncStatsSnapshot,
}

/// Handle to one engine instance; clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Resolves (or creates) the remote folder and scans the local root.
    ///
    /// Failures here are fatal: the engine never reaches `Running`.
    pub async fn connect(
        settings: EngineSettings,
        remote: Arc<dyn RemoteStore>,
    ) -> SyncResult<Self> {
        if settings.remote_folder.trim().is_empty() {
            return Err(SyncError::Config("remote folder name is empty".to_string()));
        }
        if !settings.local_root.is_dir() {
            return Err(SyncError::Config(format!(
                "local folder does not exist: {}",
                settings.local_root.display()
            )));
        }
        let mut settings = settings;
        let local_root = settings
            .local_root
            .canonicalize()
            .map_err(|e| SyncError::io(&settings.local_root, e))?;
        settings.local_root = local_root;

        let folder_id = resolve_folder(remote.as_ref(), &settings.remote_folder).await?;
        // Hashing the whole tree is blocking work; keep it off the async workers.
        let (root, ignore) = (settings.local_root.clone(), settings.ignore.clone());
        let index = tokio::task::spawn_blocking(move || FileIndex::scan(&root, &ignore))
            .await
            .map_err(|e| SyncError::Config(format!("local scan did not complete: {e}")))??;
        crate::logging::info_kv(
            "sync engine ready",
            &[
                ("local", &settings.local_root.display().to_string()),
                ("drive_folder", &settings.remote_folder),
                ("indexed", &index.len().to_string()),
            ],
        );

        let shared = SharedState {
            index,
            ..SharedState::default()
        };
        Ok(Self {
            inner: Arc::new(EngineInner {
                settings,
                remote,
                folder_id,
                stats: SyncStats::default(),
                shared: Mutex::new(shared),
                pass_gate: tokio::sync::Mutex::new(()),
                lifecycle: Mutex::new(EngineState::Stopped),
                shutdown: watch::channel(false).0,
                sync_now: Notify::new(),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    pub fn local_root(&self) -> &Path {
        &self.inner.settings.local_root
    }

    pub fn folder_id(&self) -> &str {
        &self.inner.folder_id
    }

    pub fn state(&self) -> EngineState {
        *self.inner.lock_lifecycle()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Runs the watcher and the reconciliation timer until [`SyncEngine::stop`].
    ///
    /// Only returns once the engine stopped; see [`SyncEngine::spawn`] for the
    /// background variant.
    pub async fn start(&self) -> SyncResult<()> {
        let mut shutdown = self.begin()?;
        self.run_until_stopped(&mut shutdown).await
    }

    /// Marks the engine running right away and drives it on a background task.
    pub fn spawn(&self) -> SyncResult<JoinHandle<SyncResult<()>>> {
        let mut shutdown = self.begin()?;
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            engine.run_until_stopped(&mut shutdown).await
        }))
    }

    fn begin(&self) -> SyncResult<watch::Receiver<bool>> {
        let mut state = self.inner.lock_lifecycle();
        if *state == EngineState::Running {
            return Err(SyncError::AlreadyRunning);
        }
        *state = EngineState::Running;
        self.inner.shutdown.send_replace(false);
        Ok(self.inner.shutdown.subscribe())
    }

    async fn run_until_stopped(&self, shutdown: &mut watch::Receiver<bool>) -> SyncResult<()> {
        let result = self.run_loop(shutdown).await;
        *self.inner.lock_lifecycle() = EngineState::Stopped;
        match &result {
            Ok(()) => crate::logging::info("sync engine stopped"),
            Err(err) => crate::logging::error(format!("sync engine stopped with error: {err}")),
        }
        result
    }

    /// Idempotent; callable from any thread. In-flight remote calls finish first.
    pub fn stop(&self) {
        let state = self.inner.lock_lifecycle();
        if *state == EngineState::Running {
            crate::logging::info("stopping sync engine");
        }
        self.inner.shutdown.send_replace(true);
    }

    async fn run_loop(&self, shutdown: &mut watch::Receiver<bool>) -> SyncResult<()> {
        let settings = &self.inner.settings;
        let mut watcher = LocalWatcher::start(&settings.local_root, settings.debounce)?;
        self.inner.lock_shared().self_deleted.clear();
        crate::logging::info_kv(
            "starting sync",
            &[
                ("local", &settings.local_root.display().to_string()),
                ("drive_folder", &settings.remote_folder),
                ("poll_secs", &settings.poll_interval.as_secs().to_string()),
            ],
        );

        self.push_unsynced().await;

        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                batch = watcher.next_batch() => match batch {
                    Some(events) => {
                        for event in events {
                            self.handle_event(event).await;
                        }
                    }
                    None => {
                        crate::logging::warn("file watcher closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.reconcile_logged().await;
                }
                _ = self.inner.sync_now.notified() => {
                    self.reconcile_logged().await;
                }
            }
        }
        Ok(())
    }

    /// Asks the running loop for an extra pass and returns immediately.
    ///
    /// Requests arriving while a pass is underway collapse into one follow-up pass.
    pub fn trigger_sync(&self) -> SyncResult<()> {
        if !self.is_running() {
            return Err(SyncError::NotRunning);
        }
        crate::logging::info("manual sync triggered");
        self.inner.sync_now.notify_one();
        Ok(())
    }

    /// One reconciliation pass. `Ok(None)` when another pass is already in progress.
    pub async fn reconcile_once(&self) -> SyncResult<Option<PassReport>> {
        let Ok(_gate) = self.inner.pass_gate.try_lock() else {
            crate::logging::info("reconciliation already in progress, skipping");
            return Ok(None);
        };
        let report = reconcile::run_pass(self).await?;
        self.inner.stats.on_pass();
        Ok(Some(report))
    }

    async fn reconcile_logged(&self) -> Option<PassReport> {
        match self.reconcile_once().await {
            Ok(Some(report)) => {
                if !report.is_noop() {
                    crate::logging::info_kv(
                        "reconciliation pass done",
                        &[
                            ("downloaded", &report.downloaded.to_string()),
                            ("uploaded", &report.uploaded.to_string()),
                            ("deleted_local", &report.deleted_local.to_string()),
                            ("deleted_remote", &report.deleted_remote.to_string()),
                            ("failed", &report.failed.to_string()),
                        ],
                    );
                }
                Some(report)
            }
            Ok(None) => None,
            Err(err) => {
                crate::logging::error_kv(
                    "error polling drive changes",
                    &[("error", &err.to_string())],
                );
                self.inner.stats.on_failure(&err);
                None
            }
        }
    }

    /// Uploads scanned files the remote lacks or holds an older version of.
    ///
    /// Runs once when the engine starts; a file whose upload fails loses its index
    /// entry so the next pass treats it as unsynced and retries.
    pub async fn push_unsynced(&self) -> PassReport {
        let _gate = self.inner.pass_gate.lock().await;
        let mut report = PassReport::default();
        let inner = &self.inner;

        let listed_at = now_unix();
        let remote_files = match inner.remote.list_files(&inner.folder_id).await {
            Ok(files) => files,
            Err(err) => {
                crate::logging::error_kv(
                    "start-up push could not list drive folder",
                    &[("error", &err.to_string())],
                );
                inner.stats.on_failure(&err);
                report.failed += 1;
                return report;
            }
        };
        let remote_mtimes: HashMap<&str, f64> = remote_files
            .iter()
            .map(|r| (r.name.as_str(), r.modified_unix()))
            .collect();

        let candidates: Vec<(String, PathBuf, f64)> = {
            let shared = inner.lock_shared();
            shared
                .index
                .snapshot()
                .into_iter()
                .filter(|e| e.synced_at == 0.0 && remote_name(&e.relative_path).is_some())
                .map(|e| (e.relative_path, e.absolute_path, e.modified_time_unix))
                .collect()
        };

        for (rel, abs, local_mtime) in candidates {
            let remote_mtime = remote_mtimes.get(rel.as_str()).copied();
            let local_newer = remote_mtime
                .is_some_and(|remote| local_mtime > remote + CLOCK_SKEW_TOLERANCE_SECS);
            if remote_mtime.is_some() && !local_newer {
                let mut shared = inner.lock_shared();
                let confirmed = shared.index.get(&rel).cloned();
                if let Some(entry) = confirmed {
                    shared.index.upsert(entry.synced(listed_at));
                }
                continue;
            }
            match self.push_file(&rel, &abs).await {
                Ok(outcome) if outcome.transferred() => report.uploaded += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    self.record_failure("error syncing to drive", &rel, &err);
                    if remote_mtime.is_none() {
                        inner.lock_shared().index.remove(&rel);
                    }
                }
            }
        }
        report
    }

    /// Applies one local change event.
    pub async fn handle_event(&self, event: ChangeEvent) {
        let settings = &self.inner.settings;
        let Some(rel) = relative_key(&settings.local_root, &event.path) else {
            return;
        };
        if settings.ignore.is_ignored_path(&event.path) {
            return;
        }
        if remote_name(&rel).is_none() {
            crate::logging::info_kv(
                "skipping nested path, drive folder is flat",
                &[("path", &rel)],
            );
            return;
        }
        match event.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                if let Err(err) = self.push_file(&rel, &event.path).await {
                    self.record_failure("error syncing to drive", &rel, &err);
                }
            }
            ChangeKind::Deleted => self.propagate_delete(&rel).await,
        }
    }

    /// Change-to-remote path: re-resolve the remote file by name, then update or create.
    pub(crate) async fn push_file(&self, rel: &str, abs: &Path) -> SyncResult<PushOutcome> {
        let inner = &self.inner;
        if remote_name(rel).is_none() || !abs.is_file() {
            return Ok(PushOutcome::Skipped);
        }
        let entry = match FileIndexEntry::from_disk(rel, abs) {
            Ok(entry) => entry,
            Err(err) if err.is_not_found() => return Ok(PushOutcome::Skipped),
            Err(err) => return Err(err),
        };
        {
            let mut shared = inner.lock_shared();
            shared.pending_remote_deletes.remove(rel);
            let unchanged_since = shared.index.get(rel).and_then(|known| {
                let same = known.synced_at > 0.0
                    && known.content_hash == entry.content_hash
                    && known.size_bytes == entry.size_bytes;
                same.then_some(known.synced_at)
            });
            if let Some(synced_at) = unchanged_since {
                // Touched but not edited: keep the new mtime so passes stop re-hashing it.
                shared.index.upsert(entry.synced(synced_at));
                return Ok(PushOutcome::Unchanged);
            }
        }

        let outcome = match inner.remote.find_file_by_name(&inner.folder_id, rel).await? {
            Some(id) => {
                inner.remote.update_file(&id, abs).await?;
                PushOutcome::Updated
            }
            None => {
                inner.remote.upload_file(abs, &inner.folder_id).await?;
                PushOutcome::Created
            }
        };

        let done_at = now_unix();
        {
            let mut shared = inner.lock_shared();
            shared.index.upsert(entry.synced(done_at));
            shared.recent_uploads.insert(rel.to_string(), done_at);
        }
        inner.stats.on_upload();
        let msg = match outcome {
            PushOutcome::Updated => "updated file in drive",
            _ => "uploaded new file to drive",
        };
        crate::logging::info_kv(msg, &[("path", rel)]);
        Ok(outcome)
    }

    async fn propagate_delete(&self, rel: &str) {
        let inner = &self.inner;
        {
            let mut shared = inner.lock_shared();
            if shared.self_deleted.remove(rel) {
                shared.index.remove(rel);
                return;
            }
        }
        if inner.settings.local_root.join(rel).exists() {
            // Recreated before the event was handled; its Created event follows.
            return;
        }

        let result: SyncResult<bool> = async {
            match inner.remote.find_file_by_name(&inner.folder_id, rel).await? {
                Some(id) => {
                    inner.remote.delete_file(&id).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        .await;

        {
            let mut shared = inner.lock_shared();
            shared.index.remove(rel);
            shared.recent_uploads.remove(rel);
            if result.is_err() {
                shared.pending_remote_deletes.insert(rel.to_string());
            }
        }
        match result {
            Ok(true) => {
                inner.stats.on_remote_delete();
                crate::logging::info_kv("deleted file from drive", &[("path", rel)]);
            }
            Ok(false) => {}
            Err(err) => self.record_failure("error deleting from drive", rel, &err),
        }
    }

    pub(crate) fn record_failure(&self, msg: &str, rel: &str, err: &SyncError) {
        crate::logging::error_kv(msg, &[("path", rel), ("error", &err.to_string())]);
        self.inner.stats.on_failure(err);
    }

    pub fn index_snapshot(&self) -> Vec<FileIndexEntry> {
        self.inner.lock_shared().index.snapshot()
    }

    pub fn index_entry(&self, rel: &str) -> Option<FileIndexEntry> {
        self.inner.lock_shared().index.get(rel).cloned()
    }

    pub fn last_sync_time(&self) -> Option<f64> {
        self.inner.lock_shared().last_sync_time
    }

    pub fn pending_remote_deletes(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .inner
            .lock_shared()
            .pending_remote_deletes
            .iter()
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn status(&self) -> EngineStatus {
        let (indexed_files, pending_remote_deletes, last_sync) = {
            let shared = self.inner.lock_shared();
            (
                shared.index.len(),
                shared.pending_remote_deletes.len(),
                shared.last_sync_time.and_then(unix_to_datetime),
            )
        };
        EngineStatus {
            state: self.state(),
            local_folder: self.inner.settings.local_root.clone(),
            drive_folder: self.inner.settings.remote_folder.clone(),
            folder_id: self.inner.folder_id.clone(),
            indexed_files,
            pending_remote_deletes,
            last_sync,
            stats: self.stats(),
        }
    }
}

async fn resolve_folder(remote: &dyn RemoteStore, name: &str) -> SyncResult<String> {
    if let Some(id) = remote.find_folder(name).await? {
        return Ok(id);
    }
    let id = remote.create_folder(name, None).await?;
    crate::logging::info_kv("created drive folder", &[("name", name), ("id", &id)]);
    Ok(id)
}

fn unix_to_datetime(t: f64) -> Option<DateTime<Utc>> {
    let secs = t.floor();
    let nanos = ((t - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use std::{fs, time::SystemTime};

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[tokio::test]
    async fn connect_reuses_existing_folder() {
        let root = make_temp_dir("drivesync-engine-folder");
        let remote = Arc::new(MemoryRemote::new());
        let existing = remote.create_folder("Sync", None).await.unwrap();
        let engine = SyncEngine::connect(EngineSettings::new(&root, "Sync"), remote.clone())
            .await
            .unwrap();
        assert_eq!(engine.folder_id(), existing);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn connect_rejects_missing_root_and_empty_folder_name() {
        let root = make_temp_dir("drivesync-engine-bad");
        let remote = Arc::new(MemoryRemote::new());
        let err = SyncEngine::connect(EngineSettings::new(root.join("nope"), "Sync"), remote.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Config(_)));
        let err = SyncEngine::connect(EngineSettings::new(&root, "  "), remote)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn nested_paths_are_never_pushed() {
        let root = make_temp_dir("drivesync-engine-nested");
        fs::create_dir_all(root.join("sub")).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::connect(EngineSettings::new(&root, "Sync"), remote.clone())
            .await
            .unwrap();
        let nested = engine.local_root().join("sub").join("c.txt");
        fs::write(&nested, "nested").unwrap();
        engine
            .handle_event(ChangeEvent::new(ChangeKind::Created, &nested))
            .await;
        assert!(remote.file_names(engine.folder_id()).is_empty());
    }

    #[test]
    fn unix_seconds_convert_to_datetime() {
        let dt = unix_to_datetime(1_709_294_400.5).unwrap();
        assert_eq!(dt.timestamp(), 1_709_294_400);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
    }
}
