use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Default)]
pub struct SyncStats {
    uploads: AtomicU64,
    downloads: AtomicU64,
    remote_deletes: AtomicU64,
    local_deletes: AtomicU64,
    failures: AtomicU64,
    passes: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_pass_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncStats {
    pub fn on_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_remote_delete(&self) {
        self.remote_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_local_delete(&self) {
        self.local_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_failure(&self, err: impl ToString) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut g = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *g = Some(err.to_string());
    }

    pub fn on_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        let mut g = self.last_pass_at.lock().unwrap_or_else(|e| e.into_inner());
        *g = Some(Utc::now());
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default();
        let last_pass_at = *self.last_pass_at.lock().unwrap_or_else(|e| e.into_inner());
        SyncStatsSnapshot {
            uploads_total: self.uploads.load(Ordering::Relaxed),
            downloads_total: self.downloads.load(Ordering::Relaxed),
            remote_deletes_total: self.remote_deletes.load(Ordering::Relaxed),
            local_deletes_total: self.local_deletes.load(Ordering::Relaxed),
            failures_total: self.failures.load(Ordering::Relaxed),
            passes_total: self.passes.load(Ordering::Relaxed),
            last_error,
            last_pass_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatsSnapshot {
    pub uploads_total: u64,
    pub downloads_total: u64,
    pub remote_deletes_total: u64,
    pub local_deletes_total: u64,
    pub failures_total: u64,
    pub passes_total: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub last_pass_at: Option<DateTime<Utc>>,
}
