use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// OS change notifications for every file under a root, recursively.
///
/// Events are coalesced per path over a short window; ignore rules are applied
/// by the consumer. Dropping the watcher ends the subscription.
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    debounce: Duration,
    pending: BTreeMap<PathBuf, ChangeKind>,
    deadline: Option<Instant>,
}

impl LocalWatcher {
    pub fn start(root: &Path, debounce: Duration) -> SyncResult<Self> {
        let (event_tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| watch_error(root, e))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| watch_error(root, e))?;
        Ok(Self {
            _watcher: watcher,
            rx,
            debounce,
            pending: BTreeMap::new(),
            deadline: None,
        })
    }

    /// Waits for the next coalesced batch. Returns None once the notification
    /// channel is closed. Safe to cancel: buffered events survive until the next call.
    pub async fn next_batch(&mut self) -> Option<Vec<ChangeEvent>> {
        loop {
            let Some(deadline) = self.deadline else {
                let res = self.rx.recv().await?;
                self.ingest(res);
                continue;
            };
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(res)) => self.ingest(res),
                Ok(None) | Err(_) => return Some(self.drain()),
            }
        }
    }

    fn ingest(&mut self, res: notify::Result<Event>) {
        let event = match res {
            Ok(ev) => ev,
            Err(err) => {
                crate::logging::warn(format!("notify error: {err}"));
                return;
            }
        };
        for change in classify(&event) {
            coalesce(&mut self.pending, change);
        }
        if !self.pending.is_empty() && self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.debounce);
        }
    }

    fn drain(&mut self) -> Vec<ChangeEvent> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(path, kind)| ChangeEvent { kind, path })
            .collect()
    }
}

fn watch_error(root: &Path, err: notify::Error) -> SyncError {
    SyncError::io(root, std::io::Error::other(err.to_string()))
}

/// Maps one notify event onto file-level changes; directory events are dropped.
pub fn classify(event: &Event) -> Vec<ChangeEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {}
        EventKind::Create(_) => {
            for p in &event.paths {
                if is_file(p) {
                    out.push(ChangeEvent::new(ChangeKind::Created, p));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both => {
                if let Some(from) = event.paths.first() {
                    out.push(ChangeEvent::new(ChangeKind::Deleted, from));
                }
                if let Some(to) = event.paths.get(1).filter(|p| is_file(p)) {
                    out.push(ChangeEvent::new(ChangeKind::Created, to));
                }
            }
            RenameMode::From => {
                for p in &event.paths {
                    out.push(ChangeEvent::new(ChangeKind::Deleted, p));
                }
            }
            _ => {
                // Rename target or unknown side: decide by what is on disk now.
                for p in &event.paths {
                    if is_file(p) {
                        out.push(ChangeEvent::new(ChangeKind::Created, p));
                    } else if !p.exists() {
                        out.push(ChangeEvent::new(ChangeKind::Deleted, p));
                    }
                }
            }
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(_) => {
            for p in &event.paths {
                if is_file(p) {
                    out.push(ChangeEvent::new(ChangeKind::Modified, p));
                }
            }
        }
        EventKind::Remove(_) => {
            for p in &event.paths {
                out.push(ChangeEvent::new(ChangeKind::Deleted, p));
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
    out
}

fn coalesce(pending: &mut BTreeMap<PathBuf, ChangeKind>, change: ChangeEvent) {
    match (pending.get(&change.path), change.kind) {
        (Some(ChangeKind::Created), ChangeKind::Modified) => {}
        _ => {
            pending.insert(change.path, change.kind);
        }
    }
}

fn is_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::DataChange;
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

    #[test]
    fn directory_events_are_filtered() {
        let root = make_temp_dir("drivesync-watch-dirs");
        let dir = root.join("sub");
        fs::create_dir_all(&dir).unwrap();

        let created_dir = Event::new(EventKind::Create(CreateKind::Any)).add_path(dir.clone());
        assert!(classify(&created_dir).is_empty());
        let removed_dir = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(dir);
        assert!(classify(&removed_dir).is_empty());
    }

    #[test]
    fn file_events_map_to_change_kinds() {
        let root = make_temp_dir("drivesync-watch-kinds");
        let file = root.join("a.txt");
        fs::write(&file, "hello").unwrap();

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone());
        assert_eq!(
            classify(&created),
            vec![ChangeEvent::new(ChangeKind::Created, &file)]
        );
        let modified = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(file.clone());
        assert_eq!(
            classify(&modified),
            vec![ChangeEvent::new(ChangeKind::Modified, &file)]
        );
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(root.join("gone"));
        assert_eq!(
            classify(&removed),
            vec![ChangeEvent::new(ChangeKind::Deleted, root.join("gone"))]
        );
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(file.clone());
        assert!(classify(&access).is_empty());
    }

    #[test]
    fn rename_becomes_delete_then_create() {
        let root = make_temp_dir("drivesync-watch-rename");
        let to = root.join("new.txt");
        fs::write(&to, "x").unwrap();
        let ev = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.join("old.txt"))
            .add_path(to.clone());
        assert_eq!(
            classify(&ev),
            vec![
                ChangeEvent::new(ChangeKind::Deleted, root.join("old.txt")),
                ChangeEvent::new(ChangeKind::Created, to),
            ]
        );
    }

    #[test]
    fn coalescing_keeps_one_event_per_path() {
        let mut pending = BTreeMap::new();
        let p = PathBuf::from("/r/a.txt");
        coalesce(&mut pending, ChangeEvent::new(ChangeKind::Created, &p));
        coalesce(&mut pending, ChangeEvent::new(ChangeKind::Modified, &p));
        assert_eq!(pending.get(&p), Some(&ChangeKind::Created));
        coalesce(&mut pending, ChangeEvent::new(ChangeKind::Deleted, &p));
        assert_eq!(pending.get(&p), Some(&ChangeKind::Deleted));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn live_watcher_reports_new_file() {
        let root = make_temp_dir("drivesync-watch-live");
        let mut watcher = LocalWatcher::start(&root, Duration::from_millis(50)).unwrap();
        let file = root.join("live.txt");
        fs::write(&file, "hi").unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let batch = watcher.next_batch().await.expect("watcher open");
                if batch.iter().any(|e| e.path.ends_with("live.txt") && e.kind != ChangeKind::Deleted) {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(found, "expected an event for live.txt");
    }
}
