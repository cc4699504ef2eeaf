use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use drivesync_rs::filters::IgnoreList;
use drivesync_rs::watcher::{ChangeEvent, ChangeKind};
use drivesync_rs::{EngineSettings, EngineState, MemoryRemote, RemoteStore, SyncEngine, SyncError};

fn make_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let root = std::env::temp_dir().join(format!("{prefix}-{nanos}"));
    std::fs::create_dir_all(&root).unwrap();
    root
}

struct Harness {
    engine: SyncEngine,
    remote: Arc<MemoryRemote>,
    root: PathBuf,
    folder: String,
}

async fn harness(root: PathBuf, remote: Arc<MemoryRemote>, ignore: &[&str]) -> Harness {
    let settings = EngineSettings::new(&root, "Backup")
        .with_ignore(IgnoreList::new(ignore))
        .with_poll_interval(Duration::from_millis(200))
        .with_debounce(Duration::from_millis(50));
    let engine = SyncEngine::connect(settings, remote.clone()).await.unwrap();
    let folder = engine.folder_id().to_string();
    let root = engine.local_root().to_path_buf();
    Harness {
        engine,
        remote,
        root,
        folder,
    }
}

fn later(secs: i64) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(secs)
}

#[tokio::test]
async fn local_file_is_uploaded_at_start() {
    let root = make_temp_dir("drivesync-it-upload");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;

    let report = h.engine.push_unsynced().await;
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.remote.file_names(&h.folder), vec!["a.txt"]);
    assert_eq!(h.remote.file_content(&h.folder, "a.txt").unwrap(), b"hello");
    assert!(h.engine.index_entry("a.txt").unwrap().synced_at > 0.0);
}

#[tokio::test]
async fn remote_file_is_downloaded_by_one_pass() {
    let root = make_temp_dir("drivesync-it-download");
    let remote = Arc::new(MemoryRemote::new());
    let folder = remote.create_folder("Backup", None).await.unwrap();
    remote.put_file(&folder, "b.txt", "world", Utc::now());
    let h = harness(root, remote, &[]).await;

    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(std::fs::read_to_string(h.root.join("b.txt")).unwrap(), "world");

    let index = h.engine.index_snapshot();
    assert_eq!(index.len(), 1);
    assert_eq!(index[0].relative_path, "b.txt");
    assert_eq!(index[0].content_hash, "7d793037a0760186574b0282f2f435e7");
    assert!(h.engine.last_sync_time().is_some());

    let leftovers: Vec<_> = std::fs::read_dir(&h.root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".drivesync-tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn ignored_files_never_move() {
    let root = make_temp_dir("drivesync-it-ignore");
    std::fs::write(root.join("x.tmp"), "scratch").unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let folder = remote.create_folder("Backup", None).await.unwrap();
    remote.put_file(&folder, "y.tmp", "theirs", Utc::now());
    let h = harness(root, remote, &[".tmp"]).await;

    h.engine.push_unsynced().await;
    h.engine
        .handle_event(ChangeEvent::new(ChangeKind::Created, h.root.join("x.tmp")))
        .await;
    for _ in 0..3 {
        h.engine.reconcile_once().await.unwrap();
    }

    assert_eq!(h.remote.file_names(&h.folder), vec!["y.tmp"]);
    assert!(h.root.join("x.tmp").exists());
    assert!(!h.root.join("y.tmp").exists());
    assert!(h.engine.index_entry("x.tmp").is_none());
    assert_eq!(h.remote.ops().mutations(), 0);
}

#[tokio::test]
async fn second_pass_without_changes_is_a_noop() {
    let root = make_temp_dir("drivesync-it-idempotent");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let folder = remote.create_folder("Backup", None).await.unwrap();
    remote.put_file(&folder, "b.txt", "world", Utc::now());
    let h = harness(root, remote, &[]).await;

    h.engine.push_unsynced().await;
    h.engine.reconcile_once().await.unwrap();
    h.remote.reset_ops();

    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(h.remote.ops().mutations(), 0);
    assert_eq!(h.remote.file_names(&h.folder), vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn own_upload_is_not_downloaded_again() {
    let root = make_temp_dir("drivesync-it-race");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;

    h.engine.push_unsynced().await;
    // The store reports a modified-time slightly after the local write.
    h.remote.put_file(&h.folder, "a.txt", "hello", later(1));

    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.downloaded, 0);
    assert_eq!(h.remote.ops().downloads, 0);
}

#[tokio::test]
async fn remote_edit_older_than_last_pass_is_not_pulled() {
    let root = make_temp_dir("drivesync-it-last-pass");
    let remote = Arc::new(MemoryRemote::new());
    let folder = remote.create_folder("Backup", None).await.unwrap();
    remote.put_file(&folder, "b.txt", "world", later(-30));
    let h = harness(root, remote, &[]).await;

    // Downloads record no upload, so only the last-pass guard is left.
    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.downloaded, 1);
    let last_pass = h.engine.last_sync_time().unwrap();

    let local_mtime = SystemTime::UNIX_EPOCH + Duration::from_secs_f64(last_pass - 1.0);
    std::fs::File::options()
        .write(true)
        .open(h.root.join("b.txt"))
        .unwrap()
        .set_modified(local_mtime)
        .unwrap();
    let remote_mtime =
        chrono::DateTime::from_timestamp_millis(((last_pass - 0.5) * 1000.0) as i64).unwrap();
    h.remote.put_file(&h.folder, "b.txt", "stale", remote_mtime);
    h.remote.reset_ops();

    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.downloaded, 0, "{report:?}");
    assert_eq!(h.remote.ops().downloads, 0);
    assert_eq!(std::fs::read_to_string(h.root.join("b.txt")).unwrap(), "world");
}

#[tokio::test]
async fn remote_edit_right_after_upload_is_pulled_once_listed() {
    let root = make_temp_dir("drivesync-it-echo-window");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    h.engine.push_unsynced().await;
    // This listing sees our own upload and closes its echo window.
    h.engine.reconcile_once().await.unwrap();

    h.remote.put_file(&h.folder, "a.txt", "edited elsewhere", later(1));
    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.downloaded, 1, "{report:?}");
    assert_eq!(
        std::fs::read_to_string(h.root.join("a.txt")).unwrap(),
        "edited elsewhere"
    );
}

#[tokio::test]
async fn remote_edit_overwrites_older_local_copy() {
    let root = make_temp_dir("drivesync-it-remote-edit");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    h.engine.push_unsynced().await;
    h.engine.reconcile_once().await.unwrap();

    h.remote.put_file(&h.folder, "a.txt", "changed elsewhere", later(10));
    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(
        std::fs::read_to_string(h.root.join("a.txt")).unwrap(),
        "changed elsewhere"
    );
}

#[tokio::test]
async fn modified_event_updates_remote_once() {
    let root = make_temp_dir("drivesync-it-modify");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    h.engine.push_unsynced().await;

    std::fs::write(h.root.join("a.txt"), "hello again").unwrap();
    let event = ChangeEvent::new(ChangeKind::Modified, h.root.join("a.txt"));
    h.engine.handle_event(event.clone()).await;
    assert_eq!(h.remote.file_content(&h.folder, "a.txt").unwrap(), b"hello again");
    assert_eq!(h.remote.ops().updates, 1);

    h.engine.handle_event(event).await;
    assert_eq!(h.remote.ops().updates, 1);
    assert_eq!(h.remote.ops().uploads, 1);
}

#[tokio::test]
async fn local_delete_removes_remote_and_index() {
    let root = make_temp_dir("drivesync-it-local-delete");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    h.engine.push_unsynced().await;

    std::fs::remove_file(h.root.join("a.txt")).unwrap();
    h.engine
        .handle_event(ChangeEvent::new(ChangeKind::Deleted, h.root.join("a.txt")))
        .await;

    assert!(h.remote.file_names(&h.folder).is_empty());
    assert!(h.engine.index_entry("a.txt").is_none());
    assert_eq!(h.engine.stats().remote_deletes_total, 1);
}

#[tokio::test]
async fn remote_delete_removes_local_copy_without_echo() {
    let root = make_temp_dir("drivesync-it-remote-delete");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    h.engine.push_unsynced().await;
    h.engine.reconcile_once().await.unwrap();

    assert!(h.remote.remove_file(&h.folder, "a.txt"));
    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.deleted_local, 1);
    assert!(!h.root.join("a.txt").exists());
    assert!(h.engine.index_entry("a.txt").is_none());

    // The watcher reports our own deletion; it must not turn into a remote call.
    h.remote.reset_ops();
    h.engine
        .handle_event(ChangeEvent::new(ChangeKind::Deleted, h.root.join("a.txt")))
        .await;
    assert_eq!(h.remote.ops(), Default::default());
}

#[tokio::test]
async fn failed_remote_delete_is_retried_not_redownloaded() {
    let root = make_temp_dir("drivesync-it-delete-retry");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    h.engine.push_unsynced().await;

    h.remote.set_fail_deletes(true);
    std::fs::remove_file(h.root.join("a.txt")).unwrap();
    h.engine
        .handle_event(ChangeEvent::new(ChangeKind::Deleted, h.root.join("a.txt")))
        .await;
    assert_eq!(h.remote.file_names(&h.folder), vec!["a.txt"]);
    assert!(h.engine.index_entry("a.txt").is_none());
    assert_eq!(h.engine.pending_remote_deletes(), vec!["a.txt"]);

    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.failed, 1);
    assert!(!h.root.join("a.txt").exists());

    h.remote.set_fail_deletes(false);
    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.deleted_remote, 1);
    assert!(h.remote.file_names(&h.folder).is_empty());
    assert!(h.engine.pending_remote_deletes().is_empty());
    assert!(!h.root.join("a.txt").exists());
}

#[tokio::test]
async fn failed_upload_is_retried_by_next_pass() {
    let root = make_temp_dir("drivesync-it-upload-retry");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;

    h.remote.set_fail_uploads(true);
    let report = h.engine.push_unsynced().await;
    assert_eq!(report.failed, 1);
    assert!(h.engine.index_entry("a.txt").is_none());
    assert!(h.engine.stats().last_error.contains("upload rejected"));

    h.remote.set_fail_uploads(false);
    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.deleted_local, 0);
    assert!(h.root.join("a.txt").exists());
    assert_eq!(h.remote.file_content(&h.folder, "a.txt").unwrap(), b"hello");
}

#[tokio::test]
async fn failed_update_is_retried_by_next_pass() {
    let root = make_temp_dir("drivesync-it-update-retry");
    std::fs::write(root.join("a.txt"), "v1").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    h.engine.push_unsynced().await;
    assert_eq!(h.remote.file_content(&h.folder, "a.txt").unwrap(), b"v1");

    std::fs::write(h.root.join("a.txt"), "v2-local-edit").unwrap();
    h.remote.set_fail_uploads(true);
    h.engine
        .handle_event(ChangeEvent::new(ChangeKind::Modified, h.root.join("a.txt")))
        .await;
    assert_eq!(h.remote.file_content(&h.folder, "a.txt").unwrap(), b"v1");

    h.remote.set_fail_uploads(false);
    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert_eq!(report.uploaded, 1, "{report:?}");
    assert_eq!(report.downloaded, 0);
    assert_eq!(
        h.remote.file_content(&h.folder, "a.txt").unwrap(),
        b"v2-local-edit"
    );

    h.remote.reset_ops();
    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(h.remote.ops().mutations(), 0);
}

#[tokio::test]
async fn touched_file_is_not_uploaded_again() {
    let root = make_temp_dir("drivesync-it-touch");
    std::fs::write(root.join("a.txt"), "hello").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    h.engine.push_unsynced().await;
    h.engine.reconcile_once().await.unwrap();

    let touched = SystemTime::now() - Duration::from_secs(120);
    std::fs::File::options()
        .write(true)
        .open(h.root.join("a.txt"))
        .unwrap()
        .set_modified(touched)
        .unwrap();
    h.remote.reset_ops();

    let report = h.engine.reconcile_once().await.unwrap().unwrap();
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(h.remote.ops().mutations(), 0);
}

#[tokio::test]
async fn nested_files_stay_local() {
    let root = make_temp_dir("drivesync-it-nested");
    std::fs::create_dir_all(root.join("sub")).unwrap();
    std::fs::write(root.join("sub").join("c.txt"), "nested").unwrap();
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;

    h.engine.push_unsynced().await;
    h.engine.reconcile_once().await.unwrap();
    assert!(h.remote.file_names(&h.folder).is_empty());
    assert!(h.root.join("sub").join("c.txt").exists());
    assert!(h.engine.index_entry("sub/c.txt").is_some());
}

#[tokio::test]
async fn missing_root_is_fatal() {
    let root = make_temp_dir("drivesync-it-missing").join("absent");
    let err = SyncEngine::connect(
        EngineSettings::new(&root, "Backup"),
        Arc::new(MemoryRemote::new()),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, SyncError::Config(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_engine_syncs_new_files_and_stops() {
    let root = make_temp_dir("drivesync-it-lifecycle");
    let h = harness(root, Arc::new(MemoryRemote::new()), &[]).await;
    assert!(matches!(h.engine.trigger_sync(), Err(SyncError::NotRunning)));

    let task = h.engine.spawn().unwrap();
    assert_eq!(h.engine.state(), EngineState::Running);
    assert!(matches!(h.engine.start().await, Err(SyncError::AlreadyRunning)));

    // Give the watcher a moment to subscribe.
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(h.root.join("new.txt"), "fresh").unwrap();
    h.engine.trigger_sync().unwrap();

    let synced = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if h.remote.file_content(&h.folder, "new.txt").as_deref() == Some(b"fresh".as_slice()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or(false);
    assert!(synced, "new.txt never reached the remote");

    h.engine.stop();
    h.engine.stop();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("engine stops promptly")
        .unwrap()
        .unwrap();
    assert_eq!(h.engine.state(), EngineState::Stopped);
}
