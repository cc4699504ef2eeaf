use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

pub type ByteStream = BoxStream<'static, SyncResult<Bytes>>;

/// One file in the remote target folder, as listed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileRecord {
    pub id: String,
    pub name: String,
    pub modified_time: DateTime<Utc>,
    pub size_bytes: u64,
}

impl RemoteFileRecord {
    pub fn modified_unix(&self) -> f64 {
        self.modified_time.timestamp() as f64
            + f64::from(self.modified_time.timestamp_subsec_nanos()) / 1e9
    }
}

/// RFC3339 timestamps with optional fractional seconds and a trailing `Z`.
pub fn parse_remote_time(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::remote(format!("invalid modifiedTime {raw:?}: {e}")))
}

/// The cloud folder the engine mirrors. Identifiers are opaque; callers always
/// re-resolve them by name before update or delete.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn find_folder(&self, name: &str) -> SyncResult<Option<String>>;

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> SyncResult<String>;

    async fn list_files(&self, folder_id: &str) -> SyncResult<Vec<RemoteFileRecord>>;

    async fn find_file_by_name(&self, folder_id: &str, name: &str) -> SyncResult<Option<String>>;

    async fn upload_file(&self, local_path: &Path, folder_id: &str) -> SyncResult<String>;

    async fn update_file(&self, id: &str, local_path: &Path) -> SyncResult<()>;

    async fn delete_file(&self, id: &str) -> SyncResult<()>;

    async fn download_file(&self, id: &str) -> SyncResult<ByteStream>;
}

/// Call counters of [`MemoryRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub lists: usize,
    pub uploads: usize,
    pub updates: usize,
    pub deletes: usize,
    pub downloads: usize,
}

impl OpCounts {
    /// Operations that change either side.
    pub fn mutations(&self) -> usize {
        self.uploads + self.updates + self.deletes + self.downloads
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    folder_id: String,
    name: String,
    content: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    folders: BTreeMap<String, (String, Option<String>)>,
    files: BTreeMap<String, MemoryFile>,
    next_id: u64,
    ops: OpCounts,
    fail_uploads: bool,
    fail_deletes: bool,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }
}

/// In-process RemoteStore with a flat folder namespace, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes a file as another client would; replaces an existing one with the same name.
    pub fn put_file(
        &self,
        folder_id: &str,
        name: &str,
        content: impl Into<Vec<u8>>,
        modified: DateTime<Utc>,
    ) -> String {
        let mut st = self.lock();
        let existing = st
            .files
            .iter()
            .find(|(_, f)| f.folder_id == folder_id && f.name == name)
            .map(|(id, _)| id.clone());
        let id = existing.unwrap_or_else(|| st.next_id("file"));
        st.files.insert(
            id.clone(),
            MemoryFile {
                folder_id: folder_id.to_string(),
                name: name.to_string(),
                content: content.into(),
                modified,
            },
        );
        id
    }

    /// Removes a file as another client would.
    pub fn remove_file(&self, folder_id: &str, name: &str) -> bool {
        let mut st = self.lock();
        let before = st.files.len();
        st.files
            .retain(|_, f| !(f.folder_id == folder_id && f.name == name));
        st.files.len() != before
    }

    pub fn file_content(&self, folder_id: &str, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .values()
            .find(|f| f.folder_id == folder_id && f.name == name)
            .map(|f| f.content.clone())
    }

    pub fn file_names(&self, folder_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .files
            .values()
            .filter(|f| f.folder_id == folder_id)
            .map(|f| f.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn ops(&self) -> OpCounts {
        self.lock().ops
    }

    pub fn reset_ops(&self) {
        self.lock().ops = OpCounts::default();
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn find_folder(&self, name: &str) -> SyncResult<Option<String>> {
        Ok(self
            .lock()
            .folders
            .iter()
            .find(|(_, (n, _))| n == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> SyncResult<String> {
        let mut st = self.lock();
        let id = st.next_id("folder");
        st.folders
            .insert(id.clone(), (name.to_string(), parent_id.map(str::to_string)));
        Ok(id)
    }

    async fn list_files(&self, folder_id: &str) -> SyncResult<Vec<RemoteFileRecord>> {
        let mut st = self.lock();
        st.ops.lists += 1;
        Ok(st
            .files
            .iter()
            .filter(|(_, f)| f.folder_id == folder_id)
            .map(|(id, f)| RemoteFileRecord {
                id: id.clone(),
                name: f.name.clone(),
                modified_time: f.modified,
                size_bytes: f.content.len() as u64,
            })
            .collect())
    }

    async fn find_file_by_name(&self, folder_id: &str, name: &str) -> SyncResult<Option<String>> {
        Ok(self
            .lock()
            .files
            .iter()
            .find(|(_, f)| f.folder_id == folder_id && f.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn upload_file(&self, local_path: &Path, folder_id: &str) -> SyncResult<String> {
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| SyncError::io(local_path, e))?;
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SyncError::remote("upload path has no file name"))?;
        let mut st = self.lock();
        if st.fail_uploads {
            return Err(SyncError::remote("upload rejected"));
        }
        st.ops.uploads += 1;
        let id = st.next_id("file");
        st.files.insert(
            id.clone(),
            MemoryFile {
                folder_id: folder_id.to_string(),
                name,
                content,
                modified: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn update_file(&self, id: &str, local_path: &Path) -> SyncResult<()> {
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| SyncError::io(local_path, e))?;
        let mut st = self.lock();
        if st.fail_uploads {
            return Err(SyncError::remote("update rejected"));
        }
        st.ops.updates += 1;
        let file = st
            .files
            .get_mut(id)
            .ok_or_else(|| SyncError::remote(format!("file not found: {id}")))?;
        file.content = content;
        file.modified = Utc::now();
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> SyncResult<()> {
        let mut st = self.lock();
        if st.fail_deletes {
            return Err(SyncError::remote("delete rejected"));
        }
        st.ops.deletes += 1;
        st.files
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SyncError::remote(format!("file not found: {id}")))
    }

    async fn download_file(&self, id: &str) -> SyncResult<ByteStream> {
        let mut st = self.lock();
        st.ops.downloads += 1;
        let content = st
            .files
            .get(id)
            .map(|f| f.content.clone())
            .ok_or_else(|| SyncError::remote(format!("file not found: {id}")))?;
        let chunks: Vec<SyncResult<Bytes>> = content
            .chunks(8 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_utc_timestamps() {
        let t = parse_remote_time("2024-03-01T12:00:00.250Z").unwrap();
        let rec = RemoteFileRecord {
            id: "1".into(),
            name: "a.txt".into(),
            modified_time: t,
            size_bytes: 0,
        };
        assert_eq!(rec.modified_unix(), 1_709_294_400.25);
        assert!(parse_remote_time("yesterday").is_err());
    }

    #[tokio::test]
    async fn memory_remote_round_trips_content_by_name() {
        let remote = MemoryRemote::new();
        let folder = remote.create_folder("Sync", None).await.unwrap();
        assert_eq!(remote.find_folder("Sync").await.unwrap(), Some(folder.clone()));
        assert_eq!(remote.find_folder("Other").await.unwrap(), None);

        let id = remote.put_file(&folder, "b.txt", "world", Utc::now());
        assert_eq!(
            remote.find_file_by_name(&folder, "b.txt").await.unwrap(),
            Some(id.clone())
        );

        let mut body = Vec::new();
        let mut stream = remote.download_file(&id).await.unwrap();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"world");

        remote.set_fail_deletes(true);
        assert!(remote.delete_file(&id).await.is_err());
        remote.set_fail_deletes(false);
        remote.delete_file(&id).await.unwrap();
        assert!(remote.file_names(&folder).is_empty());
        assert_eq!(remote.ops().deletes, 1);
        assert_eq!(remote.ops().downloads, 1);
    }
}
