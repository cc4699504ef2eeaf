//! Google Drive v3 implementation of [`RemoteStore`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::auth::Authenticator;
use crate::error::{SyncError, SyncResult};
use crate::remote::{parse_remote_time, ByteStream, RemoteFileRecord, RemoteStore};

pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const LIST_FIELDS: &str = "nextPageToken,files(id,name,modifiedTime,size,mimeType)";
const PAGE_SIZE: &str = "1000";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    modified_time: Option<String>,
    /// Decimal string; absent for native Google documents.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    mime_type: String,
}

impl DriveFile {
    fn into_record(self) -> SyncResult<RemoteFileRecord> {
        let modified_time = match self.modified_time.as_deref() {
            Some(raw) => parse_remote_time(raw)?,
            None => chrono::DateTime::UNIX_EPOCH,
        };
        let size_bytes = self
            .size
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(RemoteFileRecord {
            id: self.id,
            name: self.name,
            modified_time,
            size_bytes,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

pub struct DriveClient {
    http: reqwest::Client,
    auth: Arc<Authenticator>,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub fn new(auth: Arc<Authenticator>) -> Self {
        Self::with_base_urls(auth, DRIVE_API_BASE, DRIVE_UPLOAD_BASE)
    }

    pub fn with_base_urls(auth: Arc<Authenticator>, api_base: &str, upload_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
        }
    }

    async fn request(&self, method: Method, url: &str) -> SyncResult<RequestBuilder> {
        let token = self.auth.access_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn query_files(&self, q: &str, fields: &str) -> SyncResult<Vec<DriveFile>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", q.to_string()),
                ("fields", fields.to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
                ("spaces", "drive".to_string()),
            ];
            if let Some(token) = page_token.take() {
                params.push(("pageToken", token));
            }
            let url = format!("{}/files", self.api_base);
            let resp = self
                .request(Method::GET, &url)
                .await?
                .query(&params)
                .send()
                .await?;
            let page: FileList = check(resp, "list files").await?.json().await?;
            out.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn send_content(
        &self,
        method: Method,
        url: &str,
        content_type: String,
        body: Vec<u8>,
        op: &str,
    ) -> SyncResult<Response> {
        let resp = self
            .request(method, url)
            .await?
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        check(resp, op).await
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn find_folder(&self, name: &str) -> SyncResult<Option<String>> {
        let q = format!(
            "mimeType='{FOLDER_MIME_TYPE}' and name='{}' and trashed=false",
            escape_query(name)
        );
        let files = self.query_files(&q, "nextPageToken,files(id,name)").await?;
        Ok(files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> SyncResult<String> {
        let mut meta = serde_json::json!({ "name": name, "mimeType": FOLDER_MIME_TYPE });
        if let Some(parent) = parent_id {
            meta["parents"] = serde_json::json!([parent]);
        }
        let url = format!("{}/files?fields=id", self.api_base);
        let resp = self
            .request(Method::POST, &url)
            .await?
            .json(&meta)
            .send()
            .await?;
        let created: CreatedFile = check(resp, "create folder").await?.json().await?;
        Ok(created.id)
    }

    async fn list_files(&self, folder_id: &str) -> SyncResult<Vec<RemoteFileRecord>> {
        let q = format!("'{}' in parents and trashed=false", escape_query(folder_id));
        self.query_files(&q, LIST_FIELDS)
            .await?
            .into_iter()
            .filter(|f| f.mime_type != FOLDER_MIME_TYPE)
            .map(DriveFile::into_record)
            .collect()
    }

    async fn find_file_by_name(&self, folder_id: &str, name: &str) -> SyncResult<Option<String>> {
        let q = format!(
            "name='{}' and '{}' in parents and trashed=false and mimeType!='{FOLDER_MIME_TYPE}'",
            escape_query(name),
            escape_query(folder_id)
        );
        let files = self.query_files(&q, "nextPageToken,files(id,name)").await?;
        Ok(files.into_iter().next().map(|f| f.id))
    }

    async fn upload_file(&self, local_path: &Path, folder_id: &str) -> SyncResult<String> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::remote("upload path has no UTF-8 file name"))?;
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| SyncError::io(local_path, e))?;
        let meta = serde_json::json!({ "name": name, "parents": [folder_id] });
        let boundary = format!("drivesync-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &meta, &content);
        let url = format!("{}/files?uploadType=multipart&fields=id", self.upload_base);
        let resp = self
            .send_content(
                Method::POST,
                &url,
                format!("multipart/related; boundary={boundary}"),
                body,
                "upload file",
            )
            .await?;
        let created: CreatedFile = resp.json().await?;
        Ok(created.id)
    }

    async fn update_file(&self, id: &str, local_path: &Path) -> SyncResult<()> {
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| SyncError::io(local_path, e))?;
        let url = format!("{}/files/{id}?uploadType=media", self.upload_base);
        self.send_content(
            Method::PATCH,
            &url,
            "application/octet-stream".to_string(),
            content,
            "update file",
        )
        .await?;
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> SyncResult<()> {
        let url = format!("{}/files/{id}", self.api_base);
        let resp = self.request(Method::DELETE, &url).await?.send().await?;
        check(resp, "delete file").await?;
        Ok(())
    }

    async fn download_file(&self, id: &str) -> SyncResult<ByteStream> {
        let url = format!("{}/files/{id}?alt=media", self.api_base);
        let resp = self.request(Method::GET, &url).await?.send().await?;
        let resp = check(resp, "download file").await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(SyncError::from))
            .boxed())
    }
}

/// Maps non-2xx responses to typed errors; 401 means the token is no longer valid.
async fn check(resp: Response, op: &str) -> SyncResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return Err(SyncError::Auth(format!("{op}: http {status}: {body}")));
    }
    Err(SyncError::remote(format!("{op}: http {status}: {body}")))
}

/// Quotes a value for a Drive `q` string literal.
pub fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related(boundary: &str, meta: &serde_json::Value, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(meta.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
