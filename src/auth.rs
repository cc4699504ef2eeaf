use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{SyncError, SyncResult};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/oauth2callback";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Access tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

/// OAuth client registration, as downloaded from the Google console.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> SyncResult<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            SyncError::Auth(format!("read credentials {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> SyncResult<Self> {
        let file: SecretsFile = serde_json::from_slice(raw)
            .map_err(|e| SyncError::Auth(format!("invalid credentials file: {e}")))?;
        let secrets = file.installed.or(file.web).ok_or_else(|| {
            SyncError::Auth("invalid credentials file: expected an `installed` or `web` client".into())
        })?;
        if secrets.client_id.trim().is_empty() {
            return Err(SyncError::Auth("invalid credentials file: empty client_id".into()));
        }
        Ok(secrets)
    }

    pub fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_REDIRECT_URI)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCache {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenCache {
    pub fn load(path: &Path) -> SyncResult<Option<Self>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SyncError::io(path, err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| SyncError::Auth(format!("invalid token cache {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| SyncError::Auth(format!("encode token cache: {e}")))?;
        write_atomic(path, &body)
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) <= now
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn into_cache(self, previous_refresh: Option<String>) -> TokenCache {
        TokenCache {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: Utc::now() + Duration::seconds(self.expires_in.unwrap_or(3600)),
        }
    }
}

/// Installed-app OAuth flow against Google, with an on-disk token cache.
pub struct Authenticator {
    http: reqwest::Client,
    credentials_path: PathBuf,
    token_path: PathBuf,
    token: Mutex<Option<TokenCache>>,
}

impl Authenticator {
    pub fn new(credentials_path: impl Into<PathBuf>, token_path: impl Into<PathBuf>) -> Self {
        let token_path = token_path.into();
        let token = match TokenCache::load(&token_path) {
            Ok(token) => token,
            Err(err) => {
                crate::logging::warn_kv(
                    "ignoring unreadable token cache",
                    &[("error", &err.to_string())],
                );
                None
            }
        };
        Self {
            http: reqwest::Client::new(),
            credentials_path: credentials_path.into(),
            token_path,
            token: Mutex::new(token),
        }
    }

    pub fn credentials_path(&self) -> &Path {
        &self.credentials_path
    }

    pub fn has_credentials(&self) -> bool {
        ClientSecrets::load(&self.credentials_path).is_ok()
    }

    pub fn secrets(&self) -> SyncResult<ClientSecrets> {
        ClientSecrets::load(&self.credentials_path)
    }

    /// Validates an uploaded client file and stores it as the credentials file.
    /// Nothing is written when `raw` is not a usable client registration.
    pub fn install_credentials(&self, raw: &[u8]) -> SyncResult<ClientSecrets> {
        let secrets = ClientSecrets::parse(raw)?;
        write_atomic(&self.credentials_path, raw)?;
        crate::logging::info_kv(
            "credentials saved",
            &[("path", &self.credentials_path.display().to_string())],
        );
        Ok(secrets)
    }

    /// Consent page URL; `state` is echoed back to the redirect URI.
    pub fn authorization_url(&self, state: &str) -> SyncResult<String> {
        let secrets = self.secrets()?;
        let url = url::Url::parse_with_params(
            &secrets.auth_uri,
            &[
                ("client_id", secrets.client_id.as_str()),
                ("redirect_uri", secrets.redirect_uri()),
                ("response_type", "code"),
                ("scope", DRIVE_SCOPE),
                ("access_type", "offline"),
                ("include_granted_scopes", "true"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| SyncError::Auth(format!("invalid auth_uri: {e}")))?;
        Ok(url.to_string())
    }

    pub async fn exchange_code(&self, code: &str) -> SyncResult<()> {
        let secrets = self.secrets()?;
        let params = [
            ("code", code),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
            ("redirect_uri", secrets.redirect_uri()),
            ("grant_type", "authorization_code"),
        ];
        let response = self.token_request(&secrets.token_uri, &params).await?;
        let cache = response.into_cache(None);
        cache.save(&self.token_path)?;
        *self.token.lock().await = Some(cache);
        crate::logging::info("authorization code exchanged, token saved");
        Ok(())
    }

    /// A valid bearer token, refreshing the cached one when it is about to expire.
    pub async fn access_token(&self) -> SyncResult<String> {
        let mut guard = self.token.lock().await;
        let Some(current) = guard.as_ref() else {
            return Err(SyncError::Auth("not authenticated, run login first".into()));
        };
        if !current.needs_refresh(Utc::now()) {
            return Ok(current.access_token.clone());
        }
        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(SyncError::Auth("access token expired and no refresh token".into()));
        };

        let secrets = self.secrets()?;
        let params = [
            ("refresh_token", refresh_token.as_str()),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = self.token_request(&secrets.token_uri, &params).await?;
        let cache = response.into_cache(Some(refresh_token));
        cache.save(&self.token_path)?;
        let token = cache.access_token.clone();
        *guard = Some(cache);
        crate::logging::info("access token refreshed");
        Ok(token)
    }

    pub async fn is_authenticated(&self) -> bool {
        match self.token.lock().await.as_ref() {
            Some(t) => t.refresh_token.is_some() || !t.needs_refresh(Utc::now()),
            None => false,
        }
    }

    /// Forgets the cached token, on disk and in memory.
    pub async fn clear(&self) -> SyncResult<()> {
        *self.token.lock().await = None;
        match std::fs::remove_file(&self.token_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::io(&self.token_path, err)),
        }
    }

    async fn token_request(&self, token_uri: &str, params: &[(&str, &str)]) -> SyncResult<TokenResponse> {
        let resp = self
            .http
            .post(token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| SyncError::Auth(format!("token endpoint: {e}")))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| SyncError::Auth(format!("token endpoint body: {e}")))?;
        if !status.is_success() {
            return Err(SyncError::Auth(format!(
                "token endpoint: http {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        serde_json::from_slice(&body)
            .map_err(|e| SyncError::Auth(format!("parse token response: {e}")))
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).map_err(|e| SyncError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| SyncError::io(path, e))
}
