use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub local_folder: PathBuf,
    pub drive_folder: String,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_token: Option<String>,
    #[serde(default)]
    pub credentials_path: PathBuf,
    #[serde(default)]
    pub token_path: PathBuf,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_control_addr() -> String {
    DEFAULT_CONTROL_ADDR.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg = Self::parse(&data)?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(data: &str) -> Result<Self> {
        serde_json::from_str(data).context("parse config json")
    }

    /// Directory holding the config file; relative paths resolve against it.
    pub fn base_dir(&self) -> PathBuf {
        self.config_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn log_path(&self) -> PathBuf {
        self.base_dir().join("logs").join("drivesync.log")
    }

    pub fn normalize(&mut self) {
        let base = self.base_dir();
        self.drive_folder = self.drive_folder.trim().to_string();
        self.local_folder = resolve(&base, &self.local_folder);
        if self.credentials_path.as_os_str().is_empty() {
            self.credentials_path = base.join("credentials.json");
        } else {
            self.credentials_path = resolve(&base, &self.credentials_path);
        }
        if self.token_path.as_os_str().is_empty() {
            self.token_path = base.join("token.json");
        } else {
            self.token_path = resolve(&base, &self.token_path);
        }
        self.ignore_patterns = self
            .ignore_patterns
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_folder.as_os_str().is_empty() {
            anyhow::bail!("local_folder is required");
        }
        if self.drive_folder.is_empty() {
            anyhow::bail!("drive_folder is required");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }
        self.control_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("control_addr {:?}", self.control_addr))?;
        Ok(())
    }

    /// Pretty JSON, written to a temp file and renamed over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(self).context("encode config json")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }

    /// Generates and persists a control token when the config has none.
    pub fn ensure_control_token(&mut self) -> Result<String> {
        if let Some(token) = self.control_token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(token.clone());
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.control_token = Some(token.clone());
        if let Some(path) = self.config_path.clone() {
            self.save(&path)?;
        }
        Ok(token)
    }
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_relative() && !p.as_os_str().is_empty() {
        base.join(p)
    } else {
        p.to_path_buf()
    }
}
