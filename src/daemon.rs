use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::control::{ControlPlane, RemoteFactory, Supervisor};
use crate::drive::DriveClient;
use crate::engine::{EngineSettings, SyncEngine};
use crate::reconcile::PassReport;
use crate::remote::RemoteStore;
use crate::workspace::WorkspaceLock;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub http_addr: Option<String>,
    pub autostart: bool,
    pub log_path: Option<PathBuf>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            http_addr: None,
            autostart: true,
            log_path: None,
        }
    }
}

/// Remote stores backed by Google Drive, authorized through `auth`.
pub fn drive_factory() -> RemoteFactory {
    Arc::new(|_cfg: &Config, auth: Arc<Authenticator>| {
        let store: Arc<dyn RemoteStore> = Arc::new(DriveClient::new(auth));
        Ok(store)
    })
}

/// Runs the control plane (and, unless disabled, the engine) on the current
/// runtime until `shutdown` is notified.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    opts: DaemonOptions,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let stop = shutdown.notified();
    tokio::pin!(stop);
    stop.as_mut().enable();

    let mut cfg = cfg;
    let log_path = opts.log_path.clone().unwrap_or_else(|| cfg.log_path());
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info_kv(
        "daemon start",
        &[
            ("version", env!("CARGO_PKG_VERSION")),
            (
                "config",
                &cfg.config_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            ("log", &log_path.display().to_string()),
        ],
    );

    let token = cfg.ensure_control_token()?;
    let addr = opts
        .http_addr
        .clone()
        .unwrap_or_else(|| cfg.control_addr.clone());
    let supervisor = Arc::new(Supervisor::new(cfg, drive_factory()));

    let control =
        ControlPlane::start_async(&addr, token, supervisor.clone(), Some(shutdown.clone()))
            .await?;
    crate::logging::info_kv(
        "control plane listening",
        &[("addr", &control.bound_addr.to_string())],
    );

    if opts.autostart {
        match supervisor.start().await {
            Ok(_) => crate::logging::info("sync engine autostarted"),
            Err(err) => crate::logging::error_kv(
                "autostart failed, start the engine from the control surface",
                &[("error", &format!("{err:#}"))],
            ),
        }
    }

    stop.await;
    crate::logging::info("daemon shutting down");
    supervisor.shutdown().await;
    // Wake the server too in case it subscribed after the first notification.
    shutdown.notify_waiters();
    Ok(())
}

/// Start-up push plus one reconciliation pass against `remote`, without a watcher.
pub async fn sync_once(cfg: &Config, remote: Arc<dyn RemoteStore>) -> Result<PassReport> {
    let _lock = WorkspaceLock::try_lock(&cfg.local_folder)
        .with_context(|| format!("lock {}", cfg.local_folder.display()))?;
    let engine = SyncEngine::connect(EngineSettings::from_config(cfg), remote).await?;
    let pushed = engine.push_unsynced().await;
    let pass = engine
        .reconcile_once()
        .await?
        .unwrap_or_default();
    Ok(PassReport {
        downloaded: pass.downloaded,
        uploaded: pushed.uploaded + pass.uploaded,
        deleted_local: pass.deleted_local,
        deleted_remote: pass.deleted_remote,
        skipped: pass.skipped,
        failed: pushed.failed + pass.failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use std::time::SystemTime;

    #[tokio::test]
    async fn sync_once_pushes_and_pulls() {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let home = std::env::temp_dir().join(format!("drivesync-daemon-once-{nanos}"));
        let local = home.join("sync");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("a.txt"), "hello").unwrap();
        let cfg_path = home.join("config.json");
        std::fs::write(
            &cfg_path,
            format!(r#"{{"local_folder":"{}","drive_folder":"Backup"}}"#, local.display()),
        )
        .unwrap();
        let cfg = Config::load(&cfg_path).unwrap();

        let remote = Arc::new(MemoryRemote::new());
        let folder = remote.create_folder("Backup", None).await.unwrap();
        remote.put_file(&folder, "b.txt", "world", chrono::Utc::now());

        let report = sync_once(&cfg, remote.clone()).await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.downloaded, 1);
        assert_eq!(std::fs::read_to_string(local.join("b.txt")).unwrap(), "world");
        assert_eq!(remote.file_content(&folder, "a.txt").unwrap(), b"hello");
        assert!(!local.join(crate::filters::LOCK_FILE_NAME).exists());
    }
}
