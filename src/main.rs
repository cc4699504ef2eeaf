use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drivesync_rs::auth::Authenticator;
use drivesync_rs::config::Config;
use drivesync_rs::daemon::{self, DaemonOptions};
use drivesync_rs::drive::DriveClient;

#[derive(Parser, Debug)]
#[command(name = "drivesync-rs", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control surface and the sync engine until Ctrl+C
    Daemon {
        /// Control surface address (overrides control_addr)
        #[arg(long = "http-addr")]
        http_addr: Option<String>,
        /// Wait for POST /v1/start instead of starting the engine right away
        #[arg(long = "no-autostart")]
        no_autostart: bool,
    },
    /// Push unsynced files, run one reconciliation pass and exit
    Sync,
    /// Authorize access to Google Drive
    Login,
    /// Forget the saved Google Drive token
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Commands::Daemon {
            http_addr,
            no_autostart,
        } => {
            let shutdown = Arc::new(tokio::sync::Notify::new());
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal.notify_waiters();
                }
            });
            let opts = DaemonOptions {
                http_addr,
                autostart: !no_autostart,
                log_path: None,
            };
            daemon::run_daemon_with_shutdown(cfg, opts, shutdown).await?;
        }
        Commands::Sync => {
            drivesync_rs::logging::init_log_file(&cfg.log_path())?;
            let auth = Arc::new(Authenticator::new(&cfg.credentials_path, &cfg.token_path));
            let report = daemon::sync_once(&cfg, Arc::new(DriveClient::new(auth))).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed > 0 {
                anyhow::bail!("{} file(s) failed to sync", report.failed);
            }
        }
        Commands::Login => {
            let auth = Authenticator::new(&cfg.credentials_path, &cfg.token_path);
            let state = uuid::Uuid::new_v4().simple().to_string();
            let url = auth.authorization_url(&state)?;
            println!("Open this URL in your browser and authorize access:\n\n{url}\n");
            println!("Paste the `code` parameter from the redirect URL:");
            let mut code = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut code)
                .context("read authorization code")?;
            let code = code.trim();
            if code.is_empty() {
                anyhow::bail!("no authorization code entered");
            }
            auth.exchange_code(code).await?;
            println!("Login successful, token saved to {}", cfg.token_path.display());
        }
        Commands::Logout => {
            let auth = Authenticator::new(&cfg.credentials_path, &cfg.token_path);
            auth.clear().await?;
            println!("Logged out");
        }
    }

    Ok(())
}
