pub mod auth;
pub mod config;
pub mod control;
pub mod daemon;
pub mod drive;
pub mod engine;
pub mod error;
pub mod filters;
pub mod hasher;
pub mod index;
pub mod logging;
pub mod reconcile;
pub mod remote;
pub mod telemetry;
pub mod watcher;
pub mod workspace;

pub use engine::{EngineSettings, EngineState, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use reconcile::PassReport;
pub use remote::{MemoryRemote, RemoteFileRecord, RemoteStore};
