use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::engine::{EngineSettings, EngineStatus, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::workspace::{is_locked_error, WorkspaceLock};

/// Builds the remote store for a config; swapped for an in-memory store in tests.
pub type RemoteFactory =
    Arc<dyn Fn(&Config, Arc<Authenticator>) -> SyncResult<Arc<dyn RemoteStore>> + Send + Sync>;

struct RunningEngine {
    engine: SyncEngine,
    task: JoinHandle<SyncResult<()>>,
    _lock: WorkspaceLock,
}

/// Owns at most one running engine plus the config and auth it was built from.
pub struct Supervisor {
    config: Mutex<Config>,
    auth: Mutex<Arc<Authenticator>>,
    factory: RemoteFactory,
    running: tokio::sync::Mutex<Option<RunningEngine>>,
    /// Set while an engine is being connected; `running` is not held meanwhile.
    starting: AtomicBool,
}

/// Clears the starting flag however `Supervisor::start` returns.
struct StartingGuard<'a>(&'a AtomicBool);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Supervisor {
    pub fn new(config: Config, factory: RemoteFactory) -> Self {
        let auth = Arc::new(Authenticator::new(&config.credentials_path, &config.token_path));
        Self {
            config: Mutex::new(config),
            auth: Mutex::new(auth),
            factory,
            running: tokio::sync::Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> Config {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn authenticator(&self) -> Arc<Authenticator> {
        self.auth.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-reads the config file (when there is one) so edits apply on the next start.
    fn reload_config(&self) -> anyhow::Result<Config> {
        let current = self.config();
        let Some(path) = current.config_path.clone() else {
            return Ok(current);
        };
        let fresh = Config::load(&path)?;
        self.replace_config(fresh.clone());
        Ok(fresh)
    }

    fn replace_config(&self, cfg: Config) {
        let mut guard = self.config.lock().unwrap_or_else(|e| e.into_inner());
        if guard.credentials_path != cfg.credentials_path || guard.token_path != cfg.token_path {
            *self.auth.lock().unwrap_or_else(|e| e.into_inner()) =
                Arc::new(Authenticator::new(&cfg.credentials_path, &cfg.token_path));
        }
        *guard = cfg;
    }

    pub async fn start(&self) -> anyhow::Result<EngineStatus> {
        let finished = {
            let mut running = self.running.lock().await;
            if let Some(current) = running.as_ref() {
                if !current.task.is_finished() {
                    return Err(SyncError::AlreadyRunning.into());
                }
            }
            if self.starting.swap(true, Ordering::SeqCst) {
                return Err(SyncError::AlreadyRunning.into());
            }
            running.take()
        };
        let _starting = StartingGuard(&self.starting);
        if let Some(finished) = finished {
            log_exit(finished.task.await);
        }

        let started = self.connect_engine().await?;
        let status = started.engine.status();
        *self.running.lock().await = Some(started);
        Ok(status)
    }

    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::SeqCst)
    }

    /// Builds, connects and spawns an engine for the current config.
    async fn connect_engine(&self) -> anyhow::Result<RunningEngine> {
        let cfg = self.reload_config()?;
        if !cfg.local_folder.is_dir() {
            return Err(SyncError::Config(format!(
                "local folder does not exist: {}",
                cfg.local_folder.display()
            ))
            .into());
        }
        let lock = WorkspaceLock::try_lock(&cfg.local_folder)?;
        let remote = (self.factory)(&cfg, self.authenticator())?;
        let engine = SyncEngine::connect(EngineSettings::from_config(&cfg), remote).await?;
        let task = engine.spawn()?;
        Ok(RunningEngine {
            engine,
            task,
            _lock: lock,
        })
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let Some(current) = self.running.lock().await.take() else {
            return Err(SyncError::NotRunning.into());
        };
        current.engine.stop();
        log_exit(current.task.await);
        Ok(())
    }

    pub async fn sync_now(&self) -> anyhow::Result<()> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(current) => Ok(current.engine.trigger_sync()?),
            None => Err(SyncError::NotRunning.into()),
        }
    }

    pub async fn engine_status(&self) -> Option<EngineStatus> {
        let running = self.running.lock().await;
        running.as_ref().map(|r| r.engine.status())
    }

    /// Validates, persists and adopts a new config; a running engine keeps the old one.
    pub fn update_config(&self, update: Config) -> anyhow::Result<Config> {
        let current = self.config();
        let mut cfg = update;
        cfg.config_path = current.config_path.clone();
        cfg.control_token = current.control_token.clone();
        cfg.normalize();
        cfg.validate()?;
        if let Some(path) = cfg.config_path.as_deref() {
            cfg.save(path)?;
        }
        self.replace_config(cfg.clone());
        crate::logging::info("configuration updated");
        Ok(cfg)
    }

    /// Stops the engine if one is running.
    pub async fn shutdown(&self) {
        if let Err(err) = self.stop().await {
            if !matches!(err.downcast_ref::<SyncError>(), Some(SyncError::NotRunning)) {
                crate::logging::error(format!("stopping sync engine: {err:#}"));
            }
        }
    }
}

fn log_exit(res: Result<SyncResult<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => crate::logging::error(format!("sync engine exited: {err}")),
        Err(err) => crate::logging::error(format!("sync engine task failed: {err}")),
    }
}

#[derive(Clone, Debug)]
pub struct ControlPlane {
    state: Arc<ControlState>,
    bound_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct ControlPlaneStartResult {
    pub control_plane: ControlPlane,
    pub bound_addr: SocketAddr,
}

pub struct ControlState {
    token: String,
    supervisor: Arc<Supervisor>,
    oauth_state: Mutex<Option<String>>,
}

impl std::fmt::Debug for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlState")
            .field("token", &"[redacted]")
            .finish()
    }
}

impl ControlState {
    pub fn new(token: String, supervisor: Arc<Supervisor>) -> Arc<Self> {
        Arc::new(Self {
            token,
            supervisor,
            oauth_state: Mutex::new(None),
        })
    }
}

/// Routes of the control surface; everything but status and the OAuth
/// redirect needs the bearer token.
pub fn router(state: Arc<ControlState>) -> Router {
    let authenticated_routes = Router::new()
        .route("/v1/start", post(start_engine))
        .route("/v1/stop", post(stop_engine))
        .route("/v1/sync/now", post(sync_now))
        .route("/v1/config", get(get_config).post(update_config))
        .route("/v1/auth/status", get(auth_status))
        .route("/v1/auth/url", get(auth_url))
        .route("/v1/credentials", post(upload_credentials))
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/v1/status", get(status))
        .route("/oauth2callback", get(oauth_callback))
        .with_state(state)
        .merge(authenticated_routes)
}

impl ControlPlane {
    /// Binds the control surface, falling back to an OS-assigned port when the
    /// requested one is taken.
    pub async fn start_async(
        addr: &str,
        token: String,
        supervisor: Arc<Supervisor>,
        shutdown: Option<Arc<Notify>>,
    ) -> anyhow::Result<ControlPlaneStartResult> {
        crate::logging::info_kv("control plane starting", &[("requested_addr", addr)]);

        let requested_addr: SocketAddr = addr.parse().map_err(|e| {
            anyhow::anyhow!("invalid address '{addr}': {e} (use numeric IP, not hostname)")
        })?;

        let (listener, bound_addr) = match tokio::net::TcpListener::bind(requested_addr).await {
            Ok(listener) => {
                let bound = listener.local_addr()?;
                (listener, bound)
            }
            Err(e) => {
                crate::logging::info_kv(
                    "control plane requested port unavailable, trying fallback",
                    &[
                        ("requested_addr", &requested_addr.to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                let fallback_addr = SocketAddr::new(requested_addr.ip(), 0);
                let listener = tokio::net::TcpListener::bind(fallback_addr)
                    .await
                    .map_err(|fallback_err| {
                        anyhow::anyhow!(
                            "failed to bind control plane: requested {requested_addr} failed ({e}), fallback failed ({fallback_err})"
                        )
                    })?;
                let bound = listener.local_addr()?;
                (listener, bound)
            }
        };

        let state = ControlState::new(token, supervisor);
        let app = router(state.clone());

        tokio::spawn(async move {
            let result = match shutdown {
                Some(shutdown) => {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            shutdown.notified().await;
                        })
                        .await
                }
                None => axum::serve(listener, app).await,
            };
            if let Err(e) = result {
                crate::logging::error(format!("control plane server error: {e}"));
            }
            crate::logging::info("control plane server stopped");
        });

        crate::logging::info_kv(
            "control plane started",
            &[("bound_addr", &bound_addr.to_string())],
        );

        Ok(ControlPlaneStartResult {
            control_plane: ControlPlane { state, bound_addr },
            bound_addr,
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.state.supervisor
    }
}

async fn auth_middleware(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let expected = format!("Bearer {}", state.token);
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if value.to_str().map(|v| v == expected).unwrap_or(false) {
            return next.run(req).await;
        }
    }
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

fn error_response(err: anyhow::Error) -> Response {
    let status = if is_locked_error(&err) {
        StatusCode::CONFLICT
    } else {
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::AlreadyRunning | SyncError::NotRunning | SyncError::Config(_)) => {
                StatusCode::BAD_REQUEST
            }
            Some(SyncError::Auth(_)) => StatusCode::UNAUTHORIZED,
            Some(_) => StatusCode::BAD_GATEWAY,
            None => StatusCode::BAD_REQUEST,
        }
    };
    (
        status,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[derive(Serialize, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(rename = "ts")]
    timestamp: String,
    version: String,
    running: bool,
    starting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    engine: Option<serde_json::Value>,
}

async fn status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let engine = state.supervisor.engine_status().await;
    Json(StatusResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running: engine.is_some(),
        starting: state.supervisor.is_starting(),
        engine: engine.and_then(|e| serde_json::to_value(e).ok()),
    })
}

async fn start_engine(State(state): State<Arc<ControlState>>) -> Response {
    match state.supervisor.start().await {
        Ok(engine) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "started", "engine": engine })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn stop_engine(State(state): State<Arc<ControlState>>) -> Response {
    match state.supervisor.stop().await {
        Ok(()) => Json(serde_json::json!({ "status": "stopped" })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn sync_now(State(state): State<Arc<ControlState>>) -> Response {
    match state.supervisor.sync_now().await {
        Ok(()) => Json(serde_json::json!({ "status": "sync triggered" })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_config(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let mut cfg = state.supervisor.config();
    cfg.control_token = None;
    Json(cfg)
}

async fn update_config(
    State(state): State<Arc<ControlState>>,
    Json(update): Json<Config>,
) -> Response {
    match state.supervisor.update_config(update) {
        Ok(mut cfg) => {
            cfg.control_token = None;
            Json(cfg).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn auth_status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let auth = state.supervisor.authenticator();
    let authenticated = auth.is_authenticated().await;
    Json(serde_json::json!({
        "credentials": auth.has_credentials(),
        "authenticated": authenticated,
    }))
}

async fn auth_url(State(state): State<Arc<ControlState>>) -> Response {
    let nonce = Uuid::new_v4().simple().to_string();
    match state.supervisor.authenticator().authorization_url(&nonce) {
        Ok(url) => {
            *state.oauth_state.lock().unwrap_or_else(|e| e.into_inner()) = Some(nonce);
            Json(serde_json::json!({ "url": url })).into_response()
        }
        Err(err) => error_response(err.into()),
    }
}

async fn upload_credentials(State(state): State<Arc<ControlState>>, body: Bytes) -> Response {
    match state.supervisor.authenticator().install_credentials(&body) {
        Ok(secrets) => Json(serde_json::json!({
            "status": "saved",
            "client_id": secrets.client_id,
        }))
        .into_response(),
        Err(SyncError::Auth(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": msg })),
        )
            .into_response(),
        Err(err) => error_response(err.into()),
    }
}

#[derive(Deserialize)]
struct OAuthCallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<OAuthCallbackQuery>,
) -> Response {
    if let Some(err) = q.error {
        return (StatusCode::BAD_REQUEST, format!("authorization failed: {err}")).into_response();
    }
    let Some(code) = q.code.filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing code").into_response();
    };
    let expected = state
        .oauth_state
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if expected.is_some() && expected != q.state {
        return (StatusCode::BAD_REQUEST, "state mismatch").into_response();
    }
    match state.supervisor.authenticator().exchange_code(&code).await {
        Ok(()) => (
            StatusCode::OK,
            "Authorization complete. You can close this window.",
        )
            .into_response(),
        Err(err) => error_response(err.into()),
    }
}
