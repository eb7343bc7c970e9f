use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sharenet_files::SharedFolder;
use sharenet_rpc::{bind_listener, ApiError, DirectoryClient};
use sharenet_security::{Identity, SessionManager};
use sharenet_types::{normalize_address, FileRecord, PeerId, PeersResponse};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::PeerConfig;
use crate::gateway::{auth_rejection, require_session, Authenticated};
use crate::indexer::{HeartbeatOutcome, IndexError, IndexReport, PeerIndexer};
use crate::search::{SearchError, SearchRequest, SearchResponse, SearchResolver};
use crate::transfer::{TransferError, TransferService, UploadReport};

/// Multipart framing allowance on top of the file size limit.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Clone)]
pub struct PeerState {
    inner: Arc<PeerStateInner>,
}

struct PeerStateInner {
    sessions: Arc<SessionManager>,
    indexer: Arc<PeerIndexer>,
    search: SearchResolver,
    transfer: TransferService,
    started_at: Instant,
}

impl PeerState {
    /// Wire up a peer advertising `address` to the directory.
    pub fn new(
        config: &PeerConfig,
        address: &str,
        directory: Arc<dyn DirectoryClient>,
    ) -> Result<Self> {
        let peer_id = PeerId::parse(&config.peer_id)
            .with_context(|| format!("invalid peer_id {:?}", config.peer_id))?;
        let address = normalize_address(address)
            .with_context(|| format!("invalid advertised address {address:?}"))?;

        let identity = Identity::new(peer_id.clone(), config.username.trim(), &config.password);
        let sessions = Arc::new(SessionManager::new(identity, &config.security));
        let folder = SharedFolder::new(&config.shared_dir, peer_id);
        folder.ensure_exists().with_context(|| {
            format!(
                "failed to create shared folder {}",
                config.shared_dir.display()
            )
        })?;
        let indexer = Arc::new(PeerIndexer::new(
            folder,
            config.username.trim(),
            address,
            directory.clone(),
        ));

        Ok(Self {
            inner: Arc::new(PeerStateInner {
                search: SearchResolver::new(sessions.clone(), directory),
                transfer: TransferService::new(
                    sessions.clone(),
                    indexer.clone(),
                    config.upload_policy(),
                ),
                sessions,
                indexer,
                started_at: Instant::now(),
            }),
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn indexer(&self) -> &PeerIndexer {
        &self.inner.indexer
    }

    pub fn search(&self) -> &SearchResolver {
        &self.inner.search
    }

    pub fn transfer(&self) -> &TransferService {
        &self.inner.transfer
    }
}

/// A peer bound to its listening socket, ready to serve.
pub struct PeerServer {
    listener: tokio::net::TcpListener,
    state: PeerState,
    heartbeat_interval: Option<Duration>,
}

impl PeerServer {
    pub async fn bind(config: &PeerConfig, directory: Arc<dyn DirectoryClient>) -> Result<Self> {
        let listener = bind_listener(&config.listen).await?;
        let local = listener
            .local_addr()
            .context("failed to read bound peer address")?;
        let address = match &config.public_url {
            Some(url) => url.clone(),
            None => advertised_address(local),
        };
        let state = PeerState::new(config, &address, directory)?;
        Ok(Self {
            listener,
            state,
            heartbeat_interval: config.heartbeat_interval(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read bound peer address")
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            "peer {} listening on {} (advertised as {})",
            self.state.indexer().peer_id(),
            self.local_addr()?,
            self.state.indexer().address()
        );
        let heartbeats = self.heartbeat_interval.map(|interval| {
            info!("sending directory heartbeats every {}s", interval.as_secs());
            tokio::spawn(self.state.inner.indexer.clone().run_heartbeats(interval))
        });
        let result = axum::serve(self.listener, build_router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
            .context("peer server terminated unexpectedly");
        if let Some(task) = heartbeats {
            task.abort();
        }
        result
    }
}

/// Base URL for a socket; unspecified addresses are advertised as loopback.
pub fn advertised_address(local: SocketAddr) -> String {
    let ip = if local.ip().is_unspecified() {
        match local.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        }
    } else {
        local.ip()
    };
    format!("http://{}", SocketAddr::new(ip, local.port()))
}

pub fn build_router(state: PeerState) -> Router {
    let upload_limit = state
        .transfer()
        .policy()
        .max_file_size()
        .saturating_add(MULTIPART_OVERHEAD)
        .min(usize::MAX as u64) as usize;

    let protected = Router::new()
        .route("/scan", post(handle_scan))
        .route("/index", post(handle_index))
        .route("/heartbeat", post(handle_heartbeat))
        .route("/search", post(handle_search))
        .route("/files", get(handle_files))
        .route("/network", get(handle_network))
        .route("/download/:filename", get(handle_download))
        .route(
            "/upload",
            post(handle_upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/logout", post(handle_logout))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route("/health", get(handle_health))
        .route("/login", post(handle_login))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl From<IndexError> for ApiError {
    fn from(err: IndexError) -> Self {
        match &err {
            IndexError::ScanFailed(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "scan_failed",
                err.to_string(),
            ),
            IndexError::SubmitFailed(_) => ApiError::bad_gateway(err.to_string()),
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        match &err {
            SearchError::Unauthenticated(auth) => auth_rejection(auth),
            SearchError::Directory(_) => ApiError::bad_gateway(err.to_string()),
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match &err {
            TransferError::Unauthenticated(auth) => auth_rejection(auth),
            TransferError::NotFound(_) => ApiError::not_found(err.to_string()),
            TransferError::InvalidName(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_name", err.to_string())
            }
            TransferError::Empty => {
                ApiError::new(StatusCode::BAD_REQUEST, "empty_file", err.to_string())
            }
            TransferError::Malformed(_) => ApiError::bad_request(err.to_string()),
            TransferError::TooLarge { .. } => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "file_too_large",
                err.to_string(),
            ),
            TransferError::Io(_) => ApiError::internal(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    role: &'static str,
    version: &'static str,
    peer_id: String,
    address: String,
    uptime_secs: u64,
    shared_files: usize,
    active_sessions: usize,
}

async fn handle_health(State(state): State<PeerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        role: "peer",
        version: env!("CARGO_PKG_VERSION"),
        peer_id: state.indexer().peer_id().to_string(),
        address: state.indexer().address().to_string(),
        uptime_secs: state.inner.started_at.elapsed().as_secs(),
        shared_files: state.indexer().cached_count().unwrap_or(0),
        active_sessions: state.sessions().active_sessions(),
    })
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    peer_id: String,
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct PeerInfo {
    peer_id: String,
    username: String,
    address: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum LoginIndexOutcome {
    Indexed {
        files_indexed: usize,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    peer_info: PeerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    index: LoginIndexOutcome,
}

async fn handle_login(
    State(state): State<PeerState>,
    request: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(request) = request?;
    let session = state
        .sessions()
        .login(&request.peer_id, &request.username, &request.password)
        .map_err(|err| auth_rejection(&err))?;
    info!("{} logged in", session.peer_id);

    let index = match state.indexer().index(true).await {
        Ok(report) => LoginIndexOutcome::Indexed {
            files_indexed: report.files_indexed,
        },
        Err(err) => {
            warn!("index on login failed: {}", err);
            LoginIndexOutcome::Failed {
                error: err.to_string(),
            }
        }
    };

    Ok(Json(LoginResponse {
        peer_info: PeerInfo {
            peer_id: session.peer_id.to_string(),
            username: session.username.clone(),
            address: state.indexer().address().to_string(),
        },
        token: session.token,
        expires_at: session.expires_at,
        index,
    }))
}

#[derive(Debug, Serialize)]
struct LogoutResponse {
    message: String,
    peer_id: String,
}

async fn handle_logout(
    State(state): State<PeerState>,
    Extension(auth): Extension<Authenticated>,
) -> Result<Json<LogoutResponse>, ApiError> {
    let session = state
        .sessions()
        .logout(&auth.token)
        .map_err(|err| auth_rejection(&err))?;
    info!("{} logged out", session.peer_id);
    Ok(Json(LogoutResponse {
        message: "logged out".into(),
        peer_id: session.peer_id.to_string(),
    }))
}

#[derive(Debug, Serialize)]
struct FilesResponse {
    peer_id: String,
    total: usize,
    files: Vec<FileRecord>,
}

async fn handle_scan(State(state): State<PeerState>) -> Result<Json<FilesResponse>, ApiError> {
    let files = state.indexer().scan().await?;
    Ok(Json(FilesResponse {
        peer_id: state.indexer().peer_id().to_string(),
        total: files.len(),
        files,
    }))
}

async fn handle_files(State(state): State<PeerState>) -> Result<Json<FilesResponse>, ApiError> {
    let files = state.indexer().local_files().await?;
    Ok(Json(FilesResponse {
        peer_id: state.indexer().peer_id().to_string(),
        total: files.len(),
        files,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexRequest {
    #[serde(default)]
    force_rescan: bool,
}

/// An empty body means the defaults; anything else must be a valid request.
async fn handle_index(
    State(state): State<PeerState>,
    body: Bytes,
) -> Result<Json<IndexReport>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        IndexRequest::default()
    } else {
        let Json(request) = Json::<IndexRequest>::from_bytes(&body)?;
        request
    };
    Ok(Json(state.indexer().index(request.force_rescan).await?))
}

async fn handle_heartbeat(
    State(state): State<PeerState>,
) -> Result<Json<HeartbeatOutcome>, ApiError> {
    Ok(Json(state.indexer().heartbeat().await?))
}

async fn handle_search(
    State(state): State<PeerState>,
    Extension(auth): Extension<Authenticated>,
    request: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(request) = request?;
    let response = state
        .search()
        .search(&auth.token, &request.query, request.limit)
        .await?;
    Ok(Json(response))
}

async fn handle_network(
    State(state): State<PeerState>,
    Extension(auth): Extension<Authenticated>,
) -> Result<Json<PeersResponse>, ApiError> {
    Ok(Json(state.search().network(&auth.token).await?))
}

async fn handle_download(
    State(state): State<PeerState>,
    Extension(auth): Extension<Authenticated>,
    AxumPath(filename): AxumPath<String>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    Ok(state
        .transfer()
        .download(&auth.token, &filename, request)
        .await?)
}

async fn handle_upload(
    State(state): State<PeerState>,
    Extension(auth): Extension<Authenticated>,
    mut multipart: Multipart,
) -> Result<Json<UploadReport>, ApiError> {
    let max = state.transfer().policy().max_file_size();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::from(multipart_error(err, max)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request("file field has no filename"))?;
        let chunks = Box::pin(field.map_err(move |err| multipart_error(err, max)));
        let report = state
            .transfer()
            .upload(&auth.token, &filename, chunks)
            .await?;
        return Ok(Json(report));
    }
    Err(ApiError::bad_request("multipart field \"file\" is required"))
}

fn multipart_error(err: MultipartError, max: u64) -> TransferError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        TransferError::TooLarge { max }
    } else {
        TransferError::Malformed(err.body_text())
    }
}
