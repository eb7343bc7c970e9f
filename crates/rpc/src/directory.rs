//! HTTP surface of the directory node.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sharenet_files::{IndexStore, IndexStoreError};
use sharenet_types::{
    DirectoryStats, FileRecord, HeartbeatRequest, PeerId, PeerSummary, PeersResponse,
    QueryRequest, QueryResponse, SubmitReceipt, SubmitRequest,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{CredentialError, DirectoryCredentials};
use crate::error::ApiError;

/// Shared state of the directory router.
#[derive(Clone)]
pub struct DirectoryState {
    index: Arc<dyn IndexStore>,
    credentials: Arc<DirectoryCredentials>,
    started_at: Instant,
}

impl DirectoryState {
    pub fn new(index: Arc<dyn IndexStore>, credentials: DirectoryCredentials) -> Self {
        Self {
            index,
            credentials: Arc::new(credentials),
            started_at: Instant::now(),
        }
    }

    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.index
    }

    pub fn credentials(&self) -> &DirectoryCredentials {
        &self.credentials
    }

    fn check<T>(&self, endpoint: &str, result: Result<T, CredentialError>) -> Result<T, ApiError> {
        result.map_err(|err| {
            warn!("rejected {} request: {}", endpoint, err);
            err.into()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryHealth {
    pub status: String,
    pub role: String,
    pub version: String,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub stats: DirectoryStats,
}

impl From<IndexStoreError> for ApiError {
    fn from(err: IndexStoreError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_submission", err.to_string())
    }
}

pub async fn start_server(state: DirectoryState, addr: &str) -> Result<()> {
    let listener = bind_listener(addr).await?;
    serve(listener, state, std::future::pending()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: DirectoryState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(local) = listener.local_addr() {
        info!("directory listening on {}", local);
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("directory server terminated unexpectedly")
}

pub async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))
    }
}

pub fn build_router(state: DirectoryState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/peers", get(handle_peers))
        .route("/peers/:peer_id", delete(handle_remove_peer))
        .route("/peers/:peer_id/files", get(handle_peer_files))
        .route("/rpc/submit", post(handle_submit))
        .route("/rpc/query", post(handle_query))
        .route("/rpc/heartbeat", post(handle_heartbeat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_health(State(state): State<DirectoryState>) -> Json<DirectoryHealth> {
    Json(DirectoryHealth {
        status: "ok".into(),
        role: "directory".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        stats: state.index.stats(),
    })
}

async fn handle_stats(State(state): State<DirectoryState>) -> Json<DirectoryStats> {
    Json(state.index.stats())
}

async fn handle_peers(
    State(state): State<DirectoryState>,
    headers: HeaderMap,
) -> Result<Json<PeersResponse>, ApiError> {
    state.check("/peers", state.credentials.authenticate_reader(&headers))?;
    let peers = state.index.peers();
    Ok(Json(PeersResponse {
        total: peers.len(),
        peers,
    }))
}

async fn handle_peer_files(
    State(state): State<DirectoryState>,
    headers: HeaderMap,
    AxumPath(peer_id): AxumPath<String>,
) -> Result<Json<Vec<FileRecord>>, ApiError> {
    state.check("/peers/files", state.credentials.authenticate_reader(&headers))?;
    let peer_id = parse_peer_id(&peer_id)?;
    state
        .index
        .peer_files(&peer_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("peer {peer_id} is not registered")))
}

async fn handle_remove_peer(
    State(state): State<DirectoryState>,
    headers: HeaderMap,
    AxumPath(peer_id): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    state.check("/peers remove", state.credentials.authenticate_admin(&headers))?;
    let peer_id = parse_peer_id(&peer_id)?;
    if state.index.remove_peer(&peer_id) {
        info!("admin removed peer {}", peer_id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "peer {peer_id} is not registered"
        )))
    }
}

async fn handle_submit(
    State(state): State<DirectoryState>,
    headers: HeaderMap,
    request: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitReceipt>, ApiError> {
    let Json(request) = request?;
    let peer_id = state.check(
        "/rpc/submit",
        state.credentials.authenticate_as(&headers, &request.peer_id),
    )?;
    match state.index.submit(request) {
        Ok(receipt) => {
            info!(
                "peer {} submitted {} files ({} removed)",
                receipt.peer_id, receipt.files_indexed, receipt.files_removed
            );
            Ok(Json(receipt))
        }
        Err(err) => {
            warn!("rejected submission from {}: {}", peer_id, err);
            Err(err.into())
        }
    }
}

async fn handle_query(
    State(state): State<DirectoryState>,
    headers: HeaderMap,
    request: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let caller = state.check("/rpc/query", state.credentials.authenticate_peer(&headers))?;
    let Json(request) = request?;
    let results = state.index.query(&request.query, request.limit);
    debug!(
        "query {:?} from {} matched {} files",
        request.query,
        caller,
        results.len()
    );
    Ok(Json(QueryResponse {
        query: request.query,
        results,
    }))
}

async fn handle_heartbeat(
    State(state): State<DirectoryState>,
    headers: HeaderMap,
    request: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<PeerSummary>, ApiError> {
    let Json(request) = request?;
    let peer_id = state.check(
        "/rpc/heartbeat",
        state.credentials.authenticate_as(&headers, &request.peer_id),
    )?;
    state.index.heartbeat(&peer_id).map(Json).ok_or_else(|| {
        ApiError::not_found(format!(
            "peer {peer_id} is not registered; submit its files first"
        ))
    })
}

fn parse_peer_id(raw: &str) -> Result<PeerId, ApiError> {
    PeerId::parse(raw).map_err(|err| ApiError::bad_request(err.to_string()))
}
