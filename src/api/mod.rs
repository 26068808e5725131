//! HTTP front door: ledger reads, signed mutations, the SSE event stream
//! and the inbound WebSocket peer bridge.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::body::Bytes;
use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::deliberation::DeliberationEngine;
use crate::errors::NodeError;
use crate::events::EventBus;
use crate::identity::{auth, NodeIdentity};
use crate::ledger::worker::LedgerHandle;
use crate::p2p::mesh::Mesh;
use crate::types::{Proposal, ProposalCategory, Transaction, TxKind};

/// SSE heartbeat cadence.
const HEARTBEAT: Duration = Duration::from_secs(15);

pub struct AppState {
    pub identity: Arc<NodeIdentity>,
    pub ledger: LedgerHandle,
    pub engine: Arc<DeliberationEngine>,
    pub events: EventBus,
    pub mesh: Arc<Mesh>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self { success: true, data: Some(data), error: None })
    }
}

/// Error carrying its HTTP status; every handler funnels through this.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        Self {
            status: StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ApiResponse::<Value> {
            success: false,
            data: None,
            error: Some(self.message),
        });
        (self.status, body).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/ledger/blocks", get(list_blocks))
        .route("/api/ledger/transactions", get(list_transactions))
        .route("/api/ledger/tx/:id", get(get_tx))
        .route("/api/wallet", get(get_wallet))
        .route("/api/tx", post(submit_tx))
        .route("/api/proposal", post(submit_proposal))
        .route("/api/events", get(sse_events))
        .route("/api/peers", get(list_peers).post(add_peer))
        .route("/ws/p2p", get(ws_p2p))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Signed-request verification -------------------------------------------

/// Validate the `X-Pubkey`/`X-Timestamp`/`X-Signature` headers against the
/// canonical request string; returns the authenticated pubkey.
fn verify_signed(
    headers: &HeaderMap,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<String, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ApiError {
                status: StatusCode::UNAUTHORIZED,
                message: format!("missing {name} header"),
            })
    };
    let pubkey = header("x-pubkey")?;
    let signature = header("x-signature")?;
    let timestamp: i64 = header("x-timestamp")?
        .parse()
        .map_err(|_| ApiError::bad_request("x-timestamp is not a unix timestamp"))?;

    let body_value: Value = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("bad json body: {e}")))?
    };

    let now = chrono::Utc::now().timestamp();
    auth::verify_request(&pubkey, &signature, method, path, timestamp, &body_value, now)
        .map_err(|e| ApiError::from(NodeError::Auth(e)))?;
    Ok(pubkey)
}

// --- Read handlers ---------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.ledger.snapshot();
    ApiResponse::ok(json!({
        "status": "ok",
        "node_id": state.identity.node_id(),
        "head_height": snapshot.head_height,
        "head_hash": snapshot.head_hash,
    }))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<usize>,
    offset: Option<usize>,
}

impl PageParams {
    fn bounds(&self) -> Result<(usize, usize), ApiError> {
        let limit = self.limit.unwrap_or(20);
        if limit == 0 || limit > 100 {
            return Err(ApiError::bad_request("limit must be in 1..=100"));
        }
        Ok((self.offset.unwrap_or(0), limit))
    }
}

async fn list_blocks(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (offset, limit) = page.bounds()?;
    let snapshot = state.ledger.snapshot();
    let blocks: Vec<Value> = snapshot
        .blocks_page(offset, limit)
        .iter()
        .map(|b| {
            json!({
                "height": b.height,
                "hash": b.hash(),
                "prev_hash": b.prev_hash,
                "merkle_root": b.merkle_root,
                "validator": b.validator,
                "timestamp": b.timestamp,
                "tx_count": b.transactions.len(),
            })
        })
        .collect();
    Ok(ApiResponse::ok(blocks))
}

async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (offset, limit) = page.bounds()?;
    let snapshot = state.ledger.snapshot();
    Ok(ApiResponse::ok(snapshot.transactions_page(offset, limit)))
}

async fn get_tx(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.ledger.snapshot();
    match snapshot.get_tx(&id) {
        Some((tx, block_height)) => Ok(ApiResponse::ok(json!({
            "tx": tx,
            "block_height": block_height,
            "status": if block_height.is_some() { "sealed" } else { "pending" },
        }))),
        None => Err(ApiError::not_found("transaction not found")),
    }
}

#[derive(Debug, Deserialize)]
struct WalletParams {
    address: Option<String>,
}

async fn get_wallet(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WalletParams>,
) -> impl IntoResponse {
    let address = params.address.unwrap_or_else(|| state.identity.node_id().clone());
    let snapshot = state.ledger.snapshot();
    ApiResponse::ok(snapshot.wallet(&address))
}

// --- Mutating handlers -----------------------------------------------------

async fn submit_tx(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let pubkey = verify_signed(&headers, "POST", "/api/tx", &body)?;
    let tx: Transaction =
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("bad tx: {e}")))?;
    if tx.sender != pubkey {
        return Err(ApiError::bad_request("tx sender does not match request pubkey"));
    }

    let id = state.ledger.submit_tx(tx.clone(), false).await?;
    if tx.kind == TxKind::KnowledgeIngest {
        if let Err(e) = state.engine.record_knowledge(&tx).await {
            debug!(%e, "knowledge node not recorded");
        }
    }
    state.mesh.broadcast_tx(tx).await;
    Ok(ApiResponse::ok(json!({"id": id, "status": "pending"})))
}

#[derive(Debug, Deserialize)]
struct ProposalRequest {
    title: String,
    description: String,
    category: ProposalCategory,
    #[serde(default)]
    domain: String,
}

async fn submit_proposal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let pubkey = verify_signed(&headers, "POST", "/api/proposal", &body)?;
    let request: ProposalRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("bad proposal: {e}")))?;

    let proposal = Proposal::new(
        request.title,
        request.description,
        request.category,
        request.domain,
        pubkey,
    );
    let id = state.engine.admit(proposal).await?;
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(json!({"proposal_id": id}))))
}

#[derive(Debug, Deserialize)]
struct AddPeerRequest {
    address: String,
}

async fn add_peer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    verify_signed(&headers, "POST", "/api/peers", &body)?;
    let request: AddPeerRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("bad body: {e}")))?;

    let (host, port) = request
        .address
        .rsplit_once(':')
        .ok_or_else(|| ApiError::bad_request("address must be host:port"))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ApiError::bad_request("address must be host:port"));
    }

    state.mesh.dial(request.address.clone());
    Ok(ApiResponse::ok(json!({"dialing": request.address})))
}

async fn list_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ApiResponse::ok(state.mesh.peer_table().await)
}

// --- Streams ---------------------------------------------------------------

/// SSE stream of node events. A subscriber that lags the bounded queue gets
/// one `slow_consumer` frame and the stream ends; reconnecting resumes from
/// live state. Heartbeats every 15 s as `event: ping`.
async fn sse_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let events = BroadcastStream::new(rx).scan(false, |dropped, item| {
        if *dropped {
            return futures_util::future::ready(None);
        }
        let event = match item {
            Ok(ev) => Event::default().event(ev.name()).data(ev.data().to_string()),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                *dropped = true;
                Event::default()
                    .event("slow_consumer")
                    .data(json!({"missed": missed}).to_string())
            }
        };
        futures_util::future::ready(Some(Ok::<_, Infallible>(event)))
    });

    let heartbeat = IntervalStream::new(tokio::time::interval(HEARTBEAT))
        .map(|_| Ok::<_, Infallible>(Event::default().event("ping").data("{}")));

    Sse::new(tokio_stream::StreamExt::merge(events, heartbeat))
}

/// Inbound peer connections over WebSocket; each binary message is one
/// mesh frame.
async fn ws_p2p(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    let mesh = state.mesh.clone();
    upgrade.on_upgrade(move |socket| async move {
        mesh.attach_websocket(socket).await;
    })
}
