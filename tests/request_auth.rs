//! Signed-request handling at the HTTP boundary: replay defense (stale
//! timestamps), signature binding, and the happy submission paths.

use serde_json::json;
use std::sync::Arc;

use orbis_ethica::agents::provider::MockProvider;
use orbis_ethica::agents::{Council, ReputationTable};
use orbis_ethica::api::{self, AppState};
use orbis_ethica::config::{GovernanceParams, GovernanceStore};
use orbis_ethica::deliberation::DeliberationEngine;
use orbis_ethica::events::EventBus;
use orbis_ethica::identity::{auth, NodeIdentity};
use orbis_ethica::ledger::worker::LedgerWorker;
use orbis_ethica::ledger::ChainState;
use orbis_ethica::memory::MemoryDag;
use orbis_ethica::p2p::mesh::Mesh;
use orbis_ethica::p2p::AddressBook;
use orbis_ethica::types::{Transaction, TxKind};

struct ApiHarness {
    _dir: tempfile::TempDir,
    base: String,
    client: reqwest::Client,
    node: Arc<NodeIdentity>,
}

async fn api_harness() -> ApiHarness {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(NodeIdentity::keygen());
    let params = GovernanceParams::default();
    let chain = ChainState::open(dir.path(), identity.node_id().clone(), &params).unwrap();
    let events = EventBus::new();
    let governance = GovernanceStore::new(params);
    let params_rx = governance.watch();
    let (ledger, _join) = LedgerWorker::spawn(chain, identity.clone(), governance, events.clone());

    let dag = MemoryDag::open(&dir.path().join("memory.db")).unwrap();
    let engine = DeliberationEngine::new(
        Council::new(Arc::new(MockProvider::new())),
        ReputationTable::in_memory(),
        ledger.clone(),
        identity.clone(),
        params_rx.clone(),
        events.clone(),
        dag,
    );

    let p2p_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let p2p_addr = p2p_listener.local_addr().unwrap().to_string();
    drop(p2p_listener);
    let mesh = Mesh::new(
        identity.clone(),
        ledger.clone(),
        params_rx,
        p2p_addr.clone(),
        AddressBook::in_memory(),
    );
    mesh.start(&p2p_addr, &[]).await.unwrap();
    engine.set_mesh(mesh.clone()).await;

    let state = Arc::new(AppState {
        identity: identity.clone(),
        ledger,
        engine,
        events,
        mesh,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.ok();
    });

    ApiHarness { _dir: dir, base, client: reqwest::Client::new(), node: identity }
}

fn signed_headers(
    signer: &NodeIdentity,
    method: &str,
    path: &str,
    timestamp: i64,
    body: &serde_json::Value,
) -> [(String, String); 3] {
    let signature = auth::sign_request(signer, method, path, timestamp, body);
    [
        ("x-pubkey".into(), signer.node_id().clone()),
        ("x-timestamp".into(), timestamp.to_string()),
        ("x-signature".into(), signature),
    ]
}

#[tokio::test]
async fn health_and_wallet_respond_unauthenticated() {
    let h = api_harness().await;

    let health: serde_json::Value =
        h.client.get(format!("{}/api/health", h.base)).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["data"]["status"], "ok");
    assert_eq!(health["data"]["head_height"], 0);

    // Wallet defaults to the node's own address.
    let wallet: serde_json::Value =
        h.client.get(format!("{}/api/wallet", h.base)).send().await.unwrap().json().await.unwrap();
    assert_eq!(wallet["data"]["address"], *h.node.node_id());
    assert_eq!(wallet["data"]["is_validator"], true);
}

#[tokio::test]
async fn stale_timestamp_is_rejected_without_state_change() {
    let h = api_harness().await;
    let submitter = NodeIdentity::keygen();

    let mut tx = Transaction::build(
        TxKind::KnowledgeIngest,
        submitter.node_id().clone(),
        None,
        None,
        json!({"topic": "storms"}),
    );
    tx.signature = submitter.sign(&tx.signing_bytes());
    let body = serde_json::to_value(&tx).unwrap();

    // Signed correctly, but 600 seconds in the past.
    let stale = chrono::Utc::now().timestamp() - 600;
    let mut request = h.client.post(format!("{}/api/tx", h.base)).json(&body);
    for (name, value) in signed_headers(&submitter, "POST", "/api/tx", stale, &body) {
        request = request.header(name, value);
    }
    let response = request.send().await.unwrap();
    assert_eq!(response.status().as_u16(), 401);
    let error: serde_json::Value = response.json().await.unwrap();
    assert!(error["error"].as_str().unwrap().contains("replay window"));

    // No state change: the tx is nowhere to be found.
    let lookup =
        h.client.get(format!("{}/api/ledger/tx/{}", h.base, tx.id)).send().await.unwrap();
    assert_eq!(lookup.status().as_u16(), 404);
}

#[tokio::test]
async fn fresh_signature_admits_tx_and_proposal() {
    let h = api_harness().await;
    let submitter = NodeIdentity::keygen();

    let mut tx = Transaction::build(
        TxKind::KnowledgeIngest,
        submitter.node_id().clone(),
        None,
        None,
        json!({"topic": "tides", "content": "spring tides flood the east quay"}),
    );
    tx.signature = submitter.sign(&tx.signing_bytes());
    let body = serde_json::to_value(&tx).unwrap();

    let now = chrono::Utc::now().timestamp();
    let mut request = h.client.post(format!("{}/api/tx", h.base)).json(&body);
    for (name, value) in signed_headers(&submitter, "POST", "/api/tx", now, &body) {
        request = request.header(name, value);
    }
    let response = request.send().await.unwrap();
    if response.status().as_u16() != 200 {
        panic!("submit failed: {}", response.text().await.unwrap_or_default());
    }

    let lookup: serde_json::Value = h
        .client
        .get(format!("{}/api/ledger/tx/{}", h.base, tx.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lookup["data"]["status"], "pending");

    // A duplicate submission conflicts.
    let mut request = h.client.post(format!("{}/api/tx", h.base)).json(&body);
    for (name, value) in signed_headers(&submitter, "POST", "/api/tx", now, &body) {
        request = request.header(name, value);
    }
    assert_eq!(request.send().await.unwrap().status().as_u16(), 409);

    // Proposal admission over the same scheme.
    let proposal_body = json!({
        "title": "Dredge the east quay",
        "description": "Clear silt before the spring tides",
        "category": "routine",
        "domain": "infrastructure",
    });
    let mut request = h.client.post(format!("{}/api/proposal", h.base)).json(&proposal_body);
    for (name, value) in signed_headers(&submitter, "POST", "/api/proposal", now, &proposal_body) {
        request = request.header(name, value);
    }
    let response = request.send().await.unwrap();
    assert_eq!(response.status().as_u16(), 202);
    let accepted: serde_json::Value = response.json().await.unwrap();
    assert!(accepted["data"]["proposal_id"].is_string());
}

#[tokio::test]
async fn tampered_and_unsigned_requests_are_rejected() {
    let h = api_harness().await;
    let submitter = NodeIdentity::keygen();
    let body = json!({
        "title": "Lower the tolls",
        "description": "Halve bridge tolls for a season",
        "category": "routine",
        "domain": "economy",
    });

    // Missing headers entirely.
    let response =
        h.client.post(format!("{}/api/proposal", h.base)).json(&body).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 401);

    // Signature over a different body.
    let now = chrono::Utc::now().timestamp();
    let other_body = json!({"title": "different"});
    let mut request = h.client.post(format!("{}/api/proposal", h.base)).json(&body);
    for (name, value) in signed_headers(&submitter, "POST", "/api/proposal", now, &other_body) {
        request = request.header(name, value);
    }
    assert_eq!(request.send().await.unwrap().status().as_u16(), 401);

    // A pubkey that is not a curve point is unknown.
    let mut request = h.client.post(format!("{}/api/proposal", h.base)).json(&body);
    request = request
        .header("x-pubkey", "zz".repeat(32))
        .header("x-timestamp", now.to_string())
        .header("x-signature", "00".repeat(64));
    assert_eq!(request.send().await.unwrap().status().as_u16(), 401);
}

#[tokio::test]
async fn bad_paging_params_are_rejected() {
    let h = api_harness().await;
    let response = h
        .client
        .get(format!("{}/api/ledger/blocks?limit=0", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = h
        .client
        .get(format!("{}/api/ledger/blocks?limit=not-a-number", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}
