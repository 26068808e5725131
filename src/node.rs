//! Node assembly: wires identity, ledger worker, deliberation engine, mesh
//! and API together, then runs until shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agents::provider::provider_from_config;
use crate::agents::{Council, ReputationTable};
use crate::api::{self, AppState};
use crate::config::{load_snapshot, GovernanceParams, GovernanceStore, NodeConfig};
use crate::deliberation::DeliberationEngine;
use crate::errors::{NodeError, NodeResult};
use crate::events::EventBus;
use crate::identity::{keys_dir, NodeIdentity};
use crate::ledger::worker::LedgerWorker;
use crate::ledger::ChainState;
use crate::memory::MemoryDag;
use crate::p2p::mesh::Mesh;
use crate::p2p::AddressBook;

/// Grace given to peer tasks after the drain sequence.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Boot the node and run until ctrl-c. Error kinds map to exit codes in
/// `main`: `Auth` -> 2 (unlock failure), `Integrity` -> 3 (replay failure),
/// anything else -> 1. Without a passphrase (mock provider only) the node
/// runs on an ephemeral identity that is never persisted.
pub async fn run(config: NodeConfig, key_password: Option<&str>) -> NodeResult<()> {
    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| NodeError::Fatal(format!("create data dir: {e}")))?;

    let identity = match key_password {
        Some(password) => {
            Arc::new(NodeIdentity::load_or_generate(&keys_dir(&config.data_dir), password)?)
        }
        None => {
            warn!("KEY_PASSWORD unset; running with an ephemeral node identity");
            Arc::new(NodeIdentity::keygen())
        }
    };

    // Governance: defaults overlaid by the config.json snapshot.
    let snapshot = load_snapshot(&config.data_dir);
    let params = snapshot.params.clone().unwrap_or_else(GovernanceParams::default);

    let genesis_validator =
        config.genesis_validator.clone().unwrap_or_else(|| identity.node_id().clone());
    let chain = ChainState::open(&config.data_dir, genesis_validator, &params)?;

    let events = EventBus::new();
    let governance = GovernanceStore::new(params);
    let params_rx = governance.watch();
    let (ledger, ledger_join) =
        LedgerWorker::spawn(chain, identity.clone(), governance, events.clone());

    let dag = MemoryDag::open(&config.data_dir.join("memory.db"))?;
    let reputation = ReputationTable::load(config.data_dir.clone());
    let provider = provider_from_config(&config);
    info!(provider = provider.name(), "generative capability selected");
    let council = Council::new(provider);
    let engine = DeliberationEngine::new(
        council,
        reputation,
        ledger.clone(),
        identity.clone(),
        params_rx.clone(),
        events.clone(),
        dag,
    );

    // Mesh: TCP listener plus the WebSocket bridge exposed by the API.
    let p2p_bind = format!("{}:{}", config.host, config.p2p_port);
    let book = AddressBook::load(&config.data_dir);
    let mesh = Mesh::new(identity.clone(), ledger.clone(), params_rx.clone(), p2p_bind.clone(), book);
    mesh.start(&p2p_bind, &config.seed_nodes).await?;
    engine.set_mesh(mesh.clone()).await;

    let proposer_join = spawn_proposer(ledger.clone(), mesh.clone(), params_rx.clone());
    spawn_burn_recorder(engine.clone(), ledger.clone(), events.clone());

    // HTTP front door.
    let state = Arc::new(AppState {
        identity: identity.clone(),
        ledger: ledger.clone(),
        engine: engine.clone(),
        events: events.clone(),
        mesh: mesh.clone(),
    });
    let api_bind = format!("{}:{}", config.host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&api_bind)
        .await
        .map_err(|e| NodeError::Fatal(format!("bind API {api_bind}: {e}")))?;
    info!(addr = %api_bind, "API listening");
    let api_join = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::router(state)).await {
            error!("API server failed: {e}");
        }
    });

    info!(node_id = %identity.node_id(), "node up");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| NodeError::Fatal(format!("signal handler: {e}")))?;
    info!("shutdown signal received, draining");

    // Drain order: stop tx intake and flush a mid-seal block, then stop
    // gossip, then give peer tasks a short grace before tearing down.
    proposer_join.abort();
    ledger.shutdown().await;
    mesh.shutdown().await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    api_join.abort();
    ledger_join.abort();
    info!("node stopped");
    Ok(())
}

/// Audit recorder: slash txs entering the ledger land in the memory DAG as
/// burn nodes.
fn spawn_burn_recorder(
    engine: Arc<DeliberationEngine>,
    ledger: crate::ledger::worker::LedgerHandle,
    events: EventBus,
) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(crate::events::NodeEvent::LedgerTx { id, kind: crate::types::TxKind::Slash }) => {
                    if let Some((tx, _)) = ledger.snapshot().get_tx(&id) {
                        if let Err(e) = engine.record_burn(&tx).await {
                            warn!(%e, "burn node not recorded");
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Background sealer: while this node is the designated proposer and the
/// mempool is non-empty, seal and gossip a block every interval.
fn spawn_proposer(
    ledger: crate::ledger::worker::LedgerHandle,
    mesh: Arc<Mesh>,
    params: tokio::sync::watch::Receiver<Arc<GovernanceParams>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = params.borrow().block_interval_secs;
            tokio::time::sleep(Duration::from_secs(interval)).await;
            match ledger.propose_block().await {
                Ok(Some(block)) => {
                    info!(height = block.height, txs = block.transactions.len(), "sealed block");
                    mesh.broadcast_block(block).await;
                }
                Ok(None) => {}
                // Not designated at this height: someone else seals.
                Err(NodeError::State(_)) => {}
                Err(e) => warn!("proposer error: {e}"),
            }
        }
    })
}
