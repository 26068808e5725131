//! The ledger worker: sole mutator of chain and mempool state.
//!
//! Peers, the API and the deliberation engine submit commands over a bounded
//! channel and await oneshot replies; readers observe the chain through the
//! watch-published snapshot, so no lock is ever taken on chain state.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::GovernanceStore;
use crate::errors::{NodeError, NodeResult};
use crate::events::{EventBus, NodeEvent};
use crate::identity::NodeIdentity;
use crate::types::{Block, GovernanceAction, Hash, Transaction};

use super::{AcceptResult, ChainSnapshot, ChainState, ReorgResult};

/// Depth of the command channel feeding the worker.
const COMMAND_QUEUE: usize = 512;

/// What `accept_block` did, including any reorg it triggered.
#[derive(Debug, Clone)]
pub struct AcceptSummary {
    pub result: AcceptResult,
    pub reorg: Option<ReorgResult>,
}

pub enum LedgerCommand {
    SubmitTx {
        tx: Transaction,
        internal: bool,
        reply: oneshot::Sender<NodeResult<Hash>>,
    },
    ProposeBlock {
        reply: oneshot::Sender<NodeResult<Option<Block>>>,
    },
    AcceptBlock {
        block: Block,
        reply: oneshot::Sender<NodeResult<AcceptSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle used by every other subsystem.
#[derive(Clone)]
pub struct LedgerHandle {
    cmd_tx: mpsc::Sender<LedgerCommand>,
    snapshot_rx: watch::Receiver<Arc<ChainSnapshot>>,
}

impl LedgerHandle {
    /// Current chain snapshot (lock-free).
    pub fn snapshot(&self) -> Arc<ChainSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub async fn submit_tx(&self, tx: Transaction, internal: bool) -> NodeResult<Hash> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::SubmitTx { tx, internal, reply }).await?;
        rx.await.map_err(|_| NodeError::Fatal("ledger worker gone".into()))?
    }

    pub async fn propose_block(&self) -> NodeResult<Option<Block>> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::ProposeBlock { reply }).await?;
        rx.await.map_err(|_| NodeError::Fatal("ledger worker gone".into()))?
    }

    pub async fn accept_block(&self, block: Block) -> NodeResult<AcceptSummary> {
        let (reply, rx) = oneshot::channel();
        self.send(LedgerCommand::AcceptBlock { block, reply }).await?;
        rx.await.map_err(|_| NodeError::Fatal("ledger worker gone".into()))?
    }

    /// Drain and stop the worker. Flushes a final block if this node is the
    /// designated proposer and txs are pending.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(LedgerCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: LedgerCommand) -> NodeResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| NodeError::Fatal("ledger worker gone".into()))
    }
}

pub struct LedgerWorker {
    chain: ChainState,
    identity: Arc<NodeIdentity>,
    governance: GovernanceStore,
    events: EventBus,
    snapshot_tx: watch::Sender<Arc<ChainSnapshot>>,
    cmd_rx: mpsc::Receiver<LedgerCommand>,
    accepting_txs: bool,
}

impl LedgerWorker {
    /// Spawn the worker task, returning the shared handle.
    pub fn spawn(
        chain: ChainState,
        identity: Arc<NodeIdentity>,
        governance: GovernanceStore,
        events: EventBus,
    ) -> (LedgerHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(chain.snapshot()));

        let worker = Self {
            chain,
            identity,
            governance,
            events,
            snapshot_tx,
            cmd_rx,
            accepting_txs: true,
        };
        let handle = LedgerHandle { cmd_tx, snapshot_rx };
        let join = tokio::spawn(worker.run());
        (handle, join)
    }

    async fn run(mut self) {
        info!("ledger worker started");
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                LedgerCommand::SubmitTx { tx, internal, reply } => {
                    let result = self.handle_submit(tx, internal);
                    let _ = reply.send(result);
                }
                LedgerCommand::ProposeBlock { reply } => {
                    let result = self.handle_propose();
                    let _ = reply.send(result);
                }
                LedgerCommand::AcceptBlock { block, reply } => {
                    let result = self.handle_accept(block);
                    let _ = reply.send(result);
                }
                LedgerCommand::Shutdown { reply } => {
                    self.accepting_txs = false;
                    // Flush a final block if anything is pending and we may seal.
                    if self.chain.mempool_len() > 0 {
                        if let Ok(Some(block)) = self.handle_propose() {
                            info!(height = block.height, "flushed final block on shutdown");
                        }
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!("ledger worker stopped");
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(Arc::new(self.chain.snapshot()));
    }

    /// Apply post-mutation bookkeeping shared by every accept path: slash
    /// txs from double-sign observations, governance parameter activation,
    /// snapshot publication.
    fn after_mutation(&mut self) {
        let params = self.governance.snapshot();
        for slash in self.chain.take_pending_slashes() {
            match self.chain.submit_tx(slash.clone(), true, &params) {
                Ok(id) => {
                    self.events.publish(NodeEvent::LedgerTx { id, kind: slash.kind });
                }
                Err(e) => warn!(%e, "could not enqueue slash tx"),
            }
        }
        self.governance.activate(self.chain.head_height());
        self.publish();
    }

    fn handle_submit(&mut self, tx: Transaction, internal: bool) -> NodeResult<Hash> {
        if !self.accepting_txs {
            return Err(NodeError::backpressure("node is shutting down"));
        }
        let params = self.governance.snapshot();
        let kind = tx.kind;
        let id = self.chain.submit_tx(tx, internal, &params)?;
        self.events.publish(NodeEvent::LedgerTx { id: id.clone(), kind });
        self.publish();
        Ok(id)
    }

    fn handle_propose(&mut self) -> NodeResult<Option<Block>> {
        let params = self.governance.snapshot();
        let proposed = self.chain.propose_block(&self.identity, &params)?;
        if let Some(block) = &proposed {
            self.schedule_param_changes(block);
            self.events.publish(NodeEvent::LedgerBlock {
                height: block.height,
                hash: block.hash(),
            });
            self.after_mutation();
        }
        Ok(proposed)
    }

    fn handle_accept(&mut self, block: Block) -> NodeResult<AcceptSummary> {
        let params = self.governance.snapshot();
        let result = self.chain.accept_block(block.clone(), &params)?;

        if let AcceptResult::Extended(height) = result {
            self.schedule_param_changes(&block);
            self.events.publish(NodeEvent::LedgerBlock { height, hash: block.hash() });
        }

        let reorg = self.chain.maybe_reorg(&params)?;
        if let Some(reorg) = &reorg {
            self.events.publish(NodeEvent::LedgerBlock {
                height: reorg.new_head.0,
                hash: reorg.new_head.1.clone(),
            });
        }
        self.after_mutation();
        Ok(AcceptSummary { result, reorg })
    }

    /// Governance `set_param` txs in a newly active block take effect at
    /// `height + authority_latency`; authority add/remove effects are
    /// chain-derived inside the fold.
    fn schedule_param_changes(&mut self, block: &Block) {
        let params = self.governance.snapshot();
        for tx in &block.transactions {
            if let Some(GovernanceAction::SetParam { name, value }) = tx.governance_action() {
                self.governance.schedule(block.height + params.authority_latency, name, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GovernanceParams, GovernanceStore};
    use crate::ledger::ChainState;
    use crate::types::TxKind;
    use serde_json::json;

    async fn spawn_worker() -> (tempfile::TempDir, Arc<NodeIdentity>, LedgerHandle, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(NodeIdentity::keygen());
        let params = GovernanceParams::default();
        let chain = ChainState::open(dir.path(), identity.node_id().clone(), &params).unwrap();
        let events = EventBus::new();
        let governance = GovernanceStore::new(params);
        let (handle, _join) =
            LedgerWorker::spawn(chain, identity.clone(), governance, events.clone());
        (dir, identity, handle, events)
    }

    #[tokio::test]
    async fn worker_serializes_submit_and_seal() {
        let (_dir, identity, handle, events) = spawn_worker().await;
        let mut rx = events.subscribe();

        let mint =
            Transaction::system(TxKind::MintReward, identity.node_id().clone(), 10, json!({}));
        handle.submit_tx(mint, true).await.unwrap();
        let block = handle.propose_block().await.unwrap().unwrap();
        assert_eq!(block.height, 1);

        // tx event then block event.
        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::LedgerTx { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeEvent::LedgerBlock { height: 1, .. }
        ));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.head_height, 1);
        assert_eq!(snapshot.wallet(identity.node_id()).liquid_balance, 10);
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_block() {
        let (_dir, identity, handle, _events) = spawn_worker().await;
        let mint =
            Transaction::system(TxKind::MintReward, identity.node_id().clone(), 3, json!({}));
        handle.submit_tx(mint, true).await.unwrap();

        handle.shutdown().await;
        // Worker is gone; the last published snapshot carries the flush.
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.head_height, 1);
        assert!(handle.propose_block().await.is_err());
    }
}
