//! The moral ledger: signed, replicated, append-only chain of blocks.
//!
//! `ChainState` owns every mutable piece of chain state (blocks, active
//! chain, wallets, mempool, authority schedule) and is driven exclusively by
//! the ledger worker task; readers observe `ChainSnapshot`s published
//! through a watch channel.

pub mod store;
pub mod worker;

use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::GovernanceParams;
use crate::errors::{AuthError, NodeError, NodeResult, StateError};
use crate::identity::NodeIdentity;
use crate::types::{
    zero_hash, Account, Address, Block, BlockHeight, GovernanceAction, Hash, Transaction, TxKind,
    WalletView,
};

use store::ChainStore;

/// Address credited with the genesis supply.
pub const TREASURY_ADDRESS: &str = "treasury";

/// Total supply minted in the genesis block, in whole ETHC.
pub const GENESIS_SUPPLY: u64 = 10_000_000;

/// Outcome of `accept_block` before any reorg consideration.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptResult {
    /// Extended the active chain to this height.
    Extended(BlockHeight),
    /// Attached to a known side chain forking from the active chain at
    /// this height.
    SideChain { fork_height: BlockHeight },
    /// Block already known; nothing changed.
    AlreadyKnown,
}

/// Result of switching the active chain to a longer valid side chain.
#[derive(Debug, Clone)]
pub struct ReorgResult {
    pub old_head: (BlockHeight, Hash),
    pub new_head: (BlockHeight, Hash),
    pub requeued: usize,
    pub dropped: usize,
}

/// Authority-set membership over time. The genesis validator seeds the set;
/// governance and slash txs schedule changes that take effect
/// `authority_latency` blocks after the block carrying them.
#[derive(Debug, Clone)]
pub struct AuthoritySchedule {
    genesis: Vec<Address>,
    changes: Vec<(BlockHeight, AuthorityChange)>,
}

#[derive(Debug, Clone, PartialEq)]
enum AuthorityChange {
    Add(Address),
    Remove(Address),
}

impl AuthoritySchedule {
    pub fn new(genesis_validator: Address) -> Self {
        Self { genesis: vec![genesis_validator], changes: Vec::new() }
    }

    fn schedule(&mut self, effective_height: BlockHeight, change: AuthorityChange) {
        self.changes.push((effective_height, change));
        self.changes.sort_by_key(|(h, _)| *h);
    }

    /// The sorted authority set effective at `height`.
    pub fn effective_at(&self, height: BlockHeight) -> Vec<Address> {
        let mut set: Vec<Address> = self.genesis.clone();
        for (h, change) in &self.changes {
            if *h > height {
                break;
            }
            match change {
                AuthorityChange::Add(addr) => {
                    if !set.contains(addr) {
                        set.push(addr.clone());
                    }
                }
                AuthorityChange::Remove(addr) => set.retain(|a| a != addr),
            }
        }
        set.sort();
        set
    }

    pub fn contains(&self, height: BlockHeight, validator: &str) -> bool {
        self.effective_at(height).iter().any(|a| a == validator)
    }

    /// Round-robin designated proposer for a height.
    pub fn designated(&self, height: BlockHeight) -> Option<Address> {
        let set = self.effective_at(height);
        if set.is_empty() {
            return None;
        }
        Some(set[(height as usize) % set.len()].clone())
    }
}

/// Wallet map plus bookkeeping produced by replaying a chain.
struct FoldState {
    wallets: HashMap<Address, Account>,
    authority: AuthoritySchedule,
    tx_ids: HashSet<Hash>,
}

/// Deterministic genesis block: fixed timestamps so every node derives the
/// same hash for the same designated validator.
pub fn build_genesis(validator: Address) -> Block {
    let mut mint = Transaction {
        id: String::new(),
        kind: TxKind::MintReward,
        sender: crate::types::SYSTEM_SENDER.to_string(),
        recipient: Some(TREASURY_ADDRESS.to_string()),
        amount: Some(GENESIS_SUPPLY),
        payload: json!({"genesis": true}),
        timestamp: 0,
        signature: String::new(),
    };
    mint.id = mint.compute_id();

    let mut block = Block {
        height: 0,
        prev_hash: zero_hash(),
        merkle_root: String::new(),
        validator,
        timestamp: 0,
        transactions: vec![mint],
        signature: String::new(),
    };
    block.merkle_root = block.compute_merkle_root();
    block
}

// --- Transaction validation ------------------------------------------------

/// Structural checks independent of chain state: id binding, signature,
/// per-kind field rules.
pub fn validate_tx_standalone(tx: &Transaction) -> NodeResult<()> {
    if tx.id != tx.compute_id() {
        return Err(NodeError::validation("tx id does not match body"));
    }

    let system_kind = matches!(tx.kind, TxKind::MintReward | TxKind::Slash);
    if tx.is_system() != system_kind {
        return Err(NodeError::validation(format!(
            "{} tx has wrong origin (system={})",
            tx.kind,
            tx.is_system()
        )));
    }

    if !tx.is_system() {
        crate::identity::auth::parse_pubkey(&tx.sender).map_err(NodeError::Auth)?;
        if !crate::identity::verify(&tx.sender, &tx.signing_bytes(), &tx.signature) {
            return Err(NodeError::Auth(AuthError::InvalidSignature));
        }
    }

    match tx.kind {
        TxKind::Transfer | TxKind::MintReward | TxKind::Slash => {
            if tx.recipient.is_none() || tx.amount.is_none() {
                return Err(NodeError::validation(format!("{} tx missing recipient/amount", tx.kind)));
            }
            if tx.kind == TxKind::Transfer && tx.amount == Some(0) {
                return Err(NodeError::validation("transfer of zero"));
            }
        }
        TxKind::Stake => {
            if tx.amount.unwrap_or(0) == 0 {
                return Err(NodeError::validation("stake tx missing amount"));
            }
            match tx.payload.get("action").and_then(|v| v.as_str()) {
                Some("stake") | Some("unstake") => {}
                _ => return Err(NodeError::validation("stake tx action must be stake|unstake")),
            }
        }
        TxKind::Governance => match tx.governance_action() {
            Some(GovernanceAction::SetParam { name, .. }) => {
                if !GovernanceParams::is_known_param(&name) {
                    return Err(NodeError::validation(format!("unknown governance parameter {name}")));
                }
            }
            Some(_) => {}
            None => return Err(NodeError::validation("governance tx payload unreadable")),
        },
        TxKind::DecisionRecord => {
            if tx.payload.get("proposal_id").is_none() {
                return Err(NodeError::validation("decision_record missing proposal_id"));
            }
        }
        TxKind::KnowledgeIngest => {}
    }
    Ok(())
}

/// Apply a tx to the wallet map, enforcing balance/stake rules (I3, I5).
fn apply_tx(wallets: &mut HashMap<Address, Account>, tx: &Transaction) -> NodeResult<()> {
    let amount = tx.amount.unwrap_or(0);
    match tx.kind {
        TxKind::MintReward => {
            let recipient = tx.recipient.as_ref().expect("validated");
            wallets.entry(recipient.clone()).or_default().liquid += amount;
        }
        TxKind::Transfer => {
            let sender = wallets.entry(tx.sender.clone()).or_default();
            if sender.liquid < amount {
                return Err(NodeError::State(StateError::InsufficientFunds {
                    needed: amount,
                    available: sender.liquid,
                }));
            }
            sender.liquid -= amount;
            let recipient = tx.recipient.as_ref().expect("validated");
            wallets.entry(recipient.clone()).or_default().liquid += amount;
        }
        TxKind::Stake => {
            let account = wallets.entry(tx.sender.clone()).or_default();
            match tx.payload.get("action").and_then(|v| v.as_str()) {
                Some("stake") => {
                    if account.liquid < amount {
                        return Err(NodeError::State(StateError::InsufficientFunds {
                            needed: amount,
                            available: account.liquid,
                        }));
                    }
                    account.liquid -= amount;
                    account.staked += amount;
                }
                Some("unstake") => {
                    if account.staked < amount {
                        return Err(NodeError::State(StateError::InsufficientFunds {
                            needed: amount,
                            available: account.staked,
                        }));
                    }
                    account.staked -= amount;
                    account.liquid += amount;
                }
                _ => unreachable!("validated"),
            }
        }
        TxKind::Slash => {
            // Burn: stake is removed, credited nowhere.
            let target = tx.recipient.as_ref().expect("validated");
            let account = wallets.entry(target.clone()).or_default();
            account.staked = account.staked.saturating_sub(amount);
        }
        TxKind::DecisionRecord | TxKind::KnowledgeIngest | TxKind::Governance => {}
    }
    Ok(())
}

/// Validate an entire chain from genesis and fold its state (I1–I5).
/// Errors carry the offending height.
fn validate_and_fold(
    chain: &[Block],
    params: &GovernanceParams,
) -> Result<FoldState, (BlockHeight, String)> {
    let genesis = chain.first().ok_or((0, "empty chain".to_string()))?;
    if genesis.height != 0 || genesis.prev_hash != zero_hash() {
        return Err((0, "malformed genesis".into()));
    }
    if genesis.merkle_root != genesis.compute_merkle_root() {
        return Err((0, "genesis merkle mismatch".into()));
    }

    let mut state = FoldState {
        wallets: HashMap::new(),
        authority: AuthoritySchedule::new(genesis.validator.clone()),
        tx_ids: HashSet::new(),
    };
    let mut prev_hash = genesis.hash();

    for tx in &genesis.transactions {
        apply_tx(&mut state.wallets, tx).map_err(|e| (0, e.to_string()))?;
        state.tx_ids.insert(tx.id.clone());
    }

    for (i, block) in chain.iter().enumerate().skip(1) {
        let height = block.height;
        if height != i as u64 {
            return Err((height, format!("height gap: expected {i}")));
        }
        if block.prev_hash != prev_hash {
            return Err((height, "prev hash does not link".into()));
        }
        if block.merkle_root != block.compute_merkle_root() {
            return Err((height, "merkle root mismatch".into()));
        }
        if !state.authority.contains(height, &block.validator) {
            return Err((height, format!("validator {} not in authority set", &block.validator)));
        }
        if !crate::identity::verify(&block.validator, block.hash().as_bytes(), &block.signature) {
            return Err((height, "invalid block signature".into()));
        }

        for tx in &block.transactions {
            validate_tx_standalone(tx).map_err(|e| (height, e.to_string()))?;
            if !state.tx_ids.insert(tx.id.clone()) {
                return Err((height, format!("duplicate tx {}", tx.id)));
            }
            apply_tx(&mut state.wallets, tx).map_err(|e| (height, e.to_string()))?;
            apply_authority_effects(&mut state.authority, tx, height, params);
        }
        prev_hash = block.hash();
    }
    Ok(state)
}

/// Authority-set side effects of a sealed tx: governance add/remove and
/// slash-driven removal, effective after the latency window.
fn apply_authority_effects(
    authority: &mut AuthoritySchedule,
    tx: &Transaction,
    height: BlockHeight,
    params: &GovernanceParams,
) {
    let effective = height + params.authority_latency;
    match tx.governance_action() {
        Some(GovernanceAction::AddAuthority { pubkey }) => {
            authority.schedule(effective, AuthorityChange::Add(pubkey));
        }
        Some(GovernanceAction::RemoveAuthority { pubkey }) => {
            authority.schedule(effective, AuthorityChange::Remove(pubkey));
        }
        _ => {}
    }
    if tx.kind == TxKind::Slash {
        if let Some(target) = &tx.recipient {
            authority.schedule(effective, AuthorityChange::Remove(target.clone()));
        }
    }
}

// --- Chain state -----------------------------------------------------------

pub struct ChainState {
    store: ChainStore,
    /// Every observed valid block, active or side, by hash.
    blocks: HashMap<Hash, Block>,
    /// Active chain hashes, indexed by height.
    active: Vec<Hash>,
    wallets: HashMap<Address, Account>,
    chain_tx_ids: HashSet<Hash>,
    mempool: VecDeque<Transaction>,
    mempool_ids: HashSet<Hash>,
    authority: AuthoritySchedule,
    /// First-seen header per (height, validator): double-sign detection.
    headers_seen: HashMap<(BlockHeight, Address), Hash>,
    slashed_validators: HashSet<Address>,
    /// Slash txs produced by double-sign observation, drained by the worker.
    pending_slashes: Vec<Transaction>,
    /// Local receipt order, the deterministic per-node fork tie-break.
    arrival: HashMap<Hash, u64>,
    arrival_seq: u64,
}

impl ChainState {
    /// Open the store, replay the active chain, and rebuild state. Any
    /// I1–I4 violation on replay refuses to serve (exit code 3 upstream).
    pub fn open(
        data_dir: &Path,
        genesis_validator: Address,
        params: &GovernanceParams,
    ) -> NodeResult<Self> {
        let store = ChainStore::open(&data_dir.join("chain.db"))?;
        let mut chain = store.replay_active()?;
        if chain.is_empty() {
            let genesis = build_genesis(genesis_validator);
            store.put_block(&genesis)?;
            store.set_active(0, &genesis.hash())?;
            store.set_head_height(0)?;
            info!(hash = %genesis.hash(), "genesis block sealed");
            chain = vec![genesis];
        }

        let fold = validate_and_fold(&chain, params).map_err(|(height, reason)| {
            error!(height, %reason, "chain integrity failure on replay");
            NodeError::Integrity(format!("height {height}: {reason}"))
        })?;

        let mut blocks = HashMap::new();
        for block in store.all_blocks()? {
            blocks.insert(block.hash(), block);
        }
        let active: Vec<Hash> = chain.iter().map(Block::hash).collect();
        let mut arrival = HashMap::new();
        for (i, hash) in active.iter().enumerate() {
            arrival.insert(hash.clone(), i as u64);
        }
        let arrival_seq = active.len() as u64;
        info!(height = active.len() as u64 - 1, "chain replayed");

        Ok(Self {
            store,
            blocks,
            active,
            wallets: fold.wallets,
            chain_tx_ids: fold.tx_ids,
            mempool: VecDeque::new(),
            mempool_ids: HashSet::new(),
            authority: fold.authority,
            headers_seen: HashMap::new(),
            slashed_validators: HashSet::new(),
            pending_slashes: Vec::new(),
            arrival,
            arrival_seq,
        })
    }

    pub fn head_height(&self) -> BlockHeight {
        self.active.len() as u64 - 1
    }

    pub fn head_hash(&self) -> Hash {
        self.active.last().cloned().unwrap_or_else(zero_hash)
    }

    fn active_blocks(&self) -> Vec<Block> {
        self.active.iter().map(|h| self.blocks[h].clone()).collect()
    }

    /// Drain slash txs produced by double-sign observations.
    pub fn take_pending_slashes(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.pending_slashes)
    }

    // --- mempool ---------------------------------------------------------

    /// Validate and admit a tx to the mempool. `internal` permits
    /// system-originated txs the node itself mints.
    pub fn submit_tx(
        &mut self,
        tx: Transaction,
        internal: bool,
        params: &GovernanceParams,
    ) -> NodeResult<Hash> {
        if self.mempool.len() >= params.max_mempool {
            return Err(NodeError::backpressure("mempool full"));
        }
        if tx.is_system() && !internal {
            return Err(NodeError::validation("system txs cannot be submitted externally"));
        }
        validate_tx_standalone(&tx)?;
        if self.mempool_ids.contains(&tx.id) || self.chain_tx_ids.contains(&tx.id) {
            return Err(NodeError::State(StateError::DuplicateTx(tx.id)));
        }

        match tx.kind {
            TxKind::Transfer | TxKind::Stake => {
                let needed = tx.amount.unwrap_or(0);
                let available = match tx.payload.get("action").and_then(|v| v.as_str()) {
                    Some("unstake") => self.wallets.get(&tx.sender).map_or(0, |a| a.staked),
                    _ => self.wallets.get(&tx.sender).map_or(0, |a| a.liquid),
                };
                if available < needed {
                    return Err(NodeError::State(StateError::InsufficientFunds {
                        needed,
                        available,
                    }));
                }
            }
            TxKind::Governance => {
                let next = self.head_height() + 1;
                if !self.authority.contains(next, &tx.sender) {
                    return Err(NodeError::State(StateError::StaleAuthority { height: next }));
                }
            }
            _ => {}
        }

        let id = tx.id.clone();
        self.mempool_ids.insert(id.clone());
        self.mempool.push_back(tx);
        Ok(id)
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.len()
    }

    // --- sealing ---------------------------------------------------------

    /// Seal the next block if this node is the designated proposer. Returns
    /// `Ok(None)` when there is nothing to seal.
    pub fn propose_block(
        &mut self,
        identity: &NodeIdentity,
        params: &GovernanceParams,
    ) -> NodeResult<Option<Block>> {
        let next_height = self.head_height() + 1;
        match self.authority.designated(next_height) {
            Some(designated) if designated == *identity.node_id() => {}
            _ => return Err(NodeError::State(StateError::StaleAuthority { height: next_height })),
        }
        if self.mempool.is_empty() {
            return Ok(None);
        }

        // FIFO selection; txs invalid under current state are dropped.
        let mut scratch = self.wallets.clone();
        let mut selected = Vec::new();
        let mut rejected = 0usize;
        while let Some(tx) = self.mempool.pop_front() {
            if selected.len() >= params.max_tx_per_block {
                self.mempool.push_front(tx);
                break;
            }
            self.mempool_ids.remove(&tx.id);
            match apply_tx(&mut scratch, &tx) {
                Ok(()) => selected.push(tx),
                Err(e) => {
                    warn!(tx = %tx.id, %e, "dropping stale mempool tx");
                    rejected += 1;
                }
            }
        }
        if selected.is_empty() {
            if rejected > 0 {
                warn!(rejected, "no sealable txs in mempool");
            }
            return Ok(None);
        }

        let ids: Vec<Hash> = selected.iter().map(|t| t.id.clone()).collect();
        let mut block = Block {
            height: next_height,
            prev_hash: self.head_hash(),
            merkle_root: crate::types::merkle_root(&ids),
            validator: identity.node_id().clone(),
            timestamp: chrono::Utc::now().timestamp() as u64,
            transactions: selected,
            signature: String::new(),
        };
        block.signature = identity.sign(block.hash().as_bytes());

        match self.accept_block(block.clone(), params)? {
            AcceptResult::Extended(_) => Ok(Some(block)),
            other => Err(NodeError::Fatal(format!("sealed block not accepted: {other:?}"))),
        }
    }

    // --- acceptance ------------------------------------------------------

    /// Validate and attach a block (I1–I5 against its candidate chain).
    pub fn accept_block(
        &mut self,
        block: Block,
        params: &GovernanceParams,
    ) -> NodeResult<AcceptResult> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return Ok(AcceptResult::AlreadyKnown);
        }
        if block.height == 0 {
            return Err(NodeError::validation("genesis cannot be replaced"));
        }
        if block.merkle_root != block.compute_merkle_root() {
            return Err(NodeError::validation("merkle root mismatch"));
        }
        if !crate::identity::verify(&block.validator, hash.as_bytes(), &block.signature) {
            return Err(NodeError::Auth(AuthError::InvalidSignature));
        }

        self.observe_header(&block);

        if block.prev_hash == self.head_hash() && block.height == self.head_height() + 1 {
            self.extend_active(block, params)?;
            return Ok(AcceptResult::Extended(self.head_height()));
        }

        // Side chain: the parent must be known; sync fills real gaps.
        let Some(parent) = self.blocks.get(&block.prev_hash) else {
            return Err(NodeError::validation(format!(
                "unknown parent {} at height {}",
                block.prev_hash, block.height
            )));
        };
        if parent.height + 1 != block.height {
            return Err(NodeError::validation("height does not follow parent"));
        }

        let fork_height = self.fork_point(&block);
        self.store.put_block(&block)?;
        self.record_arrival(&hash);
        self.blocks.insert(hash, block);
        Ok(AcceptResult::SideChain { fork_height })
    }

    fn extend_active(&mut self, block: Block, params: &GovernanceParams) -> NodeResult<()> {
        let height = block.height;
        if !self.authority.contains(height, &block.validator) {
            return Err(NodeError::State(StateError::StaleAuthority { height }));
        }

        let mut scratch = self.wallets.clone();
        for tx in &block.transactions {
            validate_tx_standalone(tx)?;
            if self.chain_tx_ids.contains(&tx.id) {
                return Err(NodeError::State(StateError::DuplicateTx(tx.id.clone())));
            }
            apply_tx(&mut scratch, tx)?;
        }

        let hash = block.hash();
        self.store.put_block(&block)?;
        self.store.set_active(height, &hash)?;
        self.store.set_head_height(height)?;

        self.wallets = scratch;
        for tx in &block.transactions {
            self.chain_tx_ids.insert(tx.id.clone());
            if self.mempool_ids.remove(&tx.id) {
                self.mempool.retain(|t| t.id != tx.id);
            }
            apply_authority_effects(&mut self.authority, tx, height, params);
        }
        self.record_arrival(&hash);
        self.active.push(hash.clone());
        self.blocks.insert(hash, block);
        Ok(())
    }

    /// Height at which a side block's chain departs from the active chain.
    fn fork_point(&self, block: &Block) -> BlockHeight {
        let mut cursor = block.prev_hash.clone();
        loop {
            if let Some(pos) = self.active.iter().position(|h| *h == cursor) {
                return pos as u64;
            }
            match self.blocks.get(&cursor) {
                Some(parent) => cursor = parent.prev_hash.clone(),
                None => return 0,
            }
        }
    }

    fn record_arrival(&mut self, hash: &Hash) {
        if !self.arrival.contains_key(hash) {
            self.arrival.insert(hash.clone(), self.arrival_seq);
            self.arrival_seq += 1;
        }
    }

    /// Double-sign detection: two distinct signed headers at one height by
    /// one validator burn its stake and schedule removal from the set. Both
    /// blocks stay on disk for audit.
    fn observe_header(&mut self, block: &Block) {
        let key = (block.height, block.validator.clone());
        let hash = block.hash();
        match self.headers_seen.get(&key) {
            None => {
                self.headers_seen.insert(key, hash);
            }
            Some(first) if *first != hash => {
                if self.slashed_validators.insert(block.validator.clone()) {
                    let stake = self.wallets.get(&block.validator).map_or(0, |a| a.staked);
                    warn!(
                        validator = %block.validator,
                        height = block.height,
                        stake,
                        "double-sign observed, slashing"
                    );
                    let slash = Transaction::system(
                        TxKind::Slash,
                        block.validator.clone(),
                        stake,
                        json!({
                            "reason": "double_sign",
                            "height": block.height,
                            "first": first,
                            "second": hash,
                        }),
                    );
                    self.pending_slashes.push(slash);
                }
            }
            Some(_) => {}
        }
    }

    // --- reorg -----------------------------------------------------------

    /// Switch to the best strictly-longer fully-valid side chain, if any.
    /// Orphaned txs still valid under the new state return to the mempool.
    pub fn maybe_reorg(&mut self, params: &GovernanceParams) -> NodeResult<Option<ReorgResult>> {
        let head_height = self.head_height();

        // Candidate tips: known blocks above our head that are not on the
        // active chain, longest first, earliest-seen breaking ties.
        let mut tips: Vec<(BlockHeight, u64, Hash)> = self
            .blocks
            .values()
            .filter(|b| b.height > head_height)
            .map(|b| {
                let hash = b.hash();
                let seen = self.arrival.get(&hash).copied().unwrap_or(u64::MAX);
                (b.height, seen, hash)
            })
            .filter(|(_, _, hash)| !self.active.contains(hash))
            .collect();
        tips.sort_by_key(|(height, seen, _)| (std::cmp::Reverse(*height), *seen));

        for (_, _, tip_hash) in tips {
            let Some(tip) = self.blocks.get(&tip_hash).cloned() else {
                continue;
            };
            let Some(candidate) = self.assemble_chain(&tip) else {
                continue;
            };
            let fold = match validate_and_fold(&candidate, params) {
                Ok(fold) => fold,
                Err((height, reason)) => {
                    warn!(height, %reason, "side chain failed validation");
                    continue;
                }
            };
            return Ok(Some(self.switch_to(candidate, tip_hash, fold)?));
        }
        Ok(None)
    }

    fn assemble_chain(&self, tip: &Block) -> Option<Vec<Block>> {
        let mut chain = vec![tip.clone()];
        let mut cursor = tip.prev_hash.clone();
        while cursor != zero_hash() {
            let parent = self.blocks.get(&cursor)?;
            chain.push(parent.clone());
            cursor = parent.prev_hash.clone();
        }
        chain.reverse();
        Some(chain)
    }

    fn switch_to(
        &mut self,
        candidate: Vec<Block>,
        tip_hash: Hash,
        fold: FoldState,
    ) -> NodeResult<ReorgResult> {
        let old_head = (self.head_height(), self.head_hash());
        let new_hashes: Vec<Hash> = candidate.iter().map(Block::hash).collect();

        // Common prefix length between old and new active chains.
        let common = self
            .active
            .iter()
            .zip(new_hashes.iter())
            .take_while(|(a, b)| a == b)
            .count();

        // Orphaned txs: on the old chain past the fork, absent from the new.
        let orphaned: Vec<Transaction> = self.active[common..]
            .iter()
            .flat_map(|h| self.blocks[h].transactions.clone())
            .filter(|tx| !fold.tx_ids.contains(&tx.id))
            .collect();

        // Requeue orphans that remain valid under the new state, folding on
        // a scratch copy so later orphans see earlier ones' effects.
        let mut scratch = fold.wallets.clone();
        let mut requeued_txs = Vec::new();
        let mut dropped = 0usize;
        for tx in orphaned {
            let still_valid = validate_tx_standalone(&tx).is_ok()
                && !fold.tx_ids.contains(&tx.id)
                && apply_tx(&mut scratch, &tx).is_ok();
            if still_valid {
                requeued_txs.push(tx);
            } else {
                dropped += 1;
            }
        }

        let requeued = requeued_txs.len();

        // Existing mempool entries now sealed on the new chain fall away.
        let mut mempool: VecDeque<Transaction> = requeued_txs.into_iter().collect();
        for tx in self.mempool.drain(..) {
            if !fold.tx_ids.contains(&tx.id) && !mempool.iter().any(|t| t.id == tx.id) {
                mempool.push_back(tx);
            }
        }
        self.mempool_ids = mempool.iter().map(|t| t.id.clone()).collect();

        // Persist the new active index.
        self.store.truncate_active_above(common.saturating_sub(1) as u64)?;
        for (height, hash) in new_hashes.iter().enumerate().skip(common) {
            self.store.set_active(height as u64, hash)?;
        }
        self.store.set_head_height(new_hashes.len() as u64 - 1)?;

        self.wallets = fold.wallets;
        self.chain_tx_ids = fold.tx_ids;
        self.authority = fold.authority;
        self.active = new_hashes;
        self.mempool = mempool;

        let new_head = (self.head_height(), tip_hash);
        info!(
            old_height = old_head.0,
            new_height = new_head.0,
            requeued,
            dropped,
            "reorged to longer valid chain"
        );
        Ok(ReorgResult { old_head, new_head, requeued, dropped })
    }

    // --- reads -----------------------------------------------------------

    /// Immutable snapshot for readers; published through the worker's watch
    /// channel after every mutation.
    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            head_height: self.head_height(),
            head_hash: self.head_hash(),
            blocks: self.active_blocks(),
            wallets: self.wallets.clone(),
            authorities: self.authority.effective_at(self.head_height() + 1),
            mempool: self.mempool.iter().cloned().collect(),
        }
    }

    pub fn authority(&self) -> &AuthoritySchedule {
        &self.authority
    }
}

/// Read model over the active chain; derived, never stored.
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub head_height: BlockHeight,
    pub head_hash: Hash,
    pub blocks: Vec<Block>,
    pub wallets: HashMap<Address, Account>,
    pub authorities: Vec<Address>,
    pub mempool: Vec<Transaction>,
}

impl ChainSnapshot {
    pub fn wallet(&self, address: &str) -> WalletView {
        let account = self.wallets.get(address).cloned().unwrap_or_default();
        WalletView {
            address: address.to_string(),
            liquid_balance: account.liquid,
            staked_balance: account.staked,
            is_validator: self.authorities.iter().any(|a| a == address),
        }
    }

    /// Page of blocks, descending height.
    pub fn blocks_page(&self, offset: usize, limit: usize) -> Vec<Block> {
        self.blocks.iter().rev().skip(offset).take(limit).cloned().collect()
    }

    /// Ascending range used by chain sync.
    pub fn blocks_range(&self, from: BlockHeight, limit: usize) -> Vec<Block> {
        self.blocks.iter().skip(from as usize).take(limit).cloned().collect()
    }

    /// Page of sealed txs, newest block first.
    pub fn transactions_page(&self, offset: usize, limit: usize) -> Vec<Transaction> {
        self.blocks
            .iter()
            .rev()
            .flat_map(|b| b.transactions.iter().cloned())
            .skip(offset)
            .take(limit)
            .collect()
    }

    /// Lookup a tx on the active chain or in the mempool.
    pub fn get_tx(&self, id: &str) -> Option<(Transaction, Option<BlockHeight>)> {
        for block in &self.blocks {
            if let Some(tx) = block.transactions.iter().find(|t| t.id == id) {
                return Some((tx.clone(), Some(block.height)));
            }
        }
        self.mempool.iter().find(|t| t.id == id).map(|t| (t.clone(), None))
    }
}
