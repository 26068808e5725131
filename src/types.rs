// Core ledger and deliberation types for Orbis Ethica.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Sha3_256};
use std::fmt;
use uuid::Uuid;

use crate::identity::auth::canonical_json;

/// Node / account address: lowercase hex of the Ed25519 public key.
pub type Address = String;

/// 32-byte hash as lowercase hex.
pub type Hash = String;

/// Block height.
pub type BlockHeight = u64;

/// Amount in whole ETHC.
pub type Amount = u64;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Sender address used by system-originated txs (mint, slash).
pub const SYSTEM_SENDER: &str = "system";

/// All-zero hash used as the genesis parent.
pub fn zero_hash() -> Hash {
    "0".repeat(64)
}

/// Hash arbitrary bytes to lowercase hex.
pub fn sha3_hex(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// --- Proposals -------------------------------------------------------------

/// Proposal category, selecting the approval threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalCategory {
    Routine,
    HighImpact,
    Constitutional,
    Emergency,
}

impl fmt::Display for ProposalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalCategory::Routine => "routine",
            ProposalCategory::HighImpact => "high_impact",
            ProposalCategory::Constitutional => "constitutional",
            ProposalCategory::Emergency => "emergency",
        };
        write!(f, "{s}")
    }
}

/// An ethical proposal under deliberation. Immutable once admitted;
/// refinements are new proposals pointing at their parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub category: ProposalCategory,
    pub domain: String,
    pub submitter: Address,
    pub parent_id: Option<Uuid>,
    pub created_at: Timestamp,
}

impl Proposal {
    pub fn new(
        title: String,
        description: String,
        category: ProposalCategory,
        domain: String,
        submitter: Address,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            description,
            category,
            domain,
            submitter,
            parent_id: None,
            created_at: chrono::Utc::now().timestamp() as u64,
        }
    }

    /// Derive a refinement of this proposal with lineage preserved.
    pub fn refinement(&self, title: String, description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            description,
            category: self.category,
            domain: self.domain.clone(),
            submitter: self.submitter.clone(),
            parent_id: Some(self.id),
            created_at: chrono::Utc::now().timestamp() as u64,
        }
    }
}

// --- Votes and rounds ------------------------------------------------------

/// Four-dimensional ethical score plus agent confidence, all in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UlfrScore {
    pub utility: f64,
    pub life: f64,
    pub fairness: f64,
    pub rights: f64,
    pub confidence: f64,
}

impl UlfrScore {
    pub fn new(utility: f64, life: f64, fairness: f64, rights: f64, confidence: f64) -> Self {
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        Self {
            utility: clamp(utility),
            life: clamp(life),
            fairness: clamp(fairness),
            rights: clamp(rights),
            confidence: clamp(confidence),
        }
    }

    /// Neutral score used when an agent degrades to abstain.
    pub fn neutral() -> Self {
        Self::new(0.5, 0.5, 0.5, 0.5, 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
    Abstain,
}

impl VoteDecision {
    /// Numeric vote value entering the weighted consensus score.
    pub fn numeric(&self) -> f64 {
        match self {
            VoteDecision::Approve => 1.0,
            VoteDecision::Reject => 0.0,
            VoteDecision::Abstain => 0.5,
        }
    }
}

impl fmt::Display for VoteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VoteDecision::Approve => "approve",
            VoteDecision::Reject => "reject",
            VoteDecision::Abstain => "abstain",
        };
        write!(f, "{s}")
    }
}

/// One agent's signed vote in one round of a deliberation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    pub proposal_id: Uuid,
    pub round: u32,
    pub decision: VoteDecision,
    pub ulfr: UlfrScore,
    pub reasoning: String,
    /// Hex Ed25519 signature over `signing_bytes()`. Empty when the vote was
    /// synthesized locally (abstain on provider failure).
    pub signature: String,
}

impl Vote {
    /// Canonical bytes covered by the vote signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "vote:{}:{}:{}:{}:{:.6}:{:.6}:{:.6}:{:.6}:{:.6}:{}",
            self.agent_id,
            self.proposal_id,
            self.round,
            self.decision,
            self.ulfr.utility,
            self.ulfr.life,
            self.ulfr.fairness,
            self.ulfr.rights,
            self.ulfr.confidence,
            sha3_hex(self.reasoning.as_bytes()),
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Approved,
    Rejected,
    Refined,
    TimedOut,
}

impl fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundOutcome::Approved => "approved",
            RoundOutcome::Rejected => "rejected",
            RoundOutcome::Refined => "refined",
            RoundOutcome::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Aggregated result of one deliberation round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_no: u32,
    pub votes: Vec<Vote>,
    pub weighted_score: f64,
    /// ULFR-derived sanity score, recorded for audit.
    pub sanity_score: f64,
    pub outcome: RoundOutcome,
    pub refined_proposal_id: Option<Uuid>,
}

/// Final decision for a proposal that reached a terminal outcome.
/// At most one exists per proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub proposal_id: Uuid,
    pub outcome: RoundOutcome,
    pub rounds: Vec<RoundResult>,
    pub weighted_score: f64,
    /// Memory DAG node ids forming the audit trail for this decision.
    pub audit_refs: Vec<Uuid>,
}

// --- Transactions ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    MintReward,
    Transfer,
    Stake,
    Slash,
    DecisionRecord,
    KnowledgeIngest,
    Governance,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxKind::MintReward => "mint_reward",
            TxKind::Transfer => "transfer",
            TxKind::Stake => "stake",
            TxKind::Slash => "slash",
            TxKind::DecisionRecord => "decision_record",
            TxKind::KnowledgeIngest => "knowledge_ingest",
            TxKind::Governance => "governance",
        };
        write!(f, "{s}")
    }
}

/// Authority-set / parameter mutation carried by a governance tx payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GovernanceAction {
    AddAuthority { pubkey: Address },
    RemoveAuthority { pubkey: Address },
    SetParam { name: String, value: f64 },
}

/// Ledger transaction: tagged union over the tx kinds with a common header.
/// `id` is the hash of the canonical body; the signature covers the same
/// bytes. `mint_reward` and `slash` originate from the system and carry no
/// signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash,
    pub kind: TxKind,
    pub sender: Address,
    pub recipient: Option<Address>,
    pub amount: Option<Amount>,
    pub payload: Value,
    pub timestamp: Timestamp,
    /// Hex Ed25519 signature; empty for system txs.
    pub signature: String,
}

impl Transaction {
    /// Build an unsigned transaction with its id precomputed.
    pub fn build(
        kind: TxKind,
        sender: Address,
        recipient: Option<Address>,
        amount: Option<Amount>,
        payload: Value,
    ) -> Self {
        let mut tx = Self {
            id: String::new(),
            kind,
            sender,
            recipient,
            amount,
            payload,
            timestamp: chrono::Utc::now().timestamp() as u64,
            signature: String::new(),
        };
        tx.id = tx.compute_id();
        tx
    }

    /// System-originated tx (mint, slash): sender "system", no signature.
    pub fn system(kind: TxKind, recipient: Address, amount: Amount, payload: Value) -> Self {
        Self::build(kind, SYSTEM_SENDER.to_string(), Some(recipient), Some(amount), payload)
    }

    /// Canonical body bytes: covered by both the id hash and the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.kind,
            self.sender,
            self.recipient.as_deref().unwrap_or("-"),
            self.amount.unwrap_or(0),
            canonical_json(&self.payload),
            self.timestamp,
        )
        .into_bytes()
    }

    pub fn compute_id(&self) -> Hash {
        sha3_hex(&self.signing_bytes())
    }

    /// System txs (mint, slash) carry no signature and may only enter
    /// blocks the node itself seals.
    pub fn is_system(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }

    pub fn governance_action(&self) -> Option<GovernanceAction> {
        if self.kind != TxKind::Governance {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tx {} from {}", self.kind, &self.id[..8.min(self.id.len())], self.sender)
    }
}

// --- Blocks ----------------------------------------------------------------

/// A sealed block. `signature` is the validator's Ed25519 signature over
/// `hash()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub height: BlockHeight,
    pub prev_hash: Hash,
    pub merkle_root: Hash,
    pub validator: Address,
    pub timestamp: Timestamp,
    pub transactions: Vec<Transaction>,
    pub signature: String,
}

impl Block {
    /// Block hash over the header fields (tx bodies are committed through
    /// the merkle root).
    pub fn hash(&self) -> Hash {
        sha3_hex(
            format!(
                "{}:{}:{}:{}:{}",
                self.height, self.prev_hash, self.merkle_root, self.validator, self.timestamp
            )
            .as_bytes(),
        )
    }

    pub fn compute_merkle_root(&self) -> Hash {
        let ids: Vec<Hash> = self.transactions.iter().map(|t| t.id.clone()).collect();
        merkle_root(&ids)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block #{} with {} txs", self.height, self.transactions.len())
    }
}

/// Merkle root over tx ids. Leaves are sorted first, so the root is
/// independent of submission order but sensitive to content.
pub fn merkle_root(tx_ids: &[Hash]) -> Hash {
    if tx_ids.is_empty() {
        return zero_hash();
    }
    let mut level: Vec<Hash> = tx_ids.to_vec();
    level.sort();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(sha3_hex(format!("{}{}", pair[0], right).as_bytes()));
        }
        level = next;
    }
    level.remove(0)
}

// --- Wallet view -----------------------------------------------------------

/// Balance pair maintained by folding accepted txs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub liquid: Amount,
    pub staked: Amount,
}

/// Read model derived by folding accepted txs; never stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletView {
    pub address: Address,
    pub liquid_balance: Amount,
    pub staked_balance: Amount,
    pub is_validator: bool,
}
