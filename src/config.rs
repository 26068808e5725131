//! Node configuration and governance parameters.
//!
//! `NodeConfig` is read once from the environment at boot. `GovernanceParams`
//! start from defaults, may be overlaid from `config.json`, and are mutated
//! at runtime only by accepted governance txs; readers take lock-free
//! snapshots through a watch channel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::errors::{NodeError, NodeResult};
use crate::types::{Amount, BlockHeight, ProposalCategory};

pub const DEFAULT_API_PORT: u16 = 6429;
pub const DEFAULT_P2P_PORT: u16 = 6430;

/// Which generative capability backs the agent council.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Mock,
    External,
}

/// Process configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub api_port: u16,
    pub p2p_port: u16,
    pub data_dir: PathBuf,
    pub seed_nodes: Vec<String>,
    pub provider: ProviderKind,
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
    /// Hex pubkey of the genesis validator; defaults to this node's own
    /// identity, which is right for the first node of a fresh network.
    pub genesis_validator: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            api_port: DEFAULT_API_PORT,
            p2p_port: DEFAULT_P2P_PORT,
            data_dir: PathBuf::from("./data"),
            seed_nodes: Vec::new(),
            provider: ProviderKind::Mock,
            provider_url: None,
            provider_api_key: None,
            genesis_validator: None,
        }
    }
}

impl NodeConfig {
    pub fn load_from_env() -> Self {
        use std::env;

        let mut config = Self::default();

        if let Ok(host) = env::var("NODE_HOST") {
            config.host = host;
        }
        if let Ok(port) = env::var("NODE_PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.api_port = p,
                Err(_) => warn!("invalid NODE_PORT value: {port}"),
            }
        }
        if let Ok(port) = env::var("P2P_PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.p2p_port = p,
                Err(_) => warn!("invalid P2P_PORT value: {port}"),
            }
        }
        if let Ok(dir) = env::var("ORBIS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(seeds) = env::var("SEED_NODES") {
            config.seed_nodes = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(provider) = env::var("GENERATIVE_PROVIDER") {
            config.provider = match provider.as_str() {
                "external" => ProviderKind::External,
                "mock" => ProviderKind::Mock,
                other => {
                    warn!("unknown GENERATIVE_PROVIDER {other}, falling back to mock");
                    ProviderKind::Mock
                }
            };
        }
        config.provider_url = env::var("PROVIDER_URL").ok();
        config.provider_api_key = env::var("PROVIDER_API_KEY").ok();
        config.genesis_validator = env::var("GENESIS_VALIDATOR").ok();
        config
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.api_port == 0 || self.p2p_port == 0 {
            return Err(NodeError::Fatal("ports cannot be 0".into()));
        }
        if self.api_port == self.p2p_port {
            return Err(NodeError::Fatal("API and P2P ports must differ".into()));
        }
        if self.provider == ProviderKind::External && self.provider_url.is_none() {
            return Err(NodeError::Fatal(
                "GENERATIVE_PROVIDER=external requires PROVIDER_URL".into(),
            ));
        }
        for seed in &self.seed_nodes {
            if !seed.contains(':') {
                return Err(NodeError::Fatal(format!("seed node '{seed}' is not host:port")));
            }
        }
        Ok(())
    }
}

// --- Governance parameters -------------------------------------------------

/// Tunable parameters with lifecycle defaults -> config.json -> governance tx.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceParams {
    /// Approval thresholds per proposal category.
    pub tau_routine: f64,
    pub tau_high_impact: f64,
    pub tau_constitutional: f64,
    pub tau_emergency: f64,
    /// τ_min = τ − tau_margin, floored at tau_min_floor.
    pub tau_margin: f64,
    pub tau_min_floor: f64,
    /// Maximum deliberation rounds per proposal.
    pub k_max: u32,
    /// Per-round deadline for each agent call, seconds.
    pub round_deadline_secs: u64,
    /// Fraction of the council that must vote before the deadline.
    pub quorum_fraction: f64,
    /// ULFR sanity-score weights and rejection floor.
    pub ulfr_alpha: f64,
    pub ulfr_beta: f64,
    pub ulfr_gamma: f64,
    pub ulfr_delta: f64,
    pub sanity_floor: f64,
    /// Reward minted to the submitter on approval.
    pub mint_reward: Amount,
    /// Blocks between a governance tx and its effect.
    pub authority_latency: u64,
    /// Reputation update rule.
    pub reputation_lambda: f64,
    pub reputation_step_up: f64,
    pub reputation_step_down: f64,
    /// Gossip and sync tuning.
    pub max_hops: u32,
    pub sync_batch: u64,
    pub greylist_secs: u64,
    /// Ledger bounds.
    pub max_tx_per_block: usize,
    pub max_mempool: usize,
    pub block_interval_secs: u64,
}

impl Default for GovernanceParams {
    fn default() -> Self {
        Self {
            tau_routine: 0.50,
            tau_high_impact: 0.70,
            tau_constitutional: 0.85,
            tau_emergency: 0.60,
            tau_margin: 0.10,
            tau_min_floor: 0.30,
            k_max: 4,
            round_deadline_secs: 60,
            quorum_fraction: 0.60,
            ulfr_alpha: 0.10,
            ulfr_beta: 0.10,
            ulfr_gamma: 0.45,
            ulfr_delta: 0.45,
            sanity_floor: 0.20,
            mint_reward: 10,
            authority_latency: 10,
            reputation_lambda: 1.0,
            reputation_step_up: 0.02,
            reputation_step_down: 0.05,
            max_hops: 7,
            sync_batch: 64,
            greylist_secs: 300,
            max_tx_per_block: 256,
            max_mempool: 10_000,
            block_interval_secs: 5,
        }
    }
}

impl GovernanceParams {
    /// Approval threshold for a category.
    pub fn tau(&self, category: ProposalCategory) -> f64 {
        match category {
            ProposalCategory::Routine => self.tau_routine,
            ProposalCategory::HighImpact => self.tau_high_impact,
            ProposalCategory::Constitutional => self.tau_constitutional,
            ProposalCategory::Emergency => self.tau_emergency,
        }
    }

    /// Rejection threshold for a category.
    pub fn tau_min(&self, category: ProposalCategory) -> f64 {
        (self.tau(category) - self.tau_margin).max(self.tau_min_floor)
    }

    /// Votes required for quorum given the council size.
    pub fn quorum(&self, council_size: usize) -> usize {
        (self.quorum_fraction * council_size as f64).ceil() as usize
    }

    /// Apply a `set_param` governance action by parameter name. Unknown
    /// names are rejected at tx validation, so this only warns.
    pub fn set_param(&mut self, name: &str, value: f64) {
        match name {
            "tau_routine" => self.tau_routine = value,
            "tau_high_impact" => self.tau_high_impact = value,
            "tau_constitutional" => self.tau_constitutional = value,
            "tau_emergency" => self.tau_emergency = value,
            "tau_margin" => self.tau_margin = value,
            "k_max" => self.k_max = value.max(1.0) as u32,
            "round_deadline_secs" => self.round_deadline_secs = value.max(1.0) as u64,
            "quorum_fraction" => self.quorum_fraction = value.clamp(0.0, 1.0),
            "ulfr_alpha" => self.ulfr_alpha = value,
            "ulfr_beta" => self.ulfr_beta = value,
            "ulfr_gamma" => self.ulfr_gamma = value,
            "ulfr_delta" => self.ulfr_delta = value,
            "sanity_floor" => self.sanity_floor = value.clamp(0.0, 1.0),
            "mint_reward" => self.mint_reward = value.max(0.0) as Amount,
            "authority_latency" => self.authority_latency = value.max(1.0) as u64,
            "reputation_lambda" => self.reputation_lambda = value,
            "reputation_step_up" => self.reputation_step_up = value,
            "reputation_step_down" => self.reputation_step_down = value,
            "max_hops" => self.max_hops = value.max(1.0) as u32,
            "sync_batch" => self.sync_batch = value.max(1.0) as u64,
            "greylist_secs" => self.greylist_secs = value.max(0.0) as u64,
            "max_tx_per_block" => self.max_tx_per_block = value.max(1.0) as usize,
            "max_mempool" => self.max_mempool = value.max(1.0) as usize,
            "block_interval_secs" => self.block_interval_secs = value.max(1.0) as u64,
            other => warn!("set_param for unknown governance parameter {other}"),
        }
    }

    pub fn is_known_param(name: &str) -> bool {
        const KNOWN: &[&str] = &[
            "tau_routine",
            "tau_high_impact",
            "tau_constitutional",
            "tau_emergency",
            "tau_margin",
            "k_max",
            "round_deadline_secs",
            "quorum_fraction",
            "ulfr_alpha",
            "ulfr_beta",
            "ulfr_gamma",
            "ulfr_delta",
            "sanity_floor",
            "mint_reward",
            "authority_latency",
            "reputation_lambda",
            "reputation_step_up",
            "reputation_step_down",
            "max_hops",
            "sync_batch",
            "greylist_secs",
            "max_tx_per_block",
            "max_mempool",
            "block_interval_secs",
        ];
        KNOWN.contains(&name)
    }
}

/// Governance state: current snapshot plus parameter changes waiting for
/// their effective height. Mutations happen only on the ledger worker.
pub struct GovernanceStore {
    tx: watch::Sender<Arc<GovernanceParams>>,
    pending: Vec<(BlockHeight, String, f64)>,
}

impl GovernanceStore {
    pub fn new(params: GovernanceParams) -> Self {
        let (tx, _) = watch::channel(Arc::new(params));
        Self { tx, pending: Vec::new() }
    }

    /// Reader handle: cheap to clone, lock-free snapshot on `borrow()`.
    pub fn watch(&self) -> watch::Receiver<Arc<GovernanceParams>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<GovernanceParams> {
        self.tx.borrow().clone()
    }

    /// Queue a parameter change, effective at the given height.
    pub fn schedule(&mut self, effective_height: BlockHeight, name: String, value: f64) {
        info!(param = %name, value, effective_height, "governance parameter change scheduled");
        self.pending.push((effective_height, name, value));
    }

    /// Apply all changes whose effective height has been reached.
    pub fn activate(&mut self, height: BlockHeight) {
        if self.pending.iter().all(|(h, _, _)| *h > height) {
            return;
        }
        let mut params = (**self.tx.borrow()).clone();
        self.pending.retain(|(h, name, value)| {
            if *h <= height {
                params.set_param(name, *value);
                info!(param = %name, value, height, "governance parameter change active");
                false
            } else {
                true
            }
        });
        let _ = self.tx.send(Arc::new(params));
    }
}

// --- config.json snapshot --------------------------------------------------

/// On-disk governance snapshot: parameters plus the agent reputation table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceSnapshot {
    #[serde(default)]
    pub params: Option<GovernanceParams>,
    #[serde(default)]
    pub reputation: HashMap<String, f64>,
}

pub fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

pub fn load_snapshot(data_dir: &Path) -> GovernanceSnapshot {
    let path = snapshot_path(data_dir);
    match std::fs::read(&path) {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(snap) => snap,
            Err(e) => {
                warn!("config.json unreadable ({e}), starting from defaults");
                GovernanceSnapshot::default()
            }
        },
        Err(_) => GovernanceSnapshot::default(),
    }
}

pub fn save_snapshot(data_dir: &Path, snapshot: &GovernanceSnapshot) -> NodeResult<()> {
    let path = snapshot_path(data_dir);
    let encoded = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| NodeError::Fatal(format!("encode config.json: {e}")))?;
    std::fs::write(&path, encoded).map_err(|e| NodeError::Fatal(format!("write config.json: {e}")))?;
    Ok(())
}
