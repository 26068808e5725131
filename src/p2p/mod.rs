//! Peer-to-peer mesh: authenticated gossip of txs and blocks, address-book
//! exchange, and longest-chain sync.

pub mod codec;
pub mod mesh;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::AuthError;
use crate::identity::NodeIdentity;
use crate::types::{sha3_hex, Block, BlockHeight, Hash, Timestamp, Transaction};

/// Address book capacity.
pub const MAX_PEERS: usize = 64;

/// Seen-message cache capacity.
pub const SEEN_CACHE: usize = 10_000;

/// Hop budget for gossiped messages.
pub const MAX_HOPS: u32 = 7;

// --- Messages --------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        node_id: String,
        listen_addr: String,
        head_height: BlockHeight,
        head_hash: Hash,
        /// Address-book exchange piggybacked on the handshake.
        known_peers: Vec<String>,
    },
    GetBlocks {
        from_height: BlockHeight,
        limit: u64,
    },
    Blocks {
        blocks: Vec<Block>,
    },
    NewTx {
        tx: Transaction,
        hop_count: u32,
    },
    NewBlock {
        block: Block,
        hop_count: u32,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
}

impl Message {
    /// Gossip messages may be shed under backpressure; handshake and sync
    /// replies may not.
    pub fn is_gossip(&self) -> bool {
        matches!(self, Message::NewTx { .. } | Message::NewBlock { .. })
    }
}

/// Authenticated wrapper around every mesh message. The signature covers
/// `H(canonical_msg_json || nonce)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg: Message,
    pub sender_pubkey: String,
    pub nonce: u64,
    pub signature: String,
}

impl Envelope {
    fn digest(msg: &Message, nonce: u64) -> String {
        let body = serde_json::to_string(msg).expect("message encodes");
        sha3_hex(format!("{body}|{nonce}").as_bytes())
    }

    pub fn seal(identity: &NodeIdentity, msg: Message, nonce: u64) -> Self {
        let signature = identity.sign(Self::digest(&msg, nonce).as_bytes());
        Self { msg, sender_pubkey: identity.node_id().clone(), nonce, signature }
    }

    pub fn verify(&self) -> Result<(), AuthError> {
        let digest = Self::digest(&self.msg, self.nonce);
        if crate::identity::verify(&self.sender_pubkey, digest.as_bytes(), &self.signature) {
            Ok(())
        } else {
            Err(AuthError::InvalidSignature)
        }
    }
}

// --- Address book ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub address: String,
    pub last_seen: Timestamp,
    pub reputation: f64,
    #[serde(default)]
    pub greylisted_until: Option<Timestamp>,
}

/// Bounded peer table, persisted to `peers.json`.
#[derive(Debug, Default)]
pub struct AddressBook {
    peers: HashMap<String, PeerInfo>,
    path: Option<PathBuf>,
}

impl AddressBook {
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("peers.json");
        let peers = std::fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<Vec<PeerInfo>>(&raw).ok())
            .map(|list| list.into_iter().map(|p| (p.node_id.clone(), p)).collect())
            .unwrap_or_default();
        Self { peers, path: Some(path) }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    fn persist(&self) {
        if let Some(path) = &self.path {
            let list: Vec<&PeerInfo> = self.peers.values().collect();
            if let Ok(encoded) = serde_json::to_vec_pretty(&list) {
                if let Err(e) = std::fs::write(path, encoded) {
                    warn!("failed to persist peers.json: {e}");
                }
            }
        }
    }

    /// Insert or refresh a peer. The table is bounded; when full, the
    /// lowest-reputation peer is evicted first.
    pub fn upsert(&mut self, node_id: &str, address: &str) {
        let now = chrono::Utc::now().timestamp() as u64;
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.address = address.to_string();
            peer.last_seen = now;
        } else {
            if self.peers.len() >= MAX_PEERS {
                if let Some(worst) = self
                    .peers
                    .values()
                    .min_by(|a, b| a.reputation.total_cmp(&b.reputation))
                    .map(|p| p.node_id.clone())
                {
                    self.peers.remove(&worst);
                }
            }
            self.peers.insert(
                node_id.to_string(),
                PeerInfo {
                    node_id: node_id.to_string(),
                    address: address.to_string(),
                    last_seen: now,
                    reputation: 1.0,
                    greylisted_until: None,
                },
            );
        }
        self.persist();
    }

    pub fn touch(&mut self, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.last_seen = chrono::Utc::now().timestamp() as u64;
        }
    }

    /// Decrement reputation after invalid or duplicate traffic; repeated
    /// offenders are greylisted for `grey_secs`.
    pub fn penalize(&mut self, node_id: &str, amount: f64, grey_secs: u64) -> bool {
        let Some(peer) = self.peers.get_mut(node_id) else {
            return false;
        };
        peer.reputation = (peer.reputation - amount).max(0.0);
        let greylisted = peer.reputation <= 0.0;
        if greylisted {
            let until = chrono::Utc::now().timestamp() as u64 + grey_secs;
            peer.greylisted_until = Some(until);
            peer.reputation = 0.5;
            warn!(peer = node_id, until, "peer greylisted");
        }
        self.persist();
        greylisted
    }

    pub fn is_greylisted(&self, node_id: &str) -> bool {
        self.peers
            .get(node_id)
            .and_then(|p| p.greylisted_until)
            .map(|until| until > chrono::Utc::now().timestamp() as u64)
            .unwrap_or(false)
    }

    pub fn get(&self, node_id: &str) -> Option<&PeerInfo> {
        self.peers.get(node_id)
    }

    pub fn list(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// Addresses shared in a `Hello` exchange.
    pub fn shareable_addresses(&self, limit: usize) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| !self.is_greylisted(&p.node_id))
            .map(|p| p.address.clone())
            .take(limit)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// --- Seen cache ------------------------------------------------------------

/// Bounded LRU of message ids for gossip loop suppression.
#[derive(Debug)]
pub struct SeenCache {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self { set: HashSet::new(), order: VecDeque::new(), capacity }
    }

    /// Record an id; returns true when it was not seen before.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.set.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Build a signed `Hello` for the current chain head.
pub fn hello_for(
    identity: &NodeIdentity,
    listen_addr: &str,
    head_height: BlockHeight,
    head_hash: Hash,
    known_peers: Vec<String>,
    nonce: u64,
) -> Envelope {
    Envelope::seal(
        identity,
        Message::Hello {
            node_id: identity.node_id().clone(),
            listen_addr: listen_addr.to_string(),
            head_height,
            head_hash,
            known_peers,
        },
        nonce,
    )
}

/// JSON form exposed by `GET /api/peers`.
pub fn peer_table_json(book: &AddressBook) -> serde_json::Value {
    json!(book
        .list()
        .iter()
        .map(|p| {
            json!({
                "node_id": p.node_id,
                "address": p.address,
                "last_seen": p.last_seen,
                "reputation": p.reputation,
                "greylisted": book.is_greylisted(&p.node_id),
            })
        })
        .collect::<Vec<_>>())
}
