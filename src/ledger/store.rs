//! Persistent chain store (`chain.db`).
//!
//! Blocks are stored by hash; the active chain is an index of height to
//! hash. All writes come from the ledger worker, so the store needs no
//! internal locking. Startup replays the active index in height order and
//! the caller revalidates the chain before serving.

use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;

use crate::errors::{NodeError, NodeResult};
use crate::types::{Block, BlockHeight, Hash};

const BLOCK_PREFIX: &str = "blk:";
const ACTIVE_PREFIX: &str = "act:";
const META_HEAD_HEIGHT: &str = "meta:head_height";

pub struct ChainStore {
    db: DB,
}

impl ChainStore {
    pub fn open(path: &Path) -> NodeResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db =
            DB::open(&opts, path).map_err(|e| NodeError::Fatal(format!("open chain.db: {e}")))?;
        Ok(Self { db })
    }

    fn block_key(hash: &str) -> String {
        format!("{BLOCK_PREFIX}{hash}")
    }

    fn active_key(height: BlockHeight) -> String {
        format!("{ACTIVE_PREFIX}{height:016x}")
    }

    /// Store a block body by hash. Idempotent; side-chain blocks are kept
    /// for audit even when never active.
    pub fn put_block(&self, block: &Block) -> NodeResult<()> {
        let encoded = bincode::serialize(block)
            .map_err(|e| NodeError::Fatal(format!("encode block: {e}")))?;
        self.db
            .put(Self::block_key(&block.hash()), encoded)
            .map_err(|e| NodeError::Fatal(format!("write block: {e}")))?;
        Ok(())
    }

    pub fn get_block(&self, hash: &str) -> NodeResult<Option<Block>> {
        match self
            .db
            .get(Self::block_key(hash))
            .map_err(|e| NodeError::Fatal(format!("read block: {e}")))?
        {
            Some(raw) => Ok(Some(
                bincode::deserialize(&raw)
                    .map_err(|e| NodeError::Integrity(format!("corrupt block {hash}: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    /// Point the active index at `hash` for `height`.
    pub fn set_active(&self, height: BlockHeight, hash: &str) -> NodeResult<()> {
        self.db
            .put(Self::active_key(height), hash.as_bytes())
            .map_err(|e| NodeError::Fatal(format!("write active index: {e}")))?;
        Ok(())
    }

    /// Drop active-index entries above `height` (reorg to a shorter prefix
    /// before rewriting the new suffix).
    pub fn truncate_active_above(&self, height: BlockHeight) -> NodeResult<()> {
        let head = self.head_height()?.unwrap_or(0);
        for h in (height + 1)..=head {
            self.db
                .delete(Self::active_key(h))
                .map_err(|e| NodeError::Fatal(format!("truncate active index: {e}")))?;
        }
        Ok(())
    }

    pub fn set_head_height(&self, height: BlockHeight) -> NodeResult<()> {
        self.db
            .put(META_HEAD_HEIGHT, height.to_be_bytes())
            .map_err(|e| NodeError::Fatal(format!("write head height: {e}")))?;
        Ok(())
    }

    pub fn head_height(&self) -> NodeResult<Option<BlockHeight>> {
        Ok(self
            .db
            .get(META_HEAD_HEIGHT)
            .map_err(|e| NodeError::Fatal(format!("read head height: {e}")))?
            .map(|raw| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&raw[..8]);
                u64::from_be_bytes(arr)
            }))
    }

    /// Replay the active chain in height order. A missing entry in the
    /// index or a missing block body is an integrity failure.
    pub fn replay_active(&self) -> NodeResult<Vec<Block>> {
        let Some(head) = self.head_height()? else {
            return Ok(Vec::new());
        };
        let mut chain = Vec::with_capacity(head as usize + 1);
        for height in 0..=head {
            let hash = self
                .db
                .get(Self::active_key(height))
                .map_err(|e| NodeError::Fatal(format!("read active index: {e}")))?
                .ok_or_else(|| {
                    NodeError::Integrity(format!("active index gap at height {height}"))
                })?;
            let hash = String::from_utf8(hash)
                .map_err(|_| NodeError::Integrity(format!("bad index entry at {height}")))?;
            let block = self
                .get_block(&hash)?
                .ok_or_else(|| NodeError::Integrity(format!("missing block {hash} at {height}")))?;
            chain.push(block);
        }
        Ok(chain)
    }

    /// All stored blocks, active or side. Used to rebuild the fork index.
    pub fn all_blocks(&self) -> NodeResult<Vec<Block>> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item.map_err(|e| NodeError::Fatal(format!("scan chain.db: {e}")))?;
            if !key.starts_with(BLOCK_PREFIX.as_bytes()) {
                continue;
            }
            let block: Block = bincode::deserialize(&value)
                .map_err(|e| NodeError::Integrity(format!("corrupt block record: {e}")))?;
            out.push(block);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{merkle_root, zero_hash};

    fn block(height: BlockHeight, prev: Hash) -> Block {
        Block {
            height,
            prev_hash: prev,
            merkle_root: merkle_root(&[]),
            validator: "aa".into(),
            timestamp: height,
            transactions: vec![],
            signature: String::new(),
        }
    }

    #[test]
    fn replay_returns_height_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(&dir.path().join("chain.db")).unwrap();

        let b0 = block(0, zero_hash());
        let b1 = block(1, b0.hash());
        for (h, b) in [(0u64, &b0), (1u64, &b1)] {
            store.put_block(b).unwrap();
            store.set_active(h, &b.hash()).unwrap();
        }
        store.set_head_height(1).unwrap();

        let chain = store.replay_active().unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].prev_hash, chain[0].hash());
    }

    #[test]
    fn truncate_then_rewrite_models_reorg() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(&dir.path().join("chain.db")).unwrap();

        let b0 = block(0, zero_hash());
        let b1 = block(1, b0.hash());
        let mut b1_side = block(1, b0.hash());
        b1_side.validator = "bb".into();
        for (h, b) in [(0u64, &b0), (1u64, &b1)] {
            store.put_block(b).unwrap();
            store.set_active(h, &b.hash()).unwrap();
        }
        store.set_head_height(1).unwrap();

        // Switch height 1 to the side block.
        store.truncate_active_above(0).unwrap();
        store.put_block(&b1_side).unwrap();
        store.set_active(1, &b1_side.hash()).unwrap();
        store.set_head_height(1).unwrap();

        let chain = store.replay_active().unwrap();
        assert_eq!(chain[1].hash(), b1_side.hash());
        // The orphaned body is retained for audit.
        assert!(store.get_block(&b1.hash()).unwrap().is_some());
    }

    #[test]
    fn missing_index_entry_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(&dir.path().join("chain.db")).unwrap();
        store.set_head_height(2).unwrap();
        match store.replay_active() {
            Err(NodeError::Integrity(msg)) => assert!(msg.contains("height 0")),
            other => panic!("expected integrity error, got {other:?}"),
        }
    }
}
