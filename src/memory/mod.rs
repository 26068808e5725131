//! Append-only reasoning DAG.
//!
//! The chain records economic truth; this DAG records reasoning provenance:
//! knowledge -> proposal -> rounds -> votes -> decision. Nodes are immutable
//! and parents must already exist, so the graph is acyclic by construction.
//! Only forward references are stored; the child index is rebuilt from scan.

use rocksdb::{IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::errors::{NodeError, NodeResult};
use crate::types::{sha3_hex, Hash, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Knowledge,
    Proposal,
    Round,
    Vote,
    Decision,
    Burn,
}

/// One node of the audit DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: Uuid,
    pub kind: MemoryKind,
    pub parents: Vec<Uuid>,
    pub payload_hash: Hash,
    pub agent_id: Option<String>,
    pub timestamp: Timestamp,
}

const NODE_PREFIX: &str = "node:";

/// Append-only DAG store backed by `memory.db`.
pub struct MemoryDag {
    db: DB,
    nodes: HashMap<Uuid, MemoryNode>,
    children: HashMap<Uuid, Vec<Uuid>>,
}

impl MemoryDag {
    /// Open (or create) the DAG store and rebuild the in-memory indices.
    pub fn open(path: &Path) -> NodeResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)
            .map_err(|e| NodeError::Fatal(format!("open memory.db: {e}")))?;

        let mut nodes = HashMap::new();
        let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for item in db.iterator(IteratorMode::Start) {
            let (key, value) = item.map_err(|e| NodeError::Fatal(format!("scan memory.db: {e}")))?;
            if !key.starts_with(NODE_PREFIX.as_bytes()) {
                continue;
            }
            let node: MemoryNode = bincode::deserialize(&value)
                .map_err(|e| NodeError::Integrity(format!("corrupt DAG node: {e}")))?;
            for parent in &node.parents {
                children.entry(*parent).or_default().push(node.id);
            }
            nodes.insert(node.id, node);
        }
        info!(nodes = nodes.len(), "memory DAG loaded");
        Ok(Self { db, nodes, children })
    }

    /// Append a node. Parents must already exist.
    pub fn append(
        &mut self,
        kind: MemoryKind,
        parents: Vec<Uuid>,
        payload: &[u8],
        agent_id: Option<String>,
    ) -> NodeResult<Uuid> {
        for parent in &parents {
            if !self.nodes.contains_key(parent) {
                return Err(NodeError::validation(format!("unknown DAG parent {parent}")));
            }
        }
        let node = MemoryNode {
            id: Uuid::new_v4(),
            kind,
            parents,
            payload_hash: sha3_hex(payload),
            agent_id,
            timestamp: chrono::Utc::now().timestamp() as u64,
        };
        let encoded = bincode::serialize(&node)
            .map_err(|e| NodeError::Fatal(format!("encode DAG node: {e}")))?;
        self.db
            .put(format!("{NODE_PREFIX}{}", node.id), encoded)
            .map_err(|e| NodeError::Fatal(format!("write DAG node: {e}")))?;

        let id = node.id;
        for parent in &node.parents {
            self.children.entry(*parent).or_default().push(id);
        }
        self.nodes.insert(id, node);
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&MemoryNode> {
        self.nodes.get(id)
    }

    /// Direct descendants, from the scan-rebuilt reverse index.
    pub fn children(&self, id: &Uuid) -> &[Uuid] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Walk ancestors breadth-first: the audit trail behind a node.
    pub fn lineage(&self, id: &Uuid) -> Vec<MemoryNode> {
        let mut out = Vec::new();
        let mut queue: Vec<Uuid> = vec![*id];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = queue.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.parents.iter().copied());
                out.push(node.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes of a given kind; audit queries.
    pub fn count_kind(&self, kind: MemoryKind) -> usize {
        self.nodes.values().filter(|n| n.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, MemoryDag) {
        let dir = tempfile::tempdir().unwrap();
        let dag = MemoryDag::open(&dir.path().join("memory.db")).unwrap();
        (dir, dag)
    }

    #[test]
    fn append_links_and_lineage() {
        let (_dir, mut dag) = open_temp();
        let know = dag.append(MemoryKind::Knowledge, vec![], b"ctx", None).unwrap();
        let prop = dag.append(MemoryKind::Proposal, vec![know], b"p1", None).unwrap();
        let vote = dag
            .append(MemoryKind::Vote, vec![prop], b"v", Some("seeker".into()))
            .unwrap();

        assert_eq!(dag.children(&know), &[prop]);
        let lineage = dag.lineage(&vote);
        assert_eq!(lineage.len(), 3);
        assert!(lineage.iter().any(|n| n.kind == MemoryKind::Knowledge));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let (_dir, mut dag) = open_temp();
        let err = dag.append(MemoryKind::Round, vec![Uuid::new_v4()], b"r", None);
        assert!(err.is_err());
    }

    #[test]
    fn reopen_rebuilds_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let (know, prop);
        {
            let mut dag = MemoryDag::open(&path).unwrap();
            know = dag.append(MemoryKind::Knowledge, vec![], b"ctx", None).unwrap();
            prop = dag.append(MemoryKind::Proposal, vec![know], b"p", None).unwrap();
        }
        let dag = MemoryDag::open(&path).unwrap();
        assert_eq!(dag.len(), 2);
        assert_eq!(dag.children(&know), &[prop]);
        assert_eq!(dag.get(&prop).unwrap().parents, vec![know]);
    }
}
