//! The deliberation engine: a bounded-round state machine per proposal.
//!
//! ```text
//! Admitted -> Round(k) -> [Aggregate] ->
//!    approved  (S >= tau)                 -> Terminal, decision + mint txs
//!  | refined   (S < tau, k < K_max)       -> Mediator child -> Round(k+1)
//!  | rejected  (S < tau, k = K_max)       -> Terminal
//!  | timed_out (quorum missed)            -> Terminal
//! ```
//!
//! Within one proposal rounds are strictly sequential; across proposals the
//! engine runs up to `P_DELIB` deliberations concurrently. Reputation is
//! mutated only here, on terminal outcomes.

use futures_util::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{AgentBallot, AgentRole, Council, ReputationTable};
use crate::config::GovernanceParams;
use crate::errors::{NodeError, NodeResult};
use crate::events::{EventBus, NodeEvent};
use crate::identity::NodeIdentity;
use crate::ledger::worker::LedgerHandle;
use crate::memory::{MemoryDag, MemoryKind};
use crate::p2p::mesh::Mesh;
use crate::types::{
    Decision, Proposal, RoundOutcome, RoundResult, Transaction, TxKind, Vote, VoteDecision,
};

/// Concurrent deliberation bound.
pub const P_DELIB: usize = 8;

/// Exact-threshold tolerance for the Arbiter tie-break.
const SCORE_EPS: f64 = 1e-9;

pub struct DeliberationEngine {
    council: Arc<Council>,
    reputation: Mutex<ReputationTable>,
    ledger: LedgerHandle,
    identity: Arc<NodeIdentity>,
    params: watch::Receiver<Arc<GovernanceParams>>,
    events: EventBus,
    dag: Mutex<MemoryDag>,
    proposals: Mutex<HashMap<Uuid, Proposal>>,
    decisions: Mutex<HashMap<Uuid, Decision>>,
    /// Recent ingested knowledge topics, surfaced to agents as context.
    knowledge_topics: Mutex<Vec<String>>,
    /// First signed ballot seen per (agent, proposal, round). A second,
    /// different signed ballot for the same key is a double vote (I7).
    vote_registry: Mutex<HashMap<(String, Uuid, u32), Vote>>,
    limiter: Arc<Semaphore>,
    mesh: Mutex<Option<Arc<Mesh>>>,
}

/// Knowledge topics kept for agent context.
const KNOWLEDGE_CTX: usize = 16;

impl DeliberationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        council: Council,
        reputation: ReputationTable,
        ledger: LedgerHandle,
        identity: Arc<NodeIdentity>,
        params: watch::Receiver<Arc<GovernanceParams>>,
        events: EventBus,
        dag: MemoryDag,
    ) -> Arc<Self> {
        Arc::new(Self {
            council: Arc::new(council),
            reputation: Mutex::new(reputation),
            ledger,
            identity,
            params,
            events,
            dag: Mutex::new(dag),
            proposals: Mutex::new(HashMap::new()),
            decisions: Mutex::new(HashMap::new()),
            knowledge_topics: Mutex::new(Vec::new()),
            vote_registry: Mutex::new(HashMap::new()),
            limiter: Arc::new(Semaphore::new(P_DELIB)),
            mesh: Mutex::new(None),
        })
    }

    /// Wire the gossip mesh in after construction (the mesh needs the
    /// ledger handle first).
    pub async fn set_mesh(&self, mesh: Arc<Mesh>) {
        *self.mesh.lock().await = Some(mesh);
    }

    fn params(&self) -> Arc<GovernanceParams> {
        self.params.borrow().clone()
    }

    pub async fn decision(&self, proposal_id: &Uuid) -> Option<Decision> {
        self.decisions.lock().await.get(proposal_id).cloned()
    }

    pub async fn proposal(&self, proposal_id: &Uuid) -> Option<Proposal> {
        self.proposals.lock().await.get(proposal_id).cloned()
    }

    /// Current reputation weight of a council agent.
    pub async fn reputation_of(&self, agent_id: &str) -> f64 {
        self.reputation.lock().await.weight(agent_id)
    }

    /// Record externally ingested knowledge in the DAG so later
    /// deliberations can cite it.
    pub async fn record_knowledge(&self, tx: &Transaction) -> NodeResult<Uuid> {
        if tx.kind != TxKind::KnowledgeIngest {
            return Err(NodeError::validation("not a knowledge_ingest tx"));
        }
        let payload = serde_json::to_vec(&tx.payload)
            .map_err(|e| NodeError::validation(format!("knowledge payload: {e}")))?;
        if let Some(topic) = tx.payload.get("topic").and_then(|v| v.as_str()) {
            let mut topics = self.knowledge_topics.lock().await;
            topics.push(topic.to_string());
            if topics.len() > KNOWLEDGE_CTX {
                topics.remove(0);
            }
        }
        self.dag.lock().await.append(MemoryKind::Knowledge, vec![], &payload, None)
    }

    /// Register a signed ballot, enforcing one vote per agent per round.
    /// Two different validly signed ballots for the same (agent, proposal,
    /// round) are cryptographic misbehavior: the agent's reputation is
    /// slashed to zero immediately and a burn node records it. Returns
    /// false when the ballot was a conflicting double vote.
    pub(crate) async fn observe_ballot(&self, vote: &Vote) -> bool {
        if vote.signature.is_empty() || !self.council.verify_vote(vote) {
            // Unsigned degradation ballots carry nothing to double-spend.
            return true;
        }
        let key = (vote.agent_id.clone(), vote.proposal_id, vote.round);
        let first = {
            let mut registry = self.vote_registry.lock().await;
            match registry.get(&key).cloned() {
                None => {
                    registry.insert(key, vote.clone());
                    return true;
                }
                Some(first) if first.signing_bytes() == vote.signing_bytes() => return true,
                Some(first) => first,
            }
        };

        let params = self.params();
        warn!(
            agent = %vote.agent_id,
            proposal = %vote.proposal_id,
            round = vote.round,
            "double vote detected, slashing agent reputation"
        );
        self.reputation.lock().await.slash(&vote.agent_id, &params);
        let payload = json!({
            "reason": "double_vote",
            "agent": vote.agent_id,
            "proposal_id": vote.proposal_id,
            "round": vote.round,
            "first": crate::types::sha3_hex(&first.signing_bytes()),
            "second": crate::types::sha3_hex(&vote.signing_bytes()),
        });
        if let Err(e) = self.dag.lock().await.append(
            MemoryKind::Burn,
            vec![],
            payload.to_string().as_bytes(),
            Some(vote.agent_id.clone()),
        ) {
            warn!(%e, "double-vote burn node not recorded");
        }
        self.events.publish(NodeEvent::DeliberationError {
            proposal_id: vote.proposal_id,
            kind: "auth".into(),
            message: format!("{} double-voted in round {}", vote.agent_id, vote.round),
        });
        false
    }

    /// Record a sealed burn (slash) in the audit DAG.
    pub async fn record_burn(&self, tx: &Transaction) -> NodeResult<Uuid> {
        if tx.kind != TxKind::Slash {
            return Err(NodeError::validation("not a slash tx"));
        }
        let payload = serde_json::to_vec(&tx.payload)
            .map_err(|e| NodeError::validation(format!("slash payload: {e}")))?;
        self.dag.lock().await.append(MemoryKind::Burn, vec![], &payload, None)
    }

    /// Admit a proposal and start its deliberation. Fails with a capacity
    /// error when `P_DELIB` deliberations are already running.
    pub async fn admit(self: &Arc<Self>, proposal: Proposal) -> NodeResult<Uuid> {
        if proposal.title.trim().is_empty() || proposal.description.trim().is_empty() {
            return Err(NodeError::validation("proposal needs a title and description"));
        }
        let permit = self
            .limiter
            .clone()
            .try_acquire_owned()
            .map_err(|_| NodeError::backpressure("deliberation capacity exhausted"))?;

        let id = proposal.id;
        self.proposals.lock().await.insert(id, proposal.clone());

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_deliberation(proposal, permit).await;
        });
        Ok(id)
    }

    async fn run_deliberation(self: Arc<Self>, admitted: Proposal, _permit: OwnedSemaphorePermit) {
        let root_id = admitted.id;
        self.events.publish(NodeEvent::DeliberationStarted { proposal_id: root_id });
        info!(proposal = %root_id, title = %admitted.title, "deliberation started");

        let mut proposal = admitted;
        let mut proposal_node = match self.append_proposal_node(&proposal, None).await {
            Ok(node) => node,
            Err(e) => {
                self.publish_error(root_id, &e);
                return;
            }
        };

        let mut audit_refs = vec![proposal_node];
        let mut rounds: Vec<RoundResult> = Vec::new();
        let mut prior_reasoning: Vec<String> = Vec::new();
        let mut round_no: u32 = 0;

        loop {
            round_no += 1;
            let params = self.params();
            let (ballots, round_node) =
                self.run_round(&proposal, round_no, proposal_node, &prior_reasoning).await;
            if let Some(node) = round_node {
                audit_refs.push(node);
            }

            let responded: Vec<&AgentBallot> = ballots.iter().filter(|b| b.responded).collect();
            let quorum = params.quorum(self.council.size());

            if responded.len() < quorum {
                warn!(
                    proposal = %proposal.id,
                    responded = responded.len(),
                    quorum,
                    "quorum missed, deliberation timed out"
                );
                let result = RoundResult {
                    round_no,
                    votes: ballots.iter().map(|b| b.vote.clone()).collect(),
                    weighted_score: 0.0,
                    sanity_score: 0.0,
                    outcome: RoundOutcome::TimedOut,
                    refined_proposal_id: None,
                };
                rounds.push(result);
                self.finalize(&proposal, RoundOutcome::TimedOut, rounds, 0.0, audit_refs, None)
                    .await;
                return;
            }

            let score = self.weighted_score(&responded).await;
            let sanity = sanity_score(&responded, &params);
            self.events.publish(NodeEvent::DeliberationRound {
                proposal_id: proposal.id,
                round_no,
                votes: ballots.iter().map(|b| b.vote.clone()).collect(),
                score,
            });

            let outcome =
                self.round_outcome(&proposal, &ballots, score, sanity, round_no, &params);
            info!(
                proposal = %proposal.id,
                round = round_no,
                score,
                sanity,
                %outcome,
                "round aggregated"
            );

            let mut result = RoundResult {
                round_no,
                votes: ballots.iter().map(|b| b.vote.clone()).collect(),
                weighted_score: score,
                sanity_score: sanity,
                outcome,
                refined_proposal_id: None,
            };

            match outcome {
                RoundOutcome::Refined => {
                    let reasoning: Vec<String> = responded
                        .iter()
                        .map(|b| format!("{}: {}", b.vote.agent_id, b.vote.reasoning))
                        .collect();
                    let (child, refine_err) = self.council.refine(&proposal, &reasoning).await;
                    if let Some(err) = refine_err {
                        self.events.publish(NodeEvent::DeliberationError {
                            proposal_id: proposal.id,
                            kind: "provider".into(),
                            message: err,
                        });
                    }
                    result.refined_proposal_id = Some(child.id);
                    rounds.push(result);

                    // The parent reaches its terminal state; the child
                    // continues the round budget with fresh votes.
                    self.finalize(
                        &proposal,
                        RoundOutcome::Refined,
                        std::mem::take(&mut rounds),
                        score,
                        audit_refs.clone(),
                        Some(child.id),
                    )
                    .await;
                    self.events.publish(NodeEvent::DeliberationRefined {
                        parent_id: proposal.id,
                        child_id: child.id,
                    });

                    self.proposals.lock().await.insert(child.id, child.clone());
                    proposal_node = match self
                        .append_proposal_node(&child, Some(proposal_node))
                        .await
                    {
                        Ok(node) => node,
                        Err(e) => {
                            self.publish_error(child.id, &e);
                            return;
                        }
                    };
                    audit_refs.push(proposal_node);
                    prior_reasoning = reasoning;
                    proposal = child;
                }
                terminal => {
                    rounds.push(result);
                    self.finalize(&proposal, terminal, rounds, score, audit_refs, None).await;

                    // Alignment-based reputation update on the final round.
                    self.reputation.lock().await.update_on_terminal(&ballots, score, &params);
                    return;
                }
            }
        }
    }

    /// Completed outcome table; see DESIGN.md for the resolution of the
    /// spec's partial diagram.
    fn round_outcome(
        &self,
        proposal: &Proposal,
        ballots: &[AgentBallot],
        score: f64,
        sanity: f64,
        round_no: u32,
        params: &GovernanceParams,
    ) -> RoundOutcome {
        let tau = params.tau(proposal.category);
        let rounds_left = round_no < params.k_max;

        // Safety floor dominates everything.
        if sanity < params.sanity_floor {
            return RoundOutcome::Rejected;
        }

        // Exactly on the threshold: the Arbiter decides.
        if (score - tau).abs() < SCORE_EPS {
            let arbiter_approves = ballots.iter().any(|b| {
                b.responded
                    && b.vote.agent_id == AgentRole::Arbiter.id()
                    && b.vote.decision == VoteDecision::Approve
            });
            return if arbiter_approves {
                RoundOutcome::Approved
            } else if rounds_left {
                RoundOutcome::Refined
            } else {
                RoundOutcome::Rejected
            };
        }

        if score >= tau {
            RoundOutcome::Approved
        } else if rounds_left {
            RoundOutcome::Refined
        } else {
            RoundOutcome::Rejected
        }
    }

    /// Run one round: every agent evaluates under the per-round deadline.
    /// Deadline or provider failure records an unsigned abstain that does
    /// not count toward quorum.
    async fn run_round(
        &self,
        proposal: &Proposal,
        round_no: u32,
        proposal_node: Uuid,
        prior_reasoning: &[String],
    ) -> (Vec<AgentBallot>, Option<Uuid>) {
        let params = self.params();
        let deadline = Duration::from_secs(params.round_deadline_secs);
        let mut memory_ctx = String::new();
        {
            let topics = self.knowledge_topics.lock().await;
            if !topics.is_empty() {
                memory_ctx.push_str(&format!("known context: {}\n", topics.join(", ")));
            }
        }
        if prior_reasoning.is_empty() {
            memory_ctx.push_str("no prior rounds");
        } else {
            memory_ctx.push_str(&prior_reasoning.join("\n"));
        }

        let calls = self.council.agents().iter().map(|agent| {
            let memory_ctx = memory_ctx.clone();
            async move {
                match tokio::time::timeout(deadline, agent.evaluate(proposal, round_no, &memory_ctx))
                    .await
                {
                    Ok(Ok(ballot)) => ballot,
                    Ok(Err(provider_err)) => {
                        agent.silent_abstain(proposal.id, round_no, &provider_err.to_string())
                    }
                    Err(_) => agent.silent_abstain(proposal.id, round_no, "round deadline elapsed"),
                }
            }
        });
        let mut ballots = join_all(calls).await;

        // One signed ballot per agent per round (I7); a conflicting second
        // ballot slashes the agent and is discarded from the round.
        for ballot in ballots.iter_mut() {
            if ballot.responded && !self.observe_ballot(&ballot.vote).await {
                ballot.responded = false;
                ballot.error = None;
            }
        }

        for ballot in ballots.iter().filter(|b| !b.responded && b.error.is_some()) {
            self.events.publish(NodeEvent::DeliberationError {
                proposal_id: proposal.id,
                kind: "provider".into(),
                message: format!(
                    "{} abstained: {}",
                    ballot.vote.agent_id,
                    ballot.error.clone().unwrap_or_default()
                ),
            });
        }

        // Audit trail: a round node under the proposal, vote nodes under it.
        let round_node = {
            let mut dag = self.dag.lock().await;
            match dag.append(
                MemoryKind::Round,
                vec![proposal_node],
                format!("{}:{round_no}", proposal.id).as_bytes(),
                None,
            ) {
                Ok(node) => {
                    for ballot in &ballots {
                        let payload = serde_json::to_vec(&ballot.vote).unwrap_or_default();
                        if let Err(e) = dag.append(
                            MemoryKind::Vote,
                            vec![node],
                            &payload,
                            Some(ballot.vote.agent_id.clone()),
                        ) {
                            warn!(%e, "vote node not recorded");
                        }
                    }
                    Some(node)
                }
                Err(e) => {
                    warn!(%e, "round node not recorded");
                    None
                }
            }
        };
        (ballots, round_node)
    }

    /// `S_k = Σ w_i·v_i / Σ w_i` over responding agents.
    async fn weighted_score(&self, responded: &[&AgentBallot]) -> f64 {
        let reputation = self.reputation.lock().await;
        let mut num = 0.0;
        let mut den = 0.0;
        for ballot in responded {
            let w = reputation.weight(&ballot.vote.agent_id);
            num += w * ballot.vote.decision.numeric();
            den += w;
        }
        if den == 0.0 {
            0.5
        } else {
            num / den
        }
    }

    async fn append_proposal_node(
        &self,
        proposal: &Proposal,
        parent: Option<Uuid>,
    ) -> NodeResult<Uuid> {
        let payload = serde_json::to_vec(proposal)
            .map_err(|e| NodeError::Fatal(format!("encode proposal: {e}")))?;
        self.dag.lock().await.append(
            MemoryKind::Proposal,
            parent.into_iter().collect(),
            &payload,
            None,
        )
    }

    /// Create the (unique) decision, record it in the DAG, and on approval
    /// mint the reward and the decision-record tx.
    async fn finalize(
        &self,
        proposal: &Proposal,
        outcome: RoundOutcome,
        rounds: Vec<RoundResult>,
        score: f64,
        mut audit_refs: Vec<Uuid>,
        refined_into: Option<Uuid>,
    ) {
        {
            // I6: at most one decision per proposal.
            let mut decisions = self.decisions.lock().await;
            if decisions.contains_key(&proposal.id) {
                warn!(proposal = %proposal.id, "decision already recorded");
                return;
            }
            let decision_payload = json!({
                "proposal_id": proposal.id,
                "outcome": outcome.to_string(),
                "refined_into": refined_into,
            });
            if let Ok(node) = self.dag.lock().await.append(
                MemoryKind::Decision,
                audit_refs.clone(),
                decision_payload.to_string().as_bytes(),
                None,
            ) {
                audit_refs.push(node);
            }
            decisions.insert(
                proposal.id,
                Decision {
                    proposal_id: proposal.id,
                    outcome,
                    rounds,
                    weighted_score: score,
                    audit_refs: audit_refs.clone(),
                },
            );
        }

        // The proposal is settled; its ballots no longer need tracking.
        self.vote_registry.lock().await.retain(|(_, pid, _), _| *pid != proposal.id);

        if outcome == RoundOutcome::Approved {
            self.submit_terminal_txs(proposal, score, &audit_refs).await;
        }
        if outcome != RoundOutcome::Refined {
            self.events.publish(NodeEvent::DeliberationTerminal {
                proposal_id: proposal.id,
                outcome,
                score,
            });
        }
        info!(proposal = %proposal.id, %outcome, score, "deliberation terminal");
    }

    async fn submit_terminal_txs(&self, proposal: &Proposal, score: f64, audit_refs: &[Uuid]) {
        let params = self.params();

        let mut record = Transaction::build(
            TxKind::DecisionRecord,
            self.identity.node_id().clone(),
            None,
            None,
            json!({
                "proposal_id": proposal.id,
                "outcome": "approved",
                "weighted_score": score,
                "audit_refs": audit_refs,
            }),
        );
        record.signature = self.identity.sign(&record.signing_bytes());

        let reward = Transaction::system(
            TxKind::MintReward,
            proposal.submitter.clone(),
            params.mint_reward,
            json!({"proposal_id": proposal.id}),
        );

        for (tx, internal) in [(record, false), (reward, true)] {
            match self.ledger.submit_tx(tx.clone(), internal).await {
                Ok(_) => {
                    if let Some(mesh) = self.mesh.lock().await.clone() {
                        if !tx.is_system() {
                            mesh.broadcast_tx(tx).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(proposal = %proposal.id, %e, "terminal tx rejected");
                    self.publish_error(proposal.id, &e);
                }
            }
        }
    }

    fn publish_error(&self, proposal_id: Uuid, error: &NodeError) {
        self.events.publish(NodeEvent::DeliberationError {
            proposal_id,
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }
}

/// `Q_k`: ULFR-derived sanity score over the responding votes, clamped to
/// [0, 1]. Recorded for audit; only the safety floor gates outcomes.
fn sanity_score(responded: &[&AgentBallot], params: &GovernanceParams) -> f64 {
    if responded.is_empty() {
        return 0.0;
    }
    let n = responded.len() as f64;
    let (mut u, mut l, mut f, mut r) = (0.0, 0.0, 0.0, 0.0);
    for ballot in responded {
        u += ballot.vote.ulfr.utility;
        l += ballot.vote.ulfr.life;
        f += ballot.vote.ulfr.fairness;
        r += ballot.vote.ulfr.rights;
    }
    let (u, l, f, r) = (u / n, l / n, f / n, r / n);
    let q = 1.0 - (params.ulfr_gamma * (1.0 - f) + params.ulfr_delta * (1.0 - r))
        + params.ulfr_alpha * u
        + params.ulfr_beta * l;
    q.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UlfrScore;
    use crate::types::Vote;

    fn ballot(agent: &str, decision: VoteDecision, ulfr: UlfrScore) -> AgentBallot {
        AgentBallot {
            vote: Vote {
                agent_id: agent.into(),
                proposal_id: Uuid::nil(),
                round: 1,
                decision,
                ulfr,
                reasoning: String::new(),
                signature: String::new(),
            },
            responded: true,
            error: None,
        }
    }

    #[test]
    fn sanity_score_floor_is_reachable() {
        let params = GovernanceParams::default();
        let bad = ballot("seeker", VoteDecision::Reject, UlfrScore::new(0.05, 0.05, 0.02, 0.02, 0.9));
        let q = sanity_score(&[&bad], &params);
        assert!(q < params.sanity_floor, "q={q}");

        let good = ballot("seeker", VoteDecision::Approve, UlfrScore::new(0.8, 0.8, 0.9, 0.9, 0.9));
        let q = sanity_score(&[&good], &params);
        assert!(q > 0.8, "q={q}");
    }

    #[test]
    fn sanity_score_is_clamped() {
        let params = GovernanceParams::default();
        let perfect = ballot("a", VoteDecision::Approve, UlfrScore::new(1.0, 1.0, 1.0, 1.0, 1.0));
        assert_eq!(sanity_score(&[&perfect], &params), 1.0);
        assert_eq!(sanity_score(&[], &params), 0.0);
    }

    async fn engine_harness() -> (tempfile::TempDir, Arc<DeliberationEngine>, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(NodeIdentity::keygen());
        let params = GovernanceParams::default();
        let chain = crate::ledger::ChainState::open(dir.path(), identity.node_id().clone(), &params)
            .unwrap();
        let events = EventBus::new();
        let governance = crate::config::GovernanceStore::new(params);
        let params_rx = governance.watch();
        let (ledger, _join) = crate::ledger::worker::LedgerWorker::spawn(
            chain,
            identity.clone(),
            governance,
            events.clone(),
        );
        let dag = MemoryDag::open(&dir.path().join("memory.db")).unwrap();
        let engine = DeliberationEngine::new(
            Council::new(Arc::new(crate::agents::provider::MockProvider::new())),
            ReputationTable::in_memory(),
            ledger,
            identity,
            params_rx,
            events.clone(),
            dag,
        );
        (dir, engine, events)
    }

    #[tokio::test]
    async fn conflicting_signed_ballots_slash_the_agent() {
        let (_dir, engine, events) = engine_harness().await;
        let mut rx = events.subscribe();

        let arbiter = engine.council.agent(AgentRole::Arbiter);
        let pid = Uuid::new_v4();
        let first =
            arbiter.signed_vote(pid, 1, VoteDecision::Approve, UlfrScore::neutral(), "for".into());
        let second =
            arbiter.signed_vote(pid, 1, VoteDecision::Reject, UlfrScore::neutral(), "against".into());

        assert!(engine.observe_ballot(&first).await);
        // Re-observing the identical ballot is not misbehavior.
        assert!(engine.observe_ballot(&first).await);
        assert_eq!(engine.reputation_of("arbiter").await, 0.5);

        // A second, different signed ballot for the same round is.
        assert!(!engine.observe_ballot(&second).await);
        assert_eq!(engine.reputation_of("arbiter").await, 0.0);
        match rx.recv().await.unwrap() {
            NodeEvent::DeliberationError { proposal_id, kind, .. } => {
                assert_eq!(proposal_id, pid);
                assert_eq!(kind, "auth");
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The misbehavior left a burn node in the audit DAG.
        assert_eq!(engine.dag.lock().await.count_kind(MemoryKind::Burn), 1);
    }

    #[tokio::test]
    async fn unsigned_and_same_round_ballots_pass_observation() {
        let (_dir, engine, _events) = engine_harness().await;
        let arbiter = engine.council.agent(AgentRole::Arbiter);
        let pid = Uuid::new_v4();

        // Unsigned degradation ballots carry nothing to double-spend.
        let silent = arbiter.silent_abstain(pid, 1, "deadline");
        assert!(engine.observe_ballot(&silent.vote).await);

        // The same agent voting in a different round is fine.
        let r1 = arbiter.signed_vote(pid, 1, VoteDecision::Approve, UlfrScore::neutral(), "a".into());
        let r2 = arbiter.signed_vote(pid, 2, VoteDecision::Reject, UlfrScore::neutral(), "b".into());
        assert!(engine.observe_ballot(&r1).await);
        assert!(engine.observe_ballot(&r2).await);
        assert_eq!(engine.reputation_of("arbiter").await, 0.5);
    }
}
