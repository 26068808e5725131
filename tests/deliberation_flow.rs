//! End-to-end deliberation scenarios against a scripted mock provider:
//! single-round approval with reward minting, refinement to approval, and
//! quorum failure.

use std::sync::Arc;
use std::time::Duration;

use orbis_ethica::agents::provider::{MockBehavior, MockProvider};
use orbis_ethica::agents::{Council, ReputationTable};
use orbis_ethica::config::{GovernanceParams, GovernanceStore};
use orbis_ethica::deliberation::DeliberationEngine;
use orbis_ethica::errors::ProviderError;
use orbis_ethica::events::{EventBus, NodeEvent};
use orbis_ethica::identity::NodeIdentity;
use orbis_ethica::ledger::worker::{LedgerHandle, LedgerWorker};
use orbis_ethica::ledger::ChainState;
use orbis_ethica::memory::MemoryDag;
use orbis_ethica::types::{Proposal, ProposalCategory, RoundOutcome, TxKind};

struct Harness {
    _dir: tempfile::TempDir,
    ledger: LedgerHandle,
    engine: Arc<DeliberationEngine>,
    events: EventBus,
}

async fn harness(mock: MockProvider, tweak: impl FnOnce(&mut GovernanceParams)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let identity = Arc::new(NodeIdentity::keygen());
    let mut params = GovernanceParams::default();
    tweak(&mut params);

    let chain = ChainState::open(dir.path(), identity.node_id().clone(), &params).unwrap();
    let events = EventBus::new();
    let governance = GovernanceStore::new(params);
    let params_rx = governance.watch();
    let (ledger, _join) = LedgerWorker::spawn(chain, identity.clone(), governance, events.clone());

    let dag = MemoryDag::open(&dir.path().join("memory.db")).unwrap();
    let engine = DeliberationEngine::new(
        Council::new(Arc::new(mock)),
        ReputationTable::in_memory(),
        ledger.clone(),
        identity.clone(),
        params_rx,
        events.clone(),
        dag,
    );
    Harness { _dir: dir, ledger, engine, events }
}

fn vote_json(decision: &str, score: f64, confidence: f64) -> String {
    serde_json::json!({
        "vote": decision,
        "U": score, "L": score, "F": score, "R": score,
        "confidence": confidence,
        "reasoning": format!("{decision} on balance"),
    })
    .to_string()
}

/// Collect events until the terminal for some proposal arrives (or panic
/// after the timeout).
async fn collect_until_terminal(
    rx: &mut tokio::sync::broadcast::Receiver<NodeEvent>,
) -> Vec<NodeEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("deliberation did not reach a terminal in time")
            .expect("event bus closed");
        let terminal = matches!(event, NodeEvent::DeliberationTerminal { .. });
        seen.push(event);
        if terminal {
            return seen;
        }
    }
}

// --- S1: single-node routine approval --------------------------------------

#[tokio::test]
async fn routine_proposal_approved_and_reward_minted() {
    let mock = MockProvider::new()
        .with_script("role: seeker", MockBehavior::Respond(vote_json("approve", 0.9, 0.9)))
        .with_script("role: guardian", MockBehavior::Respond(vote_json("approve", 0.8, 0.8)))
        .with_script("role: arbiter", MockBehavior::Respond(vote_json("approve", 0.75, 0.75)))
        .with_script("role: healer", MockBehavior::Respond(vote_json("approve", 0.8, 0.7)))
        .with_script("role: creator", MockBehavior::Respond(vote_json("abstain", 0.5, 0.5)))
        .with_script("role: mediator", MockBehavior::Respond(vote_json("abstain", 0.5, 0.5)));
    let h = harness(mock, |_| {}).await;
    let mut rx = h.events.subscribe();

    let submitter = NodeIdentity::keygen();
    let proposal = Proposal::new(
        "Share surplus grain".into(),
        "Distribute the granary surplus across districts".into(),
        ProposalCategory::Routine,
        "economy".into(),
        submitter.node_id().clone(),
    );
    let id = h.engine.admit(proposal).await.unwrap();

    let events = collect_until_terminal(&mut rx).await;
    assert!(matches!(events.first(), Some(NodeEvent::DeliberationStarted { proposal_id }) if *proposal_id == id));

    // One round: four approvals and two abstentions, S = 5/6.
    let rounds: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            NodeEvent::DeliberationRound { round_no, score, votes, .. } => {
                Some((*round_no, *score, votes.len()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].0, 1);
    assert!((rounds[0].1 - 0.8333).abs() < 1e-3, "S_1 = {}", rounds[0].1);
    assert_eq!(rounds[0].2, 6);

    match events.last().unwrap() {
        NodeEvent::DeliberationTerminal { proposal_id, outcome, score } => {
            assert_eq!(*proposal_id, id);
            assert_eq!(*outcome, RoundOutcome::Approved);
            assert!((score - 0.8333).abs() < 1e-3);
        }
        other => panic!("unexpected terminal {other:?}"),
    }

    // Terminal actions: a decision record and a 10 ETHC reward wait in the
    // mempool; sealing them credits the submitter.
    let snapshot = h.ledger.snapshot();
    assert!(snapshot.mempool.iter().any(|t| t.kind == TxKind::DecisionRecord));
    let reward = snapshot
        .mempool
        .iter()
        .find(|t| t.kind == TxKind::MintReward)
        .expect("mint reward pending");
    assert_eq!(reward.amount, Some(10));
    assert_eq!(reward.recipient.as_deref(), Some(submitter.node_id().as_str()));

    let block = h.ledger.propose_block().await.unwrap().unwrap();
    assert!(block.transactions.iter().any(|t| t.kind == TxKind::DecisionRecord));
    assert_eq!(h.ledger.snapshot().wallet(submitter.node_id()).liquid_balance, 10);

    // The decision carries its audit trail and there is exactly one.
    let decision = h.engine.decision(&id).await.unwrap();
    assert_eq!(decision.outcome, RoundOutcome::Approved);
    assert!(!decision.audit_refs.is_empty());
    assert_eq!(decision.rounds.len(), 1);

    // Aligned voters gained reputation, the misaligned abstainers lost.
    assert!(h.engine.reputation_of("seeker").await > 0.5);
    assert!(h.engine.reputation_of("creator").await < 0.5);
}

// --- S2: refinement to approval --------------------------------------------

#[tokio::test]
async fn high_impact_proposal_refined_then_approved() {
    let refined = serde_json::json!({
        "title": "Meter the tidal gates",
        "description": "Open the gates on a metered schedule with review.",
    })
    .to_string();

    let mock = MockProvider::new()
        // Mediator refinement must match ahead of the vote scripts.
        .with_script("/ refinement&Open the tidal gates", MockBehavior::Respond(refined))
        // Round 1 (original title): split council, score below tau.
        .with_script("seeker / evaluate&Open the tidal gates", MockBehavior::Respond(vote_json("approve", 0.8, 0.8)))
        .with_script("guardian / evaluate&Open the tidal gates", MockBehavior::Respond(vote_json("reject", 0.4, 0.8)))
        .with_script("/ evaluate&Open the tidal gates", MockBehavior::Respond(vote_json("abstain", 0.5, 0.4)))
        // Round 2 (refined title): unanimous approval.
        .with_script("Meter the tidal gates", MockBehavior::Respond(vote_json("approve", 0.85, 0.9)));
    let h = harness(mock, |_| {}).await;
    let mut rx = h.events.subscribe();

    let submitter = NodeIdentity::keygen();
    let parent = Proposal::new(
        "Open the tidal gates".into(),
        "Open the gates permanently".into(),
        ProposalCategory::HighImpact,
        "ecology".into(),
        submitter.node_id().clone(),
    );
    let parent_id = h.engine.admit(parent).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    // Two round events, one refined event, one terminal approved.
    let round_scores: Vec<(u32, f64)> = events
        .iter()
        .filter_map(|e| match e {
            NodeEvent::DeliberationRound { round_no, score, .. } => Some((*round_no, *score)),
            _ => None,
        })
        .collect();
    assert_eq!(round_scores.len(), 2);
    assert_eq!(round_scores[0].0, 1);
    assert!(round_scores[0].1 < 0.70, "S_1 = {}", round_scores[0].1);
    assert_eq!(round_scores[1].0, 2);
    assert!((round_scores[1].1 - 1.0).abs() < 1e-9);

    let (refined_parent, child_id) = events
        .iter()
        .find_map(|e| match e {
            NodeEvent::DeliberationRefined { parent_id, child_id } => Some((*parent_id, *child_id)),
            _ => None,
        })
        .expect("refined event");
    assert_eq!(refined_parent, parent_id);

    match events.last().unwrap() {
        NodeEvent::DeliberationTerminal { proposal_id, outcome, .. } => {
            assert_eq!(*proposal_id, child_id);
            assert_eq!(*outcome, RoundOutcome::Approved);
        }
        other => panic!("unexpected terminal {other:?}"),
    }

    // Parent decision is terminal `refined` and points at the child.
    let parent_decision = h.engine.decision(&parent_id).await.unwrap();
    assert_eq!(parent_decision.outcome, RoundOutcome::Refined);
    assert_eq!(
        parent_decision.rounds.last().unwrap().refined_proposal_id,
        Some(child_id)
    );

    let child = h.engine.proposal(&child_id).await.unwrap();
    assert_eq!(child.parent_id, Some(parent_id));
    assert_eq!(child.title, "Meter the tidal gates");
    assert_eq!(child.category, ProposalCategory::HighImpact);

    // Only the approved child mints a reward.
    let snapshot = h.ledger.snapshot();
    assert_eq!(snapshot.mempool.iter().filter(|t| t.kind == TxKind::MintReward).count(), 1);
}

// --- S3: quorum failure ----------------------------------------------------

#[tokio::test]
async fn provider_failures_past_quorum_time_out() {
    let mock = MockProvider::new()
        .with_script("role: seeker", MockBehavior::Fail(ProviderError::Unavailable("down".into())))
        .with_script("role: healer", MockBehavior::Fail(ProviderError::Unavailable("down".into())))
        .with_script("role: guardian", MockBehavior::Fail(ProviderError::Unavailable("down".into())))
        .with_script("role: creator", MockBehavior::Respond(vote_json("approve", 0.8, 0.8)))
        .with_script("role: arbiter", MockBehavior::Respond(vote_json("approve", 0.8, 0.8)))
        .with_script("role: mediator", MockBehavior::Respond(vote_json("approve", 0.8, 0.8)));
    let h = harness(mock, |p| p.round_deadline_secs = 2).await;
    let mut rx = h.events.subscribe();

    let proposal = Proposal::new(
        "Reroute the aqueduct".into(),
        "Divert flow to the southern farms".into(),
        ProposalCategory::Routine,
        "infrastructure".into(),
        NodeIdentity::keygen().node_id().clone(),
    );
    let id = h.engine.admit(proposal).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    // Three of six agents never voted: below the 4-vote quorum.
    match events.last().unwrap() {
        NodeEvent::DeliberationTerminal { proposal_id, outcome, .. } => {
            assert_eq!(*proposal_id, id);
            assert_eq!(*outcome, RoundOutcome::TimedOut);
        }
        other => panic!("unexpected terminal {other:?}"),
    }

    // Observers saw why the round degraded.
    assert!(events
        .iter()
        .any(|e| matches!(e, NodeEvent::DeliberationError { kind, .. } if kind == "provider")));

    // No decision record, no reward, reputations untouched.
    let snapshot = h.ledger.snapshot();
    assert!(snapshot.mempool.is_empty());
    for agent in ["seeker", "healer", "guardian", "creator", "arbiter", "mediator"] {
        assert_eq!(h.engine.reputation_of(agent).await, 0.5);
    }
    assert_eq!(h.engine.decision(&id).await.unwrap().outcome, RoundOutcome::TimedOut);
}

// --- Deadline cancellation -------------------------------------------------

#[tokio::test]
async fn stalled_agents_are_cancelled_at_the_round_deadline() {
    let mock = MockProvider::new()
        .with_script("role: seeker", MockBehavior::Stall { secs: 30 })
        .with_script("role: healer", MockBehavior::Stall { secs: 30 })
        .with_script("role: guardian", MockBehavior::Stall { secs: 30 });
    let h = harness(mock, |p| p.round_deadline_secs = 1).await;
    let mut rx = h.events.subscribe();

    let proposal = Proposal::new(
        "Night curfew".into(),
        "Impose a curfew during the storm season".into(),
        ProposalCategory::Routine,
        "safety".into(),
        NodeIdentity::keygen().node_id().clone(),
    );
    h.engine.admit(proposal).await.unwrap();

    let start = std::time::Instant::now();
    let events = collect_until_terminal(&mut rx).await;
    // The 30s stalls were cancelled by the 1s round deadline.
    assert!(start.elapsed() < Duration::from_secs(10));

    match events.last().unwrap() {
        NodeEvent::DeliberationTerminal { outcome, .. } => {
            assert_eq!(*outcome, RoundOutcome::TimedOut);
        }
        other => panic!("unexpected terminal {other:?}"),
    }

    // The stalled agents' abstains are still recorded in the round audit.
    // Quorum was missed, so no aggregated round event was ever published.
    assert!(!events.iter().any(|e| matches!(e, NodeEvent::DeliberationRound { .. })));
}

// --- Safety floor ----------------------------------------------------------

#[tokio::test]
async fn ulfr_safety_floor_forces_rejection() {
    // Every agent approves, but the ULFR profile is catastrophic.
    let toxic = serde_json::json!({
        "vote": "approve",
        "U": 0.05, "L": 0.05, "F": 0.02, "R": 0.02,
        "confidence": 0.95,
        "reasoning": "expedient but corrosive",
    })
    .to_string();
    let mock = MockProvider::new().with_script("role: ", MockBehavior::Respond(toxic));
    let h = harness(mock, |_| {}).await;
    let mut rx = h.events.subscribe();

    let proposal = Proposal::new(
        "Seize the commons".into(),
        "Transfer common land to the highest bidder".into(),
        ProposalCategory::Routine,
        "governance".into(),
        NodeIdentity::keygen().node_id().clone(),
    );
    let id = h.engine.admit(proposal).await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    match events.last().unwrap() {
        NodeEvent::DeliberationTerminal { proposal_id, outcome, .. } => {
            assert_eq!(*proposal_id, id);
            assert_eq!(*outcome, RoundOutcome::Rejected);
        }
        other => panic!("unexpected terminal {other:?}"),
    }
    assert!(h.ledger.snapshot().mempool.is_empty());
}
