//! The agent council: six role-polymorphic evaluators over a generative
//! capability, plus the persistent reputation table that weights their votes.

pub mod provider;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{GovernanceParams, GovernanceSnapshot};
use crate::errors::{NodeResult, ProviderError};
use crate::types::{Proposal, UlfrScore, Vote, VoteDecision};

use provider::GenerativeCapability;

/// The six council roles. All six vote; the Mediator additionally produces
/// refinements and the Arbiter breaks exact-threshold ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Seeker,
    Healer,
    Guardian,
    Mediator,
    Creator,
    Arbiter,
}

pub const COUNCIL_ROLES: [AgentRole; 6] = [
    AgentRole::Seeker,
    AgentRole::Healer,
    AgentRole::Guardian,
    AgentRole::Mediator,
    AgentRole::Creator,
    AgentRole::Arbiter,
];

impl AgentRole {
    pub fn id(&self) -> &'static str {
        match self {
            AgentRole::Seeker => "seeker",
            AgentRole::Healer => "healer",
            AgentRole::Guardian => "guardian",
            AgentRole::Mediator => "mediator",
            AgentRole::Creator => "creator",
            AgentRole::Arbiter => "arbiter",
        }
    }

    /// Evaluation lens injected into the prompt.
    fn perspective(&self) -> &'static str {
        match self {
            AgentRole::Seeker => "maximize long-term collective utility and knowledge",
            AgentRole::Healer => "protect life, welfare and the vulnerable",
            AgentRole::Guardian => "guard rights, law and procedural fairness",
            AgentRole::Mediator => "seek common ground and workable compromise",
            AgentRole::Creator => "weigh innovation and generative possibility",
            AgentRole::Arbiter => "judge impartially on the weight of argument",
        }
    }
}

/// Expected agent response body. Field aliases tolerate both the short and
/// spelled-out key forms a model may emit.
#[derive(Debug, Deserialize)]
struct AgentResponse {
    vote: String,
    #[serde(alias = "utility")]
    #[serde(rename = "U")]
    u: f64,
    #[serde(alias = "life")]
    #[serde(rename = "L")]
    l: f64,
    #[serde(alias = "fairness")]
    #[serde(rename = "F")]
    f: f64,
    #[serde(alias = "rights")]
    #[serde(rename = "R")]
    r: f64,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RefinementResponse {
    title: String,
    description: String,
}

/// Extract the first JSON object from a possibly fenced response.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// One agent's outcome for a round: the (possibly degraded) vote plus
/// whether the agent actually responded. Only responding agents count
/// toward quorum.
#[derive(Debug, Clone)]
pub struct AgentBallot {
    pub vote: Vote,
    pub responded: bool,
    pub error: Option<String>,
}

/// A council member: a role, the shared generative capability, and its own
/// signing key binding votes to the agent.
pub struct CouncilAgent {
    pub role: AgentRole,
    provider: Arc<dyn GenerativeCapability>,
    signing: SigningKey,
}

impl CouncilAgent {
    fn new(role: AgentRole, provider: Arc<dyn GenerativeCapability>) -> Self {
        Self { role, provider, signing: SigningKey::generate(&mut OsRng) }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    fn evaluation_prompt(&self, proposal: &Proposal, memory_ctx: &str) -> String {
        format!(
            "role: {role} / evaluate\n\
             You deliberate ethical proposals; your lens: {lens}.\n\
             Proposal [{category}/{domain}]: {title}\n{description}\n\
             Context:\n{memory_ctx}\n\
             Respond with JSON {{\"vote\": approve|reject|abstain, \"U\": .., \"L\": .., \
             \"F\": .., \"R\": .., \"confidence\": .., \"reasoning\": ..}} with all scores in [0,1].",
            role = self.role.id(),
            lens = self.role.perspective(),
            category = proposal.category,
            domain = proposal.domain,
            title = proposal.title,
            description = proposal.description,
        )
    }

    /// Evaluate a proposal. Provider failure propagates; a malformed
    /// response degrades to a signed abstain rather than failing the round.
    pub async fn evaluate(
        &self,
        proposal: &Proposal,
        round: u32,
        memory_ctx: &str,
    ) -> Result<AgentBallot, ProviderError> {
        let prompt = self.evaluation_prompt(proposal, memory_ctx);
        let text = self.provider.generate(&prompt).await?;

        let ballot = match self.parse_vote(&text) {
            Ok((decision, ulfr, reasoning)) => AgentBallot {
                vote: self.signed_vote(proposal.id, round, decision, ulfr, reasoning),
                responded: true,
                error: None,
            },
            Err(parse_err) => {
                warn!(agent = self.role.id(), %parse_err, "unparseable agent response, degrading to abstain");
                AgentBallot {
                    vote: self.signed_vote(
                        proposal.id,
                        round,
                        VoteDecision::Abstain,
                        UlfrScore::neutral(),
                        format!("response rejected: {parse_err}"),
                    ),
                    responded: true,
                    error: Some(parse_err),
                }
            }
        };
        Ok(ballot)
    }

    fn parse_vote(&self, text: &str) -> Result<(VoteDecision, UlfrScore, String), String> {
        let body = extract_json(text).ok_or("no JSON object in response")?;
        let parsed: AgentResponse =
            serde_json::from_str(body).map_err(|e| format!("schema mismatch: {e}"))?;
        let decision = match parsed.vote.to_lowercase().as_str() {
            "approve" => VoteDecision::Approve,
            "reject" => VoteDecision::Reject,
            "abstain" => VoteDecision::Abstain,
            other => return Err(format!("unknown vote '{other}'")),
        };
        let ulfr = UlfrScore::new(parsed.u, parsed.l, parsed.f, parsed.r, parsed.confidence);
        Ok((decision, ulfr, parsed.reasoning))
    }

    pub(crate) fn signed_vote(
        &self,
        proposal_id: Uuid,
        round: u32,
        decision: VoteDecision,
        ulfr: UlfrScore,
        reasoning: String,
    ) -> Vote {
        let mut vote = Vote {
            agent_id: self.role.id().to_string(),
            proposal_id,
            round,
            decision,
            ulfr,
            reasoning,
            signature: String::new(),
        };
        vote.signature = hex::encode(self.signing.sign(&vote.signing_bytes()).to_bytes());
        vote
    }

    /// Synthesize the abstain recorded when this agent never responded
    /// (deadline or persistent provider failure). Unsigned and excluded
    /// from quorum.
    pub fn silent_abstain(&self, proposal_id: Uuid, round: u32, reason: &str) -> AgentBallot {
        AgentBallot {
            vote: Vote {
                agent_id: self.role.id().to_string(),
                proposal_id,
                round,
                decision: VoteDecision::Abstain,
                ulfr: UlfrScore::neutral(),
                reasoning: format!("no response: {reason}"),
                signature: String::new(),
            },
            responded: false,
            error: Some(reason.to_string()),
        }
    }
}

/// The fixed six-member council. Immutable after construction; the
/// reputation table lives with the deliberation engine, which is the only
/// writer.
pub struct Council {
    agents: Vec<CouncilAgent>,
}

impl Council {
    pub fn new(provider: Arc<dyn GenerativeCapability>) -> Self {
        let agents = COUNCIL_ROLES
            .iter()
            .map(|role| CouncilAgent::new(*role, provider.clone()))
            .collect();
        Self { agents }
    }

    pub fn agents(&self) -> &[CouncilAgent] {
        &self.agents
    }

    pub fn size(&self) -> usize {
        self.agents.len()
    }

    pub fn agent(&self, role: AgentRole) -> &CouncilAgent {
        self.agents.iter().find(|a| a.role == role).expect("council is complete")
    }

    /// Verify a vote signature against the council registry.
    pub fn verify_vote(&self, vote: &Vote) -> bool {
        let Some(agent) = self.agents.iter().find(|a| a.role.id() == vote.agent_id) else {
            return false;
        };
        crate::identity::verify(&agent.public_key_hex(), &vote.signing_bytes(), &vote.signature)
    }

    /// Ask the Mediator for a refinement. Provider or parse failure falls
    /// back to a deterministic locally-built refinement so the state machine
    /// always has a child proposal to continue with.
    pub async fn refine(&self, proposal: &Proposal, prior_reasoning: &[String]) -> (Proposal, Option<String>) {
        let mediator = self.agent(AgentRole::Mediator);
        let prompt = format!(
            "role: mediator / refinement\n\
             The council could not reach consensus on [{category}] {title}:\n{description}\n\
             Round reasoning:\n{reasoning}\n\
             Produce a refinement. Respond with JSON {{\"title\": .., \"description\": ..}}.",
            category = proposal.category,
            title = proposal.title,
            description = proposal.description,
            reasoning = prior_reasoning.join("\n"),
        );

        match mediator.provider.generate(&prompt).await {
            Ok(text) => match extract_json(&text)
                .ok_or_else(|| "no JSON object in refinement".to_string())
                .and_then(|body| {
                    serde_json::from_str::<RefinementResponse>(body).map_err(|e| e.to_string())
                }) {
                Ok(refined) => (proposal.refinement(refined.title, refined.description), None),
                Err(e) => {
                    warn!(%e, "mediator refinement unparseable, using fallback");
                    (fallback_refinement(proposal), Some(e))
                }
            },
            Err(e) => {
                warn!(%e, "mediator refinement failed, using fallback");
                (fallback_refinement(proposal), Some(e.to_string()))
            }
        }
    }
}

fn fallback_refinement(proposal: &Proposal) -> Proposal {
    proposal.refinement(
        format!("{} (refined)", proposal.title),
        format!("{}\n\nRefined: narrowed scope pending further deliberation.", proposal.description),
    )
}

// --- Reputation ------------------------------------------------------------

/// Per-agent reputation in [0, 1], persisted in the governance snapshot and
/// updated only on terminal outcomes.
pub struct ReputationTable {
    weights: HashMap<String, f64>,
    data_dir: Option<PathBuf>,
}

pub const INITIAL_REPUTATION: f64 = 0.5;

impl ReputationTable {
    pub fn in_memory() -> Self {
        Self { weights: HashMap::new(), data_dir: None }
    }

    /// Load from the data dir's governance snapshot.
    pub fn load(data_dir: PathBuf) -> Self {
        let snapshot = crate::config::load_snapshot(&data_dir);
        Self { weights: snapshot.reputation, data_dir: Some(data_dir) }
    }

    pub fn weight(&self, agent_id: &str) -> f64 {
        self.weights.get(agent_id).copied().unwrap_or(INITIAL_REPUTATION)
    }

    /// Apply the terminal-outcome update for each responding voter:
    /// `w <- clamp(w + λ·(aligned ? +step_up : −step_down))`.
    pub fn update_on_terminal(
        &mut self,
        ballots: &[AgentBallot],
        weighted_score: f64,
        params: &GovernanceParams,
    ) {
        for ballot in ballots.iter().filter(|b| b.responded) {
            let vote_side = side(ballot.vote.decision.numeric());
            let score_side = side(weighted_score);
            let aligned = vote_side == score_side;
            let step = if aligned { params.reputation_step_up } else { -params.reputation_step_down };
            let current = self.weight(&ballot.vote.agent_id);
            let updated = (current + params.reputation_lambda * step).clamp(0.0, 1.0);
            debug!(agent = %ballot.vote.agent_id, current, updated, aligned, "reputation update");
            self.weights.insert(ballot.vote.agent_id.clone(), updated);
        }
        self.persist(params);
    }

    /// Immediate slash to zero on cryptographic misbehavior.
    pub fn slash(&mut self, agent_id: &str, params: &GovernanceParams) {
        warn!(agent = agent_id, "reputation slashed to zero");
        self.weights.insert(agent_id.to_string(), 0.0);
        self.persist(params);
    }

    fn persist(&self, params: &GovernanceParams) {
        if let Some(dir) = &self.data_dir {
            let snapshot = GovernanceSnapshot {
                params: Some(params.clone()),
                reputation: self.weights.clone(),
            };
            if let Err(e) = crate::config::save_snapshot(dir, &snapshot) {
                warn!("failed to persist reputation snapshot: {e}");
            }
        }
    }

    pub fn persist_with(&self, params: &GovernanceParams) -> NodeResult<()> {
        if let Some(dir) = &self.data_dir {
            let snapshot = GovernanceSnapshot {
                params: Some(params.clone()),
                reputation: self.weights.clone(),
            };
            crate::config::save_snapshot(dir, &snapshot)?;
        }
        Ok(())
    }
}

/// Which side of the 0.5 midpoint a value falls on.
fn side(value: f64) -> i8 {
    const EPS: f64 = 1e-9;
    if value > 0.5 + EPS {
        1
    } else if value < 0.5 - EPS {
        -1
    } else {
        0
    }
}
