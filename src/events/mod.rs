//! Event bus: single-writer pub-sub fanning deliberation and ledger events
//! to any number of subscribers.
//!
//! Delivery is at-least-once and best-effort ordered per proposal and per
//! chain-tip progression. A subscriber that falls behind the bounded queue
//! is dropped after one `slow_consumer` notice; it may reconnect and resume
//! from live state.

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{BlockHeight, Hash, RoundOutcome, TxKind, Vote};

/// Bounded fan-out queue depth per subscriber.
pub const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum NodeEvent {
    DeliberationStarted {
        proposal_id: Uuid,
    },
    DeliberationRound {
        proposal_id: Uuid,
        round_no: u32,
        votes: Vec<Vote>,
        score: f64,
    },
    DeliberationRefined {
        parent_id: Uuid,
        child_id: Uuid,
    },
    DeliberationTerminal {
        proposal_id: Uuid,
        outcome: RoundOutcome,
        score: f64,
    },
    DeliberationError {
        proposal_id: Uuid,
        kind: String,
        message: String,
    },
    LedgerBlock {
        height: BlockHeight,
        hash: Hash,
    },
    LedgerTx {
        id: Hash,
        #[serde(rename = "type")]
        kind: TxKind,
    },
    SlowConsumer {
        missed: u64,
    },
}

impl NodeEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::DeliberationStarted { .. } => "deliberation.started",
            NodeEvent::DeliberationRound { .. } => "deliberation.round",
            NodeEvent::DeliberationRefined { .. } => "deliberation.refined",
            NodeEvent::DeliberationTerminal { .. } => "deliberation.terminal",
            NodeEvent::DeliberationError { .. } => "deliberation.error",
            NodeEvent::LedgerBlock { .. } => "ledger.block",
            NodeEvent::LedgerTx { .. } => "ledger.tx",
            NodeEvent::SlowConsumer { .. } => "slow_consumer",
        }
    }

    /// SSE data payload (the `data` field of the tagged encoding).
    pub fn data(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get("data").cloned().unwrap_or(Value::Null),
            _ => json!(null),
        }
    }
}

/// Fan-out handle. Cheap to clone; publishing never blocks the caller.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_QUEUE);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers drops events silently.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let id = Uuid::new_v4();
        bus.publish(NodeEvent::DeliberationStarted { proposal_id: id });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                NodeEvent::DeliberationStarted { proposal_id } => assert_eq!(proposal_id, id),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_observes_missed_count() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for height in 0..(EVENT_QUEUE as u64 + 10) {
            bus.publish(NodeEvent::LedgerBlock { height, hash: "ab".into() });
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed >= 10),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn event_names_match_stream_contract() {
        let ev = NodeEvent::LedgerTx { id: "ff".into(), kind: TxKind::MintReward };
        assert_eq!(ev.name(), "ledger.tx");
        let data = ev.data();
        assert_eq!(data["type"], "mint_reward");

        let ev = NodeEvent::DeliberationTerminal {
            proposal_id: Uuid::nil(),
            outcome: RoundOutcome::Approved,
            score: 0.8,
        };
        assert_eq!(ev.name(), "deliberation.terminal");
        assert_eq!(ev.data()["outcome"], "approved");
    }
}
