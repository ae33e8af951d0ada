use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Domain events pushed to the realtime UI channel. Delivery is
/// fire-and-forget: saga completion never waits on a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum DomainEvent {
    #[serde(rename = "escrow:released")]
    EscrowReleased {
        invoice_id: Uuid,
        winner: String,
        amount: String,
        fee_amount: String,
        tx_hash: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "escrow:dispute")]
    EscrowDispute {
        invoice_id: Uuid,
        raised_by: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "escrow:approval-added")]
    EscrowApprovalAdded {
        invoice_id: Uuid,
        approver: String,
        approvals: u32,
        required: u32,
        at: DateTime<Utc>,
    },
    #[serde(rename = "insurance:purchased")]
    InsurancePurchased {
        invoice_id: Uuid,
        policy_holder: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "insurance:claim-filed")]
    InsuranceClaimFiled {
        invoice_id: Uuid,
        claimant: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "insurance:claim-approved")]
    InsuranceClaimApproved {
        invoice_id: Uuid,
        claimant: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Channel name as seen by the UI
    pub fn channel(&self) -> &'static str {
        match self {
            DomainEvent::EscrowReleased { .. } => "escrow:released",
            DomainEvent::EscrowDispute { .. } => "escrow:dispute",
            DomainEvent::EscrowApprovalAdded { .. } => "escrow:approval-added",
            DomainEvent::InsurancePurchased { .. } => "insurance:purchased",
            DomainEvent::InsuranceClaimFiled { .. } => "insurance:claim-filed",
            DomainEvent::InsuranceClaimApproved { .. } => "insurance:claim-approved",
        }
    }
}

const BROADCAST_CAPACITY: usize = 1000;

/// Fan-out publisher for domain events. Dropped messages (no subscribers,
/// lagging subscribers) are silently discarded.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: DomainEvent) {
        debug!("📡 Publishing {}", event.channel());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let publisher = EventPublisher::new();
        let mut rx = publisher.subscribe();

        let invoice_id = Uuid::new_v4();
        publisher.publish(DomainEvent::EscrowReleased {
            invoice_id,
            winner: "0xseller".into(),
            amount: "995".into(),
            fee_amount: "5".into(),
            tx_hash: "0xabc".into(),
            at: Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel(), "escrow:released");
        match received {
            DomainEvent::EscrowReleased { invoice_id: id, .. } => assert_eq!(id, invoice_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let publisher = EventPublisher::new();
        // Must not panic or block
        publisher.publish(DomainEvent::InsurancePurchased {
            invoice_id: Uuid::new_v4(),
            policy_holder: "0xbuyer".into(),
            at: Utc::now(),
        });
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
