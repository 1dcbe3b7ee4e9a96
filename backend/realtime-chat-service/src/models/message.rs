use super::identity::DeviceIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-device delivery progress. Declaration order is the only legal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Queued,
    Delivered,
    Read,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

/// (message, recipient device) delivery state with a timestamp per transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub recipient: DeviceIdentity,
    pub state: DeliveryState,
    pub queued_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    /// Set when the record outlived the queue retention window undelivered
    pub stale: bool,
}

impl DeliveryRecord {
    pub fn queued(message_id: Uuid, recipient: DeviceIdentity, at: DateTime<Utc>) -> Self {
        Self {
            message_id,
            recipient,
            state: DeliveryState::Queued,
            queued_at: at,
            delivered_at: None,
            read_at: None,
            stale: false,
        }
    }

    /// Move forward to `target`.
    ///
    /// Returns `false` without touching the record when it is already at or
    /// past `target`. Reading a record that never saw `delivered` stamps both.
    pub fn advance(&mut self, target: DeliveryState, at: DateTime<Utc>) -> bool {
        if target <= self.state {
            return false;
        }
        if self.delivered_at.is_none() {
            self.delivered_at = Some(at);
        }
        if target == DeliveryState::Read {
            self.read_at = Some(at);
        }
        self.state = target;
        true
    }
}

/// Write request handed to the message store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub client_message_id: String,
    pub conversation_id: Uuid,
    pub sender: DeviceIdentity,
    /// Opaque (encrypted) payload, never inspected here
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a send request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub message_id: Uuid,
    pub client_message_id: String,
    pub conversation_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// True when the idempotency key matched an earlier send
    pub duplicate: bool,
    /// Recipient devices the message was fanned out to
    pub recipient_devices: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeliveryRecord {
        DeliveryRecord::queued(
            Uuid::new_v4(),
            DeviceIdentity::new(Uuid::new_v4(), "phone"),
            Utc::now(),
        )
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut rec = record();
        assert!(rec.advance(DeliveryState::Delivered, Utc::now()));
        assert!(rec.advance(DeliveryState::Read, Utc::now()));

        assert!(!rec.advance(DeliveryState::Delivered, Utc::now()));
        assert!(!rec.advance(DeliveryState::Queued, Utc::now()));
        assert_eq!(rec.state, DeliveryState::Read);
    }

    #[test]
    fn test_read_implies_delivered() {
        let mut rec = record();
        let at = Utc::now();
        assert!(rec.advance(DeliveryState::Read, at));
        assert_eq!(rec.delivered_at, Some(at));
        assert_eq!(rec.read_at, Some(at));
    }
}
