//! Call session state machine and roster types
//!
//! ```text
//! initiating -> ringing -> connecting -> active
//!      \           \            \          \
//!       +-----------+------------+----------+--> ended (terminal)
//! ```

use super::identity::{DeviceId, DeviceIdentity};
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Initiating,
    Ringing,
    Connecting,
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: CallState) -> bool {
        match (self, next) {
            (Self::Initiating, Self::Ringing)
            | (Self::Ringing, Self::Connecting)
            | (Self::Connecting, Self::Active) => true,
            (from, Self::Ended) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn accepts_joins(&self) -> bool {
        matches!(self, Self::Ringing | Self::Connecting | Self::Active)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    #[default]
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A participant hung up
    Hangup,
    /// Every invitee declined
    Declined,
    /// Nobody answered before the ring timeout
    Missed,
    /// Accepted but media never connected in time
    Timeout,
    /// The provider could not set the call up
    Failed,
    /// A drop left too few parties after the grace period
    PeerDisconnected,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hangup => "hangup",
            Self::Declined => "declined",
            Self::Missed => "missed",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::PeerDisconnected => "peer_disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantConnection {
    /// Token issued, media not confirmed yet
    Connecting,
    Connected,
    /// Transport dropped, inside the grace period
    Reconnecting,
    Left,
}

/// One stint of a device in a call. Re-joining after leaving creates a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallParticipant {
    pub participant_id: Uuid,
    pub call_id: Uuid,
    pub user_id: Uuid,
    pub device_id: DeviceId,
    pub connection_state: ParticipantConnection,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_share_enabled: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl CallParticipant {
    pub fn is_present(&self) -> bool {
        self.left_at.is_none()
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.user_id, self.device_id.clone())
    }

    pub fn is_device(&self, identity: &DeviceIdentity) -> bool {
        self.user_id == identity.user_id && self.device_id == identity.device_id
    }
}

/// Partial media toggle; `None` leaves the flag untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUpdate {
    #[serde(default)]
    pub audio_enabled: Option<bool>,
    #[serde(default)]
    pub video_enabled: Option<bool>,
    #[serde(default)]
    pub screen_share_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: Uuid,
    pub room_id: Option<String>,
    pub call_type: CallType,
    pub initiator_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub state: CallState,
    pub invitees: BTreeMap<Uuid, InviteStatus>,
    pub participants: Vec<CallParticipant>,
    pub created_at: DateTime<Utc>,
    /// When media first connected
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub ended_by: Option<Uuid>,
}

impl CallSession {
    pub fn new(
        call_id: Uuid,
        call_type: CallType,
        initiator_id: Uuid,
        conversation_id: Option<Uuid>,
        invitees: impl IntoIterator<Item = Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id,
            room_id: None,
            call_type,
            initiator_id,
            conversation_id,
            state: CallState::Initiating,
            invitees: invitees
                .into_iter()
                .map(|id| (id, InviteStatus::Pending))
                .collect(),
            participants: Vec::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
            end_reason: None,
            ended_by: None,
        }
    }

    /// Apply a state transition, returning the previous state
    pub fn transition(&mut self, next: CallState) -> Result<CallState, AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "{} -> {}",
                self.state, next
            )));
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    pub fn is_one_to_one(&self) -> bool {
        self.invitees.len() == 1
    }

    pub fn is_invited(&self, user_id: Uuid) -> bool {
        self.invitees.contains_key(&user_id)
    }

    /// Initiator, invitees and anyone who ever joined
    pub fn party_ids(&self) -> BTreeSet<Uuid> {
        let mut ids: BTreeSet<Uuid> = self.invitees.keys().copied().collect();
        ids.insert(self.initiator_id);
        ids.extend(self.participants.iter().map(|p| p.user_id));
        ids
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.initiator_id == user_id || self.is_invited(user_id)
    }

    pub fn present_participant(&self, identity: &DeviceIdentity) -> Option<&CallParticipant> {
        self.participants
            .iter()
            .find(|p| p.is_present() && p.is_device(identity))
    }

    pub fn present_participant_mut(
        &mut self,
        identity: &DeviceIdentity,
    ) -> Option<&mut CallParticipant> {
        self.participants
            .iter_mut()
            .find(|p| p.is_present() && p.is_device(identity))
    }

    pub fn is_present(&self, user_id: Uuid) -> bool {
        self.participants
            .iter()
            .any(|p| p.user_id == user_id && p.is_present())
    }

    /// Distinct users with at least one present device
    pub fn present_parties(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.is_present())
            .map(|p| p.user_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Distinct users whose media is confirmed
    pub fn connected_parties(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.is_present() && p.connection_state == ParticipantConnection::Connected)
            .map(|p| p.user_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Whether anyone other than the initiator ever joined
    pub fn answered(&self) -> bool {
        self.participants
            .iter()
            .any(|p| p.user_id != self.initiator_id)
    }

    /// Add a fresh participant record for `identity`
    pub fn add_participant(
        &mut self,
        identity: &DeviceIdentity,
        now: DateTime<Utc>,
    ) -> &CallParticipant {
        let participant = CallParticipant {
            participant_id: Uuid::new_v4(),
            call_id: self.call_id,
            user_id: identity.user_id,
            device_id: identity.device_id.clone(),
            connection_state: ParticipantConnection::Connecting,
            audio_enabled: true,
            video_enabled: self.call_type == CallType::Video,
            screen_share_enabled: false,
            joined_at: now,
            left_at: None,
        };
        self.participants.push(participant);
        &self.participants[self.participants.len() - 1]
    }

    pub fn duration_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.started_at?;
        let until = self.ended_at.unwrap_or(now);
        Some((until - started).num_milliseconds().max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CallState; 5] = [
        CallState::Initiating,
        CallState::Ringing,
        CallState::Connecting,
        CallState::Active,
        CallState::Ended,
    ];

    #[test]
    fn test_ringing_only_reaches_connecting_or_ended() {
        let reachable: Vec<CallState> = ALL
            .iter()
            .copied()
            .filter(|next| CallState::Ringing.can_transition_to(*next))
            .collect();
        assert_eq!(reachable, vec![CallState::Connecting, CallState::Ended]);
    }

    #[test]
    fn test_ended_is_terminal() {
        for next in ALL {
            assert!(!CallState::Ended.can_transition_to(next));
        }
    }

    #[test]
    fn test_transition_rejects_skips() {
        let mut session = CallSession::new(
            Uuid::new_v4(),
            CallType::Audio,
            Uuid::new_v4(),
            None,
            [Uuid::new_v4()],
            Utc::now(),
        );
        assert!(session.transition(CallState::Active).is_err());
        assert_eq!(
            session.transition(CallState::Ringing).unwrap(),
            CallState::Initiating
        );
        assert_eq!(session.state, CallState::Ringing);
    }

    #[test]
    fn test_rejoin_creates_new_record() {
        let user = Uuid::new_v4();
        let identity = DeviceIdentity::new(user, "laptop");
        let mut session = CallSession::new(
            Uuid::new_v4(),
            CallType::Video,
            user,
            None,
            [Uuid::new_v4()],
            Utc::now(),
        );
        session.add_participant(&identity, Utc::now());
        session.present_participant_mut(&identity).unwrap().left_at = Some(Utc::now());
        assert!(session.present_participant(&identity).is_none());

        session.add_participant(&identity, Utc::now());
        assert_eq!(session.participants.len(), 2);
        assert!(session.participants[0].left_at.is_some());
        assert!(session.present_participant(&identity).is_some());
    }
}
