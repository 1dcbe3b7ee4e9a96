use crate::models::{
    CallState, CallType, DeviceId, EndReason, ParticipantConnection, PresenceStatus,
    QualityLabel, ReactionAction,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound WebSocket events from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    // ============================================================
    // Messaging
    // ============================================================
    #[serde(rename = "message:send")]
    MessageSend {
        conversation_id: Uuid,
        /// Idempotency key; resend the same value when retrying
        client_message_id: String,
        payload: String,
    },
    #[serde(rename = "message:edit")]
    MessageEdit {
        conversation_id: Uuid,
        message_id: Uuid,
        payload: String,
    },
    #[serde(rename = "message:delete")]
    MessageDelete {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    #[serde(rename = "message:react")]
    MessageReact {
        conversation_id: Uuid,
        message_id: Uuid,
        emoji: String,
        action: ReactionAction,
    },
    /// Receipt acknowledgement for a pushed `message:new`
    #[serde(rename = "message:ack")]
    MessageAck { message_id: Uuid },
    #[serde(rename = "message:read")]
    MessageRead { message_id: Uuid },

    // ============================================================
    // Typing / presence
    // ============================================================
    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Uuid },
    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid },
    #[serde(rename = "presence:idle")]
    PresenceIdle,
    #[serde(rename = "heartbeat")]
    Heartbeat,

    // ============================================================
    // Calls
    // ============================================================
    #[serde(rename = "call:initiate")]
    CallInitiate {
        participant_ids: Vec<Uuid>,
        #[serde(default)]
        call_type: CallType,
        #[serde(default)]
        conversation_id: Option<Uuid>,
    },
    #[serde(rename = "call:accept")]
    CallAccept { call_id: Uuid },
    #[serde(rename = "call:decline")]
    CallDecline { call_id: Uuid },
    #[serde(rename = "call:end")]
    CallEnd { call_id: Uuid },
    #[serde(rename = "call:toggle_audio")]
    CallToggleAudio { call_id: Uuid, enabled: bool },
    #[serde(rename = "call:toggle_video")]
    CallToggleVideo { call_id: Uuid, enabled: bool },
    #[serde(rename = "call:toggle_screen_share")]
    CallToggleScreenShare { call_id: Uuid, enabled: bool },
    /// Client confirms its media path to the room is up
    #[serde(rename = "call:media_connected")]
    CallMediaConnected { call_id: Uuid },
    #[serde(rename = "call:quality_update")]
    CallQualityUpdate {
        call_id: Uuid,
        jitter_ms: f64,
        packet_loss_pct: f64,
        rtt_ms: f64,
        bandwidth_kbps: f64,
    },
}

impl WsInboundEvent {
    /// Call the event targets, if any. Failures of call events are reported as `call:error`.
    pub fn call_id(&self) -> Option<Uuid> {
        match self {
            Self::CallAccept { call_id }
            | Self::CallDecline { call_id }
            | Self::CallEnd { call_id }
            | Self::CallToggleAudio { call_id, .. }
            | Self::CallToggleVideo { call_id, .. }
            | Self::CallToggleScreenShare { call_id, .. }
            | Self::CallMediaConnected { call_id }
            | Self::CallQualityUpdate { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }

    pub fn is_call_event(&self) -> bool {
        matches!(self, Self::CallInitiate { .. }) || self.call_id().is_some()
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageSend { .. } => "message:send",
            Self::MessageEdit { .. } => "message:edit",
            Self::MessageDelete { .. } => "message:delete",
            Self::MessageReact { .. } => "message:react",
            Self::MessageAck { .. } => "message:ack",
            Self::MessageRead { .. } => "message:read",
            Self::TypingStart { .. } => "typing:start",
            Self::TypingStop { .. } => "typing:stop",
            Self::PresenceIdle => "presence:idle",
            Self::Heartbeat => "heartbeat",
            Self::CallInitiate { .. } => "call:initiate",
            Self::CallAccept { .. } => "call:accept",
            Self::CallDecline { .. } => "call:decline",
            Self::CallEnd { .. } => "call:end",
            Self::CallToggleAudio { .. } => "call:toggle_audio",
            Self::CallToggleVideo { .. } => "call:toggle_video",
            Self::CallToggleScreenShare { .. } => "call:toggle_screen_share",
            Self::CallMediaConnected { .. } => "call:media_connected",
            Self::CallQualityUpdate { .. } => "call:quality_update",
        }
    }
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsOutboundEvent {
    // ============================================================
    // Messaging
    // ============================================================
    #[serde(rename = "message:new")]
    MessageNew {
        message_id: Uuid,
        client_message_id: String,
        conversation_id: Uuid,
        sender_id: Uuid,
        sender_device_id: DeviceId,
        payload: String,
        created_at: DateTime<Utc>,
    },
    /// Confirmation to the sending connection
    #[serde(rename = "message:sent")]
    MessageSent {
        message_id: Uuid,
        client_message_id: String,
        conversation_id: Uuid,
        duplicate: bool,
    },
    #[serde(rename = "message:edited")]
    MessageEdited {
        message_id: Uuid,
        conversation_id: Uuid,
        payload: String,
        edited_at: DateTime<Utc>,
    },
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        message_id: Uuid,
        conversation_id: Uuid,
    },
    #[serde(rename = "message:reaction")]
    MessageReaction {
        message_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        emoji: String,
        action: ReactionAction,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        message_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        device_id: DeviceId,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        message_id: Uuid,
        conversation_id: Uuid,
        user_id: Uuid,
        device_id: DeviceId,
    },

    // ============================================================
    // Typing / presence
    // ============================================================
    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Uuid, user_id: Uuid },
    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid, user_id: Uuid },
    #[serde(rename = "user:online")]
    UserOnline {
        user_id: Uuid,
        status: PresenceStatus,
    },
    #[serde(rename = "user:offline")]
    UserOffline {
        user_id: Uuid,
        last_seen_at: DateTime<Utc>,
    },

    // ============================================================
    // Calls
    // ============================================================
    #[serde(rename = "call:incoming")]
    CallIncoming {
        call_id: Uuid,
        initiator_id: Uuid,
        call_type: CallType,
        participant_ids: Vec<Uuid>,
        conversation_id: Option<Uuid>,
    },
    /// Room credentials for the connection that started or accepted a call
    #[serde(rename = "call:joined")]
    CallJoined {
        call_id: Uuid,
        room_id: String,
        token: String,
        url: String,
        expires_at: DateTime<Utc>,
        state: CallState,
    },
    #[serde(rename = "call:accepted")]
    CallAccepted {
        call_id: Uuid,
        user_id: Uuid,
        device_id: DeviceId,
    },
    #[serde(rename = "call:declined")]
    CallDeclined { call_id: Uuid, user_id: Uuid },
    #[serde(rename = "call:ended")]
    CallEnded {
        call_id: Uuid,
        reason: EndReason,
        ended_by: Option<Uuid>,
    },
    #[serde(rename = "call:participant_joined")]
    CallParticipantJoined {
        call_id: Uuid,
        user_id: Uuid,
        device_id: DeviceId,
    },
    #[serde(rename = "call:participant_left")]
    CallParticipantLeft {
        call_id: Uuid,
        user_id: Uuid,
        device_id: DeviceId,
    },
    #[serde(rename = "call:participant_updated")]
    CallParticipantUpdated {
        call_id: Uuid,
        user_id: Uuid,
        device_id: DeviceId,
        connection_state: ParticipantConnection,
        audio_enabled: bool,
        video_enabled: bool,
        screen_share_enabled: bool,
    },
    #[serde(rename = "call:state_changed")]
    CallStateChanged {
        call_id: Uuid,
        from: CallState,
        to: CallState,
    },
    #[serde(rename = "call:quality_warning")]
    CallQualityWarning {
        call_id: Uuid,
        user_id: Uuid,
        device_id: DeviceId,
        label: QualityLabel,
    },
    #[serde(rename = "call:error")]
    CallError {
        call_id: Option<Uuid>,
        code: String,
        message: String,
        retryable: bool,
    },

    /// Failure of a non-call command
    #[serde(rename = "error")]
    Error {
        request: String,
        code: String,
        message: String,
        retryable: bool,
    },
}

impl WsOutboundEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageNew { .. } => "message:new",
            Self::MessageSent { .. } => "message:sent",
            Self::MessageEdited { .. } => "message:edited",
            Self::MessageDeleted { .. } => "message:deleted",
            Self::MessageReaction { .. } => "message:reaction",
            Self::MessageDelivered { .. } => "message:delivered",
            Self::MessageRead { .. } => "message:read",
            Self::TypingStart { .. } => "typing:start",
            Self::TypingStop { .. } => "typing:stop",
            Self::UserOnline { .. } => "user:online",
            Self::UserOffline { .. } => "user:offline",
            Self::CallIncoming { .. } => "call:incoming",
            Self::CallJoined { .. } => "call:joined",
            Self::CallAccepted { .. } => "call:accepted",
            Self::CallDeclined { .. } => "call:declined",
            Self::CallEnded { .. } => "call:ended",
            Self::CallParticipantJoined { .. } => "call:participant_joined",
            Self::CallParticipantLeft { .. } => "call:participant_left",
            Self::CallParticipantUpdated { .. } => "call:participant_updated",
            Self::CallStateChanged { .. } => "call:state_changed",
            Self::CallQualityWarning { .. } => "call:quality_warning",
            Self::CallError { .. } => "call:error",
            Self::Error { .. } => "error",
        }
    }
}
