pub mod call;
pub mod identity;
pub mod message;
pub mod presence;
pub mod quality;

pub use call::{
    CallParticipant, CallSession, CallState, CallType, EndReason, InviteStatus, MediaUpdate,
    ParticipantConnection,
};
pub use identity::{ConnectionId, DeviceId, DeviceIdentity};
pub use message::{DeliveryRecord, DeliveryState, NewMessage, ReactionAction, SendOutcome};
pub use presence::{PresenceRecord, PresenceStatus};
pub use quality::{QualityLabel, QualitySample, QualityThresholds};
