pub mod call_service;
pub mod lifecycle;
pub mod message_service;
pub mod presence_service;
pub mod provider;
pub mod quality_service;
pub mod store;
pub mod typing_service;

// Re-export key types for convenience
pub use call_service::{CallService, CallSettings, CallStats, JoinOutcome};
pub use lifecycle::Lifecycle;
pub use message_service::MessageService;
pub use presence_service::PresenceService;
pub use provider::{ConferencingProvider, ProviderError, RoomToken, TokenRoomProvider};
pub use quality_service::{QualityReport, QualityService};
pub use store::{ChatStore, InMemoryChatStore, StoreError};
pub use typing_service::TypingService;

use crate::error::{AppError, AppResult};
use crate::models::DeviceIdentity;
use resilience::{with_timeout_result, TimeoutError};
use std::time::Duration;
use uuid::Uuid;

/// Conversation members, with an unknown conversation reported as such
pub(crate) async fn conversation_members(
    store: &dyn ChatStore,
    timeout: Duration,
    conversation_id: Uuid,
) -> AppResult<Vec<Uuid>> {
    with_timeout_result(
        "store.conversation_members",
        timeout,
        store.conversation_members(conversation_id),
    )
    .await
    .map_err(|e| match e {
        TimeoutError::Failed {
            error: StoreError::NotFound,
            ..
        } => AppError::ConversationNotFound(conversation_id),
        other => other.into(),
    })
}

/// Every registered device of a user
pub(crate) async fn user_device_set(
    store: &dyn ChatStore,
    timeout: Duration,
    user_id: Uuid,
) -> AppResult<Vec<DeviceIdentity>> {
    let devices = with_timeout_result("store.user_devices", timeout, store.user_devices(user_id))
        .await?;
    Ok(devices
        .into_iter()
        .map(|device_id| DeviceIdentity::new(user_id, device_id))
        .collect())
}
