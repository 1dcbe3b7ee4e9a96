//! Conferencing provider seam
//!
//! Media never flows through this service. The provider owns rooms; we create
//! one per call, hand out signed access tokens, and release it when the call ends.

use crate::config::ProviderConfig;
use crate::models::{CallType, DeviceIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Credentials a client uses to enter a provider room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomToken {
    pub room_id: String,
    pub token: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConferencingProvider: Send + Sync {
    async fn create_room(
        &self,
        call_id: Uuid,
        call_type: CallType,
        max_participants: usize,
    ) -> Result<String, ProviderError>;

    async fn issue_token(
        &self,
        room_id: &str,
        identity: &DeviceIdentity,
        call_type: CallType,
    ) -> Result<RoomToken, ProviderError>;

    async fn release_room(&self, room_id: &str) -> Result<(), ProviderError>;
}

/// Room access grant, LiveKit-style
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_publish_video: bool,
    pub can_subscribe: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomClaims {
    pub iss: String,
    /// Participant identity, `user/device`
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub video: VideoGrant,
}

/// Provider that tracks rooms locally and signs HS256 room tokens
pub struct TokenRoomProvider {
    config: ProviderConfig,
    rooms: Mutex<HashSet<String>>,
    available: AtomicBool,
}

impl TokenRoomProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            rooms: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn open_rooms(&self) -> usize {
        self.rooms.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), ProviderError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::Unavailable("provider switched off".into()))
        }
    }

    fn rooms(&self) -> Result<std::sync::MutexGuard<'_, HashSet<String>>, ProviderError> {
        self.rooms
            .lock()
            .map_err(|_| ProviderError::Unavailable("room table poisoned".into()))
    }
}

#[async_trait]
impl ConferencingProvider for TokenRoomProvider {
    async fn create_room(
        &self,
        call_id: Uuid,
        call_type: CallType,
        max_participants: usize,
    ) -> Result<String, ProviderError> {
        self.check_available()?;
        let room_id = format!("call-{call_id}");
        self.rooms()?.insert(room_id.clone());
        tracing::debug!(
            room_id = %room_id,
            call_type = call_type.as_str(),
            max_participants,
            "room created"
        );
        Ok(room_id)
    }

    async fn issue_token(
        &self,
        room_id: &str,
        identity: &DeviceIdentity,
        call_type: CallType,
    ) -> Result<RoomToken, ProviderError> {
        self.check_available()?;
        if !self.rooms()?.contains(room_id) {
            return Err(ProviderError::RoomNotFound(room_id.to_string()));
        }

        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.config.token_ttl)
            .map_err(|e| ProviderError::Signing(e.to_string()))?;
        let expires_at = now + ttl;
        let claims = RoomClaims {
            iss: "realtime-chat-service".to_string(),
            sub: identity.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            video: VideoGrant {
                room: room_id.to_string(),
                room_join: true,
                can_publish: true,
                can_publish_video: call_type == CallType::Video,
                can_subscribe: true,
            },
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.api_secret.as_bytes()),
        )
        .map_err(|e| ProviderError::Signing(e.to_string()))?;

        Ok(RoomToken {
            room_id: room_id.to_string(),
            token,
            url: self.config.url.clone(),
            expires_at,
        })
    }

    async fn release_room(&self, room_id: &str) -> Result<(), ProviderError> {
        self.check_available()?;
        // Releasing twice is harmless
        self.rooms()?.remove(room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn provider() -> TokenRoomProvider {
        TokenRoomProvider::new(Config::test_defaults().provider)
    }

    #[tokio::test]
    async fn test_token_carries_room_grant() {
        let provider = provider();
        let room = provider
            .create_room(Uuid::new_v4(), CallType::Audio, 2)
            .await
            .unwrap();
        let identity = DeviceIdentity::new(Uuid::new_v4(), "phone");
        let token = provider
            .issue_token(&room, &identity, CallType::Audio)
            .await
            .unwrap();

        let data = decode::<RoomClaims>(
            &token.token,
            &DecodingKey::from_secret(b"provider-secret-for-tests"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(data.claims.video.room, room);
        assert_eq!(data.claims.sub, identity.to_string());
        assert!(!data.claims.video.can_publish_video);
        assert_eq!(token.url, "wss://rooms.test");
    }

    #[tokio::test]
    async fn test_released_room_rejects_tokens() {
        let provider = provider();
        let room = provider
            .create_room(Uuid::new_v4(), CallType::Video, 4)
            .await
            .unwrap();
        provider.release_room(&room).await.unwrap();
        provider.release_room(&room).await.unwrap();

        let identity = DeviceIdentity::new(Uuid::new_v4(), "phone");
        assert!(matches!(
            provider.issue_token(&room, &identity, CallType::Video).await,
            Err(ProviderError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_outage() {
        let provider = provider();
        provider.set_available(false);
        assert!(matches!(
            provider.create_room(Uuid::new_v4(), CallType::Video, 4).await,
            Err(ProviderError::Unavailable(_))
        ));
    }
}
