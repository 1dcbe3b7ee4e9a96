//! Durable chat store seam
//!
//! Conversations, devices, messages and call history live in an external
//! store. The engines only talk to it through [`ChatStore`], always bounded by
//! a timeout at the call site.

use crate::error::AppError;
use crate::models::{CallSession, DeviceId, NewMessage};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Members of a conversation; `NotFound` for unknown conversations
    async fn conversation_members(&self, conversation_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Every device registered for a user
    async fn user_devices(&self, user_id: Uuid) -> Result<Vec<DeviceId>, StoreError>;

    /// Users sharing at least one conversation with `user_id`
    async fn contacts_of(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Durable write; returns the server-assigned message id
    async fn persist_message(&self, message: &NewMessage) -> Result<Uuid, StoreError>;

    async fn update_message(&self, message_id: Uuid, payload: &str) -> Result<(), StoreError>;

    async fn delete_message(&self, message_id: Uuid) -> Result<(), StoreError>;

    async fn archive_call(&self, session: &CallSession) -> Result<(), StoreError>;

    /// Archived calls involving `user_id`, newest first
    async fn call_history(&self, user_id: Uuid, limit: usize)
        -> Result<Vec<CallSession>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: Uuid,
    pub message: NewMessage,
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
struct SeedConversation {
    id: Uuid,
    members: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    conversations: Vec<SeedConversation>,
    #[serde(default)]
    devices: HashMap<Uuid, Vec<DeviceId>>,
}

#[derive(Default)]
struct Tables {
    conversations: HashMap<Uuid, Vec<Uuid>>,
    devices: HashMap<Uuid, Vec<DeviceId>>,
    messages: Vec<StoredMessage>,
    calls: Vec<CallSession>,
}

/// Process-local [`ChatStore`] for development and tests
///
/// Carries an availability switch and an artificial latency so outages and
/// slow writes can be exercised.
pub struct InMemoryChatStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load conversations and devices from a JSON seed file
    ///
    /// ```json
    /// {"conversations": [{"id": "...", "members": ["..."]}],
    ///  "devices": {"<user uuid>": ["phone", "laptop"]}}
    /// ```
    pub fn from_seed_file(path: &str) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read store seed {path}: {e}")))?;
        let seed: Seed = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("invalid store seed {path}: {e}")))?;

        let tables = Tables {
            conversations: seed
                .conversations
                .into_iter()
                .map(|c| (c.id, c.members))
                .collect(),
            devices: seed.devices,
            ..Tables::default()
        };
        Ok(Self {
            tables: RwLock::new(tables),
            ..Self::default()
        })
    }

    pub async fn add_conversation(&self, conversation_id: Uuid, members: Vec<Uuid>) {
        self.tables
            .write()
            .await
            .conversations
            .insert(conversation_id, members);
    }

    pub async fn register_device(&self, user_id: Uuid, device_id: impl Into<DeviceId>) {
        let device_id = device_id.into();
        let mut tables = self.tables.write().await;
        let devices = tables.devices.entry(user_id).or_default();
        if !devices.contains(&device_id) {
            devices.push(device_id);
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.tables.read().await.messages.clone()
    }

    pub async fn archived_calls(&self) -> Vec<CallSession> {
        self.tables.read().await.calls.clone()
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        }
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn conversation_members(&self, conversation_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.gate().await?;
        self.tables
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn user_devices(&self, user_id: Uuid) -> Result<Vec<DeviceId>, StoreError> {
        self.gate().await?;
        Ok(self
            .tables
            .read()
            .await
            .devices
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn contacts_of(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.gate().await?;
        let tables = self.tables.read().await;
        let contacts: BTreeSet<Uuid> = tables
            .conversations
            .values()
            .filter(|members| members.contains(&user_id))
            .flatten()
            .copied()
            .filter(|id| *id != user_id)
            .collect();
        Ok(contacts.into_iter().collect())
    }

    async fn persist_message(&self, message: &NewMessage) -> Result<Uuid, StoreError> {
        self.gate().await?;
        let message_id = Uuid::new_v4();
        self.tables.write().await.messages.push(StoredMessage {
            message_id,
            message: message.clone(),
            deleted: false,
        });
        Ok(message_id)
    }

    async fn update_message(&self, message_id: Uuid, payload: &str) -> Result<(), StoreError> {
        self.gate().await?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id && !m.deleted)
            .ok_or(StoreError::NotFound)?;
        stored.message.payload = payload.to_string();
        Ok(())
    }

    async fn delete_message(&self, message_id: Uuid) -> Result<(), StoreError> {
        self.gate().await?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or(StoreError::NotFound)?;
        stored.deleted = true;
        Ok(())
    }

    async fn archive_call(&self, session: &CallSession) -> Result<(), StoreError> {
        self.gate().await?;
        let mut tables = self.tables.write().await;
        tables.calls.retain(|c| c.call_id != session.call_id);
        tables.calls.push(session.clone());
        Ok(())
    }

    async fn call_history(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CallSession>, StoreError> {
        self.gate().await?;
        let tables = self.tables.read().await;
        let mut calls: Vec<CallSession> = tables
            .calls
            .iter()
            .filter(|c| c.party_ids().contains(&user_id))
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        calls.truncate(limit);
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceIdentity;
    use chrono::Utc;

    #[tokio::test]
    async fn test_contacts_are_conversation_peers() {
        let store = InMemoryChatStore::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.add_conversation(Uuid::new_v4(), vec![a, b]).await;
        store.add_conversation(Uuid::new_v4(), vec![b, c]).await;

        assert_eq!(store.contacts_of(a).await.unwrap(), vec![b]);
        let mut of_b = store.contacts_of(b).await.unwrap();
        of_b.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(of_b, expected);
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let store = InMemoryChatStore::new();
        store.set_available(false);
        let msg = NewMessage {
            client_message_id: "x1".into(),
            conversation_id: Uuid::new_v4(),
            sender: DeviceIdentity::new(Uuid::new_v4(), "phone"),
            payload: "cipher".into(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            store.persist_message(&msg).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.persist_message(&msg).await.is_ok());
        assert_eq!(store.messages().await.len(), 1);
    }
}
