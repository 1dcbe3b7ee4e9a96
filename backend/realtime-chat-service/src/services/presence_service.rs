use crate::models::{PresenceRecord, PresenceStatus};
use crate::services::store::ChatStore;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::ConnectionRegistry;
use chrono::Utc;
use resilience::with_timeout_result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Derives per-user presence from registry changes and idle signals
///
/// A user is online exactly when the registry holds at least one connection
/// for them. `away` is only entered through an explicit idle signal and is
/// left again on the next activity.
#[derive(Clone)]
pub struct PresenceService {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    external_timeout: Duration,
    records: Arc<Mutex<HashMap<Uuid, PresenceRecord>>>,
}

impl PresenceService {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<dyn ChatStore>,
        external_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            external_timeout,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Called after a connection for `user_id` was registered
    pub async fn on_connected(&self, user_id: Uuid) {
        let changed = {
            let mut records = self.records.lock().await;
            if !self.registry.is_online(user_id).await {
                return;
            }
            let record = records
                .entry(user_id)
                .or_insert_with(|| PresenceRecord::offline(user_id, Utc::now()));
            record.last_seen_at = Utc::now();
            if record.status == PresenceStatus::Online {
                None
            } else {
                record.status = PresenceStatus::Online;
                Some(record.clone())
            }
        };

        if let Some(record) = changed {
            self.broadcast(&record).await;
        }
    }

    /// Called after a connection for `user_id` was deregistered
    pub async fn on_disconnected(&self, user_id: Uuid) {
        let changed = {
            let mut records = self.records.lock().await;
            if self.registry.is_online(user_id).await {
                return;
            }
            let record = records
                .entry(user_id)
                .or_insert_with(|| PresenceRecord::offline(user_id, Utc::now()));
            if record.status == PresenceStatus::Offline {
                None
            } else {
                record.status = PresenceStatus::Offline;
                record.last_seen_at = Utc::now();
                Some(record.clone())
            }
        };

        if let Some(record) = changed {
            self.broadcast(&record).await;
        }
    }

    /// Explicit idle signal from a client
    pub async fn mark_away(&self, user_id: Uuid) {
        self.set_connected_status(user_id, PresenceStatus::Online, PresenceStatus::Away)
            .await;
    }

    /// Any inbound activity brings an away user back online
    pub async fn record_activity(&self, user_id: Uuid) {
        self.set_connected_status(user_id, PresenceStatus::Away, PresenceStatus::Online)
            .await;
    }

    async fn set_connected_status(&self, user_id: Uuid, from: PresenceStatus, to: PresenceStatus) {
        let changed = {
            let mut records = self.records.lock().await;
            match records.get_mut(&user_id) {
                Some(record) if record.status == from => {
                    record.status = to;
                    record.last_seen_at = Utc::now();
                    Some(record.clone())
                }
                Some(record) => {
                    record.last_seen_at = Utc::now();
                    None
                }
                None => None,
            }
        };

        if let Some(record) = changed {
            self.broadcast(&record).await;
        }
    }

    pub async fn get(&self, user_id: Uuid) -> Option<PresenceRecord> {
        self.records.lock().await.get(&user_id).cloned()
    }

    pub async fn status(&self, user_id: Uuid) -> PresenceStatus {
        self.get(user_id)
            .await
            .map(|r| r.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    /// Push a presence delta to connected users sharing a conversation
    async fn broadcast(&self, record: &PresenceRecord) {
        let event = match record.status {
            PresenceStatus::Offline => WsOutboundEvent::UserOffline {
                user_id: record.user_id,
                last_seen_at: record.last_seen_at,
            },
            status => WsOutboundEvent::UserOnline {
                user_id: record.user_id,
                status,
            },
        };

        let contacts = match with_timeout_result(
            "store.contacts_of",
            self.external_timeout,
            self.store.contacts_of(record.user_id),
        )
        .await
        {
            Ok(contacts) => contacts,
            Err(e) => {
                tracing::warn!(
                    user_id = %record.user_id,
                    error = %e,
                    "presence broadcast skipped, contacts unavailable"
                );
                return;
            }
        };

        let mut reached = 0;
        for contact in contacts {
            reached += self.registry.send_to_user(contact, &event).await;
        }
        tracing::debug!(
            user_id = %record.user_id,
            status = record.status.as_str(),
            reached,
            "presence delta broadcast"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceIdentity;
    use crate::services::store::InMemoryChatStore;
    use crate::websocket::SessionPolicy;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    async fn setup() -> (ConnectionRegistry, PresenceService, Uuid, Uuid) {
        let registry = ConnectionRegistry::new(SessionPolicy::AllowMultiple);
        let store = Arc::new(InMemoryChatStore::new());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        store.add_conversation(Uuid::new_v4(), vec![alice, bob]).await;
        let presence = PresenceService::new(registry.clone(), store, Duration::from_secs(1));
        (registry, presence, alice, bob)
    }

    fn drain(rx: &mut UnboundedReceiver<WsOutboundEvent>) -> Vec<WsOutboundEvent> {
        let mut out = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            out.push(evt);
        }
        out
    }

    #[tokio::test]
    async fn test_online_until_last_connection_leaves() {
        let (registry, presence, alice, bob) = setup().await;
        let (bob_tx, mut bob_rx) = unbounded_channel();
        registry
            .register(DeviceIdentity::new(bob, "phone"), bob_tx)
            .await
            .unwrap();

        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        let c1 = registry
            .register(DeviceIdentity::new(alice, "phone"), tx1)
            .await
            .unwrap();
        presence.on_connected(alice).await;
        let c2 = registry
            .register(DeviceIdentity::new(alice, "laptop"), tx2)
            .await
            .unwrap();
        presence.on_connected(alice).await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![WsOutboundEvent::UserOnline {
                user_id: alice,
                status: PresenceStatus::Online
            }]
        );

        registry.deregister(c1).await;
        presence.on_disconnected(alice).await;
        assert_eq!(presence.status(alice).await, PresenceStatus::Online);
        assert!(drain(&mut bob_rx).is_empty());

        registry.deregister(c2).await;
        presence.on_disconnected(alice).await;
        assert_eq!(presence.status(alice).await, PresenceStatus::Offline);
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [WsOutboundEvent::UserOffline { user_id, .. }] if *user_id == alice
        ));
    }

    #[tokio::test]
    async fn test_away_is_explicit_and_reversible() {
        let (registry, presence, alice, _bob) = setup().await;
        let (tx, _rx) = unbounded_channel();
        registry
            .register(DeviceIdentity::new(alice, "phone"), tx)
            .await
            .unwrap();
        presence.on_connected(alice).await;

        presence.mark_away(alice).await;
        assert_eq!(presence.status(alice).await, PresenceStatus::Away);
        presence.record_activity(alice).await;
        assert_eq!(presence.status(alice).await, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_idle_while_offline_is_ignored() {
        let (_registry, presence, alice, _bob) = setup().await;
        presence.mark_away(alice).await;
        assert_eq!(presence.status(alice).await, PresenceStatus::Offline);
    }
}
