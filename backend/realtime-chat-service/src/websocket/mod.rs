use crate::error::{AppError, AppResult};
use crate::metrics::CONNECTIONS_ACTIVE;
use crate::models::{ConnectionId, DeviceId, DeviceIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

pub mod handlers;
pub mod message_types;

use message_types::WsOutboundEvent;

/// What to do when a device that already holds a live connection connects again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// Keep both connections; events go to each
    AllowMultiple,
    /// Refuse the new connection with `DuplicateSessionConflict`
    RejectDuplicate,
    /// Evict the old connection; the new one resumes its call subscription
    Replace,
}

impl FromStr for SessionPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow_multiple" => Ok(Self::AllowMultiple),
            "reject_duplicate" => Ok(Self::RejectDuplicate),
            "replace" => Ok(Self::Replace),
            other => Err(AppError::Config(format!("unknown SESSION_POLICY: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Transport closed by either side
    Closed,
    /// Two heartbeat intervals passed without a liveness signal
    HeartbeatTimeout,
    /// Evicted by a newer connection of the same device
    Replaced,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Replaced => "replaced",
        }
    }
}

/// Snapshot of one live transport session
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: DeviceIdentity,
    pub authenticated_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    /// Call this connection's device is participating in
    pub call_id: Option<Uuid>,
}

/// Typed registry change notification
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered {
        connection: Connection,
        /// Connection of the same device evicted under `SessionPolicy::Replace`
        replaced: Option<ConnectionId>,
    },
    Deregistered {
        connection: Connection,
        reason: DisconnectReason,
    },
}

/// Consumer of registry changes.
///
/// Listeners run after the registry lock is released, in registration order,
/// and before `register`/`deregister` return to the caller.
#[async_trait]
pub trait RegistryListener: Send + Sync {
    async fn on_registry_event(&self, event: &RegistryEvent);
}

struct Entry {
    connection: Connection,
    sender: UnboundedSender<WsOutboundEvent>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    // user -> device -> connections, for addressing
    by_user: HashMap<Uuid, HashMap<DeviceId, Vec<ConnectionId>>>,
}

impl Inner {
    fn insert(&mut self, entry: Entry) {
        let identity = entry.connection.identity.clone();
        let id = entry.connection.id;
        self.connections.insert(id, entry);
        self.by_user
            .entry(identity.user_id)
            .or_default()
            .entry(identity.device_id)
            .or_default()
            .push(id);
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Entry> {
        let entry = self.connections.remove(&id)?;
        let identity = &entry.connection.identity;
        if let Some(devices) = self.by_user.get_mut(&identity.user_id) {
            if let Some(ids) = devices.get_mut(&identity.device_id) {
                ids.retain(|c| *c != id);
                if ids.is_empty() {
                    devices.remove(&identity.device_id);
                }
            }
            // Clean up empty user entries
            if devices.is_empty() {
                self.by_user.remove(&identity.user_id);
            }
        }
        Some(entry)
    }

    fn device_connections(&self, identity: &DeviceIdentity) -> Vec<ConnectionId> {
        self.by_user
            .get(&identity.user_id)
            .and_then(|devices| devices.get(&identity.device_id))
            .cloned()
            .unwrap_or_default()
    }
}

/// Connection registry for WebSocket sessions
///
/// Owns the (user, device) -> connection mapping and each connection's
/// outbound channel. Other components address connections only through it.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Inner>>,
    listeners: Arc<RwLock<Vec<Arc<dyn RegistryListener>>>>,
    policy: SessionPolicy,
}

impl ConnectionRegistry {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            policy,
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub async fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.write().await.push(listener);
    }

    async fn emit(&self, events: &[RegistryEvent]) {
        let listeners = self.listeners.read().await.clone();
        for event in events {
            for listener in &listeners {
                listener.on_registry_event(event).await;
            }
        }
    }

    /// Register an authenticated connection
    ///
    /// Fails with `DuplicateSessionConflict` only under
    /// `SessionPolicy::RejectDuplicate` when the device is already connected.
    pub async fn register(
        &self,
        identity: DeviceIdentity,
        sender: UnboundedSender<WsOutboundEvent>,
    ) -> AppResult<ConnectionId> {
        let connection_id = ConnectionId::new();
        let mut events = Vec::new();

        {
            let mut guard = self.inner.write().await;
            let existing = guard.device_connections(&identity);

            let mut inherited_call = None;
            let mut replaced = None;
            match self.policy {
                SessionPolicy::RejectDuplicate if !existing.is_empty() => {
                    tracing::info!(
                        user_id = %identity.user_id,
                        device_id = %identity.device_id,
                        "rejecting duplicate session"
                    );
                    return Err(AppError::DuplicateSessionConflict);
                }
                SessionPolicy::Replace => {
                    for old in existing {
                        if let Some(entry) = guard.remove(old) {
                            inherited_call = inherited_call.or(entry.connection.call_id);
                            replaced = Some(old);
                            // Dropping the sender ends the old session's outbound stream
                            events.push(RegistryEvent::Deregistered {
                                connection: entry.connection,
                                reason: DisconnectReason::Replaced,
                            });
                            CONNECTIONS_ACTIVE.dec();
                        }
                    }
                }
                _ => {}
            }

            let connection = Connection {
                id: connection_id,
                identity: identity.clone(),
                authenticated_at: Utc::now(),
                last_heartbeat: Instant::now(),
                call_id: inherited_call,
            };
            guard.insert(Entry {
                connection: connection.clone(),
                sender,
            });
            CONNECTIONS_ACTIVE.inc();

            tracing::debug!(
                connection_id = %connection_id,
                user_id = %identity.user_id,
                device_id = %identity.device_id,
                total = guard.connections.len(),
                "registered connection"
            );
            events.push(RegistryEvent::Registered {
                connection,
                replaced,
            });
        }

        self.emit(&events).await;
        Ok(connection_id)
    }

    /// Remove a connection. Removing an absent connection is a no-op.
    pub async fn deregister(&self, connection_id: ConnectionId) -> Option<Connection> {
        self.deregister_with(connection_id, DisconnectReason::Closed)
            .await
    }

    pub async fn deregister_with(
        &self,
        connection_id: ConnectionId,
        reason: DisconnectReason,
    ) -> Option<Connection> {
        let connection = {
            let mut guard = self.inner.write().await;
            let entry = guard.remove(connection_id)?;
            CONNECTIONS_ACTIVE.dec();
            entry.connection
        };

        tracing::debug!(
            connection_id = %connection_id,
            user_id = %connection.identity.user_id,
            reason = reason.as_str(),
            "deregistered connection"
        );
        self.emit(&[RegistryEvent::Deregistered {
            connection: connection.clone(),
            reason,
        }])
        .await;
        Some(connection)
    }

    /// Push an event to one connection
    ///
    /// `ConnectionGone` means the recipient is currently offline.
    pub async fn send(&self, connection_id: ConnectionId, event: WsOutboundEvent) -> AppResult<()> {
        let guard = self.inner.read().await;
        let entry = guard
            .connections
            .get(&connection_id)
            .ok_or(AppError::ConnectionGone(connection_id))?;
        entry
            .sender
            .send(event)
            .map_err(|_| AppError::ConnectionGone(connection_id))
    }

    /// Push an event to every connection of a user; returns how many accepted it
    pub async fn send_to_user(&self, user_id: Uuid, event: &WsOutboundEvent) -> usize {
        let guard = self.inner.read().await;
        let Some(devices) = guard.by_user.get(&user_id) else {
            return 0;
        };
        devices
            .values()
            .flatten()
            .filter_map(|id| guard.connections.get(id))
            .filter(|entry| entry.sender.send(event.clone()).is_ok())
            .count()
    }

    pub async fn send_to_device(&self, identity: &DeviceIdentity, event: &WsOutboundEvent) -> usize {
        let guard = self.inner.read().await;
        guard
            .device_connections(identity)
            .iter()
            .filter_map(|id| guard.connections.get(id))
            .filter(|entry| entry.sender.send(event.clone()).is_ok())
            .count()
    }

    pub async fn connections_for(&self, user_id: Uuid) -> Vec<ConnectionId> {
        let guard = self.inner.read().await;
        guard
            .by_user
            .get(&user_id)
            .map(|devices| devices.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    pub async fn connections_for_device(&self, identity: &DeviceIdentity) -> Vec<ConnectionId> {
        self.inner.read().await.device_connections(identity)
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<Connection> {
        let guard = self.inner.read().await;
        guard
            .connections
            .get(&connection_id)
            .map(|e| e.connection.clone())
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.read().await.by_user.contains_key(&user_id)
    }

    /// Whether any connection of this device is live
    pub async fn is_device_online(&self, identity: &DeviceIdentity) -> bool {
        !self.inner.read().await.device_connections(identity).is_empty()
    }

    /// Record a liveness signal; returns false for unknown connections
    pub async fn touch(&self, connection_id: ConnectionId) -> bool {
        let mut guard = self.inner.write().await;
        match guard.connections.get_mut(&connection_id) {
            Some(entry) => {
                entry.connection.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Attach every live connection of a device to a call
    pub async fn subscribe_device_to_call(&self, identity: &DeviceIdentity, call_id: Uuid) {
        let mut guard = self.inner.write().await;
        for id in guard.device_connections(identity) {
            if let Some(entry) = guard.connections.get_mut(&id) {
                entry.connection.call_id = Some(call_id);
            }
        }
    }

    pub async fn unsubscribe_device_from_call(&self, identity: &DeviceIdentity, call_id: Uuid) {
        let mut guard = self.inner.write().await;
        for id in guard.device_connections(identity) {
            if let Some(entry) = guard.connections.get_mut(&id) {
                if entry.connection.call_id == Some(call_id) {
                    entry.connection.call_id = None;
                }
            }
        }
    }

    /// Drop every subscription to a call that has ended
    pub async fn clear_call_subscription(&self, call_id: Uuid) {
        let mut guard = self.inner.write().await;
        for entry in guard.connections.values_mut() {
            if entry.connection.call_id == Some(call_id) {
                entry.connection.call_id = None;
            }
        }
    }

    /// Deregister connections that missed two consecutive heartbeats
    pub async fn sweep_stale(&self, interval: Duration) -> Vec<Connection> {
        let cutoff = interval * 2;
        let stale: Vec<ConnectionId> = {
            let guard = self.inner.read().await;
            guard
                .connections
                .values()
                .filter(|e| e.connection.last_heartbeat.elapsed() >= cutoff)
                .map(|e| e.connection.id)
                .collect()
        };

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(conn) = self
                .deregister_with(id, DisconnectReason::HeartbeatTimeout)
                .await
            {
                tracing::warn!(
                    connection_id = %id,
                    user_id = %conn.identity.user_id,
                    "heartbeat timeout, connection deregistered"
                );
                removed.push(conn);
            }
        }
        removed
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::unbounded_channel;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl RegistryListener for Recorder {
        async fn on_registry_event(&self, event: &RegistryEvent) {
            let line = match event {
                RegistryEvent::Registered { replaced, .. } => {
                    format!("registered replaced={}", replaced.is_some())
                }
                RegistryEvent::Deregistered { reason, .. } => {
                    format!("deregistered {}", reason.as_str())
                }
            };
            self.0.lock().unwrap().push(line);
        }
    }

    fn device(user: Uuid, name: &str) -> DeviceIdentity {
        DeviceIdentity::new(user, name)
    }

    #[tokio::test]
    async fn test_register_and_address_devices() {
        let registry = ConnectionRegistry::new(SessionPolicy::AllowMultiple);
        let user = Uuid::new_v4();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();

        let phone = registry.register(device(user, "phone"), tx1).await.unwrap();
        registry.register(device(user, "laptop"), tx2).await.unwrap();

        assert_eq!(registry.connections_for(user).await.len(), 2);
        assert_eq!(
            registry
                .connections_for_device(&device(user, "phone"))
                .await,
            vec![phone]
        );

        let event = WsOutboundEvent::TypingStop {
            conversation_id: Uuid::new_v4(),
            user_id: user,
        };
        registry.send(phone, event.clone()).await.unwrap();
        assert_eq!(rx1.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent_and_send_reports_gone() {
        let registry = ConnectionRegistry::new(SessionPolicy::Replace);
        let user = Uuid::new_v4();
        let (tx, _rx) = unbounded_channel();
        let id = registry.register(device(user, "phone"), tx).await.unwrap();

        assert!(registry.deregister(id).await.is_some());
        assert!(registry.deregister(id).await.is_none());
        assert!(!registry.is_online(user).await);

        let err = registry
            .send(
                id,
                WsOutboundEvent::TypingStop {
                    conversation_id: Uuid::new_v4(),
                    user_id: user,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConnectionGone(_)));
    }

    #[tokio::test]
    async fn test_reject_duplicate_policy() {
        let registry = ConnectionRegistry::new(SessionPolicy::RejectDuplicate);
        let user = Uuid::new_v4();
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        let (tx3, _rx3) = unbounded_channel();

        registry.register(device(user, "phone"), tx1).await.unwrap();
        let err = registry
            .register(device(user, "phone"), tx2)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateSessionConflict));
        // A second device of the same user is fine
        registry.register(device(user, "tablet"), tx3).await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_evicts_and_inherits_call() {
        let registry = ConnectionRegistry::new(SessionPolicy::Replace);
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(recorder.clone()).await;

        let identity = device(Uuid::new_v4(), "phone");
        let call_id = Uuid::new_v4();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();

        let old = registry.register(identity.clone(), tx1).await.unwrap();
        registry.subscribe_device_to_call(&identity, call_id).await;
        let new = registry.register(identity.clone(), tx2).await.unwrap();

        assert!(registry.get(old).await.is_none());
        assert_eq!(registry.get(new).await.unwrap().call_id, Some(call_id));
        // Old outbound stream is closed
        assert_eq!(rx1.recv().await, None);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                "registered replaced=false",
                "deregistered replaced",
                "registered replaced=true"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_requires_two_missed_intervals() {
        let registry = ConnectionRegistry::new(SessionPolicy::Replace);
        let interval = Duration::from_secs(30);
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        let quiet = registry
            .register(device(Uuid::new_v4(), "a"), tx1)
            .await
            .unwrap();
        let chatty = registry
            .register(device(Uuid::new_v4(), "b"), tx2)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(registry.sweep_stale(interval).await.is_empty());
        assert!(registry.touch(chatty).await);

        tokio::time::advance(Duration::from_secs(20)).await;
        let removed = registry.sweep_stale(interval).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, quiet);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[test]
    fn test_session_policy_parse() {
        assert_eq!(
            "reject_duplicate".parse::<SessionPolicy>().unwrap(),
            SessionPolicy::RejectDuplicate
        );
        assert!("sometimes".parse::<SessionPolicy>().is_err());
    }
}
