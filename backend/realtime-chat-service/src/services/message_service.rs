//! # Message fanout
//!
//! Accepts send requests, persists them through the [`ChatStore`], and fans
//! them out to every recipient device with per-device delivery tracking.
//!
//! ## Ordering
//!
//! Each recipient device owns a queue of outbound events keyed by a global
//! sequence number. A live push happens only once the device's connection has
//! been attached, and attaching first flushes everything already queued, so a
//! reconnecting device always sees history before new traffic.
//!
//! ## At-least-once
//!
//! A `message:new` stays in the device queue until that device acks it
//! (`message:ack` or `message:read`). Pushing is not enough: if the ack is lost
//! the record stays `queued` and the event is flushed again on reconnect.
//! Edits, deletes and reactions for a message that is still unacked on a
//! device are held behind it, so a reflush never resurrects stale content.
//!
//! ## Retention
//!
//! Once every delivery of a message is read or stale and the dedupe window
//! has passed, the message, its idempotency key and its index row are
//! forgotten. Empty ledgers and idle device queues are dropped as well.
//!
//! ## Serialization
//!
//! All mutations of a conversation's ledger (idempotency keys, delivery
//! records) run under that conversation's mutex. Lock order is always
//! conversation ledger first, then device queue.

use crate::error::{AppError, AppResult};
use crate::metrics::{DELIVERY_TRANSITIONS, MESSAGES_SENT, QUEUED_DELIVERIES};
use crate::models::{
    ConnectionId, DeliveryRecord, DeliveryState, DeviceIdentity, NewMessage, ReactionAction,
    SendOutcome,
};
use crate::services::{conversation_members, user_device_set};
use crate::services::store::ChatStore;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::ConnectionRegistry;
use chrono::{DateTime, Utc};
use resilience::with_timeout_result;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

const MAX_EMOJI_LEN: usize = 32;

struct MessageEntry {
    sender: DeviceIdentity,
    client_message_id: String,
    created_at: DateTime<Utc>,
    created: Instant,
    deleted: bool,
    deliveries: BTreeMap<DeviceIdentity, DeliveryRecord>,
}

impl MessageEntry {
    fn is_settled(&self, dedupe_ttl: Duration, retention: Duration) -> bool {
        let age = self.created.elapsed();
        if age < dedupe_ttl {
            return false;
        }
        self.deliveries.values().all(|r| {
            r.stale
                || r.state == DeliveryState::Read
                || (age >= retention && r.state == DeliveryState::Delivered)
        })
    }
}

#[derive(Default)]
struct ConversationLedger {
    // (sender user, client message id) -> durable id
    idempotency: HashMap<(Uuid, String), Uuid>,
    messages: HashMap<Uuid, MessageEntry>,
}

struct PendingEvent {
    event: WsOutboundEvent,
    /// Set for `message:new`; the entry stays until this message is acked
    awaiting_ack: Option<Uuid>,
    /// Held until the referenced `message:new` is acked on this device
    follows: Option<Uuid>,
    queued_at: Instant,
}

#[derive(Default)]
struct DeviceQueue {
    pending: BTreeMap<u64, PendingEvent>,
    /// Connections that finished their flush and take live pushes
    ready: Vec<ConnectionId>,
}

struct Inner {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    external_timeout: Duration,
    conversations: RwLock<HashMap<Uuid, Arc<Mutex<ConversationLedger>>>>,
    devices: RwLock<HashMap<DeviceIdentity, Arc<Mutex<DeviceQueue>>>>,
    message_index: RwLock<HashMap<Uuid, Uuid>>,
    sequence: AtomicU64,
}

#[derive(Clone)]
pub struct MessageService {
    inner: Arc<Inner>,
}

impl MessageService {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<dyn ChatStore>,
        external_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                external_timeout,
                conversations: RwLock::new(HashMap::new()),
                devices: RwLock::new(HashMap::new()),
                message_index: RwLock::new(HashMap::new()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    async fn ledger(&self, conversation_id: Uuid) -> Arc<Mutex<ConversationLedger>> {
        if let Some(ledger) = self.inner.conversations.read().await.get(&conversation_id) {
            return ledger.clone();
        }
        self.inner
            .conversations
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .clone()
    }

    async fn device_queue(&self, identity: &DeviceIdentity) -> Arc<Mutex<DeviceQueue>> {
        if let Some(queue) = self.inner.devices.read().await.get(identity) {
            return queue.clone();
        }
        self.inner
            .devices
            .write()
            .await
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    /// Send a message into a conversation
    ///
    /// Retrying with the same `client_message_id` returns the first durable id
    /// with `duplicate = true` and fans nothing out again.
    pub async fn send(
        &self,
        sender: &DeviceIdentity,
        conversation_id: Uuid,
        client_message_id: &str,
        payload: String,
    ) -> AppResult<SendOutcome> {
        if client_message_id.trim().is_empty() {
            return Err(AppError::BadRequest("client_message_id is required".into()));
        }

        let members = conversation_members(
            self.inner.store.as_ref(),
            self.inner.external_timeout,
            conversation_id,
        )
        .await?;
        if !members.contains(&sender.user_id) {
            return Err(AppError::NotAMember);
        }

        let ledger = self.ledger(conversation_id).await;
        let mut ledger = ledger.lock().await;

        let key = (sender.user_id, client_message_id.to_string());
        if let Some(message_id) = ledger.idempotency.get(&key).copied() {
            MESSAGES_SENT.with_label_values(&["duplicate"]).inc();
            let entry = ledger
                .messages
                .get(&message_id)
                .ok_or_else(|| AppError::Internal("idempotency key without message".into()))?;
            tracing::debug!(
                message_id = %message_id,
                conversation_id = %conversation_id,
                client_message_id,
                "duplicate send collapsed"
            );
            return Ok(SendOutcome {
                message_id,
                client_message_id: client_message_id.to_string(),
                conversation_id,
                created_at: entry.created_at,
                duplicate: true,
                recipient_devices: entry.deliveries.len(),
            });
        }

        let mut recipients = Vec::new();
        for member in members.iter().filter(|m| **m != sender.user_id) {
            recipients.extend(
                user_device_set(self.inner.store.as_ref(), self.inner.external_timeout, *member)
                    .await?,
            );
        }

        let new_message = NewMessage {
            client_message_id: client_message_id.to_string(),
            conversation_id,
            sender: sender.clone(),
            payload,
            created_at: Utc::now(),
        };
        // No durable id is ever fabricated: a failed write leaves no trace here
        let message_id = with_timeout_result(
            "store.persist_message",
            self.inner.external_timeout,
            self.inner.store.persist_message(&new_message),
        )
        .await?;
        MESSAGES_SENT.with_label_values(&["new"]).inc();

        let deliveries = recipients
            .iter()
            .map(|device| {
                (
                    device.clone(),
                    DeliveryRecord::queued(message_id, device.clone(), new_message.created_at),
                )
            })
            .collect();
        ledger.idempotency.insert(key, message_id);
        ledger.messages.insert(
            message_id,
            MessageEntry {
                sender: sender.clone(),
                client_message_id: client_message_id.to_string(),
                created_at: new_message.created_at,
                created: Instant::now(),
                deleted: false,
                deliveries,
            },
        );
        self.inner
            .message_index
            .write()
            .await
            .insert(message_id, conversation_id);

        let event = WsOutboundEvent::MessageNew {
            message_id,
            client_message_id: client_message_id.to_string(),
            conversation_id,
            sender_id: sender.user_id,
            sender_device_id: sender.device_id.clone(),
            payload: new_message.payload.clone(),
            created_at: new_message.created_at,
        };
        let mut pushed = 0;
        for device in &recipients {
            if self.enqueue(device, event.clone(), Some(message_id), None).await {
                pushed += 1;
            }
        }

        tracing::info!(
            message_id = %message_id,
            conversation_id = %conversation_id,
            sender = %sender,
            recipients = recipients.len(),
            pushed,
            "message fanned out"
        );

        Ok(SendOutcome {
            message_id,
            client_message_id: client_message_id.to_string(),
            conversation_id,
            created_at: new_message.created_at,
            duplicate: false,
            recipient_devices: recipients.len(),
        })
    }

    /// Queue an event for a device and push it to its ready connections.
    ///
    /// `follows` names the message an edit, delete or reaction refers to; while
    /// that message is unacked here, the event is kept for the next flush.
    /// Returns whether any live connection accepted it.
    async fn enqueue(
        &self,
        identity: &DeviceIdentity,
        event: WsOutboundEvent,
        awaiting_ack: Option<Uuid>,
        follows: Option<Uuid>,
    ) -> bool {
        let queue = self.device_queue(identity).await;
        let mut queue = queue.lock().await;
        let seq = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let follows = follows.filter(|original| {
            queue
                .pending
                .values()
                .any(|p| p.awaiting_ack == Some(*original))
        });

        let mut pushed = false;
        for conn in queue.ready.clone() {
            match self.inner.registry.send(conn, event.clone()).await {
                Ok(()) => pushed = true,
                Err(_) => queue.ready.retain(|c| *c != conn),
            }
        }

        if awaiting_ack.is_some() || follows.is_some() || !pushed {
            if awaiting_ack.is_some() {
                QUEUED_DELIVERIES.inc();
            }
            queue.pending.insert(
                seq,
                PendingEvent {
                    event,
                    awaiting_ack,
                    follows,
                    queued_at: Instant::now(),
                },
            );
        }
        pushed
    }

    /// Flush a device's queue to a freshly registered connection, then let
    /// live traffic through. Returns how many events were flushed.
    pub async fn attach_connection(&self, connection_id: ConnectionId, identity: &DeviceIdentity) -> usize {
        let queue = self.device_queue(identity).await;
        let mut queue = queue.lock().await;

        let mut flushed = 0;
        let seqs: Vec<u64> = queue.pending.keys().copied().collect();
        for seq in seqs {
            let (event, held) = match queue.pending.get(&seq) {
                Some(p) => (
                    p.event.clone(),
                    p.awaiting_ack.is_some() || p.follows.is_some(),
                ),
                None => continue,
            };
            if self.inner.registry.send(connection_id, event).await.is_err() {
                tracing::debug!(
                    connection_id = %connection_id,
                    "connection gone during flush"
                );
                return flushed;
            }
            flushed += 1;
            if !held {
                queue.pending.remove(&seq);
            }
        }

        if !queue.ready.contains(&connection_id) {
            queue.ready.push(connection_id);
        }
        if flushed > 0 {
            tracing::info!(
                connection_id = %connection_id,
                device = %identity,
                flushed,
                "flushed queued events"
            );
        }
        flushed
    }

    pub async fn detach_connection(&self, connection_id: ConnectionId, identity: &DeviceIdentity) {
        let queue = self.device_queue(identity).await;
        queue.lock().await.ready.retain(|c| *c != connection_id);
    }

    /// Record a receipt ack from `identity`; returns whether the state advanced
    pub async fn mark_delivered(&self, identity: &DeviceIdentity, message_id: Uuid) -> AppResult<bool> {
        self.advance(identity, message_id, DeliveryState::Delivered)
            .await
    }

    /// Record a read receipt; a missed delivered ack is implied
    pub async fn mark_read(&self, identity: &DeviceIdentity, message_id: Uuid) -> AppResult<bool> {
        self.advance(identity, message_id, DeliveryState::Read).await
    }

    async fn advance(
        &self,
        identity: &DeviceIdentity,
        message_id: Uuid,
        target: DeliveryState,
    ) -> AppResult<bool> {
        let conversation_id = self.conversation_of(message_id).await?;
        let (changed, sender_user) = {
            let ledger = self.ledger(conversation_id).await;
            let mut ledger = ledger.lock().await;
            let entry = ledger
                .messages
                .get_mut(&message_id)
                .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
            let sender_user = entry.sender.user_id;
            let record = entry
                .deliveries
                .get_mut(identity)
                .ok_or_else(|| AppError::NotFound(format!("delivery of {message_id} to {identity}")))?;
            (record.advance(target, Utc::now()), sender_user)
        };

        self.clear_pending(identity, message_id).await;
        if !changed {
            return Ok(false);
        }

        DELIVERY_TRANSITIONS
            .with_label_values(&[target.as_str()])
            .inc();
        let event = match target {
            DeliveryState::Read => WsOutboundEvent::MessageRead {
                message_id,
                conversation_id,
                user_id: identity.user_id,
                device_id: identity.device_id.clone(),
            },
            _ => WsOutboundEvent::MessageDelivered {
                message_id,
                conversation_id,
                user_id: identity.user_id,
                device_id: identity.device_id.clone(),
            },
        };
        self.inner.registry.send_to_user(sender_user, &event).await;
        Ok(true)
    }

    async fn clear_pending(&self, identity: &DeviceIdentity, message_id: Uuid) {
        let queue = self.device_queue(identity).await;
        let mut queue = queue.lock().await;
        let acked = queue
            .pending
            .values()
            .filter(|p| p.awaiting_ack == Some(message_id))
            .count();
        queue
            .pending
            .retain(|_, p| p.awaiting_ack != Some(message_id) && p.follows != Some(message_id));
        QUEUED_DELIVERIES.sub(acked as i64);
    }

    async fn conversation_of(&self, message_id: Uuid) -> AppResult<Uuid> {
        self.inner
            .message_index
            .read()
            .await
            .get(&message_id)
            .copied()
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))
    }

    /// Replace a message's payload and fan out `message:edited`
    pub async fn edit_message(
        &self,
        editor: &DeviceIdentity,
        conversation_id: Uuid,
        message_id: Uuid,
        payload: String,
    ) -> AppResult<()> {
        let ledger = self.ledger(conversation_id).await;
        let ledger = ledger.lock().await;
        let recipients = Self::authorize_change(&ledger, editor, message_id)?;

        with_timeout_result(
            "store.update_message",
            self.inner.external_timeout,
            self.inner.store.update_message(message_id, &payload),
        )
        .await?;

        let event = WsOutboundEvent::MessageEdited {
            message_id,
            conversation_id,
            payload,
            edited_at: Utc::now(),
        };
        for device in &recipients {
            self.enqueue(device, event.clone(), None, Some(message_id)).await;
        }
        tracing::debug!(message_id = %message_id, "message edited");
        Ok(())
    }

    /// Tombstone a message and fan out `message:deleted`
    pub async fn delete_message(
        &self,
        deleter: &DeviceIdentity,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<()> {
        let ledger = self.ledger(conversation_id).await;
        let mut ledger = ledger.lock().await;
        let recipients = Self::authorize_change(&ledger, deleter, message_id)?;

        with_timeout_result(
            "store.delete_message",
            self.inner.external_timeout,
            self.inner.store.delete_message(message_id),
        )
        .await?;
        if let Some(entry) = ledger.messages.get_mut(&message_id) {
            entry.deleted = true;
        }

        let event = WsOutboundEvent::MessageDeleted {
            message_id,
            conversation_id,
        };
        for device in &recipients {
            self.enqueue(device, event.clone(), None, Some(message_id)).await;
        }
        tracing::debug!(message_id = %message_id, "message deleted");
        Ok(())
    }

    // Only the original sender may change a message that still exists
    fn authorize_change(
        ledger: &ConversationLedger,
        actor: &DeviceIdentity,
        message_id: Uuid,
    ) -> AppResult<Vec<DeviceIdentity>> {
        let entry = ledger
            .messages
            .get(&message_id)
            .filter(|e| !e.deleted)
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if entry.sender.user_id != actor.user_id {
            return Err(AppError::BadRequest(
                "only the sender can change a message".into(),
            ));
        }
        Ok(entry.deliveries.keys().cloned().collect())
    }

    /// Add or remove a reaction; fanned out to every other device in the conversation
    pub async fn react(
        &self,
        reactor: &DeviceIdentity,
        conversation_id: Uuid,
        message_id: Uuid,
        emoji: &str,
        action: ReactionAction,
    ) -> AppResult<()> {
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_LEN {
            return Err(AppError::BadRequest("invalid emoji".into()));
        }
        let members = conversation_members(
            self.inner.store.as_ref(),
            self.inner.external_timeout,
            conversation_id,
        )
        .await?;
        if !members.contains(&reactor.user_id) {
            return Err(AppError::NotAMember);
        }

        let ledger = self.ledger(conversation_id).await;
        let ledger = ledger.lock().await;
        if !ledger
            .messages
            .get(&message_id)
            .is_some_and(|entry| !entry.deleted)
        {
            return Err(AppError::NotFound(format!("message {message_id}")));
        }

        let event = WsOutboundEvent::MessageReaction {
            message_id,
            conversation_id,
            user_id: reactor.user_id,
            emoji: emoji.to_string(),
            action,
        };
        for member in members {
            let devices =
                user_device_set(self.inner.store.as_ref(), self.inner.external_timeout, member)
                    .await?;
            for device in devices.iter().filter(|d| *d != reactor) {
                self.enqueue(device, event.clone(), None, Some(message_id)).await;
            }
        }
        Ok(())
    }

    /// Drop queued events older than `retention`; undelivered messages are flagged stale
    pub async fn expire_stale(&self, retention: Duration) -> usize {
        let queues: Vec<(DeviceIdentity, Arc<Mutex<DeviceQueue>>)> = self
            .inner
            .devices
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut expired = Vec::new();
        let mut dropped = 0;
        for (identity, queue) in queues {
            let mut queue = queue.lock().await;
            let stale: Vec<u64> = queue
                .pending
                .iter()
                .filter(|(_, p)| p.queued_at.elapsed() >= retention)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in stale {
                if let Some(p) = queue.pending.remove(&seq) {
                    dropped += 1;
                    if let Some(message_id) = p.awaiting_ack {
                        QUEUED_DELIVERIES.dec();
                        expired.push((identity.clone(), message_id));
                    }
                }
            }
            // Follow-ups go with the message they were held behind
            let before = queue.pending.len();
            let expired_here: Vec<Uuid> = expired
                .iter()
                .filter(|(i, _)| *i == identity)
                .map(|(_, id)| *id)
                .collect();
            queue
                .pending
                .retain(|_, p| !p.follows.is_some_and(|id| expired_here.contains(&id)));
            dropped += before - queue.pending.len();
        }

        // Queue locks are released before touching ledgers
        for (identity, message_id) in expired {
            let Ok(conversation_id) = self.conversation_of(message_id).await else {
                continue;
            };
            let ledger = self.ledger(conversation_id).await;
            let mut ledger = ledger.lock().await;
            if let Some(record) = ledger
                .messages
                .get_mut(&message_id)
                .and_then(|e| e.deliveries.get_mut(&identity))
            {
                if record.state == DeliveryState::Queued {
                    record.stale = true;
                }
            }
        }

        if dropped > 0 {
            tracing::info!(dropped, "expired stale queued events");
        }
        dropped
    }

    /// Forget settled messages, then drop ledgers and device queues left empty.
    ///
    /// A message is settled once `dedupe_ttl` has passed and every delivery is
    /// read or stale; past `retention` a delivered-but-unread record counts too.
    /// Returns how many messages were evicted.
    pub async fn prune_settled(&self, dedupe_ttl: Duration, retention: Duration) -> usize {
        let ledgers: Vec<Arc<Mutex<ConversationLedger>>> = self
            .inner
            .conversations
            .read()
            .await
            .values()
            .cloned()
            .collect();

        let mut evicted = Vec::new();
        for ledger in &ledgers {
            let mut ledger = ledger.lock().await;
            let settled: Vec<Uuid> = ledger
                .messages
                .iter()
                .filter(|(_, e)| e.is_settled(dedupe_ttl, retention))
                .map(|(id, _)| *id)
                .collect();
            for message_id in settled {
                if let Some(entry) = ledger.messages.remove(&message_id) {
                    ledger
                        .idempotency
                        .remove(&(entry.sender.user_id, entry.client_message_id));
                    evicted.push(message_id);
                }
            }
        }
        drop(ledgers);

        if !evicted.is_empty() {
            let mut index = self.inner.message_index.write().await;
            for message_id in &evicted {
                index.remove(message_id);
            }
        }

        // Only entries nobody else holds a handle to can go
        self.inner.conversations.write().await.retain(|_, ledger| {
            Arc::strong_count(ledger) > 1
                || ledger.try_lock().map_or(true, |l| !l.messages.is_empty())
        });
        self.inner.devices.write().await.retain(|_, queue| {
            Arc::strong_count(queue) > 1
                || queue
                    .try_lock()
                    .map_or(true, |q| !q.pending.is_empty() || !q.ready.is_empty())
        });

        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), "settled messages evicted");
        }
        evicted.len()
    }

    pub async fn delivery_record(
        &self,
        message_id: Uuid,
        identity: &DeviceIdentity,
    ) -> Option<DeliveryRecord> {
        let conversation_id = self.conversation_of(message_id).await.ok()?;
        let ledger = self.ledger(conversation_id).await;
        let ledger = ledger.lock().await;
        ledger
            .messages
            .get(&message_id)
            .and_then(|e| e.deliveries.get(identity))
            .cloned()
    }

    pub async fn delivery_state(
        &self,
        message_id: Uuid,
        identity: &DeviceIdentity,
    ) -> Option<DeliveryState> {
        self.delivery_record(message_id, identity)
            .await
            .map(|r| r.state)
    }

    /// Events waiting in a device's queue
    pub async fn pending_for(&self, identity: &DeviceIdentity) -> usize {
        let queue = self.device_queue(identity).await;
        let len = queue.lock().await.pending.len();
        len
    }

    /// Idempotency key a durable id was created under
    pub async fn client_message_id(&self, message_id: Uuid) -> Option<String> {
        let conversation_id = self.conversation_of(message_id).await.ok()?;
        let ledger = self.ledger(conversation_id).await;
        let ledger = ledger.lock().await;
        ledger
            .messages
            .get(&message_id)
            .map(|e| e.client_message_id.clone())
    }
}
