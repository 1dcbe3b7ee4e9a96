//! # Call Session Manager
//!
//! One state machine per call, serialized by a per-call mutex. Calls never
//! share a lock, so a slow provider on one call cannot stall another.
//!
//! Timers (ring, connect, per-device grace, retention) are tasks owned by the
//! call entry. Each is aborted by the transition that supersedes it; a timer
//! that fires takes its own handle out of the entry before acting.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics::{CALLS_ACTIVE, CALLS_ENDED};
use crate::models::{
    CallParticipant, CallSession, CallState, CallType, DeviceIdentity, EndReason, InviteStatus,
    MediaUpdate, ParticipantConnection, QualitySample,
};
use crate::services::conversation_members;
use crate::services::provider::{ConferencingProvider, RoomToken};
use crate::services::quality_service::{CallQuality, QualityReport, QualityService};
use crate::services::store::ChatStore;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::ConnectionRegistry;
use chrono::Utc;
use resilience::{with_retry, with_timeout_result, RetryConfig};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub ring_timeout: Duration,
    pub connect_timeout: Duration,
    pub grace_period: Duration,
    pub max_participants: usize,
    pub retention: Duration,
    pub external_timeout: Duration,
}

impl CallSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ring_timeout: config.call.ring_timeout,
            connect_timeout: config.call.connect_timeout,
            grace_period: config.call.grace_period,
            max_participants: config.call.max_participants,
            retention: config.call.retention,
            external_timeout: config.external_timeout,
        }
    }
}

/// Session snapshot plus the room credentials for the joining device
#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub session: CallSession,
    pub token: RoomToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub call_id: Uuid,
    pub state: CallState,
    pub call_type: CallType,
    pub participant_records: usize,
    pub present_parties: usize,
    pub duration_ms: Option<i64>,
    pub end_reason: Option<EndReason>,
    pub quality: CallQuality,
}

#[derive(Debug, Clone)]
enum TimerKind {
    Ring,
    Connect,
    Grace(DeviceIdentity),
    Retention,
}

#[derive(Default)]
struct CallTimers {
    ring: Option<JoinHandle<()>>,
    connect: Option<JoinHandle<()>>,
    // device -> (timer, state to restore on reconnect)
    grace: HashMap<DeviceIdentity, (JoinHandle<()>, ParticipantConnection)>,
    retention: Option<JoinHandle<()>>,
}

impl CallTimers {
    /// Abort every timer that only matters while the call is live
    fn cancel_live(&mut self) {
        if let Some(t) = self.ring.take() {
            t.abort();
        }
        if let Some(t) = self.connect.take() {
            t.abort();
        }
        for (_, (t, _)) in self.grace.drain() {
            t.abort();
        }
    }
}

struct CallEntry {
    session: CallSession,
    timers: CallTimers,
}

struct Inner {
    registry: ConnectionRegistry,
    provider: Arc<dyn ConferencingProvider>,
    store: Arc<dyn ChatStore>,
    quality: QualityService,
    settings: CallSettings,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<CallEntry>>>>,
}

#[derive(Clone)]
pub struct CallService {
    inner: Arc<Inner>,
}

impl CallService {
    pub fn new(
        registry: ConnectionRegistry,
        provider: Arc<dyn ConferencingProvider>,
        store: Arc<dyn ChatStore>,
        quality: QualityService,
        settings: CallSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                provider,
                store,
                quality,
                settings,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    async fn entry(&self, call_id: Uuid) -> AppResult<Arc<Mutex<CallEntry>>> {
        self.inner
            .sessions
            .read()
            .await
            .get(&call_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("call {call_id}")))
    }

    pub async fn get(&self, call_id: Uuid) -> Option<CallSession> {
        let entry = self.entry(call_id).await.ok()?;
        let session = entry.lock().await.session.clone();
        Some(session)
    }

    /// Start a call: open a room, join the initiator, ring every invitee
    pub async fn start(
        &self,
        initiator: &DeviceIdentity,
        call_type: CallType,
        participant_ids: Vec<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> AppResult<JoinOutcome> {
        let invitees: BTreeSet<Uuid> = participant_ids
            .into_iter()
            .filter(|id| *id != initiator.user_id)
            .collect();
        if invitees.is_empty() {
            return Err(AppError::BadRequest(
                "a call needs at least one other participant".into(),
            ));
        }
        let requested = invitees.len() + 1;
        if requested > self.inner.settings.max_participants {
            return Err(AppError::TooManyParticipants {
                requested,
                max: self.inner.settings.max_participants,
            });
        }

        if let Some(conversation_id) = conversation_id {
            let members = conversation_members(
                self.inner.store.as_ref(),
                self.inner.settings.external_timeout,
                conversation_id,
            )
            .await?;
            if !members.contains(&initiator.user_id) {
                return Err(AppError::NotAMember);
            }
            if invitees.iter().any(|id| !members.contains(id)) {
                return Err(AppError::BadRequest(
                    "every participant must belong to the conversation".into(),
                ));
            }
        }

        let call_id = Uuid::new_v4();
        let now = Utc::now();
        let mut session = CallSession::new(
            call_id,
            call_type,
            initiator.user_id,
            conversation_id,
            invitees.iter().copied(),
            now,
        );

        let room_id = match with_timeout_result(
            "provider.create_room",
            self.inner.settings.external_timeout,
            self.inner
                .provider
                .create_room(call_id, call_type, self.inner.settings.max_participants),
        )
        .await
        {
            Ok(room_id) => room_id,
            Err(e) => {
                let err = AppError::from(e);
                self.record_failed_start(session, initiator.user_id).await;
                return Err(err);
            }
        };
        session.room_id = Some(room_id.clone());

        let token = match self.issue_token(&room_id, initiator, call_type).await {
            Ok(token) => token,
            Err(err) => {
                self.release_room_in_background(call_id, room_id);
                self.record_failed_start(session, initiator.user_id).await;
                return Err(err);
            }
        };

        session.add_participant(initiator, now);
        session.transition(CallState::Ringing)?;

        let entry = Arc::new(Mutex::new(CallEntry {
            session: session.clone(),
            timers: CallTimers::default(),
        }));
        {
            let mut guard = entry.lock().await;
            self.inner
                .sessions
                .write()
                .await
                .insert(call_id, entry.clone());
            guard.timers.ring =
                Some(self.spawn_timer(call_id, TimerKind::Ring, self.inner.settings.ring_timeout));
            CALLS_ACTIVE.inc();

            self.inner
                .registry
                .subscribe_device_to_call(initiator, call_id)
                .await;

            self.notify(
                &guard.session,
                &WsOutboundEvent::CallStateChanged {
                    call_id,
                    from: CallState::Initiating,
                    to: CallState::Ringing,
                },
            )
            .await;
            let invite = WsOutboundEvent::CallIncoming {
                call_id,
                initiator_id: initiator.user_id,
                call_type,
                participant_ids: invitees.iter().copied().collect(),
                conversation_id,
            };
            for invitee in &invitees {
                self.inner.registry.send_to_user(*invitee, &invite).await;
            }
        }

        tracing::info!(
            call_id = %call_id,
            initiator = %initiator,
            invitees = invitees.len(),
            call_type = call_type.as_str(),
            "call ringing"
        );
        Ok(JoinOutcome { session, token })
    }

    async fn record_failed_start(&self, mut session: CallSession, initiator: Uuid) {
        if session.transition(CallState::Ended).is_ok() {
            session.ended_at = Some(Utc::now());
            session.end_reason = Some(EndReason::Failed);
            session.ended_by = Some(initiator);
            CALLS_ENDED
                .with_label_values(&[EndReason::Failed.as_str()])
                .inc();
            self.archive(&session).await;
        }
        tracing::warn!(call_id = %session.call_id, "call setup failed");
    }

    async fn issue_token(
        &self,
        room_id: &str,
        identity: &DeviceIdentity,
        call_type: CallType,
    ) -> AppResult<RoomToken> {
        Ok(with_timeout_result(
            "provider.issue_token",
            self.inner.settings.external_timeout,
            self.inner.provider.issue_token(room_id, identity, call_type),
        )
        .await?)
    }

    /// Accept (or re-enter) a call from one device
    pub async fn join(&self, call_id: Uuid, identity: &DeviceIdentity) -> AppResult<JoinOutcome> {
        let entry = self.entry(call_id).await?;
        let mut guard = entry.lock().await;
        let CallEntry { session, timers } = &mut *guard;

        if session.state.is_terminal() {
            return Err(AppError::CallAlreadyEnded(call_id));
        }
        if !session.state.accepts_joins() {
            return Err(AppError::InvalidTransition(format!(
                "cannot join a call in {}",
                session.state
            )));
        }
        if !session.involves(identity.user_id) {
            return Err(AppError::NotInvited);
        }

        let already_present = session.present_participant(identity).is_some();
        if !already_present && !session.is_present(identity.user_id) {
            let parties = session.present_parties() + 1;
            if parties > self.inner.settings.max_participants {
                return Err(AppError::TooManyParticipants {
                    requested: parties,
                    max: self.inner.settings.max_participants,
                });
            }
        }

        let room_id = session
            .room_id
            .clone()
            .ok_or_else(|| AppError::Internal(format!("call {call_id} has no room")))?;
        // Token first: a provider failure leaves the roster untouched
        let token = self.issue_token(&room_id, identity, session.call_type).await?;
        let now = Utc::now();

        if already_present {
            // Re-entry from the same device, e.g. after a transport drop
            if let Some((timer, resume)) = timers.grace.remove(identity) {
                timer.abort();
                if let Some(p) = session.present_participant_mut(identity) {
                    p.connection_state = resume;
                }
            }
        } else {
            session.add_participant(identity, now);
            let first_accept = session.invitees.get(&identity.user_id) != Some(&InviteStatus::Accepted);
            if let Some(status) = session.invitees.get_mut(&identity.user_id) {
                *status = InviteStatus::Accepted;
            }
            if first_accept && identity.user_id != session.initiator_id {
                self.notify(
                    session,
                    &WsOutboundEvent::CallAccepted {
                        call_id,
                        user_id: identity.user_id,
                        device_id: identity.device_id.clone(),
                    },
                )
                .await;
            }
            self.notify(
                session,
                &WsOutboundEvent::CallParticipantJoined {
                    call_id,
                    user_id: identity.user_id,
                    device_id: identity.device_id.clone(),
                },
            )
            .await;
        }

        if session.state == CallState::Ringing && identity.user_id != session.initiator_id {
            if let Some(t) = timers.ring.take() {
                t.abort();
            }
            let from = session.transition(CallState::Connecting)?;
            timers.connect = Some(self.spawn_timer(
                call_id,
                TimerKind::Connect,
                self.inner.settings.connect_timeout,
            ));
            self.notify(
                session,
                &WsOutboundEvent::CallStateChanged {
                    call_id,
                    from,
                    to: CallState::Connecting,
                },
            )
            .await;
        }

        self.inner
            .registry
            .subscribe_device_to_call(identity, call_id)
            .await;

        tracing::info!(
            call_id = %call_id,
            participant = %identity,
            state = session.state.as_str(),
            "participant joined call"
        );
        Ok(JoinOutcome {
            session: session.clone(),
            token,
        })
    }

    /// Media confirmed for one device, by the client or the provider
    pub async fn on_media_connected(
        &self,
        call_id: Uuid,
        identity: &DeviceIdentity,
    ) -> AppResult<CallSession> {
        let entry = self.entry(call_id).await?;
        let mut guard = entry.lock().await;
        let CallEntry { session, timers } = &mut *guard;

        if session.state.is_terminal() {
            return Err(AppError::CallAlreadyEnded(call_id));
        }
        let participant = session
            .present_participant_mut(identity)
            .ok_or(AppError::NotAParticipant)?;
        participant.connection_state = ParticipantConnection::Connected;
        let update = participant_updated(participant);
        if let Some((timer, _)) = timers.grace.remove(identity) {
            timer.abort();
        }
        self.notify(session, &update).await;

        if session.state == CallState::Connecting && session.connected_parties() >= 2 {
            if let Some(t) = timers.connect.take() {
                t.abort();
            }
            let from = session.transition(CallState::Active)?;
            session.started_at = Some(Utc::now());
            self.notify(
                session,
                &WsOutboundEvent::CallStateChanged {
                    call_id,
                    from,
                    to: CallState::Active,
                },
            )
            .await;
            tracing::info!(call_id = %call_id, "call active");
        }
        Ok(session.clone())
    }

    /// Withdraw one invitee; the call ends once nobody is left to answer
    pub async fn decline(&self, call_id: Uuid, user_id: Uuid) -> AppResult<CallSession> {
        let entry = self.entry(call_id).await?;
        let mut guard = entry.lock().await;

        if guard.session.state.is_terminal() {
            return Err(AppError::CallAlreadyEnded(call_id));
        }
        if guard.session.is_present(user_id) {
            return Err(AppError::InvalidTransition(
                "already in the call; hang up instead".into(),
            ));
        }
        match guard.session.invitees.get_mut(&user_id) {
            Some(status) => *status = InviteStatus::Declined,
            None => return Err(AppError::NotInvited),
        }
        self.notify(
            &guard.session,
            &WsOutboundEvent::CallDeclined { call_id, user_id },
        )
        .await;

        let all_declined = guard
            .session
            .invitees
            .values()
            .all(|s| *s == InviteStatus::Declined);
        if all_declined && !guard.session.answered() {
            self.end_locked(&mut guard, EndReason::Declined, Some(user_id))
                .await;
        }
        Ok(guard.session.clone())
    }

    /// Hang up for everyone. Ending an ended call is a successful no-op.
    pub async fn end(&self, call_id: Uuid, user_id: Uuid) -> AppResult<CallSession> {
        let entry = self.entry(call_id).await?;
        let mut guard = entry.lock().await;

        if guard.session.state.is_terminal() {
            return Ok(guard.session.clone());
        }
        if !guard.session.is_present(user_id) {
            return Err(AppError::NotAParticipant);
        }
        self.end_locked(&mut guard, EndReason::Hangup, Some(user_id))
            .await;
        Ok(guard.session.clone())
    }

    /// Toggle media flags; no state transition
    pub async fn update_participant(
        &self,
        call_id: Uuid,
        identity: &DeviceIdentity,
        update: MediaUpdate,
    ) -> AppResult<CallParticipant> {
        let entry = self.entry(call_id).await?;
        let mut guard = entry.lock().await;

        if guard.session.state.is_terminal() {
            return Err(AppError::CallAlreadyEnded(call_id));
        }
        let participant = guard
            .session
            .present_participant_mut(identity)
            .ok_or(AppError::NotAParticipant)?;
        if let Some(v) = update.audio_enabled {
            participant.audio_enabled = v;
        }
        if let Some(v) = update.video_enabled {
            participant.video_enabled = v;
        }
        if let Some(v) = update.screen_share_enabled {
            participant.screen_share_enabled = v;
        }
        let participant = participant.clone();
        self.notify(&guard.session, &participant_updated(&participant))
            .await;
        Ok(participant)
    }

    /// Transport for a participating device dropped; start its grace period
    pub async fn on_connection_lost(&self, call_id: Uuid, identity: &DeviceIdentity) {
        let Ok(entry) = self.entry(call_id).await else {
            return;
        };
        let mut guard = entry.lock().await;
        let CallEntry { session, timers } = &mut *guard;
        if session.state.is_terminal() || timers.grace.contains_key(identity) {
            return;
        }
        let Some(participant) = session.present_participant_mut(identity) else {
            return;
        };

        let resume = participant.connection_state;
        participant.connection_state = ParticipantConnection::Reconnecting;
        let update = participant_updated(participant);
        let timer = self.spawn_timer(
            call_id,
            TimerKind::Grace(identity.clone()),
            self.inner.settings.grace_period,
        );
        timers.grace.insert(identity.clone(), (timer, resume));
        self.notify(session, &update).await;

        tracing::info!(
            call_id = %call_id,
            participant = %identity,
            grace_secs = self.inner.settings.grace_period.as_secs(),
            "participant connection lost"
        );
    }

    /// A device came back; restore it in every call still holding its grace timer
    pub async fn on_device_reconnected(&self, identity: &DeviceIdentity) {
        let entries: Vec<(Uuid, Arc<Mutex<CallEntry>>)> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect();

        for (call_id, entry) in entries {
            let mut guard = entry.lock().await;
            let CallEntry { session, timers } = &mut *guard;
            let Some((timer, resume)) = timers.grace.remove(identity) else {
                continue;
            };
            timer.abort();
            let Some(participant) = session.present_participant_mut(identity) else {
                continue;
            };
            participant.connection_state = resume;
            let update = participant_updated(participant);
            self.inner
                .registry
                .subscribe_device_to_call(identity, call_id)
                .await;
            self.notify(session, &update).await;
            tracing::info!(call_id = %call_id, participant = %identity, "participant resumed");
        }
    }

    /// Record a quality sample and warn the call when a participant turns poor
    pub async fn record_quality(
        &self,
        call_id: Uuid,
        identity: &DeviceIdentity,
        sample: QualitySample,
    ) -> AppResult<QualityReport> {
        let entry = self.entry(call_id).await?;
        let guard = entry.lock().await;
        if guard.session.state.is_terminal() {
            return Err(AppError::CallAlreadyEnded(call_id));
        }
        if guard.session.present_participant(identity).is_none() {
            return Err(AppError::NotAParticipant);
        }

        let report = self.inner.quality.record(call_id, identity, sample).await?;
        if report.degraded {
            let warning = WsOutboundEvent::CallQualityWarning {
                call_id,
                user_id: identity.user_id,
                device_id: identity.device_id.clone(),
                label: report.label,
            };
            let present: BTreeSet<Uuid> = guard
                .session
                .participants
                .iter()
                .filter(|p| p.is_present())
                .map(|p| p.user_id)
                .collect();
            for user in present {
                self.inner.registry.send_to_user(user, &warning).await;
            }
        }
        Ok(report)
    }

    pub async fn refresh_token(&self, call_id: Uuid, identity: &DeviceIdentity) -> AppResult<RoomToken> {
        let entry = self.entry(call_id).await?;
        let guard = entry.lock().await;
        if guard.session.state.is_terminal() {
            return Err(AppError::CallAlreadyEnded(call_id));
        }
        if guard.session.present_participant(identity).is_none() {
            return Err(AppError::NotAParticipant);
        }
        let room_id = guard
            .session
            .room_id
            .clone()
            .ok_or_else(|| AppError::Internal(format!("call {call_id} has no room")))?;
        self.issue_token(&room_id, identity, guard.session.call_type)
            .await
    }

    pub async fn stats(&self, call_id: Uuid, user_id: Uuid) -> AppResult<CallStats> {
        let entry = self.entry(call_id).await?;
        let session = entry.lock().await.session.clone();
        if !session.party_ids().contains(&user_id) {
            return Err(AppError::NotAParticipant);
        }
        Ok(CallStats {
            call_id,
            state: session.state,
            call_type: session.call_type,
            participant_records: session.participants.len(),
            present_parties: session.present_parties(),
            duration_ms: session.duration_ms(Utc::now()),
            end_reason: session.end_reason,
            quality: self.inner.quality.call_summary(call_id).await,
        })
    }

    /// Live calls the user is part of
    pub async fn active_calls(&self, user_id: Uuid) -> Vec<CallSession> {
        let entries: Vec<Arc<Mutex<CallEntry>>> =
            self.inner.sessions.read().await.values().cloned().collect();
        let mut calls = Vec::new();
        for entry in entries {
            let guard = entry.lock().await;
            if !guard.session.state.is_terminal() && guard.session.party_ids().contains(&user_id) {
                calls.push(guard.session.clone());
            }
        }
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        calls
    }

    pub async fn history(&self, user_id: Uuid, limit: usize) -> AppResult<Vec<CallSession>> {
        Ok(with_timeout_result(
            "store.call_history",
            self.inner.settings.external_timeout,
            self.inner.store.call_history(user_id, limit),
        )
        .await?)
    }

    fn spawn_timer(&self, call_id: Uuid, kind: TimerKind, delay: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            service.on_timer(call_id, kind).await;
        })
    }

    async fn on_timer(&self, call_id: Uuid, kind: TimerKind) {
        if let TimerKind::Retention = kind {
            self.inner.sessions.write().await.remove(&call_id);
            tracing::debug!(call_id = %call_id, "ended call evicted");
            return;
        }

        let Ok(entry) = self.entry(call_id).await else {
            return;
        };
        let mut guard = entry.lock().await;

        match kind {
            TimerKind::Ring => {
                guard.timers.ring.take();
                if guard.session.state == CallState::Ringing {
                    tracing::info!(call_id = %call_id, "ring timeout");
                    self.end_locked(&mut guard, EndReason::Missed, None).await;
                }
            }
            TimerKind::Connect => {
                guard.timers.connect.take();
                if guard.session.state == CallState::Connecting {
                    tracing::info!(call_id = %call_id, "media connect timeout");
                    self.end_locked(&mut guard, EndReason::Timeout, None).await;
                }
            }
            TimerKind::Grace(identity) => {
                if guard.timers.grace.remove(&identity).is_none() {
                    return;
                }
                self.leave_locked(&mut guard, &identity).await;
            }
            TimerKind::Retention => {}
        }
    }

    /// Mark a device as gone and end the call if too few parties remain
    async fn leave_locked(&self, entry: &mut CallEntry, identity: &DeviceIdentity) {
        let call_id = entry.session.call_id;
        if entry.session.state.is_terminal() {
            return;
        }
        let Some(participant) = entry.session.present_participant_mut(identity) else {
            return;
        };
        participant.left_at = Some(Utc::now());
        participant.connection_state = ParticipantConnection::Left;

        self.inner
            .registry
            .unsubscribe_device_from_call(identity, call_id)
            .await;
        self.inner
            .quality
            .clear_participant(call_id, identity)
            .await;
        self.notify(
            &entry.session,
            &WsOutboundEvent::CallParticipantLeft {
                call_id,
                user_id: identity.user_id,
                device_id: identity.device_id.clone(),
            },
        )
        .await;
        tracing::info!(call_id = %call_id, participant = %identity, "participant left call");

        let too_few = match entry.session.state {
            CallState::Connecting | CallState::Active => entry.session.present_parties() < 2,
            CallState::Ringing => !entry.session.is_present(entry.session.initiator_id),
            _ => false,
        };
        if too_few {
            self.end_locked(entry, EndReason::PeerDisconnected, None)
                .await;
        }
    }

    async fn end_locked(&self, entry: &mut CallEntry, reason: EndReason, ended_by: Option<Uuid>) {
        let call_id = entry.session.call_id;
        let Ok(from) = entry.session.transition(CallState::Ended) else {
            return;
        };
        let now = Utc::now();
        entry.session.ended_at = Some(now);
        entry.session.end_reason = Some(reason);
        entry.session.ended_by = ended_by;
        for participant in entry
            .session
            .participants
            .iter_mut()
            .filter(|p| p.is_present())
        {
            participant.left_at = Some(now);
            participant.connection_state = ParticipantConnection::Left;
        }
        entry.timers.cancel_live();
        CALLS_ACTIVE.dec();
        CALLS_ENDED.with_label_values(&[reason.as_str()]).inc();

        self.notify(
            &entry.session,
            &WsOutboundEvent::CallStateChanged {
                call_id,
                from,
                to: CallState::Ended,
            },
        )
        .await;
        self.notify(
            &entry.session,
            &WsOutboundEvent::CallEnded {
                call_id,
                reason,
                ended_by,
            },
        )
        .await;

        self.inner.registry.clear_call_subscription(call_id).await;
        self.inner.quality.clear_call(call_id).await;
        if let Some(room_id) = entry.session.room_id.clone() {
            self.release_room_in_background(call_id, room_id);
        }
        self.archive(&entry.session).await;
        entry.timers.retention = Some(self.spawn_timer(
            call_id,
            TimerKind::Retention,
            self.inner.settings.retention,
        ));

        tracing::info!(
            call_id = %call_id,
            reason = reason.as_str(),
            duration_ms = entry.session.duration_ms(now).unwrap_or(0),
            "call ended"
        );
    }

    // A provider outage while ending must not hold up the call or its parties
    fn release_room_in_background(&self, call_id: Uuid, room_id: String) {
        let provider = self.inner.provider.clone();
        let timeout = self.inner.settings.external_timeout;
        tokio::spawn(async move {
            let result = with_retry("provider.release_room", &RetryConfig::default(), || {
                with_timeout_result("provider.release_room", timeout, provider.release_room(&room_id))
            })
            .await;
            if let Err(e) = result {
                tracing::error!(call_id = %call_id, error = %e, "failed to release provider room");
            }
        });
    }

    async fn archive(&self, session: &CallSession) {
        if let Err(e) = with_timeout_result(
            "store.archive_call",
            self.inner.settings.external_timeout,
            self.inner.store.archive_call(session),
        )
        .await
        {
            tracing::warn!(call_id = %session.call_id, error = %e, "failed to archive call");
        }
    }

    async fn notify(&self, session: &CallSession, event: &WsOutboundEvent) {
        for user in session.party_ids() {
            self.inner.registry.send_to_user(user, event).await;
        }
    }
}

fn participant_updated(p: &CallParticipant) -> WsOutboundEvent {
    WsOutboundEvent::CallParticipantUpdated {
        call_id: p.call_id,
        user_id: p.user_id,
        device_id: p.device_id.clone(),
        connection_state: p.connection_state,
        audio_enabled: p.audio_enabled,
        video_enabled: p.video_enabled,
        screen_share_enabled: p.screen_share_enabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QualityThresholds;
    use crate::services::provider::TokenRoomProvider;
    use crate::services::store::InMemoryChatStore;
    use crate::websocket::SessionPolicy;

    struct Fixture {
        calls: CallService,
        provider: Arc<TokenRoomProvider>,
        store: Arc<InMemoryChatStore>,
        u1: DeviceIdentity,
        u2: DeviceIdentity,
    }

    fn fixture() -> Fixture {
        let config = Config::test_defaults();
        let registry = ConnectionRegistry::new(SessionPolicy::Replace);
        let provider = Arc::new(TokenRoomProvider::new(config.provider.clone()));
        let store = Arc::new(InMemoryChatStore::new());
        let calls = CallService::new(
            registry,
            provider.clone(),
            store.clone(),
            QualityService::new(config.quality_window, QualityThresholds::default()),
            CallSettings::from_config(&config),
        );
        Fixture {
            calls,
            provider,
            store,
            u1: DeviceIdentity::new(Uuid::new_v4(), "phone"),
            u2: DeviceIdentity::new(Uuid::new_v4(), "phone"),
        }
    }

    async fn active_call(f: &Fixture) -> Uuid {
        let started = f
            .calls
            .start(&f.u1, CallType::Video, vec![f.u2.user_id], None)
            .await
            .unwrap();
        let call_id = started.session.call_id;
        f.calls.join(call_id, &f.u2).await.unwrap();
        f.calls.on_media_connected(call_id, &f.u1).await.unwrap();
        let session = f.calls.on_media_connected(call_id, &f.u2).await.unwrap();
        assert_eq!(session.state, CallState::Active);
        call_id
    }

    #[tokio::test]
    async fn test_start_rings_and_join_connects() {
        let f = fixture();
        let started = f
            .calls
            .start(&f.u1, CallType::Audio, vec![f.u2.user_id], None)
            .await
            .unwrap();
        assert_eq!(started.session.state, CallState::Ringing);
        assert_eq!(started.session.participants.len(), 1);

        let joined = f.calls.join(started.session.call_id, &f.u2).await.unwrap();
        assert_eq!(joined.session.state, CallState::Connecting);
        assert_eq!(joined.session.invitees[&f.u2.user_id], InviteStatus::Accepted);
    }

    #[tokio::test]
    async fn test_roster_cap() {
        let f = fixture();
        let many: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        assert!(matches!(
            f.calls.start(&f.u1, CallType::Video, many, None).await,
            Err(AppError::TooManyParticipants { requested: 9, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_provider_outage_fails_start() {
        let f = fixture();
        f.provider.set_available(false);
        let err = f
            .calls
            .start(&f.u1, CallType::Video, vec![f.u2.user_id], None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(f.calls.active_calls(f.u1.user_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_blocks_joins() {
        let f = fixture();
        let call_id = active_call(&f).await;

        let ended = f.calls.end(call_id, f.u1.user_id).await.unwrap();
        assert_eq!(ended.end_reason, Some(EndReason::Hangup));
        let again = f.calls.end(call_id, f.u2.user_id).await.unwrap();
        assert_eq!(again.ended_by, Some(f.u1.user_id));

        assert!(matches!(
            f.calls.join(call_id, &f.u2).await,
            Err(AppError::CallAlreadyEnded(_))
        ));
        assert_eq!(f.store.archived_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_decline_by_sole_invitee_ends_call() {
        let f = fixture();
        let call_id = f
            .calls
            .start(&f.u1, CallType::Video, vec![f.u2.user_id], None)
            .await
            .unwrap()
            .session
            .call_id;
        let session = f.calls.decline(call_id, f.u2.user_id).await.unwrap();
        assert_eq!(session.state, CallState::Ended);
        assert_eq!(session.end_reason, Some(EndReason::Declined));
    }

    #[tokio::test]
    async fn test_decline_after_joining_is_rejected() {
        let f = fixture();
        let call_id = f
            .calls
            .start(&f.u1, CallType::Video, vec![f.u2.user_id], None)
            .await
            .unwrap()
            .session
            .call_id;
        f.calls.join(call_id, &f.u2).await.unwrap();

        assert!(matches!(
            f.calls.decline(call_id, f.u2.user_id).await,
            Err(AppError::InvalidTransition(_))
        ));
        let session = f.calls.get(call_id).await.unwrap();
        assert_eq!(session.invitees[&f.u2.user_id], InviteStatus::Accepted);
        assert_eq!(session.state, CallState::Connecting);
    }

    #[tokio::test]
    async fn test_group_decline_keeps_ringing() {
        let f = fixture();
        let u3 = Uuid::new_v4();
        let call_id = f
            .calls
            .start(&f.u1, CallType::Video, vec![f.u2.user_id, u3], None)
            .await
            .unwrap()
            .session
            .call_id;
        let session = f.calls.decline(call_id, u3).await.unwrap();
        assert_eq!(session.state, CallState::Ringing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_marks_missed() {
        let f = fixture();
        let call_id = f
            .calls
            .start(&f.u1, CallType::Video, vec![f.u2.user_id], None)
            .await
            .unwrap()
            .session
            .call_id;

        tokio::time::sleep(Duration::from_secs(61)).await;
        let session = f.calls.get(call_id).await.unwrap();
        assert_eq!(session.state, CallState::Ended);
        assert_eq!(session.end_reason, Some(EndReason::Missed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let f = fixture();
        let call_id = f
            .calls
            .start(&f.u1, CallType::Video, vec![f.u2.user_id], None)
            .await
            .unwrap()
            .session
            .call_id;
        f.calls.join(call_id, &f.u2).await.unwrap();

        // Joining cancelled the ring timer; only the connect timer runs now
        tokio::time::sleep(Duration::from_secs(31)).await;
        let session = f.calls.get(call_id).await.unwrap();
        assert_eq!(session.end_reason, Some(EndReason::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_reconnect_ends_after_grace() {
        let f = fixture();
        let call_id = active_call(&f).await;

        f.calls.on_connection_lost(call_id, &f.u2).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.calls.get(call_id).await.unwrap().state, CallState::Active);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let session = f.calls.get(call_id).await.unwrap();
        assert_eq!(session.end_reason, Some(EndReason::PeerDisconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_keeps_call() {
        let f = fixture();
        let call_id = active_call(&f).await;

        f.calls.on_connection_lost(call_id, &f.u2).await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        f.calls.on_device_reconnected(&f.u2).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let session = f.calls.get(call_id).await.unwrap();
        assert_eq!(session.state, CallState::Active);
        let p = session.present_participant(&f.u2).unwrap();
        assert!(p.left_at.is_none());
        assert_eq!(p.connection_state, ParticipantConnection::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_session_evicted_after_retention() {
        let f = fixture();
        let call_id = active_call(&f).await;
        f.calls.end(call_id, f.u1.user_id).await.unwrap();

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(f.calls.get(call_id).await.is_none());
        assert_eq!(f.calls.history(f.u2.user_id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_media_toggle_requires_presence() {
        let f = fixture();
        let call_id = active_call(&f).await;
        let update = MediaUpdate {
            video_enabled: Some(false),
            ..MediaUpdate::default()
        };
        let p = f
            .calls
            .update_participant(call_id, &f.u2, update)
            .await
            .unwrap();
        assert!(!p.video_enabled);
        assert!(p.audio_enabled);

        let stranger = DeviceIdentity::new(Uuid::new_v4(), "phone");
        assert!(matches!(
            f.calls.update_participant(call_id, &stranger, update).await,
            Err(AppError::NotAParticipant)
        ));
    }
}
