//! Dispatch of inbound socket events into the engines
//!
//! Every command runs on behalf of the (user, device) the connection was
//! authenticated as; payloads never name the actor.

use crate::error::{AppResult, ErrorKind};
use crate::models::{ConnectionId, DeviceIdentity, MediaUpdate, QualitySample};
use crate::services::JoinOutcome;
use crate::state::AppState;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::DisconnectReason;
use chrono::Utc;
use uuid::Uuid;

pub fn joined_event(outcome: &JoinOutcome) -> WsOutboundEvent {
    WsOutboundEvent::CallJoined {
        call_id: outcome.session.call_id,
        room_id: outcome.token.room_id.clone(),
        token: outcome.token.token.clone(),
        url: outcome.token.url.clone(),
        expires_at: outcome.token.expires_at,
        state: outcome.session.state,
    }
}

/// Handle one inbound event; failures are reported back to the originating connection
pub async fn handle_inbound(
    state: &AppState,
    connection_id: ConnectionId,
    identity: &DeviceIdentity,
    event: WsInboundEvent,
) {
    match event {
        WsInboundEvent::Heartbeat => {
            state.registry.touch(connection_id).await;
            return;
        }
        WsInboundEvent::PresenceIdle => {}
        _ => state.presence.record_activity(identity.user_id).await,
    }

    let request = event.event_type();
    let call_id = event.call_id();
    let is_call_event = event.is_call_event();

    let result = dispatch(state, connection_id, identity, event).await;
    let Err(err) = result else {
        return;
    };

    tracing::warn!(
        connection_id = %connection_id,
        user_id = %identity.user_id,
        device_id = %identity.device_id,
        request,
        code = err.error_code(),
        error = %err,
        "socket command failed"
    );

    let reply = if is_call_event {
        WsOutboundEvent::CallError {
            call_id,
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    } else {
        WsOutboundEvent::Error {
            request: request.to_string(),
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    };
    // The connection may already be gone; nothing left to tell it then
    let _ = state.registry.send(connection_id, reply).await;

    if err.kind() == ErrorKind::Fatal {
        state
            .registry
            .deregister_with(connection_id, DisconnectReason::Closed)
            .await;
    }
}

async fn dispatch(
    state: &AppState,
    connection_id: ConnectionId,
    identity: &DeviceIdentity,
    event: WsInboundEvent,
) -> AppResult<()> {
    match event {
        WsInboundEvent::MessageSend {
            conversation_id,
            client_message_id,
            payload,
        } => {
            let outcome = state
                .messages
                .send(identity, conversation_id, &client_message_id, payload)
                .await?;
            state
                .registry
                .send(
                    connection_id,
                    WsOutboundEvent::MessageSent {
                        message_id: outcome.message_id,
                        client_message_id: outcome.client_message_id,
                        conversation_id: outcome.conversation_id,
                        duplicate: outcome.duplicate,
                    },
                )
                .await
        }
        WsInboundEvent::MessageEdit {
            conversation_id,
            message_id,
            payload,
        } => {
            state
                .messages
                .edit_message(identity, conversation_id, message_id, payload)
                .await
        }
        WsInboundEvent::MessageDelete {
            conversation_id,
            message_id,
        } => {
            state
                .messages
                .delete_message(identity, conversation_id, message_id)
                .await
        }
        WsInboundEvent::MessageReact {
            conversation_id,
            message_id,
            emoji,
            action,
        } => {
            state
                .messages
                .react(identity, conversation_id, message_id, &emoji, action)
                .await
        }
        WsInboundEvent::MessageAck { message_id } => {
            state.messages.mark_delivered(identity, message_id).await?;
            Ok(())
        }
        WsInboundEvent::MessageRead { message_id } => {
            state.messages.mark_read(identity, message_id).await?;
            Ok(())
        }

        WsInboundEvent::TypingStart { conversation_id } => {
            state
                .typing
                .start_typing(conversation_id, identity.user_id)
                .await
        }
        WsInboundEvent::TypingStop { conversation_id } => {
            state
                .typing
                .stop_typing(conversation_id, identity.user_id)
                .await;
            Ok(())
        }
        WsInboundEvent::PresenceIdle => {
            state.presence.mark_away(identity.user_id).await;
            Ok(())
        }
        WsInboundEvent::Heartbeat => Ok(()),

        WsInboundEvent::CallInitiate {
            participant_ids,
            call_type,
            conversation_id,
        } => {
            let outcome = state
                .calls
                .start(identity, call_type, participant_ids, conversation_id)
                .await?;
            state
                .registry
                .send(connection_id, joined_event(&outcome))
                .await
        }
        WsInboundEvent::CallAccept { call_id } => {
            let outcome = state.calls.join(call_id, identity).await?;
            state
                .registry
                .send(connection_id, joined_event(&outcome))
                .await
        }
        WsInboundEvent::CallDecline { call_id } => {
            state.calls.decline(call_id, identity.user_id).await?;
            Ok(())
        }
        WsInboundEvent::CallEnd { call_id } => {
            state.calls.end(call_id, identity.user_id).await?;
            Ok(())
        }
        WsInboundEvent::CallToggleAudio { call_id, enabled } => {
            toggle(state, identity, call_id, MediaUpdate {
                audio_enabled: Some(enabled),
                ..MediaUpdate::default()
            })
            .await
        }
        WsInboundEvent::CallToggleVideo { call_id, enabled } => {
            toggle(state, identity, call_id, MediaUpdate {
                video_enabled: Some(enabled),
                ..MediaUpdate::default()
            })
            .await
        }
        WsInboundEvent::CallToggleScreenShare { call_id, enabled } => {
            toggle(state, identity, call_id, MediaUpdate {
                screen_share_enabled: Some(enabled),
                ..MediaUpdate::default()
            })
            .await
        }
        WsInboundEvent::CallMediaConnected { call_id } => {
            state.calls.on_media_connected(call_id, identity).await?;
            Ok(())
        }
        WsInboundEvent::CallQualityUpdate {
            call_id,
            jitter_ms,
            packet_loss_pct,
            rtt_ms,
            bandwidth_kbps,
        } => {
            let sample = QualitySample {
                jitter_ms,
                packet_loss_pct,
                rtt_ms,
                bandwidth_kbps,
                recorded_at: Utc::now(),
            };
            state.calls.record_quality(call_id, identity, sample).await?;
            Ok(())
        }
    }
}

async fn toggle(
    state: &AppState,
    identity: &DeviceIdentity,
    call_id: Uuid,
    update: MediaUpdate,
) -> AppResult<()> {
    state
        .calls
        .update_participant(call_id, identity, update)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn drain(rx: &mut UnboundedReceiver<WsOutboundEvent>) -> Vec<WsOutboundEvent> {
        let mut out = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            out.push(evt);
        }
        out
    }

    #[tokio::test]
    async fn test_send_replies_with_confirmation() {
        let (state, store) = AppState::in_memory(Config::test_defaults()).await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation_id = Uuid::new_v4();
        store.add_conversation(conversation_id, vec![alice, bob]).await;
        store.register_device(alice, "phone").await;
        store.register_device(bob, "phone").await;

        let identity = DeviceIdentity::new(alice, "phone");
        let (tx, mut rx) = unbounded_channel();
        let conn = state.registry.register(identity.clone(), tx).await.unwrap();

        let send = WsInboundEvent::MessageSend {
            conversation_id,
            client_message_id: "c-1".into(),
            payload: "hi".into(),
        };
        handle_inbound(&state, conn, &identity, send.clone()).await;
        handle_inbound(&state, conn, &identity, send).await;

        let sent: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|evt| match evt {
                WsOutboundEvent::MessageSent { duplicate, .. } => Some(duplicate),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![false, true]);
    }

    #[tokio::test]
    async fn test_failures_are_reported_on_the_right_channel() {
        let (state, _store) = AppState::in_memory(Config::test_defaults()).await;
        let identity = DeviceIdentity::new(Uuid::new_v4(), "phone");
        let (tx, mut rx) = unbounded_channel();
        let conn = state.registry.register(identity.clone(), tx).await.unwrap();

        let unknown_call = Uuid::new_v4();
        handle_inbound(&state, conn, &identity, WsInboundEvent::CallAccept { call_id: unknown_call }).await;
        handle_inbound(
            &state,
            conn,
            &identity,
            WsInboundEvent::TypingStart {
                conversation_id: Uuid::new_v4(),
            },
        )
        .await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            WsOutboundEvent::CallError { call_id: Some(id), code, .. }
                if *id == unknown_call && code == "not_found"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            WsOutboundEvent::Error { request, code, .. }
                if request == "typing:start" && code == "conversation_not_found"
        )));
        // Validation failures keep the connection open
        assert!(state.registry.get(conn).await.is_some());
    }
}
