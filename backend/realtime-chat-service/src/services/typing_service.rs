use crate::error::{AppError, AppResult};
use crate::services::conversation_members;
use crate::services::store::ChatStore;
use crate::websocket::message_types::WsOutboundEvent;
use crate::websocket::ConnectionRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

type IndicatorKey = (Uuid, Uuid);

struct Indicator {
    expires_at: Instant,
    generation: u64,
    /// Members to notify on stop, captured at start
    audience: Vec<Uuid>,
    timer: JoinHandle<()>,
}

struct Inner {
    registry: ConnectionRegistry,
    store: Arc<dyn ChatStore>,
    external_timeout: Duration,
    window: Duration,
    indicators: Mutex<HashMap<IndicatorKey, Indicator>>,
}

/// Ephemeral per-(conversation, user) typing indicators
///
/// `typing:start` is broadcast once per burst; keystrokes inside the window
/// only push the expiry out. Every indicator owns an expiry timer, so an
/// indicator is stopped exactly once whether by timer, sweep or explicit stop.
#[derive(Clone)]
pub struct TypingService {
    inner: Arc<Inner>,
}

impl TypingService {
    pub fn new(
        registry: ConnectionRegistry,
        store: Arc<dyn ChatStore>,
        external_timeout: Duration,
        window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                external_timeout,
                window,
                indicators: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    pub async fn start_typing(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let key = (conversation_id, user_id);
        let expires_at = Instant::now() + self.inner.window;

        // Refresh without touching the store when already typing
        {
            let mut indicators = self.inner.indicators.lock().await;
            if let Some(indicator) = indicators.get_mut(&key) {
                if indicator.expires_at > Instant::now() {
                    indicator.timer.abort();
                    indicator.generation += 1;
                    indicator.expires_at = expires_at;
                    indicator.timer = self.spawn_expiry(key, indicator.generation, expires_at);
                    return Ok(());
                }
            }
        }

        let members = conversation_members(
            self.inner.store.as_ref(),
            self.inner.external_timeout,
            conversation_id,
        )
        .await?;
        if !members.contains(&user_id) {
            return Err(AppError::NotAMember);
        }
        let audience: Vec<Uuid> = members.into_iter().filter(|m| *m != user_id).collect();

        let evicted = {
            let mut indicators = self.inner.indicators.lock().await;
            // A concurrent start may have won while the store was consulted
            if let Some(indicator) = indicators.get(&key) {
                if indicator.expires_at > Instant::now() {
                    return Ok(());
                }
            }
            // Anything still here is past its expiry and its timer has not run yet
            let evicted = indicators.remove(&key);
            let generation = evicted.as_ref().map(|i| i.generation + 1).unwrap_or(0);
            if let Some(old) = &evicted {
                old.timer.abort();
            }
            let timer = self.spawn_expiry(key, generation, expires_at);
            indicators.insert(
                key,
                Indicator {
                    expires_at,
                    generation,
                    audience: audience.clone(),
                    timer,
                },
            );
            evicted
        };

        if let Some(old) = evicted {
            self.broadcast(
                &old.audience,
                WsOutboundEvent::TypingStop {
                    conversation_id,
                    user_id,
                },
            )
            .await;
        }
        self.broadcast(
            &audience,
            WsOutboundEvent::TypingStart {
                conversation_id,
                user_id,
            },
        )
        .await;
        tracing::debug!(conversation_id = %conversation_id, user_id = %user_id, "typing started");
        Ok(())
    }

    /// Explicit stop; a no-op when the user is not typing
    pub async fn stop_typing(&self, conversation_id: Uuid, user_id: Uuid) {
        let removed = self
            .inner
            .indicators
            .lock()
            .await
            .remove(&(conversation_id, user_id));
        if let Some(indicator) = removed {
            indicator.timer.abort();
            self.broadcast(
                &indicator.audience,
                WsOutboundEvent::TypingStop {
                    conversation_id,
                    user_id,
                },
            )
            .await;
        }
    }

    pub async fn is_typing(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        self.inner
            .indicators
            .lock()
            .await
            .get(&(conversation_id, user_id))
            .is_some_and(|i| i.expires_at > Instant::now())
    }

    /// Evict every indicator past its expiry; returns how many were stopped
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(IndicatorKey, Indicator)> = {
            let mut indicators = self.inner.indicators.lock().await;
            let keys: Vec<IndicatorKey> = indicators
                .iter()
                .filter(|(_, i)| i.expires_at <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| indicators.remove(&k).map(|i| (k, i)))
                .collect()
        };

        let count = expired.len();
        for ((conversation_id, user_id), indicator) in expired {
            indicator.timer.abort();
            self.broadcast(
                &indicator.audience,
                WsOutboundEvent::TypingStop {
                    conversation_id,
                    user_id,
                },
            )
            .await;
        }
        count
    }

    fn spawn_expiry(&self, key: IndicatorKey, generation: u64, deadline: Instant) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            service.expire(key, generation).await;
        })
    }

    async fn expire(&self, key: IndicatorKey, generation: u64) {
        let removed = {
            let mut indicators = self.inner.indicators.lock().await;
            match indicators.get(&key) {
                Some(i) if i.generation == generation => indicators.remove(&key),
                _ => None,
            }
        };
        if let Some(indicator) = removed {
            let (conversation_id, user_id) = key;
            self.broadcast(
                &indicator.audience,
                WsOutboundEvent::TypingStop {
                    conversation_id,
                    user_id,
                },
            )
            .await;
            tracing::debug!(conversation_id = %conversation_id, user_id = %user_id, "typing expired");
        }
    }

    async fn broadcast(&self, audience: &[Uuid], event: WsOutboundEvent) {
        for member in audience {
            self.inner.registry.send_to_user(*member, &event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceIdentity;
    use crate::services::store::InMemoryChatStore;
    use crate::websocket::SessionPolicy;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    async fn setup() -> (TypingService, Uuid, Uuid, UnboundedReceiver<WsOutboundEvent>) {
        let registry = ConnectionRegistry::new(SessionPolicy::Replace);
        let store = Arc::new(InMemoryChatStore::new());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation_id = Uuid::new_v4();
        store.add_conversation(conversation_id, vec![alice, bob]).await;

        let (tx, rx) = unbounded_channel();
        registry
            .register(DeviceIdentity::new(bob, "phone"), tx)
            .await
            .unwrap();
        let typing = TypingService::new(
            registry,
            store,
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        (typing, conversation_id, alice, rx)
    }

    fn types(rx: &mut UnboundedReceiver<WsOutboundEvent>) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            out.push(evt.event_type());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_coalesce_and_expire_once() {
        let (typing, conversation_id, alice, mut rx) = setup().await;

        typing.start_typing(conversation_id, alice).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        typing.start_typing(conversation_id, alice).await.unwrap();
        assert_eq!(types(&mut rx), vec!["typing:start"]);

        // Refreshed at t=3, so still typing at t=7
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(typing.is_typing(conversation_id, alice).await);
        assert!(types(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!typing.is_typing(conversation_id, alice).await);
        assert_eq!(types(&mut rx), vec!["typing:stop"]);

        assert_eq!(typing.sweep_expired().await, 0);
        assert!(types(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_is_immediate_and_single() {
        let (typing, conversation_id, alice, mut rx) = setup().await;
        typing.start_typing(conversation_id, alice).await.unwrap();
        typing.stop_typing(conversation_id, alice).await;
        typing.stop_typing(conversation_id, alice).await;
        assert_eq!(types(&mut rx), vec!["typing:start", "typing:stop"]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(types(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_over_unswept_indicator_stops_it_first() {
        let (typing, conversation_id, alice, mut rx) = setup().await;
        let bob = typing
            .inner
            .store
            .conversation_members(conversation_id)
            .await
            .unwrap()
            .into_iter()
            .find(|m| *m != alice)
            .unwrap();

        // Expired indicator whose expiry timer never got to run
        typing.inner.indicators.lock().await.insert(
            (conversation_id, alice),
            Indicator {
                expires_at: Instant::now(),
                generation: 0,
                audience: vec![bob],
                timer: tokio::spawn(std::future::pending::<()>()),
            },
        );

        typing.start_typing(conversation_id, alice).await.unwrap();
        assert_eq!(types(&mut rx), vec!["typing:stop", "typing:start"]);
        assert!(typing.is_typing(conversation_id, alice).await);
    }

    #[tokio::test]
    async fn test_non_member_cannot_type() {
        let (typing, conversation_id, _alice, _rx) = setup().await;
        assert!(matches!(
            typing.start_typing(conversation_id, Uuid::new_v4()).await,
            Err(AppError::NotAMember)
        ));
    }
}
