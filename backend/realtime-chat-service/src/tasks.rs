//! Periodic background sweeps

use crate::services::{MessageService, TypingService};
use crate::websocket::ConnectionRegistry;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Deregister connections silent for two heartbeat intervals
pub fn spawn_heartbeat_sweep(registry: ConnectionRegistry, heartbeat: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = registry.sweep_stale(heartbeat).await;
            if !removed.is_empty() {
                tracing::info!(count = removed.len(), "heartbeat sweep removed connections");
            }
        }
    })
}

/// Backstop for typing indicators whose timer was lost
pub fn spawn_typing_sweep(typing: TypingService, window: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let stopped = typing.sweep_expired().await;
            if stopped > 0 {
                tracing::debug!(stopped, "typing sweep stopped indicators");
            }
        }
    })
}

/// Flag queued deliveries older than `retention` as stale, then forget settled messages
pub fn spawn_stale_queue_sweep(
    messages: MessageService,
    retention: Duration,
    dedupe_ttl: Duration,
) -> JoinHandle<()> {
    // Hourly at most; short retentions are swept proportionally faster
    let period = retention.min(Duration::from_secs(3600)).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = messages.expire_stale(retention).await;
            if expired > 0 {
                tracing::info!(expired, "stale queued deliveries dropped");
            }
            messages.prune_settled(dedupe_ttl, retention).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceIdentity;
    use crate::websocket::SessionPolicy;
    use tokio::sync::mpsc::unbounded_channel;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sweep_drops_silent_connection() {
        let registry = ConnectionRegistry::new(SessionPolicy::Replace);
        let (tx, _rx) = unbounded_channel();
        let identity = DeviceIdentity::new(Uuid::new_v4(), "phone");
        registry.register(identity.clone(), tx).await.unwrap();

        let sweep = spawn_heartbeat_sweep(registry.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(registry.is_device_online(&identity).await);

        tokio::time::sleep(Duration::from_secs(46)).await;
        assert!(!registry.is_device_online(&identity).await);
        sweep.abort();
    }
}
