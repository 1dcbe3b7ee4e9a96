use crate::services::{CallService, MessageService, PresenceService};
use crate::websocket::{ConnectionRegistry, DisconnectReason, RegistryEvent, RegistryListener};
use async_trait::async_trait;

/// Routes connection lifecycle changes into the engines that care about them
///
/// On connect the pending message queue is flushed before presence goes
/// online. A replaced connection is not a disconnect: the device never left.
pub struct Lifecycle {
    registry: ConnectionRegistry,
    messages: MessageService,
    presence: PresenceService,
    calls: CallService,
}

impl Lifecycle {
    pub fn new(
        registry: ConnectionRegistry,
        messages: MessageService,
        presence: PresenceService,
        calls: CallService,
    ) -> Self {
        Self {
            registry,
            messages,
            presence,
            calls,
        }
    }
}

#[async_trait]
impl RegistryListener for Lifecycle {
    async fn on_registry_event(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::Registered {
                connection,
                replaced,
            } => {
                let flushed = self
                    .messages
                    .attach_connection(connection.id, &connection.identity)
                    .await;
                if flushed > 0 {
                    tracing::debug!(
                        connection_id = %connection.id,
                        flushed,
                        "flushed queued events on connect"
                    );
                }
                self.presence.on_connected(connection.identity.user_id).await;
                if replaced.is_none() {
                    self.calls.on_device_reconnected(&connection.identity).await;
                }
            }
            RegistryEvent::Deregistered { connection, reason } => {
                self.messages
                    .detach_connection(connection.id, &connection.identity)
                    .await;
                if *reason == DisconnectReason::Replaced {
                    return;
                }
                self.presence
                    .on_disconnected(connection.identity.user_id)
                    .await;
                if let Some(call_id) = connection.call_id {
                    // Another live connection of the same device keeps the call
                    if !self.registry.is_device_online(&connection.identity).await {
                        self.calls
                            .on_connection_lost(call_id, &connection.identity)
                            .await;
                    }
                }
            }
        }
    }
}
