use crate::{
    config::Config,
    error::AppError,
    middleware::JwtVerifier,
    models::QualityThresholds,
    services::{
        CallService, CallSettings, ChatStore, ConferencingProvider, InMemoryChatStore, Lifecycle,
        MessageService, PresenceService, QualityService, TokenRoomProvider, TypingService,
    },
    tasks,
    websocket::ConnectionRegistry,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jwt: JwtVerifier,
    pub registry: ConnectionRegistry,
    pub store: Arc<dyn ChatStore>,
    pub messages: MessageService,
    pub presence: PresenceService,
    pub typing: TypingService,
    pub calls: CallService,
    pub quality: QualityService,
}

impl AppState {
    /// Wire every engine around the given collaborators
    pub async fn with_collaborators(
        config: Config,
        store: Arc<dyn ChatStore>,
        provider: Arc<dyn ConferencingProvider>,
    ) -> Self {
        let registry = ConnectionRegistry::new(config.session_policy);
        let messages = MessageService::new(registry.clone(), store.clone(), config.external_timeout);
        let presence = PresenceService::new(registry.clone(), store.clone(), config.external_timeout);
        let typing = TypingService::new(
            registry.clone(),
            store.clone(),
            config.external_timeout,
            config.typing_window,
        );
        let quality = QualityService::new(config.quality_window, QualityThresholds::default());
        let calls = CallService::new(
            registry.clone(),
            provider,
            store.clone(),
            quality.clone(),
            CallSettings::from_config(&config),
        );

        registry
            .add_listener(Arc::new(Lifecycle::new(
                registry.clone(),
                messages.clone(),
                presence.clone(),
                calls.clone(),
            )))
            .await;

        Self {
            jwt: JwtVerifier::new(config.jwt_secret.clone()),
            config: Arc::new(config),
            registry,
            store,
            messages,
            presence,
            typing,
            calls,
            quality,
        }
    }

    /// Production wiring: in-process store (optionally seeded) and token provider
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let store = match &config.store_seed_path {
            Some(path) => {
                tracing::info!(path = %path, "seeding chat store");
                InMemoryChatStore::from_seed_file(path)?
            }
            None => InMemoryChatStore::new(),
        };
        let provider = TokenRoomProvider::new(config.provider.clone());
        Ok(Self::with_collaborators(config, Arc::new(store), Arc::new(provider)).await)
    }

    /// Fresh in-memory wiring; the store handle is returned for seeding
    pub async fn in_memory(config: Config) -> (Self, Arc<InMemoryChatStore>) {
        let store = Arc::new(InMemoryChatStore::new());
        let provider = Arc::new(TokenRoomProvider::new(config.provider.clone()));
        let state = Self::with_collaborators(config, store.clone(), provider).await;
        (state, store)
    }

    /// Spawn the periodic sweeps
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            tasks::spawn_heartbeat_sweep(self.registry.clone(), self.config.heartbeat_interval),
            tasks::spawn_typing_sweep(self.typing.clone(), self.typing.window()),
            tasks::spawn_stale_queue_sweep(
                self.messages.clone(),
                self.config.queue_retention,
                self.config.message_dedupe_ttl,
            ),
        ]
    }
}
