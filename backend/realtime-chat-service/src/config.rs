use crate::error::AppError;
use crate::websocket::SessionPolicy;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Call session timing and sizing
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long a call may ring before it ends as missed
    pub ring_timeout: Duration,
    /// How long an accepted call may wait for media before it ends as timed out
    pub connect_timeout: Duration,
    /// How long a dropped participant may take to reconnect before it counts as having left
    pub grace_period: Duration,
    /// Roster cap, initiator included
    pub max_participants: usize,
    /// How long an ended session stays queryable in memory
    pub retention: Duration,
}

/// Conferencing provider settings used when issuing room access tokens
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub url: String,
    pub api_secret: String,
    pub token_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    pub heartbeat_interval: Duration,
    pub session_policy: SessionPolicy,
    pub typing_window: Duration,
    pub external_timeout: Duration,
    pub call: CallConfig,
    pub provider: ProviderConfig,
    pub quality_window: usize,
    pub queue_retention: Duration,
    /// How long a settled message keeps its idempotency key and ledger entry
    pub message_dedupe_ttl: Duration,
    /// Optional JSON seed for the in-process store (conversations and devices)
    pub store_seed_path: Option<String>,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::Config("JWT_SECRET missing".into()))?;
        if jwt_secret.len() < 16 {
            return Err(AppError::Config(
                "JWT_SECRET must be at least 16 bytes".into(),
            ));
        }

        let session_policy = match env::var("SESSION_POLICY") {
            Ok(raw) => raw.parse::<SessionPolicy>()?,
            Err(_) => SessionPolicy::Replace,
        };

        let call = CallConfig {
            ring_timeout: Duration::from_secs(parse_env("CALL_RING_TIMEOUT_SECS", 60)?),
            connect_timeout: Duration::from_secs(parse_env("CALL_CONNECT_TIMEOUT_SECS", 30)?),
            grace_period: Duration::from_secs(parse_env("CALL_GRACE_PERIOD_SECS", 10)?),
            max_participants: parse_env("CALL_MAX_PARTICIPANTS", 8)?,
            retention: Duration::from_secs(parse_env("CALL_RETENTION_SECS", 300)?),
        };
        if call.max_participants < 2 {
            return Err(AppError::Config(
                "CALL_MAX_PARTICIPANTS must be at least 2".into(),
            ));
        }

        let provider = ProviderConfig {
            url: env::var("PROVIDER_URL").unwrap_or_else(|_| "wss://rooms.local".to_string()),
            api_secret: env::var("PROVIDER_API_SECRET").unwrap_or_else(|_| jwt_secret.clone()),
            token_ttl: Duration::from_secs(parse_env("PROVIDER_TOKEN_TTL_SECS", 3600)?),
        };

        let heartbeat_interval = Duration::from_secs(parse_env("HEARTBEAT_INTERVAL_SECS", 30)?);
        if heartbeat_interval.is_zero() {
            return Err(AppError::Config(
                "HEARTBEAT_INTERVAL_SECS must be positive".into(),
            ));
        }

        Ok(Self {
            port: parse_env("PORT", 3000)?,
            jwt_secret,
            heartbeat_interval,
            session_policy,
            typing_window: Duration::from_millis(parse_env("TYPING_WINDOW_MS", 5000)?),
            external_timeout: Duration::from_millis(parse_env("EXTERNAL_TIMEOUT_MS", 5000)?),
            call,
            provider,
            quality_window: parse_env("QUALITY_WINDOW", 10usize)?.max(1),
            queue_retention: Duration::from_secs(parse_env("QUEUE_RETENTION_SECS", 604_800)?),
            message_dedupe_ttl: Duration::from_secs(parse_env("MESSAGE_DEDUPE_TTL_SECS", 86_400)?),
            store_seed_path: env::var("STORE_SEED_PATH").ok(),
        })
    }

    /// Deterministic settings for tests
    pub fn test_defaults() -> Self {
        Self {
            port: 0,
            jwt_secret: "test-secret-with-enough-bytes".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            session_policy: SessionPolicy::Replace,
            typing_window: Duration::from_secs(5),
            external_timeout: Duration::from_secs(2),
            call: CallConfig {
                ring_timeout: Duration::from_secs(60),
                connect_timeout: Duration::from_secs(30),
                grace_period: Duration::from_secs(10),
                max_participants: 8,
                retention: Duration::from_secs(300),
            },
            provider: ProviderConfig {
                url: "wss://rooms.test".to_string(),
                api_secret: "provider-secret-for-tests".to_string(),
                token_ttl: Duration::from_secs(3600),
            },
            quality_window: 5,
            queue_retention: Duration::from_secs(3600),
            message_dedupe_ttl: Duration::from_secs(3600),
            store_seed_path: None,
        }
    }
}
