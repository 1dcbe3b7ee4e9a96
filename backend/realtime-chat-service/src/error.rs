use crate::models::ConnectionId;
use crate::services::provider::ProviderError;
use crate::services::store::StoreError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use resilience::TimeoutError;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub type AppResult<T> = Result<T, AppError>;

/// Coarse classification callers use to decide what to do with a failure.
///
/// - `Validation`: bad input, nothing changed, do not retry as-is
/// - `Conflict`: local view is stale, refresh and retry
/// - `Transient`: dependency unavailable, retry with backoff and the same idempotency key
/// - `Fatal`: invariant violated, the connection or call is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Transient,
    Fatal,
    Auth,
    NotFound,
}

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("sender is not a member of the conversation")]
    NotAMember,

    #[error("user is not a participant of the call")]
    NotAParticipant,

    #[error("user was not invited to the call")]
    NotInvited,

    #[error("too many participants: {requested} requested, at most {max} allowed")]
    TooManyParticipants { requested: usize, max: usize },

    #[error("invalid call transition: {0}")]
    InvalidTransition(String),

    #[error("device already has a live session")]
    DuplicateSessionConflict,

    #[error("call {0} already ended")]
    CallAlreadyEnded(Uuid),

    #[error("connection {0} is gone")]
    ConnectionGone(ConnectionId),

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("conferencing provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::BadRequest(_)
            | AppError::NotAMember
            | AppError::NotAParticipant
            | AppError::NotInvited
            | AppError::TooManyParticipants { .. } => ErrorKind::Validation,
            AppError::InvalidTransition(_)
            | AppError::DuplicateSessionConflict
            | AppError::CallAlreadyEnded(_)
            | AppError::ConnectionGone(_) => ErrorKind::Conflict,
            AppError::PersistenceUnavailable(_)
            | AppError::ProviderUnavailable(_)
            | AppError::Timeout { .. } => ErrorKind::Transient,
            AppError::Unauthorized => ErrorKind::Auth,
            AppError::NotFound(_) | AppError::ConversationNotFound(_) => ErrorKind::NotFound,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// Returns whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Stable machine-readable code shared by REST envelopes and socket error events
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::StartServer(_) => "start_failure",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::ConversationNotFound(_) => "conversation_not_found",
            AppError::NotAMember => "not_a_member",
            AppError::NotAParticipant => "not_a_participant",
            AppError::NotInvited => "not_invited",
            AppError::TooManyParticipants { .. } => "too_many_participants",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::DuplicateSessionConflict => "duplicate_session",
            AppError::CallAlreadyEnded(_) => "call_already_ended",
            AppError::ConnectionGone(_) => "connection_gone",
            AppError::PersistenceUnavailable(_) => "persistence_unavailable",
            AppError::ProviderUnavailable(_) => "provider_unavailable",
            AppError::Timeout { .. } => "timeout",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::TooManyParticipants { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotAMember | AppError::NotAParticipant | AppError::NotInvited => {
                StatusCode::FORBIDDEN
            }
            AppError::NotFound(_) | AppError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition(_)
            | AppError::DuplicateSessionConflict
            | AppError::CallAlreadyEnded(_) => StatusCode::CONFLICT,
            AppError::ConnectionGone(_) => StatusCode::GONE,
            AppError::PersistenceUnavailable(_) | AppError::ProviderUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.http_status()
    }

    fn error_response(&self) -> HttpResponse {
        if self.kind() == ErrorKind::Fatal {
            tracing::error!(error = %self, "request failed with internal error");
        }

        HttpResponse::build(self.http_status()).json(json!({
            "success": false,
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        }))
    }
}

impl From<TimeoutError<StoreError>> for AppError {
    fn from(e: TimeoutError<StoreError>) -> Self {
        match e {
            TimeoutError::Elapsed { operation, .. } => AppError::Timeout { operation },
            TimeoutError::Failed {
                operation,
                error: StoreError::NotFound,
            } => AppError::NotFound(operation.to_string()),
            TimeoutError::Failed {
                error: StoreError::Unavailable(msg),
                ..
            } => AppError::PersistenceUnavailable(msg),
        }
    }
}

impl From<TimeoutError<ProviderError>> for AppError {
    fn from(e: TimeoutError<ProviderError>) -> Self {
        match e {
            TimeoutError::Elapsed { operation, .. } => AppError::Timeout { operation },
            TimeoutError::Failed { error, .. } => AppError::ProviderUnavailable(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use std::time::Duration;

    #[test]
    fn test_taxonomy() {
        assert_eq!(AppError::NotAMember.kind(), ErrorKind::Validation);
        assert_eq!(
            AppError::TooManyParticipants {
                requested: 9,
                max: 8
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(AppError::DuplicateSessionConflict.kind(), ErrorKind::Conflict);
        assert_eq!(
            AppError::CallAlreadyEnded(Uuid::new_v4()).kind(),
            ErrorKind::Conflict
        );
        assert!(AppError::PersistenceUnavailable("down".into()).is_retryable());
        assert!(AppError::Timeout { operation: "x" }.is_retryable());
        assert!(!AppError::Internal("boom".into()).is_retryable());
    }

    #[test]
    fn test_store_timeout_maps_to_transient() {
        let err: AppError = TimeoutError::<StoreError>::Elapsed {
            operation: "store.persist_message",
            after: Duration::from_secs(1),
        }
        .into();
        assert!(matches!(
            err,
            AppError::Timeout {
                operation: "store.persist_message"
            }
        ));

        let err: AppError = TimeoutError::Failed {
            operation: "store.persist_message",
            error: StoreError::Unavailable("connection refused".into()),
        }
        .into();
        assert_eq!(err.error_code(), "persistence_unavailable");
    }

    #[actix_web::test]
    async fn test_error_envelope() {
        let resp = AppError::CallAlreadyEnded(Uuid::nil()).error_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "call_already_ended");
        assert_eq!(value["error"]["retryable"], false);
    }
}
