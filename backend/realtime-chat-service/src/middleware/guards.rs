//! Request guards that enforce authentication at the type level

use std::future::{ready, Ready};

use crate::error::AppError;
use crate::middleware::auth::bearer_token;
use crate::models::DeviceIdentity;
use crate::state::AppState;
use actix_web::{web, FromRequest, HttpRequest};
use uuid::Uuid;

/// Header a client may use to name its device when the token does not
pub const DEVICE_HEADER: &str = "X-Device-Id";

/// Authenticated (user, device) extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub identity: DeviceIdentity,
}

impl AuthUser {
    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }
}

/// Device named by the request itself: header first, then `?device_id=`
pub fn requested_device(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(DEVICE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            web::Query::<DeviceQuery>::from_query(req.query_string())
                .ok()
                .and_then(|q| q.into_inner().device_id)
        })
}

#[derive(Debug, serde::Deserialize)]
struct DeviceQuery {
    device_id: Option<String>,
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let result = (|| {
            let state = req
                .app_data::<web::Data<AppState>>()
                .ok_or_else(|| AppError::Internal("application state missing".into()))?;
            let token = bearer_token(req).ok_or(AppError::Unauthorized)?;
            let device = requested_device(req);
            let identity = state.jwt.identity(&token, device.as_deref())?;
            Ok(AuthUser { identity })
        })();
        ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_requested_device_prefers_header() {
        let req = TestRequest::default()
            .uri("/api/v1/calls?device_id=from-query")
            .insert_header((DEVICE_HEADER, "from-header"))
            .to_http_request();
        assert_eq!(requested_device(&req).as_deref(), Some("from-header"));

        let req = TestRequest::default()
            .uri("/api/v1/calls?device_id=from-query")
            .to_http_request();
        assert_eq!(requested_device(&req).as_deref(), Some("from-query"));

        let req = TestRequest::default().uri("/api/v1/calls").to_http_request();
        assert!(requested_device(&req).is_none());
    }
}
