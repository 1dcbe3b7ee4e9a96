//! Bearer token verification
//!
//! Tokens are issued elsewhere; this service only validates them.

use crate::error::AppError;
use crate::models::{DeviceId, DeviceIdentity};
use actix_web::{http::header, HttpRequest};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device used when neither the token nor the request names one
pub const DEFAULT_DEVICE: &str = "default";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user id
    pub exp: usize,
    #[serde(default)]
    pub iat: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::Unauthorized)
    }
}

#[derive(Clone)]
pub struct JwtVerifier {
    secret: String,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        decode::<Claims>(token, &key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "bearer token rejected");
                AppError::Unauthorized
            })
    }

    /// Sign claims with the same secret; used by local tooling and tests
    pub fn sign(&self, claims: &Claims) -> Result<String, AppError> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AppError::Internal(format!("token signing failed: {e}")))
    }

    /// Verify `token` and resolve the device it speaks for
    ///
    /// The device comes from the token claim first, then `fallback_device`.
    pub fn identity(
        &self,
        token: &str,
        fallback_device: Option<&str>,
    ) -> Result<DeviceIdentity, AppError> {
        let claims = self.verify(token)?;
        let user_id = claims.user_id()?;
        let device = claims
            .device_id
            .as_deref()
            .or(fallback_device)
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(DEFAULT_DEVICE);
        Ok(DeviceIdentity::new(user_id, DeviceId::new(device)))
    }
}

/// `Authorization: Bearer <token>`, if present
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn claims(sub: &str, expires_in: i64, device_id: Option<&str>) -> Claims {
        let now = chrono::Utc::now().timestamp();
        Claims {
            sub: sub.to_string(),
            exp: (now + expires_in) as usize,
            iat: Some(now as usize),
            device_id: device_id.map(str::to_string),
        }
    }

    #[test]
    fn test_valid_token_resolves_identity() {
        let verifier = JwtVerifier::new("test-secret-with-enough-bytes");
        let user = Uuid::new_v4();
        let token = verifier
            .sign(&claims(&user.to_string(), 3600, Some("tablet")))
            .unwrap();

        let identity = verifier.identity(&token, Some("ignored")).unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.device_id.as_str(), "tablet");
    }

    #[test]
    fn test_device_falls_back_to_request_then_default() {
        let verifier = JwtVerifier::new("test-secret-with-enough-bytes");
        let token = verifier
            .sign(&claims(&Uuid::new_v4().to_string(), 3600, None))
            .unwrap();

        let from_request = verifier.identity(&token, Some("laptop")).unwrap();
        assert_eq!(from_request.device_id.as_str(), "laptop");
        let defaulted = verifier.identity(&token, None).unwrap();
        assert_eq!(defaulted.device_id.as_str(), DEFAULT_DEVICE);
    }

    #[test]
    fn test_rejects_expired_foreign_and_malformed_tokens() {
        let verifier = JwtVerifier::new("test-secret-with-enough-bytes");
        let expired = verifier
            .sign(&claims(&Uuid::new_v4().to_string(), -3600, None))
            .unwrap();
        assert!(matches!(verifier.verify(&expired), Err(AppError::Unauthorized)));

        let foreign = JwtVerifier::new("another-secret-entirely")
            .sign(&claims(&Uuid::new_v4().to_string(), 3600, None))
            .unwrap();
        assert!(verifier.verify(&foreign).is_err());

        let not_a_uuid = verifier.sign(&claims("alice", 3600, None)).unwrap();
        assert!(verifier.identity(&not_a_uuid, None).is_err());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer abc.def"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc.def"));

        let req = TestRequest::default()
            .insert_header(("Authorization", "Basic xyz"))
            .to_http_request();
        assert!(bearer_token(&req).is_none());
    }
}
