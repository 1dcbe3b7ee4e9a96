pub mod auth;
pub mod guards;

pub use auth::{bearer_token, Claims, JwtVerifier};
pub use guards::AuthUser;
