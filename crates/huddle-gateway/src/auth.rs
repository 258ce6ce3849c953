use huddle_types::Identity;
use huddle_types::api::Claims;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use tracing::debug;

/// Resolves a bearer token to the caller's identity. Token issuance lives
/// outside this service.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Identity>;
}

/// HS256 JWTs carrying [`Claims`]; `exp` is enforced.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Option<Identity> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Some(Identity::new(data.claims.sub, data.claims.username)),
            Err(e) => {
                debug!("Token rejected: {}", e);
                None
            }
        }
    }
}
