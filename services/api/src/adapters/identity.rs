//! services/api/src/adapters/identity.rs
//!
//! Verifies bearer tokens issued by the external identity provider.
//! It implements the `IdentityVerifier` port from the `core` crate.

use crate::config::{IdentityConfig, JwtKey};
use async_trait::async_trait;
use goodnight_core::ports::{IdentityVerifier, PortError, PortResult};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// An adapter that checks signed JWTs against a fixed key, issuer and audience.
#[derive(Clone)]
pub struct JwtIdentityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(config: &IdentityConfig) -> PortResult<Self> {
        let (key, algorithm) = match &config.key {
            JwtKey::RsaPublicKeyPem(pem) => (
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| PortError::Unexpected(format!("Invalid JWT public key: {}", e)))?,
                Algorithm::RS256,
            ),
            JwtKey::Secret(secret) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        Ok(Self { key, validation })
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> PortResult<String> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "Rejected bearer token");
            PortError::Unauthorized
        })?;

        if data.claims.sub.is_empty() {
            return Err(PortError::Unauthorized);
        }
        Ok(data.claims.sub)
    }
}
