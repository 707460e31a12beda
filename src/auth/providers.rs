//! # Token Validators
//!
//! Token verification is an external collaborator: the gateway only needs a
//! [`TokenValidator`] that turns a bearer token into an [`AuthContext`].
//! [`JwtValidator`] is the bundled implementation for HMAC-signed JWTs.

use std::collections::HashMap;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::core::config::AuthConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::AuthContext;

#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Verify `token` and return the caller's identity
    async fn validate(&self, token: &str) -> GatewayResult<AuthContext>;
}

/// Claims read from a gateway JWT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl From<JwtClaims> for AuthContext {
    fn from(claims: JwtClaims) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.username,
            email: claims.email,
            roles: claims.roles,
            claims: claims.extra,
        }
    }
}

/// HS256/HS384/HS512 JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str, algorithm: &str) -> GatewayResult<Self> {
        if secret.is_empty() {
            return Err(GatewayError::config("JWT secret must not be empty"));
        }

        let algorithm = match algorithm {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(GatewayError::config(format!(
                    "Unsupported JWT algorithm: {}",
                    other
                )))
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn from_config(config: &AuthConfig) -> GatewayResult<Self> {
        Self::new(&config.jwt_secret, &config.jwt_algorithm)
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> GatewayResult<AuthContext> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::auth(format!("Invalid token: {}", e)))?;
        Ok(data.claims.into())
    }
}
