//! # Authentication Boundary
//!
//! Decides whether a request needs a token, extracts it from the
//! `Authorization: Bearer` header, validates it through the configured
//! [`TokenValidator`] and checks the route's allowed roles.
//!
//! Validated tokens are cached for `cache_ttl` so a busy client does not pay
//! for signature verification on every request.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<dyn TokenValidator>` so tests and embedders can swap the verifier
//! - `DashMap` for the token cache; lookups never block each other

use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, warn};

use crate::auth::providers::{JwtValidator, TokenValidator};
use crate::core::config::{AuthConfig, RouteConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::AuthContext;

const BEARER_PREFIX: &str = "Bearer ";

/// Result of the authentication step for one request
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Auth is disabled, the path is public or the route does not require it
    Skipped,
    Authenticated(AuthContext),
}

impl AuthOutcome {
    pub fn context(&self) -> Option<&AuthContext> {
        match self {
            Self::Skipped => None,
            Self::Authenticated(context) => Some(context),
        }
    }

    pub fn into_context(self) -> Option<AuthContext> {
        match self {
            Self::Skipped => None,
            Self::Authenticated(context) => Some(context),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedAuth {
    context: AuthContext,
    expires_at: Instant,
}

pub struct Authenticator {
    config: AuthConfig,
    validator: Option<Arc<dyn TokenValidator>>,
    cache: DashMap<String, CachedAuth>,
}

impl Authenticator {
    pub fn new(config: AuthConfig, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            config,
            validator: Some(validator),
            cache: DashMap::new(),
        }
    }

    /// Build with the bundled JWT validator when auth is enabled
    pub fn from_config(config: AuthConfig) -> GatewayResult<Self> {
        let validator: Option<Arc<dyn TokenValidator>> = if config.enabled {
            Some(Arc::new(JwtValidator::from_config(&config)?))
        } else {
            None
        };

        Ok(Self {
            config,
            validator,
            cache: DashMap::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Token from `Authorization: Bearer <token>`
    pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Check if path is exempt from authentication
    pub fn is_public_path(&self, path: &str) -> bool {
        self.config.public_paths.iter().any(|public| match public.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == public,
        })
    }

    /// Run the authentication and role checks for a request on `route`
    pub async fn authenticate(
        &self,
        path: &str,
        headers: &HeaderMap,
        route: &RouteConfig,
    ) -> GatewayResult<AuthOutcome> {
        if !self.config.enabled || !route.require_auth || self.is_public_path(path) {
            return Ok(AuthOutcome::Skipped);
        }

        let token = Self::extract_token(headers).ok_or_else(|| {
            counter!("auth_failures_total", "reason" => "missing_token").increment(1);
            warn!(path = %path, "Missing authentication token");
            GatewayError::auth("Missing or invalid authorization header")
        })?;

        let context = self.validate_token(token).await?;
        Self::authorize(&context, &route.allowed_roles)?;

        debug!(user_id = %context.user_id, path = %path, "Request authenticated");
        Ok(AuthOutcome::Authenticated(context))
    }

    /// Validate `token`, serving repeated tokens from the cache
    pub async fn validate_token(&self, token: &str) -> GatewayResult<AuthContext> {
        self.validate_token_at(token, Instant::now()).await
    }

    async fn validate_token_at(&self, token: &str, now: Instant) -> GatewayResult<AuthContext> {
        if let Some(cached) = self.cache.get(token) {
            if cached.expires_at > now {
                return Ok(cached.context.clone());
            }
        }
        self.cache.remove(token);

        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| GatewayError::internal("No token validator configured"))?;

        let context = validator.validate(token).await.map_err(|e| {
            counter!("auth_failures_total", "reason" => "invalid_token").increment(1);
            warn!(error = %e, "Token validation failed");
            e
        })?;

        self.cache.insert(
            token.to_string(),
            CachedAuth {
                context: context.clone(),
                expires_at: now + self.config.cache_ttl,
            },
        );
        Ok(context)
    }

    /// Fail with 403 unless the caller holds one of `allowed_roles`
    pub fn authorize(context: &AuthContext, allowed_roles: &[String]) -> GatewayResult<()> {
        if context.has_any_role(allowed_roles) {
            return Ok(());
        }

        counter!("auth_failures_total", "reason" => "forbidden").increment(1);
        warn!(
            user_id = %context.user_id,
            required = ?allowed_roles,
            "User lacks required role"
        );
        Err(GatewayError::authz("Insufficient permissions"))
    }

    pub fn cached_tokens(&self) -> usize {
        self.cache.len()
    }

    /// Drop cache entries that have outlived `cache_ttl`
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, cached| cached.expires_at > now);
        before - self.cache.len()
    }

    #[cfg(test)]
    pub(crate) async fn validate_token_after(
        &self,
        token: &str,
        elapsed: std::time::Duration,
    ) -> GatewayResult<AuthContext> {
        self.validate_token_at(token, Instant::now() + elapsed).await
    }
}
