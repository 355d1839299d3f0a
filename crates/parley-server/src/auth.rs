// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Authentication of connecting clients

use crate::error::ServerError;
use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, Validation, decode};
use parley_core::{Authenticator, User};
use parley_logging::redact;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Identifier given to clients authenticated with the shared API key.
pub const API_KEY_USER: &str = "api-key";

/// Authentication configuration
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt_secret: Option<String>,
}

impl AuthConfig {
    /// Create auth config from API key
    pub fn with_api_key(api_key: String) -> Self {
        Self {
            api_key: Some(api_key),
            jwt_secret: None,
        }
    }

    /// Create auth config from JWT secret
    pub fn with_jwt_secret(secret: String) -> Self {
        Self {
            api_key: None,
            jwt_secret: Some(secret),
        }
    }

    /// Check if authentication is required
    pub fn requires_auth(&self) -> bool {
        self.api_key.is_some() || self.jwt_secret.is_some()
    }

    /// Validate API key authentication
    pub fn validate_api_key(&self, provided_key: &str) -> Result<(), ServerError> {
        match &self.api_key {
            Some(expected_key) if expected_key == provided_key => Ok(()),
            Some(_) => Err(ServerError::Auth("Invalid API key".to_string())),
            None => Err(ServerError::Auth("API key authentication not configured".to_string())),
        }
    }

    /// Validate JWT token
    pub fn validate_jwt(&self, token: &str) -> Result<Claims, ServerError> {
        let secret = self
            .jwt_secret
            .as_ref()
            .ok_or_else(|| ServerError::Auth("JWT authentication not configured".to_string()))?;
        let decoding_key = DecodingKey::from_secret(secret.as_ref());
        let token_data = decode::<Claims>(token, &decoding_key, &Validation::default())
            .map_err(|_| ServerError::Auth("Invalid JWT token".to_string()))?;
        Ok(token_data.claims)
    }

    /// Resolve the user behind an `Authorization` header value.
    ///
    /// Accepts `ApiKey <key>` and `Bearer <jwt>`.
    pub fn resolve_user(&self, authorization: Option<&str>) -> Result<User, ServerError> {
        match authorization {
            Some(auth) if auth.starts_with("ApiKey ") => {
                self.validate_api_key(auth.trim_start_matches("ApiKey "))?;
                Ok(User::new(API_KEY_USER))
            }
            Some(auth) if auth.starts_with("Bearer ") => {
                let claims = self.validate_jwt(auth.trim_start_matches("Bearer "))?;
                Ok(claims.into_user())
            }
            _ => Err(ServerError::Auth("Missing or invalid authorization header".to_string())),
        }
    }
}

#[async_trait]
impl Authenticator for AuthConfig {
    async fn authenticate(&self, authorization: Option<&str>) -> anyhow::Result<User> {
        match self.resolve_user(authorization) {
            Ok(user) => Ok(user),
            Err(err) => {
                warn!(
                    authorization = authorization.map(redact).unwrap_or("none"),
                    error = %err,
                    "Rejected credentials"
                );
                Err(err.into())
            }
        }
    }
}

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,      // Subject (user ID)
    pub exp: usize,       // Expiration time
    #[serde(default)]
    pub roles: Vec<String>,
    /// Id of the user's record in the persistence backend
    #[serde(default)]
    pub uid: Option<String>,
}

impl Claims {
    fn into_user(self) -> User {
        let mut user = User::new(self.sub);
        if let Some(role) = self.roles.first() {
            user.role = role.to_uppercase();
        }
        user.persisted_id = self.uid;
        user.tags = self.roles;
        user.provider = Some("jwt".to_string());
        user
    }
}
