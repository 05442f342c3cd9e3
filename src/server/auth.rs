//! Authentication managers and the name-based registry that selects one

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Prefix of the WebSocket subprotocol carrying a token
pub const TOKEN_SUBPROTOCOL_PREFIX: &str = "flightdeck.token.";

/// Credential checks used by both the HTTP and the WebSocket plane
#[async_trait]
pub trait AuthManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate an HTTP bearer token
    async fn validate_token(&self, token: Option<&str>) -> Result<bool>;

    /// Validate the subprotocol negotiated for a WebSocket connection
    async fn validate_websocket_subprotocol(&self, subprotocol: Option<&str>) -> Result<bool>;
}

/// Accepts everything
#[derive(Debug, Default, Clone)]
pub struct NoopAuthManager;

#[async_trait]
impl AuthManager for NoopAuthManager {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn validate_token(&self, _token: Option<&str>) -> Result<bool> {
        Ok(true)
    }

    async fn validate_websocket_subprotocol(&self, _subprotocol: Option<&str>) -> Result<bool> {
        Ok(true)
    }
}

/// Compares against one shared secret. WebSocket clients present it as the
/// subprotocol `flightdeck.token.<secret>`.
#[derive(Debug, Clone)]
pub struct TokenAuthManager {
    token: String,
}

impl TokenAuthManager {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn subprotocol_for(token: &str) -> String {
        format!("{}{}", TOKEN_SUBPROTOCOL_PREFIX, token)
    }
}

#[async_trait]
impl AuthManager for TokenAuthManager {
    fn name(&self) -> &'static str {
        "token"
    }

    async fn validate_token(&self, token: Option<&str>) -> Result<bool> {
        Ok(token == Some(self.token.as_str()))
    }

    async fn validate_websocket_subprotocol(&self, subprotocol: Option<&str>) -> Result<bool> {
        let token = subprotocol.and_then(|p| p.strip_prefix(TOKEN_SUBPROTOCOL_PREFIX));
        self.validate_token(token).await
    }
}

/// Names accepted by [`auth_manager_from_name`]
pub const AUTH_MANAGERS: [&str; 2] = ["noop", "token"];

/// Construct the auth manager registered under `name`
pub fn auth_manager_from_name(name: &str, token: Option<&str>) -> Result<Arc<dyn AuthManager>> {
    match name {
        "noop" => Ok(Arc::new(NoopAuthManager)),
        "token" => {
            let token = token.filter(|t| !t.is_empty()).ok_or_else(|| {
                Error::Internal("auth manager \"token\" requires a configured token".to_string())
            })?;
            Ok(Arc::new(TokenAuthManager::new(token)))
        }
        other => Err(Error::Internal(format!(
            "Selected auth manager \"{}\" is not available (known: {})",
            other,
            AUTH_MANAGERS.join(", ")
        ))),
    }
}
