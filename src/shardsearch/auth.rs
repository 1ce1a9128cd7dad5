use std::collections::HashMap;

use crate::config::TokenEntry;
use crate::error::{ProxyError, Result};

/// Identity presented by the caller of the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    /// Token presented by the caller, `None` when anonymous.
    pub token: Option<String>,
}

impl Caller {
    /// Caller without a token.
    pub fn anonymous() -> Self {
        Caller { token: None }
    }

    /// Caller presenting `token`.
    pub fn with_token(token: &str) -> Self {
        Caller {
            token: Some(token.to_string()),
        }
    }
}

/// Capability check performed before any request reaches the search engine.
pub trait Authorizer: Send + Sync {
    /// Caller is known.
    fn is_authenticated(&self, caller: &Caller) -> bool;

    /// Fails with `Forbidden` when the caller may not use the proxy.
    fn check_can_use(&self, caller: &Caller) -> Result<()>;

    /// Authenticated and allowed to use the proxy.
    fn authorize(&self, caller: &Caller) -> Result<()> {
        if !self.is_authenticated(caller) {
            return Err(ProxyError::Unauthorized);
        }
        self.check_can_use(caller)
    }
}

/// Authorizer backed by a static token table.
pub struct TokenAuthorizer {
    tokens: HashMap<String, bool>,
}

impl TokenAuthorizer {
    /// Authorizer over the configured token table.
    pub fn new(entries: &[TokenEntry]) -> Self {
        TokenAuthorizer {
            tokens: entries
                .iter()
                .map(|entry| (entry.token.clone(), entry.can_use))
                .collect(),
        }
    }
}

impl Authorizer for TokenAuthorizer {
    fn is_authenticated(&self, caller: &Caller) -> bool {
        caller
            .token
            .as_ref()
            .is_some_and(|token| self.tokens.contains_key(token))
    }

    fn check_can_use(&self, caller: &Caller) -> Result<()> {
        match caller.token.as_ref().and_then(|token| self.tokens.get(token)) {
            Some(true) => Ok(()),
            _ => Err(ProxyError::Forbidden),
        }
    }
}
