use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Derive a scoped key from `parent_key` that embeds `params` (e.g. `expires_at`, `filter_by`).
///
/// Layout: `base64(base64(hmac_sha256(parent_key, params)) + parent_key[..4] + params)`,
/// which the engine verifies against the parent key without extra round trips.
pub fn generate_scoped_search_key(parent_key: &str, params: &Value) -> Result<String> {
    let params_json = serde_json::to_string(params)?;
    let mut mac = HmacSha256::new_from_slice(parent_key.as_bytes())
        .map_err(|e| ProxyError::Config(format!("unusable search key: {e}")))?;
    mac.update(params_json.as_bytes());
    let digest = general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    let prefix: String = parent_key.chars().take(4).collect();
    Ok(general_purpose::STANDARD.encode(format!("{digest}{prefix}{params_json}")))
}

struct CachedKey {
    key: String,
    created: Instant,
}

/// Credentials used towards the search engine: a short-lived scoped key for searches
/// and the static admin key for everything else.
pub struct ApiKeys {
    admin_key: String,
    parent_key: String,
    ttl: Duration,
    cached: RwLock<Option<CachedKey>>,
}

impl ApiKeys {
    /// Keys from an admin key and the parent key of scoped keys.
    pub fn new(admin_key: &str, parent_key: &str, ttl: Duration) -> Self {
        ApiKeys {
            admin_key: admin_key.to_string(),
            parent_key: parent_key.to_string(),
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Keys as configured.
    pub fn from_config(config: &ProxyConfig) -> Self {
        ApiKeys::new(
            &config.admin_api_key,
            config.search_parent_key(),
            Duration::from_secs(config.scoped_key_ttl_secs),
        )
    }

    /// Static administrative key.
    pub fn admin_key(&self) -> &str {
        &self.admin_key
    }

    /// Scoped search-only key valid for the configured TTL.
    /// A generated key is reused until half of its lifetime has passed.
    pub async fn search_key(&self) -> Result<String> {
        let reuse_for = self.ttl / 2;
        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.created.elapsed() < reuse_for {
                return Ok(cached.key.clone());
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(current) = cached.as_ref() {
            if current.created.elapsed() < reuse_for {
                return Ok(current.key.clone());
            }
        }

        let expires_at = chrono::Utc::now().timestamp() + self.ttl.as_secs() as i64;
        let key = generate_scoped_search_key(&self.parent_key, &json!({ "expires_at": expires_at }))?;
        tracing::debug!("generated scoped search key expiring at {}", expires_at);
        *cached = Some(CachedKey {
            key: key.clone(),
            created: Instant::now(),
        });
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_key_layout() {
        let params = json!({"filter_by": "company_id:124", "expires_at": 1906054106});
        let key = generate_scoped_search_key("RN23GFr1s6jQ9kgSNg2O7fYcAUXU7127", &params).unwrap();
        let decoded = String::from_utf8(general_purpose::STANDARD.decode(&key).unwrap()).unwrap();
        let params_json = serde_json::to_string(&params).unwrap();
        assert!(decoded.ends_with(&format!("RN23{params_json}")));
        let digest = &decoded[..decoded.len() - 4 - params_json.len()];
        assert_eq!(general_purpose::STANDARD.decode(digest).unwrap().len(), 32);
    }

    #[test]
    fn scoped_key_is_deterministic() {
        let params = json!({"expires_at": 1});
        assert_eq!(
            generate_scoped_search_key("abcd1234", &params).unwrap(),
            generate_scoped_search_key("abcd1234", &params).unwrap()
        );
        assert_ne!(
            generate_scoped_search_key("abcd1234", &params).unwrap(),
            generate_scoped_search_key("wxyz1234", &params).unwrap()
        );
    }

    #[tokio::test]
    async fn search_key_is_cached() {
        let keys = ApiKeys::new("admin", "search-parent", Duration::from_secs(3600));
        let first = keys.search_key().await.unwrap();
        let second = keys.search_key().await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first, keys.admin_key());
    }

    #[tokio::test]
    async fn zero_ttl_regenerates() {
        let keys = ApiKeys::new("admin", "search-parent", Duration::ZERO);
        let key = keys.search_key().await.unwrap();
        let decoded = String::from_utf8(general_purpose::STANDARD.decode(&key).unwrap()).unwrap();
        assert!(decoded.contains("sear{\"expires_at\":"));
    }
}
