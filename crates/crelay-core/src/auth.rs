use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crelay_common::{KeyCacheConfig, RelayError, RelayResult};
use crelay_store::{SharedStore, TtlCache};

pub const API_KEY_PREFIX: &str = "api_key:";
pub const API_KEY_HASH_PREFIX: &str = "api_key_hash:";

/// The key's declared response shape. Assigned at creation, immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    Cc,
    Anthropic,
    Aws,
    Databricks,
}

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Cc => "cc",
            Persona::Anthropic => "anthropic",
            Persona::Aws => "aws",
            Persona::Databricks => "databricks",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cc" => Some(Persona::Cc),
            "anthropic" => Some(Persona::Anthropic),
            "aws" => Some(Persona::Aws),
            "databricks" => Some(Persona::Databricks),
            _ => None,
        }
    }

    /// Personas that must clear the minimum-input-token floor.
    pub fn enforces_token_floor(&self) -> bool {
        matches!(self, Persona::Aws | Persona::Databricks)
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub persona: Persona,
    pub enable_model_restriction: bool,
    pub restricted_models: HashSet<String>,
    pub bound_account_id: Option<String>,
    /// Regex over the downstream user-agent; no match means rejection.
    pub client_restriction: Option<String>,
}

impl ApiKeyRecord {
    pub fn check_model(&self, model: &str) -> RelayResult<()> {
        if self.enable_model_restriction && !self.restricted_models.contains(model) {
            return Err(RelayError::KeyForbiddenModel(model.to_string()));
        }
        Ok(())
    }

    pub fn check_client(&self, user_agent: Option<&str>) -> RelayResult<()> {
        let Some(pattern) = self.client_restriction.as_deref() else {
            return Ok(());
        };
        let regex =
            Regex::new(pattern).map_err(|err| RelayError::Config(err.to_string()))?;
        match user_agent {
            Some(agent) if regex.is_match(agent) => Ok(()),
            _ => Err(RelayError::KeyForbiddenClient),
        }
    }
}

/// Contract with the key-store collaborator: resolve a presented secret to a
/// validated record, or nothing.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn lookup(&self, secret: &str) -> RelayResult<Option<ApiKeyRecord>>;
}

/// KV-backed key store: `api_key_hash:<sha256(secret)>` indexes into the
/// `api_key:<id>` hash. Admin CRUD writes both out-of-band.
pub struct KvKeyStore {
    store: SharedStore,
}

impl KvKeyStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn digest(secret: &str) -> String {
        let digest = Sha256::digest(secret.as_bytes());
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

#[async_trait]
impl KeyStore for KvKeyStore {
    async fn lookup(&self, secret: &str) -> RelayResult<Option<ApiKeyRecord>> {
        let digest = Self::digest(secret);
        let Some(id) = self
            .store
            .get(&format!("{API_KEY_HASH_PREFIX}{digest}"))
            .await?
        else {
            return Ok(None);
        };
        let fields = self.store.hget_all(&format!("{API_KEY_PREFIX}{id}")).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let Some(persona) = fields
            .get("persona")
            .and_then(|raw| Persona::parse(raw))
        else {
            return Ok(None);
        };
        let restricted_models: HashSet<String> = fields
            .get("restricted_models")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(ApiKeyRecord {
            id,
            name: fields.get("name").cloned().unwrap_or_default(),
            persona,
            enable_model_restriction: fields.get("enable_model_restriction").map(String::as_str)
                == Some("true"),
            restricted_models,
            bound_account_id: fields
                .get("bound_account_id")
                .filter(|v| !v.is_empty())
                .cloned(),
            client_restriction: fields
                .get("client_restriction")
                .filter(|v| !v.is_empty())
                .cloned(),
        }))
    }
}

/// Bearer extraction plus a short-TTL validation cache in front of the key
/// store, so the hot path usually skips the KV round-trip.
pub struct KeyValidator {
    store: Arc<dyn KeyStore>,
    cache: Option<TtlCache<String, ApiKeyRecord>>,
}

impl KeyValidator {
    pub fn new(store: Arc<dyn KeyStore>, cache_config: &KeyCacheConfig) -> Self {
        let cache = cache_config.enabled.then(|| {
            TtlCache::new(
                Duration::from_millis(cache_config.ttl_ms),
                cache_config.max,
            )
        });
        Self { store, cache }
    }

    pub async fn validate(&self, headers: &HeaderMap) -> RelayResult<ApiKeyRecord> {
        let secret = extract_api_key(headers).ok_or(RelayError::KeyNotFound)?;
        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get(&secret) {
                return Ok(record);
            }
        }
        let record = self
            .store
            .lookup(&secret)
            .await?
            .ok_or(RelayError::KeyNotFound)?;
        if let Some(cache) = &self.cache {
            cache.insert(secret, record.clone());
        }
        Ok(record)
    }

    pub fn invalidate(&self, secret: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&secret.to_string());
        }
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    if let Some(token) = auth.strip_prefix("Bearer ") {
        return Some(token.trim().to_string());
    }
    if let Some(token) = auth.strip_prefix("bearer ") {
        return Some(token.trim().to_string());
    }
    None
}

pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
