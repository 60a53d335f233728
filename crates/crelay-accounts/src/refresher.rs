use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crelay_common::{now_ms, RelayError, RelayResult, TransportKind};
use crelay_store::SharedStore;

use crate::account::{Account, OAuthTokens, OutboundProxy, REFRESH_LOCK_PREFIX};
use crate::registry::AccountRegistry;

/// Refresh when the access token has less than this left.
const REFRESH_LOOKAHEAD_MS: i64 = 60_000;
const LOCK_TTL: Duration = Duration::from_secs(60);
const CONTENDED_WAIT: Duration = Duration::from_secs(2);
const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const TOKEN_UA: &str = "claude-cli/1.0.57 (external, cli)";

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// The refresh HTTP round-trip, as a seam so tests can observe exactly how
/// many POSTs happen under contention.
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn refresh(
        &self,
        refresh_token: &str,
        proxy: Option<&OutboundProxy>,
    ) -> RelayResult<TokenResponse>;
}

pub struct OAuthRefreshTransport {
    token_url: String,
    clients: Mutex<HashMap<Option<String>, wreq::Client>>,
}

impl OAuthRefreshTransport {
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&OutboundProxy>) -> RelayResult<wreq::Client> {
        let key = proxy.map(|p| p.to_url());
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| RelayError::Config("refresh client cache lock failed".into()))?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = wreq::Client::builder().timeout(REFRESH_TIMEOUT);
        if let Some(url) = key.as_deref() {
            builder = builder.proxy(
                wreq::Proxy::all(url)
                    .map_err(|err| RelayError::Config(err.to_string()))?,
            );
        }
        let client = builder
            .build()
            .map_err(|err| RelayError::Config(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl RefreshTransport for OAuthRefreshTransport {
    async fn refresh(
        &self,
        refresh_token: &str,
        proxy: Option<&OutboundProxy>,
    ) -> RelayResult<TokenResponse> {
        let client = self.client_for(proxy)?;
        let payload = serde_json::json!({
            "grant_type": "refresh_token",
            "client_id": OAUTH_CLIENT_ID,
            "refresh_token": refresh_token,
        });
        let body = serde_json::to_vec(&payload)
            .map_err(|err| RelayError::BodyShapeInvalid(err.to_string()))?;
        let resp = client
            .post(&self.token_url)
            .header("Content-Type", "application/json")
            .header("User-Agent", TOKEN_UA)
            .header("accept", "application/json, text/plain, */*")
            .body(body)
            .send()
            .await
            .map_err(|err| RelayError::UpstreamTransport {
                kind: if err.is_timeout() {
                    TransportKind::Timeout
                } else {
                    TransportKind::Refused
                },
                message: err.to_string(),
            })?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| RelayError::UpstreamTransport {
                kind: TransportKind::Reset,
                message: err.to_string(),
            })?;
        if !(200..300).contains(&status) {
            return Err(RelayError::UpstreamStatus(status));
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| RelayError::BodyShapeInvalid(err.to_string()))
    }
}

/// Keeps per-account access tokens fresh with a single refresh in flight per
/// account across all replicas, enforced by the KV CAS lock.
pub struct TokenRefresher {
    store: SharedStore,
    registry: Arc<AccountRegistry>,
    transport: Arc<dyn RefreshTransport>,
}

impl TokenRefresher {
    pub fn new(
        store: SharedStore,
        registry: Arc<AccountRegistry>,
        transport: Arc<dyn RefreshTransport>,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
        }
    }

    pub async fn get_valid_access_token(&self, account_id: &str) -> RelayResult<String> {
        let account = self.load(account_id).await?;
        let tokens = oauth_of(&account, account_id)?;
        if is_fresh(&tokens) {
            return Ok(tokens.access_token);
        }

        let lock_key = format!("{REFRESH_LOCK_PREFIX}{account_id}");
        let holder = Uuid::new_v4().to_string();
        if self.store.acquire(&lock_key, &holder, LOCK_TTL).await? {
            let result = self.refresh_holding_lock(&account).await;
            let _ = self.store.release(&lock_key, &holder).await;
            return result;
        }

        // Another worker is refreshing; wait out its round-trip and reload.
        tokio::time::sleep(CONTENDED_WAIT).await;
        let account = self.load(account_id).await?;
        let tokens = oauth_of(&account, account_id)?;
        if is_fresh(&tokens) {
            return Ok(tokens.access_token);
        }
        Err(RelayError::UpstreamTransport {
            kind: TransportKind::Timeout,
            message: format!("token for account {account_id} still stale after contended wait"),
        })
    }

    async fn refresh_holding_lock(&self, account: &Account) -> RelayResult<String> {
        // Re-read under the lock: the previous holder may have just finished.
        let current = self.load(&account.id).await?;
        let tokens = oauth_of(&current, &account.id)?;
        if is_fresh(&tokens) {
            return Ok(tokens.access_token);
        }

        match self
            .transport
            .refresh(&tokens.refresh_token, current.proxy.as_ref())
            .await
        {
            Ok(response) => {
                let updated = OAuthTokens {
                    access_token: response.access_token.clone(),
                    refresh_token: response
                        .refresh_token
                        .unwrap_or_else(|| tokens.refresh_token.clone()),
                    expires_at_ms: now_ms() + response.expires_in.unwrap_or(0) * 1000,
                    scopes: response
                        .scope
                        .map(|s| s.split_whitespace().map(str::to_string).collect())
                        .unwrap_or(tokens.scopes),
                };
                self.registry.persist_tokens(&account.id, &updated).await?;
                info!(event = "token_refreshed", account_id = %account.id);
                Ok(updated.access_token)
            }
            Err(err) => {
                warn!(
                    event = "token_refresh_failed",
                    account_id = %account.id,
                    error = %err
                );
                self.registry
                    .set_error_status(&account.id, "refresh_failed")
                    .await?;
                Err(RelayError::TokenRefreshFailed {
                    account_id: account.id.clone(),
                    message: err.to_string(),
                })
            }
        }
    }

    async fn load(&self, account_id: &str) -> RelayResult<Account> {
        self.registry
            .get(account_id)
            .await?
            .ok_or_else(|| RelayError::TokenRefreshFailed {
                account_id: account_id.to_string(),
                message: "account not found".to_string(),
            })
    }
}

fn oauth_of(account: &Account, account_id: &str) -> RelayResult<OAuthTokens> {
    account
        .oauth
        .clone()
        .ok_or_else(|| RelayError::TokenRefreshFailed {
            account_id: account_id.to_string(),
            message: "account has no oauth blob".to_string(),
        })
}

fn is_fresh(tokens: &OAuthTokens) -> bool {
    now_ms() + REFRESH_LOOKAHEAD_MS < tokens.expires_at_ms
}
