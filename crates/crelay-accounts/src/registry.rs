use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crelay_common::{now_ms, RelayResult};
use crelay_store::{Cipher, SharedStore, TtlCache};

use crate::account::{
    Account, OAuthTokens, ACCOUNT_KEY_PREFIX, HEADERS_KEY_PREFIX, SESSION_KEY_PREFIX,
};

/// Rate-limit flags auto-clear after this window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3600);
/// Sticky conversation -> account mappings live this long past last write.
pub const STICKY_TTL: Duration = Duration::from_secs(3600);

const LIST_CACHE_TTL: Duration = Duration::from_secs(60);

/// Read-through view of the upstream account pool plus the relay-owned
/// mutable state: rate-limit flags, sticky sessions, header snapshots,
/// last-used stamps, OAuth blobs.
pub struct AccountRegistry {
    store: SharedStore,
    cipher: Arc<Cipher>,
    list_cache: TtlCache<&'static str, Vec<Account>>,
}

impl AccountRegistry {
    pub fn new(store: SharedStore, cipher: Arc<Cipher>) -> Self {
        Self {
            store,
            cipher,
            list_cache: TtlCache::new(LIST_CACHE_TTL, 4),
        }
    }

    pub async fn get(&self, id: &str) -> RelayResult<Option<Account>> {
        let fields = self.store.hget_all(&Account::kv_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Account::from_fields(id, &fields, &self.cipher).map(Some)
    }

    pub async fn list_all(&self) -> RelayResult<Vec<Account>> {
        if let Some(cached) = self.list_cache.get(&"all") {
            return Ok(cached);
        }
        let keys = self.store.keys(&format!("{ACCOUNT_KEY_PREFIX}*")).await?;
        let mut accounts = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.trim_start_matches(ACCOUNT_KEY_PREFIX).to_string();
            let fields = self.store.hget_all(&key).await?;
            if fields.is_empty() {
                continue;
            }
            accounts.push(Account::from_fields(&id, &fields, &self.cipher)?);
        }
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        self.list_cache.insert("all", accounts.clone());
        Ok(accounts)
    }

    pub fn invalidate_list(&self) {
        self.list_cache.invalidate(&"all");
    }

    /// Flags the account limited and evicts the sticky mapping that routed
    /// here, so the conversation's next turn re-selects.
    pub async fn mark_rate_limited(
        &self,
        id: &str,
        session_hash: Option<&str>,
    ) -> RelayResult<()> {
        let now = now_ms();
        self.store
            .hset_all(
                &Account::kv_key(id),
                &[
                    ("rate_limited_at".to_string(), now.to_string()),
                    ("rate_limit_status".to_string(), "limited".to_string()),
                ],
            )
            .await?;
        self.invalidate_list();
        warn!(event = "account_rate_limited", account_id = %id);
        if let Some(hash) = session_hash {
            self.sticky_del(hash).await?;
        }
        Ok(())
    }

    /// Idempotent; also called opportunistically on any 2xx.
    pub async fn clear_rate_limit(&self, id: &str) -> RelayResult<()> {
        self.store
            .hdel(
                &Account::kv_key(id),
                &["rate_limited_at".to_string(), "rate_limit_status".to_string()],
            )
            .await?;
        self.invalidate_list();
        Ok(())
    }

    /// True while the limited window is open; auto-clears once the window
    /// has elapsed.
    pub async fn is_rate_limited(&self, id: &str) -> RelayResult<bool> {
        let Some(account) = self.get(id).await? else {
            return Ok(false);
        };
        Ok(self.check_rate_limited(&account).await?)
    }

    pub(crate) async fn check_rate_limited(&self, account: &Account) -> RelayResult<bool> {
        if account.rate_limit_status.is_none() {
            return Ok(false);
        }
        let limited_at = account.rate_limited_at.unwrap_or(0);
        if now_ms() - limited_at >= RATE_LIMIT_WINDOW.as_millis() as i64 {
            info!(event = "rate_limit_expired", account_id = %account.id);
            self.clear_rate_limit(&account.id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn touch_last_used(&self, id: &str) -> RelayResult<()> {
        self.store
            .hset_all(
                &Account::kv_key(id),
                &[("last_used_at".to_string(), now_ms().to_string())],
            )
            .await?;
        self.invalidate_list();
        Ok(())
    }

    pub async fn persist_tokens(&self, id: &str, tokens: &OAuthTokens) -> RelayResult<()> {
        let sealed = crate::account::seal_tokens(tokens, &self.cipher)?;
        self.store
            .hset_all(
                &Account::kv_key(id),
                &[
                    ("oauth".to_string(), sealed),
                    ("last_refresh_at".to_string(), now_ms().to_string()),
                ],
            )
            .await?;
        self.invalidate_list();
        Ok(())
    }

    pub async fn set_error_status(&self, id: &str, status: &str) -> RelayResult<()> {
        self.store
            .hset_all(
                &Account::kv_key(id),
                &[("error_status".to_string(), status.to_string())],
            )
            .await?;
        self.invalidate_list();
        Ok(())
    }

    pub async fn sticky_get(&self, hash: &str) -> RelayResult<Option<String>> {
        self.store.get(&format!("{SESSION_KEY_PREFIX}{hash}")).await
    }

    /// Last write wins under concurrency; acceptable for a best-effort map.
    pub async fn sticky_put(&self, hash: &str, account_id: &str) -> RelayResult<()> {
        self.store
            .set_ex(&format!("{SESSION_KEY_PREFIX}{hash}"), account_id, STICKY_TTL)
            .await
    }

    pub async fn sticky_touch(&self, hash: &str) -> RelayResult<()> {
        self.store
            .expire(&format!("{SESSION_KEY_PREFIX}{hash}"), STICKY_TTL)
            .await
    }

    pub async fn sticky_del(&self, hash: &str) -> RelayResult<()> {
        self.store.del(&format!("{SESSION_KEY_PREFIX}{hash}")).await
    }

    /// Last genuine Claude-Code header set observed for the account,
    /// replayed on later non-genuine calls.
    pub async fn headers_get(&self, id: &str) -> RelayResult<Option<HashMap<String, String>>> {
        let raw = self.store.get(&format!("{HEADERS_KEY_PREFIX}{id}")).await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub async fn headers_put(
        &self,
        id: &str,
        headers: &HashMap<String, String>,
    ) -> RelayResult<()> {
        let raw = serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_string());
        self.store
            .set(&format!("{HEADERS_KEY_PREFIX}{id}"), &raw)
            .await
    }
}
