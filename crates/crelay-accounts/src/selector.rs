use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crelay_common::{RelayError, RelayResult};

use crate::account::{Account, BindingMode};
use crate::registry::AccountRegistry;

/// Stable fingerprint for a conversation: successive turns of the same
/// conversation hash identically. Hashes the key id, never the key bytes,
/// so identical first turns from two tenants cannot collide.
pub fn session_hash(api_key_id: &str, body: &Value) -> Option<String> {
    let model = body.get("model").and_then(Value::as_str)?;
    let first_turn = first_user_turn_text(body)?;
    let mut hasher = Sha256::new();
    hasher.update(api_key_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(first_turn.as_bytes());
    let digest = hasher.finalize();
    Some(
        digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>(),
    )
}

fn first_user_turn_text(body: &Value) -> Option<String> {
    let messages = body.get("messages")?.as_array()?;
    let first = messages
        .iter()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;
    match first.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(items)) => {
            let joined: String = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            Some(joined)
        }
        _ => None,
    }
}

/// Per-request account choice: bound, then sticky, then LRU over the shared
/// pool, then the degraded pick closest to rate-limit recovery.
pub struct AccountSelector {
    registry: Arc<AccountRegistry>,
}

impl AccountSelector {
    pub fn new(registry: Arc<AccountRegistry>) -> Self {
        Self { registry }
    }

    pub async fn select(
        &self,
        bound_account_id: Option<&str>,
        session_hash: Option<&str>,
    ) -> RelayResult<Account> {
        if let Some(bound_id) = bound_account_id {
            if let Some(account) = self.registry.get(bound_id).await? {
                if !self.registry.check_rate_limited(&account).await? {
                    self.record(&account, session_hash).await?;
                    return Ok(account);
                }
                warn!(
                    event = "bound_account_limited",
                    account_id = %bound_id,
                    "falling through to shared pool"
                );
            }
        }

        if let Some(hash) = session_hash {
            if let Some(account_id) = self.registry.sticky_get(hash).await? {
                if let Some(account) = self.registry.get(&account_id).await? {
                    if account.active && !self.registry.check_rate_limited(&account).await? {
                        self.registry.sticky_touch(hash).await?;
                        self.registry.touch_last_used(&account.id).await?;
                        return Ok(account);
                    }
                }
            }
        }

        let accounts = self.registry.list_all().await?;
        let mut available = Vec::new();
        let mut limited = Vec::new();
        for account in accounts {
            if !account.active || account.binding != BindingMode::Shared {
                continue;
            }
            if self.registry.check_rate_limited(&account).await? {
                limited.push(account);
            } else {
                available.push(account);
            }
        }

        let chosen = if let Some(account) = available
            .into_iter()
            .min_by(|a, b| (a.last_used_at, &a.id).cmp(&(b.last_used_at, &b.id)))
        {
            account
        } else if let Some(account) = limited
            .into_iter()
            .min_by_key(|a| a.rate_limited_at.unwrap_or(i64::MAX))
        {
            // Degraded: every candidate is limited; pick the one closest to
            // recovery so the caller can surface the upstream's own error.
            warn!(
                event = "degraded_selection",
                account_id = %account.id,
                "all shared accounts rate limited"
            );
            account
        } else {
            return Err(RelayError::Config(
                "no shared accounts configured".to_string(),
            ));
        };

        self.record(&chosen, session_hash).await?;
        Ok(chosen)
    }

    async fn record(&self, account: &Account, session_hash: Option<&str>) -> RelayResult<()> {
        if let Some(hash) = session_hash {
            self.registry.sticky_put(hash, &account.id).await?;
        }
        self.registry.touch_last_used(&account.id).await
    }
}
