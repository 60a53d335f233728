use std::sync::Arc;

use crelay_accounts::{
    Account, AccountRegistry, BindingMode, OAuthTokens, SESSION_KEY_PREFIX,
};
use crelay_common::now_ms;
use crelay_store::{Cipher, KvStore, MemoryStore};

fn cipher() -> Arc<Cipher> {
    Arc::new(Cipher::new(&[5u8; 32]).unwrap())
}

fn account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        name: id.to_string(),
        active: true,
        binding: BindingMode::Shared,
        proxy: None,
        oauth: Some(OAuthTokens {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at_ms: now_ms() + 3_600_000,
            scopes: vec![],
        }),
        last_used_at: 0,
        last_refresh_at: 0,
        rate_limited_at: None,
        rate_limit_status: None,
        error_status: None,
    }
}

async fn seed(store: &Arc<MemoryStore>, cipher: &Cipher, account: &Account) {
    let fields = account.to_fields(cipher).unwrap();
    store
        .hset_all(&Account::kv_key(&account.id), &fields)
        .await
        .unwrap();
}

#[tokio::test]
async fn mark_then_clear_round_trips() {
    let store = Arc::new(MemoryStore::new());
    let cipher = cipher();
    seed(&store, &cipher, &account("a")).await;
    let registry = AccountRegistry::new(store, cipher);

    assert!(!registry.is_rate_limited("a").await.unwrap());
    registry.mark_rate_limited("a", None).await.unwrap();
    assert!(registry.is_rate_limited("a").await.unwrap());

    registry.clear_rate_limit("a").await.unwrap();
    assert!(!registry.is_rate_limited("a").await.unwrap());
    // Clearing twice is fine.
    registry.clear_rate_limit("a").await.unwrap();
}

#[tokio::test]
async fn stale_rate_limit_auto_clears_after_window() {
    let store = Arc::new(MemoryStore::new());
    let cipher = cipher();
    seed(&store, &cipher, &account("a")).await;

    let two_hours_ago = now_ms() - 2 * 3_600_000;
    store
        .hset_all(
            &Account::kv_key("a"),
            &[
                ("rate_limited_at".to_string(), two_hours_ago.to_string()),
                ("rate_limit_status".to_string(), "limited".to_string()),
            ],
        )
        .await
        .unwrap();

    let registry = AccountRegistry::new(store, cipher);
    assert!(!registry.is_rate_limited("a").await.unwrap());
    // The flag was persisted away, not just hidden.
    let reloaded = registry.get("a").await.unwrap().unwrap();
    assert!(reloaded.rate_limit_status.is_none());
}

#[tokio::test]
async fn marking_evicts_the_sticky_mapping() {
    let store = Arc::new(MemoryStore::new());
    let cipher = cipher();
    seed(&store, &cipher, &account("a")).await;
    let registry = AccountRegistry::new(store.clone(), cipher);

    registry.sticky_put("conv-1", "a").await.unwrap();
    assert_eq!(
        registry.sticky_get("conv-1").await.unwrap().as_deref(),
        Some("a")
    );

    registry.mark_rate_limited("a", Some("conv-1")).await.unwrap();
    assert_eq!(registry.sticky_get("conv-1").await.unwrap(), None);
    assert_eq!(
        store
            .get(&format!("{SESSION_KEY_PREFIX}conv-1"))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn header_snapshots_overwrite() {
    let store = Arc::new(MemoryStore::new());
    let registry = AccountRegistry::new(store, cipher());

    let mut first = std::collections::HashMap::new();
    first.insert("x-app".to_string(), "cli".to_string());
    registry.headers_put("a", &first).await.unwrap();

    let mut second = std::collections::HashMap::new();
    second.insert("x-app".to_string(), "cli-2".to_string());
    registry.headers_put("a", &second).await.unwrap();

    let loaded = registry.headers_get("a").await.unwrap().unwrap();
    assert_eq!(loaded.get("x-app").map(String::as_str), Some("cli-2"));
}

#[tokio::test]
async fn list_all_reads_every_account() {
    let store = Arc::new(MemoryStore::new());
    let cipher = cipher();
    seed(&store, &cipher, &account("b")).await;
    seed(&store, &cipher, &account("a")).await;
    let registry = AccountRegistry::new(store, cipher);

    let accounts = registry.list_all().await.unwrap();
    let ids: Vec<&str> = accounts.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}
