use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crelay_accounts::{
    Account, AccountRegistry, BindingMode, OAuthTokens, OutboundProxy, RefreshTransport,
    TokenRefresher, TokenResponse,
};
use crelay_common::{now_ms, RelayError, RelayResult};
use crelay_store::{Cipher, KvStore, MemoryStore};

struct CountingTransport {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl RefreshTransport for CountingTransport {
    async fn refresh(
        &self,
        _refresh_token: &str,
        _proxy: Option<&OutboundProxy>,
    ) -> RelayResult<TokenResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RelayError::UpstreamStatus(400));
        }
        Ok(TokenResponse {
            access_token: "new-token".to_string(),
            refresh_token: Some("new-refresh".to_string()),
            expires_in: Some(3600),
            scope: Some("user:inference".to_string()),
        })
    }
}

fn cipher() -> Arc<Cipher> {
    Arc::new(Cipher::new(&[5u8; 32]).unwrap())
}

async fn seed_account(store: &Arc<MemoryStore>, cipher: &Cipher, expires_at_ms: i64) {
    let account = Account {
        id: "a".to_string(),
        name: "a".to_string(),
        active: true,
        binding: BindingMode::Shared,
        proxy: None,
        oauth: Some(OAuthTokens {
            access_token: "old-token".to_string(),
            refresh_token: "old-refresh".to_string(),
            expires_at_ms,
            scopes: vec![],
        }),
        last_used_at: 0,
        last_refresh_at: 0,
        rate_limited_at: None,
        rate_limit_status: None,
        error_status: None,
    };
    let fields = account.to_fields(cipher).unwrap();
    store
        .hset_all(&Account::kv_key("a"), &fields)
        .await
        .unwrap();
}

fn refresher(
    store: Arc<MemoryStore>,
    transport: Arc<CountingTransport>,
) -> (TokenRefresher, Arc<AccountRegistry>) {
    let registry = Arc::new(AccountRegistry::new(store.clone(), cipher()));
    (
        TokenRefresher::new(store, registry.clone(), transport),
        registry,
    )
}

#[tokio::test]
async fn fresh_token_skips_refresh() {
    let store = Arc::new(MemoryStore::new());
    seed_account(&store, &cipher(), now_ms() + 3_600_000).await;
    let transport = Arc::new(CountingTransport {
        calls: AtomicUsize::new(0),
        fail: false,
    });
    let (refresher, _) = refresher(store, transport.clone());

    let token = refresher.get_valid_access_token("a").await.unwrap();
    assert_eq!(token, "old-token");
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn ten_concurrent_callers_cause_one_refresh() {
    let store = Arc::new(MemoryStore::new());
    seed_account(&store, &cipher(), now_ms() - 1_000).await;
    let transport = Arc::new(CountingTransport {
        calls: AtomicUsize::new(0),
        fail: false,
    });
    let (refresher, _) = refresher(store, transport.clone());
    let refresher = Arc::new(refresher);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let refresher = refresher.clone();
        tasks.push(tokio::spawn(async move {
            refresher.get_valid_access_token("a").await
        }));
    }
    for task in tasks {
        let token = task.await.unwrap().unwrap();
        assert_eq!(token, "new-token");
    }
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refresh_marks_the_account_and_surfaces() {
    let store = Arc::new(MemoryStore::new());
    seed_account(&store, &cipher(), now_ms() - 1_000).await;
    let transport = Arc::new(CountingTransport {
        calls: AtomicUsize::new(0),
        fail: true,
    });
    let (refresher, registry) = refresher(store, transport);

    let err = refresher.get_valid_access_token("a").await.unwrap_err();
    assert!(matches!(err, RelayError::TokenRefreshFailed { .. }));

    let account = registry.get("a").await.unwrap().unwrap();
    assert_eq!(account.error_status.as_deref(), Some("refresh_failed"));
}

#[tokio::test]
async fn refresh_rotates_the_stored_blob() {
    let store = Arc::new(MemoryStore::new());
    seed_account(&store, &cipher(), now_ms() - 1_000).await;
    let transport = Arc::new(CountingTransport {
        calls: AtomicUsize::new(0),
        fail: false,
    });
    let (refresher, registry) = refresher(store, transport);

    refresher.get_valid_access_token("a").await.unwrap();
    let account = registry.get("a").await.unwrap().unwrap();
    let oauth = account.oauth.unwrap();
    assert_eq!(oauth.access_token, "new-token");
    assert_eq!(oauth.refresh_token, "new-refresh");
    assert!(oauth.expires_at_ms > now_ms());
    assert!(account.last_refresh_at > 0);
}
