pub mod account;
pub mod refresher;
pub mod registry;
pub mod selector;

pub use account::{
    Account, BindingMode, OAuthTokens, OutboundProxy, ProxyScheme, RateLimitStatus,
    ACCOUNT_KEY_PREFIX, HEADERS_KEY_PREFIX, REFRESH_LOCK_PREFIX, SESSION_KEY_PREFIX,
};
pub use refresher::{OAuthRefreshTransport, RefreshTransport, TokenRefresher, TokenResponse};
pub use registry::{AccountRegistry, RATE_LIMIT_WINDOW, STICKY_TTL};
pub use selector::{session_hash, AccountSelector};
