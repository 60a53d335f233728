use std::fmt;
use std::time::Duration;

pub type RelayResult<T> = Result<T, RelayError>;

/// Retry schedule for transient failures at the orchestrator boundary.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Reset,
    Dns,
    Refused,
    Timeout,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Reset => "reset",
            TransportKind::Dns => "dns",
            TransportKind::Refused => "refused",
            TransportKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("kv store unavailable: {0}")]
    KvUnavailable(String),
    #[error("api key not found")]
    KeyNotFound,
    #[error("model not allowed for this key: {0}")]
    KeyForbiddenModel(String),
    #[error("client identity not allowed for this key")]
    KeyForbiddenClient,
    #[error("token refresh failed for account {account_id}: {message}")]
    TokenRefreshFailed { account_id: String, message: String },
    #[error("upstream transport error ({kind}): {message}")]
    UpstreamTransport { kind: TransportKind, message: String },
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),
    #[error("upstream rate limited")]
    UpstreamRateLimited,
    #[error("input below token floor: {current} < {minimum}")]
    TokenFloorNotMet { current: u64, minimum: u64 },
    #[error("request body malformed: {0}")]
    BodyShapeInvalid(String),
    #[error("request cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Crypto(_) => "crypto",
            RelayError::KvUnavailable(_) => "kv_unavailable",
            RelayError::KeyNotFound => "key_not_found",
            RelayError::KeyForbiddenModel(_) => "key_forbidden_model",
            RelayError::KeyForbiddenClient => "key_forbidden_client",
            RelayError::TokenRefreshFailed { .. } => "token_refresh_failed",
            RelayError::UpstreamTransport { .. } => "upstream_transport",
            RelayError::UpstreamStatus(_) => "upstream_status",
            RelayError::UpstreamRateLimited => "upstream_rate_limited",
            RelayError::TokenFloorNotMet { .. } => "token_floor_not_met",
            RelayError::BodyShapeInvalid(_) => "body_shape_invalid",
            RelayError::Cancelled => "cancelled",
        }
    }

    /// Transient failures worth another attempt after backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RelayError::KvUnavailable(_) | RelayError::UpstreamTransport { .. }
        )
    }

    /// Delay before the given 1-based attempt, or `None` once attempts are
    /// exhausted. Base 1 s, factor 2, at most `RETRY_MAX_ATTEMPTS` attempts.
    pub fn backoff_delay(attempt: u32) -> Option<Duration> {
        if attempt >= RETRY_MAX_ATTEMPTS {
            return None;
        }
        Some(RETRY_BASE_DELAY * 2u32.pow(attempt.saturating_sub(1)))
    }
}
