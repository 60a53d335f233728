pub mod config;
pub mod error;

pub use config::{
    BatchConfig, CompressionConfig, ConfigPatch, DedupConfig, KeyCacheConfig, KvConfig,
    ModelEntry, PerformanceConfig, PersonaConfig, ProxyDefaults, RelayConfig, SecurityConfig,
    ServerConfig, SystemConfig, UpstreamConfig,
};
pub use error::{RelayError, RelayResult, TransportKind, RETRY_BASE_DELAY, RETRY_MAX_ATTEMPTS};

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
