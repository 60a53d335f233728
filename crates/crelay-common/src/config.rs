use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > config file > defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy: ProxyDefaults,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub personas: PersonaConfig,
    #[serde(default)]
    pub system: SystemConfig,
    /// Static max_tokens ceilings; the live price table is maintained
    /// out-of-process.
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub jwt_secret: String,
    /// 32-byte key, hex encoded. OAuth blobs at rest are sealed with it.
    #[serde(default)]
    pub encryption_key: String,
    #[serde(default = "default_key_prefix")]
    pub api_key_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvConfig {
    #[serde(default = "default_kv_host")]
    pub host: String,
    #[serde(default = "default_kv_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: u8,
    #[serde(default = "default_kv_pool")]
    pub pool: u32,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: default_kv_host(),
            port: default_kv_port(),
            password: None,
            db: 0,
            pool: default_kv_pool(),
        }
    }
}

impl KvConfig {
    pub fn url(&self) -> String {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_beta_header")]
    pub beta_header: String,
    /// Operator-supplied extra system prompt appended after normalization.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,
    /// The observed upstream subtracts a fixed 14 from reported
    /// input_tokens; disputed whether that is semantic, so it is a flag.
    #[serde(default = "default_true")]
    pub apply_input_offset: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            api_version: default_api_version(),
            beta_header: default_beta_header(),
            system_prompt: None,
            oauth_token_url: default_oauth_token_url(),
            apply_input_offset: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDefaults {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ProxyDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_key_cache_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_cache_max")]
    pub max: usize,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: default_key_cache_ttl_ms(),
            max: default_cache_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dedup_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_cache_max")]
    pub max: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: default_dedup_window_ms(),
            max: default_cache_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_compression_level")]
    pub level: u8,
    #[serde(default = "default_compression_threshold")]
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: default_compression_level(),
            threshold: default_compression_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub size: usize,
    #[serde(default = "default_batch_flush_ms")]
    pub flush_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: default_batch_size(),
            flush_ms: default_batch_flush_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default)]
    pub key_cache: KeyCacheConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Persona configuration, not a core constant.
    #[serde(default = "default_databricks_org_id")]
    pub databricks_org_id: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            databricks_org_id: default_databricks_org_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_usage_retention_ms")]
    pub token_usage_retention_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval_ms(),
            token_usage_retention_ms: default_usage_retention_ms(),
            health_check_interval_ms: default_health_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

/// Optional layer used when merging CLI/ENV over the file config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub encryption_key: Option<String>,
    pub kv_host: Option<String>,
    pub kv_port: Option<u16>,
    pub kv_password: Option<String>,
    pub upstream_url: Option<String>,
}

impl ConfigPatch {
    pub fn overlay(&mut self, other: ConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.encryption_key.is_some() {
            self.encryption_key = other.encryption_key;
        }
        if other.kv_host.is_some() {
            self.kv_host = other.kv_host;
        }
        if other.kv_port.is_some() {
            self.kv_port = other.kv_port;
        }
        if other.kv_password.is_some() {
            self.kv_password = other.kv_password;
        }
        if other.upstream_url.is_some() {
            self.upstream_url = other.upstream_url;
        }
    }

    pub fn from_env() -> Self {
        Self {
            host: env_var("CRELAY_HOST"),
            port: env_var("CRELAY_PORT").and_then(|v| v.parse().ok()),
            encryption_key: env_var("CRELAY_ENCRYPTION_KEY"),
            kv_host: env_var("CRELAY_KV_HOST"),
            kv_port: env_var("CRELAY_KV_PORT").and_then(|v| v.parse().ok()),
            kv_password: env_var("CRELAY_KV_PASSWORD"),
            upstream_url: env_var("CRELAY_UPSTREAM_URL"),
        }
    }

    pub fn apply_to(self, config: &mut RelayConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(key) = self.encryption_key {
            config.security.encryption_key = key;
        }
        if let Some(host) = self.kv_host {
            config.kv.host = host;
        }
        if let Some(port) = self.kv_port {
            config.kv.port = port;
        }
        if let Some(password) = self.kv_password {
            config.kv.password = Some(password);
        }
        if let Some(url) = self.upstream_url {
            config.upstream.url = url;
        }
    }
}

impl RelayConfig {
    pub fn from_json(raw: &str) -> Result<Self, RelayError> {
        serde_json::from_str(raw).map_err(|err| RelayError::Config(err.to_string()))
    }

    /// Decoded 32-byte encryption key.
    pub fn encryption_key_bytes(&self) -> Result<[u8; 32], RelayError> {
        let raw = self.security.encryption_key.trim();
        if raw.is_empty() {
            return Err(RelayError::Config("security.encryption_key is required".into()));
        }
        let decoded = decode_hex(raw)
            .ok_or_else(|| RelayError::Config("security.encryption_key is not hex".into()))?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| {
            RelayError::Config("security.encryption_key must be 32 bytes".into())
        })?;
        Ok(bytes)
    }

    pub fn max_output_tokens(&self, model: &str) -> Option<u64> {
        self.models
            .iter()
            .find(|entry| entry.id == model)
            .and_then(|entry| entry.max_output_tokens)
    }
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3100
}

fn default_key_prefix() -> String {
    "cr_".to_string()
}

fn default_kv_host() -> String {
    "127.0.0.1".to_string()
}

fn default_kv_port() -> u16 {
    6379
}

fn default_kv_pool() -> u32 {
    8
}

fn default_upstream_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_api_version() -> String {
    "2023-06-01".to_string()
}

fn default_beta_header() -> String {
    "claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14"
        .to_string()
}

fn default_oauth_token_url() -> String {
    "https://api.anthropic.com/v1/oauth/token".to_string()
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_key_cache_ttl_ms() -> u64 {
    60_000
}

fn default_cache_max() -> usize {
    1024
}

fn default_dedup_window_ms() -> u64 {
    10_000
}

fn default_compression_level() -> u8 {
    6
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_flush_ms() -> u64 {
    5_000
}

fn default_databricks_org_id() -> String {
    "94787086326342".to_string()
}

fn default_cleanup_interval_ms() -> u64 {
    300_000
}

fn default_usage_retention_ms() -> u64 {
    86_400_000 * 30
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = RelayConfig::from_json("{}").unwrap();
        assert_eq!(config.server.port, 3100);
        assert_eq!(config.upstream.api_version, "2023-06-01");
        assert!(config.upstream.apply_input_offset);
        assert_eq!(config.personas.databricks_org_id, "94787086326342");
    }

    #[test]
    fn patch_overlay_prefers_later_layers() {
        let mut base = ConfigPatch {
            host: Some("127.0.0.1".into()),
            port: Some(4000),
            ..Default::default()
        };
        base.overlay(ConfigPatch {
            port: Some(5000),
            ..Default::default()
        });
        assert_eq!(base.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(base.port, Some(5000));
    }

    #[test]
    fn encryption_key_must_be_32_hex_bytes() {
        let mut config = RelayConfig::default();
        config.security.encryption_key = "ab".repeat(32);
        assert!(config.encryption_key_bytes().is_ok());

        config.security.encryption_key = "abcd".into();
        assert!(matches!(
            config.encryption_key_bytes(),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn kv_url_includes_password_when_set() {
        let mut kv = KvConfig::default();
        assert_eq!(kv.url(), "redis://127.0.0.1:6379/0");
        kv.password = Some("hunter2".into());
        kv.db = 2;
        assert_eq!(kv.url(), "redis://:hunter2@127.0.0.1:6379/2");
    }
}
