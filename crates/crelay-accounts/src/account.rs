use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crelay_common::{RelayError, RelayResult};
use crelay_store::{Cipher, Envelope};

pub const ACCOUNT_KEY_PREFIX: &str = "claude_account:";
pub const SESSION_KEY_PREFIX: &str = "session_mapping:";
pub const REFRESH_LOCK_PREFIX: &str = "token_refresh_lock:claude:";
pub const HEADERS_KEY_PREFIX: &str = "account_headers:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingMode {
    Shared,
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStatus {
    Limited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Socks5,
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundProxy {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl OutboundProxy {
    pub fn to_url(&self) -> String {
        let scheme = match self.scheme {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
        };
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) => {
                format!("{scheme}://{user}:{pass}@{}:{}", self.host, self.port)
            }
            _ => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at_ms: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub binding: BindingMode,
    pub proxy: Option<OutboundProxy>,
    pub oauth: Option<OAuthTokens>,
    pub last_used_at: i64,
    pub last_refresh_at: i64,
    pub rate_limited_at: Option<i64>,
    pub rate_limit_status: Option<RateLimitStatus>,
    pub error_status: Option<String>,
}

impl Account {
    pub fn kv_key(id: &str) -> String {
        format!("{ACCOUNT_KEY_PREFIX}{id}")
    }

    /// Decode from a KV hash, decrypting the OAuth envelope.
    pub fn from_fields(
        id: &str,
        fields: &HashMap<String, String>,
        cipher: &Cipher,
    ) -> RelayResult<Self> {
        let oauth = match fields.get("oauth").filter(|raw| !raw.is_empty()) {
            Some(raw) => {
                let envelope: Envelope = serde_json::from_str(raw)
                    .map_err(|err| RelayError::Crypto(err.to_string()))?;
                let plaintext = cipher.decrypt(&envelope)?;
                let tokens: OAuthTokens = serde_json::from_slice(&plaintext)
                    .map_err(|err| RelayError::Crypto(err.to_string()))?;
                Some(tokens)
            }
            None => None,
        };
        let proxy = match fields.get("proxy").filter(|raw| !raw.is_empty()) {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|err| RelayError::BodyShapeInvalid(err.to_string()))?,
            ),
            None => None,
        };
        let binding = match fields.get("binding").map(String::as_str) {
            Some("dedicated") => BindingMode::Dedicated,
            _ => BindingMode::Shared,
        };
        let rate_limited_at = fields
            .get("rate_limited_at")
            .and_then(|v| v.parse::<i64>().ok());
        let rate_limit_status = match fields.get("rate_limit_status").map(String::as_str) {
            Some("limited") => Some(RateLimitStatus::Limited),
            _ => None,
        };
        Ok(Self {
            id: id.to_string(),
            name: fields.get("name").cloned().unwrap_or_default(),
            active: fields.get("active").map(String::as_str) != Some("false"),
            binding,
            proxy,
            oauth,
            last_used_at: parse_ms(fields.get("last_used_at")),
            last_refresh_at: parse_ms(fields.get("last_refresh_at")),
            rate_limited_at,
            rate_limit_status,
            error_status: fields
                .get("error_status")
                .filter(|v| !v.is_empty())
                .cloned(),
        })
    }

    /// Encode to KV hash fields, sealing the OAuth blob.
    pub fn to_fields(&self, cipher: &Cipher) -> RelayResult<Vec<(String, String)>> {
        let mut fields = vec![
            ("name".to_string(), self.name.clone()),
            ("active".to_string(), self.active.to_string()),
            (
                "binding".to_string(),
                match self.binding {
                    BindingMode::Shared => "shared".to_string(),
                    BindingMode::Dedicated => "dedicated".to_string(),
                },
            ),
            ("last_used_at".to_string(), self.last_used_at.to_string()),
            (
                "last_refresh_at".to_string(),
                self.last_refresh_at.to_string(),
            ),
        ];
        if let Some(proxy) = &self.proxy {
            fields.push((
                "proxy".to_string(),
                serde_json::to_string(proxy)
                    .map_err(|err| RelayError::BodyShapeInvalid(err.to_string()))?,
            ));
        }
        if let Some(tokens) = &self.oauth {
            fields.push(("oauth".to_string(), seal_tokens(tokens, cipher)?));
        }
        if let Some(at) = self.rate_limited_at {
            fields.push(("rate_limited_at".to_string(), at.to_string()));
        }
        if self.rate_limit_status.is_some() {
            fields.push(("rate_limit_status".to_string(), "limited".to_string()));
        }
        if let Some(status) = &self.error_status {
            fields.push(("error_status".to_string(), status.clone()));
        }
        Ok(fields)
    }
}

pub(crate) fn seal_tokens(tokens: &OAuthTokens, cipher: &Cipher) -> RelayResult<String> {
    let plaintext =
        serde_json::to_vec(tokens).map_err(|err| RelayError::Crypto(err.to_string()))?;
    let envelope = cipher.encrypt(&plaintext)?;
    serde_json::to_string(&envelope).map_err(|err| RelayError::Crypto(err.to_string()))
}

fn parse_ms(value: Option<&String>) -> i64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::new(&[3u8; 32]).unwrap()
    }

    fn sample() -> Account {
        Account {
            id: "acct-1".into(),
            name: "pool-a".into(),
            active: true,
            binding: BindingMode::Shared,
            proxy: Some(OutboundProxy {
                scheme: ProxyScheme::Socks5,
                host: "10.0.0.2".into(),
                port: 1080,
                username: Some("u".into()),
                password: Some("p".into()),
            }),
            oauth: Some(OAuthTokens {
                access_token: "at".into(),
                refresh_token: "rt".into(),
                expires_at_ms: 1_700_000_000_000,
                scopes: vec!["user:inference".into()],
            }),
            last_used_at: 123,
            last_refresh_at: 456,
            rate_limited_at: Some(789),
            rate_limit_status: Some(RateLimitStatus::Limited),
            error_status: None,
        }
    }

    #[test]
    fn fields_round_trip_through_encryption() {
        let cipher = cipher();
        let account = sample();
        let fields: HashMap<String, String> =
            account.to_fields(&cipher).unwrap().into_iter().collect();
        // The OAuth blob never appears in the clear at rest.
        assert!(!fields.get("oauth").unwrap().contains("rt"));

        let decoded = Account::from_fields("acct-1", &fields, &cipher).unwrap();
        assert_eq!(decoded.oauth, account.oauth);
        assert_eq!(decoded.proxy, account.proxy);
        assert_eq!(decoded.rate_limited_at, Some(789));
        assert_eq!(decoded.rate_limit_status, Some(RateLimitStatus::Limited));
    }

    #[test]
    fn proxy_url_carries_basic_auth() {
        let proxy = sample().proxy.unwrap();
        assert_eq!(proxy.to_url(), "socks5://u:p@10.0.0.2:1080");
    }

    #[test]
    fn missing_optional_fields_decode_to_defaults() {
        let cipher = cipher();
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), "bare".to_string());
        let account = Account::from_fields("acct-2", &fields, &cipher).unwrap();
        assert!(account.active);
        assert_eq!(account.binding, BindingMode::Shared);
        assert!(account.oauth.is_none());
        assert!(account.rate_limited_at.is_none());
    }
}
