use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crelay_common::{RelayError, RelayResult, TransportKind};

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stream: bool,
    /// Per-account outbound proxy URL, when the account carries one.
    pub proxy: Option<String>,
    /// Overrides the configured request timeout (the count endpoint is
    /// tighter than chat).
    pub timeout: Option<Duration>,
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub async fn into_bytes(self) -> Option<Bytes> {
        match self.body {
            UpstreamBody::Bytes(bytes) => Some(bytes),
            UpstreamBody::Stream(mut rx) => {
                let mut out = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk);
                }
                Some(Bytes::from(out))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTPS client for the single upstream. One inner client per outbound
/// proxy, cached; responses are decompressed transparently.
pub struct UpstreamClient {
    config: UpstreamClientConfig,
    clients: Mutex<HashMap<Option<String>, wreq::Client>>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> RelayResult<wreq::Client> {
        let key = proxy.map(str::to_string);
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| RelayError::Config("upstream client cache lock failed".into()))?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = wreq::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .read_timeout(self.config.stream_idle_timeout)
            .gzip(true)
            .deflate(true);
        if let Some(url) = proxy {
            builder = builder.proxy(
                wreq::Proxy::all(url).map_err(|err| RelayError::Config(err.to_string()))?,
            );
        }
        let client = builder
            .build()
            .map_err(|err| RelayError::Config(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    pub async fn send(&self, request: UpstreamRequest) -> RelayResult<UpstreamResponse> {
        let client = self.client_for(request.proxy.as_deref())?;
        let mut builder = client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        // Error heads are buffered even in stream mode so the caller can
        // wrap them in an SSE error envelope.
        let success = (200..300).contains(&status);
        if !request.stream || !success {
            let body = response.bytes().await.map_err(map_wreq_error)?;
            return Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Bytes(body),
            });
        }

        let idle = self.config.stream_idle_timeout;
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let Ok(item) = next else {
                    break;
                };
                let Some(item) = item else {
                    break;
                };
                let Ok(chunk) = item else {
                    break;
                };
                // Receiver dropped = downstream went away; ending this task
                // drops the response and tears down the upstream socket.
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Stream(rx),
        })
    }
}

fn map_wreq_error(err: wreq::Error) -> RelayError {
    RelayError::UpstreamTransport {
        kind: classify_wreq_error(&err),
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> TransportKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        return TransportKind::Timeout;
    }
    if message.contains("dns") || message.contains("resolve") || message.contains("lookup") {
        return TransportKind::Dns;
    }
    if message.contains("refused") {
        return TransportKind::Refused;
    }
    TransportKind::Reset
}
