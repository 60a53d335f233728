use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crelay_accounts::{AccountRegistry, OAuthRefreshTransport, TokenRefresher};
use crelay_common::{ConfigPatch, RelayConfig};
use crelay_core::upstream::{UpstreamClient, UpstreamClientConfig};
use crelay_core::{AppState, KeyValidator, KvKeyStore, RelayEngine};
use crelay_store::{Cipher, KvStore, MemoryStore, RedisStore};

mod cli;
mod usage_sink;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = cli::Cli::parse();
    let config = Arc::new(load_config(&cli)?);

    let cipher = Arc::new(Cipher::new(&config.encryption_key_bytes()?)?);
    let store: Arc<dyn KvStore> = if cli.memory_kv {
        info!(event = "kv_backend", backend = "memory");
        Arc::new(MemoryStore::new())
    } else {
        let url = config.kv.url();
        info!(event = "kv_backend", backend = "redis", url = %url);
        Arc::new(
            RedisStore::connect(&url)
                .await
                .context("connecting to the KV store")?,
        )
    };

    let registry = Arc::new(AccountRegistry::new(store.clone(), cipher));
    let refresher = Arc::new(TokenRefresher::new(
        store.clone(),
        registry.clone(),
        Arc::new(OAuthRefreshTransport::new(
            config.upstream.oauth_token_url.clone(),
        )),
    ));
    let upstream = Arc::new(UpstreamClient::new(UpstreamClientConfig {
        request_timeout: Duration::from_millis(config.proxy.timeout_ms),
        ..UpstreamClientConfig::default()
    }));
    let engine = Arc::new(RelayEngine::new(
        config.clone(),
        registry,
        refresher,
        upstream,
        Arc::new(usage_sink::TracingUsageSink),
    ));
    let validator = Arc::new(KeyValidator::new(
        Arc::new(KvKeyStore::new(store)),
        &config.performance.key_cache,
    ));

    let mut app = crelay_core::router(Arc::new(AppState {
        engine,
        validator,
        started_at: Instant::now(),
    }))
    .layer(TraceLayer::new_for_http());
    if config.performance.compression.enabled {
        app = app.layer(CompressionLayer::new());
    }

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(event = "listening", bind = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_config(cli: &cli::Cli) -> Result<RelayConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CRELAY_CONFIG").ok());
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            RelayConfig::from_json(&raw)?
        }
        None => RelayConfig::default(),
    };

    // Merge order: CLI > ENV > file.
    let mut patch = ConfigPatch::from_env();
    patch.overlay(cli.as_patch());
    patch.apply_to(&mut config);
    Ok(config)
}
