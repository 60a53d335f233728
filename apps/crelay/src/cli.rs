use clap::Parser;

use crelay_common::ConfigPatch;

#[derive(Parser)]
#[command(name = "crelay", about = "Multi-tenant relay for the Anthropic Messages API")]
pub(crate) struct Cli {
    /// Path to the JSON config file; CRELAY_CONFIG is consulted when absent.
    #[arg(long)]
    pub(crate) config: Option<String>,
    #[arg(long)]
    pub(crate) host: Option<String>,
    #[arg(long)]
    pub(crate) port: Option<u16>,
    #[arg(long)]
    pub(crate) kv_host: Option<String>,
    #[arg(long)]
    pub(crate) kv_port: Option<u16>,
    /// Hex-encoded 32-byte key for OAuth blobs at rest.
    #[arg(long)]
    pub(crate) encryption_key: Option<String>,
    /// Run against an in-process KV store instead of Redis (single node,
    /// state lost on restart).
    #[arg(long)]
    pub(crate) memory_kv: bool,
}

impl Cli {
    pub(crate) fn as_patch(&self) -> ConfigPatch {
        ConfigPatch {
            host: self.host.clone(),
            port: self.port,
            encryption_key: self.encryption_key.clone(),
            kv_host: self.kv_host.clone(),
            kv_port: self.kv_port,
            kv_password: None,
            upstream_url: None,
        }
    }
}
