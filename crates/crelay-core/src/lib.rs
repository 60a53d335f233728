pub mod auth;
pub mod count_tokens;
pub mod engine;
pub mod events;
pub mod handler;
pub mod shape;
pub mod upstream;

pub use auth::{ApiKeyRecord, KeyStore, KeyValidator, KvKeyStore, Persona};
pub use engine::{RelayEngine, RelayResponse};
pub use events::{NoopUsageSink, SharedUsageSink, UsageEvent, UsageSink};
pub use handler::{router, AppState};
pub use upstream::{UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse};
