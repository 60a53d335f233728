pub mod sse;
pub mod usage;

pub use sse::{data_payload, LineBuffer};
pub use usage::{is_rate_limit_payload, StreamUsage, UsageWatcher, RATE_LIMIT_NEEDLE};
