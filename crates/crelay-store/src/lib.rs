pub mod cache;
pub mod crypto;
pub mod kv;

pub use cache::TtlCache;
pub use crypto::{Cipher, Envelope};
pub use kv::{KvStore, MemoryStore, RedisStore, SharedStore};
