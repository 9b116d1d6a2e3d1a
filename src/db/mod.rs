pub mod key;
pub mod redis;
pub mod store;
pub mod tiered;

mod macros;

pub use self::redis::create_redis_client;
pub use self::redis::RedisStore;
pub use key::{derive_key, Collection, KeyPart};
pub use store::{Document, DocumentStore, MemoryStore};
pub use tiered::{CacheEntry, TieredCache};
