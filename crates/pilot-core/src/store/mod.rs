//! Persistence seams: a typed key-value interface with an in-memory
//! fallback, and a blob store for checkpoints and milestone assets.

pub mod blob;
pub mod kv;
pub mod memory;

pub use blob::{BlobEntry, BlobStore, MemoryBlobStore};
pub use kv::{agent_key, leaderboard_key, KvError, KvStore, ttl};
pub use memory::MemoryKv;
