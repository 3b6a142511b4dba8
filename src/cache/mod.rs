//! Caches owned by the lazy-loading orchestrator.

pub mod schema_cache;

pub use schema_cache::{CacheStats, SchemaCache};
