//! Configuration: descriptors, options, loading, and file watching.

pub mod loader;
pub mod types;

pub use loader::{load_config, parse_config, ConfigWatcher};
pub use types::{
    AppConfig, CacheConfig, LazyLoadingConfig, PreloadConfig, ServerDescriptor, TransportConfig,
};
