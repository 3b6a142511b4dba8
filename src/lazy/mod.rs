//! Lazy schema loading: registry, cache, and meta-tool glue.

pub mod orchestrator;

pub use orchestrator::{
    select_preload, DownstreamCapabilities, HealthStatus, LazyLoadingOrchestrator, LazyStatistics,
    TokenSavings,
};
