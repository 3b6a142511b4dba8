//! Configuration diffing and graceful reload.

pub mod analyzer;
pub mod controller;

pub use analyzer::{
    analyze, ChangeKind, Recommendation, RecommendationKind, ReloadImpactAnalysis, ReloadSummary,
    ServerChange,
};
pub use controller::{ReloadController, ReloadOutcome};
