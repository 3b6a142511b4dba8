//! Tool metadata snapshots for downstream discovery.

pub mod tool_registry;

pub use tool_registry::{
    name_pattern_matches, QualifiedTool, ToolListFilter, ToolListPage, ToolMetadata, ToolRegistry,
};
