//! Discovery meta-tools exposed to downstream clients in lazy mode.

pub mod provider;

pub use provider::{
    is_meta_tool, MetaToolError, MetaToolProvider, MetaToolResponse, ToolInvokeResult,
    ToolListResult, ToolSchemaResult, TOOL_INVOKE, TOOL_LIST, TOOL_SCHEMA,
};
