//! Model Context Protocol (MCP) primitives used by the stelae gateway.
//!
//! This crate is intentionally scoped to the parts the facade needs:
//! - JSON-RPC 2.0 message types shared by the facade endpoint and the
//!   downstream clients,
//! - the MCP catalog data types (tools, prompts, resources, templates),
//! - a small SSE decoder for streamable-HTTP response bodies,
//! - the `Downstream` client abstraction plus its HTTP implementation.

mod client;
mod jsonrpc;
mod sse;
mod types;

pub use client::{
    Downstream, ForwardedRpc, Handshake, HttpDownstream, HttpDownstreamOptions, TransportKind,
};
pub use jsonrpc::{JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use sse::{decode_sse_events, first_json_message};
pub use types::{
    InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, McpClientInfo, McpServerInfo, Prompt, PromptArgument,
    Resource, ResourceTemplate, Tool, ToolAnnotations,
};

/// Protocol version spoken on the facade endpoint and offered to downstreams.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
