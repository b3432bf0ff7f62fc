//! Model Context Protocol wire layer
//!
//! - [`types`]: JSON-RPC 2.0 envelopes and MCP payloads
//! - [`codec`]: request builders, response decoding and error mapping
//! - [`sse`]: incremental `text/event-stream` parsing
//! - [`transport`]: the [`Connection`](transport::Connection) trait and the
//!   stdio, HTTP, SSE and WebSocket implementations

pub mod codec;
pub mod sse;
pub mod transport;
pub mod types;

pub use transport::{
    call_tool, discover_tools, ping, Connection, ConnectionFactory, DefaultConnectionFactory, SessionInfo,
    TransportInfo,
};
pub use types::{Content, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolCallResult, ToolDescriptor};
