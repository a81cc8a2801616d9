//! Backend connections, talking MCP to the servers being aggregated.
//!
//! Each backend is a local subprocess speaking JSON-RPC over stdio or a
//! remote endpoint speaking streamable HTTP or legacy HTTP+SSE. This module
//! owns transport, handshake, discovery and call forwarding for one backend
//! at a time; aggregation lives in `gateway`.

pub mod connection;
pub mod connector;
pub mod env;
pub mod errors;
pub mod handle;
pub mod http;
pub mod sse;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use connection::{BackendConnection, ConnectionSettings};
pub use connector::{Connector, ProcessConnector};
pub use env::{EnvironmentBuilder, ProcessEnvironment};
pub use errors::BackendError;
pub use handle::{BackendHandle, Lifecycle, PromptCapability, ResourceCapability, ToolCapability};
