//! `zeno`: a small tool/resource RPC server.
//!
//! JSON request envelopes arrive over HTTP and are routed to registered
//! tools, URI-pattern resources and prompts. Responses are either returned
//! directly or, for a client holding an open Server-Sent-Events stream,
//! pushed onto that client's session.
//!
//! # Quick start
//!
//! ```rust
//! use serde_json::{json, Map, Value};
//! use zeno::{FnTool, Request, Server};
//!
//! # async fn example() -> Result<(), zeno::McpError> {
//! let server = Server::builder()
//!     .server_info("my-server", "0.1.0")
//!     .tool(FnTool::new("echo", "returns its arguments", vec![], |args: Map<String, Value>| async move {
//!         Ok(Value::Object(args))
//!     }))
//!     .build()?;
//!
//! let req = Request::new("tools/call").with_id("1").with_params(json!({
//!     "tool_name": "echo",
//!     "arguments": {"x": 1},
//! }));
//! let resp = server.handle(req).await;
//! assert_eq!(resp.result(), Some(&json!({"x": 1})));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod prompt;
pub mod resource;
pub mod server;
pub mod sse;
pub mod tool;
pub mod transport_http;
pub mod types;
mod validate;

pub use config::{Mode, ServerConfig, Transport, resolve_address};
pub use prompt::{Prompt, PromptArgument, PromptDescriptor, PromptMessage, PromptRegistry};
pub use resource::{
    FnResource, Resource, ResourceContext, ResourceDescriptor, ResourceRegistry, ResourceType,
    RouteMatch, UriPattern,
};
pub use server::{Method, Server, ServerBuilder};
pub use sse::{SessionManager, SessionStream};
pub use tool::{FnTool, ParamSchema, Tool, ToolMetadata, ToolRegistry, ToolSchema};
pub use transport_http::{http_router, serve, serve_listener};
pub use types::{
    ErrorCode, JSONRPC_VERSION, McpError, Outcome, PROTOCOL_VERSION, Request, Response, RpcError,
};
