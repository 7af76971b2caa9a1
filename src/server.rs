use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::config::{Mode, ServerConfig, Transport};
use crate::prompt::{Prompt, PromptRegistry};
use crate::resource::{Resource, ResourceContext, ResourceRegistry};
use crate::sse::SessionManager;
use crate::tool::{Tool, ToolRegistry, ToolSchema};
use crate::transport_http;
use crate::types::*;

/// Every method the dispatcher routes, with legacy aliases folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Initialize,
    Ping,
    ToolsList,
    ToolsCall,
    ResourcesRead,
    ResourcesList,
    PromptsList,
    PromptsGet,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "initialize" => Some(Method::Initialize),
            "ping" => Some(Method::Ping),
            "tools/list" | "listTools" => Some(Method::ToolsList),
            "tools/call" | "invokeTool" => Some(Method::ToolsCall),
            "resources/read" | "getResource" => Some(Method::ResourcesRead),
            "resources/list" | "listResources" => Some(Method::ResourcesList),
            "prompts/list" => Some(Method::PromptsList),
            "prompts/get" => Some(Method::PromptsGet),
            _ => None,
        }
    }

    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Initialize => "initialize",
            Method::Ping => "ping",
            Method::ToolsList => "tools/list",
            Method::ToolsCall => "tools/call",
            Method::ResourcesRead => "resources/read",
            Method::ResourcesList => "resources/list",
            Method::PromptsList => "prompts/list",
            Method::PromptsGet => "prompts/get",
        }
    }

    /// Methods that need no params and may be called with an empty body.
    pub fn is_listing(self) -> bool {
        matches!(
            self,
            Method::ToolsList | Method::ResourcesList | Method::PromptsList | Method::Ping
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The server. Owns its registries and session table.
///
/// Registration takes `&self`, so late registration while serving is safe.
pub struct Server {
    config: ServerConfig,
    tools: ToolRegistry,
    resources: ResourceRegistry,
    prompts: PromptRegistry,
    sessions: SessionManager,
    request_logging: bool,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// A server with empty registries.
    pub fn new(config: ServerConfig) -> Result<Server, McpError> {
        Server::builder().config(config).build()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn prompts(&self) -> &PromptRegistry {
        &self.prompts
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Whether the HTTP router installs the request-logging middleware.
    pub fn request_logging(&self) -> bool {
        self.request_logging
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), McpError> {
        self.tools.register_tool(tool)
    }

    pub fn register_tool_with_schema(&self, tool: Arc<dyn Tool>, schema: ToolSchema) -> Result<(), McpError> {
        self.tools.register(tool, schema)
    }

    pub fn register_resource(&self, pattern: &str, resource: Arc<dyn Resource>) -> Result<(), McpError> {
        self.resources.register(pattern, resource)
    }

    pub fn register_prompt(&self, prompt: Arc<dyn Prompt>) -> Result<(), McpError> {
        self.prompts.register(prompt)
    }

    /// Route a request envelope to its handler.
    ///
    /// Total: every input produces a response, failures included.
    pub async fn handle(&self, req: Request) -> Response {
        if req.jsonrpc != JSONRPC_VERSION {
            return Response::error(
                req.response_id(),
                ErrorCode::InvalidRequest,
                "jsonrpc must be '2.0'",
            );
        }
        if req.method.is_empty() {
            return Response::error(req.response_id(), ErrorCode::InvalidRequest, "method is required");
        }

        match Method::parse(&req.method) {
            Some(method) => self.dispatch(method, req).await,
            None => Response::error(
                req.response_id(),
                ErrorCode::MethodNotFound,
                format!("Method not found: {}", req.method),
            ),
        }
    }

    /// Run `method` against `req`, ignoring the envelope's own method name.
    pub async fn dispatch(&self, method: Method, req: Request) -> Response {
        let outcome = match method {
            Method::Initialize => Ok(self.handle_initialize(&req)),
            Method::Ping => Ok(json!({})),
            Method::ToolsList => Ok(self.handle_tools_list()),
            Method::ToolsCall => self.handle_tools_call(&req).await,
            Method::ResourcesRead => self.handle_resources_read(&req).await,
            Method::ResourcesList => Ok(self.handle_resources_list()),
            Method::PromptsList => Ok(self.handle_prompts_list()),
            Method::PromptsGet => self.handle_prompts_get(&req),
        };

        match outcome {
            Ok(result) => Response::success(req.response_id(), result),
            Err(err) => {
                tracing::warn!(
                    method = %method,
                    id = req.id.as_deref().unwrap_or_default(),
                    code = err.code().code(),
                    error = %err,
                    "request failed"
                );
                Response::from_error(req.response_id(), &err)
            }
        }
    }

    fn handle_initialize(&self, req: &Request) -> Value {
        let client = req.param("clientInfo");
        let client_name = client
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let client_version = client
            .and_then(|c| c.get("version"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::info!(
            client_name,
            client_version,
            protocol_version = req.param_str("protocolVersion").unwrap_or_default(),
            session = req.session.as_deref().unwrap_or_default(),
            "initialize"
        );

        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {"listChanged": false},
                "resources": {"subscribe": false, "listChanged": false},
                "prompts": {"listChanged": false},
            },
            "serverInfo": {
                "name": self.config.name,
                "version": self.config.version,
            },
        })
    }

    fn handle_tools_list(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .list_schemas()
            .iter()
            .map(ToolSchema::to_protocol)
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, req: &Request) -> Result<Value, McpError> {
        let name = req
            .param_str("tool_name")
            .or_else(|| req.param_str("name"))
            .ok_or_else(|| McpError::InvalidRequest("tool_name is required".into()))?;

        let args = match req.param("arguments") {
            Some(Value::Object(args)) => args.clone(),
            Some(_) => return Err(McpError::Parse("arguments must be an object".into())),
            None => return Err(McpError::Parse("arguments are required".into())),
        };

        let (tool, schema) = self
            .tools
            .lookup(name)
            .ok_or_else(|| McpError::MethodNotFound(format!("Unknown tool: {name}")))?;

        let args = schema.prepare_arguments(args)?;

        tool.execute(args).await.map_err(|e| McpError::ToolExecution {
            tool: name.to_string(),
            message: e.to_string(),
        })
    }

    fn handle_resources_list(&self) -> Value {
        json!({ "resources": self.resources.list() })
    }

    async fn handle_resources_read(&self, req: &Request) -> Result<Value, McpError> {
        let uri = req
            .param_str("uri")
            .ok_or_else(|| McpError::InvalidRequest("uri is required".into()))?;

        let matched = self.resources.resolve(uri)?;
        let ctx = ResourceContext {
            request: req.clone(),
            uri: uri.to_string(),
            params: matched.params,
        };

        matched
            .resource
            .read(&ctx)
            .await
            .map_err(|e| McpError::ResourceRead {
                uri: uri.to_string(),
                message: e.to_string(),
            })
    }

    fn handle_prompts_list(&self) -> Value {
        json!({ "prompts": self.prompts.list() })
    }

    fn handle_prompts_get(&self, req: &Request) -> Result<Value, McpError> {
        let name = req
            .param_str("name")
            .ok_or_else(|| McpError::InvalidRequest("name is required".into()))?;

        let args = match req.param("arguments") {
            Some(Value::Object(args)) => args.clone(),
            None | Some(Value::Null) => Map::new(),
            Some(_) => return Err(McpError::InvalidParams("arguments must be an object".into())),
        };

        let messages = self.prompts.render(name, &args)?;
        let description = self
            .prompts
            .get(name)
            .map(|p| p.description().to_string())
            .unwrap_or_default();

        Ok(json!({ "description": description, "messages": messages }))
    }

    /// Log the registered tool and resource tables.
    pub fn log_registrations(&self) {
        for schema in self.tools.list_schemas() {
            tracing::info!(
                tool = schema.name(),
                description = %schema.metadata.description,
                params = schema.parameters.len(),
                "registered tool"
            );
        }
        for resource in self.resources.list() {
            tracing::info!(
                resource = %resource.name,
                pattern = %resource.template,
                kind = %resource.resource_type,
                "registered resource"
            );
        }
    }

    /// Serve over HTTP until ctrl-c.
    ///
    /// `addr` overrides the configured address; see
    /// [`resolve_address`](crate::config::resolve_address).
    pub async fn run(self, addr: Option<&str>) -> Result<(), McpError> {
        let addr = match addr {
            Some(addr) => crate::config::resolve_address(Some(addr), None),
            None => self.config.bind_address(),
        };
        if self.config.mode == Mode::Debug {
            self.log_registrations();
        }
        transport_http::serve(Arc::new(self), &addr).await
    }
}

/// Builder for constructing a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    tools: Vec<(Arc<dyn Tool>, Option<ToolSchema>)>,
    resources: Vec<(String, Arc<dyn Resource>)>,
    prompts: Vec<Arc<dyn Prompt>>,
    request_logging: Option<bool>,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set server name and version.
    pub fn server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.config.name = name.into();
        self.config.version = version.into();
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push((tool, None));
        self
    }

    pub fn tool_with_schema(mut self, tool: Arc<dyn Tool>, schema: ToolSchema) -> Self {
        self.tools.push((tool, Some(schema)));
        self
    }

    pub fn resource(mut self, pattern: impl Into<String>, resource: Arc<dyn Resource>) -> Self {
        self.resources.push((pattern.into(), resource));
        self
    }

    pub fn prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompts.push(prompt);
        self
    }

    /// Force the request-logging middleware on or off. Defaults to on in
    /// debug mode.
    pub fn request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = Some(enabled);
        self
    }

    /// Build the server.
    ///
    /// # Errors
    ///
    /// The first invalid config value, bad pattern or duplicate name.
    pub fn build(self) -> Result<Server, McpError> {
        self.config.validate()?;

        let server = Server {
            sessions: SessionManager::new(self.config.queue_capacity, self.config.push_timeout()),
            request_logging: self
                .request_logging
                .unwrap_or(self.config.mode == Mode::Debug),
            config: self.config,
            tools: ToolRegistry::new(),
            resources: ResourceRegistry::new(),
            prompts: PromptRegistry::new(),
        };

        for (tool, schema) in self.tools {
            match schema {
                Some(schema) => server.register_tool_with_schema(tool, schema)?,
                None => server.register_tool(tool)?,
            }
        }
        for (pattern, resource) in self.resources {
            server.register_resource(&pattern, resource)?;
        }
        for prompt in self.prompts {
            server.register_prompt(prompt)?;
        }
        Ok(server)
    }
}
