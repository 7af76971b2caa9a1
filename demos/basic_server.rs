//! Basic server example.
//!
//! Run with: `cargo run --example basic_server`
//! Then open a session and call a tool on it:
//!   curl -N "http://localhost:8080/sse?id=demo"
//!   curl -X POST http://localhost:8080/tool/invoke \
//!     -H "Content-Type: application/json" \
//!     -d '{"id":"1","session":"demo","params":{"tool_name":"greet","arguments":{"name":"Ada"}}}'

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;
use zeno::{
    FnResource, FnTool, McpError, ParamSchema, Prompt, PromptArgument, PromptMessage,
    ResourceContext, ResourceType, Server, ServerConfig, Tool,
};

/// A struct-based tool.
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the input message"
    }

    fn parameters(&self) -> Vec<ParamSchema> {
        vec![ParamSchema::required("message", "string", "Message to echo")]
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, McpError> {
        let message = args.get("message").and_then(Value::as_str).unwrap_or("(empty)");
        Ok(json!({ "text": format!("echo: {message}") }))
    }
}

struct Summarize;

impl Prompt for Summarize {
    fn name(&self) -> &str {
        "summarize"
    }

    fn description(&self) -> &str {
        "Ask for a short summary of a text"
    }

    fn arguments(&self) -> Vec<PromptArgument> {
        vec![PromptArgument {
            name: "text".into(),
            description: "Text to summarize".into(),
            required: true,
        }]
    }

    fn render(&self, args: &Map<String, Value>) -> Result<Vec<PromptMessage>, McpError> {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        Ok(vec![
            PromptMessage::new("system", "You write one-paragraph summaries."),
            PromptMessage::new("user", text),
        ])
    }
}

#[tokio::main]
async fn main() -> Result<(), McpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig {
        name: "example-server".into(),
        ..ServerConfig::from_env()?
    };

    let server = Server::builder()
        .config(config)
        .tool(Arc::new(EchoTool))
        .tool(FnTool::new(
            "greet",
            "Greets someone by name",
            vec![
                ParamSchema::required("name", "string", "Who to greet"),
                ParamSchema::optional("style", "string", "casual or formal").with_default(json!("casual")),
            ],
            |args: Map<String, Value>| async move {
                let name = args.get("name").and_then(Value::as_str).unwrap_or("world");
                let greeting = match args.get("style").and_then(Value::as_str) {
                    Some("formal") => format!("Good day, {name}."),
                    _ => format!("Hey, {name}!"),
                };
                Ok(json!({ "text": greeting }))
            },
        ))
        .resource(
            "/items/{id}",
            FnResource::new(
                "item",
                "A single inventory item",
                ResourceType::Json,
                |ctx: ResourceContext| async move {
                    let id = ctx.param("id").unwrap_or_default();
                    Ok(json!({ "id": id, "name": format!("item #{id}"), "in_stock": true }))
                },
            ),
        )
        .prompt(Arc::new(Summarize))
        .build()?;

    server.run(None).await
}
