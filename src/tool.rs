use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::types::McpError;

/// Metadata for a single tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    pub name: String,
    /// Declared type tag, e.g. `string`, `integer`, `boolean`.
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl ParamSchema {
    pub fn required(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        ParamSchema {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            default: None,
            required: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        param_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        ParamSchema {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
}

/// Everything `tools/list` reports about one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub metadata: ToolMetadata,
    #[serde(default)]
    pub parameters: Vec<ParamSchema>,
    /// Passed through to clients verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

impl ToolSchema {
    /// Schema derived from the tool's own metadata.
    pub fn for_tool(tool: &dyn Tool) -> Self {
        ToolSchema {
            metadata: ToolMetadata {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
            },
            parameters: tool.parameters(),
            annotations: None,
        }
    }

    pub fn with_annotations(mut self, annotations: Value) -> Self {
        self.annotations = Some(annotations);
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// JSON-Schema view of the parameter list.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            let mut prop = json!({"type": p.param_type, "description": p.description});
            if let Some(default) = &p.default {
                prop["default"] = default.clone();
            }
            properties.insert(p.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({"type": "object", "properties": properties, "required": required})
    }

    /// The protocol-facing shape used in `tools/list`.
    pub fn to_protocol(&self) -> Value {
        let parameters: Vec<Value> = self
            .parameters
            .iter()
            .map(|p| {
                let mut v = json!({
                    "name": p.name,
                    "type": p.param_type,
                    "description": p.description,
                    "required": p.required,
                });
                if let Some(default) = &p.default {
                    v["default"] = default.clone();
                }
                v
            })
            .collect();

        let mut out = json!({
            "name": self.metadata.name,
            "description": self.metadata.description,
            "parameters": parameters,
            "inputSchema": self.input_schema(),
        });
        if let Some(annotations) = &self.annotations {
            out["annotations"] = annotations.clone();
        }
        out
    }
}

/// A named, schema-described invokable capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Vec<ParamSchema> {
        Vec::new()
    }
    async fn execute(&self, args: Map<String, Value>) -> Result<Value, McpError>;
}

/// Wraps an async closure into a [`Tool`].
pub struct FnTool<F> {
    name: String,
    description: String,
    parameters: Vec<ParamSchema>,
    f: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, McpError>> + Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParamSchema>,
        f: F,
    ) -> Arc<dyn Tool> {
        Arc::new(Self {
            name: name.into(),
            description: description.into(),
            parameters,
            f,
        })
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, McpError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Vec<ParamSchema> {
        self.parameters.clone()
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, McpError> {
        (self.f)(args).await
    }
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    schema: ToolSchema,
}

/// Name-keyed tool table. Safe to register into while requests are served.
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own schema.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), McpError> {
        let schema = ToolSchema::for_tool(tool.as_ref());
        self.register(tool, schema)
    }

    /// Register a tool with an explicit schema.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when the name is empty or the schema names another
    /// tool, `DuplicateTool` when the name is already taken.
    pub fn register(&self, tool: Arc<dyn Tool>, schema: ToolSchema) -> Result<(), McpError> {
        let name = tool.name().to_string();
        if name.is_empty() {
            return Err(McpError::InvalidRequest("tool name is empty".into()));
        }
        if schema.name() != name {
            return Err(McpError::InvalidRequest(format!(
                "schema for {:?} registered with tool {:?}",
                schema.name(),
                name
            )));
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&name) {
            tracing::warn!(tool = %name, "duplicate tool rejected");
            return Err(McpError::DuplicateTool(name));
        }
        tracing::debug!(tool = %name, params = schema.parameters.len(), "tool registered");
        entries.insert(name, ToolEntry { tool, schema });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn get_schema(&self, name: &str) -> Option<ToolSchema> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map(|e| e.schema.clone())
    }

    /// Tool and schema in one lookup.
    pub fn lookup(&self, name: &str) -> Option<(Arc<dyn Tool>, ToolSchema)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(name)
            .map(|e| (Arc::clone(&e.tool), e.schema.clone()))
    }

    /// Snapshot of every schema, sorted by name.
    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut schemas: Vec<ToolSchema> = entries.values().map(|e| e.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name().cmp(b.name()));
        schemas
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
