//! Prompt templates, structurally a smaller sibling of the tool registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::McpError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// One rendered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// `user`, `assistant` or `system`.
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        PromptMessage {
            role: role.into(),
            content: content.into(),
        }
    }
}

pub trait Prompt: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn arguments(&self) -> Vec<PromptArgument>;
    fn render(&self, args: &Map<String, Value>) -> Result<Vec<PromptMessage>, McpError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
}

#[derive(Default)]
pub struct PromptRegistry {
    prompts: RwLock<HashMap<String, Arc<dyn Prompt>>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, prompt: Arc<dyn Prompt>) -> Result<(), McpError> {
        let name = prompt.name().to_string();
        let mut prompts = self.prompts.write().unwrap_or_else(PoisonError::into_inner);
        if prompts.contains_key(&name) {
            tracing::warn!(prompt = %name, "duplicate prompt rejected");
            return Err(McpError::DuplicatePrompt(name));
        }
        prompts.insert(name, prompt);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Prompt>> {
        let prompts = self.prompts.read().unwrap_or_else(PoisonError::into_inner);
        prompts.get(name).cloned()
    }

    /// Descriptors sorted by name.
    pub fn list(&self) -> Vec<PromptDescriptor> {
        let prompts = self.prompts.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<PromptDescriptor> = prompts
            .values()
            .map(|p| PromptDescriptor {
                name: p.name().to_string(),
                description: p.description().to_string(),
                arguments: p.arguments(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Render `name` after checking its required arguments.
    pub fn render(&self, name: &str, args: &Map<String, Value>) -> Result<Vec<PromptMessage>, McpError> {
        let prompt = self
            .get(name)
            .ok_or_else(|| McpError::MethodNotFound(format!("prompt not found: {name}")))?;

        if let Some(missing) = prompt
            .arguments()
            .iter()
            .find(|a| a.required && !args.contains_key(&a.name))
        {
            return Err(McpError::InvalidParams(format!(
                "missing required argument \"{}\"",
                missing.name
            )));
        }

        prompt.render(args).map_err(|e| McpError::PromptRender {
            prompt: name.to_string(),
            message: e.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.prompts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
