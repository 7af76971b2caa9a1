//! URI-addressed resources and the pattern router that resolves them.
//!
//! Patterns are literal path segments with `{name}` placeholders, each
//! matching exactly one non-slash segment. Routes are scanned in
//! registration order and the first anchored match wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{McpError, Request};

/// Content kind advertised by a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Text,
    Json,
    File,
    Url,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Text => "text",
            ResourceType::Json => "json",
            ResourceType::File => "file",
            ResourceType::Url => "url",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a resource handler sees for one read.
#[derive(Debug, Clone)]
pub struct ResourceContext {
    /// The originating envelope.
    pub request: Request,
    /// The URI that was matched.
    pub uri: String,
    /// Placeholder name to matched segment.
    pub params: HashMap<String, String>,
}

impl ResourceContext {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// A named, URI-addressed readable capability.
#[async_trait]
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn resource_type(&self) -> ResourceType;
    async fn read(&self, ctx: &ResourceContext) -> Result<Value, McpError>;
}

/// Metadata returned by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Compiled, anchored matcher.
    pub pattern: String,
    /// The template as registered.
    pub template: String,
}

/// A compiled URI template.
#[derive(Debug, Clone)]
pub struct UriPattern {
    template: String,
    matcher: Regex,
    param_names: Vec<String>,
}

impl UriPattern {
    /// Compile `template`, replacing each `{name}` with a one-segment capture.
    ///
    /// Literal text is escaped, so `.` or `+` in a template match themselves.
    pub fn compile(template: &str) -> Result<Self, McpError> {
        let invalid = |reason: String| McpError::InvalidPattern {
            pattern: template.to_string(),
            reason,
        };

        if template.is_empty() {
            return Err(invalid("pattern is empty".into()));
        }

        let placeholder = Regex::new(r"\{([^{}]*)\}").map_err(|e| invalid(e.to_string()))?;

        let mut source = String::from("^");
        let mut param_names: Vec<String> = Vec::new();
        let mut last = 0;
        for caps in placeholder.captures_iter(template) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let name = name.as_str();
            if name.is_empty() || name.contains('/') {
                return Err(invalid(format!("bad placeholder {:?}", whole.as_str())));
            }
            if param_names.iter().any(|n| n == name) {
                return Err(invalid(format!("placeholder {{{name}}} appears twice")));
            }
            source.push_str(&regex::escape(&template[last..whole.start()]));
            source.push_str("([^/]+)");
            param_names.push(name.to_string());
            last = whole.end();
        }
        source.push_str(&regex::escape(&template[last..]));
        source.push('$');

        let matcher = Regex::new(&source).map_err(|e| invalid(e.to_string()))?;
        Ok(UriPattern {
            template: template.to_string(),
            matcher,
            param_names,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn as_regex_str(&self) -> &str {
        self.matcher.as_str()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Full-string match, returning the extracted placeholders.
    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let caps = self.matcher.captures(uri)?;
        let params = self
            .param_names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| caps.get(i + 1).map(|m| (name.clone(), m.as_str().to_string())))
            .collect();
        Some(params)
    }
}

/// A compiled pattern bound to one resource.
#[derive(Clone)]
pub struct Route {
    pattern: UriPattern,
    resource: Arc<dyn Resource>,
}

impl Route {
    pub fn pattern(&self) -> &UriPattern {
        &self.pattern
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            name: self.resource.name().to_string(),
            description: self.resource.description().to_string(),
            resource_type: self.resource.resource_type(),
            pattern: self.pattern.as_regex_str().to_string(),
            template: self.pattern.template().to_string(),
        }
    }
}

/// The outcome of a successful [`ResourceRegistry::resolve`].
#[derive(Clone)]
pub struct RouteMatch {
    pub resource: Arc<dyn Resource>,
    pub params: HashMap<String, String>,
}

/// Ordered route table. Safe to register into while requests are served.
#[derive(Default)]
pub struct ResourceRegistry {
    routes: RwLock<Vec<Route>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resource` under `pattern`.
    ///
    /// # Errors
    ///
    /// `InvalidPattern` when the template does not compile, and
    /// `DuplicateResource` when the template or the resource name is taken.
    pub fn register(&self, pattern: &str, resource: Arc<dyn Resource>) -> Result<(), McpError> {
        let pattern = UriPattern::compile(pattern.trim())?;
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);

        if routes.iter().any(|r| r.pattern.template() == pattern.template()) {
            tracing::warn!(pattern = pattern.template(), "duplicate resource pattern rejected");
            return Err(McpError::DuplicateResource(pattern.template().to_string()));
        }
        if routes.iter().any(|r| r.resource.name() == resource.name()) {
            tracing::warn!(name = resource.name(), "duplicate resource name rejected");
            return Err(McpError::DuplicateResource(resource.name().to_string()));
        }

        tracing::debug!(
            name = resource.name(),
            pattern = pattern.template(),
            params = ?pattern.param_names(),
            "resource registered"
        );
        routes.push(Route { pattern, resource });
        Ok(())
    }

    /// First route whose pattern matches all of `uri`.
    pub fn resolve(&self, uri: &str) -> Result<RouteMatch, McpError> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .find_map(|route| {
                route.pattern.matches(uri).map(|params| RouteMatch {
                    resource: Arc::clone(&route.resource),
                    params,
                })
            })
            .ok_or_else(|| McpError::ResourceNotFound(uri.to_string()))
    }

    /// Descriptors in registration order.
    pub fn list(&self) -> Vec<ResourceDescriptor> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes.iter().map(Route::descriptor).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wraps an async closure into a [`Resource`].
pub struct FnResource<F> {
    name: String,
    description: String,
    resource_type: ResourceType,
    f: F,
}

impl<F, Fut> FnResource<F>
where
    F: Fn(ResourceContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, McpError>> + Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        resource_type: ResourceType,
        f: F,
    ) -> Arc<dyn Resource> {
        Arc::new(Self {
            name: name.into(),
            description: description.into(),
            resource_type,
            f,
        })
    }
}

#[async_trait]
impl<F, Fut> Resource for FnResource<F>
where
    F: Fn(ResourceContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, McpError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    async fn read(&self, ctx: &ResourceContext) -> Result<Value, McpError> {
        (self.f)(ctx.clone()).await
    }
}
