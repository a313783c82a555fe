//! Tool registry and trait definitions
//!
//! Tools are grouped into tool sets. A tool set owns whatever state its tools
//! share (the shell tool set owns a process supervisor) and may contribute a
//! block of instructions to the system prompt of every agent it is attached to.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use troupe_core::{ToolCall, ToolDefinition};
use troupe_llm::LlmTool;

#[derive(Clone, Debug, PartialEq)]
pub enum ToolResult {
    Text(String),
    Error(String),
}

impl ToolResult {
    pub fn text(s: impl Into<String>) -> Self { Self::Text(s.into()) }
    pub fn error(s: impl Into<String>) -> Self { Self::Error(s.into()) }

    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Error(e) => e.clone(),
        }
    }

    pub fn is_error(&self) -> bool { matches!(self, Self::Error(_)) }
}

/// Hard tool failures. Anything that goes wrong while *running* a tool is
/// reported inside an `Ok(ToolResult)` so the model can react to it.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl ToolError {
    pub fn into_core(self, tool: &str) -> troupe_core::Error {
        match self {
            ToolError::InvalidArguments(message) => troupe_core::Error::invalid_arguments(tool, message),
        }
    }
}

/// Deserialize tool arguments into a typed struct.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "shell", "get_logs").
    fn name(&self) -> &str;

    /// Group the tool belongs to.
    fn category(&self) -> &str { "general" }

    /// Human-readable display name.
    fn title(&self) -> &str { self.name() }

    /// Description sent to the LLM.
    fn description(&self) -> &str;

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> Value;

    /// JSON Schema for the result content.
    fn output_schema(&self) -> Value {
        serde_json::json!({ "type": "string" })
    }

    /// Whether this tool only reads state (no side effects).
    fn is_read_only(&self) -> bool { false }

    /// Whether a human must approve each call unless the session approved
    /// tools wholesale.
    fn requires_approval(&self) -> bool { !self.is_read_only() }

    /// Execute the tool. `cancel` fires when the triggering run is cancelled.
    async fn execute(&self, args: Value, cancel: CancellationToken) -> Result<ToolResult, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }

    /// Convert to the LLM tool definition format.
    fn to_llm_tool(&self) -> LlmTool {
        self.definition().into()
    }
}

/// A group of tools sharing state and lifecycle.
#[async_trait::async_trait]
pub trait ToolSet: Send + Sync {
    /// Prompt fragment describing how to use the tools in this set.
    fn instructions(&self) -> Option<String> { None }

    fn tools(&self) -> Vec<Arc<dyn Tool>>;

    async fn start(&self) -> troupe_core::Result<()> { Ok(()) }

    async fn stop(&self) -> troupe_core::Result<()> { Ok(()) }
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

impl ToolRegistry {
    pub fn new() -> Self { Self { tools: HashMap::new() } }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        match self.tools.get(name) {
            Some(tool) => tool.execute(args, cancel).await,
            None => Ok(ToolResult::error(format!("Tool not found: {}", name))),
        }
    }

    /// Execute a model-issued call. Malformed argument JSON and arguments the
    /// tool rejects are caller errors.
    pub async fn execute_call(
        &self,
        call: &ToolCall,
        cancel: CancellationToken,
    ) -> troupe_core::Result<ToolResult> {
        let args = call
            .parse_arguments()
            .map_err(|e| troupe_core::Error::invalid_arguments(&call.name, e.to_string()))?;
        self.execute(&call.name, args, cancel)
            .await
            .map_err(|e| e.into_core(&call.name))
    }

    /// LLM tool definitions, sorted by name.
    pub fn get_definitions(&self) -> Vec<LlmTool> {
        let mut defs: Vec<LlmTool> = self.tools.values().map(|t| t.to_llm_tool()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
