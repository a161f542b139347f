//! Tool trait — the abstraction over external computation services.
//!
//! Tools are what the model can call mid-conversation: symbolic math,
//! web search, and anything registered later. Each tool declares a typed
//! input schema; the registry validates arguments against it before
//! dispatch and enforces a timeout on every call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A request to execute a tool, as emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (generated when the model API does not supply one)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON object
    pub arguments: serde_json::Value,
}

/// The result of a tool invocation as it is reported back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(serde_json::Value),
    Failure(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    /// The JSON object sent to the model as the function response.
    pub fn to_response_json(&self) -> serde_json::Value {
        match self {
            ToolOutcome::Success(payload) if payload.is_object() => payload.clone(),
            ToolOutcome::Success(payload) => serde_json::json!({ "result": payload }),
            ToolOutcome::Failure(reason) => serde_json::json!({ "error": reason }),
        }
    }
}

impl From<Result<serde_json::Value, ToolError>> for ToolOutcome {
    fn from(result: Result<serde_json::Value, ToolError>) -> Self {
        match result {
            Ok(payload) => ToolOutcome::Success(payload),
            Err(e) => ToolOutcome::Failure(e.to_string()),
        }
    }
}

/// The type of a single tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamKind {
    fn json_type(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
        }
    }

    fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
}

/// The declared input schema of a tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolSchema {
    params: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            description: description.into(),
            required: false,
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Render as a JSON Schema object (the form the model API expects).
    pub fn to_json_schema(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::json!({ "type": p.kind.json_type(), "description": p.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check arguments against the declared parameters.
    ///
    /// `null` is treated as an empty argument object. Unknown keys are rejected.
    pub fn validate(&self, args: &serde_json::Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let obj = match args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => &empty,
            other => return Err(format!("expected an object, got {other}")),
        };

        for param in &self.params {
            match obj.get(&param.name) {
                None | Some(serde_json::Value::Null) if param.required => {
                    return Err(format!("missing required argument '{}'", param.name));
                }
                None | Some(serde_json::Value::Null) => {}
                Some(value) if !param.kind.accepts(value) => {
                    return Err(format!(
                        "argument '{}' must be of type {}",
                        param.name,
                        param.kind.json_type()
                    ));
                }
                Some(_) => {}
            }
        }

        if let Some(unknown) = obj.keys().find(|k| !self.params.iter().any(|p| &p.name == *k)) {
            return Err(format!("unknown argument '{unknown}'"));
        }
        Ok(())
    }
}

/// The core Tool trait.
///
/// Tools must be stateless with respect to conversations: the registry is
/// shared by every conversation and makes no caching guarantee.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "symbolic_math", "web_search").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// The declared input schema.
    fn schema(&self) -> ToolSchema;

    /// Per-tool timeout override. `None` uses the registry default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute the tool with already-validated arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.schema().to_json_schema(),
        }
    }
}

/// A fixed mapping from tool name to tool.
///
/// The orchestrator uses this to:
/// 1. Get tool definitions to send to the model
/// 2. Validate and execute tool calls the model requests
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    default_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            default_timeout,
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions, sorted by name so requests are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validate and execute a tool invocation under its timeout.
    pub async fn invoke(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        tool.schema()
            .validate(args)
            .map_err(|reason| ToolError::SchemaMismatch {
                tool_name: name.to_string(),
                reason,
            })?;

        let timeout = tool.timeout().unwrap_or(self.default_timeout);
        debug!(tool = %name, timeout_ms = timeout.as_millis() as u64, "Invoking tool");

        match tokio::time::timeout(timeout, tool.execute(args.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool_name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
