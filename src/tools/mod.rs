pub mod args;
pub mod notes;

use crate::llm::ToolDefinition;
use args::ArgumentParser;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// What a tool handed back: a human-readable message or a structured record.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Structured(Value),
}

impl ToolOutput {
    /// Text placed into the tool-result message. Records are pretty-printed.
    pub fn to_text(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Structured(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ToolOutput::Text(s) => Value::String(s.clone()),
            ToolOutput::Structured(v) => v.clone(),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        ToolOutput::Text(s)
    }
}

impl From<Value> for ToolOutput {
    fn from(v: Value) -> Self {
        ToolOutput::Structured(v)
    }
}

pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters_schema())
    }
}

#[derive(Clone, Default)]
pub struct ToolMetadata {
    /// Overrides the default argument parser for this tool.
    pub parse_arguments: Option<ArgumentParser>,
}

impl fmt::Debug for ToolMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolMetadata")
            .field("custom_parser", &self.parse_arguments.is_some())
            .finish()
    }
}

struct Entry {
    name: String,
    tool: Arc<dyn Tool>,
    metadata: ToolMetadata,
}

/// Checks a handler is still usable: a non-blank name that matches its
/// definition, and an object parameter schema.
pub fn validate_tool(tool: &dyn Tool) -> Result<(), String> {
    let name = tool.name();
    if name.trim().is_empty() {
        return Err("tool has a blank name".to_string());
    }
    let definition = tool.definition();
    if definition.name() != name {
        return Err(format!(
            "definition name '{}' does not match tool name '{}'",
            definition.name(),
            name
        ));
    }
    let schema = &definition.function.parameters;
    if !schema.is_object() || schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(format!("tool '{}' has a non-object parameter schema", name));
    }
    Ok(())
}

/// Catalog of tool handlers. Constructed once and shared as `Arc<ToolRegistry>`.
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.register_with_metadata(tool, ToolMetadata::default());
    }

    /// Registers a tool. A tool with the same name is replaced.
    pub fn register_with_metadata(&self, tool: Arc<dyn Tool>, metadata: ToolMetadata) {
        let name = tool.name().to_string();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = Entry {
            name: name.clone(),
            tool,
            metadata,
        };
        match entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => {
                warn!(tool = %name, "tool already registered, overwriting");
                *existing = entry;
            }
            None => {
                debug!(tool = %name, "registered tool");
                entries.push(entry);
            }
        }
    }

    /// Looks up a tool, returning `None` if it is missing or fails validation.
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.iter().find(|e| e.name == name)?;
        match validate_tool(entry.tool.as_ref()) {
            Ok(()) => Some(Arc::clone(&entry.tool)),
            Err(reason) => {
                debug!(tool = %name, %reason, "skipping invalid tool");
                None
            }
        }
    }

    /// All tools that currently pass validation, in registration order.
    pub fn get_all_tools(&self) -> Vec<Arc<dyn Tool>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| match validate_tool(e.tool.as_ref()) {
                Ok(()) => true,
                Err(reason) => {
                    debug!(tool = %e.name, %reason, "skipping invalid tool");
                    false
                }
            })
            .map(|e| Arc::clone(&e.tool))
            .collect()
    }

    pub fn get_all_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.get_all_tools().iter().map(|t| t.definition()).collect()
    }

    pub fn get_tool_metadata(&self, name: &str) -> Option<ToolMetadata> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.metadata.clone())
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.get_all_tools()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.get_all_tools().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry with the built-in note tools over the given store.
pub fn default_registry(store: Arc<dyn notes::NoteStore>) -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(notes::ListNotesTool::new(Arc::clone(&store))));
    registry.register(Arc::new(notes::SearchNotesTool::new(Arc::clone(&store))));
    registry.register(Arc::new(notes::KeywordSearchNotesTool::new(Arc::clone(&store))));
    registry.register(Arc::new(notes::ReadNoteTool::new(Arc::clone(&store))));
    registry.register(Arc::new(notes::CreateNoteTool::new(Arc::clone(&store))));
    registry.register(Arc::new(notes::UpdateNoteTool::new(Arc::clone(&store))));
    registry.register(Arc::new(notes::MoveNoteTool::new(store)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool {
        name: &'static str,
        schema: Value,
    }

    impl EchoTool {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                schema: json!({"type": "object", "properties": {}}),
            }
        }
    }

    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Echo the arguments"
        }

        fn parameters_schema(&self) -> Value {
            self.schema.clone()
        }

        fn execute(&self, args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::Structured(Value::Object(args.clone())))
        }
    }

    /// A handler whose definition drifted from its registered name.
    struct DriftingTool;

    impl Tool for DriftingTool {
        fn name(&self) -> &str {
            "drifting"
        }

        fn description(&self) -> &str {
            "broken"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        fn execute(&self, _args: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
            Err(ToolError::ExecutionFailed("unreachable".to_string()))
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("", "broken", self.parameters_schema())
        }
    }

    fn store() -> Arc<dyn notes::NoteStore> {
        Arc::new(notes::MemoryNoteStore::default())
    }

    #[test]
    fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::named("echo")));
        assert!(registry.get_tool("echo").is_some());
        assert!(registry.get_tool("nonexistent").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_overwrites() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::named("echo")));
        registry.register(Arc::new(EchoTool {
            name: "echo",
            schema: json!({"type": "object", "properties": {"v": {"type": "string"}}}),
        }));
        assert_eq!(registry.len(), 1);
        let schema = registry.get_tool("echo").unwrap().parameters_schema();
        assert!(schema["properties"].get("v").is_some());
    }

    #[test]
    fn test_invalid_tools_are_silently_excluded() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::named("echo")));
        registry.register(Arc::new(DriftingTool));
        registry.register(Arc::new(EchoTool {
            name: "bad_schema",
            schema: json!("not an object"),
        }));
        registry.register(Arc::new(EchoTool::named("  ")));

        assert!(registry.get_tool("drifting").is_none());
        assert!(registry.get_tool("bad_schema").is_none());
        assert_eq!(registry.tool_names(), vec!["echo"]);
        assert_eq!(registry.get_all_tool_definitions().len(), 1);
    }

    #[test]
    fn test_metadata_lookup() {
        fn upper(_: &crate::llm::ToolArguments) -> args::ParsedToolArguments {
            args::ParsedToolArguments::default()
        }

        let registry = ToolRegistry::new();
        registry.register_with_metadata(
            Arc::new(EchoTool::named("echo")),
            ToolMetadata {
                parse_arguments: Some(upper),
            },
        );
        assert!(registry
            .get_tool_metadata("echo")
            .unwrap()
            .parse_arguments
            .is_some());
        assert!(registry.get_tool_metadata("missing").is_none());
    }

    #[test]
    fn test_registry_empty() {
        let registry = ToolRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.get_all_tools().is_empty());
        assert!(registry.get_all_tool_definitions().is_empty());
    }

    #[test]
    fn test_default_registry_tools() {
        let registry = default_registry(store());
        assert_eq!(
            registry.tool_names(),
            vec![
                "list_notes",
                "search_notes",
                "keyword_search_notes",
                "read_note",
                "create_note",
                "update_note",
                "move_note"
            ]
        );
    }

    #[test]
    fn test_all_tools_have_valid_schemas() {
        let registry = default_registry(store());
        for tool in registry.get_all_tools() {
            let schema = tool.parameters_schema();
            assert_eq!(schema["type"], "object", "Tool '{}'", tool.name());
            assert!(schema.get("properties").is_some(), "Tool '{}'", tool.name());
            assert!(!tool.description().is_empty());
        }
    }

    #[test]
    fn test_tool_output_to_text() {
        assert_eq!(ToolOutput::Text("hi".to_string()).to_text(), "hi");
        let text = ToolOutput::Structured(json!({"count": 0})).to_text();
        assert_eq!(text, "{\n  \"count\": 0\n}");
    }

    #[test]
    fn test_tool_error_display_messages() {
        let err = ToolError::InvalidArguments("bad arg".to_string());
        assert_eq!(err.to_string(), "Invalid arguments: bad arg");

        let err = ToolError::ExecutionFailed("boom".to_string());
        assert_eq!(err.to_string(), "Execution failed: boom");

        let err = ToolError::NotFound("note x".to_string());
        assert_eq!(err.to_string(), "Not found: note x");
    }
}
