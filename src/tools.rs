use std::collections::{BTreeMap, HashMap};

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize, Serializer};
use serde::ser::SerializeStruct;
use serde_json::Value;

use crate::case::Case;

/// Declared interface of one precomputed tool: its name, a human-readable
/// description, and a JSON-Schema object describing the named parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
}

fn default_parameters() -> Value {
    serde_json::json!({ "type": "object", "properties": {}, "required": [] })
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: default_parameters(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn to_tool(&self) -> Tool {
        Tool {
            kind: ToolType::Function,
            function: self.clone(),
        }
    }
}

/// OpenAI-style wire wrapper so specs feed straight into completion requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolType,
    pub function: ToolSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
    pub raw_arguments: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            raw_arguments: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(function: FunctionCall) -> Self {
        Self { id: None, function }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

// Providers transmit function arguments as a JSON-encoded string; keep that
// shape on the wire while exposing a parsed Value in memory.
impl Serialize for ToolCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ToolCall", 3)?;
        if let Some(id) = &self.id {
            state.serialize_field("id", id)?;
        }
        state.serialize_field("type", "function")?;
        state.serialize_field("function", &SerializableFunctionCall(&self.function))?;
        state.end()
    }
}

struct SerializableFunctionCall<'a>(&'a FunctionCall);

impl<'a> Serialize for SerializableFunctionCall<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("function", 2)?;
        state.serialize_field("name", &self.0.name)?;
        let raw = if let Some(raw) = &self.0.raw_arguments {
            raw.clone()
        } else {
            serde_json::to_string(&self.0.arguments)
                .map_err(|error| serde::ser::Error::custom(error.to_string()))?
        };
        state.serialize_field("arguments", &raw)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawFunctionCall {
            name: String,
            arguments: String,
        }

        #[derive(Deserialize)]
        struct RawToolCall {
            id: Option<String>,
            #[serde(rename = "type")]
            kind: String,
            function: RawFunctionCall,
        }

        let raw = RawToolCall::deserialize(deserializer)?;
        if raw.kind != "function" {
            return Err(serde::de::Error::custom(format!(
                "unsupported tool call type '{}'",
                raw.kind
            )));
        }

        let arguments: Value = serde_json::from_str(&raw.function.arguments)
            .map_err(|error| {
                serde::de::Error::custom(format!("failed to parse function arguments: {error}"))
            })?;

        Ok(Self {
            id: raw.id,
            function: FunctionCall {
                name: raw.function.name,
                arguments,
                raw_arguments: Some(raw.function.arguments),
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Simple(ToolChoiceSimple),
    Function {
        #[serde(rename = "type")]
        kind: ToolChoiceKind,
        function: ToolChoiceFunction,
    },
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self::Simple(ToolChoiceSimple::Auto)
    }

    pub fn none() -> Self {
        Self::Simple(ToolChoiceSimple::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceSimple {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceKind {
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("no data for case {case_id} with tool {tool}")]
    UnknownCaseForTool { case_id: String, tool: String },

    #[error("schema violation for {tool}: {}", violations.join("; "))]
    SchemaViolation {
        tool: String,
        violations: Vec<String>,
    },
}

impl ToolError {
    /// Structured payload fed back to the agent instead of crashing the run.
    pub fn to_payload(&self) -> Value {
        match self {
            ToolError::UnknownTool(name) => serde_json::json!({
                "error": { "kind": "unknown_tool", "tool": name }
            }),
            ToolError::UnknownCaseForTool { case_id, tool } => serde_json::json!({
                "error": { "kind": "unknown_case_for_tool", "tool": tool, "case_id": case_id }
            }),
            ToolError::SchemaViolation { tool, violations } => serde_json::json!({
                "error": { "kind": "schema_violation", "tool": tool, "violations": violations }
            }),
        }
    }
}

/// Resolves named tool calls against a per-case lookup table.
///
/// `execute` is a pure function of (tool name, case): arguments are validated
/// against the tool's schema but never affect the looked-up value, so the
/// registry can be shared read-only across concurrent trajectories.
#[derive(Debug)]
pub struct ToolRegistry {
    specs: BTreeMap<String, ToolSpec>,
    validators: HashMap<String, JSONSchema>,
}

impl ToolRegistry {
    pub fn from_specs(specs: Vec<ToolSpec>) -> Result<Self, crate::case::LoaderError> {
        let mut by_name = BTreeMap::new();
        let mut validators = HashMap::new();

        for spec in specs {
            if by_name.contains_key(&spec.name) {
                return Err(crate::case::LoaderError::DuplicateTool(spec.name));
            }

            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&spec.parameters)
                .map_err(|e| crate::case::LoaderError::InvalidToolSchema {
                    tool: spec.name.clone(),
                    message: e.to_string(),
                })?;

            validators.insert(spec.name.clone(), compiled);
            by_name.insert(spec.name.clone(), spec);
        }

        Ok(Self {
            specs: by_name,
            validators,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    /// Wire-format tool list for completion requests.
    pub fn tools(&self) -> Vec<Tool> {
        self.specs.values().map(ToolSpec::to_tool).collect()
    }

    pub fn validate(&self, name: &str, arguments: &Value) -> Result<(), ToolError> {
        let Some(validator) = self.validators.get(name) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };

        match validator.validate(arguments) {
            Ok(()) => Ok(()),
            Err(errors) => Err(ToolError::SchemaViolation {
                tool: name.to_string(),
                violations: errors.map(|e| e.to_string()).collect(),
            }),
        }
    }

    /// Looks up the precomputed response for (case, tool).
    pub fn execute(
        &self,
        name: &str,
        arguments: &Value,
        case: &Case,
    ) -> Result<Value, ToolError> {
        self.validate(name, arguments)?;

        case.tool_responses
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownCaseForTool {
                case_id: case.id.clone(),
                tool: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::Case;

    fn marker_spec() -> ToolSpec {
        ToolSpec::new("get_tumor_markers")
            .with_description("Serum tumor marker panel")
            .with_parameters(serde_json::json!({
                "type": "object",
                "properties": {
                    "test_date": { "type": "string" }
                },
                "required": []
            }))
    }

    fn case_with_markers() -> Case {
        let mut case = Case::new("C1", "patient, 65, cough 1 month");
        case.tool_responses.insert(
            "get_tumor_markers".to_string(),
            serde_json::json!({ "CEA": 8.5 }),
        );
        case
    }

    #[test]
    fn execute_returns_precomputed_value_verbatim() {
        let registry = ToolRegistry::from_specs(vec![marker_spec()]).expect("registry");
        let case = case_with_markers();

        let value = registry
            .execute("get_tumor_markers", &serde_json::json!({}), &case)
            .expect("lookup");
        assert_eq!(value, serde_json::json!({ "CEA": 8.5 }));
    }

    #[test]
    fn execute_is_pure() {
        let registry = ToolRegistry::from_specs(vec![marker_spec()]).expect("registry");
        let case = case_with_markers();
        let args = serde_json::json!({ "test_date": "2024-01-01" });

        let first = registry.execute("get_tumor_markers", &args, &case).expect("first");
        let second = registry.execute("get_tumor_markers", &args, &case).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_tool_is_typed() {
        let registry = ToolRegistry::from_specs(vec![marker_spec()]).expect("registry");
        let case = case_with_markers();

        let err = registry
            .execute("LC999", &serde_json::json!({}), &case)
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "LC999"));
    }

    #[test]
    fn schema_violation_reports_details() {
        let registry = ToolRegistry::from_specs(vec![marker_spec()]).expect("registry");
        let case = case_with_markers();

        let err = registry
            .execute(
                "get_tumor_markers",
                &serde_json::json!({ "test_date": 42 }),
                &case,
            )
            .unwrap_err();
        match err {
            ToolError::SchemaViolation { tool, violations } => {
                assert_eq!(tool, "get_tumor_markers");
                assert!(!violations.is_empty());
            }
            other => panic!("expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn missing_case_data_is_typed() {
        let registry = ToolRegistry::from_specs(vec![
            marker_spec(),
            ToolSpec::new("get_chest_ct_metrics"),
        ])
        .expect("registry");
        let case = case_with_markers();

        let err = registry
            .execute("get_chest_ct_metrics", &serde_json::json!({}), &case)
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownCaseForTool { .. }));
    }

    #[test]
    fn duplicate_tool_names_rejected() {
        let err = ToolRegistry::from_specs(vec![marker_spec(), marker_spec()]).unwrap_err();
        assert!(matches!(err, crate::case::LoaderError::DuplicateTool(_)));
    }

    #[test]
    fn tool_call_roundtrips_wire_format() {
        let call = ToolCall::new(FunctionCall::new(
            "get_tumor_markers",
            serde_json::json!({ "test_date": "2024-01-01" }),
        ))
        .with_id("call_0");

        let wire = serde_json::to_string(&call).expect("serialize");
        let parsed: ToolCall = serde_json::from_str(&wire).expect("deserialize");
        assert_eq!(parsed.id.as_deref(), Some("call_0"));
        assert_eq!(parsed.function.name, "get_tumor_markers");
        assert_eq!(
            parsed.function.arguments,
            serde_json::json!({ "test_date": "2024-01-01" })
        );
    }
}
