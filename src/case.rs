use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{ToolRegistry, ToolSpec};

/// One evaluation instance: a fixed opening prompt, the closed set of
/// reference facts, and the precomputed response for every tool this case
/// supports. Immutable after load; shared read-only across trajectories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    /// First-contact information shown to the agent as the opening user turn.
    pub initial_prompt: String,
    /// Gold conclusion the rubric scores against.
    #[serde(default)]
    pub reference_conclusion: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// tool name -> precomputed response for this case.
    #[serde(default)]
    pub tool_responses: BTreeMap<String, Value>,
}

impl Case {
    pub fn new(id: impl Into<String>, initial_prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial_prompt: initial_prompt.into(),
            reference_conclusion: None,
            metadata: BTreeMap::new(),
            tool_responses: BTreeMap::new(),
        }
    }

    pub fn with_reference_conclusion(mut self, conclusion: impl Into<String>) -> Self {
        self.reference_conclusion = Some(conclusion.into());
        self
    }

    pub fn with_tool_response(mut self, tool: impl Into<String>, response: Value) -> Self {
        self.tool_responses.insert(tool.into(), response);
        self
    }
}

/// Structural problems in case/tool data. Fatal at startup: a batch never
/// begins with a malformed case set.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("invalid parameter schema for tool {tool}: {message}")]
    InvalidToolSchema { tool: String, message: String },

    #[error("duplicate case id: {0}")]
    DuplicateCase(String),

    #[error("case {case_id} references unknown tool {tool}")]
    UnknownToolInCase { case_id: String, tool: String },

    #[error("no cases found under {0}")]
    NoCases(PathBuf),
}

fn read(path: &Path) -> Result<Vec<u8>, LoaderError> {
    fs::read(path).map_err(|source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_document<T: serde::de::DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, LoaderError> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let parsed = if ext == "json" {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_slice(bytes).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| LoaderError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolsDocument {
    Wrapped { tools: Vec<ToolSpec> },
    Bare(Vec<ToolSpec>),
}

/// Loads the global ToolSpec set from a JSON/YAML file. Accepts either a bare
/// list or a `{ "tools": [...] }` wrapper.
pub fn load_tool_specs(path: impl AsRef<Path>) -> Result<Vec<ToolSpec>, LoaderError> {
    let path = path.as_ref();
    let bytes = read(path)?;
    let document: ToolsDocument = parse_document(path, &bytes)?;
    Ok(match document {
        ToolsDocument::Wrapped { tools } => tools,
        ToolsDocument::Bare(tools) => tools,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CaseDocument {
    Many(Vec<Case>),
    One(Box<Case>),
}

/// Loads cases from a file or a directory of JSON/YAML files.
pub fn load_cases(path: impl AsRef<Path>) -> Result<Vec<Case>, LoaderError> {
    let path = path.as_ref();
    let mut cases = Vec::new();

    if path.is_dir() {
        let entries = fs::read_dir(path).map_err(|source| LoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| LoaderError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let p = entry.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            let bytes = read(&p)?;
            match parse_document::<CaseDocument>(&p, &bytes)? {
                CaseDocument::Many(batch) => cases.extend(batch),
                CaseDocument::One(case) => cases.push(*case),
            }
        }
        cases.sort_by(|a, b| a.id.cmp(&b.id));
    } else {
        let bytes = read(path)?;
        match parse_document::<CaseDocument>(path, &bytes)? {
            CaseDocument::Many(batch) => cases.extend(batch),
            CaseDocument::One(case) => cases.push(*case),
        }
    }

    if cases.is_empty() {
        return Err(LoaderError::NoCases(path.to_path_buf()));
    }
    Ok(cases)
}

/// The immutable inputs of a batch run: every case plus the compiled registry.
#[derive(Debug)]
pub struct CaseSet {
    pub cases: Vec<Case>,
    pub registry: ToolRegistry,
}

impl CaseSet {
    /// Builds the set and enforces the cross-reference invariant: every tool
    /// name appearing in a case's response map must exist in the spec set.
    pub fn new(cases: Vec<Case>, specs: Vec<ToolSpec>) -> Result<Self, LoaderError> {
        let registry = ToolRegistry::from_specs(specs)?;

        let mut seen = std::collections::HashSet::new();
        for case in &cases {
            if !seen.insert(case.id.clone()) {
                return Err(LoaderError::DuplicateCase(case.id.clone()));
            }
            for tool in case.tool_responses.keys() {
                if !registry.contains(tool) {
                    return Err(LoaderError::UnknownToolInCase {
                        case_id: case.id.clone(),
                        tool: tool.clone(),
                    });
                }
            }
        }

        Ok(Self { cases, registry })
    }

    pub fn load(
        cases_path: impl AsRef<Path>,
        tools_path: impl AsRef<Path>,
    ) -> Result<Self, LoaderError> {
        let specs = load_tool_specs(tools_path)?;
        let cases = load_cases(cases_path)?;
        let set = Self::new(cases, specs)?;
        tracing::info!(
            cases = set.cases.len(),
            tools = set.registry.len(),
            "case set loaded"
        );
        Ok(set)
    }

    pub fn get(&self, case_id: &str) -> Option<&Case> {
        self.cases.iter().find(|c| c.id == case_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_case_referencing_unknown_tool() {
        let case = Case::new("P1", "prompt")
            .with_tool_response("get_blood_routine", serde_json::json!({}));
        let err = CaseSet::new(vec![case], vec![ToolSpec::new("get_tumor_markers")]).unwrap_err();
        assert!(matches!(err, LoaderError::UnknownToolInCase { case_id, tool }
            if case_id == "P1" && tool == "get_blood_routine"));
    }

    #[test]
    fn rejects_duplicate_case_ids() {
        let cases = vec![Case::new("P1", "a"), Case::new("P1", "b")];
        let err = CaseSet::new(cases, Vec::new()).unwrap_err();
        assert!(matches!(err, LoaderError::DuplicateCase(id) if id == "P1"));
    }

    #[test]
    fn parses_wrapped_tools_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tools.json");
        fs::write(
            &path,
            r#"{ "tools": [ { "name": "get_tumor_markers", "description": "markers" } ] }"#,
        )
        .expect("write");

        let specs = load_tool_specs(&path).expect("load");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "get_tumor_markers");
    }

    #[test]
    fn loads_case_directory_sorted_by_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("b.json"),
            r#"{ "id": "P2", "initial_prompt": "second" }"#,
        )
        .expect("write");
        fs::write(
            dir.path().join("a.yaml"),
            "id: P1\ninitial_prompt: first\n",
        )
        .expect("write");

        let cases = load_cases(dir.path()).expect("load");
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].id, "P1");
        assert_eq!(cases[1].id, "P2");
    }

    #[test]
    fn empty_directory_is_a_loader_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_cases(dir.path()).unwrap_err();
        assert!(matches!(err, LoaderError::NoCases(_)));
    }
}
