use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::SandboxBackend;
use crate::dispatch::ScriptLanguage;

const TOOLSPEC_SUFFIX: &str = ".toolspec.json";

/// How an external tool's input is turned into runnable code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExternalScriptBinding {
    pub language: ScriptLanguage,
    pub code_field: String,
    #[serde(default)]
    pub dependency_field: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExternalTool {
    pub name: String,
    /// Anthropic tool definition (`name`, `description`, `input_schema`).
    pub definition: Value,
    /// Prompt fragment appended to the action system prompt.
    pub prompt: Option<String>,
    pub script: Option<ExternalScriptBinding>,
}

#[derive(Debug, Deserialize)]
struct ToolSpecFile {
    name: String,
    #[serde(default)]
    description: String,
    /// `[example_template, descriptions]`, or a ready JSON schema object.
    input_schema: Value,
    #[serde(default)]
    script: Option<ExternalScriptBinding>,
}

/// Tools declared on disk under `<root>/<backend>/NAME.toolspec.json`, with an
/// optional `NAME.md` prompt fragment next to each spec.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    root: PathBuf,
    tools: BTreeMap<String, ExternalTool>,
}

impl ToolRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            tools: BTreeMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(PathBuf::new())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescans the backend's tool directory. Unparseable specs are skipped
    /// with a warning.
    pub fn refresh(&mut self, backend: SandboxBackend) -> Result<usize> {
        self.tools.clear();
        let dir = self.root.join(backend.as_str());
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut files = std::fs::read_dir(&dir)
            .with_context(|| format!("failed reading tool directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(TOOLSPEC_SUFFIX))
            })
            .collect::<Vec<_>>();
        files.sort();

        for file in files {
            match parse_tool_spec(&file) {
                Ok(tool) => {
                    self.tools.insert(tool.name.clone(), tool);
                }
                Err(err) => warn!("skipping tool spec {}: {err:#}", file.display()),
            }
        }
        Ok(self.tools.len())
    }

    pub fn insert(&mut self, tool: ExternalTool) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&ExternalTool> {
        self.tools.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ExternalTool> {
        self.tools.values()
    }

    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn prompts(&self) -> Vec<&str> {
        self.tools
            .values()
            .filter_map(|tool| tool.prompt.as_deref())
            .collect()
    }
}

fn parse_tool_spec(path: &Path) -> Result<ExternalTool> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    let spec: ToolSpecFile =
        serde_json::from_str(&text).with_context(|| format!("failed parsing {}", path.display()))?;
    let name = spec.name.trim().to_owned();
    if name.is_empty() {
        anyhow::bail!("tool spec name must be non-empty");
    }

    let input_schema = match spec.input_schema {
        Value::Array(parts) => {
            let template = parts.first().cloned().unwrap_or_else(|| json!({}));
            let descriptions = parts.get(1).cloned().unwrap_or(Value::Null);
            schema_from_template(&template, &descriptions)
        }
        schema @ Value::Object(_) => schema,
        other => anyhow::bail!("unsupported input_schema shape: {other}"),
    };

    let prompt_path = path.with_file_name(format!(
        "{}.md",
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.trim_end_matches(TOOLSPEC_SUFFIX))
            .unwrap_or(&name)
    ));
    let prompt = std::fs::read_to_string(&prompt_path)
        .ok()
        .filter(|text| !text.trim().is_empty());

    Ok(ExternalTool {
        definition: json!({
            "name": name,
            "description": spec.description,
            "input_schema": input_schema,
        }),
        name,
        prompt,
        script: spec.script,
    })
}

/// Builds a strict JSON schema from an example value. Objects become
/// `properties` with every key required, arrays take the schema of their
/// items when all items agree, scalars map to their JSON type. String
/// entries in `descriptions` (mirroring the template's shape) become
/// `description` fields.
pub fn schema_from_template(template: &Value, descriptions: &Value) -> Value {
    let mut schema = schema_node(template, descriptions);
    if let Value::Object(map) = &mut schema {
        map.insert(
            "$schema".to_owned(),
            json!("http://json-schema.org/draft-07/schema#"),
        );
        map.insert("additionalProperties".to_owned(), Value::Bool(false));
    }
    schema
}

fn schema_node(value: &Value, description: &Value) -> Value {
    let mut schema = Map::new();
    match value {
        Value::Object(fields) => {
            let mut properties = Map::new();
            let mut required = Vec::new();
            for (key, field) in fields {
                let field_description = description.get(key).unwrap_or(&Value::Null);
                properties.insert(key.clone(), schema_node(field, field_description));
                required.push(Value::String(key.clone()));
            }
            schema.insert("type".to_owned(), json!("object"));
            schema.insert("properties".to_owned(), Value::Object(properties));
            schema.insert("required".to_owned(), Value::Array(required));
        }
        Value::Array(items) => {
            let item_schemas = items
                .iter()
                .map(|item| schema_node(item, description))
                .collect::<Vec<_>>();
            let items_schema = match item_schemas.first() {
                Some(first) if item_schemas.iter().all(|other| other == first) => {
                    strip_description(first.clone())
                }
                _ => json!({}),
            };
            schema.insert("type".to_owned(), json!("array"));
            schema.insert("items".to_owned(), items_schema);
        }
        Value::Null => {
            schema.insert("type".to_owned(), json!("null"));
        }
        Value::Bool(_) => {
            schema.insert("type".to_owned(), json!("boolean"));
        }
        Value::Number(number) => {
            let kind = if number.is_i64() || number.is_u64() {
                "integer"
            } else {
                "number"
            };
            schema.insert("type".to_owned(), json!(kind));
        }
        Value::String(_) => {
            schema.insert("type".to_owned(), json!("string"));
        }
    }
    if let Value::String(text) = description {
        schema.insert("description".to_owned(), Value::String(text.clone()));
    }
    Value::Object(schema)
}

fn strip_description(mut schema: Value) -> Value {
    if let Value::Object(map) = &mut schema {
        map.remove("description");
    }
    schema
}

fn tool(name: &str, description: &str, template: Value, descriptions: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "input_schema": schema_from_template(&template, &descriptions),
    })
}

/// Built-in action tools offered for the given backend.
pub fn builtin_action_tools(backend: SandboxBackend) -> Vec<Value> {
    let container = backend == SandboxBackend::Container;
    let mut tools = vec![
        tool(
            "read_file",
            "Read a file.",
            json!({ "file_path": "" }),
            json!({ "file_path": "file path to read, e.g, ./program/package.json" }),
        ),
        tool(
            "list_directory",
            "List a directory.",
            json!({ "directory_path": "" }),
            json!({ "directory_path": "directory path to list, e.g, ./program" }),
        ),
        tool(
            "read_url",
            "Read a URL.",
            json!({ "url": "" }),
            json!({ "url": "url to read, e.g, https://example.com/robots.txt" }),
        ),
        tool(
            "rename_file_or_directory",
            "Rename a file or directory.",
            json!({ "old_path": "", "new_path": "" }),
            json!({
                "old_path": "old file or directory path to rename, e.g, ./program/package.json",
                "new_path": "new file or directory path to rename, e.g, ./program/package2.json"
            }),
        ),
        tool(
            "remove_file",
            "Remove a file.",
            json!({ "file_path": "" }),
            json!({ "file_path": "file path to remove, e.g, ./program/package.json" }),
        ),
        tool(
            "remove_directory_recursively",
            "Remove a directory recursively.",
            json!({ "directory_path": "" }),
            json!({ "directory_path": "directory path to remove recursively, e.g, ./program" }),
        ),
    ];
    if container {
        tools.push(tool(
            "apt_install",
            "Install a package using apt.",
            json!({ "package_name": "" }),
            json!({ "package_name": "package name to install, e.g, ffmpeg" }),
        ));
    }
    tools.push(tool(
        "which_command",
        "Check if a command exists.",
        json!({ "command": "" }),
        json!({ "command": "command to check, e.g, ffmpeg" }),
    ));
    tools.push(tool(
        "run_command",
        "Run a shell command.",
        json!({ "command": "" }),
        json!({ "command": "shell command to run, e.g, ls -al" }),
    ));
    if !container {
        tools.push(tool(
            "cdnjs_finder",
            "Find the CDN URL of a browser library.",
            json!({ "package_name": "" }),
            json!({ "package_name": "library name to search on cdnjs, e.g, chart.js" }),
        ));
    }
    tools.push(tool(
        "generate_nodejs_code",
        "Generate Node.js code that accomplishes the sub mission.",
        json!({ "nodejs_code": "", "npm_package_list": [""] }),
        json!({
            "nodejs_code": "complete Node.js program to execute",
            "npm_package_list": "array of npm package names used in the code"
        }),
    ));
    if container {
        tools.push(tool(
            "generate_python_code",
            "Generate Python code that accomplishes the sub mission.",
            json!({ "python_code": "", "pip_package_list": [""] }),
            json!({
                "python_code": "complete Python program to execute",
                "pip_package_list": "array of pip package names used in the code"
            }),
        ));
    }
    tools
}

pub fn verdict_tool() -> Value {
    tool(
        "completion_verdict",
        "verdict whether the mission is solved.",
        json!({ "evaluation": "", "reason": "" }),
        json!({
            "evaluation": "Respond with the result based on whether the mission was successfully completed e.g, ENDOFMISSION or NOTSOLVED or GIVEUPTHEMISSION",
            "reason": "Explain the reason for the verdict in a short sentence"
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mission-agent-tools-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    fn tool_names(tools: &[Value]) -> Vec<&str> {
        tools
            .iter()
            .filter_map(|tool| tool.get("name").and_then(Value::as_str))
            .collect()
    }

    #[test]
    fn schema_from_template_marks_every_key_required() {
        let schema = schema_from_template(
            &json!({ "file_path": "", "retries": 1, "tags": [""] }),
            &json!({ "file_path": "path to read", "tags": "labels" }),
        );
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(
            schema["$schema"],
            "http://json-schema.org/draft-07/schema#"
        );
        assert_eq!(schema["properties"]["file_path"]["type"], "string");
        assert_eq!(schema["properties"]["file_path"]["description"], "path to read");
        assert_eq!(schema["properties"]["retries"]["type"], "integer");
        assert_eq!(schema["properties"]["tags"]["type"], "array");
        assert_eq!(schema["properties"]["tags"]["items"]["type"], "string");
        assert_eq!(schema["properties"]["tags"]["description"], "labels");
        let required = schema["required"].as_array().expect("required");
        assert_eq!(required.len(), 3);
    }

    #[test]
    fn mixed_arrays_get_open_item_schema() {
        let schema = schema_from_template(&json!({ "mixed": ["", 1] }), &Value::Null);
        assert_eq!(schema["properties"]["mixed"]["items"], json!({}));
    }

    #[test]
    fn builtin_tools_depend_on_backend() {
        let container = builtin_action_tools(SandboxBackend::Container);
        let names = tool_names(&container);
        assert!(names.contains(&"apt_install"));
        assert!(names.contains(&"generate_python_code"));
        assert!(!names.contains(&"cdnjs_finder"));

        let embedded = builtin_action_tools(SandboxBackend::Embedded);
        let names = tool_names(&embedded);
        assert!(!names.contains(&"apt_install"));
        assert!(!names.contains(&"generate_python_code"));
        assert!(names.contains(&"cdnjs_finder"));
        assert!(names.contains(&"run_command"));
    }

    #[test]
    fn refresh_loads_specs_and_prompts_for_backend() {
        let root = temp_root("refresh");
        let dir = root.join("docker");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(
            dir.join("generate_nodejs_code_for_puppeteer.toolspec.json"),
            serde_json::to_string(&json!({
                "name": "generate_nodejs_code_for_puppeteer",
                "description": "Generate puppeteer code.",
                "input_schema": [
                    { "nodejs_code": "", "npm_package_list": [""] },
                    { "nodejs_code": "code", "npm_package_list": "packages" }
                ],
                "script": {
                    "language": "javascript",
                    "code_field": "nodejs_code",
                    "dependency_field": "npm_package_list"
                }
            }))
            .expect("json"),
        )
        .expect("write spec");
        std::fs::write(
            dir.join("generate_nodejs_code_for_puppeteer.md"),
            "### generate_nodejs_code_for_puppeteer\n- drives a browser",
        )
        .expect("write prompt");
        std::fs::write(dir.join("broken.toolspec.json"), "{ not json").expect("write broken");

        let mut registry = ToolRegistry::new(root.clone());
        let loaded = registry.refresh(SandboxBackend::Container).expect("refresh");
        assert_eq!(loaded, 1);
        let tool = registry
            .get("generate_nodejs_code_for_puppeteer")
            .expect("tool");
        assert_eq!(
            tool.definition["input_schema"]["properties"]["nodejs_code"]["type"],
            "string"
        );
        assert_eq!(
            tool.script.as_ref().map(|binding| binding.language),
            Some(ScriptLanguage::JavaScript)
        );
        assert_eq!(registry.prompts().len(), 1);

        let embedded = registry.refresh(SandboxBackend::Embedded).expect("refresh");
        assert_eq!(embedded, 0);
        let _ = std::fs::remove_dir_all(&root);
    }
}
