use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::completion::ToolInvocation;
use crate::tool_registry::ToolRegistry;

pub const FAILURE_MARKER: &str = "❌";
pub const EMPTY_MARKER: &str = "⚠️";

const CDNJS_SEARCH_URL: &str = "https://api.cdnjs.com/libraries";
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const BOOKKEEPING_ENTRIES: &[&str] = &["node_modules", "package.json", "package-lock.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    JavaScript,
    Python,
}

impl ScriptLanguage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::Python => "python",
        }
    }
}

/// One next step chosen by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ReadFile { path: String },
    ListDirectory { path: String },
    ReadUrl { url: String },
    Rename { old_path: String, new_path: String },
    RemoveFile { path: String },
    RemoveDirectory { path: String },
    InstallSystemPackage { name: String },
    CheckCommandExists { command: String },
    RunShellCommand { command: String },
    CdnLookup { package: String },
    GenerateCode {
        language: ScriptLanguage,
        code: String,
        dependencies: Vec<String>,
    },
    External { name: String, input: Value },
}

impl Action {
    /// Maps a tool invocation onto an action. External tools whose spec
    /// declares a script binding become [`Action::GenerateCode`].
    pub fn from_invocation(call: &ToolInvocation, registry: &ToolRegistry) -> Result<Self, String> {
        let input = &call.input;
        let action = match call.name.as_str() {
            "read_file" => Self::ReadFile {
                path: string_field(input, "file_path")?,
            },
            "list_directory" => Self::ListDirectory {
                path: string_field(input, "directory_path")?,
            },
            "read_url" => Self::ReadUrl {
                url: string_field(input, "url")?,
            },
            "rename_file_or_directory" => Self::Rename {
                old_path: string_field(input, "old_path")?,
                new_path: string_field(input, "new_path")?,
            },
            "remove_file" => Self::RemoveFile {
                path: string_field(input, "file_path")?,
            },
            "remove_directory_recursively" => Self::RemoveDirectory {
                path: string_field(input, "directory_path")?,
            },
            "apt_install" => Self::InstallSystemPackage {
                name: string_field(input, "package_name")?,
            },
            "which_command" => Self::CheckCommandExists {
                command: string_field(input, "command")?,
            },
            "run_command" => Self::RunShellCommand {
                command: string_field(input, "command")?,
            },
            "cdnjs_finder" => Self::CdnLookup {
                package: string_field(input, "package_name")?,
            },
            "generate_nodejs_code" | "generate_nodejs_code_for_puppeteer" => Self::GenerateCode {
                language: ScriptLanguage::JavaScript,
                code: string_field(input, "nodejs_code")?,
                dependencies: list_field(input, "npm_package_list"),
            },
            "generate_python_code" => Self::GenerateCode {
                language: ScriptLanguage::Python,
                code: string_field(input, "python_code")?,
                dependencies: list_field(input, "pip_package_list"),
            },
            other => match registry.get(other).and_then(|tool| tool.script.as_ref()) {
                Some(binding) => Self::GenerateCode {
                    language: binding.language,
                    code: string_field(input, &binding.code_field)?,
                    dependencies: binding
                        .dependency_field
                        .as_deref()
                        .map(|field| list_field(input, field))
                        .unwrap_or_default(),
                },
                None => Self::External {
                    name: other.to_owned(),
                    input: input.clone(),
                },
            },
        };
        Ok(action)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::ListDirectory { .. } => "list_directory",
            Self::ReadUrl { .. } => "read_url",
            Self::Rename { .. } => "rename_file_or_directory",
            Self::RemoveFile { .. } => "remove_file",
            Self::RemoveDirectory { .. } => "remove_directory_recursively",
            Self::InstallSystemPackage { .. } => "apt_install",
            Self::CheckCommandExists { .. } => "which_command",
            Self::RunShellCommand { .. } => "run_command",
            Self::CdnLookup { .. } => "cdnjs_finder",
            Self::GenerateCode {
                language: ScriptLanguage::JavaScript,
                ..
            } => "generate_nodejs_code",
            Self::GenerateCode {
                language: ScriptLanguage::Python,
                ..
            } => "generate_python_code",
            Self::External { name, .. } => name,
        }
    }
}

fn string_field(input: &Value, field: &str) -> Result<String, String> {
    input
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| format!("missing string field `{field}`"))
}

fn list_field(input: &Value, field: &str) -> Vec<String> {
    match input.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect(),
        Some(Value::String(single)) if !single.trim().is_empty() => vec![single.trim().to_owned()],
        _ => Vec::new(),
    }
}

/// Script produced for one action. `primary` is the compact form recorded in
/// the transaction history; `fallback`, when present, is what actually runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedScript {
    pub language: ScriptLanguage,
    pub primary: String,
    pub fallback: Option<String>,
    pub dependencies: Vec<String>,
}

impl DispatchedScript {
    fn javascript(primary: String, fallback: String) -> Self {
        Self {
            language: ScriptLanguage::JavaScript,
            primary,
            fallback: Some(fallback),
            dependencies: Vec::new(),
        }
    }

    pub fn runnable(&self) -> &str {
        self.fallback.as_deref().unwrap_or(&self.primary)
    }

    /// Script that prints `message` behind the failure marker and exits 1.
    pub fn failure(message: &str) -> Self {
        let script = format!(
            "console.error({});\nprocess.exit(1);",
            js_literal(&format!("{FAILURE_MARKER} {message}"))
        );
        Self {
            language: ScriptLanguage::JavaScript,
            primary: script,
            fallback: None,
            dependencies: Vec::new(),
        }
    }
}

pub struct Dispatcher {
    http: Client,
    cdnjs_url: String,
}

impl Dispatcher {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed creating dispatcher http client")?;
        Ok(Self {
            http,
            cdnjs_url: CDNJS_SEARCH_URL.to_owned(),
        })
    }

    #[cfg(test)]
    pub fn with_cdnjs_url(mut self, url: impl Into<String>) -> Self {
        self.cdnjs_url = url.into();
        self
    }

    pub async fn dispatch(&self, action: &Action) -> DispatchedScript {
        debug!(action = action.name(), "dispatching action");
        match action {
            Action::ReadFile { path } => read_file_script(path),
            Action::ListDirectory { path } => list_directory_script(path),
            Action::Rename { old_path, new_path } => rename_script(old_path, new_path),
            Action::RemoveFile { path } => remove_file_script(path),
            Action::RemoveDirectory { path } => remove_directory_script(path),
            Action::InstallSystemPackage { name } => apt_install_script(name),
            Action::CheckCommandExists { command } => which_command_script(command),
            Action::RunShellCommand { command } => run_command_script(command),
            Action::ReadUrl { url } => match self.fetch_url(url).await {
                Ok(body) => read_url_script(url, &body),
                Err(err) => {
                    warn!(url = %url, "read_url prefetch failed: {err:#}");
                    DispatchedScript::failure(&format!("failed reading {url}: {err:#}"))
                }
            },
            Action::CdnLookup { package } => match self.lookup_cdn(package).await {
                Ok(listing) => cdn_lookup_script(package, &listing),
                Err(err) => {
                    warn!(package = %package, "cdnjs lookup failed: {err:#}");
                    DispatchedScript::failure(&format!("cdnjs lookup for {package} failed: {err:#}"))
                }
            },
            Action::GenerateCode {
                language,
                code,
                dependencies,
            } => DispatchedScript {
                language: *language,
                primary: strip_fenced_code_blocks(code),
                fallback: None,
                dependencies: dependencies.clone(),
            },
            Action::External { name, .. } => {
                DispatchedScript::failure(&format!("tool `{name}` is not supported in this sandbox"))
            }
        }
    }

    async fn fetch_url(&self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).with_context(|| format!("invalid url {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("unsupported url scheme `{}`", parsed.scheme());
        }
        let response = self
            .http
            .get(parsed)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?;
        response
            .text()
            .await
            .with_context(|| format!("failed reading body of {url}"))
    }

    async fn lookup_cdn(&self, package: &str) -> Result<String> {
        let response = self
            .http
            .get(&self.cdnjs_url)
            .query(&[("search", package), ("fields", "description,version")])
            .send()
            .await
            .context("cdnjs request failed")?
            .error_for_status()
            .context("cdnjs returned an error status")?;
        let payload: Value = response.json().await.context("cdnjs returned invalid JSON")?;
        Ok(umd_listing(&payload))
    }
}

/// `name - url` lines for every result whose latest asset is a UMD bundle,
/// or `NOT FOUND`.
fn umd_listing(payload: &Value) -> String {
    let lines = payload
        .get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name").and_then(Value::as_str)?;
                    let latest = entry.get("latest").and_then(Value::as_str)?;
                    (latest.contains(".umd.") && latest.ends_with(".js"))
                        .then(|| format!("{name} - {latest}"))
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if lines.is_empty() {
        "NOT FOUND".to_owned()
    } else {
        lines.join("\n")
    }
}

/// Keeps only the content of fenced code blocks; text without any fence is
/// kept whole. The result is trimmed.
pub fn strip_fenced_code_blocks(content: &str) -> String {
    let mut in_block = false;
    let mut has_blocks = false;
    let mut code = String::new();
    for line in content.split('\n') {
        if line.starts_with("```") {
            in_block = !in_block;
            has_blocks = true;
            continue;
        }
        if in_block {
            code.push_str(line);
            code.push('\n');
        }
    }
    if has_blocks {
        code.trim().to_owned()
    } else {
        content.trim().to_owned()
    }
}

fn js_literal(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_owned())
}

fn stub(function: &str, args: &[&str]) -> String {
    let args = args
        .iter()
        .map(|arg| js_literal(arg))
        .collect::<Vec<_>>()
        .join(", ");
    format!("const {function} = require('{function}');\nconsole.log(await {function}({args}));")
}

fn missing_guard(path_lit: &str, message: &str) -> String {
    format!(
        "if (!fs.existsSync({path_lit})) {{ console.error({}); process.exit(1); }}",
        js_literal(&format!("{FAILURE_MARKER} {message}"))
    )
}

fn read_file_script(path: &str) -> DispatchedScript {
    let p = js_literal(path);
    let fallback = [
        "const fs = require('fs');".to_owned(),
        missing_guard(&p, &format!("{path} does not exist, nothing to read")),
        format!("const content = fs.readFileSync({p}, 'utf8');"),
        format!("if (content.trim().length === 0 || fs.statSync({p}).size === 0) {{"),
        format!(
            "    console.log({});",
            js_literal(&format!("{EMPTY_MARKER} {path} is empty (0 bytes)"))
        ),
        "    process.exit(0);".to_owned(),
        "}".to_owned(),
        format!("console.log({});", js_literal(&format!("📄 Contents of {path}"))),
        "console.log(content);".to_owned(),
    ]
    .join("\n");
    DispatchedScript::javascript(stub("readFile", &[path]), fallback)
}

fn list_directory_script(path: &str) -> DispatchedScript {
    let p = js_literal(path);
    let hidden = serde_json::to_string(BOOKKEEPING_ENTRIES).unwrap_or_else(|_| "[]".to_owned());
    let fallback = [
        "const fs = require('fs');".to_owned(),
        missing_guard(&p, &format!("{path} does not exist, nothing to list")),
        format!("const entries = fs.readdirSync({p}).filter(item => !{hidden}.includes(item));"),
        format!(
            "console.log({});",
            js_literal(&format!("## Directory Contents of {path}"))
        ),
        "if (entries.length === 0) {".to_owned(),
        format!(
            "    console.log({});",
            js_literal(&format!("{EMPTY_MARKER} the directory is empty"))
        ),
        "    process.exit(0);".to_owned(),
        "}".to_owned(),
        format!("const isDir = item => fs.statSync({p} + '/' + item).isDirectory();"),
        format!("for (const item of entries) if (isDir(item)) console.log('📁 ' + {p} + '/' + item + '/');"),
        format!("for (const item of entries) if (!isDir(item)) console.log('📄 ' + {p} + '/' + item);"),
    ]
    .join("\n");
    DispatchedScript::javascript(stub("listDirectory", &[path]), fallback)
}

fn rename_script(old_path: &str, new_path: &str) -> DispatchedScript {
    let old = js_literal(old_path);
    let new = js_literal(new_path);
    let fallback = [
        "const fs = require('fs');".to_owned(),
        missing_guard(&old, &format!("{old_path} does not exist, nothing to rename")),
        format!("fs.renameSync({old}, {new});"),
        format!("if (fs.existsSync({new})) {{"),
        format!(
            "    console.log({});",
            js_literal(&format!("✅ renamed {old_path} to {new_path}"))
        ),
        "} else {".to_owned(),
        format!(
            "    console.error({});",
            js_literal(&format!("{FAILURE_MARKER} failed renaming {old_path} to {new_path}"))
        ),
        "    process.exit(1);".to_owned(),
        "}".to_owned(),
    ]
    .join("\n");
    DispatchedScript::javascript(stub("renameFileOrDirectory", &[old_path, new_path]), fallback)
}

fn removal_script(path: &str, kind: &str, remove_call: &str, function: &str) -> DispatchedScript {
    let p = js_literal(path);
    let fallback = [
        "const fs = require('fs');".to_owned(),
        missing_guard(&p, &format!("{path} does not exist, no {kind} to remove")),
        remove_call.replace("{path}", &p),
        format!("if (fs.existsSync({p})) {{"),
        format!(
            "    console.error({});",
            js_literal(&format!("{FAILURE_MARKER} {kind} still exists: {path}"))
        ),
        "    process.exit(1);".to_owned(),
        "}".to_owned(),
        format!(
            "console.log({});",
            js_literal(&format!("✅ {kind} removed: {path}"))
        ),
    ]
    .join("\n");
    DispatchedScript::javascript(stub(function, &[path]), fallback)
}

fn remove_file_script(path: &str) -> DispatchedScript {
    removal_script(path, "file", "fs.unlinkSync({path});", "removeFile")
}

fn remove_directory_script(path: &str) -> DispatchedScript {
    removal_script(
        path,
        "directory",
        "fs.rmSync({path}, { recursive: true, force: true });",
        "removeDirectory",
    )
}

/// Runs `program args...` through a shell with `spawnSync` and reports the
/// combined output.
fn spawn_script(program_and_args: &str, on_success: &str, on_failure: &str) -> String {
    [
        "const { spawnSync } = require('child_process');".to_owned(),
        format!(
            "const result = spawnSync({program_and_args}, {{ stdio: ['pipe', 'pipe', 'pipe'], shell: true, encoding: 'utf-8' }});"
        ),
        "const output = (result.stderr || '') + (result.stdout || '');".to_owned(),
        "const hasOutput = output.trim().length > 0;".to_owned(),
        format!("if (result.status === 0) console.log({on_success});"),
        format!("if (result.status !== 0) console.error({on_failure});"),
        "process.exit(result.status === null ? 1 : result.status);".to_owned(),
    ]
    .join("\n")
}

fn apt_install_script(name: &str) -> DispatchedScript {
    let fallback = spawn_script(
        &format!("'apt-get', ['install', '-y', {}]", js_literal(name)),
        &format!(
            "hasOutput ? output : {}",
            js_literal("(installed without output)")
        ),
        &format!(
            "{} + (hasOutput ? String.fromCharCode(10) + output : '')",
            js_literal(&format!("{FAILURE_MARKER} installing {name} failed"))
        ),
    );
    DispatchedScript::javascript(stub("aptInstall", &[name]), fallback)
}

fn which_command_script(command: &str) -> DispatchedScript {
    let fallback = spawn_script(
        &format!("'which', [{}]", js_literal(command)),
        &format!(
            "hasOutput ? {} + output : {}",
            js_literal(&format!("{command} exists at: ")),
            js_literal(&format!("{FAILURE_MARKER} {command} does not exist"))
        ),
        &js_literal(&format!("{FAILURE_MARKER} {command} does not exist")),
    );
    DispatchedScript::javascript(stub("whichCommand", &[command]), fallback)
}

fn run_command_script(command: &str) -> DispatchedScript {
    let fallback = spawn_script(
        &format!("{}, []", js_literal(command)),
        &format!(
            "hasOutput ? output : {}",
            js_literal("(completed without output)")
        ),
        "output",
    );
    DispatchedScript::javascript(stub("runCommand", &[command]), fallback)
}

fn read_url_script(url: &str, body: &str) -> DispatchedScript {
    let header = js_literal(&format!("🌏 Contents of {url}"));
    let primary = [
        "const axios = require('axios');".to_owned(),
        format!("const result = await axios.get({});", js_literal(url)),
        format!("console.log({header});"),
        "console.log(result.data);".to_owned(),
    ]
    .join("\n");
    let fallback = format!("console.log({header});\nconsole.log({});", js_literal(body));
    DispatchedScript::javascript(primary, fallback)
}

fn cdn_lookup_script(package: &str, listing: &str) -> DispatchedScript {
    let header = js_literal(&format!("🌏 CDN Library URL of {package}"));
    let primary = [
        "const cdnjsFinder = require('cdnjsFinder');".to_owned(),
        format!("const cdnLibraryURL = await cdnjsFinder({});", js_literal(package)),
        format!("console.log({header});"),
        "console.log(cdnLibraryURL);".to_owned(),
    ]
    .join("\n");
    let fallback = format!("console.log({header});\nconsole.log({});", js_literal(listing));
    DispatchedScript::javascript(primary, fallback)
}
