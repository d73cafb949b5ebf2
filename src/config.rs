use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workspace::AppPaths;

pub const CONFIG_KEYS: &[&str] = &[
    "claudeApiKey",
    "model",
    "llm",
    "maxIterations",
    "dockerImage",
    "useDocker",
    "dockerWorkDir",
    "overwriteOutputDir",
    "apiBaseUrl",
    "maxTokens",
    "toolCallRetryLimit",
    "outputDisplayLimit",
    "browserExecutable",
    "embeddedAssetsDir",
    "toolsDir",
    "logRequests",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub claude_api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm")]
    pub llm: String,
    #[serde(default)]
    pub max_iterations: u32,
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    #[serde(default = "default_use_docker")]
    pub use_docker: bool,
    #[serde(default = "default_docker_work_dir")]
    pub docker_work_dir: String,
    #[serde(default)]
    pub overwrite_output_dir: bool,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_tool_call_retry_limit")]
    pub tool_call_retry_limit: u32,
    #[serde(default = "default_output_display_limit")]
    pub output_display_limit: usize,
    #[serde(default)]
    pub browser_executable: Option<PathBuf>,
    #[serde(default)]
    pub embedded_assets_dir: Option<PathBuf>,
    #[serde(default)]
    pub tools_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_requests: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    Container,
    Embedded,
}

impl SandboxBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "docker",
            Self::Embedded => "webcontainer",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            claude_api_key: String::new(),
            model: default_model(),
            llm: default_llm(),
            max_iterations: 0,
            docker_image: default_docker_image(),
            use_docker: default_use_docker(),
            docker_work_dir: default_docker_work_dir(),
            overwrite_output_dir: false,
            api_base_url: default_api_base_url(),
            max_tokens: default_max_tokens(),
            tool_call_retry_limit: default_tool_call_retry_limit(),
            output_display_limit: default_output_display_limit(),
            browser_executable: None,
            embedded_assets_dir: None,
            tools_dir: None,
            log_requests: false,
        }
    }
}

impl Config {
    /// Loads the persisted document, falling back to defaults for absent keys
    /// (or for an unreadable / non-object document).
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::load_document(path)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn load_document(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => serde_json::from_value(Value::Object(map))
                .with_context(|| format!("failed parsing JSON config {}", path.display())),
            _ => Ok(Self::default()),
        }
    }

    /// Persists one key. The value is stored as JSON when it parses as JSON,
    /// otherwise as a plain string.
    pub fn set_key(path: &Path, key: &str, raw_value: &str) -> Result<()> {
        if !CONFIG_KEYS.contains(&key) {
            anyhow::bail!(
                "unknown configuration key `{key}` (known keys: {})",
                CONFIG_KEYS.join(", ")
            );
        }
        let mut document = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            }
        } else {
            serde_json::Map::new()
        };
        let value = serde_json::from_str::<Value>(raw_value)
            .unwrap_or_else(|_| Value::String(raw_value.to_owned()));
        document.insert(key.to_owned(), value);

        // Reject values that would make the document unloadable.
        serde_json::from_value::<Config>(Value::Object(document.clone()))
            .with_context(|| format!("invalid value for configuration key `{key}`"))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating config dir {}", parent.display()))?;
        }
        let mut payload = serde_json::to_string_pretty(&Value::Object(document))
            .context("failed serializing config")?;
        payload.push('\n');
        std::fs::write(path, payload)
            .with_context(|| format!("failed writing config file {}", path.display()))
    }

    pub fn backend(&self) -> SandboxBackend {
        if self.use_docker {
            SandboxBackend::Container
        } else {
            SandboxBackend::Embedded
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        let trimmed = self.claude_api_key.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn embedded_assets_dir(&self, paths: &AppPaths) -> PathBuf {
        self.embedded_assets_dir
            .clone()
            .unwrap_or_else(|| paths.workspace().join(".public"))
    }

    pub fn tools_dir(&self, paths: &AppPaths) -> PathBuf {
        self.tools_dir
            .clone()
            .unwrap_or_else(|| paths.root().join("tools"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("MISSION_AGENT_API_KEY").or_else(|_| env::var("ANTHROPIC_API_KEY"))
        {
            if self.api_key().is_none() && !v.trim().is_empty() {
                self.claude_api_key = v.trim().to_owned();
            }
        }
        if let Ok(v) = env::var("MISSION_AGENT_MODEL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.model = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("MISSION_AGENT_MAX_ITERATIONS") {
            if let Ok(n) = v.trim().parse::<u32>() {
                self.max_iterations = n;
            }
        }
        if let Ok(v) = env::var("MISSION_AGENT_USE_DOCKER") {
            self.use_docker = parse_bool(&v);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.output_display_limit == 0 {
            anyhow::bail!("outputDisplayLimit must be > 0");
        }
        if self.max_tokens == 0 {
            anyhow::bail!("maxTokens must be > 0");
        }
        if !self.docker_work_dir.starts_with('/') {
            anyhow::bail!("dockerWorkDir must be an absolute container path");
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_model() -> String {
    "claude-3-5-haiku-20241022".to_owned()
}

fn default_llm() -> String {
    "claude".to_owned()
}

fn default_docker_image() -> String {
    "my-node-ubuntu".to_owned()
}

fn default_use_docker() -> bool {
    true
}

fn default_docker_work_dir() -> String {
    "/home/ubuntu/work".to_owned()
}

fn default_api_base_url() -> String {
    "https://api.anthropic.com".to_owned()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_tool_call_retry_limit() -> u32 {
    5
}

fn default_output_display_limit() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mission-agent-config-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("config.json")
    }

    #[test]
    fn missing_document_yields_defaults() {
        let cfg = Config::load_document(&temp_config("missing")).expect("defaults");
        assert_eq!(cfg.model, "claude-3-5-haiku-20241022");
        assert_eq!(cfg.max_iterations, 0);
        assert!(cfg.use_docker);
        assert_eq!(cfg.docker_work_dir, "/home/ubuntu/work");
        assert_eq!(cfg.backend(), SandboxBackend::Container);
    }

    #[test]
    fn set_key_parses_json_values_and_keeps_strings() {
        let path = temp_config("set");
        Config::set_key(&path, "maxIterations", "3").expect("set number");
        Config::set_key(&path, "useDocker", "false").expect("set bool");
        Config::set_key(&path, "dockerImage", "ubuntu-node").expect("set string");

        let cfg = Config::load_document(&path).expect("load");
        assert_eq!(cfg.max_iterations, 3);
        assert!(!cfg.use_docker);
        assert_eq!(cfg.docker_image, "ubuntu-node");
        assert_eq!(cfg.backend(), SandboxBackend::Embedded);
        assert_eq!(cfg.model, "claude-3-5-haiku-20241022");

        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn set_key_rejects_unknown_keys_and_bad_types() {
        let path = temp_config("reject");
        let err = Config::set_key(&path, "favoriteColor", "blue").expect_err("unknown key");
        assert!(err.to_string().contains("unknown configuration key"));

        let err = Config::set_key(&path, "maxIterations", "many").expect_err("bad type");
        assert!(format!("{err:#}").contains("maxIterations"));
        assert!(!path.exists());
    }

    #[test]
    fn non_object_document_falls_back_to_defaults() {
        let path = temp_config("garbage");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "[1, 2, 3]").expect("write");
        let cfg = Config::load_document(&path).expect("defaults");
        assert_eq!(cfg.llm, "claude");
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn validate_rejects_relative_work_dir() {
        let cfg = Config {
            docker_work_dir: "work".to_owned(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
