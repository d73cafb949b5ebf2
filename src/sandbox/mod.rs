pub mod cdp;
pub mod container;
pub mod embedded;
pub mod static_host;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::config::SandboxBackend;
use crate::dispatch::ScriptLanguage;
use crate::process::{OutputSink, ProcessOutput};
use crate::transfer::{TransferError, INTERNAL_FILE_PREFIX};

pub use container::ContainerSandbox;
pub use embedded::EmbeddedSandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    Node,
    Python,
    System,
}

impl Ecosystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "npm",
            Self::Python => "pip",
            Self::System => "apt",
        }
    }

    pub fn for_language(language: ScriptLanguage) -> Self {
        match language {
            ScriptLanguage::JavaScript => Self::Node,
            ScriptLanguage::Python => Self::Python,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxErrorCode {
    Provision,
    UnsafeCommand,
    NotStarted,
    Unsupported,
    Execution,
    Transfer,
}

impl SandboxErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision_error",
            Self::UnsafeCommand => "unsafe_command",
            Self::NotStarted => "not_started",
            Self::Unsupported => "unsupported",
            Self::Execution => "execution_failed",
            Self::Transfer => "transfer_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxError {
    pub code: SandboxErrorCode,
    pub message: String,
}

impl SandboxError {
    pub fn new(code: SandboxErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_started() -> Self {
        Self::new(SandboxErrorCode::NotStarted, "sandbox has not been started")
    }

    /// Errors that only affect the current action; the mission keeps going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code,
            SandboxErrorCode::UnsafeCommand | SandboxErrorCode::Unsupported
        )
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for SandboxError {}

impl From<TransferError> for SandboxError {
    fn from(err: TransferError) -> Self {
        Self::new(SandboxErrorCode::Transfer, err.to_string())
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Packages already installed into one running sandbox.
#[derive(Debug, Default)]
pub struct DependencyRegistry {
    installed: HashSet<(Ecosystem, String)>,
    node_project_ready: bool,
}

impl DependencyRegistry {
    /// Registry key for a package name: trimmed and lowercased, `None` when
    /// blank.
    pub fn key(name: &str) -> Option<String> {
        let trimmed = name.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_lowercase())
    }

    pub fn contains(&self, ecosystem: Ecosystem, name: &str) -> bool {
        Self::key(name).is_some_and(|key| self.installed.contains(&(ecosystem, key)))
    }

    pub fn mark_installed(&mut self, ecosystem: Ecosystem, name: &str) {
        if let Some(key) = Self::key(name) {
            self.installed.insert((ecosystem, key));
        }
    }

    pub fn node_project_ready(&self) -> bool {
        self.node_project_ready
    }

    pub fn mark_node_project_ready(&mut self) {
        self.node_project_ready = true;
    }

    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

/// Commands are later wrapped in a double-quoted shell string, so any
/// embedded double quote is refused.
pub fn ensure_safe_command(command: &str) -> SandboxResult<()> {
    if command.contains('"') {
        return Err(SandboxError::new(
            SandboxErrorCode::UnsafeCommand,
            format!("command must not contain double quotes: {command}"),
        ));
    }
    Ok(())
}

pub fn script_file_name(language: ScriptLanguage) -> String {
    match language {
        ScriptLanguage::JavaScript => format!("{INTERNAL_FILE_PREFIX}operation.js"),
        ScriptLanguage::Python => format!("{INTERNAL_FILE_PREFIX}operation.py"),
    }
}

/// Prepends a prelude that deletes the script file once it starts.
pub fn self_deleting_script(language: ScriptLanguage, code: &str) -> String {
    match language {
        ScriptLanguage::JavaScript => format!(
            "{{\nconst fs = require('fs');\nfs.rmSync(__filename, {{ force: true }});\n}}\n{code}"
        ),
        ScriptLanguage::Python => format!(
            "import os as _agent_os\ntry:\n    _agent_os.remove(__file__)\nexcept OSError:\n    pass\n{code}"
        ),
    }
}

/// Command that runs a script file from the sandbox working root.
pub fn script_command(language: ScriptLanguage, file_name: &str) -> String {
    match language {
        ScriptLanguage::JavaScript => format!("node {file_name}"),
        ScriptLanguage::Python => format!("python -u {file_name}"),
    }
}

/// Install command for one package, relative to the working root.
pub fn install_command(ecosystem: Ecosystem, name: &str) -> String {
    match ecosystem {
        Ecosystem::Node => format!("npm install {name}"),
        Ecosystem::Python => format!("pip install {name}"),
        Ecosystem::System => format!("apt-get install -y {name}"),
    }
}

/// An isolated execution environment. Exactly one is active per mission;
/// every method works on the handle acquired by [`Sandbox::start`].
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn backend(&self) -> SandboxBackend;

    /// Environment checks that must pass before a mission starts.
    async fn preflight(&self) -> SandboxResult<()> {
        Ok(())
    }

    async fn start(&self) -> SandboxResult<()>;

    /// Runs `command` from the working root. A non-zero exit is reported in
    /// the output, never as an error.
    async fn run_command(
        &self,
        command: &str,
        sink: Option<&dyn OutputSink>,
    ) -> SandboxResult<ProcessOutput>;

    async fn run_script(
        &self,
        language: ScriptLanguage,
        code: &str,
        sink: Option<&dyn OutputSink>,
    ) -> SandboxResult<ProcessOutput>;

    /// Returns `true` when a package was actually installed and `false`
    /// when the registry already had it (or the name was blank).
    async fn install_dependency(&self, ecosystem: Ecosystem, name: &str) -> SandboxResult<bool>;

    async fn import_folder(&self, local: &Path) -> SandboxResult<()>;

    /// Copies `remote` (the working root when `None`) into `local`, minus
    /// bookkeeping files.
    async fn export_folder(&self, remote: Option<&str>, local: &Path) -> SandboxResult<()>;

    /// Best-effort teardown. Safe to call repeatedly and before `start`.
    async fn stop(&self) -> SandboxResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_quotes_are_unsafe() {
        assert!(ensure_safe_command("ls -al 'my dir'").is_ok());
        let err = ensure_safe_command("echo \"hi\"").expect_err("quote");
        assert_eq!(err.code, SandboxErrorCode::UnsafeCommand);
        assert!(err.is_recoverable());
    }

    #[test]
    fn registry_keys_are_trimmed_and_case_insensitive() {
        let mut registry = DependencyRegistry::default();
        registry.mark_installed(Ecosystem::Node, "  Lodash ");
        assert!(registry.contains(Ecosystem::Node, "lodash"));
        assert!(!registry.contains(Ecosystem::Python, "lodash"));
        registry.mark_installed(Ecosystem::Node, "   ");
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(Ecosystem::Node, ""));
    }

    #[test]
    fn scripts_delete_themselves_and_run_from_root() {
        let js = self_deleting_script(ScriptLanguage::JavaScript, "console.log(1);");
        assert!(js.starts_with("{\nconst fs = require('fs');"));
        assert!(js.ends_with("console.log(1);"));
        let py = self_deleting_script(ScriptLanguage::Python, "print(1)");
        assert!(py.contains("remove(__file__)"));
        assert_eq!(
            script_command(
                ScriptLanguage::Python,
                &script_file_name(ScriptLanguage::Python)
            ),
            "python -u agent-data-handling-operation.py"
        );
    }
}
