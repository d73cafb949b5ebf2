use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::signal;
use tracing::{info, warn};

use crate::completion::{AnthropicClient, CompletionBackend, TracingRequestLog};
use crate::config::{Config, SandboxBackend};
use crate::dispatch::Dispatcher;
use crate::mission::{MissionController, MissionOutcome, MissionSettings};
use crate::process::TerminalSink;
use crate::sandbox::{ContainerSandbox, EmbeddedSandbox, Sandbox};
use crate::tool_registry::{builtin_action_tools, ToolRegistry};
use crate::workspace::AppPaths;

const SUPPORTED_LLM: &str = "claude";

/// Resolved inputs of one mission run.
#[derive(Debug, Clone)]
pub struct MissionRequest {
    pub mission: String,
    pub source: PathBuf,
    /// Local directory the sandbox's working root is exported into.
    pub export_dir: PathBuf,
}

pub struct AgentRuntime {
    config: Config,
    paths: AppPaths,
}

impl AgentRuntime {
    pub fn new(config: Config, paths: AppPaths) -> Result<Self> {
        if config.llm != SUPPORTED_LLM {
            bail!(
                "unsupported llm `{}`; only `{SUPPORTED_LLM}` is available",
                config.llm
            );
        }
        if config.api_key().is_none() {
            bail!("claudeApiKey is not configured; run `mission-agent config claudeApiKey <key>`");
        }
        Ok(Self { config, paths })
    }

    fn sandbox(&self) -> Box<dyn Sandbox> {
        match self.config.backend() {
            SandboxBackend::Container => Box::new(ContainerSandbox::new(
                self.config.docker_image.clone(),
                self.config.docker_work_dir.clone(),
            )),
            SandboxBackend::Embedded => Box::new(EmbeddedSandbox::new(
                self.config.embedded_assets_dir(&self.paths),
                self.config.browser_executable.clone(),
            )),
        }
    }

    fn completion(&self, tools: &ToolRegistry) -> Result<AnthropicClient> {
        let mut action_tools = builtin_action_tools(self.config.backend());
        action_tools.extend(tools.definitions());
        let client = AnthropicClient::new(&self.config, action_tools)?;
        Ok(if self.config.log_requests {
            client.with_request_log(Arc::new(TracingRequestLog))
        } else {
            client
        })
    }

    /// Runs one mission end to end. The sandbox is stopped on every path,
    /// including ctrl-c.
    pub async fn run(&self, request: &MissionRequest) -> Result<MissionOutcome> {
        let backend = self.config.backend();
        let mut tools = ToolRegistry::new(self.config.tools_dir(&self.paths));
        let loaded = tools
            .refresh(backend)
            .with_context(|| format!("failed loading tools from {}", tools.root().display()))?;
        let completion = self.completion(&tools)?;
        let dispatcher = Dispatcher::new()?;

        info!(
            "starting mission (backend={}, model={}, max_iterations={}, external_tools={loaded})",
            backend.as_str(),
            self.config.model,
            self.config.max_iterations
        );

        let sandbox = self.sandbox();
        sandbox
            .preflight()
            .await
            .with_context(|| format!("{} sandbox is not available", backend.as_str()))?;

        let result = tokio::select! {
            res = self.drive(sandbox.as_ref(), &completion, &dispatcher, &tools, request) => res,
            _ = signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                Err(anyhow!("mission interrupted"))
            }
        };

        if let Err(err) = sandbox.stop().await {
            warn!("sandbox teardown failed: {err}");
        }
        result
    }

    async fn drive(
        &self,
        sandbox: &dyn Sandbox,
        completion: &dyn CompletionBackend,
        dispatcher: &Dispatcher,
        tools: &ToolRegistry,
        request: &MissionRequest,
    ) -> Result<MissionOutcome> {
        sandbox.start().await.context("failed starting sandbox")?;
        sandbox
            .import_folder(&request.source)
            .await
            .with_context(|| format!("failed importing {}", request.source.display()))?;
        info!(source = %request.source.display(), "source data imported");

        let mut controller = MissionController::new(
            request.mission.clone(),
            completion,
            sandbox,
            dispatcher,
            tools,
            MissionSettings::from_config(&self.config),
        )
        .with_output_sink(&TerminalSink);
        let outcome = controller.run().await?;
        info!(iterations = outcome.iterations(), "mission loop finished");

        sandbox
            .export_folder(None, &request.export_dir)
            .await
            .with_context(|| format!("failed exporting to {}", request.export_dir.display()))?;
        Ok(outcome)
    }
}
