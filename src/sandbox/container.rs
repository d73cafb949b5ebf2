use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ensure_safe_command, install_command, script_command, script_file_name,
    self_deleting_script, DependencyRegistry, Ecosystem, Sandbox, SandboxError, SandboxErrorCode,
    SandboxResult,
};
use crate::config::SandboxBackend;
use crate::dispatch::ScriptLanguage;
use crate::process::{run_process, run_process_with_timeout, OutputSink, ProcessOutput};
use crate::transfer::{
    deserialize_chunks, serialize_folder, ChunkSet, ScratchPath, CONTAINER_CHUNK_SIZE,
    INTERNAL_FILE_PREFIX,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PLATFORM: &str = "linux/x86_64";

struct ContainerHandle {
    id: String,
    registry: DependencyRegistry,
}

/// Sandbox backed by a long-lived container driven through the `docker` CLI.
pub struct ContainerSandbox {
    engine: String,
    image: String,
    work_dir: String,
    state: Mutex<Option<ContainerHandle>>,
}

impl ContainerSandbox {
    pub fn new(image: impl Into<String>, work_dir: impl Into<String>) -> Self {
        Self {
            engine: "docker".to_owned(),
            image: image.into(),
            work_dir: work_dir.into().trim_end_matches('/').to_owned(),
            state: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub async fn container_id(&self) -> Option<String> {
        self.state.lock().await.as_ref().map(|handle| handle.id.clone())
    }

    async fn engine(&self, args: &[&str]) -> SandboxResult<ProcessOutput> {
        let args = args.iter().map(|arg| (*arg).to_owned()).collect::<Vec<_>>();
        run_process(&self.engine, &args, None).await.map_err(|err| {
            SandboxError::new(
                SandboxErrorCode::Execution,
                format!("failed running `{} {}`: {err}", self.engine, args.join(" ")),
            )
        })
    }

    /// Runs `script` with `/bin/sh -c` inside the container.
    async fn exec(
        &self,
        id: &str,
        script: &str,
        sink: Option<&dyn OutputSink>,
    ) -> SandboxResult<ProcessOutput> {
        ensure_safe_command(script)?;
        let args = vec![
            "exec".to_owned(),
            id.to_owned(),
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            script.to_owned(),
        ];
        run_process(&self.engine, &args, sink).await.map_err(|err| {
            SandboxError::new(
                SandboxErrorCode::Execution,
                format!("failed running `{} exec`: {err}", self.engine),
            )
        })
    }

    async fn exec_checked(&self, id: &str, script: &str, what: &str) -> SandboxResult<ProcessOutput> {
        let output = self.exec(id, script, None).await?;
        if !output.success() {
            return Err(SandboxError::new(
                SandboxErrorCode::Transfer,
                format!("{what} failed (exit {}): {}", output.exit_code, output.stderr.trim()),
            ));
        }
        Ok(output)
    }

    async fn copy(&self, from: &str, to: &str, what: &str) -> SandboxResult<()> {
        let output = self.engine(&["cp", from, to]).await?;
        if !output.success() {
            return Err(SandboxError::new(
                SandboxErrorCode::Transfer,
                format!("{what} failed: {}", output.stderr.trim()),
            ));
        }
        Ok(())
    }

    fn in_work_dir(&self, command: &str) -> String {
        format!("cd {} && {command}", self.work_dir)
    }

    async fn require_id(&self) -> SandboxResult<String> {
        self.container_id().await.ok_or_else(SandboxError::not_started)
    }

    fn import_script(&self, staging: &str) -> String {
        [
            "set -e".to_owned(),
            format!("cd {staging}"),
            "rm -f data.tar".to_owned(),
            "i=0".to_owned(),
            "while [ -f data_$i.base64.chunked ]; do base64 -d data_$i.base64.chunked >> data.tar; i=$((i+1)); done"
                .to_owned(),
            "rm -rf unpack && mkdir unpack".to_owned(),
            "tar -xf data.tar -C unpack".to_owned(),
            "root=$(find unpack -mindepth 1 -maxdepth 1 -type d | head -n 1)".to_owned(),
            "cd ${root:-unpack}".to_owned(),
            format!(
                "rm -rf node_modules .git .vscode package.json package-lock.json {INTERNAL_FILE_PREFIX}*"
            ),
            format!("mkdir -p {}", self.work_dir),
            format!(
                "find . -mindepth 1 -maxdepth 1 -exec mv {{}} {} \\;",
                self.work_dir
            ),
            "cd /".to_owned(),
            format!("rm -rf {staging}"),
        ]
        .join("\n")
    }

    fn export_script(remote: &str, staging: &str) -> String {
        let trimmed = remote.trim_end_matches('/');
        let (parent, name) = match trimmed.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((parent, name)) => (parent, name),
            None => (".", trimmed),
        };
        [
            "set -e".to_owned(),
            format!("rm -rf {staging} && mkdir -p {staging}"),
            format!("cd {parent}"),
            format!("tar -cf {staging}/data.tar --exclude=node_modules {name}"),
            format!("cd {staging}"),
            format!("split -b {CONTAINER_CHUNK_SIZE} -d -a 6 data.tar part_"),
            "rm -f data.tar".to_owned(),
            "i=0".to_owned(),
            "for f in part_*; do base64 -w 0 $f > data_$i.base64.chunked; rm -f $f; i=$((i+1)); done"
                .to_owned(),
        ]
        .join("\n")
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Container
    }

    async fn preflight(&self) -> SandboxResult<()> {
        let info_args = vec![
            "info".to_owned(),
            "--format".to_owned(),
            "{{json .}}".to_owned(),
        ];
        let info = run_process_with_timeout(&self.engine, &info_args, PROBE_TIMEOUT)
            .await
            .map_err(|err| {
                SandboxError::new(
                    SandboxErrorCode::Provision,
                    format!("container engine is not reachable: {err}"),
                )
            })?;
        let server_errors = serde_json::from_str::<Value>(info.stdout.trim())
            .ok()
            .and_then(|parsed| parsed.get("ServerErrors").cloned());
        let daemon_ok = info.success()
            && match server_errors {
                None | Some(Value::Null) => true,
                Some(Value::Array(errors)) => errors.is_empty(),
                Some(_) => false,
            };
        if !daemon_ok {
            return Err(SandboxError::new(
                SandboxErrorCode::Provision,
                format!(
                    "container engine daemon is not running: {}",
                    info.combined().trim()
                ),
            ));
        }

        let images_args = vec![
            "images".to_owned(),
            "--format".to_owned(),
            "{{json .}}".to_owned(),
        ];
        let images = run_process_with_timeout(&self.engine, &images_args, PROBE_TIMEOUT)
            .await
            .map_err(|err| {
                SandboxError::new(
                    SandboxErrorCode::Provision,
                    format!("failed listing container images: {err}"),
                )
            })?;
        if !image_present(&images.stdout, &self.image) {
            return Err(SandboxError::new(
                SandboxErrorCode::Provision,
                format!("container image `{}` is not present", self.image),
            ));
        }
        debug!(image = %self.image, "container preflight passed");
        Ok(())
    }

    async fn start(&self) -> SandboxResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        let output = self
            .engine(&[
                "run",
                "-d",
                "--rm",
                "--platform",
                PLATFORM,
                self.image.as_str(),
                "tail",
                "-f",
                "/dev/null",
            ])
            .await
            .map_err(|err| SandboxError::new(SandboxErrorCode::Provision, err.message))?;
        let id = output.stdout.trim().to_owned();
        if !output.success() || id.is_empty() {
            return Err(SandboxError::new(
                SandboxErrorCode::Provision,
                format!("failed starting container: {}", output.stderr.trim()),
            ));
        }
        info!(container_id = %id, image = %self.image, "container started");

        // Recorded before the next await so `stop` reaches a half-started container.
        *state = Some(ContainerHandle {
            id: id.clone(),
            registry: DependencyRegistry::default(),
        });
        let prepared = self
            .exec(&id, &format!("mkdir -p {}", self.work_dir), None)
            .await?;
        if !prepared.success() {
            warn!(container_id = %id, "failed creating work dir: {}", prepared.stderr.trim());
        }
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        sink: Option<&dyn OutputSink>,
    ) -> SandboxResult<ProcessOutput> {
        ensure_safe_command(command)?;
        let id = self.require_id().await?;
        self.exec(&id, &self.in_work_dir(command), sink).await
    }

    async fn run_script(
        &self,
        language: ScriptLanguage,
        code: &str,
        sink: Option<&dyn OutputSink>,
    ) -> SandboxResult<ProcessOutput> {
        let id = self.require_id().await?;
        let file_name = script_file_name(language);
        let local = ScratchPath::new(&std::env::temp_dir(), "script");
        tokio::fs::write(local.path(), self_deleting_script(language, code))
            .await
            .map_err(|err| {
                SandboxError::new(
                    SandboxErrorCode::Execution,
                    format!("failed writing script file: {err}"),
                )
            })?;
        let local_path = local.path().to_string_lossy().into_owned();
        self.copy(
            &local_path,
            &format!("{id}:{}/{file_name}", self.work_dir),
            "copying script into container",
        )
        .await
        .map_err(|err| SandboxError::new(SandboxErrorCode::Execution, err.message))?;
        drop(local);
        self.exec(
            &id,
            &self.in_work_dir(&script_command(language, &file_name)),
            sink,
        )
        .await
    }

    async fn install_dependency(&self, ecosystem: Ecosystem, name: &str) -> SandboxResult<bool> {
        let Some(key) = DependencyRegistry::key(name) else {
            return Ok(false);
        };
        let mut state = self.state.lock().await;
        let handle = state.as_mut().ok_or_else(SandboxError::not_started)?;
        if handle.registry.contains(ecosystem, &key) {
            return Ok(false);
        }
        if ecosystem == Ecosystem::Node && !handle.registry.node_project_ready() {
            let init = self
                .exec(&handle.id, &self.in_work_dir("npm init -y"), None)
                .await?;
            if !init.success() {
                warn!("npm init failed: {}", init.stderr.trim());
            }
            handle.registry.mark_node_project_ready();
        }

        info!(ecosystem = ecosystem.as_str(), package = %name.trim(), "installing dependency");
        let output = self
            .exec(
                &handle.id,
                &self.in_work_dir(&install_command(ecosystem, name.trim())),
                None,
            )
            .await?;
        if !output.success() {
            return Err(SandboxError::new(
                SandboxErrorCode::Execution,
                format!(
                    "{} install of {} failed (exit {}): {}",
                    ecosystem.as_str(),
                    name.trim(),
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        handle.registry.mark_installed(ecosystem, &key);
        Ok(true)
    }

    async fn import_folder(&self, local: &Path) -> SandboxResult<()> {
        let id = self.require_id().await?;
        let folder = local.to_path_buf();
        let set = tokio::task::spawn_blocking(move || serialize_folder(&folder, CONTAINER_CHUNK_SIZE))
            .await
            .map_err(|err| {
                SandboxError::new(SandboxErrorCode::Transfer, format!("serialize task failed: {err}"))
            })??;

        let chunk_dir = ScratchPath::new(&std::env::temp_dir(), "import");
        set.write_to_dir(chunk_dir.path())?;
        let staging = format!("/tmp/{INTERNAL_FILE_PREFIX}import");
        self.exec_checked(&id, &format!("rm -rf {staging}"), "clearing import staging")
            .await?;
        let source = format!("{}/.", chunk_dir.path().to_string_lossy());
        self.copy(&source, &format!("{id}:{staging}"), "copying chunks into container")
            .await?;
        drop(chunk_dir);

        self.exec_checked(&id, &self.import_script(&staging), "unpacking chunks in container")
            .await?;
        info!(container_id = %id, chunks = set.len(), source = %local.display(), "imported folder");
        Ok(())
    }

    async fn export_folder(&self, remote: Option<&str>, local: &Path) -> SandboxResult<()> {
        let id = self.require_id().await?;
        let remote = remote.unwrap_or(&self.work_dir);
        let staging = format!("/tmp/{INTERNAL_FILE_PREFIX}export");
        self.exec_checked(&id, &Self::export_script(remote, &staging), "packing folder in container")
            .await?;

        let chunk_dir = ScratchPath::new(&std::env::temp_dir(), "export");
        let destination = chunk_dir.path().to_string_lossy().into_owned();
        self.copy(
            &format!("{id}:{staging}/."),
            &destination,
            "copying chunks out of container",
        )
        .await?;
        let _ = self.exec(&id, &format!("rm -rf {staging}"), None).await;

        let chunk_path: PathBuf = chunk_dir.path().to_path_buf();
        let target = local.to_path_buf();
        let chunks = tokio::task::spawn_blocking(move || {
            let set = ChunkSet::read_from_dir(&chunk_path)?;
            deserialize_chunks(&set, &target)?;
            Ok::<usize, crate::transfer::TransferError>(set.len())
        })
        .await
        .map_err(|err| {
            SandboxError::new(SandboxErrorCode::Transfer, format!("deserialize task failed: {err}"))
        })??;
        drop(chunk_dir);
        info!(container_id = %id, chunks, destination = %local.display(), "exported folder");
        Ok(())
    }

    async fn stop(&self) -> SandboxResult<()> {
        let Some(handle) = self.state.lock().await.take() else {
            return Ok(());
        };
        match self.engine(&["kill", handle.id.as_str()]).await {
            Ok(output) if output.success() => {
                info!(container_id = %handle.id, "container stopped");
            }
            Ok(output) => warn!(
                container_id = %handle.id,
                "container kill exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
            Err(err) => warn!(container_id = %handle.id, "container kill failed: {err}"),
        }
        Ok(())
    }
}

/// Whether `docker images --format '{{json .}}'` output lists `image`.
/// A tag in `image` must match too.
fn image_present(listing: &str, image: &str) -> bool {
    let (repository, tag) = match image.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, Some(tag)),
        _ => (image, None),
    };
    listing
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .any(|entry| {
            entry.get("Repository").and_then(Value::as_str) == Some(repository)
                && tag.is_none_or(|tag| entry.get("Tag").and_then(Value::as_str) == Some(tag))
        })
}
