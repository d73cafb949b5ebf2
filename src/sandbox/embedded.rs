use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cdp::{evaluation_value, parse_devtools_url, CdpConnection};
use super::static_host::StaticHost;
use super::{
    ensure_safe_command, script_command, script_file_name, self_deleting_script,
    DependencyRegistry, Ecosystem, Sandbox, SandboxError, SandboxErrorCode, SandboxResult,
};
use crate::config::SandboxBackend;
use crate::dispatch::ScriptLanguage;
use crate::process::{split_command_line, which, OutputSink, OutputStream, ProcessOutput};
use crate::transfer::{
    deserialize_chunks, serialize_folder, Chunk, ChunkSet, ScratchPath, EMBEDDED_CHUNK_SIZE,
    INTERNAL_FILE_PREFIX,
};

const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const READY_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL: Duration = Duration::from_millis(500);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const SPAWN_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Page binding through which `spawn` reports output while a process runs.
const OUTPUT_BINDING: &str = "missionAgentOutput";

struct EmbeddedSession {
    browser: Child,
    _profile: ScratchPath,
    host: StaticHost,
    cdp: CdpConnection,
    session_id: String,
    registry: DependencyRegistry,
}

impl EmbeddedSession {
    async fn evaluate(&self, expression: &str, timeout: Duration) -> SandboxResult<Value> {
        self.evaluate_with_events(expression, timeout, &mut |_: &Value| {})
            .await
    }

    async fn evaluate_with_events(
        &self,
        expression: &str,
        timeout: Duration,
        on_event: &mut (dyn FnMut(&Value) + Send),
    ) -> SandboxResult<Value> {
        let result = self
            .cdp
            .call_with_events(
                Some(&self.session_id),
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
                timeout,
                on_event,
            )
            .await
            .map_err(|err| SandboxError::new(SandboxErrorCode::Execution, err))?;
        evaluation_value(&result).map_err(|err| {
            SandboxError::new(
                SandboxErrorCode::Execution,
                format!("page evaluation failed: {err}"),
            )
        })
    }

    async fn mount(&self, name: &str, content: &str) -> SandboxResult<()> {
        self.evaluate(&mount_expression(name, content), CALL_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Runs `program` in the page runtime. Output the page reports through
    /// the output binding goes to `sink` as it arrives; a page that only
    /// returns output on exit has it forwarded in one block.
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        sink: Option<&dyn OutputSink>,
    ) -> SandboxResult<ProcessOutput> {
        let mut streamed = false;
        let session_id = self.session_id.as_str();
        let mut forward = |event: &Value| {
            if let (Some(sink), Some(text)) = (sink, binding_payload(event, session_id)) {
                sink.on_output(OutputStream::Stdout, text);
                streamed = true;
            }
        };
        let value = self
            .evaluate_with_events(&spawn_expression(program, args), SPAWN_TIMEOUT, &mut forward)
            .await?;
        let output = ProcessOutput {
            stdout: value
                .get("output")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            stderr: String::new(),
            exit_code: value
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|code| i32::try_from(code).ok())
                .unwrap_or(-1),
        };
        if let (Some(sink), false) = (sink, streamed) {
            sink.on_output(OutputStream::Stdout, &output.stdout);
        }
        Ok(output)
    }

    async fn spawn_checked(&self, program: &str, args: &[String], what: &str) -> SandboxResult<ProcessOutput> {
        let output = self.spawn(program, args, None).await?;
        if !output.success() {
            return Err(SandboxError::new(
                SandboxErrorCode::Transfer,
                format!("{what} failed (exit {}): {}", output.exit_code, output.stdout.trim()),
            ));
        }
        Ok(output)
    }

    async fn ensure_node_package(&mut self, name: &str) -> SandboxResult<bool> {
        if self.registry.contains(Ecosystem::Node, name) {
            return Ok(false);
        }
        if !self.registry.node_project_ready() {
            let init = self.spawn("npm", &args(&["init", "-y"]), None).await?;
            if !init.success() {
                warn!("npm init failed: {}", init.stdout.trim());
            }
            self.registry.mark_node_project_ready();
        }
        info!(ecosystem = "npm", package = %name, "installing dependency");
        let output = self.spawn("npm", &args(&["install", name]), None).await?;
        if !output.success() {
            return Err(SandboxError::new(
                SandboxErrorCode::Execution,
                format!(
                    "npm install of {name} failed (exit {}): {}",
                    output.exit_code,
                    output.stdout.trim()
                ),
            ));
        }
        self.registry.mark_installed(Ecosystem::Node, name);
        Ok(true)
    }

    async fn shutdown(mut self) {
        let _ = self
            .cdp
            .call(None, "Browser.close", json!({}), Duration::from_secs(5))
            .await;
        self.cdp.close().await;
        let _ = self.browser.kill().await;
        self.host.stop().await;
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}

fn js(value: &impl serde::Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_owned())
}

pub fn mount_expression(name: &str, content: &str) -> String {
    format!(
        "(async () => {{ await window._electrons.mount({}, {}); return true; }})()",
        js(&name),
        js(&content)
    )
}

pub fn spawn_expression(program: &str, args: &[String]) -> String {
    format!(
        "(async () => {{ const onOutput = (text) => {{ try {{ window.{OUTPUT_BINDING}(String(text)); }} catch (_) {{}} }}; const r = await window._electrons.spawn({}, {}, {{ onOutput }}); return {{ output: String(r.output ?? ''), code: Number(r.code ?? 0) }}; }})()",
        js(&program),
        js(&args)
    )
}

/// Text carried by an output binding call made from `session_id`'s page.
pub fn binding_payload<'a>(event: &'a Value, session_id: &str) -> Option<&'a str> {
    if event.get("method").and_then(Value::as_str) != Some("Runtime.bindingCalled")
        || event.get("sessionId").and_then(Value::as_str) != Some(session_id)
    {
        return None;
    }
    let params = event.get("params")?;
    if params.get("name").and_then(Value::as_str) != Some(OUTPUT_BINDING) {
        return None;
    }
    params.get("payload").and_then(Value::as_str)
}

/// Sandbox backed by an in-page virtual filesystem and process API, hosted
/// in a headless Chromium driven over the DevTools protocol.
pub struct EmbeddedSandbox {
    browser_executable: Option<PathBuf>,
    assets_dir: PathBuf,
    state: Mutex<Option<EmbeddedSession>>,
}

impl EmbeddedSandbox {
    pub fn new(assets_dir: PathBuf, browser_executable: Option<PathBuf>) -> Self {
        Self {
            browser_executable,
            assets_dir,
            state: Mutex::new(None),
        }
    }

    fn resolve_browser(&self) -> SandboxResult<PathBuf> {
        if let Some(configured) = &self.browser_executable {
            return which(&configured.to_string_lossy()).ok_or_else(|| {
                SandboxError::new(
                    SandboxErrorCode::Provision,
                    format!("browser executable {} not found", configured.display()),
                )
            });
        }
        BROWSER_CANDIDATES
            .iter()
            .find_map(|candidate| which(candidate))
            .ok_or_else(|| {
                SandboxError::new(
                    SandboxErrorCode::Provision,
                    format!(
                        "no headless browser found on PATH (tried {})",
                        BROWSER_CANDIDATES.join(", ")
                    ),
                )
            })
    }

    async fn launch(&self) -> SandboxResult<EmbeddedSession> {
        let executable = self.resolve_browser()?;
        let provision = |message: String| SandboxError::new(SandboxErrorCode::Provision, message);

        let host = StaticHost::start(self.assets_dir.clone())
            .await
            .map_err(|err| provision(format!("failed starting static host: {err}")))?;
        let profile = ScratchPath::new(&std::env::temp_dir(), "browser-profile");
        std::fs::create_dir_all(profile.path())
            .map_err(|err| provision(format!("failed creating browser profile dir: {err}")))?;

        let mut browser = Command::new(&executable)
            .arg("--headless=new")
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| provision(format!("failed launching {}: {err}", executable.display())))?;

        let stderr = browser
            .stderr
            .take()
            .ok_or_else(|| provision("browser stderr was not captured".to_owned()))?;
        let mut lines = BufReader::new(stderr).lines();
        let ws_url = tokio::time::timeout(LAUNCH_TIMEOUT, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(url) = parse_devtools_url(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
        .ok_or_else(|| provision("browser did not report a DevTools endpoint".to_owned()))?;
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });
        debug!(%ws_url, "browser launched");

        let cdp = CdpConnection::connect(&ws_url).await.map_err(provision)?;
        let target = cdp
            .call(None, "Target.createTarget", json!({ "url": "about:blank" }), CALL_TIMEOUT)
            .await
            .map_err(provision)?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| provision("Target.createTarget returned no targetId".to_owned()))?
            .to_owned();
        let attached = cdp
            .call(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                CALL_TIMEOUT,
            )
            .await
            .map_err(provision)?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| provision("Target.attachToTarget returned no sessionId".to_owned()))?
            .to_owned();
        cdp.call(Some(&session_id), "Runtime.enable", json!({}), CALL_TIMEOUT)
            .await
            .map_err(provision)?;
        cdp.call(
            Some(&session_id),
            "Runtime.addBinding",
            json!({ "name": OUTPUT_BINDING }),
            CALL_TIMEOUT,
        )
        .await
        .map_err(provision)?;
        cdp.call(
            Some(&session_id),
            "Page.navigate",
            json!({ "url": host.url() }),
            CALL_TIMEOUT,
        )
        .await
        .map_err(provision)?;

        let session = EmbeddedSession {
            browser,
            _profile: profile,
            host,
            cdp,
            session_id,
            registry: DependencyRegistry::default(),
        };

        let started = Instant::now();
        loop {
            let ready = session
                .evaluate("window.appReady === true", CALL_TIMEOUT)
                .await
                .unwrap_or(Value::Bool(false));
            if ready == Value::Bool(true) {
                break;
            }
            if started.elapsed() >= READY_TIMEOUT {
                session.shutdown().await;
                return Err(provision(format!(
                    "sandbox page did not become ready within {}s",
                    READY_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(READY_POLL).await;
        }
        if let Err(err) = session
            .evaluate("(async () => { await window._electrons.boot(); return true; })()", SPAWN_TIMEOUT)
            .await
        {
            session.shutdown().await;
            return Err(provision(format!("failed booting sandbox runtime: {}", err.message)));
        }
        Ok(session)
    }
}

/// Node program run inside the sandbox that joins the mounted chunks,
/// unpacks them and moves the archived folder's children into the root.
fn import_program(chunk_names: &[String]) -> String {
    let scratch = format!(".{INTERNAL_FILE_PREFIX}unpack");
    [
        "const fs = require('fs');".to_owned(),
        "const path = require('path');".to_owned(),
        "const tar = require('tar');".to_owned(),
        format!("const names = {};", js(&chunk_names)),
        format!("const scratch = {};", js(&scratch)),
        format!(
            "const skip = {};",
            js(&["node_modules", ".git", ".vscode", "package.json", "package-lock.json"])
        ),
        "fs.writeFileSync('data.tar', '');".to_owned(),
        "for (const name of names) fs.appendFileSync('data.tar', Buffer.from(fs.readFileSync(name, 'utf8'), 'base64'));".to_owned(),
        "fs.rmSync(scratch, { recursive: true, force: true });".to_owned(),
        "fs.mkdirSync(scratch);".to_owned(),
        "tar.x({ file: 'data.tar', cwd: scratch, sync: true });".to_owned(),
        "fs.unlinkSync('data.tar');".to_owned(),
        "for (const name of names) fs.unlinkSync(name);".to_owned(),
        "const top = fs.readdirSync(scratch);".to_owned(),
        "const root = top.length === 1 && fs.statSync(path.join(scratch, top[0])).isDirectory() ? path.join(scratch, top[0]) : scratch;".to_owned(),
        "for (const item of fs.readdirSync(root)) {".to_owned(),
        format!(
            "  if (skip.includes(item) || item.startsWith({})) continue;",
            js(&INTERNAL_FILE_PREFIX)
        ),
        "  fs.rmSync(item, { recursive: true, force: true });".to_owned(),
        "  fs.renameSync(path.join(root, item), item);".to_owned(),
        "}".to_owned(),
        "fs.rmSync(scratch, { recursive: true, force: true });".to_owned(),
    ]
    .join("\n")
}

/// Node program that archives `remote` under a fixed top-level name and
/// writes base64 chunks into `out_dir`, printing their paths as JSON.
fn export_program(remote: &str, out_dir: &str) -> String {
    [
        "const fs = require('fs');".to_owned(),
        "const path = require('path');".to_owned(),
        "const tar = require('tar');".to_owned(),
        format!("const remote = {};", js(&remote)),
        format!("const outDir = {};", js(&out_dir)),
        format!("const chunkSize = {EMBEDDED_CHUNK_SIZE};"),
        format!(
            "const skip = {};",
            js(&["node_modules", ".git", ".vscode", "package.json", "package-lock.json"])
        ),
        "fs.rmSync(outDir, { recursive: true, force: true });".to_owned(),
        "fs.mkdirSync(outDir, { recursive: true });".to_owned(),
        "const items = fs.readdirSync(remote).filter(item => !skip.includes(item)".to_owned(),
        format!(
            "  && !item.startsWith({}) && !item.startsWith({}) && path.resolve(remote, item) !== path.resolve(outDir));",
            js(&INTERNAL_FILE_PREFIX),
            js(&format!(".{INTERNAL_FILE_PREFIX}"))
        ),
        "const archive = path.join(outDir, 'data.tar');".to_owned(),
        "if (items.length === 0) fs.writeFileSync(archive, Buffer.alloc(1024));".to_owned(),
        "else tar.c({ file: archive, cwd: remote, prefix: 'export', portable: true, sync: true }, items);".to_owned(),
        "const bytes = fs.readFileSync(archive);".to_owned(),
        "fs.unlinkSync(archive);".to_owned(),
        "const written = [];".to_owned(),
        "for (let i = 0; i * chunkSize < bytes.length; i++) {".to_owned(),
        format!(
            "  const file = path.join(outDir, {} + i + {});",
            js(&crate::transfer::CHUNK_PREFIX),
            js(&crate::transfer::CHUNK_SUFFIX)
        ),
        "  fs.writeFileSync(file, bytes.subarray(i * chunkSize, (i + 1) * chunkSize).toString('base64'));".to_owned(),
        "  written.push(file);".to_owned(),
        "}".to_owned(),
        "console.log(JSON.stringify(written));".to_owned(),
    ]
    .join("\n")
}

/// Last line of `output` that parses as a JSON array of strings.
fn parse_chunk_listing(output: &str) -> Option<Vec<String>> {
    output
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<Vec<String>>(line.trim()).ok())
}

#[async_trait]
impl Sandbox for EmbeddedSandbox {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Embedded
    }

    async fn preflight(&self) -> SandboxResult<()> {
        if !self.assets_dir.join("index.html").is_file() {
            return Err(SandboxError::new(
                SandboxErrorCode::Provision,
                format!(
                    "sandbox page assets not found (expected {})",
                    self.assets_dir.join("index.html").display()
                ),
            ));
        }
        self.resolve_browser().map(|_| ())
    }

    async fn start(&self) -> SandboxResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        let session = self.launch().await?;
        info!(page = %session.host.url(), "embedded sandbox started");
        *state = Some(session);
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        sink: Option<&dyn OutputSink>,
    ) -> SandboxResult<ProcessOutput> {
        ensure_safe_command(command)?;
        let argv = split_command_line(command)
            .map_err(|err| SandboxError::new(SandboxErrorCode::Unsupported, err))?;
        let Some((program, rest)) = argv.split_first() else {
            return Err(SandboxError::new(
                SandboxErrorCode::Unsupported,
                "empty command",
            ));
        };
        let state = self.state.lock().await;
        let session = state.as_ref().ok_or_else(SandboxError::not_started)?;
        session.spawn(program, rest, sink).await
    }

    async fn run_script(
        &self,
        language: ScriptLanguage,
        code: &str,
        sink: Option<&dyn OutputSink>,
    ) -> SandboxResult<ProcessOutput> {
        if language != ScriptLanguage::JavaScript {
            return Err(SandboxError::new(
                SandboxErrorCode::Unsupported,
                format!("{} scripts are not supported in the embedded sandbox", language.as_str()),
            ));
        }
        let file_name = script_file_name(language);
        {
            let state = self.state.lock().await;
            let session = state.as_ref().ok_or_else(SandboxError::not_started)?;
            session
                .mount(&file_name, &self_deleting_script(language, code))
                .await?;
        }
        self.run_command(&script_command(language, &file_name), sink)
            .await
    }

    async fn install_dependency(&self, ecosystem: Ecosystem, name: &str) -> SandboxResult<bool> {
        let Some(key) = DependencyRegistry::key(name) else {
            return Ok(false);
        };
        if ecosystem != Ecosystem::Node {
            return Err(SandboxError::new(
                SandboxErrorCode::Unsupported,
                format!("{} packages cannot be installed in the embedded sandbox", ecosystem.as_str()),
            ));
        }
        let mut state = self.state.lock().await;
        let session = state.as_mut().ok_or_else(SandboxError::not_started)?;
        session.ensure_node_package(&key).await
    }

    async fn import_folder(&self, local: &Path) -> SandboxResult<()> {
        let folder = local.to_path_buf();
        let set = tokio::task::spawn_blocking(move || serialize_folder(&folder, EMBEDDED_CHUNK_SIZE))
            .await
            .map_err(|err| {
                SandboxError::new(SandboxErrorCode::Transfer, format!("serialize task failed: {err}"))
            })??;

        let mut state = self.state.lock().await;
        let session = state.as_mut().ok_or_else(SandboxError::not_started)?;
        let mut names = Vec::with_capacity(set.len());
        for chunk in set.ordered()? {
            session.mount(&chunk.name, &chunk.data).await?;
            names.push(chunk.name.clone());
        }
        session.ensure_node_package("tar").await?;

        let program_name = format!("{INTERNAL_FILE_PREFIX}import.js");
        session
            .mount(
                &program_name,
                &self_deleting_script(ScriptLanguage::JavaScript, &import_program(&names)),
            )
            .await?;
        session
            .spawn_checked("node", &[program_name], "unpacking chunks in sandbox")
            .await?;
        info!(chunks = names.len(), source = %local.display(), "imported folder");
        Ok(())
    }

    async fn export_folder(&self, remote: Option<&str>, local: &Path) -> SandboxResult<()> {
        let mut state = self.state.lock().await;
        let session = state.as_mut().ok_or_else(SandboxError::not_started)?;
        session.ensure_node_package("tar").await?;

        let out_dir = format!(".{INTERNAL_FILE_PREFIX}export");
        let program_name = format!("{INTERNAL_FILE_PREFIX}export.js");
        session
            .mount(
                &program_name,
                &self_deleting_script(
                    ScriptLanguage::JavaScript,
                    &export_program(remote.unwrap_or("."), &out_dir),
                ),
            )
            .await?;
        let listing = session
            .spawn_checked("node", &[program_name], "packing folder in sandbox")
            .await?;
        let paths = parse_chunk_listing(&listing.stdout).ok_or_else(|| {
            SandboxError::new(
                SandboxErrorCode::Transfer,
                format!("export produced no chunk listing: {}", listing.stdout.trim()),
            )
        })?;

        let mut set = ChunkSet::default();
        for path in &paths {
            let content = session
                .spawn_checked("cat", &[path.clone()], "reading exported chunk")
                .await?;
            let name = path.rsplit('/').next().unwrap_or(path).to_owned();
            let data = content.stdout.split_whitespace().collect::<String>();
            set.chunks.push(Chunk { name, data });
        }
        let _ = session.spawn("rm", &args(&["-rf", out_dir.as_str()]), None).await;
        drop(state);

        let target = local.to_path_buf();
        let chunks = set.len();
        tokio::task::spawn_blocking(move || deserialize_chunks(&set, &target))
            .await
            .map_err(|err| {
                SandboxError::new(SandboxErrorCode::Transfer, format!("deserialize task failed: {err}"))
            })??;
        info!(chunks, destination = %local.display(), "exported folder");
        Ok(())
    }

    async fn stop(&self) -> SandboxResult<()> {
        let Some(session) = self.state.lock().await.take() else {
            return Ok(());
        };
        session.shutdown().await;
        info!("embedded sandbox stopped");
        Ok(())
    }
}
