use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::completion::{CallMode, ChatMessage, CompletionBackend, CompletionError, CompletionReply};
use crate::config::Config;
use crate::dispatch::{
    strip_fenced_code_blocks, Action, DispatchedScript, Dispatcher, ScriptLanguage, FAILURE_MARKER,
};
use crate::process::{OutputSink, ProcessOutput};
use crate::prompts;
use crate::sandbox::{Ecosystem, Sandbox, SandboxError, SandboxErrorCode};
use crate::tool_registry::ToolRegistry;

const OMISSION_MARKER: &str = "\n\n...(middle part omitted due to length)...\n\n";

/// One entry of the mission's append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Code(String),
    /// `None` only for the seed entry that stands for "nothing ran yet".
    Output(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    CodeGeneration,
    Executing,
    Evaluating,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::CodeGeneration => "code_generation",
            Self::Executing => "executing",
            Self::Evaluating => "evaluating",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue(String),
    Complete(String),
    Abandoned(String),
}

impl Verdict {
    /// Classifies the model's verdict label. Everything except `A`-`Z` is
    /// dropped before matching, so lowercase spellings never match.
    pub fn from_evaluation(evaluation: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let normalized = evaluation
            .chars()
            .filter(char::is_ascii_uppercase)
            .collect::<String>();
        match normalized.as_str() {
            "ENDOFMISSION" => Self::Complete(reason),
            "GIVEUPTHEMISSION" => Self::Abandoned(reason),
            _ => Self::Continue(reason),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continue(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Continue(reason) | Self::Complete(reason) | Self::Abandoned(reason) => reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissionOutcome {
    Completed { iterations: u32, reason: String },
    Abandoned { iterations: u32, reason: String },
    IterationLimit { iterations: u32 },
}

impl MissionOutcome {
    pub fn iterations(&self) -> u32 {
        match self {
            Self::Completed { iterations, .. }
            | Self::Abandoned { iterations, .. }
            | Self::IterationLimit { iterations } => *iterations,
        }
    }
}

#[derive(Debug)]
pub enum MissionError {
    Completion(CompletionError),
    Sandbox(SandboxError),
}

impl fmt::Display for MissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completion(err) => write!(f, "completion request failed: {err}"),
            Self::Sandbox(err) => write!(f, "sandbox operation failed: {err}"),
        }
    }
}

impl std::error::Error for MissionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Completion(err) => Some(err),
            Self::Sandbox(err) => Some(err),
        }
    }
}

impl From<CompletionError> for MissionError {
    fn from(err: CompletionError) -> Self {
        Self::Completion(err)
    }
}

impl From<SandboxError> for MissionError {
    fn from(err: SandboxError) -> Self {
        Self::Sandbox(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionSettings {
    /// 0 means unbounded.
    pub max_iterations: u32,
    pub display_limit: usize,
}

impl MissionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.max_iterations,
            display_limit: config.output_display_limit,
        }
    }
}

/// Drives the plan / act / observe / evaluate loop against one started
/// sandbox.
pub struct MissionController<'a> {
    mission: String,
    completion: &'a dyn CompletionBackend,
    sandbox: &'a dyn Sandbox,
    dispatcher: &'a Dispatcher,
    tools: &'a ToolRegistry,
    sink: Option<&'a dyn OutputSink>,
    settings: MissionSettings,
    transactions: Vec<Transaction>,
    evaluation: String,
    /// Script to run on the next iteration instead of planning. Nothing
    /// queues one yet.
    pending_validation: Option<String>,
}

impl<'a> MissionController<'a> {
    pub fn new(
        mission: impl Into<String>,
        completion: &'a dyn CompletionBackend,
        sandbox: &'a dyn Sandbox,
        dispatcher: &'a Dispatcher,
        tools: &'a ToolRegistry,
        settings: MissionSettings,
    ) -> Self {
        Self {
            mission: mission.into(),
            completion,
            sandbox,
            dispatcher,
            tools,
            sink: None,
            settings,
            transactions: vec![Transaction::Output(None)],
            evaluation: String::new(),
            pending_validation: None,
        }
    }

    pub fn with_output_sink(mut self, sink: &'a dyn OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub async fn run(&mut self) -> Result<MissionOutcome, MissionError> {
        let mut iteration = 0_u32;
        loop {
            if self.settings.max_iterations > 0 && iteration >= self.settings.max_iterations {
                info!(iterations = iteration, "iteration limit reached");
                return Ok(MissionOutcome::IterationLimit {
                    iterations: iteration,
                });
            }
            iteration += 1;

            let script = match self.pending_validation.take() {
                Some(code) => DispatchedScript {
                    language: ScriptLanguage::JavaScript,
                    primary: strip_fenced_code_blocks(&code),
                    fallback: None,
                    dependencies: Vec::new(),
                },
                None => {
                    let (done_so_far, task) = self.plan(iteration).await?;
                    self.generate(iteration, &done_so_far, &task).await?
                }
            };
            self.execute(iteration, &script).await?;

            match self.evaluate(iteration).await? {
                Verdict::Complete(reason) => {
                    return Ok(MissionOutcome::Completed {
                        iterations: iteration,
                        reason,
                    })
                }
                Verdict::Abandoned(reason) => {
                    return Ok(MissionOutcome::Abandoned {
                        iterations: iteration,
                        reason,
                    })
                }
                Verdict::Continue(reason) => self.evaluation = reason,
            }
        }
    }

    async fn plan(&self, iteration: u32) -> Result<(String, String), MissionError> {
        info!(iteration, phase = Phase::Planning.as_str(), "planning next task");
        let last = self.last_output();

        let mut done_so_far = String::new();
        if self.transactions.len() > 1 {
            let request = prompts::retrospective_request(&self.mission, last.as_deref());
            let reply = self
                .completion
                .complete(
                    prompts::RETROSPECTIVE_SYSTEM,
                    &self.history(request),
                    CallMode::Retrospective,
                )
                .await?;
            done_so_far = tidy_lines(&reply_text(reply));
            println!("📃 {done_so_far}");
        }

        let request = prompts::next_task_request(&self.mission, last.as_deref());
        let reply = self
            .completion
            .complete(
                prompts::NEXT_TASK_SYSTEM,
                &self.history(request),
                CallMode::NextTask,
            )
            .await?;
        let task = tidy_lines(&reply_text(reply));
        println!("📌 {task}");
        Ok((done_so_far, task))
    }

    async fn generate(
        &self,
        iteration: u32,
        done_so_far: &str,
        task: &str,
    ) -> Result<DispatchedScript, MissionError> {
        info!(
            iteration,
            phase = Phase::CodeGeneration.as_str(),
            "requesting action"
        );
        let system = prompts::action_system_prompt(
            &self.mission,
            task,
            self.sandbox.backend(),
            &self.tools.prompts(),
        );
        let request = prompts::action_request(
            self.last_output().as_deref(),
            &self.evaluation,
            done_so_far,
            task,
        );
        let reply = self
            .completion
            .complete(&system, &self.history(request), CallMode::GenerateAction)
            .await?;

        let script = match reply {
            CompletionReply::Tool(call) => match Action::from_invocation(&call, self.tools) {
                Ok(action) => {
                    info!(iteration, action = action.name(), "action selected");
                    self.dispatcher.dispatch(&action).await
                }
                Err(reason) => {
                    warn!(iteration, tool = %call.name, "malformed action: {reason}");
                    DispatchedScript::failure(&format!("invalid `{}` call: {reason}", call.name))
                }
            },
            CompletionReply::Text(_) => {
                warn!(iteration, "model answered without choosing an action");
                DispatchedScript::failure("no action was chosen")
            }
        };
        Ok(script)
    }

    async fn execute(&mut self, iteration: u32, script: &DispatchedScript) -> Result<(), MissionError> {
        info!(
            iteration,
            phase = Phase::Executing.as_str(),
            language = script.language.as_str(),
            "executing script"
        );
        self.install_dependencies(script).await?;

        let result = match self
            .sandbox
            .run_script(script.language, script.runnable(), self.sink)
            .await
        {
            Ok(output) => output,
            Err(err) if err.is_recoverable() => {
                warn!(iteration, "execution rejected: {err}");
                ProcessOutput {
                    stdout: String::new(),
                    stderr: format!("{FAILURE_MARKER} {}", err.message),
                    exit_code: 1,
                }
            }
            Err(err) => return Err(err.into()),
        };

        let output = strip_ansi(result.combined().trim());
        if output.is_empty() {
            warn!(iteration, "execution produced no output");
        }
        debug!(iteration, exit_code = result.exit_code, "execution finished");
        self.transactions.push(Transaction::Code(script.primary.clone()));
        self.transactions.push(Transaction::Output(Some(output)));
        Ok(())
    }

    async fn install_dependencies(&self, script: &DispatchedScript) -> Result<(), MissionError> {
        let ecosystem = Ecosystem::for_language(script.language);
        for name in &script.dependencies {
            match self.sandbox.install_dependency(ecosystem, name).await {
                Ok(true) => info!(package = %name, ecosystem = ecosystem.as_str(), "dependency installed"),
                Ok(false) => debug!(package = %name, "dependency already present"),
                Err(err) if err.is_recoverable() || err.code == SandboxErrorCode::Execution => {
                    warn!(package = %name, "dependency install failed: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn evaluate(&self, iteration: u32) -> Result<Verdict, MissionError> {
        info!(iteration, phase = Phase::Evaluating.as_str(), "evaluating mission");
        let system = prompts::evaluation_system_prompt(&self.mission);
        let request = prompts::evaluation_request(&self.mission, self.last_output().as_deref());
        let reply = self
            .completion
            .complete(&system, &self.history(request), CallMode::EvaluateMission)
            .await?;

        let verdict = match reply {
            CompletionReply::Tool(call) => Verdict::from_evaluation(
                text_field(&call.input, "evaluation"),
                text_field(&call.input, "reason"),
            ),
            CompletionReply::Text(text) => {
                warn!(iteration, "verdict arrived as free text");
                Verdict::Continue(text)
            }
        };
        match &verdict {
            Verdict::Complete(reason) => {
                println!("{reason}");
                println!("Mission Completed");
            }
            Verdict::Abandoned(reason) => {
                println!("{reason}");
                println!("Mission Aborted");
            }
            Verdict::Continue(reason) => println!("📃 {reason}"),
        }
        debug!(iteration, terminal = verdict.is_terminal(), "verdict received");
        Ok(verdict)
    }

    /// Most recent output, truncated; `None` while nothing has run.
    fn last_output(&self) -> Option<String> {
        match self.transactions.last() {
            Some(Transaction::Output(Some(text))) => {
                Some(omit_middle(text, self.settings.display_limit))
            }
            _ => None,
        }
    }

    /// Renders the log as alternating messages and replaces the final entry
    /// with `request`.
    fn history(&self, request: String) -> Vec<ChatMessage> {
        let mut messages = self
            .transactions
            .iter()
            .map(|entry| match entry {
                Transaction::Code(code) => ChatMessage::assistant(prompts::code_message(code)),
                Transaction::Output(output) => {
                    let shown = output
                        .as_deref()
                        .map(|text| omit_middle(text, self.settings.display_limit));
                    ChatMessage::user(prompts::output_message(shown.as_deref()))
                }
            })
            .collect::<Vec<_>>();
        if messages.len() > 1 {
            messages[0].content = prompts::FIRST_STEP_PLACEHOLDER.to_owned();
        }
        match messages.last_mut() {
            Some(last) => *last = ChatMessage::user(request),
            None => messages.push(ChatMessage::user(request)),
        }
        messages
    }
}

/// Keeps the first and last `limit / 2` characters of `text` (trimmed) with
/// an omission marker between them.
pub fn omit_middle(text: &str, limit: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= limit {
        return text.to_owned();
    }
    let half = limit / 2;
    let head = text.chars().take(half).collect::<String>();
    let tail = text.chars().skip(count - half).collect::<String>();
    format!("{head}{OMISSION_MARKER}{tail}").trim().to_owned()
}

pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").expect("valid regex"))
        .replace_all(text, "")
        .into_owned()
}

fn tidy_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn reply_text(reply: CompletionReply) -> String {
    match reply {
        CompletionReply::Text(text) => text,
        CompletionReply::Tool(call) => call.input.to_string(),
    }
}

fn text_field<'v>(input: &'v Value, field: &str) -> &'v str {
    input.get(field).and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::completion::ToolInvocation;
    use crate::config::SandboxBackend;
    use crate::sandbox::{ensure_safe_command, DependencyRegistry, SandboxResult};

    struct ScriptedCompletion {
        action: ToolInvocation,
        verdicts: Mutex<VecDeque<&'static str>>,
        calls: Mutex<Vec<(CallMode, Vec<ChatMessage>)>>,
    }

    impl ScriptedCompletion {
        fn new(action: ToolInvocation, verdicts: &[&'static str]) -> Self {
            Self {
                action,
                verdicts: Mutex::new(verdicts.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn count(&self, mode: CallMode) -> usize {
            self.calls
                .lock()
                .expect("calls")
                .iter()
                .filter(|(seen, _)| *seen == mode)
                .count()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedCompletion {
        async fn complete(
            &self,
            _system_prompt: &str,
            messages: &[ChatMessage],
            mode: CallMode,
        ) -> Result<CompletionReply, CompletionError> {
            self.calls
                .lock()
                .expect("calls")
                .push((mode, messages.to_vec()));
            let reply = match mode {
                CallMode::Retrospective => CompletionReply::Text("  listed the data folder \n\n".to_owned()),
                CallMode::NextTask => CompletionReply::Text("List the data folder.".to_owned()),
                CallMode::GenerateAction => CompletionReply::Tool(self.action.clone()),
                CallMode::EvaluateMission => {
                    let evaluation = self
                        .verdicts
                        .lock()
                        .expect("verdicts")
                        .pop_front()
                        .unwrap_or("NOTSOLVED");
                    CompletionReply::Tool(ToolInvocation {
                        name: "completion_verdict".to_owned(),
                        input: json!({ "evaluation": evaluation, "reason": format!("judged {evaluation}") }),
                    })
                }
            };
            Ok(reply)
        }
    }

    #[derive(Default)]
    struct FakeSandbox {
        runs: Mutex<Vec<(ScriptLanguage, String)>>,
        outputs: Mutex<VecDeque<SandboxResult<ProcessOutput>>>,
        registry: Mutex<DependencyRegistry>,
        installs: Mutex<Vec<String>>,
    }

    impl FakeSandbox {
        fn with_outputs(outputs: Vec<SandboxResult<ProcessOutput>>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn backend(&self) -> SandboxBackend {
            SandboxBackend::Container
        }

        async fn start(&self) -> SandboxResult<()> {
            Ok(())
        }

        async fn run_command(
            &self,
            command: &str,
            _sink: Option<&dyn OutputSink>,
        ) -> SandboxResult<ProcessOutput> {
            ensure_safe_command(command)?;
            Ok(ProcessOutput::default())
        }

        async fn run_script(
            &self,
            language: ScriptLanguage,
            code: &str,
            _sink: Option<&dyn OutputSink>,
        ) -> SandboxResult<ProcessOutput> {
            self.runs
                .lock()
                .expect("runs")
                .push((language, code.to_owned()));
            self.outputs
                .lock()
                .expect("outputs")
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(ProcessOutput {
                        stdout: "\u{1b}[32mdone\u{1b}[0m".to_owned(),
                        ..ProcessOutput::default()
                    })
                })
        }

        async fn install_dependency(&self, ecosystem: Ecosystem, name: &str) -> SandboxResult<bool> {
            let mut registry = self.registry.lock().expect("registry");
            if DependencyRegistry::key(name).is_none() || registry.contains(ecosystem, name) {
                return Ok(false);
            }
            registry.mark_installed(ecosystem, name);
            self.installs.lock().expect("installs").push(name.to_owned());
            Ok(true)
        }

        async fn import_folder(&self, _local: &Path) -> SandboxResult<()> {
            Ok(())
        }

        async fn export_folder(&self, _remote: Option<&str>, _local: &Path) -> SandboxResult<()> {
            Ok(())
        }

        async fn stop(&self) -> SandboxResult<()> {
            Ok(())
        }
    }

    fn run_command_call(command: &str) -> ToolInvocation {
        ToolInvocation {
            name: "run_command".to_owned(),
            input: json!({ "command": command }),
        }
    }

    fn settings(max_iterations: u32) -> MissionSettings {
        MissionSettings {
            max_iterations,
            display_limit: 1024,
        }
    }

    #[test]
    fn verdict_keeps_only_uppercase_letters() {
        assert_eq!(
            Verdict::from_evaluation("✅ENDOFMISSION", "done"),
            Verdict::Complete("done".to_owned())
        );
        assert_eq!(
            Verdict::from_evaluation("end of mission", "lower"),
            Verdict::Continue("lower".to_owned())
        );
        assert_eq!(
            Verdict::from_evaluation("ENDOFMISSION!!", "loud"),
            Verdict::Complete("loud".to_owned())
        );
        assert_eq!(
            Verdict::from_evaluation("GIVE UP THE MISSION", "stuck"),
            Verdict::Abandoned("stuck".to_owned())
        );
        assert!(!Verdict::from_evaluation("NOTSOLVED", "").is_terminal());
    }

    #[test]
    fn omit_middle_keeps_head_and_tail() {
        assert_eq!(omit_middle("  short  ", 10), "short");
        let text = format!("{}{}{}", "a".repeat(5), "m".repeat(100), "z".repeat(5));
        assert_eq!(
            omit_middle(&text, 10),
            format!("aaaaa{OMISSION_MARKER}zzzzz")
        );
        let wide = "가".repeat(30);
        assert_eq!(omit_middle(&wide, 4).chars().filter(|c| *c == '가').count(), 4);
    }

    #[test]
    fn ansi_sequences_are_removed() {
        assert_eq!(strip_ansi("\u{1b}[1;31merror\u{1b}[0m plain"), "error plain");
        assert_eq!(strip_ansi("\u{1b}[2Kprogress"), "progress");
    }

    #[tokio::test]
    async fn ceiling_stops_after_exact_number_of_rounds() {
        let completion = ScriptedCompletion::new(run_command_call("ls"), &[]);
        let sandbox = FakeSandbox::default();
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller = MissionController::new(
            "count the files",
            &completion,
            &sandbox,
            &dispatcher,
            &tools,
            settings(3),
        );

        let outcome = controller.run().await.expect("mission");
        assert_eq!(outcome, MissionOutcome::IterationLimit { iterations: 3 });
        assert_eq!(sandbox.runs.lock().expect("runs").len(), 3);
        assert_eq!(completion.count(CallMode::EvaluateMission), 3);
        assert_eq!(completion.count(CallMode::Retrospective), 2);
        assert_eq!(controller.transactions().len(), 7);
        assert_eq!(
            controller.transactions().last(),
            Some(&Transaction::Output(Some("done".to_owned())))
        );
    }

    #[tokio::test]
    async fn complete_verdict_ends_the_loop() {
        let completion = ScriptedCompletion::new(run_command_call("ls"), &["NOTSOLVED", "✅ENDOFMISSION"]);
        let sandbox = FakeSandbox::default();
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller = MissionController::new(
            "count the files",
            &completion,
            &sandbox,
            &dispatcher,
            &tools,
            settings(0),
        );

        let outcome = controller.run().await.expect("mission");
        assert_eq!(
            outcome,
            MissionOutcome::Completed {
                iterations: 2,
                reason: "judged ✅ENDOFMISSION".to_owned()
            }
        );
        let calls = completion.calls.lock().expect("calls");
        let second_action = calls
            .iter()
            .filter(|(mode, _)| *mode == CallMode::GenerateAction)
            .nth(1)
            .map(|(_, messages)| messages.clone())
            .expect("second action request");
        assert_eq!(second_action[0].content, prompts::FIRST_STEP_PLACEHOLDER);
        let request = &second_action.last().expect("request").content;
        assert!(request.contains("EVALUATION OF THE PREVIOUS TASKS:\njudged NOTSOLVED"));
        assert!(request.contains("DID SO FAR:\nlisted the data folder\n"));
    }

    #[tokio::test]
    async fn abandoned_verdict_is_terminal() {
        let completion = ScriptedCompletion::new(run_command_call("ls"), &["GIVEUPTHEMISSION"]);
        let sandbox = FakeSandbox::default();
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller =
            MissionController::new("m", &completion, &sandbox, &dispatcher, &tools, settings(5));

        let outcome = controller.run().await.expect("mission");
        assert!(matches!(outcome, MissionOutcome::Abandoned { iterations: 1, .. }));
        assert_eq!(outcome.iterations(), 1);
    }

    #[tokio::test]
    async fn evaluation_history_renders_empty_output_as_placeholder() {
        let completion = ScriptedCompletion::new(run_command_call("ls"), &[]);
        let sandbox = FakeSandbox::default();
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller =
            MissionController::new("m", &completion, &sandbox, &dispatcher, &tools, settings(1));
        controller.transactions = vec![
            Transaction::Output(None),
            Transaction::Code("A".to_owned()),
            Transaction::Output(Some(String::new())),
            Transaction::Code("B".to_owned()),
            Transaction::Output(Some("X".to_owned())),
        ];

        let request =
            prompts::evaluation_request("m", controller.last_output().as_deref());
        let messages = controller.history(request);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].content, prompts::FIRST_STEP_PLACEHOLDER);
        assert_eq!(messages[1].content, prompts::code_message("A"));
        assert!(messages[2].content.starts_with("No output."));
        assert!(!messages[2].content.contains("```shell\n$ node code.js\n\n```"));
        let last = &messages[4];
        assert_eq!(last.role, crate::completion::Role::User);
        assert!(last.content.contains("Output of the Execution\n```shell\n$ node code.js\nX\n```"));
        assert!(last.content.contains("mission completion"));
    }

    #[tokio::test]
    async fn long_outputs_are_truncated_in_every_message() {
        let completion = ScriptedCompletion::new(run_command_call("ls"), &[]);
        let sandbox = FakeSandbox::default();
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller = MissionController::new(
            "m",
            &completion,
            &sandbox,
            &dispatcher,
            &tools,
            MissionSettings {
                max_iterations: 1,
                display_limit: 8,
            },
        );
        controller.transactions = vec![
            Transaction::Output(None),
            Transaction::Code("A".to_owned()),
            Transaction::Output(Some("0123456789abcdef".to_owned())),
            Transaction::Code("B".to_owned()),
            Transaction::Output(Some("fedcba9876543210".to_owned())),
        ];

        let messages = controller.history("request".to_owned());
        assert!(messages[2].content.contains("0123"));
        assert!(messages[2].content.contains("middle part omitted"));
        assert!(!messages[2].content.contains("0123456789abcdef"));
        assert_eq!(
            controller.last_output().as_deref(),
            Some(format!("fedc{OMISSION_MARKER}3210").as_str())
        );
    }

    #[tokio::test]
    async fn rejected_command_becomes_failed_output_and_is_still_evaluated() {
        let completion = ScriptedCompletion::new(run_command_call("ls"), &[]);
        let sandbox = FakeSandbox::with_outputs(vec![Err(SandboxError::new(
            SandboxErrorCode::UnsafeCommand,
            "command must not contain double quotes",
        ))]);
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller =
            MissionController::new("m", &completion, &sandbox, &dispatcher, &tools, settings(1));

        controller.run().await.expect("mission");
        assert_eq!(completion.count(CallMode::EvaluateMission), 1);
        match controller.transactions().last() {
            Some(Transaction::Output(Some(output))) => {
                assert!(output.starts_with(FAILURE_MARKER));
                assert!(output.contains("double quotes"));
            }
            other => panic!("unexpected last transaction: {other:?}"),
        }
    }

    #[tokio::test]
    async fn provisioning_errors_abort_the_mission() {
        let completion = ScriptedCompletion::new(run_command_call("ls"), &[]);
        let sandbox = FakeSandbox::with_outputs(vec![Err(SandboxError::not_started())]);
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller =
            MissionController::new("m", &completion, &sandbox, &dispatcher, &tools, settings(3));

        let err = controller.run().await.expect_err("not started");
        assert!(matches!(
            err,
            MissionError::Sandbox(SandboxError {
                code: SandboxErrorCode::NotStarted,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn dependencies_are_installed_once_per_sandbox() {
        let action = ToolInvocation {
            name: "generate_nodejs_code".to_owned(),
            input: json!({
                "nodejs_code": "```javascript\nconsole.log(require('lodash').VERSION);\n```",
                "npm_package_list": ["lodash", " Lodash "]
            }),
        };
        let completion = ScriptedCompletion::new(action, &[]);
        let sandbox = FakeSandbox::default();
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller =
            MissionController::new("m", &completion, &sandbox, &dispatcher, &tools, settings(2));

        controller.run().await.expect("mission");
        assert_eq!(*sandbox.installs.lock().expect("installs"), vec!["lodash".to_owned()]);
        let runs = sandbox.runs.lock().expect("runs");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].1, "console.log(require('lodash').VERSION);");
    }

    #[tokio::test]
    async fn pending_validation_skips_planning() {
        let completion = ScriptedCompletion::new(run_command_call("ls"), &["ENDOFMISSION"]);
        let sandbox = FakeSandbox::default();
        let dispatcher = Dispatcher::new().expect("dispatcher");
        let tools = ToolRegistry::empty();
        let mut controller =
            MissionController::new("m", &completion, &sandbox, &dispatcher, &tools, settings(0));
        controller.pending_validation = Some("console.log('check');".to_owned());

        let outcome = controller.run().await.expect("mission");
        assert_eq!(outcome.iterations(), 1);
        assert_eq!(completion.count(CallMode::NextTask), 0);
        assert_eq!(completion.count(CallMode::GenerateAction), 0);
        assert_eq!(
            controller.transactions()[1],
            Transaction::Code("console.log('check');".to_owned())
        );
    }
}
