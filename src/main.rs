mod completion;
mod config;
mod dispatch;
mod mission;
mod process;
mod prompts;
mod runtime;
mod sandbox;
mod tool_registry;
mod transfer;
mod workspace;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use config::{Config, SandboxBackend};
use mission::MissionOutcome;
use runtime::{AgentRuntime, MissionRequest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workspace::AppPaths;

const USAGE: &str = "usage: mission-agent \"<mission|mission-file>\" [data-source-path] [data-output-path]";

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Autonomous mission agent that plans, runs and checks code in a sandbox",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "MISSION_AGENT_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,

    /// Mission text, or a path to a file holding it.
    mission: Option<String>,

    /// Folder whose contents are copied into the sandbox.
    source: Option<String>,

    /// Where the sandbox's final working folder is saved.
    output: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Print the version and exit.
    Version,
    /// Persist one configuration key.
    Config { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    match cli.command {
        Some(CliCommand::Version) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(CliCommand::Config { key, value }) => {
            let paths = AppPaths::from_home()?;
            Config::set_key(&paths.config_file(), &key, &value)?;
            println!("{key} saved");
            Ok(())
        }
        None => match cli.mission {
            Some(mission) => run_mission(mission, cli.source, cli.output).await,
            None => bail!(USAGE),
        },
    }
}

async fn run_mission(
    mission_arg: String,
    source_arg: Option<String>,
    output_arg: Option<String>,
) -> Result<()> {
    let paths = AppPaths::from_home()?;
    let config = Config::load(&paths.config_file())?;
    paths.ensure_workspace()?;

    let source_given = source_arg.is_some();
    let source = match source_arg.as_deref() {
        Some(raw) => workspace::absolutize(raw)?,
        None => workspace::prepare_output_dir(&paths.scratch_source(), false, true)?,
    };
    let export_dir = workspace::prepare_output_dir(&paths.scratch_output(), false, true)?;
    let explicit_output = output_arg
        .as_deref()
        .map(workspace::absolutize)
        .transpose()?;

    workspace::validate_path(&source.to_string_lossy(), "data source path")?;
    workspace::validate_path(&export_dir.to_string_lossy(), "data output path")?;
    if let Some(output) = &explicit_output {
        workspace::validate_path(&output.to_string_lossy(), "data output path")?;
    }
    if config.backend() == SandboxBackend::Container {
        workspace::validate_path(&config.docker_work_dir, "docker work dir")?;
    }

    let runtime = AgentRuntime::new(config.clone(), paths)?;
    let mission = workspace::resolve_mission_text(&mission_arg)?;
    workspace::validate_source_dir(&source)?;
    println!("Mission: {mission}");

    let request = MissionRequest {
        mission,
        source: source.clone(),
        export_dir: export_dir.clone(),
    };
    let result = runtime.run(&request).await;

    if !source_given {
        workspace::remove_if_empty(&[&source]);
    }
    if explicit_output.is_none() {
        workspace::remove_if_empty(&[&export_dir]);
    }
    let outcome = result?;
    if let MissionOutcome::IterationLimit { iterations } = outcome {
        println!("Mission stopped after {iterations} iterations without a verdict");
    }

    if export_dir.exists() {
        let cwd = std::env::current_dir()?;
        let (candidate, overwrite) = output_candidate(
            explicit_output,
            source_given.then_some(source.as_path()),
            &cwd,
            config.overwrite_output_dir,
        );
        let target = workspace::prepare_output_dir(&candidate, overwrite, false)?;
        workspace::move_dir(&export_dir, &target)?;
        info!(target = %target.display(), "output relocated");
        println!("Output saved to {}", target.display());
    } else {
        warn!("sandbox produced no output files");
    }
    Ok(())
}

/// Final output location and whether an existing folder there may be
/// replaced. Only an explicit output path honours `overwriteOutputDir`;
/// otherwise a fresh `_N` sibling of the source (or of `./output`) is used.
fn output_candidate(
    explicit: Option<PathBuf>,
    source: Option<&Path>,
    cwd: &Path,
    overwrite: bool,
) -> (PathBuf, bool) {
    match (explicit, source) {
        (Some(explicit), _) => (explicit, overwrite),
        (None, Some(source)) => (source.to_path_buf(), false),
        (None, None) => (cwd.join("output"), false),
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
