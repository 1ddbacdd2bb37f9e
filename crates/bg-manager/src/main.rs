use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use bg_instance::InstanceMeta;
use chrono::Local;
use clap::{Args, Parser, Subcommand};

mod config;
mod error;
mod launch;
mod lifecycle;
mod liveness;
mod logs;
mod retention;
mod store;
mod supervisor;

use config::{DEFAULT_KEEP, DEFAULT_TAIL_LINES, Settings};
use error::{LifecycleResult, format_error_chain};
use launch::{HeadlessLauncher, LaunchStrategy, WindowedLauncher};
use lifecycle::{InstanceManager, InstanceView, StartRequest, StopOutcome};
use store::StateStore;

#[derive(Debug, Parser)]
#[command(name = "bg", version, about = "Run commands in the background and keep track of them")]
struct Cli {
    /// Base directory for instance state
    #[arg(long, global = true, env = "BG_HOME", value_name = "DIR")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a command under a name
    Start(StartArgs),
    /// Stop the active instance of a name
    Stop { name: String },
    /// Stop every active instance
    #[command(name = "stopall")]
    StopAll,
    /// Show active instances and a history summary
    List,
    /// Show details of the active instance of a name
    Status { name: String },
    /// Print the tail of the active instance's log
    Logs {
        name: String,
        #[arg(short = 'n', long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
        /// Keep printing lines as they are appended
        #[arg(short, long)]
        follow: bool,
    },
    /// List every recorded instance of a name
    History { name: String },
    /// Delete old instance directories
    Prune {
        /// Instances to keep per name, not counting the active one
        #[arg(long, default_value_t = DEFAULT_KEEP)]
        keep: usize,
    },
    #[command(name = launch::SUPERVISE_COMMAND, hide = true)]
    Supervise {
        #[arg(long)]
        log_file: PathBuf,
        #[arg(long)]
        cwd: PathBuf,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct StartArgs {
    name: String,
    /// Shell command line, quoted as one argument
    command: String,
    /// Working directory (defaults to the current one)
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Run headless with output captured to the log instead of opening a terminal window
    #[arg(short, long)]
    daemon: bool,
    /// Extra environment variable, KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.is_expected() {
                eprintln!("Error: {err}");
            } else {
                tracing::debug!(error = ?err, "command failed");
                eprintln!("Error: {}", format_error_chain(&err));
            }
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> LifecycleResult<()> {
    if let Commands::Supervise {
        log_file,
        cwd,
        command,
    } = &cli.command
    {
        let status = runtime()?.block_on(supervisor::run(log_file, cwd, &command.join(" ")))?;
        tracing::debug!(?status, "supervised command finished");
        return Ok(());
    }

    let settings = Settings::from_env(cli.home)?;
    let manager = InstanceManager::new(StateStore::new(settings.home.clone()));

    match cli.command {
        Commands::Start(args) => start(&manager, &settings, args),
        Commands::Stop { name } => {
            let outcome = manager.stop(&name)?;
            println!("{}", describe_stop(&name, &outcome));
            Ok(())
        }
        Commands::StopAll => stop_all(&manager),
        Commands::List => {
            list(&manager);
            Ok(())
        }
        Commands::Status { name } => {
            print_status(&manager.status(&name)?);
            Ok(())
        }
        Commands::Logs {
            name,
            lines,
            follow,
        } => print_logs(&manager, &settings, &name, lines, follow),
        Commands::History { name } => {
            history(&manager, &name);
            Ok(())
        }
        Commands::Prune { keep } => {
            prune(&manager, keep);
            Ok(())
        }
        Commands::Supervise { .. } => Ok(()),
    }
}

fn start(manager: &InstanceManager, settings: &Settings, args: StartArgs) -> LifecycleResult<()> {
    let cwd = match args.cwd {
        Some(p) => config::absolutize(&p),
        None => std::env::current_dir().context("read current directory")?,
    };
    let req = StartRequest {
        name: args.name,
        command: args.command,
        cwd,
        env: launch::parse_env_pairs(&args.env),
    };

    let launcher: Box<dyn LaunchStrategy> = if args.daemon {
        Box::new(HeadlessLauncher::current_exe()?)
    } else {
        Box::new(WindowedLauncher::new(settings.handshake, settings.terminal.clone()))
    };

    let started = manager.start(&req, launcher.as_ref())?;
    if let Some(w) = &started.warning {
        eprintln!("Warning: {w}");
    }

    let meta = &started.meta;
    println!("Started \"{}\" ({})", meta.name, meta.mode());
    println!("  PID:         {}", pid_label(meta));
    println!("  Instance ID: {}", meta.instance_id);
    println!("  Log file:    {}", meta.log_file.display());
    Ok(())
}

fn describe_stop(name: &str, outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::NotActive => format!("No active instance for \"{name}\"; nothing to stop"),
        StopOutcome::MetaMissing(id) => {
            format!("Metadata for {id} is missing; cleared active entry for \"{name}\"")
        }
        StopOutcome::NoPid(id) => {
            format!("No PID recorded for {id}; cleared active entry for \"{name}\"")
        }
        StopOutcome::NotRunning { pid } => {
            format!("\"{name}\" is not running (PID {pid}); cleared active entry")
        }
        StopOutcome::Stopped { pid } => format!("Stopped \"{name}\" (PID {pid})"),
        StopOutcome::ForceKilled { pid, term_error } => {
            format!("Stopped \"{name}\" (PID {pid}) with a forced kill after: {term_error}")
        }
    }
}

fn stop_all(manager: &InstanceManager) -> LifecycleResult<()> {
    let results = manager.stop_all();
    if results.is_empty() {
        println!("No active instances");
        return Ok(());
    }

    let mut failed = 0usize;
    for (name, res) in results {
        match res {
            Ok(outcome) => println!("{}", describe_stop(&name, &outcome)),
            Err(e) => {
                eprintln!("Failed to stop \"{name}\": {}", format_error_chain(&e));
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(anyhow::anyhow!("{failed} instance(s) could not be stopped").into());
    }
    Ok(())
}

fn pid_label(meta: &InstanceMeta) -> String {
    meta.tracked_pid()
        .map_or_else(|| "N/A".to_string(), |p| p.to_string())
}

fn started_label(meta: &InstanceMeta) -> String {
    meta.started_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn list(manager: &InstanceManager) {
    let report = manager.list();

    if report.active.is_empty() {
        println!("No active instances");
    } else {
        println!("Active instances:");
        let width = report.active.iter().map(|v| v.name.len()).max().unwrap_or(0);
        for view in &report.active {
            match &view.meta {
                Some(meta) => println!(
                    "  {:<width$}  {:<7}  PID {:<8}  {:<8}  {}",
                    view.name,
                    view.state,
                    pid_label(meta),
                    meta.mode(),
                    view.instance_id,
                ),
                None => println!(
                    "  {:<width$}  (metadata missing)  {}",
                    view.name, view.instance_id
                ),
            }
        }
    }

    if !report.history.is_empty() {
        println!();
        println!("History:");
        for (name, count) in &report.history {
            println!("  {name}: {count} instance(s)");
        }
    }
}

fn print_status(view: &InstanceView) {
    println!("Name:        {}", view.name);
    println!("Status:      {}", view.state);
    if let Some(meta) = &view.meta {
        println!("PID:         {}", pid_label(meta));
        println!("Mode:        {}", meta.mode());
        println!("Command:     {}", meta.command);
        println!("Cwd:         {}", meta.cwd.display());
        println!("Started:     {}", started_label(meta));
        println!("Instance ID: {}", view.instance_id);
        println!("Log file:    {}", meta.log_file.display());
    }
}

fn print_logs(
    manager: &InstanceManager,
    settings: &Settings,
    name: &str,
    lines: usize,
    follow: bool,
) -> LifecycleResult<()> {
    let path = manager.log_file(name)?;
    let (tail, offset) = logs::tail_lines(&path, lines)?;
    if tail.is_empty() && !follow {
        println!("(no log content)");
    }
    for line in &tail {
        println!("{line}");
    }
    if !follow {
        return Ok(());
    }

    let follower = logs::LogFollower::new(&path, offset);
    runtime()?.block_on(logs::follow_until_interrupt(
        follower,
        settings.follow_interval,
        |line| println!("{line}"),
    ))?;
    Ok(())
}

fn history(manager: &InstanceManager, name: &str) {
    let entries = manager.history(name);
    if entries.is_empty() {
        println!("No history for \"{name}\"");
        return;
    }

    println!("History for \"{name}\":");
    for entry in entries {
        let marker = if entry.active { '*' } else { ' ' };
        match &entry.meta {
            Some(meta) => println!(
                "{marker} {}  {}  {}",
                entry.instance_id,
                started_label(meta),
                meta.command
            ),
            None => println!("{marker} {}  (metadata missing)", entry.instance_id),
        }
    }
}

fn prune(manager: &InstanceManager, keep: usize) {
    let report = manager.prune(keep);
    for id in &report.deleted {
        println!("Deleted {id}");
    }
    for (id, err) in &report.failed {
        eprintln!("Failed to delete {id}: {err}");
    }
    if report.deleted.is_empty() {
        println!("Nothing to prune");
    } else {
        println!("Pruned {} instance(s)", report.deleted.len());
    }
}
