mod formatting;
mod shell;

use clap::{Parser, Subcommand};
use debloat_core::{DebloatConfig, DebloatError, RunOutcome, ScriptCommand, SystemPrivileges};
use formatting::{app_row, exit_code_of, option_row, outcome_label, run_summary};
use serde::Serialize;
use serde_json::{Value, json};
use shell::{Shell, ShellError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Front-end for the Win11Debloat script", long_about = None)]
struct Cli {
    /// Settings document to load and save.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// App list toggle file.
    #[arg(long, global = true)]
    app_list: Option<PathBuf>,
    /// PowerShell script to invoke.
    #[arg(long, global = true)]
    script: Option<PathBuf>,
    /// Program to run directly instead of the PowerShell script.
    #[arg(long, global = true, conflicts_with = "script")]
    command: Option<PathBuf>,
    /// How long a cancelled run gets before it is killed (e.g. "3s").
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    cancel_grace: Option<Duration>,
    /// Emit a JSON envelope instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command_kind: ShellCommand,
}

#[derive(Subcommand, Debug)]
enum ShellCommand {
    /// List all options with their current values.
    Options,
    /// Set an option and save the settings.
    Set {
        name: String,
        #[arg(action = clap::ArgAction::Set)]
        value: bool,
    },
    /// Restore default option values and save the settings.
    Reset,
    /// List the removable applications.
    Apps,
    /// Flip whether an application is kept.
    ToggleApp { name: String },
    /// Run the debloat script with the enabled options.
    Run {
        /// Run with exactly these options instead of the saved selection.
        #[arg(long = "only", value_name = "OPTION")]
        only: Vec<String>,
        /// Cancel the run once it has taken this long (e.g. "10m").
        #[arg(long, value_parser = humantime::parse_duration)]
        cancel_after: Option<Duration>,
    },
    /// Launch the app configurator (administrators only).
    Configurator,
}

/// Raised by Ctrl-C; an active run is cancelled through its controller.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Serialize)]
struct ShellResponse {
    status: ResponseStatus,
    message: Option<String>,
    data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    notices: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug)]
struct CommandOutcome {
    message: Option<String>,
    data: Option<Value>,
    exit_code: i32,
}

impl CommandOutcome {
    fn message(message: impl Into<String>) -> Self {
        CommandOutcome {
            message: Some(message.into()),
            data: None,
            exit_code: 0,
        }
    }

    fn with(message: Option<String>, data: Value) -> Self {
        CommandOutcome {
            message,
            data: Some(data),
            exit_code: 0,
        }
    }
}

fn error_exit_code(err: &ShellError) -> i32 {
    match err {
        ShellError::InvalidOptionName(_) => 2,
        ShellError::WorkerLost => 1,
        ShellError::Core(core) => match core {
            DebloatError::Persistence { .. } | DebloatError::SettingsFormat { .. } => 3,
            DebloatError::ResourceUnavailable { .. } | DebloatError::ReadFailed { .. } => 4,
            DebloatError::WriteFailed { .. } => 5,
            DebloatError::UnknownEntry(_) => 6,
            DebloatError::AlreadyRunning | DebloatError::NotRunning => 7,
            DebloatError::Launch { .. } => 8,
            DebloatError::PermissionDenied(_) => 9,
        },
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = cli.json;

    let mut shell = Shell::open(resolve_config(&cli));
    let notices = shell.notices().to_vec();
    if !json_mode {
        for notice in &notices {
            eprintln!("{notice}");
        }
    }

    let (response, exit_code) = respond(execute(&mut shell, cli), notices);
    emit_and_exit(response, json_mode, exit_code);
}

fn respond(result: Result<CommandOutcome, ShellError>, notices: Vec<String>) -> (ShellResponse, i32) {
    match result {
        Ok(outcome) => (
            ShellResponse {
                status: ResponseStatus::Ok,
                message: outcome.message,
                data: outcome.data,
                notices,
            },
            outcome.exit_code,
        ),
        Err(err) => (
            ShellResponse {
                status: ResponseStatus::Error,
                message: Some(err.to_string()),
                data: None,
                notices,
            },
            error_exit_code(&err),
        ),
    }
}

fn install_interrupt_handler() {
    let installed = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            tracing::warn!("already cancelling; waiting for the script to stop");
        }
    });
    if let Err(err) = installed {
        tracing::warn!(error = %err, "Ctrl-C will not cancel the run");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn emit_and_exit(response: ShellResponse, json_mode: bool, exit_code: i32) -> ! {
    if json_mode {
        let output = serde_json::to_string(&response).unwrap_or_else(|_| {
            "{\"status\":\"error\",\"message\":\"failed to serialize response\"}".to_string()
        });
        println!("{output}");
    } else if let Some(message) = response.message {
        match response.status {
            ResponseStatus::Ok => println!("{message}"),
            ResponseStatus::Error => eprintln!("error: {message}"),
        }
    }
    std::process::exit(exit_code);
}

fn resolve_config(cli: &Cli) -> DebloatConfig {
    let mut config = DebloatConfig::from_env();
    if let Some(path) = &cli.settings {
        config.settings_path = path.clone();
    }
    if let Some(path) = &cli.app_list {
        config.app_list_path = path.clone();
    }
    if let Some(program) = &cli.command {
        config.script = ScriptCommand::new(program, Vec::<String>::new());
    } else if let Some(script) = &cli.script {
        config.script = ScriptCommand::powershell(script);
    }
    if let Some(grace) = cli.cancel_grace {
        config.cancel_grace = grace;
    }
    config
}

fn execute(shell: &mut Shell, cli: Cli) -> Result<CommandOutcome, ShellError> {
    match cli.command_kind {
        ShellCommand::Options => list_options(shell, cli.json),
        ShellCommand::Set { name, value } => {
            shell.set_option(&name, value)?;
            Ok(CommandOutcome::message(format!("{name} set to {value}; settings saved.")))
        }
        ShellCommand::Reset => {
            shell.reset_options()?;
            Ok(CommandOutcome::message("Defaults restored; settings saved."))
        }
        ShellCommand::Apps => list_apps(shell, cli.json),
        ShellCommand::ToggleApp { name } => {
            let keep = shell.toggle_app(&name)?;
            let verdict = if keep { "kept" } else { "removed" };
            Ok(CommandOutcome::message(format!("{name} will be {verdict}.")))
        }
        ShellCommand::Run { only, cancel_after } => {
            let only = (!only.is_empty()).then_some(only);
            install_interrupt_handler();
            run(shell, only, cancel_after, cli.json)
        }
        ShellCommand::Configurator => {
            let pid = shell.launch_configurator(&SystemPrivileges)?;
            Ok(CommandOutcome::with(
                Some(format!("App configurator launched (pid {pid}).")),
                json!({ "pid": pid }),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
struct OptionSnapshot {
    name: &'static str,
    label: &'static str,
    group: &'static str,
    enabled: bool,
    default: bool,
}

fn list_options(shell: &Shell, json_mode: bool) -> Result<CommandOutcome, ShellError> {
    let rows = shell.options();
    if json_mode {
        let snapshots: Vec<OptionSnapshot> = rows
            .iter()
            .map(|(spec, enabled)| OptionSnapshot {
                name: spec.name,
                label: spec.label,
                group: spec.group.title(),
                enabled: *enabled,
                default: spec.default,
            })
            .collect();
        return Ok(CommandOutcome::with(None, json!(snapshots)));
    }

    let mut current_group = None;
    for (spec, enabled) in &rows {
        if current_group != Some(spec.group) {
            println!("{}", spec.group.title());
            current_group = Some(spec.group);
        }
        println!("{}", option_row(spec, *enabled));
    }
    Ok(CommandOutcome::message(format!(
        "{} of {} options enabled",
        shell.enabled_options().len(),
        rows.len()
    )))
}

#[derive(Debug, Serialize)]
struct AppSnapshot {
    name: String,
    keep: bool,
}

fn list_apps(shell: &Shell, json_mode: bool) -> Result<CommandOutcome, ShellError> {
    let view = shell.apps()?;
    if json_mode {
        let snapshots: Vec<AppSnapshot> = view
            .entries
            .into_iter()
            .map(|entry| AppSnapshot {
                name: entry.name,
                keep: entry.keep,
            })
            .collect();
        return Ok(CommandOutcome::with(view.notice, json!(snapshots)));
    }

    for entry in &view.entries {
        println!("{}", app_row(entry));
    }
    Ok(CommandOutcome::message(view.notice.unwrap_or_else(|| {
        let removed = view.entries.iter().filter(|entry| !entry.keep).count();
        format!("{removed} of {} apps marked for removal", view.entries.len())
    })))
}

#[derive(Debug, Serialize)]
struct RunSnapshot {
    run_id: u64,
    outcome: &'static str,
    exit_code: Option<i32>,
    elapsed_ms: u128,
    output: Vec<String>,
}

fn run(
    shell: &Shell,
    only: Option<Vec<String>>,
    cancel_after: Option<Duration>,
    json_mode: bool,
) -> Result<CommandOutcome, ShellError> {
    let mut captured = Vec::new();
    if !json_mode {
        println!("Starting debloat process...");
    }
    let report = shell.run(only, cancel_after, &INTERRUPTED, |line| {
        if json_mode {
            captured.push(line.to_string());
        } else {
            println!("{line}");
        }
    })?;

    let exit_code = match report.outcome {
        RunOutcome::Success => 0,
        RunOutcome::Cancelled => 130,
        RunOutcome::Failed(_) => 1,
    };
    let snapshot = RunSnapshot {
        run_id: report.run_id,
        outcome: outcome_label(&report.outcome),
        exit_code: exit_code_of(&report.outcome),
        elapsed_ms: report.elapsed.as_millis(),
        output: captured,
    };
    let data = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
    Ok(CommandOutcome {
        message: Some(run_summary(&report)),
        data: Some(data),
        exit_code,
    })
}
