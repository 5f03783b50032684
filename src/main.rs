//! Cabletest CLI
//!
//! Runs a link-cable test against a relay device and reports whether the
//! console handshake was seen. Exit code 0 means the cable works.

use anyhow::Context;
use cabletest_core::cli::{print_exit_codes, CliResult, ExitCodes};
use cabletest_core::config::{self, AppConfig, TestConfiguration};
use cabletest_core::core::capture::{self, CaptureConfig};
use cabletest_core::core::logger::{generate_log_filename, LogEntry, LogFormat};
use cabletest_core::{CancellationToken, TestOutcome, TestSession};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON lines for scripting
    Json,
}

impl From<OutputFormat> for LogFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => LogFormat::Text,
            OutputFormat::Json => LogFormat::JsonLines,
        }
    }
}

/// Cabletest CLI
#[derive(Parser, Debug)]
#[command(
    name = "cabletest",
    author = "Cabletest Team",
    version,
    about = "Remote tester for Dreamcast serial link cables",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Write diagnostic traces to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "CABLETEST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a cable test against the relay
    Run {
        #[command(flatten)]
        test: TestArgs,

        /// Save the event log under the data directory
        #[arg(long)]
        save_log: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Capture a serial device into a file (runs on the relay)
    Capture {
        /// Serial device
        #[arg(short, long, default_value = "/dev/ttyUSB0")]
        device: String,

        /// Baud rate
        #[arg(short, long, default_value = "260416")]
        baud: u32,

        /// Capture file (appended to)
        #[arg(short, long, default_value = "/tmp/serial_data.txt")]
        output: PathBuf,

        /// Echo captured text to stdout
        #[arg(long)]
        echo: bool,
    },

    /// List available serial ports
    ListPorts,

    /// Print the exit code table
    ExitCodes,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration
    Show {
        #[command(flatten)]
        test: TestArgs,
    },
    /// Save the effective configuration
    Save {
        #[command(flatten)]
        test: TestArgs,
    },
    /// Print the config file path
    Path,
}

/// Overrides applied on top of the stored configuration
#[derive(Args, Debug, Default)]
struct TestArgs {
    /// Relay host address
    #[arg(short = 'H', long, env = "CABLETEST_HOST")]
    host: Option<String>,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// Login user
    #[arg(short, long)]
    user: Option<String>,

    /// Password (agent and default keys are tried when omitted)
    #[arg(short = 'P', long, env = "CABLETEST_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Serial device on the relay
    #[arg(short, long)]
    device: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Monitoring window (seconds)
    #[arg(long)]
    timeout: Option<u64>,

    /// Poll interval (milliseconds)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Connect timeout (seconds)
    #[arg(long)]
    connect_timeout: Option<u64>,
}

impl TestArgs {
    fn apply(&self, config: &mut TestConfiguration) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.session_port = port;
        }
        if let Some(user) = &self.user {
            config.username.clone_from(user);
        }
        if let Some(password) = &self.password {
            config.credential = Some(password.clone());
        }
        if let Some(device) = &self.device {
            config.serial_device_path.clone_from(device);
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(secs) = self.timeout {
            config.timing.monitor_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.poll_interval {
            config.timing.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_tracing(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(ExitCodes::ERROR);
        }
    };

    let result = match &cli.command {
        Commands::Run { test, save_log } => run_test(&cli, test, *save_log),
        Commands::Config { action } => handle_config(&cli, action),
        Commands::Capture { device, baud, output, echo } => {
            run_capture(&cli, device, *baud, output, *echo)
        }
        Commands::ListPorts => list_ports(&cli),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    };

    let result = result.unwrap_or_else(|e| CliResult::error(ExitCodes::ERROR, format!("{e:#}")));
    report(&cli, &result);
    result.to_exit_code()
}

/// Console traces go to stderr; event log lines are printed on stdout
/// separately, so their tracing mirror is only kept for `--log-file`.
fn init_tracing(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter_fn(|meta| meta.target() != "cabletest::events"));

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn load_config(cli: &Cli) -> Result<AppConfig, CliResult> {
    let loaded = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    loaded.map_err(CliResult::from)
}

fn effective_config(cli: &Cli, test: &TestArgs) -> Result<AppConfig, CliResult> {
    let mut app = load_config(cli)?;
    test.apply(&mut app.test);
    Ok(app)
}

fn run_test(cli: &Cli, test: &TestArgs, save_log: bool) -> anyhow::Result<CliResult> {
    let app = match effective_config(cli, test) {
        Ok(app) => app,
        Err(result) => return Ok(result),
    };
    let config = app.test;
    if let Err(e) = config.validate() {
        return Ok(CliResult::config_error(e.to_string()));
    }

    let mut session = TestSession::ssh();
    let log = session.log();
    let events = log.subscribe();

    if save_log {
        config::init_directories().context("Cannot create application directories")?;
        let dir = config::log_dir().context("Could not determine log directory")?;
        let path = dir.join(generate_log_filename("cabletest", app.log_format));
        log.start_file(path.clone(), app.log_format)
            .with_context(|| format!("Cannot open {}", path.display()))?;
        info!(path = %path.display(), "Saving event log");
    }

    if let Err(e) = session.start(config) {
        return Ok(CliResult::from(e));
    }
    debug!(id = %session.id(), "Session started");

    let token = session.cancellation_token();
    if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
        warn!(error = %e, "Ctrl-C handler not installed");
    }

    let format = LogFormat::from(cli.format);
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(entry) => print_entry(cli, &entry, format),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) if session.is_running() => {}
            Err(_) => break,
        }
    }
    for entry in events.try_iter() {
        print_entry(cli, &entry, format);
    }

    let outcome = session.wait().or_else(|| session.outcome());
    if let Some(path) = log.stop_file() {
        info!(path = %path.display(), "Event log saved");
    }

    Ok(match outcome {
        Some(outcome) => {
            if cli.format == OutputFormat::Json {
                print_outcome_json(&outcome);
            }
            CliResult::from(&outcome)
        }
        None => CliResult::error(ExitCodes::INTERNAL_ERROR, "Session ended without an outcome"),
    })
}

fn print_entry(cli: &Cli, entry: &LogEntry, format: LogFormat) {
    match format {
        LogFormat::Text if cli.quiet => {}
        LogFormat::Text if cli.verbose => println!("{}", entry.to_tagged_text()),
        _ => println!("{}", entry.format(format)),
    }
}

fn print_outcome_json(outcome: &TestOutcome) {
    let result = CliResult::from(outcome);
    let detection = match outcome {
        TestOutcome::Detected(event) => serde_json::to_value(event).unwrap_or_default(),
        _ => serde_json::Value::Null,
    };
    println!(
        "{}",
        serde_json::json!({
            "outcome": outcome.state().to_string(),
            "code": result.code(),
            "message": result.message(),
            "detection": detection,
        })
    );
}

fn handle_config(cli: &Cli, action: &ConfigAction) -> anyhow::Result<CliResult> {
    match action {
        ConfigAction::Show { test } => {
            let app = match effective_config(cli, test) {
                Ok(app) => app,
                Err(result) => return Ok(result),
            };
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&app)?),
                OutputFormat::Text => print!("{}", toml::to_string_pretty(&app)?),
            }
            Ok(CliResult::success())
        }
        ConfigAction::Save { test } => {
            let app = match effective_config(cli, test) {
                Ok(app) => app,
                Err(result) => return Ok(result),
            };
            let saved = match &cli.config {
                Some(path) => app.save_to(path).map(|()| path.clone()),
                None => app.save(),
            };
            Ok(match saved {
                Ok(path) => CliResult::success_with_message(format!("Saved {}", path.display())),
                Err(e) => CliResult::from(e),
            })
        }
        ConfigAction::Path => {
            match cli.config.clone().or_else(config::config_file) {
                Some(path) => println!("{}", path.display()),
                None => return Ok(CliResult::config_error("Could not determine config directory")),
            }
            Ok(CliResult::success())
        }
    }
}

fn run_capture(
    cli: &Cli,
    device: &str,
    baud: u32,
    output: &Path,
    echo: bool,
) -> anyhow::Result<CliResult> {
    let mut config = CaptureConfig::new(device, baud, output);
    config.echo = echo;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || token.cancel())?;

    if !cli.quiet && !echo {
        eprintln!("Capturing {device} at {baud} baud into {}", output.display());
    }

    Ok(match capture::run_capture(&config, &cancel) {
        Ok(stats) => {
            if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string(&stats)?);
            }
            CliResult::success_with_message(format!(
                "Captured {} bytes in {} chunks",
                stats.bytes_read, stats.chunks
            ))
        }
        Err(e) => CliResult::from(e),
    })
}

fn list_ports(cli: &Cli) -> anyhow::Result<CliResult> {
    let ports = match capture::list_ports() {
        Ok(ports) => ports,
        Err(e) => return Ok(CliResult::from(e)),
    };

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if ports.is_empty() && !cli.quiet {
                println!("No serial ports found.");
            }
            for port in &ports {
                println!("{} [{:?}]", port.port_name, port.port_type);
            }
        }
    }

    Ok(CliResult::success())
}

fn report(cli: &Cli, result: &CliResult) {
    if cli.format == OutputFormat::Json {
        if let CliResult::Error(code, msg) = result {
            eprintln!("{}", serde_json::json!({ "error": msg, "code": code }));
        }
        return;
    }
    match result {
        CliResult::Success(Some(msg)) if !cli.quiet => println!("{msg}"),
        CliResult::Error(_, msg) => eprintln!("Error: {msg}"),
        _ => {}
    }
}
