//! url-checker CLI entry point.
//!
//! Runs the guest predicates over URLs given on the command line and prints
//! one result per URL.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use url_checker_common::{CheckerConfig, CheckerError, ConfigFile, EngineKind, LoggingConfig};
use url_checker_core::Checker;

const DEFAULT_LOG_FILTER: &str = "info,url_checker=debug";

#[derive(Debug, Parser)]
#[command(name = "url-checker", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "URL_CHECKER_CONFIG")]
    config: Option<PathBuf>,

    /// Engine backend (wasmtime or wasmi)
    #[arg(long, env = "URL_CHECKER_ENGINE")]
    engine: Option<EngineKind>,

    /// Guest `.wasm` file; defaults to the embedded guest
    #[arg(long, env = "URL_CHECKER_GUEST")]
    guest: Option<PathBuf>,

    /// Give up on the whole run after this many milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Print results as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Is each URL accepted by the guest's URL model?
    Validity(Urls),
    /// Would round-tripping each URL's query items change it?
    Modifiability(Urls),
    /// Run both checks.
    Both(Urls),
}

impl Command {
    fn into_parts(self) -> (Mode, Vec<String>) {
        match self {
            Command::Validity(args) => (Mode::Validity, args.urls),
            Command::Modifiability(args) => (Mode::Modifiability, args.urls),
            Command::Both(args) => (Mode::Both, args.urls),
        }
    }
}

#[derive(Debug, Args)]
struct Urls {
    /// URLs to check
    #[arg(required = true)]
    urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Validity,
    Modifiability,
    Both,
}

impl Mode {
    fn validity(self) -> bool {
        matches!(self, Mode::Validity | Mode::Both)
    }

    fn modifiability(self) -> bool {
        matches!(self, Mode::Modifiability | Mode::Both)
    }
}

#[derive(Debug, Default, Serialize)]
struct UrlReport {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modifiable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let file = match load_config(cli.config.as_ref()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("url-checker: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&file.logging);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cli, file.checker));

    // A guest stuck past the deadline must not keep the process alive
    runtime.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Run failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ConfigFile> {
    match path {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(ConfigFile::default()),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        logging
            .filter
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER)
            .into()
    });

    let registry = tracing_subscriber::registry().with(filter);

    // Results go to stdout; logs stay on stderr
    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Returns `Ok(false)` if any URL could not be checked.
async fn run(cli: Cli, mut config: CheckerConfig) -> anyhow::Result<bool> {
    if let Some(kind) = cli.engine {
        config.engine.kind = kind;
    }
    if let Some(path) = cli.guest {
        config.guest.path = Some(path);
    }
    let (mode, urls) = cli.command.into_parts();

    info!(engine = %config.engine.kind, urls = urls.len(), "Starting checks");

    let timeout = Duration::from_millis(cli.timeout_ms);
    let task = tokio::task::spawn_blocking(move || run_checks(&config, mode, &urls));

    let reports = tokio::time::timeout(timeout, task)
        .await
        .with_context(|| format!("Checks did not finish within {} ms", cli.timeout_ms))?
        .context("Check task panicked")??;

    let mut all_checked = true;
    for report in &reports {
        all_checked &= report.error.is_none();
        if cli.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            println!("{}", format_report(report));
        }
    }

    Ok(all_checked)
}

/// Check every URL, replacing the checker after a fatal error.
fn run_checks(
    config: &CheckerConfig,
    mode: Mode,
    urls: &[String],
) -> anyhow::Result<Vec<UrlReport>> {
    let mut checker = Checker::from_config(config).context("Failed to start guest")?;
    let mut reports = Vec::with_capacity(urls.len());

    for url in urls {
        let mut report = UrlReport {
            url: url.clone(),
            ..Default::default()
        };

        if let Err(e) = check_one(&mut checker, mode, &mut report) {
            warn!(url = %url, error = %e, "Check failed");
            if e.is_fatal() {
                checker = restart(checker, config)?;
            }
            report.error = Some(e.to_string());
        }

        reports.push(report);
    }

    checker.close();
    Ok(reports)
}

fn check_one(
    checker: &mut Checker,
    mode: Mode,
    report: &mut UrlReport,
) -> Result<(), CheckerError> {
    if mode.validity() {
        report.valid = Some(checker.check_validity(&report.url)?);
    }
    if mode.modifiability() {
        report.modifiable = Some(checker.check_modifiability(&report.url)?);
    }
    Ok(())
}

/// Discard `checker` and bootstrap a fresh instance from the same engine.
fn restart(checker: Checker, config: &CheckerConfig) -> anyhow::Result<Checker> {
    let engine = checker
        .engine()
        .cloned()
        .context("Checker has no engine to restart from")?;
    checker.close();

    Ok(Checker::new(engine, &config.execution)
        .context("Failed to restart guest")?
        .with_encoding(config.guest.encoding))
}

fn format_report(report: &UrlReport) -> String {
    let mut line = report.url.clone();
    if let Some(valid) = report.valid {
        line.push_str(&format!("\tvalid={valid}"));
    }
    if let Some(modifiable) = report.modifiable {
        line.push_str(&format!("\tmodifiable={modifiable}"));
    }
    if let Some(error) = &report.error {
        line.push_str(&format!("\terror={error}"));
    }
    line
}
