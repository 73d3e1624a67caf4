use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use strain_cli::{init_logging, HttpProbeFactory, LogFormat};
use strain_core::{Preset, RunConfig, StrainError};
use strain_engine::{
    ReportFormat, ReportWriter, RunControl, Runner, EXIT_CONFIGURATION, EXIT_RUNTIME_ERROR,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "strain")]
#[command(about = "Scenario-driven HTTP load generator", long_about = None)]
#[command(version)]
struct Cli {
    /// Run profile (YAML, TOML or JSON)
    #[arg(long, short, env = "STRAIN_PROFILE")]
    profile: PathBuf,

    /// Stage preset for ramping scenarios (smoke, load, stress, spike, seed, heavy-seed)
    #[arg(long, env = "STRAIN_PRESET")]
    preset: Option<Preset>,

    /// Base URL every request path is joined to
    #[arg(long, env = "STRAIN_BASE_URL")]
    base_url: Option<String>,

    /// Seed for reproducible action selection and template values
    #[arg(long, env = "STRAIN_SEED")]
    seed: Option<u64>,

    /// Write the report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Report file format (summary, markdown, json); guessed from the extension by default
    #[arg(long)]
    format: Option<ReportFormat>,

    /// Log output format
    #[arg(long, value_enum, env = "STRAIN_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Validate the profile and exit without generating traffic
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Load test failed");
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = RunConfig::load_layered(&cli.profile)
        .with_context(|| format!("failed to load profile {}", cli.profile.display()))?;

    if let Some(preset) = cli.preset {
        config.override_preset(preset);
    }
    if let Some(base_url) = cli.base_url {
        config.http.base_url = base_url;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }

    let factory = Arc::new(HttpProbeFactory::new(&config.http)?);
    let runner = Runner::new(config).with_probe_factory(factory);
    let prepared = runner.prepare()?;

    if cli.check {
        println!(
            "profile {} is valid: scenarios {:?}, {} thresholds",
            cli.profile.display(),
            prepared.scenario_names(),
            prepared.thresholds().len()
        );
        return Ok(0);
    }

    info!(
        profile = %cli.profile.display(),
        base_url = %runner.config().http.base_url,
        "Profile loaded"
    );
    tokio::spawn(watch_signals(runner.control()));

    let report = runner.execute(prepared).await?;
    let writer = ReportWriter::new(&report);
    println!("{}", writer.render(ReportFormat::Summary)?);

    if let Some(path) = &cli.report {
        let format = cli.format.unwrap_or_else(|| format_for(path));
        writer
            .write(path, format)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), ?format, "Report written");
    }

    Ok(report.exit_code())
}

fn format_for(path: &Path) -> ReportFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => ReportFormat::Json,
        Some("md") | Some("markdown") => ReportFormat::Markdown,
        _ => ReportFormat::Summary,
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<StrainError>() {
        Some(e) if e.is_configuration() => EXIT_CONFIGURATION,
        _ => EXIT_RUNTIME_ERROR,
    }
}

/// First SIGINT/SIGTERM stops the run gracefully, the second forces it.
async fn watch_signals(control: RunControl) {
    if !shutdown_signal().await {
        return;
    }
    info!("Received shutdown signal, stopping gracefully (repeat to force)");
    control.stop();

    if !shutdown_signal().await {
        return;
    }
    warn!("Received second shutdown signal, abandoning in-flight requests");
    control.kill();
}

/// Waits for SIGINT or SIGTERM. Returns `false` if no handler could be installed.
async fn shutdown_signal() -> bool {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Failed to install Ctrl+C handler");
                std::future::pending::<bool>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await.is_some(),
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<bool>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<bool>();

    tokio::select! {
        received = ctrl_c => received,
        received = terminate => received,
    }
}
