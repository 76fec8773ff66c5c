//! hotelops-migrate CLI - legacy-to-new schema data migration for hotel operations.

use clap::{Parser, Subcommand};
use hotelops_migrate::error::{EXIT_DATABASE_ERROR, EXIT_MIGRATION_ERROR};
use hotelops_migrate::orchestrator::plan_for;
use hotelops_migrate::{
    BackupManager, Config, MigrateError, MigrateOptions, MigrationReport, Orchestrator,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "hotelops-migrate")]
#[command(about = "Migrate hotel operations data from the legacy schema to the new schema")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for the in-flight table to roll back after SIGINT/SIGTERM
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot the destination, then migrate and verify every planned table
    Migrate {
        /// Read and transform every row without committing anything
        #[arg(long)]
        dry_run: bool,

        /// Only these tables (comma-separated) and the tables they depend on
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Restore a snapshot instead of migrating
        #[arg(long, conflicts_with_all = ["dry_run", "tables"])]
        rollback: bool,

        /// Snapshot to restore [default: latest]
        #[arg(long, requires = "rollback")]
        snapshot: Option<String>,
    },

    /// Print the resolved, dependency-ordered plan without touching a database
    Plan {
        /// Only these tables (comma-separated) and the tables they depend on
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },

    /// Compare source and destination row counts of every planned table
    Verify,

    /// List retained snapshots
    Snapshots,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = load_config(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Plan { tables } => {
            let specs = plan_for(&config, &tables)?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&specs)?);
            } else {
                println!("Migration plan ({} tables):", specs.len());
                for (i, spec) in specs.iter().enumerate() {
                    if spec.depends_on.is_empty() {
                        println!("  {}. {} <- {}", i + 1, spec.destination, spec.source);
                    } else {
                        println!(
                            "  {}. {} <- {} (after: {})",
                            i + 1,
                            spec.destination,
                            spec.source,
                            spec.depends_on.join(", ")
                        );
                    }
                }
            }
            Ok(0)
        }

        Commands::Snapshots => {
            let manager = BackupManager::new(&config.backup, config.migration.get_batch_size());
            let snapshots = manager.list()?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else if snapshots.is_empty() {
                println!("No snapshots in {}", manager.directory().display());
            } else {
                println!("Snapshots in {}:", manager.directory().display());
                for s in &snapshots {
                    println!(
                        "  {}  {}  {} tables, {} rows",
                        s.snapshot_id,
                        s.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        s.tables.len(),
                        s.total_rows()
                    );
                }
            }
            Ok(0)
        }

        Commands::Migrate {
            dry_run,
            tables,
            rollback,
            snapshot,
        } => {
            // Plan errors exit 2 before any connection is opened.
            if !rollback {
                plan_for(&config, &tables)?;
            }
            let cancel = setup_signal_handler(cli.shutdown_timeout)?;
            let orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;

            let work = async {
                if rollback {
                    orchestrator.rollback(snapshot.as_deref()).await
                } else {
                    orchestrator
                        .run(MigrateOptions { dry_run, tables }, cancel.clone())
                        .await
                }
            };
            let result = with_shutdown_timeout(work, &cancel, cli.shutdown_timeout).await;
            orchestrator.close().await;

            let report = result?;
            print_report(&report, cli.output_json)?;
            Ok(report.exit_code)
        }

        Commands::Verify => {
            plan_for(&config, &[])?;
            let orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;
            let result = orchestrator.verify_counts().await;
            orchestrator.close().await;
            let report = result?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Row count verification:");
                for t in &report.tables {
                    println!(
                        "  {} {:<24} source {:>10}  destination {:>10}",
                        if t.matches() { "OK " } else { "MISMATCH" },
                        t.table,
                        t.source_rows,
                        t.destination_rows
                    );
                }
                println!(
                    "\n  {} matched, {} mismatched",
                    report.tables_matched, report.tables_mismatched
                );
            }

            Ok(if report.all_match() {
                0
            } else {
                EXIT_MIGRATION_ERROR
            })
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;
            let result = orchestrator.health_check().await;
            orchestrator.close().await;
            let result = result?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source: {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Destination: {} ({}ms)",
                    if result.destination_connected { "OK" } else { "FAILED" },
                    result.destination_latency_ms
                );
                if let Some(ref err) = result.destination_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            Ok(if result.healthy { 0 } else { EXIT_DATABASE_ERROR })
        }
    }
}

/// Load the configuration; an unreadable file is a configuration error.
fn load_config(path: &Path) -> Result<Config, MigrateError> {
    Config::load(path).map_err(|e| match e {
        MigrateError::Io(io) => {
            MigrateError::Config(format!("cannot read {}: {}", path.display(), io))
        }
        other => other,
    })
}

fn print_report(report: &MigrationReport, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("\n{}", report.render_text());
    }
    Ok(())
}

/// Run `work` to completion unless it outlives the shutdown timeout after cancellation.
async fn with_shutdown_timeout<F, T>(
    work: F,
    cancel: &CancellationToken,
    timeout_secs: u64,
) -> Result<T, MigrateError>
where
    F: Future<Output = Result<T, MigrateError>>,
{
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(Duration::from_secs(timeout_secs), &mut work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Run did not stop within {}s of the shutdown signal", timeout_secs);
                    Err(MigrateError::Cancelled)
                }
            }
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("Invalid verbosity '{}'. Valid values: debug, info, warn, error", other)),
    };

    // Logs go to stderr so --output-json keeps stdout parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Invalid log format '{}'. Valid values: text, json", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (Kubernetes/Airflow shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let token = cancel_token.clone();

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Rolling back the table in flight (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only SIGINT/Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(_shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Rolling back the table in flight...");
                token.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    Ok(cancel_token)
}
